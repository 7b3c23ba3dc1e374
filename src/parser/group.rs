//! Group compiler
//!
//! Compiles the `_id` and accumulators of a `$group`, and the typed
//! expression algebra shared with computed `$project` fields. Every
//! expression returns its built form together with an inferred type so the
//! enclosing operator can enforce its operand rules.

use serde_json::{json, Map, Value};

use crate::schema::{cast_date, is_object_id};

use super::access::PropertyChecks;
use super::chain::Chain;
use super::consts::{is_field_name, is_field_path, MAX_GROUP_ACCUMULATORS, MAX_GROUP_DEPTH};
use super::context::{CompileContext, Shape};
use super::errors::{QueryError, QueryResult};
use super::operators::{Accumulator, GroupOperator};
use super::rules::{as_integer, normalize_object};
use super::types::ExprType;

/// A compiled `$group` body
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledGroup {
    pub body: Map<String, Value>,
    /// Grouped by null: everything collapses into a single document
    pub null_id: bool,
    /// Output fields addressable by later stages
    pub fields: Vec<String>,
}

impl CompiledGroup {
    /// The projection that strips the null `_id` from the output
    pub fn null_id_projection(&self) -> Map<String, Value> {
        let mut projection = Map::new();
        for key in self.body.keys() {
            projection.insert(key.clone(), Value::Bool(key != "_id"));
        }
        projection
    }

    pub fn shape(&self) -> Shape {
        Shape::Derived {
            fields: self.fields.clone(),
            single: self.null_id,
        }
    }
}

/// A resolved field reference inside an expression
struct Reference {
    field: Value,
    scalar: ExprType,
    array: bool,
    /// False for derived fields, whose type is unknown
    known: bool,
}

impl Reference {
    fn expr_type(&self) -> ExprType {
        if self.array {
            ExprType::array_of(self.scalar.clone())
        } else {
            self.scalar.clone()
        }
    }
}

/// Accepts a bare field name as shorthand for grouping by that field
pub fn normalize_group(value: &Value) -> QueryResult<Map<String, Value>> {
    if let Value::String(s) = value {
        if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            let mut map = Map::new();
            map.insert("_id".to_string(), value.clone());
            return Ok(map);
        }
    }
    normalize_object(value, "group")
}

fn numeric(value: &Value) -> Option<Value> {
    match value {
        Value::Number(_) => Some(value.clone()),
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                return Some(Value::from(i));
            }
            trimmed
                .parse::<f64>()
                .ok()
                .filter(|f| f.is_finite())
                .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
        }
        _ => None,
    }
}

fn literal(value: Value) -> Value {
    json!({ "$literal": value })
}

fn if_null(value: Value, fallback: Value) -> Value {
    json!({ "$ifNull": [value, fallback] })
}

pub struct GroupCompiler<'a> {
    cx: &'a mut CompileContext,
    skip_acl: bool,
    paths: Vec<String>,
}

impl<'a> GroupCompiler<'a> {
    pub fn new(cx: &'a mut CompileContext, skip_acl: bool) -> Self {
        Self {
            cx,
            skip_acl,
            paths: Vec::new(),
        }
    }

    /// Property paths referenced so far
    pub fn into_paths(self) -> Vec<String> {
        self.paths
    }

    /// Authorizes a field kept as-is by a projection
    pub fn include(&mut self, path: &str) -> QueryResult<()> {
        self.reference(path, &Chain::new(), PropertyChecks::new()).map(|_| ())
    }

    /// A plain field reference, `"$path"`, as used by a projection rename
    pub fn field_reference(&mut self, path: &str, chain: &Chain) -> QueryResult<Value> {
        Ok(self.reference(path, chain, PropertyChecks::new())?.field)
    }

    pub fn compile_group(&mut self, value: &Value) -> QueryResult<CompiledGroup> {
        let group = normalize_group(value)?;

        if group.is_empty() {
            return Err(QueryError::invalid_argument(
                "Group component requires at least one expression",
            ));
        }
        if !self.cx.relax() && group.len() > MAX_GROUP_ACCUMULATORS {
            return Err(QueryError::invalid_argument(format!(
                "Maximum group elements ({}) exceeded",
                MAX_GROUP_ACCUMULATORS
            )));
        }
        for key in group.keys() {
            if !is_field_name(key) {
                return Err(QueryError::invalid_argument(
                    "Top-level group fields must be plain field names.",
                )
                .at(key.as_str()));
            }
        }

        let mut body = Map::new();
        let (id, id_fields) = self.group_id(group.get("_id").unwrap_or(&Value::Null))?;
        let null_id = id.is_null();
        body.insert("_id".to_string(), id);

        for (field, accumulator) in group.iter().filter(|(k, _)| *k != "_id") {
            let compiled = self.accumulator(field, accumulator)?;
            body.insert(field.clone(), compiled);
        }

        if null_id && body.len() == 1 {
            return Err(QueryError::invalid_argument(
                "Group component requires at least one expression when grouping by null.",
            ));
        }

        let mut fields: Vec<String> = Vec::new();
        if !null_id {
            fields.push("_id".to_string());
            fields.extend(id_fields.into_iter().map(|f| format!("_id.{}", f)));
        }
        fields.extend(body.keys().filter(|k| *k != "_id").cloned());

        Ok(CompiledGroup {
            body,
            null_id,
            fields,
        })
    }

    /// Compiles the group key. Returns the key and its named sub-fields, if
    /// any remain after a single-field key collapses to its value.
    pub fn group_id(&mut self, value: &Value) -> QueryResult<(Value, Vec<String>)> {
        let chain = Chain::new();
        let object = match value {
            Value::Null => return Ok((Value::Null, Vec::new())),
            Value::String(s) => {
                let mut map = Map::new();
                map.insert(s.clone(), value.clone());
                map
            }
            Value::Object(map) => map.clone(),
            _ => {
                return Err(QueryError::invalid_argument("Invalid group _id. Object expected.").at("_id"))
            }
        };

        if object.is_empty() {
            return Err(QueryError::invalid_argument(
                "Group _id must contain at least one field or expression.",
            )
            .at("_id"));
        }
        let operators = object.keys().filter(|k| k.starts_with('$')).count();
        if operators > 1 || (operators == 1 && object.len() > 1) {
            return Err(QueryError::invalid_argument(
                "Only one group _id expression is supported, and it must be the only key in the group object",
            )
            .at("_id"));
        }

        if operators == 1 {
            let (built, _) = self.expression(&Value::Object(object), &chain)?;
            return Ok((built, Vec::new()));
        }

        let mut id = Map::new();
        for (field, value) in &object {
            if !is_field_path(field) {
                return Err(QueryError::invalid_argument("Invalid group _id field name.").at(field.as_str()));
            }
            let built = match value {
                Value::String(path) => {
                    self.reference(path, &chain, PropertyChecks::new().no_array_parents())?
                        .field
                }
                Value::Object(map) if map.is_empty() => {
                    return Err(QueryError::invalid_argument(
                        "Group _id expression must contain at least one field or expression.",
                    )
                    .at(field.as_str()))
                }
                Value::Object(_) => self.expression(value, &chain)?.0,
                _ => {
                    return Err(QueryError::invalid_argument(
                        "Invalid group _id expression. Expected a string or an object",
                    )
                    .at(field.as_str()))
                }
            };
            id.insert(field.clone(), built);
        }

        if id.len() == 1 {
            let only = id.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null);
            return Ok((only, Vec::new()));
        }
        let names = id.keys().cloned().collect();
        Ok((Value::Object(id), names))
    }

    pub fn accumulator(&mut self, field: &str, value: &Value) -> QueryResult<Value> {
        let chain = Chain::new();
        let object = value.as_object().ok_or_else(|| {
            QueryError::invalid_argument("Object expected for group accumulator expression").at(field)
        })?;
        if object.len() != 1 {
            return Err(QueryError::invalid_argument(
                "Group accumulator expression requires a single supported accumulator property",
            )
            .at(field));
        }
        let Some((key, operand)) = object.iter().next() else {
            return Err(QueryError::invalid_argument("Invalid accumulator.").at(field));
        };
        let accumulator =
            Accumulator::parse(key).ok_or_else(|| QueryError::invalid_argument("Invalid accumulator.").at(key.as_str()))?;

        if let Value::String(path) = operand {
            return self.property_accumulator(accumulator, path, &chain);
        }

        let chain = chain.with_operator(accumulator);
        let (built, ty) = match accumulator {
            Accumulator::Count => {
                return Err(QueryError::invalid_argument("Group $count accumulator expects a property.")
                    .at(chain.to_string()))
            }
            _ => self.expression(operand, &chain)?,
        };

        match accumulator {
            Accumulator::Sum | Accumulator::Avg if !ty.satisfies(&ExprType::Number) => {
                Err(QueryError::invalid_argument(format!(
                    "{} expression result must resolve to a Number.",
                    accumulator
                ))
                .at(chain.to_string()))
            }
            Accumulator::PushAll => Ok(json!({ "$push": built })),
            _ => {
                let mut out = Map::new();
                out.insert(accumulator.as_str().to_string(), built);
                Ok(Value::Object(out))
            }
        }
    }

    fn property_accumulator(&mut self, accumulator: Accumulator, path: &str, chain: &Chain) -> QueryResult<Value> {
        let checks = match accumulator {
            Accumulator::Count | Accumulator::Sum | Accumulator::Avg => PropertyChecks::new().no_array_parents(),
            _ => PropertyChecks::new(),
        };
        let reference = self.reference(path, chain, checks)?;
        let field = reference.field.clone();

        match accumulator {
            Accumulator::Count => {
                let counted = if reference.array {
                    json!({ "$size": field })
                } else {
                    json!(1)
                };
                Ok(json!({ "$sum": { "$cond": [if_null(field, json!(false)), counted, 0] } }))
            }
            Accumulator::Sum | Accumulator::Avg => {
                if reference.known && reference.scalar != ExprType::Number {
                    return Err(QueryError::invalid_argument(format!(
                        "{} can only be applied to Number properties.",
                        accumulator
                    ))
                    .at(path));
                }
                if reference.array {
                    return Err(QueryError::invalid_argument(format!(
                        "{} cannot be applied to array properties.",
                        accumulator
                    ))
                    .at(path));
                }
                let mut out = Map::new();
                out.insert(accumulator.as_str().to_string(), field);
                Ok(Value::Object(out))
            }
            Accumulator::PushAll => Ok(json!({ "$push": if_null(field, Value::Null) })),
            _ => {
                let mut out = Map::new();
                out.insert(accumulator.as_str().to_string(), field);
                Ok(Value::Object(out))
            }
        }
    }

    /// Compiles one `{operator: operand}` node
    pub fn expression(&mut self, value: &Value, chain: &Chain) -> QueryResult<(Value, ExprType)> {
        if !self.cx.relax() && chain.len() > MAX_GROUP_DEPTH {
            return Err(QueryError::invalid_argument(format!(
                "Maximum group expression depth ({}) exceeded",
                MAX_GROUP_DEPTH
            ))
            .at(chain.to_string()));
        }
        let object = value.as_object().ok_or_else(|| {
            QueryError::invalid_argument("Object expected for group expression").at(chain.to_string())
        })?;
        let mut entries = object.iter();
        let (key, operand) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            _ => {
                return Err(QueryError::invalid_argument(
                    "Group expression requires a single supported operator property",
                )
                .at(chain.to_string()))
            }
        };
        let operator = GroupOperator::parse(key).ok_or_else(|| {
            QueryError::invalid_argument(format!(
                "Invalid or unsupported group expression operator {}",
                key
            ))
            .at(chain.to_string())
        })?;

        let inner = chain.with_operator(operator);
        let fail = |reason: String| QueryError::invalid_argument(reason).at(chain.to_string());

        match operator {
            GroupOperator::String => {
                let built = self.typed_literal(operand, "String", |v| v.as_str().map(|_| v.clone()))
                    .ok_or_else(|| fail("$string expects a string value.".into()))??;
                Ok((built, ExprType::String))
            }
            GroupOperator::Number => {
                let built = self
                    .typed_literal(operand, "Number", numeric)
                    .ok_or_else(|| fail("$number expects a number value.".into()))??;
                Ok((built, ExprType::Number))
            }
            GroupOperator::Integer => {
                let built = self
                    .typed_literal(operand, "Number", |v| {
                        as_integer(v)
                            .or_else(|| v.as_str().and_then(|s| s.trim().parse::<i64>().ok()))
                            .map(Value::from)
                    })
                    .ok_or_else(|| fail("$integer expects an integer value.".into()))??;
                Ok((built, ExprType::Number))
            }
            GroupOperator::Boolean => {
                let built = self
                    .typed_literal(operand, "Boolean", |v| v.as_bool().map(Value::Bool))
                    .ok_or_else(|| fail("$boolean expects a boolean value.".into()))??;
                Ok((built, ExprType::Boolean))
            }
            GroupOperator::Date => {
                let built = self
                    .typed_literal(operand, "Date", cast_date)
                    .ok_or_else(|| fail("$date expects a date value.".into()))??;
                Ok((built, ExprType::Date))
            }
            GroupOperator::ObjectId => {
                let built = self
                    .typed_literal(operand, "ObjectId", |v| {
                        v.as_str()
                            .filter(|s| is_object_id(s))
                            .map(|s| Value::String(s.to_ascii_lowercase()))
                    })
                    .ok_or_else(|| fail("$objectId expects an ObjectId value.".into()))??;
                Ok((built, ExprType::ObjectId))
            }
            GroupOperator::Array => {
                let built = self
                    .typed_literal(operand, "Any[]", |v| v.as_array().map(|_| v.clone()))
                    .ok_or_else(|| fail("$array expects an array value.".into()))??;
                Ok((built, ExprType::array_of(ExprType::Any)))
            }

            GroupOperator::And | GroupOperator::Or | GroupOperator::Not => {
                let wrapped;
                let items = if operator == GroupOperator::Not {
                    wrapped = vec![operand.clone()];
                    &wrapped
                } else {
                    operand
                        .as_array()
                        .ok_or_else(|| fail(format!("{} requires an array.", operator)))?
                };
                let mut built = Vec::with_capacity(items.len());
                for item in items {
                    built.push(self.operand(item, chain, &inner, operator, PropertyChecks::new())?.0);
                }
                Ok((wrap(operator, Value::Array(built)), ExprType::Boolean))
            }

            GroupOperator::SetEquals
            | GroupOperator::SetIntersection
            | GroupOperator::SetUnion
            | GroupOperator::SetDifference
            | GroupOperator::SetIsSubset
            | GroupOperator::AnyElementTrue
            | GroupOperator::AllElementsTrue => {
                let wrapped;
                let items = if matches!(operator, GroupOperator::AnyElementTrue | GroupOperator::AllElementsTrue) {
                    wrapped = vec![operand.clone()];
                    &wrapped
                } else {
                    operand
                        .as_array()
                        .ok_or_else(|| fail(format!("{} requires an array.", operator)))?
                };
                if operator == GroupOperator::SetEquals && items.len() < 2 {
                    return Err(fail(format!("{} must contain at least 2 elements.", operator)));
                }
                if matches!(operator, GroupOperator::SetDifference | GroupOperator::SetIsSubset) && items.len() != 2 {
                    return Err(fail(format!("{} must contain exactly 2 elements.", operator)));
                }

                let mut built = Vec::with_capacity(items.len());
                for item in items {
                    let checks = PropertyChecks::new().require_array().no_array_parents();
                    let (value, ty) = self.operand(item, chain, &inner, operator, checks)?;
                    if !item.is_string() && !ty.is_array() && ty != ExprType::Any {
                        return Err(fail(format!(
                            "{} expression result must resolve to an array.",
                            operator
                        )));
                    }
                    built.push(if_null(value, json!([])));
                }

                let result = match operator {
                    GroupOperator::SetEquals
                    | GroupOperator::SetIsSubset
                    | GroupOperator::AnyElementTrue
                    | GroupOperator::AllElementsTrue => ExprType::Boolean,
                    _ => ExprType::array_of(ExprType::Any),
                };
                Ok((wrap(operator, Value::Array(built)), result))
            }

            GroupOperator::Cmp
            | GroupOperator::Eq
            | GroupOperator::Gt
            | GroupOperator::Gte
            | GroupOperator::Lt
            | GroupOperator::Lte
            | GroupOperator::Ne => {
                let items = operand
                    .as_array()
                    .filter(|items| items.len() == 2)
                    .ok_or_else(|| fail(format!("{} requires an array with exactly 2 elements.", operator)))?;
                let mut built = Vec::with_capacity(2);
                for item in items {
                    built.push(self.operand(item, chain, &inner, operator, PropertyChecks::new())?.0);
                }
                let result = if operator == GroupOperator::Cmp {
                    ExprType::Number
                } else {
                    ExprType::Boolean
                };
                Ok((wrap(operator, Value::Array(built)), result))
            }

            GroupOperator::Add
            | GroupOperator::Multiply
            | GroupOperator::Subtract
            | GroupOperator::Divide
            | GroupOperator::Mod => self.arithmetic(operator, operand, chain, &inner),

            GroupOperator::Concat => {
                let items = operand
                    .as_array()
                    .ok_or_else(|| fail(format!("{} requires an array.", operator)))?;
                let mut built = Vec::with_capacity(items.len());
                for item in items {
                    let value = self.typed_operand(item, chain, &inner, operator, &ExprType::String)?;
                    built.push(if_null(value, json!("")));
                }
                Ok((wrap(operator, Value::Array(built)), ExprType::String))
            }

            GroupOperator::Substr => {
                let items = operand
                    .as_array()
                    .filter(|items| items.len() == 3)
                    .ok_or_else(|| fail(format!("{} requires an array with 3 elements.", operator)))?;
                let expected = [ExprType::String, ExprType::Number, ExprType::Number];
                let mut built = Vec::with_capacity(3);
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        if let Some(n) = as_integer(item) {
                            built.push(Value::from(n));
                            continue;
                        }
                    }
                    let fallback = if i == 0 { json!("") } else { json!(0) };
                    let value = self.typed_operand(item, chain, &inner, operator, &expected[i])?;
                    built.push(if_null(value, fallback));
                }
                Ok((wrap(operator, Value::Array(built)), ExprType::String))
            }

            GroupOperator::ToLower | GroupOperator::ToUpper => {
                let value = self.typed_operand(operand, chain, &inner, operator, &ExprType::String)?;
                Ok((wrap(operator, value), ExprType::String))
            }

            GroupOperator::Strcasecmp => {
                let items = operand
                    .as_array()
                    .filter(|items| items.len() == 2)
                    .ok_or_else(|| fail(format!("{} requires an array with 2 elements.", operator)))?;
                let mut built = Vec::with_capacity(2);
                for item in items {
                    built.push(self.typed_operand(item, chain, &inner, operator, &ExprType::String)?);
                }
                Ok((wrap(operator, Value::Array(built)), ExprType::Number))
            }

            GroupOperator::Size => {
                let value = match operand {
                    Value::String(path) => {
                        let checks = PropertyChecks::new().skip_children().no_array_parents().require_array();
                        self.reference(path, chain, checks)?.field
                    }
                    Value::Object(_) => {
                        let (value, ty) = self.expression(operand, &inner)?;
                        if !ty.is_array() && ty != ExprType::Any {
                            return Err(fail("$size expression result must resolve to an array.".into()));
                        }
                        value
                    }
                    _ => return Err(fail("$size expects a property name or object".into())),
                };
                Ok((json!({ "$size": if_null(value, json!([])) }), ExprType::Number))
            }

            GroupOperator::DateToString => Err(QueryError::unsupported(format!(
                "{} is not yet implemented.",
                operator
            ))
            .at(chain.to_string())),

            op if op.is_date_part() => self.date_part(op, operand, chain, &inner),

            GroupOperator::Cond | GroupOperator::IfNull => {
                let arity = if operator == GroupOperator::Cond { 3 } else { 2 };
                let items = operand
                    .as_array()
                    .filter(|items| items.len() == arity)
                    .ok_or_else(|| {
                        fail(format!(
                            "{} requires an array with exactly {} elements.",
                            operator, arity
                        ))
                    })?;
                let mut built = Vec::with_capacity(arity);
                let mut types = Vec::with_capacity(arity);
                for item in items {
                    let (value, ty) = self.operand(item, chain, &inner, operator, PropertyChecks::new())?;
                    built.push(value);
                    types.push(ty);
                }
                let (a, b) = (&types[arity - 2], &types[arity - 1]);
                if a != b && *a != ExprType::Any && *b != ExprType::Any {
                    return Err(fail(format!("{} return types must match.", operator)));
                }
                let result = if *a == ExprType::Any { b.clone() } else { a.clone() };
                Ok((wrap(operator, Value::Array(built)), result))
            }

            // date parts are handled by the guarded arm above
            _ => Err(fail(format!(
                "Invalid or unsupported group expression operator {}",
                operator
            ))),
        }
    }

    fn arithmetic(
        &mut self,
        operator: GroupOperator,
        operand: &Value,
        chain: &Chain,
        inner: &Chain,
    ) -> QueryResult<(Value, ExprType)> {
        let fail = |reason: String| QueryError::invalid_argument(reason).at(chain.to_string());
        let variadic = matches!(operator, GroupOperator::Add | GroupOperator::Multiply);
        let can_have_date = matches!(operator, GroupOperator::Add | GroupOperator::Subtract);

        let items = operand
            .as_array()
            .filter(|items| if variadic { items.len() >= 2 } else { items.len() == 2 })
            .ok_or_else(|| {
                fail(format!(
                    "{} requires an array with {} elements.",
                    operator,
                    if variadic { "at least 2" } else { "2" }
                ))
            })?;

        let mut built = Vec::with_capacity(items.len());
        let mut types = Vec::with_capacity(items.len());
        for item in items {
            let (value, ty) = if let Some(n) = numeric(item) {
                (n, ExprType::Number)
            } else if let Some(date) = item.as_str().and_then(|s| cast_date(&Value::String(s.to_string()))) {
                if !can_have_date {
                    return Err(fail(format!("{} requires a Number.", operator)));
                }
                (date, ExprType::Date)
            } else if let Value::String(path) = item {
                let checks = PropertyChecks::new().skip_children().no_array_parents();
                let reference = self.reference(path, chain, checks)?;
                if reference.array {
                    return Err(fail(format!("{} field cannot be an array", operator)));
                }
                (reference.field, reference.scalar)
            } else {
                self.expression(item, inner)?
            };

            let acceptable = ty == ExprType::Any || ty == ExprType::Number || (can_have_date && ty == ExprType::Date);
            if !acceptable {
                return Err(fail(format!(
                    "{} requires a {}.",
                    operator,
                    if can_have_date { "Number or Date" } else { "Number" }
                )));
            }
            built.push(value);
            types.push(ty);
        }

        let dates = types.iter().filter(|t| **t == ExprType::Date).count();
        if operator == GroupOperator::Add && dates > 1 {
            return Err(fail(
                "$add only supports a single Date. All other expression values must be numbers.".into(),
            ));
        }
        let result = if operator == GroupOperator::Subtract {
            if types[0] == ExprType::Number && types[1] == ExprType::Date {
                return Err(fail(
                    "$subtract only supports subtracting a Date from a Date, a Number from a Date, or a Number from a Number."
                        .into(),
                ));
            }
            if dates == 1 {
                ExprType::Date
            } else {
                ExprType::Number
            }
        } else if dates > 0 {
            ExprType::Date
        } else {
            ExprType::Number
        };

        Ok((wrap(operator, Value::Array(built)), result))
    }

    fn date_part(
        &mut self,
        operator: GroupOperator,
        operand: &Value,
        chain: &Chain,
        inner: &Chain,
    ) -> QueryResult<(Value, ExprType)> {
        let guarded = |value: Value| {
            let extracted = wrap(operator, value.clone());
            json!({ "$cond": [if_null(value, json!(false)), extracted, null] })
        };

        let built = match operand {
            Value::String(s) => match cast_date(operand) {
                Some(date) => wrap(operator, date),
                None => {
                    let checks = PropertyChecks::new().skip_children().no_array_parents();
                    let reference = self.reference(s, chain, checks)?;
                    if reference.known && (reference.array || reference.scalar != ExprType::Date) {
                        return Err(QueryError::invalid_argument(format!(
                            "{} expression result must resolve to a Date.",
                            operator
                        ))
                        .at(s.as_str()));
                    }
                    guarded(reference.field)
                }
            },
            _ => {
                let (value, ty) = self.expression(operand, inner)?;
                if !ty.satisfies(&ExprType::Date) {
                    return Err(QueryError::invalid_argument(format!(
                        "{} expression result must resolve to a Date.",
                        operator
                    ))
                    .at(inner.to_string()));
                }
                let extracted = wrap(operator, value);
                json!({ "$cond": [if_null(extracted.clone(), json!(false)), extracted, null] })
            }
        };
        Ok((built, ExprType::Number))
    }

    /// A property name or a nested expression
    fn operand(
        &mut self,
        item: &Value,
        chain: &Chain,
        inner: &Chain,
        operator: GroupOperator,
        checks: PropertyChecks,
    ) -> QueryResult<(Value, ExprType)> {
        match item {
            Value::String(path) => {
                let reference = self.reference(path, chain, checks)?;
                let ty = reference.expr_type();
                Ok((reference.field, ty))
            }
            Value::Object(_) => self.expression(item, inner),
            _ => Err(QueryError::invalid_argument(format!(
                "{} expects a property name or object",
                operator
            ))
            .at(chain.to_string())),
        }
    }

    /// A non-array operand of the expected type
    fn typed_operand(
        &mut self,
        item: &Value,
        chain: &Chain,
        inner: &Chain,
        operator: GroupOperator,
        expected: &ExprType,
    ) -> QueryResult<Value> {
        match item {
            Value::String(path) => {
                let checks = PropertyChecks::new().skip_children().no_array_parents();
                let reference = self.reference(path, chain, checks)?;
                if reference.known && (reference.array || reference.scalar != *expected) {
                    return Err(QueryError::invalid_argument(format!(
                        "{} property must be a {}.",
                        operator, expected
                    ))
                    .at(chain.to_string()));
                }
                Ok(reference.field)
            }
            Value::Object(_) => {
                let (value, ty) = self.expression(item, inner)?;
                if !ty.satisfies(expected) {
                    return Err(QueryError::invalid_argument(format!(
                        "{} expression result must resolve to a {}.",
                        operator, expected
                    ))
                    .at(chain.to_string()));
                }
                Ok(value)
            }
            _ => Err(QueryError::invalid_argument(format!(
                "{} expects a property name or object",
                operator
            ))
            .at(chain.to_string())),
        }
    }

    /// Literal coercions. `None` means the operand is not convertible; a
    /// placeholder is kept as-is.
    fn typed_literal(
        &mut self,
        operand: &Value,
        type_name: &str,
        convert: impl Fn(&Value) -> Option<Value>,
    ) -> Option<QueryResult<Value>> {
        match self.cx.variables.check(operand, type_name) {
            Err(e) => Some(Err(e)),
            Ok(true) => Some(Ok(literal(operand.clone()))),
            Ok(false) => convert(operand).map(|v| Ok(literal(v))),
        }
    }

    fn reference(&mut self, path: &str, chain: &Chain, checks: PropertyChecks) -> QueryResult<Reference> {
        if self.cx.shape().is_derived() {
            if !self.cx.shape().has_field(path) {
                return Err(QueryError::invalid_argument(format!(
                    "Field is not available at this point of the pipeline ({}).",
                    path
                ))
                .at(chain.to_string()));
            }
            return Ok(Reference {
                field: Value::String(format!("${}", path)),
                scalar: ExprType::Any,
                array: false,
                known: false,
            });
        }

        let candidates = self
            .cx
            .process_property(path, chain, checks.trusted(self.skip_acl).skip_index_check())?;
        let property = self.cx.single_property(&candidates)?;

        let field = match property.property().modifier() {
            Some(modifier) => modifier.group_path(self.cx.ac(), property.full_path()),
            None => property.full_path().to_string(),
        };
        if !self.paths.contains(&field) {
            self.paths.push(field.clone());
        }

        let array = self.cx.is_array(&property);
        Ok(Reference {
            field: Value::String(format!("${}", field)),
            scalar: ExprType::from_property(property.type_name(), false),
            array,
            known: true,
        })
    }
}

fn wrap(operator: GroupOperator, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(operator.as_str().to_string(), value);
    Value::Object(map)
}
