//! Match compiler
//!
//! Turns a `where` expression (or the body of a `$match` stage) into a
//! store predicate. For each leaf on a slot-indexed property it also emits
//! an index lookup against `idx.<slot>`, collected per scope and appended to
//! the scope's `$and`. The root and every `$and`/`$or` branch open a new
//! scope; nested field objects, `$elemMatch` and `$all` share their
//! enclosing one.

use std::collections::HashSet;

use serde_json::{Map, Value};

use crate::schema::{PropertyType, ResolvedProperty};

use super::access::PropertyChecks;
use super::chain::{Chain, Frame};
use super::consts::{
    EARTH_RADIUS_KM, INDEX_PREFIX, MAX_ALL_ELEMENTS, MAX_EXPRESSION_KEYS, MAX_IN_ELEMENTS, MAX_WHERE_DEPTH,
};
use super::context::CompileContext;
use super::errors::{QueryError, QueryResult};
use super::operators::{ChainOperator, MatchOperator};
use super::rules::{as_integer, bounded_array, is_primitive, logical_branches, normalize_object, validate_regex};

/// Names accepted by `$type`
pub const TYPE_NAMES: &[&str] = &[
    "double", "int", "long", "decimal", "string", "object", "array", "objectId", "bool", "date", "null",
];

/// Operators that may sit between a comparison and its property
const COMPARISON_UPSTREAM: [ChainOperator; 3] = [
    ChainOperator::Match(MatchOperator::All),
    ChainOperator::Match(MatchOperator::ElemMatch),
    ChainOperator::Match(MatchOperator::Not),
];

#[derive(Debug, Clone, Copy, Default)]
pub struct MatchOptions {
    /// Trusted stages (`preMatch`) bypass ACL evaluation
    pub skip_acl: bool,
    /// Do not emit index lookups
    pub skip_lookup: bool,
    pub skip_index_check: bool,
}

/// A compiled predicate and the property paths it touches
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledMatch {
    pub expression: Map<String, Value>,
    pub paths: Vec<String>,
}

pub struct MatchCompiler<'a> {
    cx: &'a mut CompileContext,
    options: MatchOptions,
    paths: Vec<String>,
    /// Paths whose candidates disagree on the physical slot
    ambiguous: HashSet<String>,
}

impl<'a> MatchCompiler<'a> {
    pub fn new(cx: &'a mut CompileContext, options: MatchOptions) -> Self {
        Self {
            cx,
            options,
            paths: Vec::new(),
            ambiguous: HashSet::new(),
        }
    }

    pub fn compile(mut self, value: &Value) -> QueryResult<CompiledMatch> {
        let object = normalize_object(value, "where")?;
        let chain = Chain::new();
        let expression = if self.cx.shape().is_derived() {
            self.derived_expression(&object, &chain)?
        } else {
            self.scope(&object, &chain)?
        };
        Ok(CompiledMatch {
            expression,
            paths: self.paths,
        })
    }

    /// Compiles an expression that owns its own lookups
    fn scope(&mut self, object: &Map<String, Value>, chain: &Chain) -> QueryResult<Map<String, Value>> {
        let mut lookups = Vec::new();
        let mut out = self.expression(object, chain, &mut lookups)?;
        if !lookups.is_empty() {
            match out.get_mut("$and") {
                Some(Value::Array(and)) => and.extend(lookups),
                _ => {
                    out.insert("$and".to_string(), Value::Array(lookups));
                }
            }
        }
        Ok(out)
    }

    fn expression(
        &mut self,
        object: &Map<String, Value>,
        chain: &Chain,
        lookups: &mut Vec<Value>,
    ) -> QueryResult<Map<String, Value>> {
        self.check_shape(object, chain)?;

        let mut out = Map::new();
        for (key, value) in object {
            if key.starts_with('$') {
                self.operator(key, value, object, chain, lookups, &mut out)?;
            } else {
                self.field(key, value, chain, lookups, &mut out)?;
            }
        }
        Ok(out)
    }

    fn check_shape(&self, object: &Map<String, Value>, chain: &Chain) -> QueryResult<()> {
        if !self.cx.relax() && chain.len() > MAX_WHERE_DEPTH {
            return Err(QueryError::invalid_argument(format!(
                "Maximum query depth ({}) exceeded",
                MAX_WHERE_DEPTH
            ))
            .at(chain.to_string()));
        }
        if object.is_empty() {
            return Err(QueryError::invalid_argument(
                "Where component requires at least one field or operator",
            )
            .at(chain.to_string()));
        }
        if !self.cx.relax() && object.len() > MAX_EXPRESSION_KEYS {
            return Err(QueryError::invalid_argument(format!(
                "Maximum query elements ({}) exceeded",
                MAX_EXPRESSION_KEYS
            ))
            .at(chain.to_string()));
        }
        Ok(())
    }

    fn field(
        &mut self,
        field: &str,
        value: &Value,
        chain: &Chain,
        lookups: &mut Vec<Value>,
        out: &mut Map<String, Value>,
    ) -> QueryResult<()> {
        if matches!(chain.last(), Some(Frame::Property(_))) {
            return Err(QueryError::unsupported(
                "Embedded property matching is unsupported. Use dot syntax.",
            )
            .at(chain.to_string()));
        }

        let checks = PropertyChecks {
            skip_acl: self.options.skip_acl,
            skip_index_check: self.options.skip_index_check,
            ..PropertyChecks::default()
        };
        let candidates = self.cx.process_property(field, chain, checks)?;
        let current = self.cx.assert_properties_match(&candidates)?;
        if candidates.iter().any(|c| c.slot() != current.slot()) {
            self.ambiguous.insert(current.full_path().to_string());
        }
        self.record(current.full_path());

        // relative to the enclosing property, in as many segments as given
        let segments = field.split('.').count();
        let full: Vec<&str> = current.full_path().split('.').collect();
        let relative = full[full.len().saturating_sub(segments)..].join(".");
        let key = match current.property().modifier() {
            Some(modifier) => modifier.match_path(self.cx.ac(), &relative),
            None => relative,
        };

        match value {
            Value::Array(_) => Err(QueryError::exact_matching().at(chain.to_string())),
            Value::Object(map) => {
                let inner_chain = chain.concat(Frame::Property(current))?;
                let inner = self.expression(map, &inner_chain, lookups)?;
                out.insert(key, Value::Object(inner));
                Ok(())
            }
            _ => {
                if matches!(
                    current.type_name(),
                    PropertyType::Document | PropertyType::Set | PropertyType::Geometry
                ) {
                    return Err(QueryError::unsupported(
                        "Matching primitive values against this type is unsupported.",
                    )
                    .at(chain.to_string()));
                }
                if self.cx.variables.check(value, current.type_name().as_str())? {
                    out.insert(key, value.clone());
                    return Ok(());
                }
                let casted = self.cx.cast(&current, value)?;
                out.insert(key, casted.clone());
                self.add_lookup(chain, &current, casted, false, lookups)
            }
        }
    }

    fn operator(
        &mut self,
        key: &str,
        value: &Value,
        container: &Map<String, Value>,
        chain: &Chain,
        lookups: &mut Vec<Value>,
        out: &mut Map<String, Value>,
    ) -> QueryResult<()> {
        let operator = MatchOperator::parse(key).ok_or_else(|| {
            QueryError::invalid_argument(format!("Invalid query operator {}", key)).at(chain.to_string())
        })?;

        match operator {
            MatchOperator::Eq
            | MatchOperator::Ne
            | MatchOperator::Gt
            | MatchOperator::Gte
            | MatchOperator::Lt
            | MatchOperator::Lte => {
                let property = self.comparison_property(operator, chain)?;
                if !is_primitive(value) {
                    return Err(QueryError::invalid_argument(format!(
                        "Operator {} expects a primitive value for property.",
                        operator
                    ))
                    .at(chain.to_string()));
                }
                if self.cx.variables.check(value, property.type_name().as_str())? {
                    out.insert(key.to_string(), value.clone());
                    return Ok(());
                }
                let casted = self.cx.cast(&property, value)?;
                out.insert(key.to_string(), casted.clone());
                self.add_lookup(chain, &property, single(key, casted), operator.is_negative(), lookups)
            }

            MatchOperator::In | MatchOperator::Nin => {
                let property = self.comparison_property(operator, chain)?;
                let list_type = format!("{}[]", property.type_name());
                if self.cx.variables.check(value, &list_type)? {
                    out.insert(key.to_string(), value.clone());
                    return Ok(());
                }
                let items = bounded_array(value, key, self.cx.bound(MAX_IN_ELEMENTS), chain)?;
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.in_element(operator, &property, item, chain)?);
                }
                let values = Value::Array(values);
                out.insert(key.to_string(), values.clone());
                self.add_lookup(chain, &property, single(key, values), operator.is_negative(), lookups)
            }

            MatchOperator::Exists => {
                let property = self.comparison_property(operator, chain)?;
                if self.cx.variables.check(value, "Boolean")? {
                    out.insert(key.to_string(), value.clone());
                    return Ok(());
                }
                let exists = value.as_bool().ok_or_else(|| {
                    QueryError::invalid_argument("Operator $exists expects a boolean").at(chain.to_string())
                })?;
                out.insert(key.to_string(), Value::Bool(exists));
                self.add_lookup(chain, &property, single(key, Value::Bool(exists)), !exists, lookups)
            }

            MatchOperator::Type => {
                let property = self.comparison_property(operator, chain)?;
                if self.cx.variables.check(value, "String")? {
                    out.insert(key.to_string(), value.clone());
                    return Ok(());
                }
                match value.as_str() {
                    Some(name) if TYPE_NAMES.contains(&name) => {
                        out.insert(key.to_string(), value.clone());
                        self.add_lookup(chain, &property, single(key, value.clone()), false, lookups)
                    }
                    _ => Err(QueryError::invalid_argument(format!(
                        "Operator $type expects one of {}",
                        TYPE_NAMES.join(", ")
                    ))
                    .at(chain.to_string())),
                }
            }

            MatchOperator::Regex => {
                let property = self.comparison_property(operator, chain)?;
                if property.type_name() != PropertyType::String {
                    return Err(QueryError::invalid_argument("Operator $regex expects a String property.")
                        .at(chain.to_string()));
                }
                if self.cx.variables.check(value, "String")? {
                    out.insert(key.to_string(), value.clone());
                    return Ok(());
                }
                let regex = validate_regex(value, self.cx.relax(), chain)?;
                if let Value::Object(parts) = &regex {
                    for (k, v) in parts {
                        out.insert(k.clone(), v.clone());
                    }
                }
                self.add_lookup(chain, &property, regex, false, lookups)
            }

            MatchOperator::Not => self.not(value, chain, lookups, out),

            MatchOperator::And | MatchOperator::Or => {
                let nested_ok = chain.last().map_or(true, |frame| {
                    matches!(
                        frame.as_operator(),
                        Some(ChainOperator::Match(MatchOperator::And | MatchOperator::Or))
                    )
                });
                if !nested_ok {
                    return Err(QueryError::invalid_argument(format!(
                        "Operator {} can only be nested within $and/$or.",
                        operator
                    ))
                    .at(chain.to_string()));
                }
                let branches = logical_branches(value, key, self.cx.relax(), chain)?;
                let inner_chain = chain.with_operator(operator);
                let mut built = Vec::with_capacity(branches.len());
                for branch in branches {
                    built.push(Value::Object(self.scope(branch, &inner_chain)?));
                }
                out.insert(key.to_string(), Value::Array(built));
                Ok(())
            }

            MatchOperator::All | MatchOperator::Size | MatchOperator::ElemMatch => {
                self.array_operator(operator, value, container, chain, lookups, out)
            }

            MatchOperator::Within | MatchOperator::Intersects | MatchOperator::Near | MatchOperator::NearSphere => {
                self.geometry(operator, value, chain, lookups, out)
            }
        }
    }

    fn comparison_property(&self, operator: MatchOperator, chain: &Chain) -> QueryResult<ResolvedProperty> {
        chain.last_property(&COMPARISON_UPSTREAM).cloned().ok_or_else(|| {
            QueryError::invalid_argument(format!(
                "Operator {} must be applied to a property or within an [$all].$elemMatch expression.",
                operator
            ))
            .at(chain.to_string())
        })
    }

    fn in_element(
        &mut self,
        operator: MatchOperator,
        property: &ResolvedProperty,
        item: &Value,
        chain: &Chain,
    ) -> QueryResult<Value> {
        if property.type_name() == PropertyType::String {
            if let Some(pattern) = item.as_object().filter(|m| m.len() == 1).and_then(|m| m.get("$regex")) {
                return validate_regex(pattern, self.cx.relax(), chain);
            }
        }
        if !is_primitive(item) {
            return Err(QueryError::invalid_argument(format!(
                "Operator {} expects a primitive value for property.",
                operator
            ))
            .at(chain.to_string()));
        }
        if self.cx.variables.check(item, property.type_name().as_str())? {
            return Ok(item.clone());
        }
        self.cx.cast(property, item)
    }

    fn not(
        &mut self,
        value: &Value,
        chain: &Chain,
        lookups: &mut Vec<Value>,
        out: &mut Map<String, Value>,
    ) -> QueryResult<()> {
        let property = match chain.last() {
            Some(Frame::Property(p)) => p.clone(),
            _ => {
                return Err(QueryError::invalid_argument("Operator $not must be directly applied to a property.")
                    .at(chain.to_string()))
            }
        };

        let inner = match value {
            Value::Object(map) => {
                if map.keys().any(|k| !k.starts_with('$')) {
                    return Err(QueryError::invalid_argument(
                        "Operator $not expects an operator expression or a regular expression.",
                    )
                    .at(chain.to_string()));
                }
                // the negated lookup replaces whatever the inner operators emit
                let mut discarded = Vec::new();
                Value::Object(self.expression(map, &chain.with_operator(MatchOperator::Not), &mut discarded)?)
            }
            Value::String(_) => {
                if property.type_name() != PropertyType::String {
                    return Err(QueryError::invalid_argument("Operator $regex expects a String property.")
                        .at(chain.to_string()));
                }
                validate_regex(value, self.cx.relax(), chain)?
            }
            _ => {
                return Err(QueryError::invalid_argument(
                    "Operator $not expects an operator expression or a regular expression.",
                )
                .at(chain.to_string()))
            }
        };

        out.insert("$not".to_string(), inner.clone());
        self.add_lookup(chain, &property, single("$not", inner), true, lookups)
    }

    fn array_operator(
        &mut self,
        operator: MatchOperator,
        value: &Value,
        container: &Map<String, Value>,
        chain: &Chain,
        lookups: &mut Vec<Value>,
        out: &mut Map<String, Value>,
    ) -> QueryResult<()> {
        let property = chain.last_property(&[]).cloned().ok_or_else(|| {
            QueryError::invalid_argument(format!("Operator {} must be applied to a property.", operator))
                .at(chain.to_string())
        })?;
        if !self.cx.is_array(&property) {
            return Err(QueryError::invalid_argument(format!(
                "Operator {} can only be used to match inside of array properties.",
                operator
            ))
            .at(chain.to_string()));
        }
        let direct = matches!(chain.last(), Some(Frame::Property(_)));

        match operator {
            MatchOperator::Size => {
                if !direct {
                    return Err(QueryError::invalid_argument("Operator $size must be directly applied to a property.")
                        .at(chain.to_string()));
                }
                if property.property().unique {
                    return Err(QueryError::invalid_argument(
                        "Operator $size is not available for unique properties.",
                    )
                    .at(chain.to_string()));
                }
                if self.cx.variables.check(value, "Number")? {
                    out.insert("$size".to_string(), value.clone());
                    return Ok(());
                }
                let size = as_integer(value).filter(|n| *n >= 0).ok_or_else(|| {
                    QueryError::invalid_argument("Operator $size expects an integer value >= 0.")
                        .at(chain.to_string())
                })?;
                out.insert("$size".to_string(), Value::from(size));
                // sizes are not indexed; require presence and let the predicate narrow
                self.add_lookup(chain, &property, single("$exists", Value::Bool(true)), false, lookups)
            }

            MatchOperator::All => {
                if !direct {
                    return Err(QueryError::invalid_argument("Operator $all must be directly applied to a property.")
                        .at(chain.to_string()));
                }
                let list_type = format!("{}[]", property.type_name());
                if self.cx.variables.check(value, &list_type)? {
                    out.insert("$all".to_string(), value.clone());
                    return Ok(());
                }
                let items = bounded_array(value, "$all", self.cx.bound(MAX_ALL_ELEMENTS), chain)?;
                let inner_chain = chain.with_operator(MatchOperator::All);

                if property.type_name().is_container() {
                    let mut built = Vec::with_capacity(items.len());
                    for item in items {
                        let element = item
                            .as_object()
                            .filter(|m| m.len() == 1 && m.get("$elemMatch").map_or(false, Value::is_object))
                            .ok_or_else(|| {
                                QueryError::invalid_argument(
                                    "Operator $all for Document expects $elemMatch values for property.",
                                )
                                .at(chain.to_string())
                            })?;
                        built.push(Value::Object(self.expression(element, &inner_chain, lookups)?));
                    }
                    out.insert("$all".to_string(), Value::Array(built));
                    return Ok(());
                }

                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    if !is_primitive(item) {
                        return Err(QueryError::invalid_argument(
                            "Operator $all expects a primitive value for property.",
                        )
                        .at(chain.to_string()));
                    }
                    if self.cx.variables.check(item, property.type_name().as_str())? {
                        values.push(item.clone());
                    } else {
                        values.push(self.cx.cast(&property, item)?);
                    }
                }
                let values = Value::Array(values);
                out.insert("$all".to_string(), values.clone());
                self.add_lookup(chain, &property, single("$all", values), false, lookups)
            }

            MatchOperator::ElemMatch => {
                let under_all = matches!(chain.parent_of_last(), Some(Frame::Property(_)))
                    && chain.last().and_then(Frame::as_operator) == Some(ChainOperator::Match(MatchOperator::All));
                if !(direct || under_all) {
                    return Err(QueryError::invalid_argument(
                        "Operator $elemMatch must be applied to a property or an $all.",
                    )
                    .at(chain.to_string()));
                }
                if container.len() > 1 {
                    let others: Vec<&str> = container
                        .keys()
                        .map(String::as_str)
                        .filter(|k| *k != "$elemMatch")
                        .collect();
                    return Err(QueryError::unsupported(format!(
                        "$elemMatch cannot be combined with any other operators ({})",
                        others.join(",")
                    ))
                    .at(chain.to_string()));
                }
                let map = value.as_object().ok_or_else(|| {
                    QueryError::invalid_argument("Operator $elemMatch expects an object.").at(chain.to_string())
                })?;
                let inner = self.expression(map, &chain.with_operator(MatchOperator::ElemMatch), lookups)?;
                out.insert("$elemMatch".to_string(), Value::Object(inner));
                Ok(())
            }

            _ => Err(QueryError::invalid_argument(format!("Invalid query operator ({})", operator))
                .at(chain.to_string())),
        }
    }

    fn geometry(
        &mut self,
        operator: MatchOperator,
        value: &Value,
        chain: &Chain,
        lookups: &mut Vec<Value>,
        out: &mut Map<String, Value>,
    ) -> QueryResult<()> {
        let fail = |reason: String| QueryError::invalid_argument(reason).at(chain.to_string());

        let property = match chain.last() {
            Some(Frame::Property(p)) => p.clone(),
            _ => return Err(fail(format!("Operator {} must be directly applied to a property.", operator))),
        };
        if property.type_name() != PropertyType::Geometry {
            return Err(fail(format!(
                "Operator {} can only be used to match geometry properties.",
                operator
            )));
        }
        let object = value
            .as_object()
            .ok_or_else(|| fail(format!("Operator {} expects an object", operator)))?;

        if operator != MatchOperator::Within {
            return Err(fail(format!("Invalid query operator ({})", operator)));
        }

        let center = object
            .get("$center")
            .filter(|c| is_lng_lat(c))
            .ok_or_else(|| {
                fail(format!(
                    "Operator {}.$center must be an array of 2 elements with valid lng and lat values",
                    operator
                ))
            })?;
        let radius = object
            .get("$radius")
            .and_then(Value::as_f64)
            .filter(|r| *r >= 0.0)
            .ok_or_else(|| fail(format!("Operator {}.$radius must be a value in kilometers >= 0", operator)))?;

        let mut sphere = Map::new();
        sphere.insert(
            "$centerSphere".to_string(),
            Value::Array(vec![center.clone(), Value::from(radius / EARTH_RADIUS_KM)]),
        );
        let geo = Value::Object(sphere);
        out.insert("$geoWithin".to_string(), geo.clone());
        self.add_lookup(chain, &property, single("$geoWithin", geo), false, lookups)
    }

    fn add_lookup(
        &mut self,
        chain: &Chain,
        property: &ResolvedProperty,
        expression: Value,
        negative: bool,
        lookups: &mut Vec<Value>,
    ) -> QueryResult<()> {
        if self.options.skip_lookup {
            return Ok(());
        }
        let p = property.property();
        let ignores_indexes = self.cx.options().ignores_indexes();

        if !p.indexed && !p.native_index && !ignores_indexes {
            return Err(QueryError::invalid_argument(format!(
                "Property is not indexed ({}).",
                property.full_path()
            ))
            .at(chain.to_string()));
        }
        if p.native_index {
            return Ok(());
        }
        // a flattened slot cannot answer a negative test about a single element
        if negative && chain.contains_operator(MatchOperator::ElemMatch) {
            return Ok(());
        }
        if self.ambiguous.contains(property.full_path()) {
            return Ok(());
        }

        let unusable = || {
            QueryError::invalid_argument(format!(
                "Property cannot be used for search ({}).",
                property.full_path()
            ))
            .at(chain.to_string())
        };
        if p.id.is_none() {
            return if ignores_indexes { Ok(()) } else { Err(unusable()) };
        }
        let slot = property.slot().ok_or_else(unusable)?;

        let mut key = format!("{}.{}", INDEX_PREFIX, slot);
        if p.unique || property.type_name() == PropertyType::Geometry {
            key.push_str(".v");
        }
        let lookup = single(&key, expression);
        if !lookups.contains(&lookup) {
            lookups.push(lookup);
        }
        Ok(())
    }

    /// Predicates on derived documents: plain comparisons of output fields,
    /// with no access checks and no lookups.
    fn derived_expression(&mut self, object: &Map<String, Value>, chain: &Chain) -> QueryResult<Map<String, Value>> {
        self.check_shape(object, chain)?;

        let mut out = Map::new();
        for (key, value) in object {
            if key == "$and" || key == "$or" {
                let branches = logical_branches(value, key, self.cx.relax(), chain)?;
                let inner_chain = chain.with_operator(MatchOperator::parse(key).unwrap_or(MatchOperator::And));
                let mut built = Vec::with_capacity(branches.len());
                for branch in branches {
                    built.push(Value::Object(self.derived_expression(branch, &inner_chain)?));
                }
                out.insert(key.clone(), Value::Array(built));
                continue;
            }
            if key.starts_with('$') {
                return Err(QueryError::invalid_argument(format!("Invalid query operator {}", key))
                    .at(chain.to_string()));
            }
            if !self.cx.shape().has_field(key) {
                return Err(QueryError::invalid_argument(format!(
                    "Field is not available at this point of the pipeline ({}).",
                    key
                ))
                .at(chain.to_string()));
            }
            let built = match value {
                Value::Array(_) => return Err(QueryError::exact_matching().at(key.as_str())),
                Value::Object(ops) => Value::Object(self.derived_operators(key, ops)?),
                _ => value.clone(),
            };
            out.insert(key.clone(), built);
        }
        Ok(out)
    }

    fn derived_operators(&mut self, field: &str, ops: &Map<String, Value>) -> QueryResult<Map<String, Value>> {
        let mut out = Map::new();
        for (key, value) in ops {
            let operator = MatchOperator::parse(key)
                .ok_or_else(|| QueryError::invalid_argument(format!("Invalid query operator {}", key)).at(field))?;
            match operator {
                op if op.is_comparison() => {
                    if !is_primitive(value) {
                        return Err(QueryError::invalid_argument(format!(
                            "Operator {} expects a primitive value for property.",
                            op
                        ))
                        .at(field));
                    }
                    out.insert(key.clone(), value.clone());
                }
                MatchOperator::In | MatchOperator::Nin => {
                    let items = bounded_array(value, key, self.cx.bound(MAX_IN_ELEMENTS), &Chain::new())
                        .map_err(|e| e.at(field))?;
                    if !items.iter().all(is_primitive) {
                        return Err(QueryError::invalid_argument(format!(
                            "Operator {} expects a primitive value for property.",
                            operator
                        ))
                        .at(field));
                    }
                    out.insert(key.clone(), value.clone());
                }
                MatchOperator::Exists => {
                    let exists = value
                        .as_bool()
                        .ok_or_else(|| QueryError::invalid_argument("Operator $exists expects a boolean").at(field))?;
                    out.insert(key.clone(), Value::Bool(exists));
                }
                MatchOperator::Regex => {
                    if let Value::Object(parts) = validate_regex(value, self.cx.relax(), &Chain::new())? {
                        out.extend(parts);
                    }
                }
                other => {
                    return Err(QueryError::unsupported(format!(
                        "Operator {} is not supported on derived fields.",
                        other
                    ))
                    .at(field))
                }
            }
        }
        Ok(out)
    }

    fn record(&mut self, path: &str) {
        if !self.paths.iter().any(|p| p == path) {
            self.paths.push(path.to_string());
        }
    }
}

fn single(key: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Value::Object(map)
}

fn is_lng_lat(value: &Value) -> bool {
    match value.as_array().map(Vec::as_slice) {
        Some([lng, lat]) => matches!(
            (lng.as_f64(), lat.as_f64()),
            (Some(lng), Some(lat)) if (-180.0..=180.0).contains(&lng) && (-90.0..=90.0).contains(&lat)
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::parser::errors::QueryErrorKind;
    use crate::parser::options::ParserOptions;
    use crate::schema::{AccessContext, AccessLevel, IndexSlot, Model, Principal, Property};

    fn model() -> Model {
        Model::new(
            "c_post",
            "contexts",
            vec![
                Property::new("c_title", PropertyType::String).indexed(1),
                Property::new("c_tags", PropertyType::String).indexed(2).array(),
                Property::new("c_rank", PropertyType::Number).indexed(3).unique(),
                Property::new("c_where", PropertyType::Geometry).indexed(4),
                Property::new("c_comments", PropertyType::Document)
                    .array()
                    .with_properties(vec![
                        Property::new("c_body", PropertyType::String).indexed(5),
                        Property::new("c_votes", PropertyType::Number).indexed(6),
                    ]),
                Property::new("c_loose", PropertyType::String),
                Property::new("c_created", PropertyType::Date).native(),
            ],
            (1..=6).map(|i| IndexSlot::new(i, format!("s{}", i))).collect(),
        )
        .unwrap()
    }

    fn context(options: ParserOptions) -> CompileContext {
        CompileContext::new(
            vec![Arc::new(model())],
            AccessContext::new(Principal::anonymous(), AccessLevel::Read),
            options,
        )
    }

    fn compile(value: Value) -> QueryResult<Value> {
        let mut cx = context(ParserOptions::default());
        MatchCompiler::new(&mut cx, MatchOptions::default())
            .compile(&value)
            .map(|m| Value::Object(m.expression))
    }

    #[test]
    fn test_equality_emits_lookup() {
        assert_eq!(
            compile(json!({"c_title": "hello"})).unwrap(),
            json!({"c_title": "hello", "$and": [{"idx.s1": "hello"}]})
        );
    }

    #[test]
    fn test_unique_slot_uses_value_key() {
        assert_eq!(
            compile(json!({"c_rank": {"$gt": "4"}})).unwrap(),
            json!({"c_rank": {"$gt": 4}, "$and": [{"idx.s3.v": {"$gt": 4}}]})
        );
    }

    #[test]
    fn test_native_properties_skip_lookup() {
        assert_eq!(
            compile(json!({"c_created": {"$lt": "2024-01-01T00:00:00Z"}})).unwrap(),
            json!({"c_created": {"$lt": "2024-01-01T00:00:00.000Z"}})
        );
    }

    #[test]
    fn test_lookups_append_to_user_and() {
        let compiled = compile(json!({
            "$and": [{"c_title": "a"}],
            "c_tags": "x"
        }))
        .unwrap();
        assert_eq!(
            compiled,
            json!({
                "$and": [{"c_title": "a", "$and": [{"idx.s1": "a"}]}, {"idx.s2": "x"}],
                "c_tags": "x"
            })
        );
    }

    #[test]
    fn test_duplicate_lookups_suppressed() {
        let compiled = compile(json!({
            "c_comments": {"$elemMatch": {"c_body": "a", "c_votes": {"$gte": 1}}},
            "c_comments.c_body": "a"
        }))
        .unwrap();
        assert_eq!(
            compiled.get("$and"),
            Some(&json!([{"idx.s5": "a"}, {"idx.s6": {"$gte": 1}}]))
        );
    }

    #[test]
    fn test_negative_operators_inside_elem_match_skip_lookup() {
        let compiled = compile(json!({"c_comments": {"$elemMatch": {"c_body": {"$ne": "spam"}}}})).unwrap();
        assert_eq!(
            compiled,
            json!({"c_comments": {"$elemMatch": {"c_body": {"$ne": "spam"}}}})
        );
    }

    #[test]
    fn test_not_emits_a_single_negated_lookup() {
        assert_eq!(
            compile(json!({"c_title": {"$not": {"$in": ["a", "b"]}}})).unwrap(),
            json!({
                "c_title": {"$not": {"$in": ["a", "b"]}},
                "$and": [{"idx.s1": {"$not": {"$in": ["a", "b"]}}}]
            })
        );
    }

    #[test]
    fn test_exact_array_matching_is_unsupported() {
        let err = compile(json!({"c_tags": ["a", "b"]})).unwrap_err();
        assert_eq!(err.kind(), QueryErrorKind::UnsupportedOperation);
        assert_eq!(err.reason(), Some("exactMatching"));
    }

    #[test]
    fn test_embedded_property_rejected() {
        let err = compile(json!({"c_comments": {"c_body": "a"}})).unwrap_err();
        assert!(err.message().contains("dot syntax"));
    }

    #[test]
    fn test_in_bounds_are_relaxable() {
        let values: Vec<Value> = (0..101).map(|i| json!(format!("v{}", i))).collect();
        let err = compile(json!({"c_title": {"$in": values.clone()}})).unwrap_err();
        assert_eq!(err.kind(), QueryErrorKind::InvalidArgument);

        let mut cx = context(ParserOptions::default().relaxed());
        assert!(MatchCompiler::new(&mut cx, MatchOptions::default())
            .compile(&json!({"c_title": {"$in": values}}))
            .is_ok());
    }

    #[test]
    fn test_in_accepts_regex_elements() {
        assert_eq!(
            compile(json!({"c_title": {"$in": [{"$regex": "/^a/i"}, "b"]}})).unwrap(),
            json!({
                "c_title": {"$in": [{"$regex": "^a", "$options": "i"}, "b"]},
                "$and": [{"idx.s1": {"$in": [{"$regex": "^a", "$options": "i"}, "b"]}}]
            })
        );
    }

    #[test]
    fn test_elem_match_cannot_be_combined() {
        let err = compile(json!({"c_tags": {"$elemMatch": {"$gt": "a"}, "$size": 2}})).unwrap_err();
        assert_eq!(err.kind(), QueryErrorKind::UnsupportedOperation);
    }

    #[test]
    fn test_logical_operators_only_nest_in_logical() {
        assert!(compile(json!({"c_title": {"$or": [{"$gt": "a"}]}})).is_err());
        assert!(compile(json!({"$or": [{"$and": [{"c_title": "a"}]}]})).is_ok());
    }

    #[test]
    fn test_depth_bound() {
        let mut nested = json!({"c_title": "a"});
        for _ in 0..6 {
            nested = json!({"$and": [nested]});
        }
        assert!(compile(nested).is_err());
    }

    #[test]
    fn test_unindexed_property() {
        let err = compile(json!({"c_loose": "a"})).unwrap_err();
        assert_eq!(err.message(), "Property is not indexed.");

        let mut cx = context(ParserOptions::default().skipping_index_checks());
        let compiled = MatchCompiler::new(&mut cx, MatchOptions::default())
            .compile(&json!({"c_loose": "a"}))
            .unwrap();
        assert_eq!(Value::Object(compiled.expression), json!({"c_loose": "a"}));
    }

    #[test]
    fn test_within_compiles_to_center_sphere() {
        let compiled = compile(json!({"c_where": {"$within": {"$center": [-79.4, 43.6], "$radius": 6378.1}}})).unwrap();
        assert_eq!(
            compiled.get("c_where"),
            Some(&json!({"$geoWithin": {"$centerSphere": [[-79.4, 43.6], 1.0]}}))
        );
        assert!(compile(json!({"c_where": {"$near": {"$center": [0, 0]}}})).is_err());
        assert!(compile(json!({"c_where": {"$within": {"$center": [200, 0], "$radius": 1}}})).is_err());
    }

    #[test]
    fn test_size_requires_array_and_integer() {
        assert!(compile(json!({"c_title": {"$size": 1}})).is_err());
        assert!(compile(json!({"c_tags": {"$size": -1}})).is_err());
        assert_eq!(
            compile(json!({"c_tags": {"$size": 2}})).unwrap(),
            json!({"c_tags": {"$size": 2}, "$and": [{"idx.s2": {"$exists": true}}]})
        );
    }

    #[test]
    fn test_paths_recorded() {
        let mut cx = context(ParserOptions::default());
        let compiled = MatchCompiler::new(&mut cx, MatchOptions::default())
            .compile(&json!({"c_title": "a", "c_comments.c_body": "b"}))
            .unwrap();
        assert_eq!(compiled.paths, vec!["c_title", "c_comments.c_body"]);
    }

    #[test]
    fn test_variables_are_recorded_not_cast() {
        let mut cx = context(ParserOptions::default().with_variables());
        cx.variables.enter(crate::parser::variables::VariableContext::Where);
        let compiled = MatchCompiler::new(&mut cx, MatchOptions::default())
            .compile(&json!({"c_rank": {"$gte": "{{min}}"}}))
            .unwrap();
        assert_eq!(Value::Object(compiled.expression), json!({"c_rank": {"$gte": "{{min}}"}}));
        let vars = cx.variables.get(crate::parser::variables::VariableContext::Where);
        assert_eq!(vars[0].type_name, "Number");
    }
}
