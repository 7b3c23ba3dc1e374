//! Compilation state shared by the stage compilers
//!
//! One `CompileContext` lives for the duration of a parse. It carries the
//! candidate models, the caller's access context, the accumulated access
//! level and the variable registry.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::schema::{AccessContext, AccessLevel, Model, Property, ResolvedProperty};

use super::errors::QueryResult;
use super::options::ParserOptions;
use super::variables::Variables;

/// What the documents flowing through the pipeline look like at a point
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    /// Stored documents of the candidate models
    Documents,
    /// Output of a `$group` or a computed `$project`
    Derived {
        fields: Vec<String>,
        /// A null `_id` group collapses everything into one document
        single: bool,
    },
}

impl Shape {
    pub fn is_derived(&self) -> bool {
        matches!(self, Shape::Derived { .. })
    }

    /// True when `path` names a derived field, or a sub-path of one
    pub fn has_field(&self, path: &str) -> bool {
        match self {
            Shape::Documents => false,
            Shape::Derived { fields, .. } => {
                let head = path.split('.').next().unwrap_or(path);
                fields.iter().any(|f| f == path || f == head)
            }
        }
    }
}

#[derive(Debug)]
pub struct CompileContext {
    models: Vec<Arc<Model>>,
    ac: AccessContext,
    options: ParserOptions,
    access_level: AccessLevel,
    pub(crate) variables: Variables,
    treat_as_array: HashMap<String, bool>,
    shape: Shape,
}

impl CompileContext {
    pub fn new(models: Vec<Arc<Model>>, ac: AccessContext, options: ParserOptions) -> Self {
        let variables = Variables::new(options.with_variables);
        Self {
            models,
            ac,
            options,
            access_level: AccessLevel::None,
            variables,
            treat_as_array: HashMap::new(),
            shape: Shape::Documents,
        }
    }

    pub fn models(&self) -> &[Arc<Model>] {
        &self.models
    }

    pub fn ac(&self) -> &AccessContext {
        &self.ac
    }

    pub fn options(&self) -> &ParserOptions {
        &self.options
    }

    pub fn relax(&self) -> bool {
        self.options.relax_limits
    }

    /// Bound to apply, or `None` when limits are relaxed
    pub fn bound(&self, max: usize) -> Option<usize> {
        (!self.options.relax_limits).then_some(max)
    }

    pub fn access_level(&self) -> AccessLevel {
        self.access_level
    }

    /// Raises the level the query must run at. Never lowers it.
    pub fn bump_access_level(&mut self, level: AccessLevel) {
        self.access_level = self.access_level.max(level);
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn set_shape(&mut self, shape: Shape) {
        self.shape = shape;
    }

    /// Array-ness as seen at this point of the pipeline; an unwound array is
    /// treated as a scalar afterwards.
    pub fn is_array(&self, property: &ResolvedProperty) -> bool {
        self.is_array_property(property.property())
    }

    pub fn is_array_property(&self, property: &Property) -> bool {
        self.treat_as_array
            .get(property.full_path())
            .copied()
            .unwrap_or(property.array)
    }

    pub fn set_treat_as_array(&mut self, path: impl Into<String>, array: bool) {
        self.treat_as_array.insert(path.into(), array);
    }

    /// Paths that have been unwound
    pub fn unwound_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .treat_as_array
            .iter()
            .filter(|(_, array)| !**array)
            .map(|(path, _)| path.clone())
            .collect();
        paths.sort();
        paths
    }

    /// Resolves a path from the root of every candidate model, or relative to
    /// `parent` within the parent's own model.
    pub fn resolve(&self, path: &str, parent: Option<&ResolvedProperty>) -> Vec<ResolvedProperty> {
        let mut found: Vec<ResolvedProperty> = Vec::new();
        for model in &self.models {
            let resolved = match parent {
                Some(parent) => model.resolve_within(parent, path),
                None => model.resolve(path),
            };
            if let Some(resolved) = resolved {
                if !found.iter().any(|f| f.same_field(&resolved)) {
                    found.push(resolved);
                }
            }
        }
        found
    }

    /// Casts a caller value into the property's stored form
    pub fn cast(&self, property: &ResolvedProperty, value: &Value) -> QueryResult<Value> {
        Ok(property.property().cast_for_query(&self.ac, value)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{IndexSlot, Principal, PropertyType};

    fn context(models: Vec<Arc<Model>>) -> CompileContext {
        CompileContext::new(
            models,
            AccessContext::new(Principal::anonymous(), AccessLevel::Read),
            ParserOptions::default(),
        )
    }

    fn model(name: &str, slot: &str) -> Arc<Model> {
        Arc::new(
            Model::new(
                name,
                "contexts",
                vec![Property::new("c_items", PropertyType::String).indexed(7).array()],
                vec![IndexSlot::new(7, slot)],
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_access_level_only_rises() {
        let mut cx = context(vec![model("c_a", "s1")]);
        cx.bump_access_level(AccessLevel::Update);
        cx.bump_access_level(AccessLevel::Public);
        assert_eq!(cx.access_level(), AccessLevel::Update);
    }

    #[test]
    fn test_treat_as_array_override() {
        let mut cx = context(vec![model("c_a", "s1")]);
        let items = cx.resolve("c_items", None).remove(0);
        assert!(cx.is_array(&items));
        cx.set_treat_as_array("c_items", false);
        assert!(!cx.is_array(&items));
        assert_eq!(cx.unwound_paths(), vec!["c_items".to_string()]);
    }

    #[test]
    fn test_resolve_across_candidate_models() {
        let cx = context(vec![model("c_a", "s1"), model("c_b", "s2")]);
        let found = cx.resolve("c_items", None);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].slot(), Some("s1"));
        assert_eq!(found[1].slot(), Some("s2"));
    }

    #[test]
    fn test_derived_shape_fields() {
        let shape = Shape::Derived {
            fields: vec!["_id".into(), "count".into()],
            single: false,
        };
        assert!(shape.has_field("count"));
        assert!(shape.has_field("_id.c_name"));
        assert!(!shape.has_field("c_other"));
    }
}
