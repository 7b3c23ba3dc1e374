//! Variable mode
//!
//! With variables enabled, a literal of the form `{{name}}` stands in for a
//! value supplied later. The compiler records the type each placeholder is
//! expected to carry, per query section, and refuses conflicting uses.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use super::consts::variable_name;
use super::errors::{QueryError, QueryResult};

/// Query sections that collect variables separately
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableContext {
    Where,
    Map,
    Group,
    Sort,
    Pipeline,
}

impl VariableContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariableContext::Where => "where",
            VariableContext::Map => "map",
            VariableContext::Group => "group",
            VariableContext::Sort => "sort",
            VariableContext::Pipeline => "pipeline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "where" => Some(VariableContext::Where),
            "map" => Some(VariableContext::Map),
            "group" => Some(VariableContext::Group),
            "sort" => Some(VariableContext::Sort),
            "pipeline" => Some(VariableContext::Pipeline),
            _ => None,
        }
    }
}

impl fmt::Display for VariableContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A placeholder and the type it must carry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct Variables {
    enabled: bool,
    current: Option<VariableContext>,
    entries: Vec<(VariableContext, VariableInfo)>,
}

impl Variables {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Sets the section subsequent checks are recorded under
    pub fn enter(&mut self, context: VariableContext) {
        self.current = Some(context);
    }

    pub fn leave(&mut self) {
        self.current = None;
    }

    /// Returns true when `value` is a placeholder, recording it with the
    /// expected type. Outside of a section, or with variables disabled,
    /// nothing is a placeholder.
    pub fn check(&mut self, value: &Value, type_name: &str) -> QueryResult<bool> {
        let (Some(context), true) = (self.current, self.enabled) else {
            return Ok(false);
        };
        let Some(name) = value.as_str().and_then(variable_name) else {
            return Ok(false);
        };

        let existing = self
            .entries
            .iter()
            .find(|(ctx, info)| *ctx == context && info.name == name);

        match existing {
            Some((_, info)) if info.type_name != type_name => Err(QueryError::invalid_argument(format!(
                "Variable \"{}\" exists in multiple locations with different expected primitive types.",
                name
            ))
            .at(name)),
            Some(_) => Ok(true),
            None => {
                self.entries.push((
                    context,
                    VariableInfo {
                        name: name.to_string(),
                        type_name: type_name.to_string(),
                    },
                ));
                Ok(true)
            }
        }
    }

    /// Placeholders recorded for a section, in order of first use
    pub fn get(&self, context: VariableContext) -> Vec<VariableInfo> {
        self.entries
            .iter()
            .filter(|(ctx, _)| *ctx == context)
            .map(|(_, info)| info.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_disabled_never_matches() {
        let mut vars = Variables::new(false);
        vars.enter(VariableContext::Where);
        assert!(!vars.check(&json!("{{age}}"), "Number").unwrap());
    }

    #[test]
    fn test_records_per_context() {
        let mut vars = Variables::new(true);
        vars.enter(VariableContext::Where);
        assert!(vars.check(&json!("{{age}}"), "Number").unwrap());
        assert!(vars.check(&json!("{{age}}"), "Number").unwrap());
        assert!(!vars.check(&json!("age"), "Number").unwrap());
        vars.enter(VariableContext::Sort);
        assert!(vars.check(&json!("{{dir}}"), "Number").unwrap());

        let where_vars = vars.get(VariableContext::Where);
        assert_eq!(where_vars.len(), 1);
        assert_eq!(where_vars[0].name, "age");
        assert_eq!(vars.get(VariableContext::Sort).len(), 1);
        assert!(vars.get(VariableContext::Group).is_empty());
    }

    #[test]
    fn test_conflicting_types_fail() {
        let mut vars = Variables::new(true);
        vars.enter(VariableContext::Where);
        vars.check(&json!("{{v}}"), "String").unwrap();
        let err = vars.check(&json!("{{v}}"), "String[]").unwrap_err();
        assert_eq!(err.path(), Some("v"));
    }
}
