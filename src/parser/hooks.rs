//! Lifecycle hooks around execution
//!
//! Hooks are registered by name on a parser. The `exec` hook is fired on
//! every execution: `before` may inject raw match constraints ahead of the
//! compiled stages, `after` observes a summary of the result and `fail`
//! observes the error.

use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::errors::{QueryError, QueryResult};

/// Names hooks may be registered under
pub const HOOK_NAMES: &[&str] = &["exec"];

/// State handed to `before` hooks for one execution
#[derive(Debug, Default)]
pub struct BeforeExec {
    matches: Vec<Map<String, Value>>,
}

impl BeforeExec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a trusted constraint, applied before any compiled stage. Empty
    /// objects are ignored.
    pub fn add_raw_match(&mut self, filter: Map<String, Value>) {
        if !filter.is_empty() {
            self.matches.push(filter);
        }
    }

    pub fn matches(&self) -> &[Map<String, Value>] {
        &self.matches
    }

    pub fn into_matches(self) -> Vec<Map<String, Value>> {
        self.matches
    }
}

/// What `after` hooks see of a completed execution
#[derive(Debug, Clone, PartialEq)]
pub struct ExecSummary {
    /// `query` or `aggregate`
    pub mode: &'static str,
    pub count: usize,
    pub has_more: bool,
    pub total: Option<u64>,
    pub elapsed_ms: u64,
}

pub trait ExecHook: Send + Sync {
    fn before(&self, _exec: &mut BeforeExec) -> QueryResult<()> {
        Ok(())
    }

    fn after(&self, _summary: &ExecSummary) {}

    fn fail(&self, _error: &QueryError) {}
}

#[derive(Clone, Default)]
pub struct HookRegistry {
    hooks: Vec<(String, Arc<dyn ExecHook>)>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.hooks.iter().map(|(name, _)| name)).finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, hook: Arc<dyn ExecHook>) -> QueryResult<()> {
        if !HOOK_NAMES.contains(&name) {
            return Err(QueryError::invalid_argument(format!("Unknown parser hook \"{}\".", name)));
        }
        self.hooks.push((name.to_string(), hook));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    fn named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Arc<dyn ExecHook>> + 'a {
        self.hooks.iter().filter(move |(n, _)| n == name).map(|(_, hook)| hook)
    }

    /// Runs every `before` hook in registration order; the first error wins
    pub fn fire_before(&self, name: &str, exec: &mut BeforeExec) -> QueryResult<()> {
        for hook in self.named(name) {
            hook.before(exec)?;
        }
        Ok(())
    }

    pub fn fire_after(&self, name: &str, summary: &ExecSummary) {
        for hook in self.named(name) {
            hook.after(summary);
        }
    }

    pub fn fire_fail(&self, name: &str, error: &QueryError) {
        for hook in self.named(name) {
            hook.fail(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl ExecHook for Recorder {
        fn before(&self, exec: &mut BeforeExec) -> QueryResult<()> {
            self.seen.lock().unwrap().push("before".into());
            exec.add_raw_match(json!({"c_state": "active"}).as_object().cloned().unwrap());
            exec.add_raw_match(Map::new());
            Ok(())
        }

        fn after(&self, summary: &ExecSummary) {
            self.seen.lock().unwrap().push(format!("after:{}", summary.count));
        }
    }

    #[test]
    fn test_before_hooks_add_matches() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let mut registry = HookRegistry::new();
        registry.register("exec", recorder.clone()).unwrap();

        let mut exec = BeforeExec::new();
        registry.fire_before("exec", &mut exec).unwrap();
        assert_eq!(exec.matches().len(), 1);

        registry.fire_after(
            "exec",
            &ExecSummary {
                mode: "query",
                count: 3,
                has_more: false,
                total: None,
                elapsed_ms: 1,
            },
        );
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["before", "after:3"]);
    }

    #[test]
    fn test_unknown_hook_name() {
        let mut registry = HookRegistry::new();
        let hook = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        assert!(registry.register("parse", hook).is_err());
        assert!(registry.is_empty());
    }
}
