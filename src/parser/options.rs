//! Parser configuration

use serde::{Deserialize, Serialize};

use super::consts::{DEFAULT_LIMIT, MAX_LIMIT, SLOW_QUERY_THRESHOLD_MS};

/// Options fixed when a parser is constructed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ParserOptions {
    /// Compute a total count alongside results
    pub total: bool,

    /// Lift structural limits for trusted callers
    pub relax_limits: bool,

    /// Permit `limit: false`
    pub allow_no_limit: bool,

    pub default_limit: u64,
    pub max_limit: u64,

    /// Accept filters and sorts on unindexed properties
    pub skip_index_checks: bool,

    /// Reject matching on virtual or reader-backed properties
    pub strict: bool,

    /// Like `skip_index_checks`, for internal callers that scan deliberately
    pub unindexed: bool,

    /// Accept `{{name}}` placeholders in place of literal values
    pub with_variables: bool,

    /// Allow System-only properties to take part in a query
    #[serde(alias = "allowSystemAccessToParserProperties")]
    pub allow_system_access: bool,

    pub slow_query_threshold_ms: u64,

    /// Implicit `_id` sort direction (0 disables the implicit sort)
    pub default_sort: i64,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            total: false,
            relax_limits: false,
            allow_no_limit: false,
            default_limit: DEFAULT_LIMIT,
            max_limit: MAX_LIMIT,
            skip_index_checks: false,
            strict: true,
            unindexed: false,
            with_variables: false,
            allow_system_access: false,
            slow_query_threshold_ms: SLOW_QUERY_THRESHOLD_MS,
            default_sort: -1,
        }
    }
}

impl ParserOptions {
    pub fn relaxed(mut self) -> Self {
        self.relax_limits = true;
        self
    }

    pub fn with_variables(mut self) -> Self {
        self.with_variables = true;
        self
    }

    pub fn with_total(mut self) -> Self {
        self.total = true;
        self
    }

    pub fn skipping_index_checks(mut self) -> Self {
        self.skip_index_checks = true;
        self
    }

    pub fn with_limits(mut self, default_limit: u64, max_limit: u64) -> Self {
        self.default_limit = default_limit;
        self.max_limit = max_limit;
        self
    }

    /// Index checks are bypassed by either flag
    pub fn ignores_indexes(&self) -> bool {
        self.skip_index_checks || self.unindexed
    }
}
