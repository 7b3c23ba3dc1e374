//! Resource limits and shared patterns

/// Concurrent batch executions
pub const BATCH_LIMIT: usize = 20;
pub const MAX_WHERE_DEPTH: usize = 5;
/// Group expression nesting depth
pub const MAX_GROUP_DEPTH: usize = 5;
pub const MAX_EXPRESSION_KEYS: usize = 10;
pub const MAX_GROUP_ACCUMULATORS: usize = 40;
pub const MAX_IN_ELEMENTS: usize = 100;
pub const MAX_ALL_ELEMENTS: usize = 100;
pub const MAX_LOGICAL_CONDITIONS: usize = 10;
pub const MAX_REGEXP_LENGTH: usize = 40;
pub const MAX_SKIP: u64 = 500_000;
pub const MAX_STAGES: usize = 30;

pub const DEFAULT_LIMIT: u64 = 100;
pub const MAX_LIMIT: u64 = 1000;
pub const SLOW_QUERY_THRESHOLD_MS: u64 = 2000;

/// Earth radius in kilometers, for `$centerSphere` radians
pub const EARTH_RADIUS_KM: f64 = 6378.1;

/// Top-level fields stripped from native pipeline output
pub const CULLED_FIELDS: &[&str] = &["meta", "org", "acl", "aclv", "idx"];

/// Prefix of index slot fields in stored documents
pub const INDEX_PREFIX: &str = "idx";

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Top-level output field names: `[a-zA-Z0-9-_]{1,40}`
pub fn is_field_name(s: &str) -> bool {
    (1..=40).contains(&s.len()) && s.chars().all(is_name_char)
}

/// Dotted field paths: `[a-zA-Z0-9-_.]{1,200}`
pub fn is_field_path(s: &str) -> bool {
    (1..=200).contains(&s.len()) && s.chars().all(|c| is_name_char(c) || c == '.')
}

/// Returns the variable name of a `{{name}}` placeholder
pub fn variable_name(s: &str) -> Option<&str> {
    let name = s.strip_prefix("{{")?.strip_suffix("}}")?;
    ((1..=100).contains(&name.len()) && name.chars().all(|c| is_name_char(c) || c == '.'))
        .then_some(name)
}
