//! Query lifecycle events

use std::fmt;

use super::logger::{Logger, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A query compiled into a plan
    QueryParsed,
    /// A plan was handed to the store
    QueryExec,
    /// Execution exceeded the slow query threshold
    QuerySlow,
    /// The best-effort total count failed
    QueryTotalFailed,
    /// One batch entry failed
    QueryBatchFailed,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::QueryParsed => "QUERY_PARSED",
            Event::QueryExec => "QUERY_EXEC",
            Event::QuerySlow => "QUERY_SLOW",
            Event::QueryTotalFailed => "QUERY_TOTAL_FAILED",
            Event::QueryBatchFailed => "QUERY_BATCH_FAILED",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Event::QueryParsed | Event::QueryExec => Severity::Trace,
            Event::QuerySlow | Event::QueryTotalFailed | Event::QueryBatchFailed => Severity::Warn,
        }
    }

    /// Logs this event at its own severity
    pub fn emit(&self, fields: &[(&str, &str)]) {
        Logger::log(self.severity(), self.as_str(), fields);
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names_and_severities() {
        assert_eq!(Event::QuerySlow.to_string(), "QUERY_SLOW");
        assert_eq!(Event::QueryParsed.severity(), Severity::Trace);
        assert_eq!(Event::QueryTotalFailed.severity(), Severity::Warn);
    }
}
