//! Observability
//!
//! Structured JSON logging of query lifecycle events. Observability is
//! read-only: nothing logged here changes the outcome of a query.
//!
//! ```ignore
//! use docql::observability::{Event, Logger, Severity};
//!
//! Logger::set_min_severity(Severity::Warn);
//! Event::QuerySlow.emit(&[("elapsed_ms", "2400"), ("mode", "aggregate")]);
//! ```

mod events;
mod logger;
mod timer;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use timer::Timer;
