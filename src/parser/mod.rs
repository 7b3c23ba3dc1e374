//! Query expression compiler
//!
//! Turns a caller query (legacy `where`/`map`/`group`/`sort` options or a
//! stage pipeline) into a bounded, access-checked plan over index slots,
//! then runs it against a `DocumentStore`.
//!
//! ```ignore
//! let mut parser = Parser::new(models, ac, ParserOptions::default())?;
//! parser.parse(&query, None, None)?;
//! let page = parser.exec(&store, ExecOptions::default()).await?;
//! ```

pub mod access;
pub mod chain;
pub mod consts;
pub mod context;
pub mod cursor;
pub mod errors;
pub mod exec;
pub mod group;
pub mod hooks;
pub mod matcher;
pub mod operators;
pub mod options;
#[allow(clippy::module_inception)]
pub mod parser;
pub mod pipeline;
pub mod rules;
pub mod sort;
pub mod stage;
pub mod types;
pub mod variables;

pub use cursor::QueryCursor;
pub use errors::{QueryError, QueryErrorKind, QueryResult};
pub use exec::{ExecMode, ExecOptions, ExecOutput, Explain, ListResult, Reader, Totals, Window};
pub use hooks::{BeforeExec, ExecHook, ExecSummary, HookRegistry};
pub use operators::StageName;
pub use options::ParserOptions;
pub use parser::{Batch, LimitOption, Parser, QuerySpec};
pub use pipeline::{optimize, Pipeline, RawStage};
pub use stage::{Stage, StageOptions};
pub use variables::{VariableContext, VariableInfo};
