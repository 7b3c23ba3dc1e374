//! CLI module for docql
//!
//! Provides command-line interface for:
//! - compile: print the compiled stages of a query
//! - explain: print the execution plan
//! - run: execute against the documents of a model file

mod args;
mod commands;
mod errors;
mod io;

pub use args::{Cli, Command};
pub use commands::{compile, explain, load_model_file, run, run_command, run_query, BatchRequest, ModelFile, Request, Session};
pub use errors::{CliError, CliErrorCode, CliResult};
pub use io::{parse_request, read_request, write_error, write_response};
