//! CLI argument definitions using clap
//!
//! Commands:
//! - docql compile --model <path>
//! - docql explain --model <path>
//! - docql run --model <path>
//!
//! The query is read from stdin as a single JSON object.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// docql - compile and run document queries against a model file
#[derive(Parser, Debug)]
#[command(name = "docql")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Minimum severity of log lines written to stderr
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compile a query and print its stages
    Compile {
        /// Path to the model file
        #[arg(long)]
        model: PathBuf,
    },

    /// Print the execution plan without running it
    Explain {
        /// Path to the model file
        #[arg(long)]
        model: PathBuf,
    },

    /// Run a query against the documents in the model file
    Run {
        /// Path to the model file
        #[arg(long)]
        model: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
