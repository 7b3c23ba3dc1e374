//! docql - query expression compiler for a multi-tenant document store
//!
//! - `schema`: models, properties and access levels the compiler reads
//! - `parser`: compilation and execution of caller queries
//! - `store`: document store adapter and an in-memory reference store
//! - `observability`: structured query lifecycle logging
//! - `cli`: the `docql` command

pub mod cli;
pub mod observability;
pub mod parser;
pub mod schema;
pub mod store;
