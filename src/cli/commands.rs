//! CLI command implementations
//!
//! Every command loads a model file, reads one query from stdin and prints
//! one JSON response. `run` executes against an in-memory store seeded with
//! the file's documents.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::observability::{Logger, Severity};
use crate::parser::{ExecOptions, Parser, ParserOptions, QuerySpec, VariableContext};
use crate::schema::{AccessContext, AccessLevel, Model, ModelDefinition, Principal};
use crate::store::memory::MemoryStore;

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::{read_request, write_error, write_response};

/// Model file structure
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelFile {
    /// Models sharing one collection
    pub models: Vec<ModelDefinition>,

    #[serde(default)]
    pub options: ParserOptions,

    /// Caller identity and grant (default: anonymous with read access)
    #[serde(default)]
    pub access: Option<AccessContext>,

    /// Seed documents for `run`; `object` names the model of each
    #[serde(default)]
    pub documents: Vec<Value>,
}

/// Load a model file
pub fn load_model_file(path: &Path) -> CliResult<ModelFile> {
    let content = fs::read_to_string(path)
        .map_err(|e| CliError::model_error(format!("Failed to read model file: {}", e)))?;
    let file: ModelFile = serde_json::from_str(&content)
        .map_err(|e| CliError::model_error(format!("Invalid model file JSON: {}", e)))?;
    if file.models.is_empty() {
        return Err(CliError::model_error("Model file declares no models"));
    }
    Ok(file)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BatchRequest {
    pub field: String,
    pub values: Vec<Value>,
}

/// A query plus its execution extras, as read from stdin
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Request {
    #[serde(flatten)]
    pub query: QuerySpec,
    pub projection: Option<Map<String, Value>>,
    pub base_filter: Option<Map<String, Value>>,
    pub batch: Option<BatchRequest>,
    pub max_time_ms: Option<u64>,
}

impl Request {
    pub fn from_value(value: Value) -> CliResult<Self> {
        Ok(serde_json::from_value(value)?)
    }

    fn exec_options(&self) -> ExecOptions {
        ExecOptions {
            max_time_ms: self.max_time_ms,
            ..ExecOptions::default()
        }
    }
}

/// Models, options and documents loaded from one model file
#[derive(Debug)]
pub struct Session {
    models: Vec<Arc<Model>>,
    options: ParserOptions,
    access: AccessContext,
    documents: Vec<Value>,
}

impl Session {
    pub fn from_file(file: ModelFile) -> CliResult<Self> {
        let models = file
            .models
            .into_iter()
            .map(|def| Model::from_definition(def).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| CliError::model_error(e.to_string()))?;
        Ok(Self {
            models,
            options: file.options,
            access: file
                .access
                .unwrap_or_else(|| AccessContext::new(Principal::anonymous(), AccessLevel::Read)),
            documents: file.documents,
        })
    }

    /// Compiles the request into a fresh parser
    pub fn parser(&self, request: &Request) -> CliResult<Parser> {
        let mut parser = Parser::new(self.models.clone(), self.access.clone(), self.options.clone())?;
        parser.parse(&request.query, request.projection.clone(), request.base_filter.clone())?;
        if let Some(batch) = &request.batch {
            parser.set_batch(&batch.field, batch.values.clone())?;
        }
        Ok(parser)
    }

    /// An in-memory store holding the file's documents with their index
    /// slots filled in
    pub fn store(&self) -> CliResult<MemoryStore> {
        let store = MemoryStore::new();
        let Some(fallback) = self.models.first() else {
            return Ok(store);
        };
        for document in &self.documents {
            let model = document
                .get("object")
                .and_then(Value::as_str)
                .and_then(|name| self.models.iter().find(|m| m.name() == name))
                .unwrap_or(fallback);
            store
                .insert_indexed(model, document.clone())
                .map_err(|e| CliError::model_error(format!("Invalid document: {}", e)))?;
        }
        Ok(store)
    }
}

/// Main CLI entry point
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    let severity = Severity::parse(&cli.log_level)
        .ok_or_else(|| CliError::io_error(format!("Unknown log level: {}", cli.log_level)))?;
    Logger::set_min_severity(severity);
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    let model = match &cmd {
        Command::Compile { model } | Command::Explain { model } | Command::Run { model } => model.clone(),
    };

    let session = Session::from_file(load_model_file(&model)?)?;
    let request = Request::from_value(read_request()?)?;
    let result = match cmd {
        Command::Compile { .. } => compile(&session, &request),
        Command::Explain { .. } => explain(&session, &request),
        Command::Run { .. } => run_query(&session, &request),
    };
    match result {
        Ok(data) => write_response(data),
        Err(e) => {
            write_error(e.code_str(), e.message())?;
            Err(e)
        }
    }
}

fn block_on<F: std::future::Future>(future: F) -> CliResult<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    Ok(runtime.block_on(future))
}

/// Compile a query and describe the stages
pub fn compile(session: &Session, request: &Request) -> CliResult<Value> {
    let parser = session.parser(request)?;
    let mut out = json!({
        "collection": parser.collection(),
        "mode": if parser.can_be_called_as_query() { "query" } else { "aggregate" },
        "accessLevel": parser.access_level(),
        "stages": parser.pipeline_json(),
        "paths": parser.property_paths(),
    });
    if parser.has_variables() {
        let mut variables = Map::new();
        for context in [
            VariableContext::Where,
            VariableContext::Map,
            VariableContext::Group,
            VariableContext::Sort,
            VariableContext::Pipeline,
        ] {
            let found = parser.get_variables(context);
            if !found.is_empty() {
                variables.insert(context.as_str().to_string(), serde_json::to_value(found)?);
            }
        }
        out["variables"] = Value::Object(variables);
    }
    Ok(out)
}

/// Build the execution plan without touching the store
pub fn explain(session: &Session, request: &Request) -> CliResult<Value> {
    let parser = session.parser(request)?;
    let store = MemoryStore::new();
    let options = ExecOptions {
        explain: true,
        ..request.exec_options()
    };
    let output = block_on(parser.exec(&store, options))??;
    output
        .to_json()
        .ok_or_else(|| CliError::io_error("Explain produced no output"))
}

/// Execute against the file's documents
pub fn run_query(session: &Session, request: &Request) -> CliResult<Value> {
    let parser = session.parser(request)?;
    let store = session.store()?;
    let output = block_on(parser.exec(&store, request.exec_options()))??;
    output
        .to_json()
        .ok_or_else(|| CliError::io_error("Query produced no output"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        let file: ModelFile = serde_json::from_value(json!({
            "models": [{
                "name": "c_ticket",
                "collection": "contexts",
                "properties": [
                    {"name": "c_status", "type": "String", "indexed": true, "id": 1}
                ],
                "slots": [{"property_id": 1, "name": "s1"}]
            }],
            "documents": [
                {"_id": "5f0c7a3e9d1b2c0012345671", "c_status": "open"},
                {"_id": "5f0c7a3e9d1b2c0012345672", "c_status": "closed"}
            ]
        }))
        .unwrap();
        Session::from_file(file).unwrap()
    }

    fn request(value: Value) -> Request {
        Request::from_value(value).unwrap()
    }

    #[test]
    fn test_compile_describes_stages() {
        let out = compile(&session(), &request(json!({"where": {"c_status": "open"}}))).unwrap();
        assert_eq!(out["mode"], "query");
        assert_eq!(out["stages"][0]["$match"]["$and"][0], json!({"idx.s1": "open"}));
    }

    #[test]
    fn test_run_filters_seeded_documents() {
        let out = run_query(&session(), &request(json!({"where": {"c_status": "open"}}))).unwrap();
        assert_eq!(out["object"], "list");
        assert_eq!(out["data"].as_array().unwrap().len(), 1);
        assert_eq!(out["hasMore"], false);
    }

    #[test]
    fn test_explain_reports_plan() {
        let out = explain(&session(), &request(json!({"limit": 5}))).unwrap();
        assert_eq!(out["reader"]["mode"], "query");
        assert_eq!(out["reader"]["find"]["limit"], 6);
    }

    #[test]
    fn test_query_errors_surface_codes() {
        let err = compile(&session(), &request(json!({"pipeline": 5}))).unwrap_err();
        assert_eq!(err.code_str(), "QUERY_INVALID_ARGUMENT");
    }
}
