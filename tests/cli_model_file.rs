//! CLI model file tests
//!
//! Model files are read from disk, compiled into sessions and used to
//! answer requests exactly as the `docql` binary would.

use std::fs;
use std::path::PathBuf;

use serde_json::{json, Value};
use tempfile::TempDir;

use docql::cli::{compile, explain, load_model_file, parse_request, run_query, Request, Session};

fn model_file() -> Value {
    json!({
        "models": [
            {
                "name": "c_invoice",
                "collection": "contexts",
                "properties": [
                    {"name": "c_number", "type": "String", "indexed": true, "id": 1},
                    {"name": "c_amount", "type": "Number", "indexed": true, "id": 2},
                    {"name": "c_memo", "type": "String", "read_access": "update"}
                ],
                "slots": [
                    {"property_id": 1, "name": "s1"},
                    {"property_id": 2, "name": "n1"}
                ]
            }
        ],
        "options": {"defaultLimit": 2},
        "documents": [
            {"_id": "000000000000000000000001", "c_number": "INV-1", "c_amount": 10},
            {"_id": "000000000000000000000002", "c_number": "INV-2", "c_amount": 25},
            {"_id": "000000000000000000000003", "c_number": "INV-3", "c_amount": 40},
            {"_id": "000000000000000000000004", "c_number": "INV-4", "c_amount": 55}
        ]
    })
}

fn write_model(dir: &TempDir, content: &Value) -> PathBuf {
    let path = dir.path().join("model.json");
    fs::write(&path, serde_json::to_string_pretty(content).unwrap()).unwrap();
    path
}

fn session() -> (TempDir, Session) {
    let dir = TempDir::new().unwrap();
    let path = write_model(&dir, &model_file());
    let session = Session::from_file(load_model_file(&path).unwrap()).unwrap();
    (dir, session)
}

fn request(input: &str) -> Request {
    Request::from_value(parse_request(input).unwrap()).unwrap()
}

// =============================================================================
// Loading
// =============================================================================

/// Missing and malformed model files are model errors.
#[test]
fn test_bad_model_files_rejected() {
    let dir = TempDir::new().unwrap();
    let missing = load_model_file(&dir.path().join("absent.json")).unwrap_err();
    assert_eq!(missing.code_str(), "DOCQL_CLI_MODEL_ERROR");

    let empty = write_model(&dir, &json!({"models": []}));
    assert_eq!(load_model_file(&empty).unwrap_err().code_str(), "DOCQL_CLI_MODEL_ERROR");
}

/// Requests must be JSON objects.
#[test]
fn test_request_must_be_object() {
    assert!(parse_request("").is_err());
    assert!(parse_request("[1, 2]").is_err());
    assert!(parse_request("{\"where\": {}}").is_ok());
}

// =============================================================================
// Commands
// =============================================================================

/// The file's default limit pages results.
#[test]
fn test_run_applies_file_options() {
    let (_dir, session) = session();
    let out = run_query(&session, &request(r#"{"where": {"c_amount": {"$gte": 20}}}"#)).unwrap();
    let data = out["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["c_number"], "INV-4");
    assert_eq!(out["hasMore"], true);
}

/// Batched requests answer with one list per value.
#[test]
fn test_run_batch_request() {
    let (_dir, session) = session();
    let out = run_query(
        &session,
        &request(r#"{"batch": {"field": "c_number", "values": ["INV-1", "INV-3", "INV-9"]}}"#),
    )
    .unwrap();
    assert_eq!(out["object"], "map");
    assert_eq!(out["data"]["INV-1"]["data"].as_array().unwrap().len(), 1);
    assert_eq!(out["data"]["INV-9"]["data"].as_array().unwrap().len(), 0);
}

/// Compilation reports the raised access level of restricted properties.
#[test]
fn test_compile_reports_access_level() {
    let (_dir, session) = session();
    let out = compile(&session, &request(r#"{"pipeline": [{"$project": {"c_memo": 1}}]}"#)).unwrap();
    assert_eq!(out["mode"], "aggregate");
    assert_eq!(out["accessLevel"], "update");
    assert!(out["paths"].as_array().unwrap().contains(&json!("c_memo")));
}

/// Explain shows the store plan without reading documents.
#[test]
fn test_explain_skips_store() {
    let (_dir, session) = session();
    let out = explain(&session, &request(r#"{"where": {"c_number": "INV-2"}, "total": true}"#)).unwrap();
    assert_eq!(out["collection"], "contexts");
    assert_eq!(out["reader"]["mode"], "query");
    assert_eq!(out["reader"]["find"]["limit"], 3);
    assert!(out["reader"]["totals"].is_object());
}
