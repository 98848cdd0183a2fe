use std::fs;
use std::path::{Path, PathBuf};

use demere_core::{KeyValueStore, MemoryStore, RunLedger, STORAGE_KEY};
use jsonschema::JSONSchema;
use serde_json::Value;

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", path.display()))
}

fn schema_errors(schema_path: &Path, value: &Value) -> Vec<String> {
    let schema = read_json(schema_path);
    let compiled = JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", schema_path.display()));
    compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
        .unwrap_or_default()
}

#[test]
fn run_history_fixture_matches_schema() {
    let repo = repo_root();
    let schema = repo.join("contracts/ledger/v1/schemas/run-history.schema.json");
    let fixture = read_json(&repo.join("contracts/ledger/v1/fixtures/run-history.sample.json"));

    let errors = schema_errors(&schema, &fixture);
    assert!(errors.is_empty(), "fixture failed schema: {}", errors.join("\n"));
}

#[test]
fn schema_rejects_boolean_occurred_flag() {
    let repo = repo_root();
    let schema = repo.join("contracts/ledger/v1/schemas/run-history.schema.json");
    let mut fixture =
        read_json(&repo.join("contracts/ledger/v1/fixtures/run-history.sample.json"));
    fixture[0]["ocurrio"] = Value::Bool(true);

    assert!(!schema_errors(&schema, &fixture).is_empty());
}

#[test]
fn run_history_fixture_loads_into_ledger() {
    let repo = repo_root();
    let body = fs::read_to_string(repo.join("contracts/ledger/v1/fixtures/run-history.sample.json"))
        .unwrap_or_else(|err| panic!("failed to read fixture: {err}"));

    let mut store = MemoryStore::default();
    if let Err(err) = store.set(STORAGE_KEY, &body) {
        panic!("failed to seed store: {err}");
    }

    let mut ledger = RunLedger::new(store);
    assert_eq!(ledger.load(), 2);
    assert!(ledger.take_warnings().is_empty());

    let table = ledger
        .to_table()
        .unwrap_or_else(|err| panic!("failed to render table: {err}"));
    let lines: Vec<&str> = table.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[1].starts_with("1,one_die,2026-02-07T12:00:00.125Z,4,1,1,\"[{\"\"roll\"\":1,"));
    assert!(lines[2].starts_with("2,two_dice,2026-02-07T12:00:05Z,24,0,0,"));
}
