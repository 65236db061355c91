use jsonschema::JSONSchema;
use mergeflow::constants::{INIT, METADATA_FILE, REPLACE_MVS};
use mergeflow::{ModuleRegistry, Pipeline, Project, ProjectKind};
use serde_json::json;
use std::sync::Arc;
use tempfile::tempdir;

fn compiled_schema() -> JSONSchema {
    let schema = include_str!("../schemas/project_metadata.v1.json");
    let schema_json: serde_json::Value = serde_json::from_str(schema).unwrap();
    let schema_static: &'static serde_json::Value = Box::leak(Box::new(schema_json));
    JSONSchema::options().compile(schema_static).unwrap()
}

fn read_metadata(project: &Project) -> serde_json::Value {
    let raw = std::fs::read_to_string(project.dir().join(METADATA_FILE)).unwrap();
    serde_json::from_str(&raw).unwrap()
}

#[test]
fn fresh_normalize_project_is_valid() {
    let dir = tempdir().unwrap();
    let project = Project::create(dir.path(), ProjectKind::Normalize, "fresh", "").unwrap();
    let compiled = compiled_schema();
    assert!(compiled.is_valid(&read_metadata(&project)));
}

#[test]
fn metadata_after_commits_is_valid() {
    let dir = tempdir().unwrap();
    let project = Project::create(dir.path(), ProjectKind::Normalize, "used", "").unwrap();
    let mut pipeline = Pipeline::new(project, Arc::new(ModuleRegistry::standard().unwrap()));
    pipeline.upload("data.csv", b"a,b\n1,NA\n2,3\n").unwrap();
    pipeline.create_sample_file("data.csv", 1, 3).unwrap();
    pipeline.load(INIT, "data.csv").unwrap();
    pipeline.transform(REPLACE_MVS, &json!({"columns": {"b": ["NA"]}})).unwrap();
    pipeline.commit().unwrap();

    let compiled = compiled_schema();
    let metadata = read_metadata(pipeline.project());
    assert!(compiled.is_valid(&metadata));
    assert_eq!(metadata["last_written"]["module_name"], json!(REPLACE_MVS));
    assert_eq!(metadata["files"]["MINI__data.csv"]["is_mini"], json!(true));
}

#[test]
fn link_project_metadata_is_valid() {
    let dir = tempdir().unwrap();
    let project = Project::create(dir.path(), ProjectKind::Link, "link", "").unwrap();
    let compiled = compiled_schema();
    let metadata = read_metadata(&project);
    assert!(compiled.is_valid(&metadata));
    assert!(metadata["link"].is_object());
}

#[test]
fn unknown_kind_is_rejected() {
    let dir = tempdir().unwrap();
    let project = Project::create(dir.path(), ProjectKind::Normalize, "broken", "").unwrap();
    let compiled = compiled_schema();

    let mut broken = read_metadata(&project);
    broken["kind"] = json!("dedupe");
    assert!(!compiled.is_valid(&broken), "kind enum should fail");

    let mut broken = read_metadata(&project);
    broken["project_id"] = json!("not-a-uuid");
    assert!(!compiled.is_valid(&broken), "project id pattern should fail");
}
