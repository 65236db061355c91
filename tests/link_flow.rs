use anyhow::Result;
use mergeflow::constants::{
    ADD_SELECTED_COLUMNS, ES_LINKER, INFERRED_CONFIG, INIT, LABELLER, PERFORM_RESTRICTION, REPLACE_MVS,
    RESULTS_ANALYSIS, UPDATE_RESULTS, UPLOAD_ES_TRAIN,
};
use mergeflow::{ColumnMatch, LinkRole, ModuleRegistry, Pipeline, PipelineError, Project, ProjectKind};
use mergeflow::linking::LabellingSession;
use mergeflow::store::lock::{read_locked, ArtifactLock, LockMode, LockPolicy};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

const SOURCE: &[u8] = b"etablissement,ville\nLycee Victor Hugo,Paris\nCollege Jean Moulin,Lyon\nEcole inconnue,Nowhere\n";
const REFERENCE: &[u8] = b"nom,commune,uai\nCollege Jean Moulin,Lyon,0690001A\nLycee Victor Hugo,Paris,0750001B\nLycee Victor Hugo,Besancon,0250001C\n";

fn normalize_project(root: &Path, registry: &Arc<ModuleRegistry>, name: &str, bytes: &[u8]) -> Result<String> {
    let project = Project::create(root, ProjectKind::Normalize, name, "")?;
    let mut pipeline = Pipeline::new(project, registry.clone());
    let report = pipeline.upload(&format!("{}.csv", name), bytes)?;
    pipeline.load(INIT, &report.file_name)?;
    pipeline.transform(REPLACE_MVS, &json!({"columns": {}}))?;
    pipeline.commit()?;
    Ok(pipeline.project().id().to_string())
}

fn link_pipeline(root: &Path) -> Result<Pipeline> {
    let registry = Arc::new(ModuleRegistry::standard()?);
    let source_id = normalize_project(root, &registry, "schools", SOURCE)?;
    let ref_id = normalize_project(root, &registry, "directory", REFERENCE)?;

    let project = Project::create(root, ProjectKind::Link, "schools x directory", "")?;
    let mut pipeline = Pipeline::new(project, registry);
    let source = pipeline.select_project(LinkRole::Source, &source_id)?;
    assert_eq!(source.module_name, REPLACE_MVS);
    assert_eq!(source.file_name, "schools.csv");
    pipeline.select_project(LinkRole::Reference, &ref_id)?;
    Ok(pipeline)
}

fn column_match(source: &[&str], reference: &[&str]) -> ColumnMatch {
    ColumnMatch {
        source: source.iter().map(|s| s.to_string()).collect(),
        reference: reference.iter().map(|s| s.to_string()).collect(),
    }
}

#[test]
fn test_link_and_analyze() -> Result<()> {
    let dir = tempdir()?;
    let mut pipeline = link_pipeline(dir.path())?;
    assert!(pipeline.project().metadata.log.record("schools.csv", INIT).map(|r| r.completed).unwrap_or(false));

    let matches = pipeline.set_column_matches(vec![
        column_match(&["etablissement", "etablissement"], &["nom"]),
        column_match(&["ville"], &["commune"]),
        column_match(&[], &["uai"]),
    ])?;
    assert_eq!(matches.len(), 2);
    assert_eq!(matches[0].source, vec!["etablissement"]);

    let (table, run) = pipeline.link(ES_LINKER, &json!({"threshold": 0.6}))?;
    assert_eq!(table.len(), 3);
    let is_match = table.column_index("__IS_MATCH").expect("match flag column");
    let id_ref = table.column_index("__ID_REF").expect("reference id column");
    assert_eq!(table.rows[0][id_ref], "1");
    assert_eq!(table.rows[1][id_ref], "0");
    assert_eq!(table.rows[2][is_match], "false");
    assert_eq!(run.details["num_match"], 2);

    let report = pipeline.commit()?;
    assert_eq!((report.module_name.as_str(), report.file_name.as_str()), (ES_LINKER, "schools.csv"));

    pipeline.load(ES_LINKER, "schools.csv")?;
    let analysis = pipeline.infer(RESULTS_ANALYSIS, &json!(null))?;
    assert_eq!(analysis["num_rows"], 3);
    assert_eq!(analysis["num_match"], 2);
    Ok(())
}

#[test]
fn test_labels_are_reset_when_matches_change() -> Result<()> {
    let dir = tempdir()?;
    let mut pipeline = link_pipeline(dir.path())?;
    pipeline.set_column_matches(vec![column_match(&["etablissement"], &["nom"])])?;

    let session = pipeline.record_label(0, 1, true)?;
    assert_eq!(session.labels.len(), 1);
    let session = pipeline.record_label(2, 0, false)?;
    assert_eq!(session.num_matches(), 1);
    let record = pipeline
        .project()
        .metadata
        .log
        .record("schools.csv", UPLOAD_ES_TRAIN)
        .expect("labelling is logged");
    assert!(record.was_modified);

    // The reset waits for a labeller holding the session
    let labeller = pipeline.project().store().path_to(ES_LINKER, LABELLER);
    let held = ArtifactLock::acquire(&labeller, LockMode::Exclusive, LockPolicy::default())?;
    let resetter = thread::spawn(move || -> Result<Pipeline> {
        pipeline.set_column_matches(vec![column_match(&["ville"], &["commune"])])?;
        Ok(pipeline)
    });
    thread::sleep(Duration::from_millis(50));
    let during: LabellingSession = serde_json::from_str(&std::fs::read_to_string(&labeller)?)?;
    assert_eq!(during.labels.len(), 2);
    drop(held);
    let mut pipeline = resetter.join().expect("reset thread panicked")?;

    let session: LabellingSession = read_locked(&labeller, LockPolicy::default())?.expect("session file is kept");
    assert!(session.labels.is_empty());
    pipeline.record_label(1, 0, true)?;
    let session: LabellingSession = read_locked(&labeller, LockPolicy::default())?.expect("session file is kept");
    assert_eq!(session.labels.len(), 1);
    assert!(pipeline
        .project()
        .metadata
        .log
        .record("schools.csv", ADD_SELECTED_COLUMNS)
        .map(|r| r.completed)
        .unwrap_or(false));
    Ok(())
}

#[test]
fn test_link_requires_both_sides_and_matches() -> Result<()> {
    let dir = tempdir()?;
    let registry = Arc::new(ModuleRegistry::standard()?);
    let project = Project::create(dir.path(), ProjectKind::Link, "empty", "")?;
    let mut pipeline = Pipeline::new(project, registry.clone());
    assert!(matches!(pipeline.link(ES_LINKER, &json!({})), Err(PipelineError::InvalidArgument(_))));
    assert!(matches!(
        pipeline.set_column_matches(vec![column_match(&[], &[])]),
        Err(PipelineError::InvalidArgument(_))
    ));

    // A normalize project without upload cannot be selected
    let bare = Project::create(dir.path(), ProjectKind::Normalize, "bare", "")?;
    assert!(pipeline.select_project(LinkRole::Source, bare.id()).is_err());
    assert!(matches!(
        pipeline.select_project(LinkRole::Reference, "missing"),
        Err(PipelineError::ProjectNotFound(_))
    ));

    let mut normalize = Pipeline::new(bare, registry);
    assert!(normalize.record_label(0, 0, true).is_err());
    Ok(())
}

#[test]
fn test_restrict_update_and_measure_precision() -> Result<()> {
    let dir = tempdir()?;
    let mut pipeline = link_pipeline(dir.path())?;
    pipeline.set_column_matches(vec![column_match(&["etablissement"], &["nom"])])?;
    assert!(matches!(
        pipeline.infer_restriction(&json!(null)),
        Err(PipelineError::InvalidArgument(_))
    ));

    pipeline.record_label(0, 1, true)?;
    pipeline.record_label(2, 0, false)?;
    let inferred = pipeline.infer_restriction(&json!({"columns": ["commune"]}))?;
    assert_eq!(inferred["values"]["commune"], "Paris");
    assert!(pipeline.project().store().exists(PERFORM_RESTRICTION, INFERRED_CONFIG));

    let run = pipeline.perform_restriction(&json!(null))?;
    assert_eq!(run.details["og_len"], 3);
    assert_eq!(run.details["new_len"], 1);
    let report = pipeline.commit()?;
    assert_eq!(
        (report.module_name.as_str(), report.file_name.as_str()),
        (PERFORM_RESTRICTION, "REF__directory.csv")
    );

    // Only the Paris row is left; it keeps its row number in the full reference
    let (table, _) = pipeline.link(ES_LINKER, &json!({"threshold": 0.6}))?;
    let is_match = table.column_index("__IS_MATCH").expect("match flag column");
    let id_ref = table.column_index("__ID_REF").expect("reference id column");
    assert_eq!(table.rows[0][id_ref], "1");
    assert_eq!(table.rows[1][is_match], "false");
    pipeline.commit()?;

    // The user points the Lyon college at a row outside the restriction
    pipeline.record_label(1, 0, true)?;
    let run = pipeline.update_results()?;
    assert_eq!(run.details["num_confirmed"], 1);
    assert_eq!(run.details["num_changed"], 1);
    assert_eq!(run.details["num_rejected"], 0);
    let report = pipeline.commit()?;
    assert_eq!((report.module_name.as_str(), report.file_name.as_str()), (UPDATE_RESULTS, "schools.csv"));

    let updated = pipeline.project().store().open_table(UPDATE_RESULTS, "schools.csv", 100)?.materialize()?;
    let uai = updated.column_index("uai__REF").expect("reference columns");
    assert_eq!(updated.rows[1][uai], "0690001A");
    assert_eq!(updated.rows[1][is_match], "true");

    let analysis = pipeline.analyze_results()?;
    assert_eq!(analysis["num_match"], 2);
    assert_eq!(analysis["num_verif_samples"], 2);
    assert_eq!(analysis["precision"], 1.0);

    // Choosing the reference again drops its restriction
    let ref_id = pipeline
        .project()
        .metadata
        .link
        .as_ref()
        .and_then(|l| l.reference.as_ref())
        .map(|r| r.project_id.clone())
        .expect("reference is selected");
    pipeline.select_project(LinkRole::Reference, &ref_id)?;
    assert!(!pipeline.project().store().exists(PERFORM_RESTRICTION, "REF__directory.csv"));
    assert!(!pipeline.project().store().exists(PERFORM_RESTRICTION, INFERRED_CONFIG));
    assert!(!pipeline
        .project()
        .metadata
        .log
        .is_written("REF__directory.csv", PERFORM_RESTRICTION));
    let (table, _) = pipeline.link(ES_LINKER, &json!({"threshold": 0.6}))?;
    assert_eq!(table.rows[1][id_ref], "0");
    Ok(())
}

#[test]
fn test_update_results_needs_link_output() -> Result<()> {
    let dir = tempdir()?;
    let mut pipeline = link_pipeline(dir.path())?;
    pipeline.set_column_matches(vec![column_match(&["etablissement"], &["nom"])])?;
    assert!(matches!(
        pipeline.update_results(),
        Err(PipelineError::NoWrittenArtifact { .. })
    ));
    assert!(matches!(
        pipeline.perform_restriction(&json!(null)),
        Err(PipelineError::ArtifactNotFound { .. })
    ));
    assert!(pipeline.buffer().is_none());
    Ok(())
}
