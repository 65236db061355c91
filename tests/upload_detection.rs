use anyhow::Result;
use mergeflow::constants::{INFERRED_CONFIG, INIT};
use mergeflow::upload::FileType;
use mergeflow::{ModuleRegistry, Pipeline, PipelineError, Project, ProjectKind, UploadReport};
use std::sync::Arc;
use tempfile::tempdir;

fn pipeline(root: &std::path::Path, kind: ProjectKind) -> Result<Pipeline> {
    let project = Project::create(root, kind, "upload", "")?;
    Ok(Pipeline::new(project, Arc::new(ModuleRegistry::standard()?)))
}

#[test]
fn test_latin1_semicolon_file_is_stored_as_utf8_csv() -> Result<()> {
    let dir = tempdir()?;
    let mut pipeline = pipeline(dir.path(), ProjectKind::Normalize)?;

    let bytes = b"Nom (complet);Ville\nRen\xE9 Char;S\xE8te\nZo\xE9;Nice\n";
    let report = pipeline.upload("Mes Donn\u{e9}es  2024.CSV", bytes)?;
    assert_eq!(report.file_name, "Mes_Donnes_2024.csv");
    assert_eq!(report.file_type, FileType::Csv);
    assert_eq!(report.sep.as_deref(), Some(";"));
    assert_eq!(report.encoding.as_deref(), Some("windows-1252"));

    let table = pipeline
        .project()
        .store()
        .open_table(INIT, &report.file_name, 10)?
        .materialize()?;
    assert_eq!(table.columns, vec!["Nom__complet_", "Ville"]);
    assert_eq!(table.rows[0], vec!["René Char", "Sète"]);

    let stored: UploadReport = pipeline
        .project()
        .store()
        .read_json(INIT, INFERRED_CONFIG)?
        .expect("upload report is stored");
    assert_eq!(stored, report);
    Ok(())
}

#[test]
fn test_second_upload_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let mut pipeline = pipeline(dir.path(), ProjectKind::Normalize)?;
    pipeline.upload("a.csv", b"x,y\n1,2\n")?;
    assert!(matches!(
        pipeline.upload("b.csv", b"x,y\n1,2\n"),
        Err(PipelineError::FileAlreadyUploaded(_))
    ));
    Ok(())
}

#[test]
fn test_rejected_inputs_leave_no_trace() -> Result<()> {
    let dir = tempdir()?;
    let mut pipeline = pipeline(dir.path(), ProjectKind::Normalize)?;

    assert!(matches!(
        pipeline.upload("notes.txt", b"x,y\n1,2\n"),
        Err(PipelineError::UnsupportedFileType(_))
    ));
    assert!(matches!(
        pipeline.upload("dup.csv", b"x,x\n1,2\n"),
        Err(PipelineError::DuplicateColumns(_))
    ));
    assert!(matches!(
        pipeline.upload("ragged.csv", b"a,b\n1,2,3\n4\n"),
        Err(PipelineError::UndetectableFormat)
    ));
    assert!(pipeline.project().metadata.files.is_empty());
    assert!(pipeline.project().store().list_files("csv")?.is_empty());
    Ok(())
}

#[test]
fn test_link_projects_do_not_take_uploads() -> Result<()> {
    let dir = tempdir()?;
    let mut pipeline = pipeline(dir.path(), ProjectKind::Link)?;
    assert!(matches!(
        pipeline.upload("a.csv", b"x\n1\n"),
        Err(PipelineError::InvalidArgument(_))
    ));
    Ok(())
}
