use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use mergeflow::constants::{CONCAT_WITH_INIT, ES_LINKER};
use mergeflow::linking::ColumnMatch;
use mergeflow::{logging, observability, Config, LinkRole, ModuleRegistry, Pipeline, Project, ProjectKind};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mergeflow")]
#[command(about = "Normalize tables and link them against a reference")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "mergeflow.toml")]
    config: PathBuf,

    /// Print the Prometheus metrics snapshot after the command
    #[arg(long)]
    print_metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a project and print its id
    Create {
        /// normalize or link
        #[arg(long)]
        kind: ProjectKind,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List the projects of a kind
    List {
        #[arg(long)]
        kind: ProjectKind,
    },
    /// Print a project's metadata
    Status {
        #[arg(long)]
        kind: ProjectKind,
        #[arg(long)]
        project: String,
    },
    /// Upload a CSV or Excel file into a normalize project
    Upload {
        #[arg(long)]
        project: String,
        #[arg(long)]
        file: PathBuf,
    },
    /// Choose the columns to process (comma-separated)
    SelectColumns {
        #[arg(long)]
        project: String,
        #[arg(long, value_delimiter = ',')]
        columns: Vec<String>,
    },
    /// Write a seeded random sample of an uploaded file
    SampleFile {
        #[arg(long)]
        project: String,
        #[arg(long)]
        file: String,
        /// Defaults to the configured sample size
        #[arg(long)]
        size: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Run an infer module on the last written table
    Infer {
        #[arg(long)]
        project: String,
        #[arg(long)]
        module: String,
        #[arg(long)]
        file: String,
        /// JSON parameters
        #[arg(long)]
        params: Option<String>,
    },
    /// Run a transform module and commit its output
    Transform {
        #[arg(long)]
        project: String,
        #[arg(long)]
        module: String,
        #[arg(long)]
        file: String,
        /// JSON parameters
        #[arg(long)]
        params: Option<String>,
    },
    /// Join the normalized columns back with the upload and commit
    Concat {
        #[arg(long)]
        project: String,
        #[arg(long)]
        file: String,
    },
    /// Replay the sample's transforms on the full file and commit
    RunAll {
        #[arg(long)]
        project: String,
        #[arg(long)]
        file: String,
    },
    /// Delete artifacts from a module onwards
    Invalidate {
        #[arg(long)]
        kind: ProjectKind,
        #[arg(long)]
        project: String,
        #[arg(long)]
        file: String,
        #[arg(long)]
        module: String,
        /// Also delete the module's own artifact
        #[arg(long)]
        inclusive: bool,
    },
    /// Use a normalize project as source or reference of a link project
    LinkSelect {
        #[arg(long)]
        project: String,
        /// source or ref
        #[arg(long)]
        role: LinkRole,
        /// Normalize project id
        #[arg(long)]
        from: String,
    },
    /// Set column matches, each as `src1,src2=ref1,ref2`
    LinkColumns {
        #[arg(long)]
        project: String,
        #[arg(long = "match", required = true)]
        matches: Vec<String>,
    },
    /// Label a (source row, reference row) pair
    Label {
        #[arg(long)]
        project: String,
        #[arg(long)]
        source_row: usize,
        #[arg(long)]
        ref_row: usize,
        #[arg(long)]
        is_match: bool,
    },
    /// Link source and reference, then commit the result
    Link {
        #[arg(long)]
        project: String,
        /// JSON parameters
        #[arg(long)]
        params: Option<String>,
    },
    /// Infer a restriction of the reference from the labelled matches
    InferRestriction {
        #[arg(long)]
        project: String,
        /// JSON parameters
        #[arg(long)]
        params: Option<String>,
    },
    /// Restrict the reference before linking and commit it
    Restrict {
        #[arg(long)]
        project: String,
        /// JSON restriction; defaults to the inferred one
        #[arg(long)]
        params: Option<String>,
    },
    /// Apply the labels to the link output and commit
    UpdateResults {
        #[arg(long)]
        project: String,
    },
    /// Summarize the last link output
    Analyze {
        #[arg(long)]
        project: String,
    },
}

fn parse_params(raw: Option<&str>) -> anyhow::Result<Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw).context("--params must be valid JSON"),
        None => Ok(Value::Null),
    }
}

fn parse_match(raw: &str) -> anyhow::Result<ColumnMatch> {
    let Some((source, reference)) = raw.split_once('=') else {
        bail!("column match '{}' should look like src1,src2=ref1,ref2", raw);
    };
    let split = |s: &str| s.split(',').map(|c| c.trim().to_string()).collect::<Vec<_>>();
    Ok(ColumnMatch {
        source: split(source),
        reference: split(reference),
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

struct App {
    config: Config,
    registry: Arc<ModuleRegistry>,
}

impl App {
    fn open(&self, kind: ProjectKind, project_id: &str) -> anyhow::Result<Pipeline> {
        let project = Project::open(&self.config.projects_root, kind, project_id)?;
        Ok(Pipeline::from_config(project, self.registry.clone(), &self.config))
    }

    fn run(&self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Create {
                kind,
                name,
                description,
            } => {
                let project = Project::create(&self.config.projects_root, kind, &name, &description)?;
                println!("{}", project.id());
            }
            Commands::List { kind } => {
                print_json(&Project::list(&self.config.projects_root, kind)?)?;
            }
            Commands::Status { kind, project } => {
                let pipeline = self.open(kind, &project)?;
                print_json(&pipeline.project().metadata)?;
            }
            Commands::Upload { project, file } => {
                let mut pipeline = self.open(ProjectKind::Normalize, &project)?;
                let bytes = std::fs::read(&file).with_context(|| format!("Failed to read {}", file.display()))?;
                let og_file_name = file.to_string_lossy();
                print_json(&pipeline.upload(&og_file_name, &bytes)?)?;
            }
            Commands::SelectColumns { project, columns } => {
                let mut pipeline = self.open(ProjectKind::Normalize, &project)?;
                pipeline.select_columns(&columns)?;
                info!("Selected {} columns", columns.len());
            }
            Commands::SampleFile {
                project,
                file,
                size,
                seed,
            } => {
                let mut pipeline = self.open(ProjectKind::Normalize, &project)?;
                let size = size.unwrap_or(self.config.sample.size);
                let seed = seed.unwrap_or(self.config.sample.seed);
                println!("{}", pipeline.create_sample_file(&file, size, seed)?);
            }
            Commands::Infer {
                project,
                module,
                file,
                params,
            } => {
                let mut pipeline = self.open(ProjectKind::Normalize, &project)?;
                let params = parse_params(params.as_deref())?;
                let key = pipeline.get_last_written(None, Some(&file), None)?;
                pipeline.load(&key.module_name, &key.file_name)?;
                print_json(&pipeline.infer(&module, &params)?)?;
            }
            Commands::Transform {
                project,
                module,
                file,
                params,
            } => {
                let mut pipeline = self.open(ProjectKind::Normalize, &project)?;
                let params = parse_params(params.as_deref())?;
                let key = pipeline.get_last_written(None, Some(&file), Some(&module))?;
                pipeline.load(&key.module_name, &key.file_name)?;
                let (_, run) = pipeline.transform(&module, &params)?;
                print_json(&run)?;
                print_json(&pipeline.commit()?)?;
            }
            Commands::Concat { project, file } => {
                let mut pipeline = self.open(ProjectKind::Normalize, &project)?;
                let key = pipeline.get_last_written(None, Some(&file), Some(CONCAT_WITH_INIT))?;
                pipeline.load(&key.module_name, &key.file_name)?;
                let (table, _) = pipeline.transform(CONCAT_WITH_INIT, &Value::Null)?;
                info!("Joined table has {} columns", table.columns.len());
                print_json(&pipeline.commit()?)?;
            }
            Commands::RunAll { project, file } => {
                let mut pipeline = self.open(ProjectKind::Normalize, &project)?;
                let outcomes = pipeline.run_all(&file)?;
                if outcomes.is_empty() {
                    warn!("Nothing was replayed on {}", file);
                } else {
                    print_json(&outcomes)?;
                    print_json(&pipeline.commit()?)?;
                }
            }
            Commands::Invalidate {
                kind,
                project,
                file,
                module,
                inclusive,
            } => {
                let mut pipeline = self.open(kind, &project)?;
                print_json(&pipeline.invalidate_from(&file, &module, inclusive)?)?;
            }
            Commands::LinkSelect { project, role, from } => {
                let mut pipeline = self.open(ProjectKind::Link, &project)?;
                print_json(&pipeline.select_project(role, &from)?)?;
            }
            Commands::LinkColumns { project, matches } => {
                let mut pipeline = self.open(ProjectKind::Link, &project)?;
                let matches = matches.iter().map(|m| parse_match(m)).collect::<anyhow::Result<Vec<_>>>()?;
                print_json(&pipeline.set_column_matches(matches)?)?;
            }
            Commands::Label {
                project,
                source_row,
                ref_row,
                is_match,
            } => {
                let mut pipeline = self.open(ProjectKind::Link, &project)?;
                let session = pipeline.record_label(source_row, ref_row, is_match)?;
                println!("{} labels ({} matches)", session.labels.len(), session.num_matches());
            }
            Commands::Link { project, params } => {
                let mut pipeline = self.open(ProjectKind::Link, &project)?;
                let params = parse_params(params.as_deref())?;
                let (_, run) = pipeline.link(ES_LINKER, &params)?;
                print_json(&run)?;
                print_json(&pipeline.commit()?)?;
            }
            Commands::InferRestriction { project, params } => {
                let mut pipeline = self.open(ProjectKind::Link, &project)?;
                let params = parse_params(params.as_deref())?;
                print_json(&pipeline.infer_restriction(&params)?)?;
            }
            Commands::Restrict { project, params } => {
                let mut pipeline = self.open(ProjectKind::Link, &project)?;
                let params = parse_params(params.as_deref())?;
                print_json(&pipeline.perform_restriction(&params)?)?;
                print_json(&pipeline.commit()?)?;
            }
            Commands::UpdateResults { project } => {
                let mut pipeline = self.open(ProjectKind::Link, &project)?;
                print_json(&pipeline.update_results()?)?;
                print_json(&pipeline.commit()?)?;
            }
            Commands::Analyze { project } => {
                let mut pipeline = self.open(ProjectKind::Link, &project)?;
                print_json(&pipeline.analyze_results()?)?;
            }
        }
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::load_from(&cli.config)?;
    let _guard = logging::init_logging(&config.logging);
    if cli.print_metrics {
        observability::init()?;
    }

    let app = App {
        registry: Arc::new(ModuleRegistry::standard()?),
        config,
    };
    let outcome = app.run(cli.command);

    if cli.print_metrics {
        if let Some(snapshot) = observability::render() {
            println!("{}", snapshot);
        }
    }
    outcome
}
