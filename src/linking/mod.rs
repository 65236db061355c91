//! Record linkage between two normalized tables.
//!
//! A link project points at a *source* and a *reference* table, each the
//! last written artifact of a normalize project. The linker indexes the
//! reference through an [`Indexer`], queries it with every source row and
//! lets a [`Matcher`] decide. The reference can first be narrowed down
//! with a [`restriction`], and the output corrected with the labels.

pub mod index;
pub mod labels;
pub mod matcher;
pub mod restriction;
pub mod session;

pub use index::TantivyIndex;
pub use matcher::ThresholdMatcher;
pub use session::{Label, LabellingSession};

use crate::constants::{
    full_name, reference_name, ADD_SELECTED_COLUMNS, COLUMN_MATCHES, ES_LINKER, INFERRED_CONFIG, INIT, LABELLER,
    PERFORM_RESTRICTION, REF_SUFFIX,
};
use crate::engine::Pipeline;
use crate::error::{PipelineError, Result};
use crate::modules::{parse_params, LinkModule, TransformOutput};
use crate::project::{LinkFiles, LinkedFile, Project};
use crate::registry::ProjectKind;
use crate::store::lock::{read_locked, write_locked, LockPolicy};
use crate::table::Table;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::str::FromStr;
use tracing::{info, instrument};

pub const ID_REF_COLUMN: &str = "__ID_REF";
pub const SCORE_COLUMN: &str = "__ES_SCORE";
pub const CONFIDENCE_COLUMN: &str = "__CONFIDENCE";
pub const IS_MATCH_COLUMN: &str = "__IS_MATCH";

/// Source columns paired with the reference columns they should be compared to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMatch {
    pub source: Vec<String>,
    #[serde(rename = "ref")]
    pub reference: Vec<String>,
}

/// One reference row proposed for a source row
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub row: usize,
    pub score: f64,
}

/// How a column is tokenized when indexed and queried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Analyzer {
    /// Lowercased words
    Words,
    /// Lowercased character trigrams, tolerant to typos
    Trigrams,
    /// The whole trimmed, lowercased value
    Exact,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedField {
    pub column: String,
    pub analyzer: Analyzer,
}

/// Query built from one source row
#[derive(Debug, Clone, Default)]
pub struct Query {
    /// (reference column, text) pairs to score
    pub should: Vec<(String, String)>,
    /// Candidates must contain each of these terms in the given column
    pub must: Vec<(String, String)>,
    /// Candidates containing any of these terms in the given column are dropped
    pub must_not: Vec<(String, String)>,
    pub size: usize,
}

/// Indexes a table and answers scored queries against it
pub trait Indexer: Send + Sync {
    fn index(&mut self, table: &Table, fields: &[IndexedField]) -> anyhow::Result<()>;

    /// Candidates ranked by decreasing score
    fn query(&self, query: &Query) -> anyhow::Result<Vec<Candidate>>;
}

/// Labeled pair of (source row, reference row) used to calibrate a matcher
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingPair {
    pub score: f64,
    pub is_match: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchDecision {
    /// Index into the candidate list
    pub candidate: Option<usize>,
    pub confidence: f64,
}

/// Decides which candidate, if any, matches a source row
pub trait Matcher: Send + Sync {
    fn train(&mut self, pairs: &[TrainingPair], params: &Value) -> anyhow::Result<()>;

    fn decide(&self, candidates: &[Candidate]) -> MatchDecision;
}

/// Everything a link module needs, loaded from the two normalize projects
#[derive(Debug, Clone)]
pub struct LinkInput {
    pub source: Table,
    pub reference: Table,
    pub column_matches: Vec<ColumnMatch>,
    pub labels: Vec<Label>,
    /// File name of the link output, the source file name
    pub output_file_name: String,
    /// Row number in the full reference of each reference row, when the
    /// reference was restricted
    pub reference_ids: Option<Vec<usize>>,
}

impl LinkInput {
    /// Row number in the full reference of reference row `row`
    pub fn reference_id(&self, row: usize) -> usize {
        self.reference_ids
            .as_ref()
            .and_then(|ids| ids.get(row).copied())
            .unwrap_or(row)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkParams {
    /// Minimum score for a match; calibrated from labels when absent
    #[serde(default)]
    pub threshold: Option<f64>,
    /// Number of candidates fetched per source row
    #[serde(default)]
    pub size: Option<usize>,
    #[serde(default)]
    pub analyzers: Vec<IndexedField>,
    /// `{ref column: [terms]}` every candidate must contain
    #[serde(default)]
    pub must: std::collections::BTreeMap<String, Vec<String>>,
    /// `{ref column: [terms]}` no candidate may contain
    #[serde(default)]
    pub must_not: std::collections::BTreeMap<String, Vec<String>>,
}

/// Reference linker: index the reference, query with each source row, decide
pub struct EsLinker<I = TantivyIndex, M = ThresholdMatcher> {
    _marker: PhantomData<fn() -> (I, M)>,
}

impl<I, M> Default for EsLinker<I, M> {
    fn default() -> Self {
        Self { _marker: PhantomData }
    }
}

impl<I, M> LinkModule for EsLinker<I, M>
where
    I: Indexer + Default,
    M: Matcher + Default,
{
    fn link(&self, input: &LinkInput, params: &Value) -> anyhow::Result<TransformOutput> {
        let params: LinkParams = parse_params(params)?;
        if input.column_matches.is_empty() {
            anyhow::bail!("no column matches; set them before linking");
        }

        // Step 1: index the reference on every matched reference column
        let ref_columns: BTreeSet<&String> = input.column_matches.iter().flat_map(|m| m.reference.iter()).collect();
        let fields: Vec<IndexedField> = ref_columns
            .iter()
            .map(|column| IndexedField {
                column: column.to_string(),
                analyzer: params
                    .analyzers
                    .iter()
                    .find(|f| &&f.column == column)
                    .map(|f| f.analyzer)
                    .unwrap_or(Analyzer::Trigrams),
            })
            .collect();
        let mut indexer = I::default();
        indexer.index(&input.reference, &fields)?;

        // Step 2: query the index with each source row
        let size = params.size.unwrap_or(10).max(1);
        let mut all_candidates = Vec::with_capacity(input.source.len());
        for row in &input.source.rows {
            let query = build_query(&input.source, row, &input.column_matches, &params, size);
            all_candidates.push(indexer.query(&query)?);
        }

        // Step 3: calibrate the matcher from labels
        let pairs = training_pairs(input, &all_candidates);
        let mut matcher = M::default();
        matcher.train(&pairs, &json!({ "threshold": params.threshold }))?;

        // Step 4: assemble the output table
        let mut columns = input.source.columns.clone();
        columns.extend(input.reference.columns.iter().map(|c| format!("{}{}", c, REF_SUFFIX)));
        columns.extend([ID_REF_COLUMN, SCORE_COLUMN, CONFIDENCE_COLUMN, IS_MATCH_COLUMN].map(String::from));

        let mut num_match = 0;
        let mut rows = Vec::with_capacity(input.source.len());
        for (row, candidates) in input.source.rows.iter().zip(&all_candidates) {
            let decision = matcher.decide(candidates);
            let mut out = row.clone();
            match decision.candidate.and_then(|i| candidates.get(i)) {
                Some(candidate) => {
                    num_match += 1;
                    out.extend(input.reference.rows[candidate.row].iter().cloned());
                    out.push(input.reference_id(candidate.row).to_string());
                    out.push(format!("{:.4}", candidate.score));
                    out.push(format!("{:.4}", decision.confidence));
                    out.push("true".to_string());
                }
                None => {
                    out.extend(std::iter::repeat(String::new()).take(input.reference.columns.len()));
                    out.push(String::new());
                    out.push(candidates.first().map(|c| format!("{:.4}", c.score)).unwrap_or_default());
                    out.push(format!("{:.4}", decision.confidence));
                    out.push("false".to_string());
                }
            }
            rows.push(out);
        }

        Ok(TransformOutput {
            table: Table::new(columns, rows),
            details: json!({
                "num_rows": input.source.len(),
                "num_match": num_match,
                "num_labels": input.labels.len(),
            }),
        })
    }
}

fn build_query(
    source: &Table,
    row: &[String],
    column_matches: &[ColumnMatch],
    params: &LinkParams,
    size: usize,
) -> Query {
    let mut query = Query {
        size,
        ..Query::default()
    };
    for column_match in column_matches {
        let text: Vec<&str> = column_match
            .source
            .iter()
            .filter_map(|c| source.column_index(c))
            .filter_map(|i| row.get(i).map(String::as_str))
            .filter(|v| !v.trim().is_empty())
            .collect();
        if text.is_empty() {
            continue;
        }
        let text = text.join(" ");
        for ref_column in &column_match.reference {
            query.should.push((ref_column.clone(), text.clone()));
        }
    }
    for (column, terms) in &params.must {
        query.must.extend(terms.iter().map(|t| (column.clone(), t.clone())));
    }
    for (column, terms) in &params.must_not {
        query.must_not.extend(terms.iter().map(|t| (column.clone(), t.clone())));
    }
    query
}

/// Scores of labeled pairs, as seen by the index. Pairs whose reference row
/// was not retrieved score zero.
fn training_pairs(input: &LinkInput, candidates: &[Vec<Candidate>]) -> Vec<TrainingPair> {
    input
        .labels
        .iter()
        .filter_map(|label| {
            let row_candidates = candidates.get(label.source_row)?;
            let score = row_candidates
                .iter()
                .find(|c| input.reference_id(c.row) == label.ref_row)
                .map(|c| c.score)
                .unwrap_or(0.0);
            Some(TrainingPair {
                score,
                is_match: label.is_match,
            })
        })
        .collect()
}

/// Role of a normalize project inside a link project
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Source,
    Reference,
}

impl FromStr for LinkRole {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "source" => Ok(LinkRole::Source),
            "ref" | "reference" => Ok(LinkRole::Reference),
            other => Err(PipelineError::InvalidArgument(format!(
                "link role must be 'source' or 'ref', got '{}'",
                other
            ))),
        }
    }
}

/// Read the source and reference tables, the column matches and the labels.
/// A committed restriction of the reference replaces the full reference.
pub fn load_link_input(project: &Project, chunk_size: usize, lock_policy: LockPolicy) -> Result<LinkInput> {
    let (source, reference) = selected_files(project)?;
    let source_table = read_linked(project, &source, chunk_size)?;

    let restricted = reference_name(&reference.file_name);
    let (reference_table, reference_ids) = if project.metadata.log.is_written(&restricted, PERFORM_RESTRICTION) {
        let table = project
            .store()
            .open_table(PERFORM_RESTRICTION, &restricted, chunk_size)?
            .materialize()?;
        let (table, ids) = restriction::split_row_ids(table)?;
        info!("Linking against {} restricted reference rows", table.len());
        (table, Some(ids))
    } else {
        (read_linked(project, &reference, chunk_size)?, None)
    };

    let column_matches: Vec<ColumnMatch> = project
        .store()
        .read_json(ES_LINKER, COLUMN_MATCHES)?
        .ok_or_else(|| PipelineError::artifact_not_found(ES_LINKER, COLUMN_MATCHES))?;

    Ok(LinkInput {
        source: source_table,
        reference: reference_table,
        column_matches,
        labels: read_labels(project, lock_policy)?,
        output_file_name: source.file_name,
        reference_ids,
    })
}

/// The full table a link project points at, read from its normalize project
pub(crate) fn read_linked(project: &Project, file: &LinkedFile, chunk_size: usize) -> Result<Table> {
    let normalize = Project::open(project.projects_root(), ProjectKind::Normalize, &file.project_id)?;
    normalize
        .store()
        .open_table(&file.module_name, &file.file_name, chunk_size)?
        .materialize()
}

pub(crate) fn read_labels(project: &Project, lock_policy: LockPolicy) -> Result<Vec<Label>> {
    let session: Option<LabellingSession> =
        read_locked(&project.store().path_to(ES_LINKER, LABELLER), lock_policy)?;
    Ok(session.map(|s| s.labels).unwrap_or_default())
}

pub(crate) fn selected_files(project: &Project) -> Result<(LinkedFile, LinkedFile)> {
    let link = project
        .metadata
        .link
        .as_ref()
        .ok_or_else(|| PipelineError::InvalidArgument("not a link project".into()))?;
    match (&link.source, &link.reference) {
        (Some(source), Some(reference)) => Ok((source.clone(), reference.clone())),
        _ => Err(PipelineError::InvalidArgument(
            "select both a source and a reference before linking".into(),
        )),
    }
}

impl Pipeline {
    pub(crate) fn require_link_project(&self) -> Result<()> {
        if self.kind() != ProjectKind::Link {
            return Err(PipelineError::InvalidArgument("operation only valid on link projects".into()));
        }
        Ok(())
    }

    /// Use the last written table of a normalize project as source or reference
    #[instrument(skip(self), fields(project = %self.project.id()))]
    pub fn select_project(&mut self, role: LinkRole, normalize_project_id: &str) -> Result<LinkedFile> {
        self.require_link_project()?;
        let normalize = Project::open(self.project.projects_root(), ProjectKind::Normalize, normalize_project_id)?;
        let uploaded = normalize.uploaded_files();
        if uploaded.len() != 1 {
            return Err(PipelineError::InvalidArgument(format!(
                "project {} should have exactly one uploaded file, found {}",
                normalize_project_id,
                uploaded.len()
            )));
        }
        let file_name = uploaded[0];
        let log_order = normalize_log_order(&self.registry);
        let module_name = normalize.metadata.log.last_written(file_name, &log_order, None)?;
        let linked = LinkedFile {
            project_id: normalize_project_id.to_string(),
            module_name,
            file_name: full_name(file_name).to_string(),
        };

        let link_order = self.log_order();
        let link = self.project.metadata.link.get_or_insert_with(LinkFiles::default);
        let previous_reference = link.reference.as_ref().map(|r| reference_name(&r.file_name));
        match role {
            LinkRole::Source => link.source = Some(linked.clone()),
            LinkRole::Reference => link.reference = Some(linked.clone()),
        }
        let source_file = link.source.as_ref().map(|s| s.file_name.clone());
        let both = link.source.is_some() && link.reference.is_some();

        if role == LinkRole::Source {
            self.log().reset_file(&linked.file_name, &link_order);
        }
        if role == LinkRole::Reference {
            self.forget_restriction(previous_reference.as_deref(), &link_order)?;
        }
        if let (true, Some(source_file)) = (both, source_file) {
            self.log().init_file(&source_file, &link_order);
            self.log().mark_checkpoint(&source_file, INIT);
        }
        self.project.save()?;
        info!("Selected ({}, {}) of {} as {:?}", linked.module_name, linked.file_name, normalize_project_id, role);
        Ok(linked)
    }

    /// Drop the restricted reference and its inferred configuration; they
    /// describe rows of a reference that is no longer selected
    fn forget_restriction(&mut self, previous: Option<&str>, link_order: &[String]) -> Result<()> {
        let Some(previous) = previous else {
            return Ok(());
        };
        let store = self.project.store();
        let removed = store.remove_everywhere(previous)?;
        store.remove(PERFORM_RESTRICTION, INFERRED_CONFIG)?;
        self.log().reset_file(previous, link_order);
        if self.project.metadata.last_written.as_ref().map(|k| k.file_name.as_str()) == Some(previous) {
            self.project.metadata.last_written = None;
        }
        if self.buffer.as_ref().map(|b| b.file_name()) == Some(previous) {
            self.buffer = None;
        }
        if !removed.is_empty() {
            info!("Removed restriction of previous reference {}", previous);
        }
        Ok(())
    }

    /// Store which source columns are compared to which reference columns
    #[instrument(skip(self, matches), fields(project = %self.project.id()))]
    pub fn set_column_matches(&mut self, matches: Vec<ColumnMatch>) -> Result<Vec<ColumnMatch>> {
        self.require_link_project()?;
        let cleaned: Vec<ColumnMatch> = matches
            .into_iter()
            .map(|m| ColumnMatch {
                source: dedup(m.source),
                reference: dedup(m.reference),
            })
            .filter(|m| !m.source.is_empty() && !m.reference.is_empty())
            .collect();
        if cleaned.is_empty() {
            return Err(PipelineError::InvalidArgument("no usable column match".into()));
        }

        // Labels refer to the previous matching; start over in place so a
        // labeller holding the lock never writes to an unlinked file
        let labeller = self.project.store().path_to(ES_LINKER, LABELLER);
        if labeller.is_file() {
            write_locked(&labeller, self.lock_policy, &LabellingSession::default())?;
            info!("Reset labelling session after column matches changed");
        }
        self.project.store().write_json(ES_LINKER, COLUMN_MATCHES, &cleaned)?;

        if let Some(source) = self.project.metadata.link.as_ref().and_then(|l| l.source.clone()) {
            self.log().mark_checkpoint(&source.file_name, ADD_SELECTED_COLUMNS);
        }
        self.project.save()?;
        Ok(cleaned)
    }

    /// Add a label to the shared labelling session
    #[instrument(skip(self), fields(project = %self.project.id()))]
    pub fn record_label(&mut self, source_row: usize, ref_row: usize, is_match: bool) -> Result<LabellingSession> {
        self.require_link_project()?;
        let path = self.project.store().path_to(ES_LINKER, LABELLER);
        let session = session::record_label(&path, self.lock_policy, Label {
            source_row,
            ref_row,
            is_match,
        })?;
        if let Some(source) = self.project.metadata.link.as_ref().and_then(|l| l.source.clone()) {
            self.log().mark_modified(&source.file_name, crate::constants::UPLOAD_ES_TRAIN);
        }
        self.project.save()?;
        Ok(session)
    }
}

fn normalize_log_order(registry: &crate::registry::ModuleRegistry) -> Vec<String> {
    registry.log_order(ProjectKind::Normalize).to_vec()
}

fn dedup(columns: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    columns
        .into_iter()
        .filter(|c| !c.trim().is_empty() && seen.insert(c.clone()))
        .collect()
}
