//! Module registry: which modules exist per project kind, what they can
//! compute, and in which order they run and are logged.

use crate::constants::*;
use crate::error::{PipelineError, Result};
use crate::linking::restriction::{InferRestriction, PerformRestriction};
use crate::linking::EsLinker;
use crate::modules::missing_values::{InferMissingValues, ReplaceMissingValues, SampleMissingValues};
use crate::modules::results::ResultsAnalysis;
use crate::modules::types::{InferTypes, NormalizeValues, SampleTypes};
use crate::modules::{InferModule, LinkModule, SampleModule, TransformModule};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleCategory {
    Transform,
    Infer,
    Link,
    Sample,
}

impl ModuleCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleCategory::Transform => "transform",
            ModuleCategory::Infer => "infer",
            ModuleCategory::Link => "link",
            ModuleCategory::Sample => "sample",
        }
    }
}

impl fmt::Display for ModuleCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectKind {
    Normalize,
    Link,
}

impl ProjectKind {
    /// Directory under the projects root
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectKind::Normalize => "normalize",
            ProjectKind::Link => "link",
        }
    }
}

impl fmt::Display for ProjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "normalize" => Ok(ProjectKind::Normalize),
            "link" => Ok(ProjectKind::Link),
            other => Err(PipelineError::InvalidArgument(format!(
                "project kind must be 'normalize' or 'link', got '{}'",
                other
            ))),
        }
    }
}

/// What a module can compute. `None` marks fixed modules whose behavior
/// lives in the engine (`INIT`, `concat_with_init`).
#[derive(Clone)]
pub enum Compute {
    None,
    Transform(Arc<dyn TransformModule>),
    Infer(Arc<dyn InferModule>),
    Sample(Arc<dyn SampleModule>),
    Link(Arc<dyn LinkModule>),
}

impl Compute {
    pub fn category(&self) -> Option<ModuleCategory> {
        match self {
            Compute::None => None,
            Compute::Transform(_) => Some(ModuleCategory::Transform),
            Compute::Infer(_) => Some(ModuleCategory::Infer),
            Compute::Sample(_) => Some(ModuleCategory::Sample),
            Compute::Link(_) => Some(ModuleCategory::Link),
        }
    }
}

impl fmt::Debug for Compute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.category() {
            Some(category) => write!(f, "Compute::{}", category),
            None => f.write_str("Compute::None"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    pub name: String,
    pub category: ModuleCategory,
    pub compute: Compute,
    /// Module whose configuration an infer module produces
    pub write_to: Option<String>,
    pub description: String,
    /// Replayed by `run_all`
    pub use_in_full_run: bool,
}

impl ModuleDescriptor {
    /// A module implemented by the engine itself
    pub fn fixed(name: &str, category: ModuleCategory, description: &str) -> Self {
        Self {
            name: name.to_string(),
            category,
            compute: Compute::None,
            write_to: None,
            description: description.to_string(),
            use_in_full_run: false,
        }
    }

    pub fn transform(name: &str, module: Arc<dyn TransformModule>, description: &str) -> Self {
        Self {
            compute: Compute::Transform(module),
            ..Self::fixed(name, ModuleCategory::Transform, description)
        }
    }

    pub fn infer(name: &str, module: Arc<dyn InferModule>, write_to: &str, description: &str) -> Self {
        Self {
            compute: Compute::Infer(module),
            write_to: Some(write_to.to_string()),
            ..Self::fixed(name, ModuleCategory::Infer, description)
        }
    }

    pub fn sample(name: &str, module: Arc<dyn SampleModule>, description: &str) -> Self {
        Self {
            compute: Compute::Sample(module),
            ..Self::fixed(name, ModuleCategory::Sample, description)
        }
    }

    pub fn link(name: &str, module: Arc<dyn LinkModule>, description: &str) -> Self {
        Self {
            compute: Compute::Link(module),
            ..Self::fixed(name, ModuleCategory::Link, description)
        }
    }

    pub fn in_full_run(mut self) -> Self {
        self.use_in_full_run = true;
        self
    }
}

/// Modules and orderings of one project kind, before validation
#[derive(Debug, Clone)]
pub struct KindDefinition {
    pub kind: ProjectKind,
    pub modules: Vec<ModuleDescriptor>,
    pub execution_order: Vec<String>,
    pub log_order: Vec<String>,
}

impl KindDefinition {
    pub fn new(kind: ProjectKind) -> Self {
        Self {
            kind,
            modules: Vec::new(),
            execution_order: Vec::new(),
            log_order: Vec::new(),
        }
    }

    pub fn register(mut self, module: ModuleDescriptor) -> Self {
        self.modules.push(module);
        self
    }

    pub fn execution_order(mut self, order: &[&str]) -> Self {
        self.execution_order = order.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn log_order(mut self, order: &[&str]) -> Self {
        self.log_order = order.iter().map(|s| s.to_string()).collect();
        self
    }
}

#[derive(Debug)]
struct KindModules {
    modules: Vec<ModuleDescriptor>,
    index: HashMap<String, usize>,
    execution_order: Vec<String>,
    log_order: Vec<String>,
}

/// Read-only after construction
#[derive(Debug)]
pub struct ModuleRegistry {
    kinds: HashMap<ProjectKind, KindModules>,
}

impl ModuleRegistry {
    /// Build a registry, rejecting any inconsistent ordering or descriptor
    pub fn new(definitions: Vec<KindDefinition>) -> Result<Self> {
        let mut kinds = HashMap::new();
        for definition in definitions {
            let kind = definition.kind;
            let modules = validate(definition)?;
            if kinds.insert(kind, modules).is_some() {
                return Err(inconsistent(kind, "kind defined twice".to_string()));
            }
        }
        Ok(Self { kinds })
    }

    /// The registry with every built-in module
    pub fn standard() -> Result<Self> {
        let normalize = KindDefinition::new(ProjectKind::Normalize)
            .register(ModuleDescriptor::fixed(INIT, ModuleCategory::Transform, "Uploaded file"))
            .register(
                ModuleDescriptor::transform(
                    REPLACE_MVS,
                    Arc::new(ReplaceMissingValues),
                    "Replace missing value tokens by empty cells",
                )
                .in_full_run(),
            )
            .register(
                ModuleDescriptor::transform(
                    NORMALIZE_VALUES,
                    Arc::new(NormalizeValues),
                    "Normalize values according to inferred column types",
                )
                .in_full_run(),
            )
            .register(
                ModuleDescriptor::fixed(
                    CONCAT_WITH_INIT,
                    ModuleCategory::Transform,
                    "Join normalized columns back with the uploaded file",
                )
                .in_full_run(),
            )
            .register(ModuleDescriptor::infer(
                INFER_MVS,
                Arc::new(InferMissingValues),
                REPLACE_MVS,
                "Detect missing value tokens per column",
            ))
            .register(ModuleDescriptor::infer(
                INFER_TYPES,
                Arc::new(InferTypes),
                NORMALIZE_VALUES,
                "Infer the type of each column",
            ))
            .register(ModuleDescriptor::sample(
                SAMPLE_MVS,
                Arc::new(SampleMissingValues),
                "Rows holding missing value tokens",
            ))
            .register(ModuleDescriptor::sample(
                SAMPLE_TYPES,
                Arc::new(SampleTypes),
                "Rows whose values do not match their inferred type",
            ))
            .execution_order(&[INIT, REPLACE_MVS, NORMALIZE_VALUES, CONCAT_WITH_INIT])
            .log_order(&[INIT, ADD_SELECTED_COLUMNS, REPLACE_MVS, NORMALIZE_VALUES, CONCAT_WITH_INIT]);

        let link = KindDefinition::new(ProjectKind::Link)
            .register(ModuleDescriptor::fixed(INIT, ModuleCategory::Transform, "Selected source and reference"))
            .register(ModuleDescriptor::infer(
                INFER_RESTRICTION,
                Arc::new(InferRestriction),
                PERFORM_RESTRICTION,
                "Infer words and values shared by the labelled reference matches",
            ))
            .register(ModuleDescriptor::transform(
                PERFORM_RESTRICTION,
                Arc::new(PerformRestriction),
                "Keep the reference rows holding the restriction's words and values",
            ))
            .register(ModuleDescriptor::link(
                ES_LINKER,
                Arc::new(<EsLinker>::default()),
                "Index the reference and match every source row",
            ))
            .register(ModuleDescriptor::infer(
                RESULTS_ANALYSIS,
                Arc::new(ResultsAnalysis),
                RESULTS_ANALYSIS,
                "Summarize link results",
            ))
            .register(ModuleDescriptor::fixed(
                UPDATE_RESULTS,
                ModuleCategory::Transform,
                "Apply the labels to the link output",
            ))
            .execution_order(&[INIT, PERFORM_RESTRICTION, ES_LINKER, UPDATE_RESULTS])
            .log_order(&[
                INIT,
                ADD_SELECTED_COLUMNS,
                UPLOAD_ES_TRAIN,
                PERFORM_RESTRICTION,
                ES_LINKER,
                UPDATE_RESULTS,
            ]);

        Self::new(vec![normalize, link])
    }

    fn kind(&self, kind: ProjectKind) -> Result<&KindModules> {
        self.kinds
            .get(&kind)
            .ok_or_else(|| PipelineError::RegistryInconsistency(format!("no modules registered for kind '{}'", kind)))
    }

    pub fn modules_for(&self, kind: ProjectKind) -> impl Iterator<Item = &ModuleDescriptor> {
        self.kinds.get(&kind).into_iter().flat_map(|k| k.modules.iter())
    }

    pub fn execution_order(&self, kind: ProjectKind) -> &[String] {
        self.kinds
            .get(&kind)
            .map(|k| k.execution_order.as_slice())
            .unwrap_or(&[])
    }

    pub fn log_order(&self, kind: ProjectKind) -> &[String] {
        self.kinds.get(&kind).map(|k| k.log_order.as_slice()).unwrap_or(&[])
    }

    pub fn get(&self, kind: ProjectKind, name: &str) -> Result<&ModuleDescriptor> {
        let modules = self.kind(kind)?;
        modules
            .index
            .get(name)
            .map(|&i| &modules.modules[i])
            .ok_or_else(|| PipelineError::UnknownModule(name.to_string()))
    }

    /// Look a module up and check its category
    pub fn get_as(&self, kind: ProjectKind, name: &str, expected: ModuleCategory) -> Result<&ModuleDescriptor> {
        let descriptor = self.get(kind, name)?;
        if descriptor.category != expected {
            return Err(PipelineError::WrongCategory {
                module_name: name.to_string(),
                expected: expected.to_string(),
            });
        }
        Ok(descriptor)
    }
}

fn inconsistent(kind: ProjectKind, reason: String) -> PipelineError {
    PipelineError::RegistryInconsistency(format!("{}: {}", kind, reason))
}

fn validate(definition: KindDefinition) -> Result<KindModules> {
    let kind = definition.kind;

    let mut index = HashMap::new();
    for (i, module) in definition.modules.iter().enumerate() {
        if index.insert(module.name.clone(), i).is_some() {
            return Err(inconsistent(kind, format!("module '{}' registered twice", module.name)));
        }
        if let Some(category) = module.compute.category() {
            if category != module.category {
                return Err(inconsistent(
                    kind,
                    format!(
                        "module '{}' is declared {} but computes as {}",
                        module.name, module.category, category
                    ),
                ));
            }
        }
        if module.category == ModuleCategory::Infer && module.write_to.is_none() {
            return Err(inconsistent(kind, format!("infer module '{}' has no write_to", module.name)));
        }
    }

    let mut seen = HashSet::new();
    for name in &definition.log_order {
        if !seen.insert(name.as_str()) {
            return Err(inconsistent(kind, format!("'{}' appears twice in the log order", name)));
        }
    }

    for name in &definition.execution_order {
        if !index.contains_key(name) {
            return Err(inconsistent(kind, format!("'{}' is in the execution order but not registered", name)));
        }
        if !seen.contains(name.as_str()) {
            return Err(inconsistent(kind, format!("'{}' is in the execution order but not in the log order", name)));
        }
    }

    // The execution order must appear in the log order in the same relative order
    let mut log_iter = definition.log_order.iter();
    for name in &definition.execution_order {
        if !log_iter.any(|logged| logged == name) {
            return Err(inconsistent(
                kind,
                format!("execution order is not a subsequence of the log order (at '{}')", name),
            ));
        }
    }

    Ok(KindModules {
        modules: definition.modules,
        index,
        execution_order: definition.execution_order,
        log_order: definition.log_order,
    })
}
