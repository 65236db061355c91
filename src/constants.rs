/// Module and file name constants shared across the pipeline.
/// The registry, the engine and the CLI must agree on these names.

// Normalize project modules
pub const INIT: &str = "INIT";
pub const ADD_SELECTED_COLUMNS: &str = "add_selected_columns";
pub const REPLACE_MVS: &str = "replace_mvs";
pub const NORMALIZE_VALUES: &str = "normalizeValues";
pub const CONCAT_WITH_INIT: &str = "concat_with_init";
pub const INFER_MVS: &str = "infer_mvs";
pub const INFER_TYPES: &str = "inferTypes";
pub const SAMPLE_MVS: &str = "sample_mvs";
pub const SAMPLE_TYPES: &str = "sample_types";

// Link project modules
pub const UPLOAD_ES_TRAIN: &str = "upload_es_train";
pub const ES_LINKER: &str = "es_linker";
pub const RESULTS_ANALYSIS: &str = "results_analysis";
pub const INFER_RESTRICTION: &str = "infer_restriction";
pub const PERFORM_RESTRICTION: &str = "perform_restriction";
pub const UPDATE_RESULTS: &str = "update_results";

// Documents
pub const METADATA_FILE: &str = "metadata.json";
pub const INFERRED_CONFIG: &str = "inferred_config.json";
pub const RUN_INFO_SUFFIX: &str = "__run_info.json";
pub const COLUMN_MATCHES: &str = "column_matches.json";
pub const LABELLER: &str = "labeller.json";

/// Prefix of the reduced sample copy of an uploaded file
pub const MINI_PREFIX: &str = "MINI__";

/// Suffix given to transformed columns when joined back with the original table
pub const NORMALIZED_SUFFIX: &str = "__NORMALIZED";

/// Prefix of the restricted reference inside a link project
pub const REFERENCE_PREFIX: &str = "REF__";

/// Suffix given to reference columns in link output
pub const REF_SUFFIX: &str = "__REF";

/// Characters replaced by '_' in uploaded headers
pub const CHARS_TO_REPLACE: [char; 8] = [' ', ',', '.', '(', ')', '\'', '"', '/'];

pub const SUPPORTED_EXTENSIONS: [&str; 3] = ["csv", "xls", "xlsx"];

pub const DEFAULT_CHUNK_SIZE: usize = 10_000;
pub const DEFAULT_LOCK_RETRIES: u32 = 10;
pub const DEFAULT_LOCK_INTERVAL_MS: u64 = 100;

/// Name of the run info document for a given file
pub fn run_info_name(file_name: &str) -> String {
    format!("{}{}", file_name, RUN_INFO_SUFFIX)
}

/// Name of the sample copy for a given file (idempotent)
pub fn mini_name(file_name: &str) -> String {
    if file_name.starts_with(MINI_PREFIX) {
        file_name.to_string()
    } else {
        format!("{}{}", MINI_PREFIX, file_name)
    }
}

/// Strip the sample prefix, if any
pub fn full_name(file_name: &str) -> &str {
    file_name.strip_prefix(MINI_PREFIX).unwrap_or(file_name)
}

/// Name under which a link project stores its restricted reference
pub fn reference_name(file_name: &str) -> String {
    format!("{}{}", REFERENCE_PREFIX, full_name(file_name))
}
