//! Upload of user files into a normalize project.
//!
//! Whatever the input format, the stored `INIT` artifact is a UTF-8, comma
//! separated CSV with a cleaned header.

use crate::constants::{run_info_name, CHARS_TO_REPLACE, INFERRED_CONFIG, INIT, SUPPORTED_EXTENSIONS};
use crate::engine::{Pipeline, RunInfo};
use crate::error::{PipelineError, Result};
use crate::observability;
use crate::project::{ArtifactKey, ColumnTracker, FileEntry};
use crate::registry::{ModuleCategory, ProjectKind};
use crate::table::{duplicate_columns, Table};
use crate::tracker::LogTracker;
use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::borrow::Cow;
use std::io::Cursor;
use tracing::{debug, info, instrument};

static UNSAFE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9_.-]").expect("valid file name pattern"));

const SEPARATORS: [u8; 3] = [b',', b';', b'\t'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Csv,
    Excel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Windows1252,
}

impl TextEncoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Windows1252 => "windows-1252",
        }
    }

    fn decode<'a>(&self, bytes: &'a [u8]) -> Option<Cow<'a, str>> {
        match self {
            TextEncoding::Utf8 => {
                let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
                std::str::from_utf8(bytes).ok().map(Cow::Borrowed)
            }
            TextEncoding::Windows1252 => encoding_rs::WINDOWS_1252.decode_without_bom_handling_and_without_replacement(bytes),
        }
    }
}

/// What the upload detected and stored; also written as `INIT/inferred_config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadReport {
    pub file_name: String,
    pub og_file_name: String,
    pub file_type: FileType,
    pub sep: Option<String>,
    pub encoding: Option<String>,
    pub ncols: usize,
    pub nrows: usize,
}

/// A table decoded from user bytes
#[derive(Debug, Clone)]
pub struct DetectedTable {
    pub table: Table,
    pub sep: Option<u8>,
    pub encoding: Option<TextEncoding>,
}

/// Sanitized `.csv` name for an uploaded file, plus its declared extension
pub fn sanitize_file_name(og_file_name: &str) -> Result<(String, String)> {
    let base = og_file_name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or(og_file_name);
    let extension = base
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();
    if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(PipelineError::UnsupportedFileType(og_file_name.to_string()));
    }

    let stem = base.split('.').next().unwrap_or("");
    let joined = stem.split_whitespace().collect::<Vec<_>>().join("_");
    let cleaned = UNSAFE_CHARS.replace_all(&joined, "");
    let cleaned = cleaned.trim_matches(|c| c == '.' || c == '_');
    if cleaned.is_empty() {
        return Err(PipelineError::InvalidArgument(format!(
            "'{}' does not contain a usable file name",
            og_file_name
        )));
    }
    Ok((format!("{}.csv", cleaned), extension))
}

/// Try every encoding and separator in order; keep the first plausible parse
pub fn detect_csv(bytes: &[u8]) -> Result<DetectedTable> {
    for encoding in [TextEncoding::Utf8, TextEncoding::Windows1252] {
        let Some(text) = encoding.decode(bytes) else {
            debug!("Input is not valid {}", encoding.as_str());
            continue;
        };
        for sep in SEPARATORS {
            if let Some(table) = parse_with(&text, sep) {
                debug!("Detected separator {:?} and encoding {}", sep as char, encoding.as_str());
                return Ok(DetectedTable {
                    table,
                    sep: Some(sep),
                    encoding: Some(encoding),
                });
            }
        }
    }
    Err(PipelineError::UndetectableFormat)
}

fn parse_with(text: &str, sep: u8) -> Option<Table> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(sep)
        .has_headers(true)
        .flexible(false)
        .from_reader(text.as_bytes());
    let columns: Vec<String> = reader.headers().ok()?.iter().map(|h| h.to_string()).collect();
    if columns.is_empty() {
        return None;
    }
    // A single column is only believable if no other separator shows up in the header
    if columns.len() == 1 {
        let header_line = text.lines().next().unwrap_or("");
        if SEPARATORS.iter().any(|&other| other != sep && header_line.contains(other as char)) {
            return None;
        }
    }
    let mut rows = Vec::new();
    for record in reader.records() {
        rows.push(record.ok()?.iter().map(|v| v.to_string()).collect());
    }
    Some(Table::new(columns, rows))
}

/// Read the first worksheet of an Excel workbook
pub fn read_excel(bytes: &[u8]) -> Result<DetectedTable> {
    use calamine::Reader;

    let mut workbook = calamine::open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| PipelineError::Excel(e.to_string()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| PipelineError::Excel("workbook has no worksheet".into()))?
        .map_err(|e| PipelineError::Excel(e.to_string()))?;

    let mut rows = range.rows();
    let columns: Vec<String> = rows
        .next()
        .ok_or_else(|| PipelineError::Excel("first worksheet is empty".into()))?
        .iter()
        .map(|cell| cell.to_string())
        .collect();
    let rows = rows
        .map(|row| row.iter().map(|cell| cell.to_string()).collect())
        .collect();
    Ok(DetectedTable {
        table: Table::new(columns, rows),
        sep: None,
        encoding: None,
    })
}

/// Replace characters that are awkward in column names by `_`
pub fn clean_header(columns: &[String]) -> Vec<String> {
    columns
        .iter()
        .map(|c| {
            c.trim()
                .chars()
                .map(|ch| if CHARS_TO_REPLACE.contains(&ch) { '_' } else { ch })
                .collect()
        })
        .collect()
}

impl Pipeline {
    /// Store an uploaded file as `INIT/<sanitized name>.csv`
    #[instrument(skip(self, bytes), fields(project = %self.project.id(), size = bytes.len()))]
    pub fn upload(&mut self, og_file_name: &str, bytes: &[u8]) -> Result<UploadReport> {
        if self.kind() != ProjectKind::Normalize {
            return Err(PipelineError::InvalidArgument("files can only be uploaded to normalize projects".into()));
        }
        let (file_name, extension) = sanitize_file_name(og_file_name)?;
        if !self.project.uploaded_files().is_empty() {
            return Err(PipelineError::FileAlreadyUploaded(file_name));
        }

        let (file_type, mut detected) = if extension == "csv" {
            (FileType::Csv, detect_csv(bytes)?)
        } else {
            (FileType::Excel, read_excel(bytes)?)
        };
        detected.table.columns = clean_header(&detected.table.columns);
        let duplicates = duplicate_columns(&detected.table.columns);
        if !duplicates.is_empty() {
            return Err(PipelineError::DuplicateColumns(duplicates));
        }

        let columns = detected.table.columns.clone();
        let run = LogTracker::begin(INIT, ModuleCategory::Transform, &file_name);
        let written = match self.project.store().write_table(
            INIT,
            &file_name,
            &columns,
            detected.table.into_batches(self.chunk_size).into_iter().map(Ok),
        ) {
            Ok(written) => written,
            Err(e) => {
                self.log().end(run, true);
                self.save_after_failure();
                return Err(e);
            }
        };

        let log_order = self.log_order();
        self.log().reset_file(&file_name, &log_order);
        let record = self.log().end(run, false);
        self.log().mark_written(&file_name, INIT)?;

        let report = UploadReport {
            file_name: file_name.clone(),
            og_file_name: og_file_name.to_string(),
            file_type,
            sep: detected.sep.map(|s| (s as char).to_string()),
            encoding: detected.encoding.map(|e| e.as_str().to_string()),
            ncols: columns.len(),
            nrows: written.row_count,
        };
        let run_info = RunInfo {
            module_name: INIT.to_string(),
            file_name: file_name.clone(),
            params: json!({ "file_type": report.file_type, "sep": report.sep, "encoding": report.encoding }),
            start_timestamp: record.start_timestamp.unwrap_or_else(Utc::now),
            end_timestamp: record.end_timestamp.unwrap_or_else(Utc::now),
            details: json!({ "ncols": report.ncols, "nrows": report.nrows, "sha256": written.sha256 }),
        };
        self.project.store().write_json(INIT, &run_info_name(&file_name), &run_info)?;
        self.project.store().write_json(INIT, INFERRED_CONFIG, &report)?;

        self.project.metadata.files.insert(
            file_name.clone(),
            FileEntry {
                og_file_name: og_file_name.to_string(),
                upload_time: Utc::now(),
                is_mini: false,
            },
        );
        if self.project.metadata.column_tracker.is_none() {
            self.project.metadata.column_tracker = Some(ColumnTracker {
                original: columns.clone(),
                selected: columns.clone(),
                created: Vec::new(),
            });
        }
        self.project.metadata.last_written = Some(ArtifactKey::new(INIT, &file_name));
        self.project.save()?;

        observability::store::committed(INIT, written.row_count);
        info!(
            "Uploaded {} as {} ({} rows, {} columns)",
            og_file_name, file_name, report.nrows, report.ncols
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(
            sanitize_file_name("My Data (2017).xlsx").unwrap(),
            ("My_Data_2017.csv".to_string(), "xlsx".to_string())
        );
        assert_eq!(sanitize_file_name("../etc/a.CSV").unwrap().0, "a.csv");
        assert!(matches!(
            sanitize_file_name("a.txt"),
            Err(PipelineError::UnsupportedFileType(_))
        ));
        assert!(sanitize_file_name("noextension").is_err());
    }

    #[test]
    fn test_detect_semicolon_separator() {
        let detected = detect_csv(b"a;b;c\n1;2;3\n4;5;6\n").unwrap();
        assert_eq!(detected.sep, Some(b';'));
        assert_eq!(detected.table.columns, vec!["a", "b", "c"]);
        assert_eq!(detected.table.len(), 2);
    }

    #[test]
    fn test_detect_windows_1252() {
        // "é" in windows-1252 is a lone 0xE9, invalid in utf-8
        let detected = detect_csv(b"nom,ville\nRen\xE9,Paris\n").unwrap();
        assert_eq!(detected.encoding, Some(TextEncoding::Windows1252));
        assert_eq!(detected.table.rows[0][0], "René");
    }

    #[test]
    fn test_single_column_only_without_other_separators() {
        let detected = detect_csv(b"name\nalice\nbob\n").unwrap();
        assert_eq!(detected.table.columns, vec!["name"]);
        // tab separated: the comma pass gives one column but a tab is in the header
        let detected = detect_csv(b"a\tb\n1\t2\n").unwrap();
        assert_eq!(detected.sep, Some(b'\t'));
    }

    #[test]
    fn test_inconsistent_rows_are_undetectable() {
        let result = detect_csv(b"a,b\n1,2,3\n4\n");
        assert!(matches!(result, Err(PipelineError::UndetectableFormat)));
    }

    #[test]
    fn test_clean_header() {
        let cleaned = clean_header(&["first name".to_string(), "a.b/c".to_string(), "(x)".to_string()]);
        assert_eq!(cleaned, vec!["first_name", "a_b_c", "_x_"]);
    }
}
