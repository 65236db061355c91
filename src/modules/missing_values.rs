//! Missing value detection and replacement.

use super::{parse_params, InferModule, SampleModule, TransformModule, TransformOutput};
use crate::table::Table;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Values commonly used to mean "no value", compared case-insensitively
const MISSING_TOKENS: &[&str] = &[
    "na", "n/a", "n.a.", "nan", "null", "none", "nil", "-", "--", "?", "nr", "nc", "nd", "n.c.",
    "inconnu", "non renseigne", "non renseigné", "#n/a", "missing", "unknown",
];

/// Parameters shared by the three modules: missing tokens per column
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MissingValuesConfig {
    #[serde(default)]
    pub columns: BTreeMap<String, Vec<String>>,
}

fn is_missing_token(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return false;
    }
    let lowered = trimmed.to_lowercase();
    MISSING_TOKENS.contains(&lowered.as_str())
}

/// Finds, for every column, the distinct values that look like missing value tokens
pub struct InferMissingValues;

impl InferModule for InferMissingValues {
    fn infer(&self, table: &Table, _params: &Value) -> anyhow::Result<Value> {
        let mut columns = BTreeMap::new();
        for (idx, name) in table.columns.iter().enumerate() {
            let found: BTreeSet<String> = table
                .column_values(idx)
                .filter(|v| is_missing_token(v))
                .map(|v| v.to_string())
                .collect();
            if !found.is_empty() {
                columns.insert(name.clone(), found.into_iter().collect());
            }
        }
        Ok(serde_json::to_value(MissingValuesConfig { columns })?)
    }
}

/// Blanks every cell whose value is a configured missing token of its column
pub struct ReplaceMissingValues;

impl TransformModule for ReplaceMissingValues {
    fn apply(&self, table: &Table, params: &Value) -> anyhow::Result<TransformOutput> {
        let config: MissingValuesConfig = parse_params(params)?;
        let targets: Vec<(usize, &Vec<String>)> = config
            .columns
            .iter()
            .filter_map(|(name, tokens)| table.column_index(name).map(|idx| (idx, tokens)))
            .collect();

        let mut replaced: BTreeMap<String, usize> = BTreeMap::new();
        let mut out = table.clone();
        for row in out.rows.iter_mut() {
            for &(idx, tokens) in &targets {
                if let Some(cell) = row.get_mut(idx) {
                    if tokens.iter().any(|t| t == cell) {
                        cell.clear();
                        *replaced.entry(table.columns[idx].clone()).or_default() += 1;
                    }
                }
            }
        }

        Ok(TransformOutput {
            table: out,
            details: json!({ "replaced": replaced }),
        })
    }
}

/// Rows holding at least one missing token
pub struct SampleMissingValues;

impl SampleModule for SampleMissingValues {
    fn sample(&self, table: &Table, params: &Value) -> anyhow::Result<Vec<usize>> {
        let config: MissingValuesConfig = parse_params(params)?;
        let targets: Vec<(usize, Option<&Vec<String>>)> = if config.columns.is_empty() {
            (0..table.columns.len()).map(|i| (i, None)).collect()
        } else {
            config
                .columns
                .iter()
                .filter_map(|(name, tokens)| table.column_index(name).map(|i| (i, Some(tokens))))
                .collect()
        };

        let rows = table
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| {
                targets.iter().any(|&(idx, tokens)| {
                    let cell = row.get(idx).map(String::as_str).unwrap_or("");
                    match tokens {
                        Some(tokens) => tokens.iter().any(|t| t == cell),
                        None => is_missing_token(cell),
                    }
                })
            })
            .map(|(i, _)| i)
            .collect();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Table {
        Table::new(
            vec!["name".into(), "city".into()],
            vec![
                vec!["Alice".into(), "Paris".into()],
                vec!["N/A".into(), "Lyon".into()],
                vec!["Bob".into(), "-".into()],
                vec!["Carol".into(), "".into()],
            ],
        )
    }

    #[test]
    fn test_infer_finds_tokens_per_column() {
        let result = InferMissingValues.infer(&table(), &Value::Null).unwrap();
        assert_eq!(result["columns"]["name"], json!(["N/A"]));
        assert_eq!(result["columns"]["city"], json!(["-"]));
    }

    #[test]
    fn test_replace_uses_inferred_config() {
        let config = InferMissingValues.infer(&table(), &Value::Null).unwrap();
        let out = ReplaceMissingValues.apply(&table(), &config).unwrap();
        assert_eq!(out.table.rows[1][0], "");
        assert_eq!(out.table.rows[2][1], "");
        assert_eq!(out.table.rows[0], vec!["Alice", "Paris"]);
        assert_eq!(out.details["replaced"]["name"], 1);
    }

    #[test]
    fn test_replace_rejects_malformed_params() {
        assert!(ReplaceMissingValues
            .apply(&table(), &json!({"columns": "oops"}))
            .is_err());
    }

    #[test]
    fn test_sample_rows_with_missing_values() {
        assert_eq!(SampleMissingValues.sample(&table(), &Value::Null).unwrap(), vec![1, 2]);
        let only_city = json!({"columns": {"city": ["-"]}});
        assert_eq!(SampleMissingValues.sample(&table(), &only_city).unwrap(), vec![2]);
    }
}
