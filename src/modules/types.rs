//! Column type inference and value normalization.

use super::{parse_params, InferModule, SampleModule, TransformModule, TransformOutput};
use crate::table::Table;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

static INTEGER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[+-]?(?:\d+|\d{1,3}(?:[ \u{a0}\u{202f}]\d{3})+)$").expect("valid integer pattern"));
static FLOAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[+-]?\d+(?:[.,]\d+)?(?:[eE][+-]?\d+)?$").expect("valid float pattern"));
static DAY_FIRST_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,2})[/.-](\d{1,2})[/.-](\d{4})$").expect("valid date pattern"));
static ISO_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("valid iso date pattern"));
static EMAIL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("valid email pattern"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace pattern"));

/// Share of non-empty values that must match a type for it to be chosen
const DEFAULT_THRESHOLD: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Float,
    Date,
    Email,
    Text,
}

impl ColumnType {
    /// Candidates in the order they are tried
    const CANDIDATES: [ColumnType; 4] = [ColumnType::Integer, ColumnType::Float, ColumnType::Date, ColumnType::Email];

    pub fn matches(&self, value: &str) -> bool {
        let value = value.trim();
        match self {
            ColumnType::Integer => INTEGER.is_match(value),
            ColumnType::Float => FLOAT.is_match(value),
            ColumnType::Date => DAY_FIRST_DATE.is_match(value) || ISO_DATE.is_match(value),
            ColumnType::Email => EMAIL.is_match(value),
            ColumnType::Text => true,
        }
    }

    /// Canonical form of a value; values that do not match are trimmed only
    pub fn normalize(&self, value: &str) -> String {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return String::new();
        }
        match self {
            ColumnType::Integer if self.matches(trimmed) => trimmed
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect(),
            ColumnType::Float if self.matches(trimmed) => trimmed.replace(',', "."),
            ColumnType::Date => normalize_date(trimmed).unwrap_or_else(|| trimmed.to_string()),
            ColumnType::Email => trimmed.to_lowercase(),
            ColumnType::Text => WHITESPACE.replace_all(trimmed, " ").into_owned(),
            _ => trimmed.to_string(),
        }
    }
}

fn normalize_date(value: &str) -> Option<String> {
    if ISO_DATE.is_match(value) {
        return Some(value.to_string());
    }
    let captures = DAY_FIRST_DATE.captures(value)?;
    let day: u32 = captures.get(1)?.as_str().parse().ok()?;
    let month: u32 = captures.get(2)?.as_str().parse().ok()?;
    let year: i32 = captures.get(3)?.as_str().parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day).map(|d| d.format("%Y-%m-%d").to_string())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InferTypesParams {
    #[serde(default)]
    pub threshold: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypesConfig {
    #[serde(default)]
    pub column_types: BTreeMap<String, ColumnType>,
}

/// Picks, for each column, the first type matched by enough non-empty values
pub struct InferTypes;

impl InferModule for InferTypes {
    fn infer(&self, table: &Table, params: &Value) -> anyhow::Result<Value> {
        let params: InferTypesParams = parse_params(params)?;
        let threshold = params.threshold.unwrap_or(DEFAULT_THRESHOLD);
        if !(0.0..=1.0).contains(&threshold) {
            anyhow::bail!("threshold must be between 0 and 1, got {}", threshold);
        }

        let mut column_types = BTreeMap::new();
        for (idx, name) in table.columns.iter().enumerate() {
            let values: Vec<&str> = table.column_values(idx).filter(|v| !v.trim().is_empty()).collect();
            let column_type = if values.is_empty() {
                ColumnType::Text
            } else {
                ColumnType::CANDIDATES
                    .iter()
                    .copied()
                    .find(|t| {
                        let hits = values.iter().filter(|v| t.matches(v)).count();
                        hits as f64 / values.len() as f64 >= threshold
                    })
                    .unwrap_or(ColumnType::Text)
            };
            column_types.insert(name.clone(), column_type);
        }
        Ok(serde_json::to_value(TypesConfig { column_types })?)
    }
}

/// Rewrites values into the canonical form of their column type
pub struct NormalizeValues;

impl TransformModule for NormalizeValues {
    fn apply(&self, table: &Table, params: &Value) -> anyhow::Result<TransformOutput> {
        let config: TypesConfig = parse_params(params)?;
        let targets: Vec<(usize, ColumnType)> = config
            .column_types
            .iter()
            .filter_map(|(name, t)| table.column_index(name).map(|idx| (idx, *t)))
            .collect();

        let mut changed: BTreeMap<String, usize> = BTreeMap::new();
        let mut out = table.clone();
        for row in out.rows.iter_mut() {
            for &(idx, column_type) in &targets {
                if let Some(cell) = row.get_mut(idx) {
                    let normalized = column_type.normalize(cell);
                    if normalized != *cell {
                        *cell = normalized;
                        *changed.entry(table.columns[idx].clone()).or_default() += 1;
                    }
                }
            }
        }
        Ok(TransformOutput {
            table: out,
            details: json!({ "changed": changed }),
        })
    }
}

/// Rows with a non-empty value that does not match its column's type
pub struct SampleTypes;

impl SampleModule for SampleTypes {
    fn sample(&self, table: &Table, params: &Value) -> anyhow::Result<Vec<usize>> {
        let config: TypesConfig = parse_params(params)?;
        let targets: Vec<(usize, ColumnType)> = config
            .column_types
            .iter()
            .filter(|(_, t)| **t != ColumnType::Text)
            .filter_map(|(name, t)| table.column_index(name).map(|idx| (idx, *t)))
            .collect();
        Ok(table
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| {
                targets.iter().any(|&(idx, t)| {
                    let cell = row.get(idx).map(String::as_str).unwrap_or("");
                    !cell.trim().is_empty() && !t.matches(cell)
                })
            })
            .map(|(i, _)| i)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Table {
        Table::new(
            vec!["id".into(), "amount".into(), "born".into(), "mail".into(), "label".into()],
            vec![
                vec!["1".into(), "3,5".into(), "01/02/1990".into(), "A@B.fr".into(), "  a   b ".into()],
                vec!["2".into(), "4.25".into(), "1991-03-04".into(), "c@d.com".into(), "c".into()],
                vec!["12 000".into(), "7".into(), "31/12/1999".into(), "e@f.org".into(), "".into()],
            ],
        )
    }

    #[test]
    fn test_infer_types() {
        let result = InferTypes.infer(&table(), &Value::Null).unwrap();
        let types = &result["column_types"];
        assert_eq!(types["id"], "integer");
        assert_eq!(types["amount"], "float");
        assert_eq!(types["born"], "date");
        assert_eq!(types["mail"], "email");
        assert_eq!(types["label"], "text");
    }

    #[test]
    fn test_infer_types_rejects_bad_threshold() {
        assert!(InferTypes.infer(&table(), &json!({"threshold": 2.0})).is_err());
    }

    #[test]
    fn test_normalize_values() {
        let config = InferTypes.infer(&table(), &Value::Null).unwrap();
        let out = NormalizeValues.apply(&table(), &config).unwrap();
        assert_eq!(out.table.rows[0], vec!["1", "3.5", "1990-02-01", "a@b.fr", "a b"]);
        assert_eq!(out.table.rows[2][0], "12000");
        assert_eq!(out.table.rows[2][2], "1999-12-31");
        assert_eq!(out.details["changed"]["born"], 2);
    }

    #[test]
    fn test_invalid_date_is_kept() {
        assert_eq!(ColumnType::Date.normalize("31/02/2001"), "31/02/2001");
    }

    #[test]
    fn test_sample_types_finds_mismatches() {
        let config = json!({"column_types": {"id": "integer", "label": "text"}});
        let mut t = table();
        t.rows[1][0] = "two".into();
        assert_eq!(SampleTypes.sample(&t, &config).unwrap(), vec![1]);
    }
}
