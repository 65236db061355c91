use super::{parse_params, InferModule};
use crate::linking::{Label, CONFIDENCE_COLUMN, ID_REF_COLUMN, IS_MATCH_COLUMN};
use crate::table::Table;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AnalysisParams {
    /// Labels the proposed matches are checked against
    #[serde(default)]
    pub labels: Vec<Label>,
}

/// Summary statistics of a link output table.
///
/// Precision is the share of labelled pairs the table proposes as matches
/// that the labels confirm; it is null when no proposed pair was labelled.
pub struct ResultsAnalysis;

impl InferModule for ResultsAnalysis {
    fn infer(&self, table: &Table, params: &Value) -> anyhow::Result<Value> {
        let params: AnalysisParams = parse_params(params)?;
        let is_match = table
            .column_index(IS_MATCH_COLUMN)
            .ok_or_else(|| anyhow::anyhow!("table has no {} column; run the linker first", IS_MATCH_COLUMN))?;
        let confidence = table.column_index(CONFIDENCE_COLUMN);

        let num_rows = table.len();
        let mut num_match = 0usize;
        let mut confidence_sum = 0.0;
        for row in &table.rows {
            if row.get(is_match).map(|v| v == "true").unwrap_or(false) {
                num_match += 1;
                confidence_sum += confidence
                    .and_then(|i| row.get(i))
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(0.0);
            }
        }

        let id_ref = table.column_index(ID_REF_COLUMN);
        let mut num_verif_samples = 0usize;
        let mut num_correct = 0usize;
        for label in &params.labels {
            let Some(row) = table.rows.get(label.source_row) else {
                continue;
            };
            let proposed = row.get(is_match).map(|v| v == "true").unwrap_or(false)
                && id_ref.and_then(|i| row.get(i)) == Some(&label.ref_row.to_string());
            if proposed {
                num_verif_samples += 1;
                if label.is_match {
                    num_correct += 1;
                }
            }
        }
        let precision = if num_verif_samples == 0 {
            Value::Null
        } else {
            json!(num_correct as f64 / num_verif_samples as f64)
        };

        let perc_match = if num_rows == 0 { 0.0 } else { 100.0 * num_match as f64 / num_rows as f64 };
        let mean_confidence = if num_match == 0 { Value::Null } else { json!(confidence_sum / num_match as f64) };
        Ok(json!({
            "num_rows": num_rows,
            "num_match": num_match,
            "perc_match": perc_match,
            "mean_confidence": mean_confidence,
            "num_verif_samples": num_verif_samples,
            "precision": precision,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_results_analysis() {
        let table = Table::new(
            vec!["name".into(), IS_MATCH_COLUMN.into(), CONFIDENCE_COLUMN.into()],
            vec![
                vec!["a".into(), "true".into(), "0.8".into()],
                vec!["b".into(), "false".into(), "0.1".into()],
                vec!["c".into(), "true".into(), "0.6".into()],
                vec!["d".into(), "false".into(), "".into()],
            ],
        );
        let result = ResultsAnalysis.infer(&table, &Value::Null).unwrap();
        assert_eq!(result["num_rows"], 4);
        assert_eq!(result["num_match"], 2);
        assert_eq!(result["perc_match"], 50.0);
        assert!((result["mean_confidence"].as_f64().unwrap() - 0.7).abs() < 1e-9);
        assert_eq!(result["num_verif_samples"], 0);
        assert!(result["precision"].is_null());
    }

    #[test]
    fn test_precision_against_labels() {
        let table = Table::new(
            vec!["name".into(), ID_REF_COLUMN.into(), IS_MATCH_COLUMN.into()],
            vec![
                vec!["a".into(), "3".into(), "true".into()],
                vec!["b".into(), "5".into(), "true".into()],
                vec!["c".into(), "".into(), "false".into()],
                vec!["d".into(), "7".into(), "true".into()],
            ],
        );
        let params = json!({"labels": [
            {"source_row": 0, "ref_row": 3, "is_match": true},
            {"source_row": 1, "ref_row": 5, "is_match": false},
            // Not the proposed pair, so it says nothing about precision
            {"source_row": 3, "ref_row": 8, "is_match": true},
            {"source_row": 2, "ref_row": 1, "is_match": true},
            {"source_row": 40, "ref_row": 1, "is_match": true},
        ]});
        let result = ResultsAnalysis.infer(&table, &params).unwrap();
        assert_eq!(result["num_verif_samples"], 2);
        assert_eq!(result["precision"], 0.5);
    }

    #[test]
    fn test_requires_link_output() {
        let table = Table::new(vec!["name".into()], vec![]);
        assert!(ResultsAnalysis.infer(&table, &Value::Null).is_err());
    }
}
