use super::{Candidate, MatchDecision, Matcher, TrainingPair};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

const DEFAULT_THRESHOLD: f64 = 0.5;

/// Accepts the best candidate when its score reaches a threshold.
///
/// The threshold is taken from the parameters when given. Otherwise it is
/// placed where it best separates the labeled matches from the non-matches.
#[derive(Debug, Clone)]
pub struct ThresholdMatcher {
    threshold: f64,
}

impl Default for ThresholdMatcher {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct MatcherParams {
    #[serde(default)]
    threshold: Option<f64>,
}

impl ThresholdMatcher {
    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

impl Matcher for ThresholdMatcher {
    fn train(&mut self, pairs: &[TrainingPair], params: &Value) -> anyhow::Result<()> {
        let params: MatcherParams = crate::modules::parse_params(params)?;
        if let Some(threshold) = params.threshold {
            if !(0.0..=1.0).contains(&threshold) {
                anyhow::bail!("threshold must be between 0 and 1, got {}", threshold);
            }
            self.threshold = threshold;
            return Ok(());
        }
        if let Some(threshold) = calibrate(pairs) {
            self.threshold = threshold;
        }
        debug!("Threshold set to {:.3} from {} labels", self.threshold, pairs.len());
        Ok(())
    }

    fn decide(&self, candidates: &[Candidate]) -> MatchDecision {
        let Some(best) = candidates.first() else {
            return MatchDecision {
                candidate: None,
                confidence: 0.0,
            };
        };
        // Confidence drops when the runner-up is close
        let runner_up = candidates.get(1).map(|c| c.score).unwrap_or(0.0);
        let confidence = (best.score * (1.0 + best.score - runner_up) / 2.0).clamp(0.0, 1.0);
        MatchDecision {
            candidate: (best.score >= self.threshold).then_some(0),
            confidence,
        }
    }
}

/// Threshold with the fewest misclassified labels, ties going to the lowest
fn calibrate(pairs: &[TrainingPair]) -> Option<f64> {
    let has_match = pairs.iter().any(|p| p.is_match);
    if !has_match {
        return None;
    }
    let mut cuts: Vec<f64> = pairs.iter().map(|p| p.score).collect();
    cuts.sort_by(f64::total_cmp);
    cuts.dedup();

    let errors = |cut: f64| {
        pairs
            .iter()
            .filter(|p| (p.score >= cut) != p.is_match)
            .count()
    };
    cuts.into_iter()
        .map(|cut| (errors(cut), cut))
        .min_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)))
        .map(|(_, cut)| cut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pair(score: f64, is_match: bool) -> TrainingPair {
        TrainingPair { score, is_match }
    }

    #[test]
    fn test_explicit_threshold_wins() {
        let mut matcher = ThresholdMatcher::default();
        matcher.train(&[pair(0.9, true)], &json!({"threshold": 0.2})).unwrap();
        assert_eq!(matcher.threshold(), 0.2);
        assert!(matcher.train(&[], &json!({"threshold": 2.0})).is_err());
    }

    #[test]
    fn test_calibrates_from_labels() {
        let mut matcher = ThresholdMatcher::default();
        let pairs = [pair(0.9, true), pair(0.7, true), pair(0.4, false), pair(0.2, false)];
        matcher.train(&pairs, &Value::Null).unwrap();
        assert_eq!(matcher.threshold(), 0.7);
    }

    #[test]
    fn test_keeps_default_without_matches() {
        let mut matcher = ThresholdMatcher::default();
        matcher.train(&[pair(0.4, false)], &json!({"threshold": null})).unwrap();
        assert_eq!(matcher.threshold(), DEFAULT_THRESHOLD);
    }

    #[test]
    fn test_decide() {
        let matcher = ThresholdMatcher::default();
        assert_eq!(matcher.decide(&[]).candidate, None);

        let clear = matcher.decide(&[Candidate { row: 3, score: 0.9 }, Candidate { row: 1, score: 0.1 }]);
        assert_eq!(clear.candidate, Some(0));
        let close = matcher.decide(&[Candidate { row: 3, score: 0.9 }, Candidate { row: 1, score: 0.85 }]);
        assert!(close.confidence < clear.confidence);

        let weak = matcher.decide(&[Candidate { row: 0, score: 0.3 }]);
        assert_eq!(weak.candidate, None);
    }
}
