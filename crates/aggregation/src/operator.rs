//! Aggregation operators. Pure functions of the scores they are handed.

use promptloom_core::caller::AttributeValue;
use promptloom_core::spec::{AggregationOperator, AggregationRule};

/// Scores gathered for one rule source, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceScores {
    pub parameter_id: String,
    pub weight: f64,
    pub scores: Vec<f64>,
}

impl SourceScores {
    fn mean(&self) -> Option<f64> {
        if self.scores.is_empty() {
            return None;
        }
        Some(self.scores.iter().sum::<f64>() / self.scores.len() as f64)
    }
}

/// Collapse per-source scores into the rule's attribute value.
///
/// Each source is first reduced to its own mean, so a parameter scored
/// often does not outweigh one scored rarely. `mean` and `threshold` then
/// average the source means equally; `weighted_mean` uses the rule weights.
pub fn apply(rule: &AggregationRule, sources: &[SourceScores]) -> Result<AttributeValue, String> {
    let means = sources
        .iter()
        .map(|s| {
            s.mean()
                .map(|m| (m, s.weight))
                .ok_or_else(|| format!("no scores for '{}'", s.parameter_id))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if means.is_empty() {
        return Err("rule has no sources".into());
    }

    let plain_mean = means.iter().map(|(m, _)| m).sum::<f64>() / means.len() as f64;

    let value = match &rule.operator {
        AggregationOperator::Mean => AttributeValue::Number(plain_mean),
        AggregationOperator::WeightedMean => {
            let total: f64 = means.iter().map(|(_, w)| w).sum();
            if total <= 0.0 {
                return Err("weighted_mean needs a positive total weight".into());
            }
            AttributeValue::Number(means.iter().map(|(m, w)| m * w).sum::<f64>() / total)
        }
        AggregationOperator::Threshold {
            threshold,
            above,
            below,
        } => {
            let is_above = plain_mean >= *threshold;
            if above.is_none() && below.is_none() {
                AttributeValue::Boolean(is_above)
            } else if is_above {
                AttributeValue::String(above.clone().unwrap_or_else(|| "above".into()))
            } else {
                AttributeValue::String(below.clone().unwrap_or_else(|| "below".into()))
            }
        }
    };

    if let AttributeValue::Number(n) = value {
        if !n.is_finite() {
            return Err(format!("{} produced a non-finite value", rule.operator.name()));
        }
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use promptloom_core::spec::RuleSource;

    fn rule(operator: AggregationOperator, sources: &[(&str, f64)]) -> AggregationRule {
        AggregationRule {
            output_key: "readiness".into(),
            sources: sources
                .iter()
                .map(|(p, w)| RuleSource {
                    parameter_id: (*p).into(),
                    weight: *w,
                })
                .collect(),
            operator,
            min_scores: None,
            attribute_scope: "learner-profile".into(),
        }
    }

    fn src(parameter_id: &str, weight: f64, scores: &[f64]) -> SourceScores {
        SourceScores {
            parameter_id: parameter_id.into(),
            weight,
            scores: scores.to_vec(),
        }
    }

    fn number(v: AttributeValue) -> f64 {
        match v {
            AttributeValue::Number(n) => n,
            other => panic!("expected number, got {other:?}"),
        }
    }

    #[test]
    fn mean_averages_source_means() {
        let r = rule(AggregationOperator::Mean, &[("focus", 1.0), ("recall", 1.0)]);
        let v = apply(
            &r,
            &[src("focus", 1.0, &[0.2, 0.4, 0.6]), src("recall", 1.0, &[0.8])],
        )
        .unwrap();
        assert!((number(v) - 0.6).abs() < 1e-9);
    }

    #[test]
    fn weighted_mean_uses_weights() {
        let r = rule(AggregationOperator::WeightedMean, &[("a", 3.0), ("b", 1.0)]);
        let v = apply(&r, &[src("a", 3.0, &[1.0]), src("b", 1.0, &[0.0])]).unwrap();
        assert!((number(v) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn threshold_with_and_without_labels() {
        let labelled = rule(
            AggregationOperator::Threshold {
                threshold: 0.5,
                above: Some("ready".into()),
                below: Some("not-ready".into()),
            },
            &[("a", 1.0)],
        );
        assert_eq!(
            apply(&labelled, &[src("a", 1.0, &[0.5])]).unwrap(),
            AttributeValue::String("ready".into())
        );
        assert_eq!(
            apply(&labelled, &[src("a", 1.0, &[0.49])]).unwrap(),
            AttributeValue::String("not-ready".into())
        );

        let bare = rule(
            AggregationOperator::Threshold {
                threshold: 0.5,
                above: None,
                below: None,
            },
            &[("a", 1.0)],
        );
        assert_eq!(
            apply(&bare, &[src("a", 1.0, &[0.9])]).unwrap(),
            AttributeValue::Boolean(true)
        );
    }

    #[test]
    fn empty_source_is_an_error_not_zero() {
        let r = rule(AggregationOperator::Mean, &[("a", 1.0)]);
        assert!(apply(&r, &[src("a", 1.0, &[])]).is_err());
    }
}
