//! Two-tier watermark scoring.
//!
//! Observations at or above the high watermark fall into the high tier, those
//! between the low and high watermark into the medium tier. Each tier deducts
//! `(mean(tier) - watermark) / unit * per_unit_deduction`, capped at the
//! tier's maximum deduction. An empty tier deducts nothing.

use super::error::Result;
use super::models::{ItemConfig, MAX_SCORE, MIN_SCORE};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Normal,
    Medium,
    High,
}

pub fn classify(value: f64, config: &ItemConfig) -> Tier {
    if value >= config.high_watermark {
        Tier::High
    } else if value >= config.low_watermark {
        Tier::Medium
    } else {
        Tier::Normal
    }
}

/// Deduction of one tier. `count == 0` yields zero rather than a NaN mean.
pub fn tier_deduction(
    sum: f64,
    count: usize,
    watermark: f64,
    unit: f64,
    per_unit: f64,
    max: f64,
) -> f64 {
    if count == 0 {
        return 0.0;
    }
    let mean = sum / count as f64;
    ((mean - watermark) / unit * per_unit).clamp(0.0, max)
}

/// Turns the two tier deductions into a score in `[0, 100]`.
pub fn score_from_deductions(high: f64, medium: f64) -> i32 {
    let score = f64::from(MAX_SCORE) - high - medium;
    (score as i32).clamp(MIN_SCORE, MAX_SCORE)
}

#[derive(Debug, Default)]
struct TierAccumulator {
    high_sum: f64,
    high_count: usize,
    medium_sum: f64,
    medium_count: usize,
}

impl TierAccumulator {
    fn add(&mut self, value: f64, config: &ItemConfig) -> Tier {
        let tier = classify(value, config);
        match tier {
            Tier::High => {
                self.high_sum += value;
                self.high_count += 1;
            }
            Tier::Medium => {
                self.medium_sum += value;
                self.medium_count += 1;
            }
            Tier::Normal => {}
        }
        tier
    }

    fn score(&self, config: &ItemConfig) -> i32 {
        let high = tier_deduction(
            self.high_sum,
            self.high_count,
            config.high_watermark,
            config.unit,
            config.score_deduction_per_unit_high,
            config.max_score_deduction_high,
        );
        let medium = tier_deduction(
            self.medium_sum,
            self.medium_count,
            config.low_watermark,
            config.unit,
            config.score_deduction_per_unit_medium,
            config.max_score_deduction_medium,
        );
        score_from_deductions(high, medium)
    }
}

/// Score of a plain list of values.
pub fn score_values(values: impl IntoIterator<Item = f64>, config: &ItemConfig) -> i32 {
    let mut acc = TierAccumulator::default();
    for value in values {
        acc.add(value, config);
    }
    acc.score(config)
}

/// Score plus the serialized full dataset and high-tier subset of one dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredItem {
    pub score: i32,
    pub data: String,
    pub high: String,
}

/// Scores `observations` using `value_of` to extract the watermarked value.
pub fn score_observations<T, F>(
    observations: &[T],
    config: &ItemConfig,
    value_of: F,
) -> Result<ScoredItem>
where
    T: Serialize,
    F: Fn(&T) -> f64,
{
    let mut acc = TierAccumulator::default();
    let mut high = Vec::new();
    for observation in observations {
        if acc.add(value_of(observation), config) == Tier::High {
            high.push(observation);
        }
    }

    Ok(ScoredItem {
        score: acc.score(config),
        data: serde_json::to_string(observations)?,
        high: serde_json::to_string(&high)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::healthcheck::models::PrometheusData;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn config() -> ItemConfig {
        ItemConfig::new("cpu_usage", 10, 60.0, 80.0, 10.0, 5.0, 40.0, 2.0, 20.0)
    }

    #[test]
    fn test_no_medium_or_high_observations_scores_100() {
        assert_eq!(score_values(vec![], &config()), 100);
        assert_eq!(score_values(vec![1.0, 20.0, 59.9], &config()), 100);
    }

    #[test]
    fn test_high_tier_deduction_example() {
        // highWatermark=80, unit=10, per unit=5, max=40, V=100 -> deduction 10
        assert_eq!(score_values(vec![100.0, 100.0, 100.0], &config()), 90);
        assert_relative_eq!(tier_deduction(300.0, 3, 80.0, 10.0, 5.0, 40.0), 10.0);
    }

    #[test]
    fn test_medium_tier_uses_low_watermark() {
        // mean(70) - 60 = 10 -> 1 unit * 2
        assert_eq!(score_values(vec![65.0, 75.0, 10.0], &config()), 98);
    }

    #[test]
    fn test_deductions_are_capped() {
        // (1000 - 80) / 10 * 5 = 460 -> capped at 40; medium (79 - 60) / 10 * 2 = 3.8
        assert_eq!(score_values(vec![1000.0, 79.0], &config()), 56);
    }

    #[test]
    fn test_score_is_clamped_at_zero() {
        let harsh = ItemConfig::new("io_util", 10, 1.0, 2.0, 1.0, 100.0, 100.0, 100.0, 100.0);
        assert_eq!(score_values(vec![50.0, 1.5], &harsh), 0);
    }

    #[test]
    fn test_empty_tier_deduction_is_zero() {
        let deduction = tier_deduction(0.0, 0, 80.0, 10.0, 5.0, 40.0);
        assert_eq!(deduction, 0.0);
        assert!(deduction.is_finite());
    }

    #[test]
    fn test_score_observations_serializes_full_and_high_sets() {
        let datas = vec![
            PrometheusData::new("1", 10.0),
            PrometheusData::new("2", 85.0),
            PrometheusData::new("3", 70.0),
            PrometheusData::new("4", 95.0),
        ];
        let scored = score_observations(&datas, &config(), |d| d.value).unwrap();

        let full: Vec<PrometheusData> = serde_json::from_str(&scored.data).unwrap();
        assert_eq!(full, datas);
        let high: Vec<PrometheusData> = serde_json::from_str(&scored.high).unwrap();
        assert_eq!(high, vec![datas[1].clone(), datas[3].clone()]);
        // high: (90 - 80) / 10 * 5 = 5, medium: (70 - 60) / 10 * 2 = 2
        assert_eq!(scored.score, 93);
    }

    #[test]
    fn test_score_observations_on_empty_input() {
        let scored = score_observations::<PrometheusData, _>(&[], &config(), |d| d.value).unwrap();
        assert_eq!(scored.score, 100);
        assert_eq!(scored.data, "[]");
        assert_eq!(scored.high, "[]");
    }

    proptest! {
        #[test]
        fn prop_score_is_bounded(values in proptest::collection::vec(0.0f64..10_000.0, 0..50)) {
            let score = score_values(values, &config());
            prop_assert!((0..=100).contains(&score));
        }

        #[test]
        fn prop_score_non_increasing_in_high_mean(a in 80.0f64..1_000.0, delta in 0.0f64..1_000.0) {
            let lower = score_values(vec![a, a, a], &config());
            let higher = score_values(vec![a + delta, a + delta, a + delta], &config());
            prop_assert!(higher <= lower);
        }
    }
}
