/// Scoring Aggregator
///
/// **Scoring Rules:**
/// - score = 100 * (sum of weights of passed verdicts) / (sum of all weights), two decimals
/// - total weight of zero: score is 0 and a warning is attached, nothing is divided
/// - passed-all iff every verdict passed, compile-failed iff the attempt short-circuited,
///   partial otherwise (including when everything failed)
use arbiter_common::types::{OverallStatus, TestCaseVerdict};

pub const EMPTY_SET_WARNING: &str = "no weighted test cases; score fixed at 0";

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub score: f64,
    pub total_weight: u64,
    pub passed_weight: u64,
    pub status: OverallStatus,
    pub warnings: Vec<String>,
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn aggregate(verdicts: &[TestCaseVerdict], short_circuited: bool) -> Aggregate {
    let total_weight: u64 = verdicts.iter().map(|v| u64::from(v.weight())).sum();
    let passed_weight: u64 = verdicts
        .iter()
        .filter(|v| v.passed())
        .map(|v| u64::from(v.weight()))
        .sum();

    let mut warnings = Vec::new();
    let score = if total_weight == 0 {
        warnings.push(EMPTY_SET_WARNING.to_string());
        0.0
    } else {
        round2(100.0 * passed_weight as f64 / total_weight as f64)
    };

    let status = if short_circuited {
        OverallStatus::CompileFailed
    } else if !verdicts.is_empty() && verdicts.iter().all(TestCaseVerdict::passed) {
        OverallStatus::PassedAll
    } else {
        OverallStatus::Partial
    };

    Aggregate {
        score,
        total_weight,
        passed_weight,
        status,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbiter_common::types::{HiddenVerdict, VerdictReason};

    fn verdict(test_id: u32, weight: u32, passed: bool) -> TestCaseVerdict {
        TestCaseVerdict::Hidden(HiddenVerdict {
            test_id,
            passed,
            reason: if passed { VerdictReason::Accepted } else { VerdictReason::WrongAnswer },
            weight,
        })
    }

    #[test]
    fn test_two_of_three_equal_weights() {
        let verdicts = vec![verdict(1, 1, true), verdict(2, 1, true), verdict(3, 1, false)];
        let agg = aggregate(&verdicts, false);
        assert_eq!(agg.score, 66.67);
        assert_eq!(agg.status, OverallStatus::Partial);
        assert!(agg.warnings.is_empty());
    }

    #[test]
    fn test_all_pass() {
        let verdicts = vec![verdict(1, 10, true), verdict(2, 15, true)];
        let agg = aggregate(&verdicts, false);
        assert_eq!(agg.score, 100.0);
        assert_eq!(agg.status, OverallStatus::PassedAll);
        assert_eq!(agg.total_weight, 25);
    }

    #[test]
    fn test_all_fail_is_partial() {
        let verdicts = vec![verdict(1, 10, false), verdict(2, 10, false)];
        let agg = aggregate(&verdicts, false);
        assert_eq!(agg.score, 0.0);
        assert_eq!(agg.status, OverallStatus::Partial);
    }

    #[test]
    fn test_weighted_partial() {
        let verdicts = vec![verdict(1, 20, true), verdict(2, 30, false)];
        assert_eq!(aggregate(&verdicts, false).score, 40.0);
    }

    #[test]
    fn test_empty_set_scores_zero_with_warning() {
        let agg = aggregate(&[], false);
        assert_eq!(agg.score, 0.0);
        assert_eq!(agg.status, OverallStatus::Partial);
        assert_eq!(agg.warnings, vec![EMPTY_SET_WARNING.to_string()]);
    }

    #[test]
    fn test_zero_weights_do_not_divide() {
        let agg = aggregate(&[verdict(1, 0, true)], false);
        assert_eq!(agg.score, 0.0);
        assert!(!agg.warnings.is_empty());
    }

    #[test]
    fn test_short_circuit_status() {
        let verdicts = vec![verdict(1, 1, false), verdict(2, 1, false)];
        let agg = aggregate(&verdicts, true);
        assert_eq!(agg.status, OverallStatus::CompileFailed);
        assert_eq!(agg.score, 0.0);
    }

    #[test]
    fn test_score_bounded_for_many_distributions() {
        for n in 1u32..12 {
            for mask in 0u32..(1 << n.min(8)) {
                let verdicts: Vec<_> = (0..n)
                    .map(|i| verdict(i, (i * 7 + 3) % 11 + 1, mask & (1 << (i % 8)) != 0))
                    .collect();
                let score = aggregate(&verdicts, false).score;
                assert!((0.0..=100.0).contains(&score), "score {} out of range", score);
            }
        }
    }
}
