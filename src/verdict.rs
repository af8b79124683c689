use std::time::Duration;

use crate::create_timestamp;
use crate::error::JudgeError;
use crate::model::{CaseVerdict, SubmissionResult, VerdictKind};

/// Folds per-case verdicts into the submission result
///
/// The score is the rounded percentage of passed cases (half rounds up).
/// The overall verdict is the first failing case's verdict, or AC.
pub fn aggregate(case_verdicts: Vec<CaseVerdict>) -> Result<SubmissionResult, JudgeError> {
    if case_verdicts.is_empty() {
        return Err(JudgeError::NoTestCases);
    }

    let total_count = case_verdicts.len();
    let passed_count = case_verdicts.iter().filter(|v| v.passed).count();
    let total_wall_time: Duration = case_verdicts.iter().map(|v| v.wall_time).sum();
    let peak_memory = case_verdicts.iter().map(|v| v.memory_used).max().unwrap_or(0);
    let verdict = case_verdicts
        .iter()
        .find(|v| !v.passed)
        .map_or(VerdictKind::Accepted, |v| v.verdict);

    Ok(SubmissionResult {
        overall_passed: passed_count == total_count,
        score: score(passed_count, total_count),
        case_verdicts,
        passed_count,
        total_count,
        total_wall_time,
        peak_memory,
        verdict,
        judged_at: create_timestamp(),
    })
}

/// `round(100 * passed / total)` in integers
fn score(passed: usize, total: usize) -> u32 {
    ((200 * passed + total) / (2 * total)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(index: usize, kind: VerdictKind, millis: u64, memory: u64) -> CaseVerdict {
        CaseVerdict {
            test_case_index: index,
            input: String::new(),
            expected_output: String::new(),
            actual_output: String::new(),
            passed: kind == VerdictKind::Accepted,
            verdict: kind,
            wall_time: Duration::from_millis(millis),
            memory_used: memory,
            error_detail: None,
            is_public: true,
        }
    }

    #[test]
    fn test_two_of_three_passed() {
        let result = aggregate(vec![
            verdict(0, VerdictKind::Accepted, 10, 100),
            verdict(1, VerdictKind::Accepted, 20, 300),
            verdict(2, VerdictKind::WrongAnswer, 30, 200),
        ])
        .unwrap();

        assert_eq!(result.score, 67);
        assert_eq!(result.passed_count, 2);
        assert_eq!(result.total_count, 3);
        assert!(!result.overall_passed);
        assert_eq!(result.verdict, VerdictKind::WrongAnswer);
        assert_eq!(result.total_wall_time, Duration::from_millis(60));
        assert_eq!(result.peak_memory, 300);
    }

    #[test]
    fn test_all_passed() {
        let result = aggregate(vec![verdict(0, VerdictKind::Accepted, 1, 1)]).unwrap();
        assert!(result.overall_passed);
        assert_eq!(result.score, 100);
        assert_eq!(result.verdict, VerdictKind::Accepted);
    }

    #[test]
    fn test_first_failure_decides_verdict() {
        let result = aggregate(vec![
            verdict(0, VerdictKind::Accepted, 1, 1),
            verdict(1, VerdictKind::TimeLimitExceeded, 1, 1),
            verdict(2, VerdictKind::RuntimeError, 1, 1),
        ])
        .unwrap();
        assert_eq!(result.verdict, VerdictKind::TimeLimitExceeded);
        assert_eq!(result.score, 33);
    }

    #[test]
    fn test_empty_is_rejected() {
        assert!(matches!(aggregate(Vec::new()), Err(JudgeError::NoTestCases)));
    }

    #[test]
    fn test_score_rounds_half_up() {
        assert_eq!(score(1, 8), 13); // 12.5
        assert_eq!(score(1, 3), 33);
        assert_eq!(score(0, 5), 0);
        for total in 1..50 {
            for passed in 0..=total {
                let s = score(passed, total);
                assert!(s <= 100);
                assert_eq!(s == 100, passed == total);
            }
        }
    }
}
