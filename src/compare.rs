use crate::config::JudgeType;

/// Normalizes program output for comparison under the given judge type
///
/// Standard mode drops trailing spaces on each line and trailing empty lines,
/// but keeps leading and internal whitespace. Applying it twice gives the same
/// string as applying it once.
pub fn normalize_output(output: &str, judge_type: JudgeType) -> String {
    match judge_type {
        JudgeType::Standard => output
            .lines()
            .map(|line| line.trim_end())
            .collect::<Vec<_>>()
            .join("\n")
            .trim_end()
            .to_string(),
        JudgeType::Strict => output.to_string(),
        JudgeType::Trim => output.trim().to_string(),
    }
}

/// Compares program output with expected output
pub fn outputs_match(program_output: &str, expected_output: &str, judge_type: JudgeType) -> bool {
    match judge_type {
        JudgeType::Strict => program_output == expected_output,
        _ => normalize_output(program_output, judge_type) == normalize_output(expected_output, judge_type),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_ignores_trailing_spaces_and_blank_lines() {
        assert!(outputs_match("1 2  \n3\t\n\n\n", "1 2\n3", JudgeType::Standard));
        assert!(outputs_match("5\r\n", "5", JudgeType::Standard));
    }

    #[test]
    fn test_standard_keeps_internal_whitespace() {
        assert!(!outputs_match("1  2", "1 2", JudgeType::Standard));
        assert!(!outputs_match("a\n\nb", "a\nb", JudgeType::Standard));
        assert!(!outputs_match(" 5", "5", JudgeType::Standard));
    }

    #[test]
    fn test_standard_normalization_is_idempotent() {
        for sample in ["", "\n\n", "x  \ny \n\n", "  lead\n\tmid dle \n", "a\r\nb\r\n"] {
            let once = normalize_output(sample, JudgeType::Standard);
            let twice = normalize_output(&once, JudgeType::Standard);
            assert_eq!(once, twice, "sample {sample:?}");
        }
    }

    #[test]
    fn test_strict_is_exact() {
        assert!(outputs_match("5\n", "5\n", JudgeType::Strict));
        assert!(!outputs_match("5\n", "5", JudgeType::Strict));
    }

    #[test]
    fn test_trim_collapses_outer_whitespace_only() {
        assert!(outputs_match("  hello  \n", "hello", JudgeType::Trim));
        assert!(outputs_match("a \nb\n", "a \nb", JudgeType::Trim));
        assert!(!outputs_match("a \nb", "a\nb", JudgeType::Trim));
    }
}
