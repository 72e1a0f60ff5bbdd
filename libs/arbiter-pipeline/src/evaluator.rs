/// Test Case Evaluator - language-agnostic verdict logic
///
/// **Core Responsibility:**
/// Compare one execution's output against the expected output and produce a verdict.
///
/// **Critical Properties:**
/// - Knows nothing about Docker, Redis or scoring weights beyond copying them through
/// - Pure function: (execution outcome, test case, compare mode) → verdict
///
/// **Normalization Rules (`CompareMode::Exact`):**
/// - Trailing whitespace on each line: ignored
/// - Trailing newlines: ignored
/// - Line endings (\n vs \r\n): ignored
/// - Leading whitespace, internal whitespace, case: significant
///
/// `CompareMode::Tokens` compares whitespace-separated token sequences instead.
use arbiter_common::types::{
    CompareMode, ExecutionKind, ExecutionOutcome, HiddenVerdict, TestCase, TestCaseVerdict,
    VerdictDetail, VerdictReason, VisibleVerdict,
};

pub fn normalize_output(output: &str) -> String {
    let joined = output
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    joined.trim_end().to_string()
}

pub fn outputs_match(actual: &str, expected: &str, mode: CompareMode) -> bool {
    match mode {
        CompareMode::Exact => normalize_output(actual) == normalize_output(expected),
        CompareMode::Tokens => actual.split_whitespace().eq(expected.split_whitespace()),
    }
}

fn reason_for(
    outcome: &ExecutionOutcome,
    test_case: &TestCase,
    mode: CompareMode,
) -> VerdictReason {
    match outcome.kind {
        ExecutionKind::Ok => {
            if outputs_match(&outcome.stdout, &test_case.expected_output, mode) {
                VerdictReason::Accepted
            } else {
                VerdictReason::WrongAnswer
            }
        }
        ExecutionKind::CompileError => VerdictReason::CompileError,
        ExecutionKind::RuntimeError => VerdictReason::RuntimeError,
        ExecutionKind::Timeout => VerdictReason::TimeLimitExceeded,
        ExecutionKind::SandboxUnavailable => VerdictReason::SandboxUnavailable,
    }
}

fn build_verdict(
    test_case: &TestCase,
    reason: VerdictReason,
    actual_output: &str,
    stderr: &str,
    duration_ms: u64,
) -> TestCaseVerdict {
    let passed = reason == VerdictReason::Accepted;
    if test_case.hidden {
        return TestCaseVerdict::Hidden(HiddenVerdict {
            test_id: test_case.id,
            passed,
            reason,
            weight: test_case.weight,
        });
    }

    TestCaseVerdict::Visible(VisibleVerdict {
        test_id: test_case.id,
        passed,
        reason,
        weight: test_case.weight,
        detail: VerdictDetail {
            input: test_case.input.clone(),
            expected_output: test_case.expected_output.clone(),
            actual_output: actual_output.to_string(),
            stderr: stderr.to_string(),
            duration_ms,
        },
    })
}

/// Evaluate a single execution outcome against its test case.
/// `passed` is true iff the run finished normally and the normalized outputs are equal.
pub fn evaluate_case(
    outcome: &ExecutionOutcome,
    test_case: &TestCase,
    mode: CompareMode,
) -> TestCaseVerdict {
    let reason = reason_for(outcome, test_case, mode);
    build_verdict(test_case, reason, &outcome.stdout, &outcome.stderr, outcome.duration_ms)
}

/// Every case fails with the same compiler diagnostic
pub fn compile_failure_verdicts(test_cases: &[TestCase], diagnostic: &str) -> Vec<TestCaseVerdict> {
    let mut cases: Vec<&TestCase> = test_cases.iter().collect();
    cases.sort_by_key(|tc| tc.id);
    cases
        .into_iter()
        .map(|tc| build_verdict(tc, VerdictReason::CompileError, "", diagnostic, 0))
        .collect()
}

/// Evaluate all outcomes, returning verdicts in test-case id order.
/// Outcomes without a matching test case are ignored.
pub fn evaluate_all(
    test_cases: &[TestCase],
    outcomes: &[ExecutionOutcome],
    mode: CompareMode,
) -> Vec<TestCaseVerdict> {
    let mut sorted: Vec<&ExecutionOutcome> = outcomes.iter().collect();
    sorted.sort_by_key(|o| o.test_id);

    sorted
        .into_iter()
        .filter_map(|outcome| {
            test_cases
                .iter()
                .find(|tc| tc.id == outcome.test_id)
                .map(|tc| evaluate_case(outcome, tc, mode))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_case(id: u32, expected_output: &str, hidden: bool) -> TestCase {
        TestCase {
            id,
            input: "input".to_string(),
            expected_output: expected_output.to_string(),
            weight: 1,
            hidden,
        }
    }

    fn make_outcome(test_id: u32, kind: ExecutionKind, stdout: &str) -> ExecutionOutcome {
        ExecutionOutcome {
            test_id,
            kind,
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: Some(0),
            duration_ms: 12,
        }
    }

    #[test]
    fn test_normalize_output() {
        assert_eq!(normalize_output("hello"), "hello");
        assert_eq!(normalize_output("hello  \n"), "hello");
        assert_eq!(normalize_output("hello\n\n\n"), "hello");
        assert_eq!(normalize_output("a  \r\nb\t\r\n"), "a\nb");
        assert_eq!(normalize_output("  indented"), "  indented");
        assert_eq!(normalize_output("   \n"), "");
    }

    #[test]
    fn test_exact_mode_keeps_internal_whitespace() {
        assert!(outputs_match("1 2 3\n", "1 2 3", CompareMode::Exact));
        assert!(!outputs_match("1  2 3", "1 2 3", CompareMode::Exact));
        assert!(!outputs_match(" 1 2 3", "1 2 3", CompareMode::Exact));
        assert!(!outputs_match("Hello", "hello", CompareMode::Exact));
    }

    #[test]
    fn test_token_mode_ignores_layout() {
        assert!(outputs_match("1  2\n3", "1 2 3", CompareMode::Tokens));
        assert!(outputs_match("\n 0 1 \n", "0 1", CompareMode::Tokens));
        assert!(!outputs_match("1 2", "1 2 3", CompareMode::Tokens));
    }

    #[test]
    fn test_evaluate_case_accepted() {
        let tc = make_test_case(1, "120", false);
        let outcome = make_outcome(1, ExecutionKind::Ok, "120\n");
        let verdict = evaluate_case(&outcome, &tc, CompareMode::Exact);
        assert!(verdict.passed());
        assert_eq!(verdict.reason(), VerdictReason::Accepted);
        match verdict {
            TestCaseVerdict::Visible(v) => {
                assert_eq!(v.detail.actual_output, "120\n");
                assert_eq!(v.detail.expected_output, "120");
                assert_eq!(v.detail.duration_ms, 12);
            }
            TestCaseVerdict::Hidden(_) => panic!("visible case produced hidden verdict"),
        }
    }

    #[test]
    fn test_evaluate_case_wrong_answer() {
        let tc = make_test_case(1, "expected", false);
        let outcome = make_outcome(1, ExecutionKind::Ok, "actual");
        let verdict = evaluate_case(&outcome, &tc, CompareMode::Exact);
        assert!(!verdict.passed());
        assert_eq!(verdict.reason(), VerdictReason::WrongAnswer);
    }

    #[test]
    fn test_non_ok_kinds_never_pass() {
        let tc = make_test_case(1, "", false);
        // Empty expected output would otherwise match the empty stdout.
        let cases = [
            (ExecutionKind::RuntimeError, VerdictReason::RuntimeError),
            (ExecutionKind::Timeout, VerdictReason::TimeLimitExceeded),
            (ExecutionKind::SandboxUnavailable, VerdictReason::SandboxUnavailable),
            (ExecutionKind::CompileError, VerdictReason::CompileError),
        ];
        for (kind, reason) in cases {
            let verdict = evaluate_case(&make_outcome(1, kind, ""), &tc, CompareMode::Exact);
            assert!(!verdict.passed(), "{:?} must fail", kind);
            assert_eq!(verdict.reason(), reason);
        }
    }

    #[test]
    fn test_timeout_reason_text() {
        let tc = make_test_case(4, "x", false);
        let outcome = make_outcome(4, ExecutionKind::Timeout, "");
        let verdict = evaluate_case(&outcome, &tc, CompareMode::Exact);
        assert_eq!(verdict.reason().to_string(), "time limit exceeded");
    }

    #[test]
    fn test_hidden_case_has_no_detail() {
        let tc = make_test_case(2, "secret", true);
        let outcome = make_outcome(2, ExecutionKind::Ok, "secret");
        let verdict = evaluate_case(&outcome, &tc, CompareMode::Exact);
        assert!(verdict.is_hidden());
        assert!(verdict.passed());
        let json = serde_json::to_string(&verdict.summary()).unwrap();
        assert!(!json.contains("secret"));
        assert!(!json.contains("input"));
    }

    #[test]
    fn test_compile_failure_verdicts_share_diagnostic() {
        let cases = vec![
            make_test_case(3, "a", false),
            make_test_case(1, "b", true),
            make_test_case(2, "c", false),
        ];
        let verdicts = compile_failure_verdicts(&cases, "Main.java:3: error: ';' expected");
        assert_eq!(verdicts.iter().map(|v| v.test_id()).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert!(verdicts.iter().all(|v| !v.passed() && v.reason() == VerdictReason::CompileError));
        for v in &verdicts {
            if let TestCaseVerdict::Visible(v) = v {
                assert_eq!(v.detail.stderr, "Main.java:3: error: ';' expected");
            }
        }
    }

    #[test]
    fn test_evaluate_all_orders_by_id() {
        let cases = vec![make_test_case(1, "one", false), make_test_case(2, "two", false)];
        let outcomes = vec![
            make_outcome(2, ExecutionKind::Ok, "two"),
            make_outcome(1, ExecutionKind::Ok, "uno"),
            make_outcome(9, ExecutionKind::Ok, "stray"),
        ];
        let verdicts = evaluate_all(&cases, &outcomes, CompareMode::Exact);
        assert_eq!(verdicts.len(), 2);
        assert_eq!(verdicts[0].test_id(), 1);
        assert!(!verdicts[0].passed());
        assert!(verdicts[1].passed());
    }
}
