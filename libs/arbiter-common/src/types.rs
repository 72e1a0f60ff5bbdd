use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Languages the platform knows how to hand to a sandbox.
/// Which of them are actually accepted is decided by the language registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Java,
    Rust,
    Javascript,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Java => "java",
            Language::Rust => "rust",
            Language::Javascript => "javascript",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "java" => Ok(Language::Java),
            "rust" | "rs" => Ok(Language::Rust),
            "javascript" | "js" | "node" => Ok(Language::Javascript),
            other => Err(format!("unknown language '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubmissionMode {
    AdhocRun,
    TestRun,
    GradedSubmit,
}

impl fmt::Display for SubmissionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SubmissionMode::AdhocRun => "adhoc-run",
            SubmissionMode::TestRun => "test-run",
            SubmissionMode::GradedSubmit => "graded-submit",
        })
    }
}

/// Lifecycle of a persisted submission.
///
/// ```text
/// pending -> running -> evaluating -> completed
///               |           |      \-> error
///               \-----------+--> superseded
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Pending,
    Running,
    Evaluating,
    Completed,
    Error,
    Superseded,
}

impl SubmissionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionStatus::Completed | SubmissionStatus::Error | SubmissionStatus::Superseded
        )
    }

    pub fn can_transition_to(&self, next: SubmissionStatus) -> bool {
        use SubmissionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Error)
                | (Pending, Superseded)
                | (Running, Evaluating)
                | (Running, Error)
                | (Running, Superseded)
                | (Evaluating, Completed)
                | (Evaluating, Error)
                | (Evaluating, Superseded)
        )
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Running => "running",
            SubmissionStatus::Evaluating => "evaluating",
            SubmissionStatus::Completed => "completed",
            SubmissionStatus::Error => "error",
            SubmissionStatus::Superseded => "superseded",
        })
    }
}

/// One evaluation attempt. Mutated only through the state machine; every
/// accepted write bumps `version` by one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub user_id: String,
    pub question_id: String,
    pub language: Language,
    pub code: String,
    pub mode: SubmissionMode,
    pub status: SubmissionStatus,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Version under which the evaluation result was written, once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_version: Option<u64>,
}

impl Submission {
    pub fn new(
        user_id: impl Into<String>,
        question_id: impl Into<String>,
        language: Language,
        code: impl Into<String>,
        mode: SubmissionMode,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            question_id: question_id.into(),
            language,
            code: code.into(),
            mode,
            status: SubmissionStatus::Pending,
            version: 1,
            created_at: now,
            updated_at: now,
            error: None,
            result_version: None,
        }
    }
}

/// Output comparison policy, chosen per question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareMode {
    /// Byte-exact after dropping trailing whitespace on each line and trailing newlines.
    #[default]
    Exact,
    /// Whitespace-separated token sequence must match.
    Tokens,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: u32,
    pub input: String,
    pub expected_output: String,
    pub weight: u32,
    #[serde(default)]
    pub hidden: bool,
}

/// A question as the catalog knows it. Test cases are kept in id order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub compare_mode: CompareMode,
    pub test_cases: Vec<TestCase>,
}

impl Question {
    pub fn total_weight(&self) -> u64 {
        self.test_cases.iter().map(|tc| u64::from(tc.weight)).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionKind {
    Ok,
    CompileError,
    RuntimeError,
    Timeout,
    SandboxUnavailable,
}

/// Result of one sandboxed run. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub test_id: u32,
    pub kind: ExecutionKind,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerdictReason {
    #[serde(rename = "accepted")]
    Accepted,
    #[serde(rename = "wrong answer")]
    WrongAnswer,
    #[serde(rename = "compile-error")]
    CompileError,
    #[serde(rename = "runtime-error")]
    RuntimeError,
    #[serde(rename = "time limit exceeded")]
    TimeLimitExceeded,
    #[serde(rename = "sandbox-unavailable")]
    SandboxUnavailable,
}

impl fmt::Display for VerdictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VerdictReason::Accepted => "accepted",
            VerdictReason::WrongAnswer => "wrong answer",
            VerdictReason::CompileError => "compile-error",
            VerdictReason::RuntimeError => "runtime-error",
            VerdictReason::TimeLimitExceeded => "time limit exceeded",
            VerdictReason::SandboxUnavailable => "sandbox-unavailable",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictDetail {
    pub input: String,
    pub expected_output: String,
    pub actual_output: String,
    pub stderr: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibleVerdict {
    pub test_id: u32,
    pub passed: bool,
    pub reason: VerdictReason,
    pub weight: u32,
    pub detail: VerdictDetail,
}

/// Verdict for a hidden case. Carries no input or output text at all, so the
/// confidentiality of hidden cases does not depend on callers remembering to strip it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiddenVerdict {
    pub test_id: u32,
    pub passed: bool,
    pub reason: VerdictReason,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "visibility", rename_all = "lowercase")]
pub enum TestCaseVerdict {
    Visible(VisibleVerdict),
    Hidden(HiddenVerdict),
}

impl TestCaseVerdict {
    pub fn test_id(&self) -> u32 {
        match self {
            TestCaseVerdict::Visible(v) => v.test_id,
            TestCaseVerdict::Hidden(v) => v.test_id,
        }
    }

    pub fn passed(&self) -> bool {
        match self {
            TestCaseVerdict::Visible(v) => v.passed,
            TestCaseVerdict::Hidden(v) => v.passed,
        }
    }

    pub fn weight(&self) -> u32 {
        match self {
            TestCaseVerdict::Visible(v) => v.weight,
            TestCaseVerdict::Hidden(v) => v.weight,
        }
    }

    pub fn reason(&self) -> VerdictReason {
        match self {
            TestCaseVerdict::Visible(v) => v.reason,
            TestCaseVerdict::Hidden(v) => v.reason,
        }
    }

    pub fn is_hidden(&self) -> bool {
        matches!(self, TestCaseVerdict::Hidden(_))
    }

    /// The shape returned to callers outside the pipeline.
    pub fn summary(&self) -> VerdictSummary {
        match self {
            TestCaseVerdict::Visible(v) => VerdictSummary::Visible(v.clone()),
            TestCaseVerdict::Hidden(v) => VerdictSummary::Hidden {
                test_id: v.test_id,
                passed: v.passed,
                weight: v.weight,
            },
        }
    }
}

/// Externally visible verdict: hidden cases expose only id, pass flag and weight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "visibility", rename_all = "lowercase")]
pub enum VerdictSummary {
    Visible(VisibleVerdict),
    Hidden { test_id: u32, passed: bool, weight: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverallStatus {
    PassedAll,
    Partial,
    CompileFailed,
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OverallStatus::PassedAll => "passed-all",
            OverallStatus::Partial => "partial",
            OverallStatus::CompileFailed => "compile-failed",
        })
    }
}

/// Outcome of one submission attempt, keyed by submission id + version.
/// Written once and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub submission_id: Uuid,
    pub version: u64,
    pub verdicts: Vec<TestCaseVerdict>,
    pub score: f64,
    pub total_weight: u64,
    pub status: OverallStatus,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Compiler diagnostic shared by every case when the attempt short-circuited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    pub evaluated_at: DateTime<Utc>,
}

impl EvaluationResult {
    pub fn view(&self) -> EvaluationView {
        EvaluationView {
            submission_id: self.submission_id,
            score: self.score,
            status: self.status,
            verdicts: self.verdicts.iter().map(TestCaseVerdict::summary).collect(),
            warnings: self.warnings.clone(),
            diagnostic: self.diagnostic.clone(),
        }
    }
}

/// Evaluation result as returned to the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationView {
    pub submission_id: Uuid,
    pub score: f64,
    pub status: OverallStatus,
    pub verdicts: Vec<VerdictSummary>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    ComputeMetrics,
    GenerateSummary,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EventKind::ComputeMetrics => "compute-metrics",
            EventKind::GenerateSummary => "generate-summary",
        })
    }
}

/// Fire-and-forget notification for downstream collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownstreamEvent {
    pub kind: EventKind,
    pub submission_id: Uuid,
    pub user_id: String,
    pub question_id: String,
    pub score: f64,
    pub verdicts: Vec<VerdictSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub submission_id: Uuid,
    pub user_id: String,
    pub action: String,
    #[serde(default)]
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ActivityEntry {
    pub fn new(
        submission: &Submission,
        action: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            submission_id: submission.id,
            user_id: submission.user_id.clone(),
            action: action.into(),
            details,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_parsing() {
        assert_eq!("python3".parse::<Language>(), Ok(Language::Python));
        assert_eq!("Java".parse::<Language>(), Ok(Language::Java));
        assert_eq!("js".parse::<Language>(), Ok(Language::Javascript));
        assert!("cobol".parse::<Language>().is_err());
        assert_eq!(Language::Rust.to_string(), "rust");
    }

    #[test]
    fn test_status_transitions() {
        use SubmissionStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Evaluating));
        assert!(Evaluating.can_transition_to(Completed));
        assert!(Running.can_transition_to(Superseded));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Superseded.can_transition_to(Completed));
        assert!(Completed.is_terminal() && Superseded.is_terminal());
        assert!(!Evaluating.is_terminal());
    }

    #[test]
    fn test_hidden_summary_omits_detail() {
        let verdict = TestCaseVerdict::Hidden(HiddenVerdict {
            test_id: 3,
            passed: true,
            reason: VerdictReason::Accepted,
            weight: 2,
        });
        let json = serde_json::to_value(verdict.summary()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"visibility": "hidden", "test_id": 3, "passed": true, "weight": 2})
        );
    }

    #[test]
    fn test_mode_serialization() {
        let json = serde_json::to_string(&SubmissionMode::GradedSubmit).unwrap();
        assert_eq!(json, "\"graded-submit\"");
        let status: OverallStatus = serde_json::from_str("\"passed-all\"").unwrap();
        assert_eq!(status, OverallStatus::PassedAll);
    }

    #[test]
    fn test_reason_serializes_as_text() {
        let json = serde_json::to_string(&VerdictReason::TimeLimitExceeded).unwrap();
        assert_eq!(json, "\"time limit exceeded\"");
    }
}
