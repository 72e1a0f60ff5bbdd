/// Evaluation Service - the three request/response operations
///
/// **Operations:**
/// - `run_adhoc`: one caller-supplied input, raw output back, nothing persisted
/// - `run_tests`: visible cases (hidden ones too if configured), status tracked,
///   no score persisted
/// - `submit`: every case, graded result committed atomically, downstream notified
///
/// **Flow for test runs and submissions:**
/// validate -> rate limit -> admit (pending, supersede) -> running -> coordinator
/// -> evaluating -> aggregate -> commit (submit only) -> completed
///
/// A caller that goes away mid-attempt cancels it; the record is moved to `error`.
use crate::cancel::{CancelReason, CancelSignal};
use crate::coordinator::{Coordinator, ExecutionPlan};
use crate::error::{PipelineError, Result};
use crate::language::LanguageRegistry;
use crate::publisher::Publisher;
use crate::rate_limit::RateLimiter;
use crate::retry::{retry_transient, Backoff};
use crate::sandbox::docker::MAX_SOURCE_CODE_BYTES;
use crate::sandbox::{Sandbox, SandboxClient};
use crate::scoring::aggregate;
use crate::state::{persistence, SubmissionStateMachine, CALLER_ABANDONED};
use crate::store::{EventSink, SubmissionStore, TestCaseCatalog};
use arbiter_common::config::PipelineConfig;
use arbiter_common::types::{
    EvaluationResult, EvaluationView, ExecutionKind, Language, OverallStatus, Question,
    Submission, SubmissionMode, SubmissionStatus, TestCase,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct AdhocRequest {
    pub user_id: String,
    pub code: String,
    pub language: String,
    #[serde(default)]
    pub stdin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdhocResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub duration_ms: u64,
    pub kind: ExecutionKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvaluateRequest {
    pub user_id: String,
    pub question_id: String,
    pub code: String,
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub submission_id: Uuid,
    pub score: f64,
    pub status: OverallStatus,
}

/// Storage collaborators the service is wired to
pub struct Backends {
    pub store: Arc<dyn SubmissionStore>,
    pub catalog: Arc<dyn TestCaseCatalog>,
    pub events: Arc<dyn EventSink>,
}

pub struct EvaluationService {
    languages: Arc<LanguageRegistry>,
    catalog: Arc<dyn TestCaseCatalog>,
    coordinator: Coordinator,
    machine: Arc<SubmissionStateMachine>,
    publisher: Publisher,
    rate_limiter: RateLimiter,
    persist_backoff: Backoff,
    include_hidden_in_test_run: bool,
}

impl EvaluationService {
    pub fn new(
        config: &PipelineConfig,
        languages: Arc<LanguageRegistry>,
        sandbox: Arc<dyn Sandbox>,
        backends: Backends,
    ) -> Self {
        let backoff = |retries| {
            Backoff::new(retries, config.retry_backoff_ms, config.retry_backoff_max_ms)
        };
        let sandbox_backoff = backoff(config.sandbox_retries);
        let persist_backoff = backoff(config.persist_retries);

        let coordinator = Coordinator::new(
            SandboxClient::new(sandbox, config.sandbox_setup()),
            config.worker_pool_size,
            config.case_timeout(),
            config.pipeline_timeout(),
            sandbox_backoff,
        );

        Self {
            languages,
            catalog: backends.catalog,
            coordinator,
            machine: Arc::new(SubmissionStateMachine::new(
                Arc::clone(&backends.store),
                persist_backoff,
            )),
            publisher: Publisher::new(backends.store, backends.events, persist_backoff),
            rate_limiter: RateLimiter::new(config.rate_limit_max, config.rate_limit_window()),
            persist_backoff,
            include_hidden_in_test_run: config.include_hidden_in_test_run,
        }
    }

    pub fn languages(&self) -> &LanguageRegistry {
        &self.languages
    }

    pub fn available_slots(&self) -> usize {
        self.coordinator.available_slots()
    }

    #[tracing::instrument(
        skip(self, request),
        fields(user_id = %request.user_id, language = %request.language)
    )]
    pub async fn run_adhoc(&self, request: AdhocRequest) -> Result<AdhocResponse> {
        let language = self.validate(&request.user_id, &request.code, &request.language)?;
        self.check_rate(&request.user_id).await?;

        let cancel = CancelSignal::new();
        let outcome = self
            .coordinator
            .run_single(Uuid::new_v4(), &request.code, language, &request.stdin, &cancel)
            .await?;

        if outcome.kind == ExecutionKind::CompileError {
            return Err(PipelineError::CompileError(outcome.stderr));
        }
        Ok(AdhocResponse {
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            exit_code: outcome.exit_code,
            duration_ms: outcome.duration_ms,
            kind: outcome.kind,
        })
    }

    /// Evaluate against the question's visible cases. The score is returned, never persisted.
    pub async fn run_tests(&self, request: EvaluateRequest) -> Result<EvaluationView> {
        let (_, result) = self.evaluate(&request, SubmissionMode::TestRun).await?;
        Ok(result.view())
    }

    /// Graded submission: all cases, result committed before the score is reported.
    pub async fn submit(&self, request: EvaluateRequest) -> Result<SubmitResponse> {
        let (submission, result) = self.evaluate(&request, SubmissionMode::GradedSubmit).await?;
        Ok(SubmitResponse {
            submission_id: submission.id,
            score: result.score,
            status: result.status,
        })
    }

    pub async fn submission(&self, id: Uuid) -> Result<Submission> {
        self.machine.load(&id).await
    }

    /// Stored graded result, with hidden-case detail stripped
    pub async fn result(&self, id: Uuid) -> Result<EvaluationView> {
        let submission = self.machine.load(&id).await?;
        let version = submission
            .result_version
            .ok_or_else(|| PipelineError::NotFound(format!("result for submission {}", id)))?;
        let store = self.machine.store();
        retry_transient(&self.persist_backoff, "load_result", || {
            store.load_result(&id, version)
        })
        .await
            .map_err(|e| persistence(&self.persist_backoff, e))?
            .map(|result| result.view())
            .ok_or_else(|| PipelineError::NotFound(format!("result for submission {}", id)))
    }

    pub async fn cancel(&self, id: Uuid) -> Result<Submission> {
        self.machine.cancel(id).await
    }

    fn validate(&self, user_id: &str, code: &str, language: &str) -> Result<Language> {
        if user_id.trim().is_empty() {
            return Err(PipelineError::Validation("user id is required".to_string()));
        }
        if code.trim().is_empty() {
            return Err(PipelineError::Validation("code must not be empty".to_string()));
        }
        if code.len() > MAX_SOURCE_CODE_BYTES {
            return Err(PipelineError::Validation(format!(
                "code exceeds maximum size of {} bytes",
                MAX_SOURCE_CODE_BYTES
            )));
        }
        let language: Language = language.parse().map_err(PipelineError::Validation)?;
        if !self.languages.is_enabled(language) {
            return Err(PipelineError::Validation(format!(
                "language {} is not enabled",
                language
            )));
        }
        Ok(language)
    }

    async fn check_rate(&self, user_id: &str) -> Result<()> {
        self.rate_limiter
            .check(user_id)
            .await
            .map_err(|retry_after_secs| PipelineError::RateLimited {
                user_id: user_id.to_string(),
                retry_after_secs,
            })
    }

    async fn resolve_question(&self, question_id: &str) -> Result<Question> {
        if question_id.trim().is_empty() {
            return Err(PipelineError::Validation("question id is required".to_string()));
        }
        retry_transient(&self.persist_backoff, "question", || {
            self.catalog.question(question_id)
        })
        .await
        .map_err(|e| persistence(&self.persist_backoff, e))?
        .ok_or_else(|| PipelineError::Validation(format!("unknown question '{}'", question_id)))
    }

    fn select_cases(&self, question: &Question, mode: SubmissionMode) -> Vec<TestCase> {
        let include_hidden = match mode {
            SubmissionMode::GradedSubmit => true,
            SubmissionMode::TestRun | SubmissionMode::AdhocRun => self.include_hidden_in_test_run,
        };
        let mut cases: Vec<TestCase> = question
            .test_cases
            .iter()
            .filter(|tc| include_hidden || !tc.hidden)
            .cloned()
            .collect();
        cases.sort_by_key(|tc| tc.id);
        cases
    }

    #[tracing::instrument(
        skip(self, request),
        fields(user_id = %request.user_id, question_id = %request.question_id, mode = %mode)
    )]
    async fn evaluate(
        &self,
        request: &EvaluateRequest,
        mode: SubmissionMode,
    ) -> Result<(Submission, EvaluationResult)> {
        let language = self.validate(&request.user_id, &request.code, &request.language)?;
        let question = self.resolve_question(&request.question_id).await?;
        self.check_rate(&request.user_id).await?;

        let cases = self.select_cases(&question, mode);
        let submission = Submission::new(
            &request.user_id,
            &request.question_id,
            language,
            &request.code,
            mode,
        );
        let cancel = self.machine.admit(&submission).await?;
        let guard = AttemptGuard {
            machine: Arc::clone(&self.machine),
            submission: submission.clone(),
            cancel: cancel.clone(),
            armed: true,
        };

        let outcome = self.drive(&submission, &question, cases, &cancel).await;
        self.machine.release(&submission).await;
        guard.disarm();

        if let Err(e) = &outcome {
            match e {
                PipelineError::Cancelled(_) => {
                    info!(submission_id = %submission.id, "Attempt discarded")
                }
                _ => warn!(
                    submission_id = %submission.id,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Evaluation failed"
                ),
            }
        }
        outcome
    }

    async fn drive(
        &self,
        submission: &Submission,
        question: &Question,
        cases: Vec<TestCase>,
        cancel: &CancelSignal,
    ) -> Result<(Submission, EvaluationResult)> {
        let running = match self.machine.transition(submission, SubmissionStatus::Running).await {
            Ok(s) => s,
            Err(e) => return Err(self.abandon(submission, e).await),
        };

        let plan = ExecutionPlan {
            submission_id: submission.id,
            code: submission.code.clone(),
            language: submission.language,
            cases,
            compare_mode: question.compare_mode,
        };
        let run = match self.coordinator.run(plan, cancel).await {
            Ok(run) => run,
            Err(e) => return Err(self.abandon(&running, e).await),
        };

        let evaluating = match self
            .machine
            .transition(&running, SubmissionStatus::Evaluating)
            .await
        {
            Ok(s) => s,
            Err(e) => return Err(self.abandon(&running, e).await),
        };

        let totals = aggregate(&run.verdicts, run.short_circuited);
        for warning in &totals.warnings {
            warn!(submission_id = %submission.id, warning = %warning, "Scoring warning");
        }
        let result = EvaluationResult {
            submission_id: submission.id,
            version: evaluating.version,
            verdicts: run.verdicts,
            score: totals.score,
            total_weight: totals.total_weight,
            status: totals.status,
            warnings: totals.warnings,
            diagnostic: run.diagnostic,
            evaluated_at: Utc::now(),
        };

        let (done, result) = match submission.mode {
            SubmissionMode::GradedSubmit => {
                match self.publisher.commit(&evaluating, result).await {
                    Ok((done, result)) => {
                        self.publisher.fan_out(&done, &result);
                        (done, result)
                    }
                    Err(e) => return Err(self.abandon(&evaluating, e).await),
                }
            }
            SubmissionMode::TestRun | SubmissionMode::AdhocRun => {
                let completed = self
                    .machine
                    .transition(&evaluating, SubmissionStatus::Completed)
                    .await;
                match completed {
                    Ok(done) => (done, result),
                    Err(e) => return Err(self.abandon(&evaluating, e).await),
                }
            }
        };

        info!(
            submission_id = %done.id,
            score = result.score,
            status = %result.status,
            passed = result.verdicts.iter().filter(|v| v.passed()).count(),
            total = result.verdicts.len(),
            "Evaluation completed"
        );
        let details = json!({ "score": result.score, "status": result.status });
        self.machine.record(&done, "completed", details).await;
        Ok((done, result))
    }

    /// Settle the record after a failed step. Cancelled attempts are left alone.
    async fn abandon(&self, current: &Submission, error: PipelineError) -> PipelineError {
        if !matches!(error, PipelineError::Cancelled(_)) {
            self.machine.fail(current, &error.to_string()).await;
        }
        error
    }
}

/// Settles an admitted attempt whose driving future was dropped before it finished,
/// e.g. when the HTTP client disconnects mid-evaluation.
struct AttemptGuard {
    machine: Arc<SubmissionStateMachine>,
    submission: Submission,
    cancel: CancelSignal,
    armed: bool,
}

impl AttemptGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.cancel.cancel(CancelReason::Abandoned);

        let machine = Arc::clone(&self.machine);
        let submission = self.submission.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    info!(submission_id = %submission.id, "Caller went away, abandoning attempt");
                    machine.fail(&submission, CALLER_ABANDONED).await;
                    machine.release(&submission).await;
                });
            }
            Err(_) => warn!(
                submission_id = %self.submission.id,
                "No runtime to settle abandoned submission"
            ),
        }
    }
}
