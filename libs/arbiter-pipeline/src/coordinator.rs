/// Execution Coordinator - fans one submission attempt out to the sandbox
///
/// **Core Responsibility:**
/// Turn a set of test cases into execution outcomes through the shared worker pool,
/// then hand them to the evaluator in test-case id order.
///
/// **Execution Flow:**
/// 1. Run the first case (lowest id) on its own
/// 2. Compile error on that case: every case fails with the same diagnostic, nothing else runs
/// 3. Otherwise the remaining cases run concurrently, each bounded by its own timeout
/// 4. Sandbox outages are retried with backoff, then fail the whole attempt
/// 5. The attempt's cancellation signal abandons queued and in-flight dispatches
///
/// **Concurrency:**
/// One semaphore per process bounds sandbox sessions across all submissions.
/// A permit is held only for the duration of a single sandbox call, never across backoff.
use crate::cancel::{CancelReason, CancelSignal};
use crate::error::{PipelineError, Result};
use crate::evaluator::{compile_failure_verdicts, evaluate_all};
use crate::retry::Backoff;
use crate::sandbox::{Dispatch, SandboxClient};
use arbiter_common::types::{
    CompareMode, ExecutionKind, ExecutionOutcome, Language, TestCase, TestCaseVerdict,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything needed to run one attempt
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub submission_id: Uuid,
    pub code: String,
    pub language: Language,
    pub cases: Vec<TestCase>,
    pub compare_mode: CompareMode,
}

#[derive(Debug, Clone)]
pub struct CaseRun {
    /// Sorted by test-case id
    pub verdicts: Vec<TestCaseVerdict>,
    pub short_circuited: bool,
    pub diagnostic: Option<String>,
}

#[derive(Clone)]
pub struct Coordinator {
    client: SandboxClient,
    pool: Arc<Semaphore>,
    case_timeout: Duration,
    pipeline_timeout: Duration,
    backoff: Backoff,
}

fn cancelled(submission_id: Uuid, reason: CancelReason) -> PipelineError {
    match reason {
        CancelReason::PipelineTimeout => PipelineError::PipelineTimeout(submission_id),
        CancelReason::Superseded | CancelReason::UserRequested | CancelReason::Abandoned => {
            PipelineError::Cancelled(submission_id)
        }
    }
}

impl Coordinator {
    pub fn new(
        client: SandboxClient,
        pool_size: usize,
        case_timeout: Duration,
        pipeline_timeout: Duration,
        backoff: Backoff,
    ) -> Self {
        Self {
            client,
            pool: Arc::new(Semaphore::new(pool_size.max(1))),
            case_timeout,
            pipeline_timeout,
            backoff,
        }
    }

    /// Free sandbox slots right now
    pub fn available_slots(&self) -> usize {
        self.pool.available_permits()
    }

    #[tracing::instrument(
        skip(self, plan, cancel),
        fields(
            submission_id = %plan.submission_id,
            language = %plan.language,
            cases = plan.cases.len()
        )
    )]
    pub async fn run(&self, plan: ExecutionPlan, cancel: &CancelSignal) -> Result<CaseRun> {
        let submission_id = plan.submission_id;
        let started = Instant::now();

        let work = self.run_cases(plan, cancel);
        let result = match tokio::time::timeout(self.pipeline_timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                // Dropping the work future aborts its JoinSet; the signal covers anything else.
                cancel.cancel(CancelReason::PipelineTimeout);
                warn!(timeout_ms = self.pipeline_timeout.as_millis() as u64, "Pipeline timeout");
                Err(PipelineError::PipelineTimeout(submission_id))
            }
        };

        if let Ok(run) = &result {
            info!(
                verdicts = run.verdicts.len(),
                short_circuited = run.short_circuited,
                duration_ms = started.elapsed().as_millis() as u64,
                "Execution finished"
            );
        }
        result
    }

    /// Run a single caller-supplied input with no expected output.
    #[tracing::instrument(
        skip(self, code, stdin, cancel),
        fields(submission_id = %submission_id, language = %language)
    )]
    pub async fn run_single(
        &self,
        submission_id: Uuid,
        code: &str,
        language: Language,
        stdin: &str,
        cancel: &CancelSignal,
    ) -> Result<ExecutionOutcome> {
        let case = TestCase {
            id: 0,
            input: stdin.to_string(),
            expected_output: String::new(),
            weight: 0,
            hidden: false,
        };
        let dispatched = tokio::time::timeout(
            self.pipeline_timeout,
            self.dispatch(code, language, &case, cancel),
        )
        .await;

        match dispatched {
            Err(_) => {
                cancel.cancel(CancelReason::PipelineTimeout);
                Err(PipelineError::PipelineTimeout(submission_id))
            }
            Ok(Dispatch::Cancelled(reason)) => Err(cancelled(submission_id, reason)),
            Ok(Dispatch::Completed(outcome))
                if outcome.kind == ExecutionKind::SandboxUnavailable =>
            {
                Err(self.unavailable(&outcome))
            }
            Ok(Dispatch::Completed(outcome)) => Ok(outcome),
        }
    }

    async fn run_cases(&self, plan: ExecutionPlan, cancel: &CancelSignal) -> Result<CaseRun> {
        let mut cases = plan.cases.clone();
        cases.sort_by_key(|tc| tc.id);

        let Some(lead) = cases.first() else {
            return Ok(CaseRun {
                verdicts: Vec::new(),
                short_circuited: false,
                diagnostic: None,
            });
        };

        let first = match self.dispatch(&plan.code, plan.language, lead, cancel).await {
            Dispatch::Cancelled(reason) => return Err(cancelled(plan.submission_id, reason)),
            Dispatch::Completed(outcome) => outcome,
        };

        match first.kind {
            ExecutionKind::CompileError => {
                let diagnostic = first.stderr.clone();
                info!(
                    error_preview = diagnostic.lines().next().unwrap_or(""),
                    skipped = cases.len() - 1,
                    "Compile error on first case, short-circuiting"
                );
                return Ok(CaseRun {
                    verdicts: compile_failure_verdicts(&cases, &diagnostic),
                    short_circuited: true,
                    diagnostic: Some(diagnostic),
                });
            }
            ExecutionKind::SandboxUnavailable => return Err(self.unavailable(&first)),
            _ => {}
        }

        let plan = Arc::new(plan);
        let mut join_set = JoinSet::new();
        for case in cases.iter().skip(1).cloned() {
            let this = self.clone();
            let plan = Arc::clone(&plan);
            let cancel = cancel.clone();
            join_set.spawn(async move {
                this.dispatch(&plan.code, plan.language, &case, &cancel).await
            });
        }

        let mut outcomes = vec![first];
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Dispatch::Completed(outcome))
                    if outcome.kind == ExecutionKind::SandboxUnavailable =>
                {
                    join_set.abort_all();
                    return Err(self.unavailable(&outcome));
                }
                Ok(Dispatch::Completed(outcome)) => outcomes.push(outcome),
                Ok(Dispatch::Cancelled(reason)) => {
                    join_set.abort_all();
                    return Err(cancelled(plan.submission_id, reason));
                }
                Err(e) => {
                    join_set.abort_all();
                    return Err(PipelineError::Internal(format!("dispatch task failed: {}", e)));
                }
            }
        }

        outcomes.sort_by_key(|o| o.test_id);
        let verdicts = evaluate_all(&cases, &outcomes, plan.compare_mode);
        Ok(CaseRun {
            verdicts,
            short_circuited: false,
            diagnostic: None,
        })
    }

    /// One case through the pool, retrying sandbox outages with backoff.
    async fn dispatch(
        &self,
        code: &str,
        language: Language,
        case: &TestCase,
        cancel: &CancelSignal,
    ) -> Dispatch {
        let mut attempt = 0;
        loop {
            let permit = tokio::select! {
                biased;
                reason = cancel.cancelled() => return Dispatch::Cancelled(reason),
                permit = self.pool.acquire() => permit,
            };
            let Ok(slot) = permit else {
                return Dispatch::Completed(ExecutionOutcome {
                    test_id: case.id,
                    kind: ExecutionKind::SandboxUnavailable,
                    stdout: String::new(),
                    stderr: "worker pool closed".to_string(),
                    exit_code: None,
                    duration_ms: 0,
                });
            };

            let dispatch = self
                .client
                .run(case.id, code, language, &case.input, self.case_timeout, cancel)
                .await;
            drop(slot);

            match dispatch {
                Dispatch::Completed(outcome)
                    if outcome.kind == ExecutionKind::SandboxUnavailable
                        && attempt < self.backoff.retries =>
                {
                    let delay = self.backoff.delay(attempt);
                    attempt += 1;
                    warn!(
                        test_id = case.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %outcome.stderr,
                        "Sandbox unavailable, retrying"
                    );
                    tokio::select! {
                        biased;
                        reason = cancel.cancelled() => return Dispatch::Cancelled(reason),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Dispatch::Completed(outcome) => {
                    debug!(
                        test_id = case.id,
                        kind = ?outcome.kind,
                        duration_ms = outcome.duration_ms,
                        "Case finished"
                    );
                    return Dispatch::Completed(outcome);
                }
                other @ Dispatch::Cancelled(_) => return other,
            }
        }
    }

    fn unavailable(&self, outcome: &ExecutionOutcome) -> PipelineError {
        PipelineError::SandboxUnavailable {
            attempts: self.backoff.total_attempts(),
            message: outcome.stderr.clone(),
        }
    }
}
