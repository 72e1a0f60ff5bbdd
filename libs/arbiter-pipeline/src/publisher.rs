/// Result Publisher
///
/// **Responsibility:**
/// - Commit a graded EvaluationResult together with the submission's move to `completed`
/// - Retry transient storage failures; never re-run sandbox work
/// - Fan out downstream notifications after a successful commit, best effort
use crate::error::{PipelineError, Result, StoreError};
use crate::retry::{retry_transient, Backoff};
use crate::state::{advance, explain_conflict, persistence};
use crate::store::{EventSink, SubmissionStore};
use arbiter_common::types::{
    DownstreamEvent, EvaluationResult, EventKind, Submission, SubmissionStatus,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct Publisher {
    store: Arc<dyn SubmissionStore>,
    events: Arc<dyn EventSink>,
    backoff: Backoff,
}

impl Publisher {
    pub fn new(
        store: Arc<dyn SubmissionStore>,
        events: Arc<dyn EventSink>,
        backoff: Backoff,
    ) -> Self {
        Self { store, events, backoff }
    }

    /// Write `result` and move `evaluating` to `completed` in one versioned transaction.
    /// The result is stored under the completed record's version.
    #[tracing::instrument(
        skip(self, evaluating, result),
        fields(submission_id = %evaluating.id, score = result.score)
    )]
    pub async fn commit(
        &self,
        evaluating: &Submission,
        mut result: EvaluationResult,
    ) -> Result<(Submission, EvaluationResult)> {
        let mut next = advance(evaluating, SubmissionStatus::Completed, None);
        next.result_version = Some(next.version);
        result.version = next.version;

        let committed = retry_transient(&self.backoff, "commit_evaluation", || {
            self.store.commit_evaluation(&next, evaluating.version, &result)
        })
        .await;

        match committed {
            Ok(()) => {
                info!(version = next.version, status = %result.status, "Evaluation committed");
                Ok((next, result))
            }
            Err(e @ (StoreError::VersionConflict { .. } | StoreError::ResultExists(_))) => {
                // A retried write may have landed before its acknowledgement was lost
                if self.already_committed(&next).await {
                    info!(version = next.version, "Evaluation already committed");
                    return Ok((next, result));
                }
                match e {
                    StoreError::VersionConflict { expected } => {
                        Err(explain_conflict(self.store.as_ref(), evaluating.id, expected).await)
                    }
                    other => Err(PipelineError::Internal(other.to_string())),
                }
            }
            Err(StoreError::Missing(what)) => Err(PipelineError::NotFound(what)),
            Err(e) => {
                warn!(
                    error = %e,
                    attempts = self.backoff.total_attempts(),
                    "Persistence retries exhausted"
                );
                Err(persistence(&self.backoff, e))
            }
        }
    }

    async fn already_committed(&self, next: &Submission) -> bool {
        matches!(
            self.store.load(&next.id).await,
            Ok(Some(stored)) if stored.version == next.version
                && stored.status == SubmissionStatus::Completed
                && stored.result_version == next.result_version
        )
    }

    /// Fire one notification per downstream collaborator. Failures are logged only.
    pub fn fan_out(
        &self,
        submission: &Submission,
        result: &EvaluationResult,
    ) -> Vec<JoinHandle<()>> {
        let verdicts = result.view().verdicts;
        [EventKind::ComputeMetrics, EventKind::GenerateSummary]
            .into_iter()
            .map(|kind| {
                let event = DownstreamEvent {
                    kind,
                    submission_id: submission.id,
                    user_id: submission.user_id.clone(),
                    question_id: submission.question_id.clone(),
                    score: result.score,
                    verdicts: verdicts.clone(),
                };
                let events = Arc::clone(&self.events);
                tokio::spawn(async move {
                    if let Err(e) = events.publish(&event).await {
                        warn!(
                            submission_id = %event.submission_id,
                            kind = %event.kind,
                            error = %e,
                            "Downstream notification failed"
                        );
                    }
                })
            })
            .collect()
    }
}
