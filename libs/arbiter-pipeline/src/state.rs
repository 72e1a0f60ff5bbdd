/// Submission State Machine
///
/// **Responsibility:**
/// The only writer of Submission records. Every write is a compare-and-set on the
/// record's version, so a stale attempt can never overwrite a newer one.
///
/// **Lifecycle:**
/// pending -> running -> evaluating -> completed | error, plus superseded from any
/// non-terminal state.
///
/// **Superseding:**
/// At most one attempt per (user, question) is tracked as active in this process.
/// Admitting a new one fires the old attempt's cancel signal and moves its record to
/// `superseded`. The version bump alone is enough to reject the old attempt's later
/// writes, even when it runs in another process.
use crate::cancel::{CancelReason, CancelSignal};
use crate::error::{PipelineError, Result, StoreError};
use crate::retry::{retry_transient, Backoff};
use crate::store::SubmissionStore;
use arbiter_common::types::{ActivityEntry, Submission, SubmissionStatus};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound on reload-and-retry rounds when forcing a terminal state.
/// Each conflict means the owner advanced, which can only happen a few times.
const MAX_FORCE_ROUNDS: usize = 8;

pub const USER_CANCELLED: &str = "cancelled by user";
pub const CALLER_ABANDONED: &str = "abandoned: request dropped before completion";

struct ActiveAttempt {
    submission_id: Uuid,
    cancel: CancelSignal,
}

/// Copy of `current` moved to `status` with the version bumped
pub fn advance(
    current: &Submission,
    status: SubmissionStatus,
    error: Option<String>,
) -> Submission {
    let mut next = current.clone();
    next.status = status;
    next.version = current.version + 1;
    next.updated_at = Utc::now();
    next.error = error;
    next
}

/// Explain a rejected write: a cancelled attempt, or a genuinely stale one.
pub(crate) async fn explain_conflict(
    store: &dyn SubmissionStore,
    id: Uuid,
    expected: u64,
) -> PipelineError {
    match store.load(&id).await {
        Ok(Some(stored)) if stored.status == SubmissionStatus::Superseded => {
            PipelineError::Cancelled(id)
        }
        Ok(Some(stored))
            if stored.status == SubmissionStatus::Error
                && stored.error.as_deref() == Some(USER_CANCELLED) =>
        {
            PipelineError::Cancelled(id)
        }
        Ok(None) => PipelineError::NotFound(format!("submission {}", id)),
        _ => PipelineError::VersionConflict { id, expected },
    }
}

pub(crate) fn persistence(backoff: &Backoff, e: StoreError) -> PipelineError {
    PipelineError::Persistence {
        attempts: backoff.total_attempts(),
        message: e.to_string(),
    }
}

pub struct SubmissionStateMachine {
    store: Arc<dyn SubmissionStore>,
    backoff: Backoff,
    active: Mutex<HashMap<(String, String), ActiveAttempt>>,
}

impl SubmissionStateMachine {
    pub fn new(store: Arc<dyn SubmissionStore>, backoff: Backoff) -> Self {
        Self {
            store,
            backoff,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub async fn load(&self, id: &Uuid) -> Result<Submission> {
        retry_transient(&self.backoff, "load", || self.store.load(id))
            .await
            .map_err(|e| persistence(&self.backoff, e))?
            .ok_or_else(|| PipelineError::NotFound(format!("submission {}", id)))
    }

    /// Persist a validated submission as `pending` and supersede the previous
    /// in-flight attempt for the same (user, question).
    #[tracing::instrument(
        skip(self, submission),
        fields(
            submission_id = %submission.id,
            user_id = %submission.user_id,
            question_id = %submission.question_id
        )
    )]
    pub async fn admit(&self, submission: &Submission) -> Result<CancelSignal> {
        retry_transient(&self.backoff, "create", || self.store.create(submission))
            .await
            .map_err(|e| persistence(&self.backoff, e))?;
        self.record(submission, "submitted", json!({ "mode": submission.mode.to_string() }))
            .await;

        let cancel = CancelSignal::new();
        let key = (submission.user_id.clone(), submission.question_id.clone());
        let prior = self.active.lock().await.insert(
            key,
            ActiveAttempt {
                submission_id: submission.id,
                cancel: cancel.clone(),
            },
        );

        if let Some(prior) = prior {
            self.supersede(prior, submission).await;
        }

        debug!(mode = %submission.mode, "Submission admitted");
        Ok(cancel)
    }

    async fn supersede(&self, prior: ActiveAttempt, by: &Submission) {
        prior.cancel.cancel(CancelReason::Superseded);
        match self.force_terminal(prior.submission_id, SubmissionStatus::Superseded, None).await {
            Ok(Some(superseded)) => {
                info!(superseded_id = %prior.submission_id, "Superseded in-flight submission");
                self.record(&superseded, "superseded", json!({ "superseded_by": by.id }))
                    .await;
            }
            Ok(None) => {
                debug!(superseded_id = %prior.submission_id, "Prior submission already finished")
            }
            Err(e) => warn!(
                superseded_id = %prior.submission_id,
                error = %e,
                "Failed to mark submission superseded"
            ),
        }
    }

    /// Move `current` to `status` under a version check.
    pub async fn transition(
        &self,
        current: &Submission,
        status: SubmissionStatus,
    ) -> Result<Submission> {
        if !current.status.can_transition_to(status) {
            return Err(PipelineError::Internal(format!(
                "illegal transition {} -> {} for submission {}",
                current.status, status, current.id
            )));
        }

        let next = advance(current, status, None);
        match retry_transient(&self.backoff, "transition", || {
            self.store.compare_and_set(&next, current.version)
        })
        .await
        {
            Ok(()) => {
                debug!(
                    submission_id = %current.id,
                    from = %current.status,
                    to = %status,
                    "Transition"
                );
                Ok(next)
            }
            Err(StoreError::VersionConflict { expected }) => {
                Err(explain_conflict(self.store.as_ref(), current.id, expected).await)
            }
            Err(StoreError::Missing(what)) => Err(PipelineError::NotFound(what)),
            Err(e) => Err(persistence(&self.backoff, e)),
        }
    }

    /// Mark an attempt `error`. Best effort: an attempt that was already superseded
    /// or finished keeps its state.
    pub async fn fail(&self, current: &Submission, message: &str) {
        match self
            .force_terminal(current.id, SubmissionStatus::Error, Some(message.to_string()))
            .await
        {
            Ok(Some(failed)) => {
                warn!(submission_id = %current.id, error = message, "Submission failed");
                self.record(&failed, "error", json!({ "error": message })).await;
            }
            Ok(None) => {}
            Err(e) => warn!(
                submission_id = %current.id,
                error = %e,
                "Failed to mark submission as error"
            ),
        }
    }

    /// Cancel an in-flight submission on the caller's request.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, id: Uuid) -> Result<Submission> {
        let current = self.load(&id).await?;
        if current.status.is_terminal() {
            return Err(PipelineError::Validation(format!(
                "submission {} is already {}",
                id, current.status
            )));
        }

        {
            let active = self.active.lock().await;
            if let Some(attempt) = active.values().find(|a| a.submission_id == id) {
                attempt.cancel.cancel(CancelReason::UserRequested);
            }
        }

        match self
            .force_terminal(id, SubmissionStatus::Error, Some(USER_CANCELLED.to_string()))
            .await?
        {
            Some(cancelled) => {
                info!(submission_id = %id, "Submission cancelled");
                self.record(&cancelled, "cancelled", json!({})).await;
                Ok(cancelled)
            }
            None => {
                let finished = self.load(&id).await?;
                Err(PipelineError::Validation(format!(
                    "submission {} is already {}",
                    id, finished.status
                )))
            }
        }
    }

    /// Forget the active attempt, if it is still the one registered for its key.
    pub async fn release(&self, submission: &Submission) {
        let key = (submission.user_id.clone(), submission.question_id.clone());
        let mut active = self.active.lock().await;
        if active.get(&key).map(|a| a.submission_id) == Some(submission.id) {
            active.remove(&key);
        }
    }

    /// Reload-and-CAS until the record is terminal. `None` when someone else finished it first.
    async fn force_terminal(
        &self,
        id: Uuid,
        status: SubmissionStatus,
        error: Option<String>,
    ) -> Result<Option<Submission>> {
        for _ in 0..MAX_FORCE_ROUNDS {
            let current = self.load(&id).await?;
            if current.status.is_terminal() {
                return Ok(None);
            }

            let next = advance(&current, status, error.clone());
            match retry_transient(&self.backoff, "force_terminal", || {
                self.store.compare_and_set(&next, current.version)
            })
            .await
            {
                Ok(()) => return Ok(Some(next)),
                Err(StoreError::VersionConflict { .. }) => continue,
                Err(StoreError::Missing(what)) => return Err(PipelineError::NotFound(what)),
                Err(e) => return Err(persistence(&self.backoff, e)),
            }
        }
        Err(PipelineError::VersionConflict { id, expected: 0 })
    }

    pub async fn record(&self, submission: &Submission, action: &str, details: serde_json::Value) {
        let entry = ActivityEntry::new(submission, action, details);
        if let Err(e) = self.store.append_activity(&entry).await {
            warn!(
                submission_id = %submission.id,
                action,
                error = %e,
                "Failed to append activity log"
            );
        }
    }

    pub fn store(&self) -> &Arc<dyn SubmissionStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use arbiter_common::types::{Language, SubmissionMode};

    fn machine(store: Arc<MemoryStore>) -> SubmissionStateMachine {
        SubmissionStateMachine::new(store, Backoff::new(2, 1, 10))
    }

    fn submission(user: &str, question: &str) -> Submission {
        Submission::new(user, question, Language::Python, "print(1)", SubmissionMode::GradedSubmit)
    }

    #[tokio::test]
    async fn test_happy_path_bumps_version() {
        let store = Arc::new(MemoryStore::new());
        let sm = machine(store.clone());
        let sub = submission("u1", "Q1");
        sm.admit(&sub).await.unwrap();

        let running = sm.transition(&sub, SubmissionStatus::Running).await.unwrap();
        let evaluating = sm.transition(&running, SubmissionStatus::Evaluating).await.unwrap();
        assert_eq!(evaluating.version, 3);
        assert_eq!(sm.load(&sub.id).await.unwrap().status, SubmissionStatus::Evaluating);
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let store = Arc::new(MemoryStore::new());
        let sm = machine(store);
        let sub = submission("u1", "Q1");
        sm.admit(&sub).await.unwrap();
        let err = sm.transition(&sub, SubmissionStatus::Completed).await.unwrap_err();
        assert!(matches!(err, PipelineError::Internal(_)));
    }

    #[tokio::test]
    async fn test_newer_attempt_supersedes_older() {
        let store = Arc::new(MemoryStore::new());
        let sm = machine(store.clone());

        let first = submission("u1", "Q1");
        let first_cancel = sm.admit(&first).await.unwrap();
        let first_running = sm.transition(&first, SubmissionStatus::Running).await.unwrap();

        let second = submission("u1", "Q1");
        sm.admit(&second).await.unwrap();

        assert_eq!(first_cancel.reason(), Some(CancelReason::Superseded));
        assert_eq!(sm.load(&first.id).await.unwrap().status, SubmissionStatus::Superseded);

        // The old attempt's next write is rejected and reported as a cancellation
        let err = sm
            .transition(&first_running, SubmissionStatus::Evaluating)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled(id) if id == first.id));

        let actions: Vec<String> = store.activity().await.into_iter().map(|a| a.action).collect();
        assert!(actions.contains(&"superseded".to_string()));
    }

    #[tokio::test]
    async fn test_other_questions_are_independent() {
        let store = Arc::new(MemoryStore::new());
        let sm = machine(store);
        let a = submission("u1", "Q1");
        let b = submission("u1", "Q2");
        let a_cancel = sm.admit(&a).await.unwrap();
        sm.admit(&b).await.unwrap();
        assert!(!a_cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_user_cancel() {
        let store = Arc::new(MemoryStore::new());
        let sm = machine(store);
        let sub = submission("u1", "Q1");
        let signal = sm.admit(&sub).await.unwrap();
        sm.transition(&sub, SubmissionStatus::Running).await.unwrap();

        let cancelled = sm.cancel(sub.id).await.unwrap();
        assert_eq!(cancelled.status, SubmissionStatus::Error);
        assert_eq!(cancelled.error.as_deref(), Some(USER_CANCELLED));
        assert_eq!(signal.reason(), Some(CancelReason::UserRequested));

        // Cancelling twice is a caller error
        assert!(matches!(sm.cancel(sub.id).await, Err(PipelineError::Validation(_))));
        assert!(matches!(sm.cancel(Uuid::new_v4()).await, Err(PipelineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_fail_keeps_superseded_state() {
        let store = Arc::new(MemoryStore::new());
        let sm = machine(store);
        let first = submission("u1", "Q1");
        sm.admit(&first).await.unwrap();
        sm.admit(&submission("u1", "Q1")).await.unwrap();

        sm.fail(&first, "sandbox unavailable").await;
        assert_eq!(sm.load(&first.id).await.unwrap().status, SubmissionStatus::Superseded);
    }

    #[tokio::test]
    async fn test_release_only_removes_own_entry() {
        let store = Arc::new(MemoryStore::new());
        let sm = machine(store);
        let first = submission("u1", "Q1");
        sm.admit(&first).await.unwrap();
        let second = submission("u1", "Q1");
        let second_cancel = sm.admit(&second).await.unwrap();

        // Late release from the superseded attempt must not unregister the newer one
        sm.release(&first).await;
        let third = submission("u1", "Q1");
        sm.admit(&third).await.unwrap();
        assert_eq!(second_cancel.reason(), Some(CancelReason::Superseded));
    }
}
