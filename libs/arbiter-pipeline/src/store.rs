//! Persistence, catalog and fan-out seams, plus their Redis implementations.
//!
//! The pipeline only talks to these traits; `memory` provides in-process versions
//! for local development and tests.

use crate::error::StoreError;
use arbiter_common::redis::{self as keys, WriteOutcome};
use arbiter_common::types::{
    ActivityEntry, DownstreamEvent, EvaluationResult, Question, Submission,
};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use uuid::Uuid;

#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn create(&self, submission: &Submission) -> Result<(), StoreError>;

    async fn load(&self, id: &Uuid) -> Result<Option<Submission>, StoreError>;

    /// Write `next` only if the stored version still equals `expected_version`.
    async fn compare_and_set(
        &self,
        next: &Submission,
        expected_version: u64,
    ) -> Result<(), StoreError>;

    /// Write `next` and append `result` in one transaction, under the same version check.
    async fn commit_evaluation(
        &self,
        next: &Submission,
        expected_version: u64,
        result: &EvaluationResult,
    ) -> Result<(), StoreError>;

    async fn load_result(
        &self,
        id: &Uuid,
        version: u64,
    ) -> Result<Option<EvaluationResult>, StoreError>;

    /// Best-effort audit trail
    async fn append_activity(&self, entry: &ActivityEntry) -> Result<(), StoreError>;
}

/// Read-only view of authored questions and their test cases
#[async_trait]
pub trait TestCaseCatalog: Send + Sync {
    /// The question with its full test-case list and comparison mode, in one read.
    /// Case order is not guaranteed; callers sort by id.
    async fn question(&self, question_id: &str) -> Result<Option<Question>, StoreError>;
}

/// Downstream collaborators (metrics, qualitative summary)
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &DownstreamEvent) -> Result<(), StoreError>;
}

fn check(outcome: WriteOutcome, id: &Uuid, expected_version: u64) -> Result<(), StoreError> {
    match outcome {
        WriteOutcome::Applied => Ok(()),
        WriteOutcome::VersionMismatch => Err(StoreError::VersionConflict {
            expected: expected_version,
        }),
        WriteOutcome::Missing => Err(StoreError::Missing(format!("submission {}", id))),
        WriteOutcome::ResultExists => Err(StoreError::ResultExists(format!("submission {}", id))),
    }
}

/// Redis-backed store, catalog and event sink sharing one connection manager
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl SubmissionStore for RedisBackend {
    async fn create(&self, submission: &Submission) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        if keys::create_submission(&mut conn, submission).await? {
            Ok(())
        } else {
            Err(StoreError::Backend(format!("submission {} already exists", submission.id)))
        }
    }

    async fn load(&self, id: &Uuid) -> Result<Option<Submission>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(keys::load_submission(&mut conn, id).await?)
    }

    async fn compare_and_set(
        &self,
        next: &Submission,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let outcome = keys::compare_and_set_submission(&mut conn, next, expected_version).await?;
        check(outcome, &next.id, expected_version)
    }

    async fn commit_evaluation(
        &self,
        next: &Submission,
        expected_version: u64,
        result: &EvaluationResult,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let outcome = keys::commit_evaluation(&mut conn, next, expected_version, result).await?;
        check(outcome, &next.id, expected_version)
    }

    async fn load_result(
        &self,
        id: &Uuid,
        version: u64,
    ) -> Result<Option<EvaluationResult>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(keys::get_result(&mut conn, id, version).await?)
    }

    async fn append_activity(&self, entry: &ActivityEntry) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        Ok(keys::append_activity(&mut conn, entry).await?)
    }
}

#[async_trait]
impl TestCaseCatalog for RedisBackend {
    async fn question(&self, question_id: &str) -> Result<Option<Question>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(keys::get_question(&mut conn, question_id).await?)
    }
}

#[async_trait]
impl EventSink for RedisBackend {
    async fn publish(&self, event: &DownstreamEvent) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        Ok(keys::push_event(&mut conn, event).await?)
    }
}
