//! In-process backends: single-node development and tests.

use crate::error::StoreError;
use crate::store::{EventSink, SubmissionStore, TestCaseCatalog};
use anyhow::{bail, Context};
use arbiter_common::types::{
    ActivityEntry, DownstreamEvent, EvaluationResult, Question, Submission,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryStore {
    submissions: Mutex<HashMap<Uuid, Submission>>,
    results: Mutex<HashMap<(Uuid, u64), EvaluationResult>>,
    activity: Mutex<Vec<ActivityEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn activity(&self) -> Vec<ActivityEntry> {
        self.activity.lock().await.clone()
    }

    pub async fn result_count(&self) -> usize {
        self.results.lock().await.len()
    }

    /// Attempts by one user on one question, oldest first
    pub async fn submissions_for(&self, user_id: &str, question_id: &str) -> Vec<Submission> {
        let mut found: Vec<Submission> = self
            .submissions
            .lock()
            .await
            .values()
            .filter(|s| s.user_id == user_id && s.question_id == question_id)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.created_at);
        found
    }
}

fn guard_version(
    current: Option<&Submission>,
    id: &Uuid,
    expected_version: u64,
) -> Result<(), StoreError> {
    match current {
        None => Err(StoreError::Missing(format!("submission {}", id))),
        Some(stored) if stored.version != expected_version => {
            Err(StoreError::VersionConflict { expected: expected_version })
        }
        Some(_) => Ok(()),
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn create(&self, submission: &Submission) -> Result<(), StoreError> {
        let mut submissions = self.submissions.lock().await;
        if submissions.contains_key(&submission.id) {
            return Err(StoreError::Backend(format!("submission {} already exists", submission.id)));
        }
        submissions.insert(submission.id, submission.clone());
        Ok(())
    }

    async fn load(&self, id: &Uuid) -> Result<Option<Submission>, StoreError> {
        Ok(self.submissions.lock().await.get(id).cloned())
    }

    async fn compare_and_set(
        &self,
        next: &Submission,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let mut submissions = self.submissions.lock().await;
        guard_version(submissions.get(&next.id), &next.id, expected_version)?;
        submissions.insert(next.id, next.clone());
        Ok(())
    }

    async fn commit_evaluation(
        &self,
        next: &Submission,
        expected_version: u64,
        result: &EvaluationResult,
    ) -> Result<(), StoreError> {
        // Lock order: submissions, then results
        let mut submissions = self.submissions.lock().await;
        guard_version(submissions.get(&next.id), &next.id, expected_version)?;

        let mut results = self.results.lock().await;
        let key = (result.submission_id, result.version);
        if results.contains_key(&key) {
            return Err(StoreError::ResultExists(format!("submission {} v{}", key.0, key.1)));
        }
        results.insert(key, result.clone());
        submissions.insert(next.id, next.clone());
        Ok(())
    }

    async fn load_result(
        &self,
        id: &Uuid,
        version: u64,
    ) -> Result<Option<EvaluationResult>, StoreError> {
        Ok(self.results.lock().await.get(&(*id, version)).cloned())
    }

    async fn append_activity(&self, entry: &ActivityEntry) -> Result<(), StoreError> {
        self.activity.lock().await.push(entry.clone());
        Ok(())
    }
}

/// Question catalog as authored on disk (`config/questions.json`)
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct QuestionsFile {
    pub questions: Vec<Question>,
}

impl QuestionsFile {
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        file.check()?;
        Ok(file)
    }

    /// Question ids and per-question case ids must be unique, and every case must carry
    /// a positive weight
    pub fn check(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for question in &self.questions {
            if !seen.insert(question.id.as_str()) {
                bail!("Duplicate question id '{}'", question.id);
            }
            let mut case_ids = HashSet::new();
            for tc in &question.test_cases {
                if !case_ids.insert(tc.id) {
                    bail!("Duplicate test case id {} in question '{}'", tc.id, question.id);
                }
                if tc.weight == 0 {
                    bail!(
                        "Test case {} in question '{}' must have a positive weight",
                        tc.id,
                        question.id
                    );
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCatalog {
    questions: RwLock<HashMap<String, Question>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_questions(questions: Vec<Question>) -> Self {
        let questions = questions.into_iter().map(|q| (q.id.clone(), q)).collect();
        Self {
            questions: RwLock::new(questions),
        }
    }

    pub async fn insert(&self, question: Question) {
        self.questions.write().await.insert(question.id.clone(), question);
    }
}

#[async_trait]
impl TestCaseCatalog for MemoryCatalog {
    async fn question(&self, question_id: &str) -> Result<Option<Question>, StoreError> {
        Ok(self.questions.read().await.get(question_id).cloned())
    }
}

/// Records published events instead of delivering them
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<DownstreamEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<DownstreamEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn publish(&self, event: &DownstreamEvent) -> Result<(), StoreError> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}
