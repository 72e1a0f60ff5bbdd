use crate::types::{
    ActivityEntry, DownstreamEvent, EvaluationResult, EventKind, Question, Submission,
};
use redis::{AsyncCommands, RedisResult, Script};
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

/// Redis key semantics shared by the API, the CLI and the pipeline backends.
/// Keys are deterministic so every process agrees on where a record lives.

pub const SUBMISSION_PREFIX: &str = "arbiter:submission";
pub const RESULT_PREFIX: &str = "arbiter:result";
pub const QUESTION_PREFIX: &str = "arbiter:question";
pub const EVENTS_PREFIX: &str = "arbiter:events";
pub const ACTIVITY_KEY: &str = "arbiter:activity";

/// Submission hash: `version` field for compare-and-set, `doc` field with the JSON body
pub fn submission_key(id: &Uuid) -> String {
    format!("{}:{}", SUBMISSION_PREFIX, id)
}

pub fn result_key(id: &Uuid, version: u64) -> String {
    format!("{}:{}:{}", RESULT_PREFIX, id, version)
}

pub fn question_key(question_id: &str) -> String {
    format!("{}:{}", QUESTION_PREFIX, question_id)
}

pub fn events_key(kind: EventKind) -> String {
    format!("{}:{}", EVENTS_PREFIX, kind)
}

/// Outcome of a versioned write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied,
    VersionMismatch,
    Missing,
    ResultExists,
}

impl WriteOutcome {
    fn from_code(code: i64) -> Self {
        match code {
            1 => WriteOutcome::Applied,
            0 => WriteOutcome::VersionMismatch,
            -2 => WriteOutcome::ResultExists,
            _ => WriteOutcome::Missing,
        }
    }
}

const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
redis.call('HSET', KEYS[1], 'version', ARGV[1], 'doc', ARGV[2])
return 1
"#;

const CAS_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if not current then return -1 end
if tonumber(current) ~= tonumber(ARGV[1]) then return 0 end
redis.call('HSET', KEYS[1], 'version', ARGV[2], 'doc', ARGV[3])
return 1
"#;

// Submission update and result insert land together or not at all.
const COMMIT_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if not current then return -1 end
if tonumber(current) ~= tonumber(ARGV[1]) then return 0 end
if redis.call('EXISTS', KEYS[2]) == 1 then return -2 end
redis.call('HSET', KEYS[1], 'version', ARGV[2], 'doc', ARGV[3])
redis.call('SET', KEYS[2], ARGV[4])
return 1
"#;

fn encode<T: Serialize>(value: &T) -> RedisResult<String> {
    serde_json::to_string(value).map_err(|e| {
        redis::RedisError::from((
            redis::ErrorKind::TypeError,
            "serialization error",
            e.to_string(),
        ))
    })
}

fn decode<T: DeserializeOwned>(payload: &str) -> RedisResult<T> {
    serde_json::from_str(payload).map_err(|e| {
        redis::RedisError::from((
            redis::ErrorKind::TypeError,
            "deserialization error",
            e.to_string(),
        ))
    })
}

/// Insert a new submission record. Returns false if the id is already taken.
pub async fn create_submission(
    conn: &mut redis::aio::ConnectionManager,
    submission: &Submission,
) -> RedisResult<bool> {
    let code: i64 = Script::new(CREATE_SCRIPT)
        .key(submission_key(&submission.id))
        .arg(submission.version)
        .arg(encode(submission)?)
        .invoke_async(conn)
        .await?;
    Ok(code == 1)
}

pub async fn load_submission(
    conn: &mut redis::aio::ConnectionManager,
    id: &Uuid,
) -> RedisResult<Option<Submission>> {
    let payload: Option<String> = conn.hget(submission_key(id), "doc").await?;
    payload.as_deref().map(decode).transpose()
}

/// Replace a submission only if the stored version still equals `expected_version`
pub async fn compare_and_set_submission(
    conn: &mut redis::aio::ConnectionManager,
    next: &Submission,
    expected_version: u64,
) -> RedisResult<WriteOutcome> {
    let code: i64 = Script::new(CAS_SCRIPT)
        .key(submission_key(&next.id))
        .arg(expected_version)
        .arg(next.version)
        .arg(encode(next)?)
        .invoke_async(conn)
        .await?;
    Ok(WriteOutcome::from_code(code))
}

/// Atomically move the submission to its completed state and append its result
pub async fn commit_evaluation(
    conn: &mut redis::aio::ConnectionManager,
    next: &Submission,
    expected_version: u64,
    result: &EvaluationResult,
) -> RedisResult<WriteOutcome> {
    let code: i64 = Script::new(COMMIT_SCRIPT)
        .key(submission_key(&next.id))
        .key(result_key(&result.submission_id, result.version))
        .arg(expected_version)
        .arg(next.version)
        .arg(encode(next)?)
        .arg(encode(result)?)
        .invoke_async(conn)
        .await?;
    Ok(WriteOutcome::from_code(code))
}

pub async fn get_result(
    conn: &mut redis::aio::ConnectionManager,
    id: &Uuid,
    version: u64,
) -> RedisResult<Option<EvaluationResult>> {
    let payload: Option<String> = conn.get(result_key(id, version)).await?;
    payload.as_deref().map(decode).transpose()
}

pub async fn put_question(
    conn: &mut redis::aio::ConnectionManager,
    question: &Question,
) -> RedisResult<()> {
    conn.set(question_key(&question.id), encode(question)?).await
}

pub async fn get_question(
    conn: &mut redis::aio::ConnectionManager,
    question_id: &str,
) -> RedisResult<Option<Question>> {
    let payload: Option<String> = conn.get(question_key(question_id)).await?;
    payload.as_deref().map(decode).transpose()
}

/// Uses RPUSH so consumers can drain each event list in FIFO order
pub async fn push_event(
    conn: &mut redis::aio::ConnectionManager,
    event: &DownstreamEvent,
) -> RedisResult<()> {
    conn.rpush(events_key(event.kind), encode(event)?).await
}

pub async fn append_activity(
    conn: &mut redis::aio::ConnectionManager,
    entry: &ActivityEntry,
) -> RedisResult<()> {
    conn.rpush(ACTIVITY_KEY, encode(entry)?).await
}
