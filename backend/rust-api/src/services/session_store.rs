use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::models::{AttemptResult, AuditEvent, HistoryRecord, Session, SessionState};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Result of a lock call. `newly_locked` is false for repeated calls.
#[derive(Debug, Clone)]
pub struct LockOutcome {
    pub session: Session,
    pub newly_locked: bool,
    pub previous_state: SessionState,
}

/// Result of a submission. Retries get the stored result back with `first_submission = false`.
#[derive(Debug, Clone)]
pub struct SubmissionOutcome {
    pub result: AttemptResult,
    pub first_submission: bool,
    pub previous_state: SessionState,
}

/// Persistence contract for attempt sessions: one-way lock flag, append-only audit
/// trail, and a history record written at most once per session.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: Session) -> Result<(), StoreError>;

    async fn get(&self, session_id: &str) -> Result<Session, StoreError>;

    /// Appends the event under the next sequence number of its session; violation
    /// events also bump the counter of an active session.
    async fn append_audit(&self, event: AuditEvent) -> Result<(), StoreError>;

    /// Oldest first.
    async fn list_audit(&self, session_id: &str) -> Result<Vec<AuditEvent>, StoreError>;

    async fn lock(&self, session_id: &str, now: DateTime<Utc>) -> Result<LockOutcome, StoreError>;

    async fn complete_submission(
        &self,
        session_id: &str,
        result: AttemptResult,
        history: HistoryRecord,
        now: DateTime<Utc>,
    ) -> Result<SubmissionOutcome, StoreError>;
}

#[derive(Default)]
struct MemoryTables {
    sessions: HashMap<String, Session>,
    audit: Vec<AuditEvent>,
    history: HashMap<String, HistoryRecord>,
}

/// Single-process store. Every operation runs under one mutex, which gives the
/// same at-most-once guarantees the Mongo store gets from conditional updates.
#[derive(Default)]
pub struct InMemorySessionStore {
    tables: Mutex<MemoryTables>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn history(&self, session_id: &str) -> Option<HistoryRecord> {
        self.tables().history.get(session_id).cloned()
    }

    pub fn history_len(&self) -> usize {
        self.tables().history.len()
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, MemoryTables> {
        // A panic mid-operation cannot leave a half-applied transition, so poison is safe to ignore.
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, session: Session) -> Result<(), StoreError> {
        self.tables().sessions.insert(session.id.clone(), session);
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Session, StoreError> {
        self.tables()
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))
    }

    async fn append_audit(&self, mut event: AuditEvent) -> Result<(), StoreError> {
        let mut tables = self.tables();
        let previous = tables
            .audit
            .iter()
            .filter(|e| e.session_id == event.session_id)
            .count() as u64;
        let session = tables
            .sessions
            .get_mut(&event.session_id)
            .ok_or_else(|| StoreError::NotFound(event.session_id.clone()))?;
        if event.event_type.is_violation() {
            session.register_violation();
        }
        event.sequence = previous + 1;
        tables.audit.push(event);
        Ok(())
    }

    async fn list_audit(&self, session_id: &str) -> Result<Vec<AuditEvent>, StoreError> {
        Ok(self
            .tables()
            .audit
            .iter()
            .filter(|event| event.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn lock(&self, session_id: &str, now: DateTime<Utc>) -> Result<LockOutcome, StoreError> {
        let mut tables = self.tables();
        let session = tables
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        let previous_state = session.state;
        let newly_locked = session.apply_lock(now);
        Ok(LockOutcome {
            session: session.clone(),
            newly_locked,
            previous_state,
        })
    }

    async fn complete_submission(
        &self,
        session_id: &str,
        result: AttemptResult,
        history: HistoryRecord,
        now: DateTime<Utc>,
    ) -> Result<SubmissionOutcome, StoreError> {
        let mut tables = self.tables();
        let session = tables
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        let previous_state = session.state;

        if !session.apply_submission(result, now) {
            let stored = session.result.unwrap_or(result);
            return Ok(SubmissionOutcome {
                result: stored,
                first_submission: false,
                previous_state,
            });
        }

        tables
            .history
            .entry(session_id.to_string())
            .or_insert(history);

        Ok(SubmissionOutcome {
            result,
            first_submission: true,
            previous_state,
        })
    }
}
