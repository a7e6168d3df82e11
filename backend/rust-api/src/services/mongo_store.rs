use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, to_bson, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::ReturnDocument;
use mongodb::{Collection, Database};

use super::session_store::{LockOutcome, SessionStore, StoreError, SubmissionOutcome};
use crate::metrics::track_store_operation;
use crate::models::{AttemptResult, AuditEvent, HistoryRecord, Session};
use crate::utils::retry::{retry_async_if, RetryConfig};

const SESSIONS: &str = "attempt_sessions";
const AUDIT_EVENTS: &str = "attempt_audit_events";
const HISTORY: &str = "attempt_history";

/// MongoDB-backed store. At-most-once semantics come from conditional updates
/// (`locked: false`, `result: null`) and the session id being the history `_id`.
pub struct MongoSessionStore {
    mongo: Database,
}

impl MongoSessionStore {
    pub fn new(mongo: Database) -> Self {
        Self { mongo }
    }

    fn sessions(&self) -> Collection<Session> {
        self.mongo.collection(SESSIONS)
    }

    fn audit_events(&self) -> Collection<AuditEvent> {
        self.mongo.collection(AUDIT_EVENTS)
    }

    fn history(&self) -> Collection<HistoryRecord> {
        self.mongo.collection(HISTORY)
    }

    /// Bumps the session's audit counter; also the existence check for the session.
    async fn next_audit_sequence(&self, session_id: &str) -> Result<u64, StoreError> {
        let updated = track_store_operation("update", SESSIONS, async {
            self.mongo
                .collection::<Document>(SESSIONS)
                .find_one_and_update(
                    doc! { "_id": session_id },
                    doc! { "$inc": { "audit_seq": 1_i64 } },
                )
                .return_document(ReturnDocument::After)
                .await
                .context("Failed to allocate audit sequence")
        })
        .await?
        .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;

        let sequence = updated
            .get_i64("audit_seq")
            .context("Session audit counter is not an integer")?;
        Ok(sequence as u64)
    }

    async fn write_history(&self, history: &HistoryRecord) -> Result<(), StoreError> {
        let collection = self.history();
        let res = retry_async_if(
            RetryConfig::aggressive(),
            || async { collection.insert_one(history).await.map(|_| ()) },
            |e| !is_duplicate_key(e),
        )
        .await;

        match res {
            Ok(()) => {
                tracing::info!("History record saved: session={}", history.session_id);
                Ok(())
            }
            Err(e) if is_duplicate_key(&e) => {
                tracing::debug!(
                    "History record already present: session={}",
                    history.session_id
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    "History write failed after retries: session={}, error={:#?}",
                    history.session_id,
                    e
                );
                Err(StoreError::Backend(
                    anyhow::Error::new(e).context("Failed to persist history record"),
                ))
            }
        }
    }
}

fn audit_trail_order() -> Document {
    doc! { "sequence": 1 }
}

fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    matches!(
        *error.kind,
        ErrorKind::Write(WriteFailure::WriteError(ref we)) if we.code == 11000
    )
}

#[async_trait]
impl SessionStore for MongoSessionStore {
    async fn create(&self, session: Session) -> Result<(), StoreError> {
        track_store_operation("insert", SESSIONS, async {
            self.sessions()
                .insert_one(&session)
                .await
                .context("Failed to insert session")
        })
        .await?;
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Session, StoreError> {
        track_store_operation("find_one", SESSIONS, async {
            self.sessions()
                .find_one(doc! { "_id": session_id })
                .await
                .context("Failed to query session")
        })
        .await?
        .ok_or_else(|| StoreError::NotFound(session_id.to_string()))
    }

    async fn append_audit(&self, mut event: AuditEvent) -> Result<(), StoreError> {
        // Timestamps do not order reliably: equal instants, and RFC 3339 strings
        // with varying fraction digits
        event.sequence = self.next_audit_sequence(&event.session_id).await?;

        track_store_operation("insert", AUDIT_EVENTS, async {
            self.audit_events()
                .insert_one(&event)
                .await
                .context("Failed to append audit event")
        })
        .await?;

        if event.event_type.is_violation() {
            track_store_operation("update", SESSIONS, async {
                self.sessions()
                    .update_one(
                        doc! { "_id": event.session_id.as_str(), "state": "active" },
                        doc! { "$inc": { "violation_count": 1 } },
                    )
                    .await
                    .context("Failed to increment violation count")
            })
            .await?;
        }

        Ok(())
    }

    async fn list_audit(&self, session_id: &str) -> Result<Vec<AuditEvent>, StoreError> {
        let events = track_store_operation("find", AUDIT_EVENTS, async {
            let cursor = self
                .audit_events()
                .find(doc! { "session_id": session_id })
                .sort(audit_trail_order())
                .await
                .context("Failed to query audit events")?;
            cursor
                .try_collect::<Vec<_>>()
                .await
                .context("Failed to read audit events")
        })
        .await?;
        Ok(events)
    }

    async fn lock(&self, session_id: &str, now: DateTime<Utc>) -> Result<LockOutcome, StoreError> {
        let before = self.get(session_id).await?;
        let locked_at = to_bson(&now).context("Failed to encode lock timestamp")?;

        // Pipeline update: flip the flag once, move active -> locked, leave completed alone
        let update = vec![doc! {
            "$set": {
                "locked": true,
                "locked_at": locked_at,
                "state": {
                    "$cond": [{ "$eq": ["$state", "active"] }, "locked", "$state"]
                },
            }
        }];

        let res = track_store_operation("update", SESSIONS, async {
            self.sessions()
                .update_one(doc! { "_id": session_id, "locked": false }, update)
                .await
                .context("Failed to lock session")
        })
        .await?;

        let session = self.get(session_id).await?;
        Ok(LockOutcome {
            session,
            newly_locked: res.modified_count == 1,
            previous_state: before.state,
        })
    }

    async fn complete_submission(
        &self,
        session_id: &str,
        result: AttemptResult,
        history: HistoryRecord,
        now: DateTime<Utc>,
    ) -> Result<SubmissionOutcome, StoreError> {
        let before = self.get(session_id).await?;
        let result_bson = to_bson(&result).context("Failed to encode result")?;
        let submitted_at = to_bson(&now).context("Failed to encode submit timestamp")?;

        let res = track_store_operation("update", SESSIONS, async {
            self.sessions()
                .update_one(
                    doc! { "_id": session_id, "result": null },
                    doc! { "$set": {
                        "result": result_bson,
                        "submitted_at": submitted_at,
                        "state": "completed",
                    } },
                )
                .await
                .context("Failed to record submission")
        })
        .await?;

        if res.matched_count == 0 {
            let stored = self.get(session_id).await?.result.unwrap_or(result);
            // A retry of the same answers heals a history write lost on the first call
            if stored == result {
                self.write_history(&history).await?;
            }
            return Ok(SubmissionOutcome {
                result: stored,
                first_submission: false,
                previous_state: before.state,
            });
        }

        self.write_history(&history).await?;

        Ok(SubmissionOutcome {
            result,
            first_submission: true,
            previous_state: before.state,
        })
    }
}
