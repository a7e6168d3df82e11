use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Append-only evidence record for a session. Never updated or deleted once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    #[serde(rename = "_id")]
    pub id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub event_type: AuditEventType,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Client-reported time of the occurrence
    pub occurred_at: DateTime<Utc>,
    /// Server receive time
    pub recorded_at: DateTime<Utc>,
    /// Position in the session's trail, starting at 1. Assigned by the store.
    #[serde(default)]
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    SessionStarted,
    VisibilityLost,
    FullscreenExited,
    DuplicateSession,
    ItemTimedOut,
    LockRequested,
    Submitted,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::SessionStarted => "session_started",
            AuditEventType::VisibilityLost => "visibility_lost",
            AuditEventType::FullscreenExited => "fullscreen_exited",
            AuditEventType::DuplicateSession => "duplicate_session",
            AuditEventType::ItemTimedOut => "item_timed_out",
            AuditEventType::LockRequested => "lock_requested",
            AuditEventType::Submitted => "submitted",
        }
    }

    /// Violation types increment the session's violation counter.
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            AuditEventType::VisibilityLost
                | AuditEventType::FullscreenExited
                | AuditEventType::DuplicateSession
        )
    }
}

/// Body of `POST /sessions/{id}/audit`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRequest {
    #[serde(rename = "type")]
    pub event_type: AuditEventType,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub timestamp: Option<DateTime<Utc>>,
}

impl AuditRequest {
    pub fn now(event_type: AuditEventType, payload: serde_json::Value) -> Self {
        Self {
            event_type,
            payload,
            timestamp: Some(Utc::now()),
        }
    }
}
