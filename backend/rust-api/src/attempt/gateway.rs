use async_trait::async_trait;

use crate::models::{AnswerRecord, AttemptResult, AuditRequest, Item, ParticipantRef};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("access code did not resolve to a subject")]
    InvalidCode,
    #[error("subject {0} not found")]
    SubjectNotFound(String),
    #[error("subject {0} has no items")]
    EmptySubject(String),
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("invalid gateway url: {0}")]
    InvalidUrl(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Errors that abort an attempt before it becomes active.
    pub fn is_initialization(&self) -> bool {
        matches!(
            self,
            GatewayError::InvalidCode
                | GatewayError::SubjectNotFound(_)
                | GatewayError::EmptySubject(_)
        )
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GatewayError::Decode(err.to_string())
        } else {
            GatewayError::Network(err.to_string())
        }
    }
}

/// Identifiers returned by a successful verify + start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedSession {
    pub subject_id: String,
    pub session_id: String,
}

/// Ordered, finite, single-pass sequence of items. Not `Clone`: re-reading the
/// items means asking the gateway again.
#[derive(Debug)]
pub struct ItemSequence {
    inner: std::vec::IntoIter<Item>,
}

impl ItemSequence {
    pub fn new(items: Vec<Item>) -> Self {
        Self {
            inner: items.into_iter(),
        }
    }
}

impl Iterator for ItemSequence {
    type Item = Item;

    fn next(&mut self) -> Option<Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for ItemSequence {}

/// Boundary between a running attempt and the remote session store.
///
/// `lock` and `submit` are idempotent on the server. `audit` is fire-and-forget
/// from the caller's point of view: see [`audit_best_effort`].
#[async_trait]
pub trait SessionGateway: Send + Sync {
    /// Verifies the access code and opens a session for the participant.
    async fn start(
        &self,
        code: &str,
        participant: &ParticipantRef,
    ) -> Result<StartedSession, GatewayError>;

    async fn fetch_items(&self, subject_id: &str) -> Result<ItemSequence, GatewayError>;

    async fn audit(&self, session_id: &str, event: &AuditRequest) -> Result<(), GatewayError>;

    async fn lock(&self, session_id: &str) -> Result<(), GatewayError>;

    async fn submit(
        &self,
        session_id: &str,
        answers: &[AnswerRecord],
    ) -> Result<AttemptResult, GatewayError>;
}

/// Sends an audit event and swallows any failure after logging it. Never retried.
pub async fn audit_best_effort(gateway: &dyn SessionGateway, session_id: &str, event: AuditRequest) {
    if let Err(e) = gateway.audit(session_id, &event).await {
        tracing::warn!(
            "Audit event dropped: session={}, type={}, error={}",
            session_id,
            event.event_type.as_str(),
            e
        );
    }
}
