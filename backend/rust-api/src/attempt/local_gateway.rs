use async_trait::async_trait;
use std::sync::Arc;

use super::gateway::{GatewayError, ItemSequence, SessionGateway, StartedSession};
use crate::models::{AnswerRecord, AttemptResult, AuditRequest, ParticipantRef};
use crate::services::session_service::{SessionError, SessionService};

/// Gateway that calls the session service in-process. Used when the attempt
/// runs next to the server and by end-to-end tests.
pub struct LocalSessionGateway {
    service: Arc<SessionService>,
}

impl LocalSessionGateway {
    pub fn new(service: Arc<SessionService>) -> Self {
        Self { service }
    }
}

impl From<SessionError> for GatewayError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::InvalidCode => GatewayError::InvalidCode,
            SessionError::SubjectNotFound(id) => GatewayError::SubjectNotFound(id),
            SessionError::SessionNotFound(id) => GatewayError::SessionNotFound(id),
            SessionError::Validation(msg) => GatewayError::Status {
                status: 400,
                body: msg,
            },
            SessionError::Store(e) => GatewayError::Status {
                status: 500,
                body: e.to_string(),
            },
        }
    }
}

#[async_trait]
impl SessionGateway for LocalSessionGateway {
    async fn start(
        &self,
        code: &str,
        participant: &ParticipantRef,
    ) -> Result<StartedSession, GatewayError> {
        let subject_id = self.service.verify_code(code).await?;
        let session = self
            .service
            .start_session(&subject_id, participant.clone())
            .await?;
        Ok(StartedSession {
            subject_id: session.subject_id,
            session_id: session.id,
        })
    }

    async fn fetch_items(&self, subject_id: &str) -> Result<ItemSequence, GatewayError> {
        let items = self.service.list_items(subject_id).await?;
        Ok(ItemSequence::new(items))
    }

    async fn audit(&self, session_id: &str, event: &AuditRequest) -> Result<(), GatewayError> {
        self.service.record_audit(session_id, event.clone()).await?;
        Ok(())
    }

    async fn lock(&self, session_id: &str) -> Result<(), GatewayError> {
        self.service.lock(session_id).await?;
        Ok(())
    }

    async fn submit(
        &self,
        session_id: &str,
        answers: &[AnswerRecord],
    ) -> Result<AttemptResult, GatewayError> {
        Ok(self.service.submit(session_id, answers.to_vec()).await?)
    }
}
