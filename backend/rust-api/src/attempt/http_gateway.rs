use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use url::Url;

use super::gateway::{GatewayError, ItemSequence, SessionGateway, StartedSession};
use crate::models::{
    AnswerRecord, AttemptResult, AuditRequest, Item, ParticipantRef, StartSessionResponse,
    VerifyCodeResponse,
};

#[derive(Debug, Serialize)]
struct VerifyCodeBody<'a> {
    code: &'a str,
}

#[derive(Debug, Serialize)]
struct StartSessionBody<'a> {
    subject_id: &'a str,
    participant: &'a ParticipantRef,
}

#[derive(Debug, Serialize)]
struct SubmitBody<'a> {
    answers: &'a [AnswerRecord],
}

/// JSON-over-HTTP gateway against the `/api/v1` routes of the session server.
pub struct HttpSessionGateway {
    http_client: Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpSessionGateway {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let mut normalized = base_url.trim().to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let base_url =
            Url::parse(&normalized).map_err(|e| GatewayError::InvalidUrl(e.to_string()))?;

        Ok(Self {
            http_client: Client::new(),
            base_url,
            timeout,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, GatewayError> {
        self.base_url
            .join(&format!("api/v1/{}", path))
            .map_err(|e| GatewayError::InvalidUrl(e.to_string()))
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, GatewayError> {
        let url = self.endpoint(path)?;
        tracing::debug!("Gateway POST {}", url);
        let response = self
            .http_client
            .post(url)
            .json(body)
            .timeout(self.timeout)
            .send()
            .await?;
        Ok(response)
    }
}

/// Passes 2xx responses through; anything else becomes `GatewayError::Status`.
async fn expect_success(response: Response) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(GatewayError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl SessionGateway for HttpSessionGateway {
    async fn start(
        &self,
        code: &str,
        participant: &ParticipantRef,
    ) -> Result<StartedSession, GatewayError> {
        let response = self.post("verify-code", &VerifyCodeBody { code }).await?;
        if matches!(
            response.status(),
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST
        ) {
            return Err(GatewayError::InvalidCode);
        }
        let verified: VerifyCodeResponse = expect_success(response).await?.json().await?;

        let response = self
            .post(
                "sessions",
                &StartSessionBody {
                    subject_id: &verified.subject_id,
                    participant,
                },
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(GatewayError::SubjectNotFound(verified.subject_id));
        }
        let started: StartSessionResponse = expect_success(response).await?.json().await?;

        tracing::info!(
            "Session opened: session={}, subject={}",
            started.session_id,
            started.subject_id
        );

        Ok(StartedSession {
            subject_id: started.subject_id,
            session_id: started.session_id,
        })
    }

    async fn fetch_items(&self, subject_id: &str) -> Result<ItemSequence, GatewayError> {
        let url = self.endpoint(&format!("subjects/{}/items", subject_id))?;
        let response = self
            .http_client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(GatewayError::SubjectNotFound(subject_id.to_string()));
        }
        let items: Vec<Item> = expect_success(response).await?.json().await?;
        Ok(ItemSequence::new(items))
    }

    async fn audit(&self, session_id: &str, event: &AuditRequest) -> Result<(), GatewayError> {
        let response = self
            .post(&format!("sessions/{}/audit", session_id), event)
            .await?;
        expect_success(response).await?;
        Ok(())
    }

    async fn lock(&self, session_id: &str) -> Result<(), GatewayError> {
        let response = self
            .post(&format!("sessions/{}/lock", session_id), &serde_json::json!({}))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(GatewayError::SessionNotFound(session_id.to_string()));
        }
        expect_success(response).await?;
        Ok(())
    }

    async fn submit(
        &self,
        session_id: &str,
        answers: &[AnswerRecord],
    ) -> Result<AttemptResult, GatewayError> {
        let response = self
            .post(&format!("sessions/{}/submit", session_id), &SubmitBody { answers })
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(GatewayError::SessionNotFound(session_id.to_string()));
        }
        let result: AttemptResult = expect_success(response).await?.json().await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_join_under_api_prefix() {
        let gateway =
            HttpSessionGateway::new("http://localhost:8081/proctor", Duration::from_secs(1))
                .unwrap();
        assert_eq!(
            gateway.endpoint("sessions/abc/lock").unwrap().as_str(),
            "http://localhost:8081/proctor/api/v1/sessions/abc/lock"
        );
    }

    #[test]
    fn rejects_unparseable_base_url() {
        let err = HttpSessionGateway::new("not a url", Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn unreachable_server_is_a_network_error() {
        // Port 9 (discard) on localhost is expected to refuse connections
        let gateway =
            HttpSessionGateway::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        let err = gateway.lock("s1").await.unwrap_err();
        assert!(matches!(err, GatewayError::Network(_)));
        assert!(!err.is_initialization());
    }
}
