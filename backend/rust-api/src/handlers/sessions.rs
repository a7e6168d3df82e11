use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;
use validator::Validate;

use crate::{
    models::{
        AuditRequest, LockResponse, StartSessionRequest, StartSessionResponse, SubmitRequest,
        VerifyCodeRequest, VerifyCodeResponse,
    },
    services::{session_service::SessionError, AppState},
};

type HandlerError = (StatusCode, String);

fn error_response(e: SessionError) -> HandlerError {
    let status = match &e {
        SessionError::InvalidCode
        | SessionError::SubjectNotFound(_)
        | SessionError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        SessionError::Validation(_) => StatusCode::BAD_REQUEST,
        SessionError::Store(_) => {
            tracing::error!("Session store failure: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, e.to_string())
}

fn validation_error(e: validator::ValidationErrors) -> HandlerError {
    error_response(SessionError::Validation(e.to_string()))
}

pub async fn verify_code(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VerifyCodeRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    req.validate().map_err(validation_error)?;

    let subject_id = state
        .sessions
        .verify_code(&req.code)
        .await
        .map_err(error_response)?;

    Ok((StatusCode::OK, Json(VerifyCodeResponse { subject_id })))
}

pub async fn start_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartSessionRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    req.validate().map_err(validation_error)?;

    tracing::info!(
        "Starting session for participant={}, subject_id={}",
        req.participant,
        req.subject_id
    );

    match state
        .sessions
        .start_session(&req.subject_id, req.participant)
        .await
    {
        Ok(session) => Ok((
            StatusCode::CREATED,
            Json(StartSessionResponse {
                session_id: session.id,
                subject_id: session.subject_id,
                started_at: session.started_at,
            }),
        )),
        Err(e) => {
            tracing::error!("Failed to start session: {}", e);
            Err(error_response(e))
        }
    }
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, HandlerError> {
    let session = state
        .sessions
        .get_session(&session_id)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::OK, Json(session)))
}

pub async fn list_items(
    State(state): State<Arc<AppState>>,
    Path(subject_id): Path<String>,
) -> Result<impl IntoResponse, HandlerError> {
    let items = state
        .sessions
        .list_items(&subject_id)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::OK, Json(items)))
}

pub async fn record_audit(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<AuditRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    state
        .sessions
        .record_audit(&session_id, req)
        .await
        .map_err(error_response)?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn audit_trail(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, HandlerError> {
    let events = state
        .sessions
        .audit_trail(&session_id)
        .await
        .map_err(error_response)?;
    Ok((StatusCode::OK, Json(events)))
}

pub async fn lock_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, HandlerError> {
    tracing::info!("Lock requested: session={}", session_id);

    let session = state
        .sessions
        .lock(&session_id)
        .await
        .map_err(error_response)?;

    Ok((
        StatusCode::OK,
        Json(LockResponse {
            locked: session.locked,
            state: session.state,
        }),
    ))
}

pub async fn submit_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<SubmitRequest>,
) -> Result<impl IntoResponse, HandlerError> {
    req.validate().map_err(validation_error)?;

    tracing::info!(
        "Submit requested: session={}, answers={}",
        session_id,
        req.answers.len()
    );

    match state.sessions.submit(&session_id, req.answers).await {
        Ok(result) => Ok((StatusCode::OK, Json(result))),
        Err(e) => {
            tracing::error!("Failed to submit session {}: {}", session_id, e);
            Err(error_response(e))
        }
    }
}
