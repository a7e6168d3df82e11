use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use super::question_bank::QuestionBank;
use super::session_store::{SessionStore, StoreError};
use crate::metrics::{
    ATTEMPT_AUDIT_EVENTS_TOTAL, ATTEMPT_LOCKS_TOTAL, ATTEMPT_SESSIONS_ACTIVE,
    ATTEMPT_SESSIONS_TOTAL, ATTEMPT_SUBMISSIONS_TOTAL, ATTEMPT_VIOLATIONS_TOTAL,
};
use crate::models::{
    AnswerRecord, AttemptResult, AuditEvent, AuditEventType, AuditRequest, HistoryRecord, Item,
    ParticipantRef, Session, SessionState, Subject,
};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid access code")]
    InvalidCode,
    #[error("subject {0} not found")]
    SubjectNotFound(String),
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for SessionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => SessionError::SessionNotFound(id),
            other => SessionError::Store(other),
        }
    }
}

/// Server half of the attempt protocol. Owns start, audit, lock and submit, and is
/// the only place the authoritative score is computed.
pub struct SessionService {
    store: Arc<dyn SessionStore>,
    bank: Arc<dyn QuestionBank>,
}

impl SessionService {
    pub fn new(store: Arc<dyn SessionStore>, bank: Arc<dyn QuestionBank>) -> Self {
        Self { store, bank }
    }

    pub async fn verify_code(&self, code: &str) -> Result<String, SessionError> {
        let subject_id = self
            .bank
            .resolve_code(code)
            .await?
            .ok_or(SessionError::InvalidCode)?;
        tracing::info!("Access code resolved to subject {}", subject_id);
        Ok(subject_id)
    }

    pub async fn start_session(
        &self,
        subject_id: &str,
        participant: ParticipantRef,
    ) -> Result<Session, SessionError> {
        let subject = self.load_subject(subject_id).await?;

        let now = Utc::now();
        let session = Session::new(
            Uuid::new_v4().to_string(),
            subject.id.clone(),
            subject.kind,
            participant,
            now,
        );
        self.store.create(session.clone()).await?;

        ATTEMPT_SESSIONS_TOTAL.with_label_values(&["started"]).inc();
        ATTEMPT_SESSIONS_ACTIVE.inc();

        self.append_event(
            &session.id,
            AuditRequest::now(
                AuditEventType::SessionStarted,
                serde_json::json!({ "participant": session.participant.to_string() }),
            ),
        )
        .await?;

        tracing::info!(
            "Session started: {} subject={} participant={}",
            session.id,
            session.subject_id,
            session.participant
        );
        Ok(session)
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session, SessionError> {
        Ok(self.store.get(session_id).await?)
    }

    pub async fn list_items(&self, subject_id: &str) -> Result<Vec<Item>, SessionError> {
        Ok(self.load_subject(subject_id).await?.items)
    }

    pub async fn record_audit(
        &self,
        session_id: &str,
        req: AuditRequest,
    ) -> Result<AuditEvent, SessionError> {
        let event = self.append_event(session_id, req).await?;
        if event.event_type.is_violation() {
            ATTEMPT_VIOLATIONS_TOTAL
                .with_label_values(&[event.event_type.as_str()])
                .inc();
            tracing::warn!(
                "Integrity violation recorded: session={}, type={}",
                session_id,
                event.event_type.as_str()
            );
        }
        Ok(event)
    }

    pub async fn audit_trail(&self, session_id: &str) -> Result<Vec<AuditEvent>, SessionError> {
        self.store.get(session_id).await?;
        Ok(self.store.list_audit(session_id).await?)
    }

    /// Idempotent: repeated calls converge on `locked = true` and never fail for a known session.
    pub async fn lock(&self, session_id: &str) -> Result<Session, SessionError> {
        let outcome = self.store.lock(session_id, Utc::now()).await?;

        if outcome.newly_locked {
            ATTEMPT_LOCKS_TOTAL.inc();
            if outcome.previous_state == SessionState::Active {
                ATTEMPT_SESSIONS_ACTIVE.dec();
            }
            tracing::warn!(
                "Session locked: {} (state={})",
                session_id,
                outcome.session.state.as_str()
            );
        } else {
            tracing::debug!("Repeated lock ignored: {}", session_id);
        }

        Ok(outcome.session)
    }

    /// Idempotent: the first call fixes the result and writes history, retries return it.
    /// Client-reported `is_correct` flags are ignored.
    pub async fn submit(
        &self,
        session_id: &str,
        answers: Vec<AnswerRecord>,
    ) -> Result<AttemptResult, SessionError> {
        let session = self.store.get(session_id).await?;
        let subject = self.load_subject(&session.subject_id).await?;

        let (result, rescored) = score_answers(&subject, &answers);
        let now = Utc::now();
        let history = HistoryRecord {
            session_id: session.id.clone(),
            participant: session.participant.clone(),
            subject_id: subject.id.clone(),
            score_points: result.score_points,
            correct_answers: result.correct_answers,
            answers: rescored,
            recorded_at: now,
        };

        let outcome = self
            .store
            .complete_submission(session_id, result, history, now)
            .await?;

        if outcome.first_submission {
            ATTEMPT_SUBMISSIONS_TOTAL
                .with_label_values(&["accepted"])
                .inc();
            ATTEMPT_SESSIONS_TOTAL.with_label_values(&["completed"]).inc();
            if outcome.previous_state == SessionState::Active {
                ATTEMPT_SESSIONS_ACTIVE.dec();
            }
            self.append_event(
                session_id,
                AuditRequest::now(
                    AuditEventType::Submitted,
                    serde_json::json!({
                        "score_points": outcome.result.score_points,
                        "answers": answers.len(),
                    }),
                ),
            )
            .await?;
            tracing::info!(
                "Submission accepted: session={}, score={}/{}",
                session_id,
                outcome.result.score_points,
                outcome.result.max_points
            );
        } else {
            ATTEMPT_SUBMISSIONS_TOTAL
                .with_label_values(&["duplicate"])
                .inc();
            tracing::info!("Duplicate submission ignored: session={}", session_id);
        }

        Ok(outcome.result)
    }

    async fn load_subject(&self, subject_id: &str) -> Result<Subject, SessionError> {
        self.bank
            .subject(subject_id)
            .await?
            .ok_or_else(|| SessionError::SubjectNotFound(subject_id.to_string()))
    }

    async fn append_event(
        &self,
        session_id: &str,
        req: AuditRequest,
    ) -> Result<AuditEvent, SessionError> {
        let now = Utc::now();
        let event = AuditEvent {
            id: Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            event_type: req.event_type,
            payload: req.payload,
            occurred_at: req.timestamp.unwrap_or(now),
            recorded_at: now,
            sequence: 0,
        };
        self.store.append_audit(event.clone()).await?;
        ATTEMPT_AUDIT_EVENTS_TOTAL
            .with_label_values(&[event.event_type.as_str()])
            .inc();
        Ok(event)
    }
}

/// Recomputes correctness against the bank. Unknown items and repeated item ids
/// are dropped; only the first answer per item counts.
pub fn score_answers(subject: &Subject, answers: &[AnswerRecord]) -> (AttemptResult, Vec<AnswerRecord>) {
    let mut seen = HashSet::new();
    let mut rescored = Vec::with_capacity(answers.len());
    let mut score_points = 0;
    let mut correct_answers = 0;

    for answer in answers {
        let Some(item) = subject.item(&answer.item_id) else {
            tracing::debug!("Dropping answer for unknown item {}", answer.item_id);
            continue;
        };
        if !seen.insert(item.id.as_str()) {
            continue;
        }

        let is_correct = answer
            .given
            .as_deref()
            .map(|given| item.is_correct(given))
            .unwrap_or(false);
        if is_correct {
            score_points += item.points;
            correct_answers += 1;
        }

        rescored.push(AnswerRecord {
            item_id: item.id.clone(),
            given: answer.given.clone(),
            is_correct,
            time_taken_seconds: answer.time_taken_seconds.min(item.time_limit_seconds),
        });
    }

    let result = AttemptResult {
        score_points,
        max_points: subject.max_points(),
        correct_answers,
        total_items: subject.items.len() as u32,
    };
    (result, rescored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SubjectKind;
    use crate::services::question_bank::InMemoryQuestionBank;
    use crate::services::session_store::InMemorySessionStore;

    fn item(id: &str, correct: &str, points: u32) -> Item {
        Item {
            id: id.to_string(),
            text: format!("question {}", id),
            options: vec![],
            correct_answer: correct.to_string(),
            points,
            time_limit_seconds: 20,
        }
    }

    fn subject() -> Subject {
        Subject {
            id: "quiz-1".to_string(),
            code: "CODE1".to_string(),
            kind: SubjectKind::Quiz,
            title: "Quiz".to_string(),
            items: vec![item("q1", "a", 2), item("q2", "b", 3)],
        }
    }

    fn answer(item_id: &str, given: Option<&str>, claimed: bool) -> AnswerRecord {
        AnswerRecord {
            item_id: item_id.to_string(),
            given: given.map(str::to_string),
            is_correct: claimed,
            time_taken_seconds: 5,
        }
    }

    fn service() -> (SessionService, Arc<InMemorySessionStore>) {
        let store = Arc::new(InMemorySessionStore::new());
        let bank = Arc::new(InMemoryQuestionBank::new());
        bank.insert(subject());
        (SessionService::new(store.clone(), bank), store)
    }

    #[test]
    fn client_correctness_claims_are_ignored() {
        let answers = vec![
            answer("q1", Some("wrong"), true),
            answer("q2", Some("b"), false),
        ];
        let (result, rescored) = score_answers(&subject(), &answers);

        assert_eq!(result.score_points, 3);
        assert_eq!(result.correct_answers, 1);
        assert_eq!(result.max_points, 5);
        assert!(!rescored[0].is_correct);
        assert!(rescored[1].is_correct);
    }

    #[test]
    fn unknown_and_repeated_items_do_not_score() {
        let answers = vec![
            answer("q1", Some("a"), true),
            answer("q1", Some("a"), true),
            answer("ghost", Some("a"), true),
            answer("q2", None, true),
        ];
        let (result, rescored) = score_answers(&subject(), &answers);

        assert_eq!(result.score_points, 2);
        assert_eq!(rescored.len(), 2);
    }

    #[tokio::test]
    async fn invalid_code_is_rejected() {
        let (service, _) = service();
        assert!(matches!(
            service.verify_code("NOPE").await,
            Err(SessionError::InvalidCode)
        ));
    }

    #[tokio::test]
    async fn start_audits_session_started() {
        let (service, _) = service();
        let session = service
            .start_session("quiz-1", ParticipantRef::guest("g@example.com"))
            .await
            .unwrap();

        let trail = service.audit_trail(&session.id).await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].event_type, AuditEventType::SessionStarted);
    }

    #[tokio::test]
    async fn start_for_unknown_subject_fails() {
        let (service, _) = service();
        let err = service
            .start_session("missing", ParticipantRef::user("u"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::SubjectNotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn submit_twice_writes_one_history_record() {
        let (service, store) = service();
        let session = service
            .start_session("quiz-1", ParticipantRef::user("u1"))
            .await
            .unwrap();

        let answers = vec![answer("q1", Some("a"), true)];
        let first = service.submit(&session.id, answers.clone()).await.unwrap();
        let second = service.submit(&session.id, answers).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.history_len(), 1);
        assert_eq!(
            service.get_session(&session.id).await.unwrap().state,
            SessionState::Completed
        );
    }

    #[tokio::test]
    async fn lock_then_submit_completes_locked_session() {
        let (service, _) = service();
        let session = service
            .start_session("quiz-1", ParticipantRef::user("u1"))
            .await
            .unwrap();

        let locked = service.lock(&session.id).await.unwrap();
        assert_eq!(locked.state, SessionState::Locked);
        let relocked = service.lock(&session.id).await.unwrap();
        assert_eq!(relocked.locked_at, locked.locked_at);

        service.submit(&session.id, vec![]).await.unwrap();
        let done = service.get_session(&session.id).await.unwrap();
        assert_eq!(done.state, SessionState::Completed);
        assert!(done.locked);
    }
}
