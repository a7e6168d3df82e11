use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use validator::Validate;

use super::item::AnswerRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Quiz,
    MixedTest,
}

/// Who is taking the attempt: an anonymous guest identified by email, or a registered user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParticipantRef {
    Guest { email: String },
    User { user_id: String },
}

impl ParticipantRef {
    pub fn guest(email: impl Into<String>) -> Self {
        ParticipantRef::Guest {
            email: email.into(),
        }
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        ParticipantRef::User {
            user_id: user_id.into(),
        }
    }

    fn is_blank(&self) -> bool {
        match self {
            ParticipantRef::Guest { email } => email.trim().is_empty(),
            ParticipantRef::User { user_id } => user_id.trim().is_empty(),
        }
    }
}

impl fmt::Display for ParticipantRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParticipantRef::Guest { email } => write!(f, "guest:{}", email),
            ParticipantRef::User { user_id } => write!(f, "user:{}", user_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Locked,
    Completed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Active => "active",
            SessionState::Locked => "locked",
            SessionState::Completed => "completed",
        }
    }
}

/// Server-side record of one participant's attempt at a subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "_id")]
    pub id: String,
    pub subject_id: String,
    pub subject_kind: SubjectKind,
    pub participant: ParticipantRef,
    pub state: SessionState,
    /// One-way flag; once set it is never cleared.
    #[serde(default)]
    pub locked: bool,
    pub started_at: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub violation_count: u32,
    pub result: Option<AttemptResult>,
}

impl Session {
    pub fn new(
        id: String,
        subject_id: String,
        subject_kind: SubjectKind,
        participant: ParticipantRef,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            subject_id,
            subject_kind,
            participant,
            state: SessionState::Active,
            locked: false,
            started_at,
            locked_at: None,
            submitted_at: None,
            violation_count: 0,
            result: None,
        }
    }

    /// Sets the locked flag. Returns false when the session was already locked.
    pub fn apply_lock(&mut self, now: DateTime<Utc>) -> bool {
        if self.locked {
            return false;
        }
        self.locked = true;
        self.locked_at = Some(now);
        if self.state == SessionState::Active {
            self.state = SessionState::Locked;
        }
        true
    }

    /// Counts a violation. Only active sessions accumulate violations.
    pub fn register_violation(&mut self) -> bool {
        if self.state != SessionState::Active {
            return false;
        }
        self.violation_count += 1;
        true
    }

    /// Records the authoritative result. Returns false when a result already exists.
    pub fn apply_submission(&mut self, result: AttemptResult, now: DateTime<Utc>) -> bool {
        if self.result.is_some() {
            return false;
        }
        self.result = Some(result);
        self.submitted_at = Some(now);
        self.state = SessionState::Completed;
        true
    }
}

/// Server-computed outcome of a submitted attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptResult {
    pub score_points: u32,
    pub max_points: u32,
    pub correct_answers: u32,
    pub total_items: u32,
}

/// Downstream history row, written once per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    #[serde(rename = "_id")]
    pub session_id: String,
    pub participant: ParticipantRef,
    pub subject_id: String,
    pub score_points: u32,
    pub correct_answers: u32,
    pub answers: Vec<AnswerRecord>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct VerifyCodeRequest {
    #[validate(length(min = 1, max = 64, message = "Code must be 1-64 characters"))]
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyCodeResponse {
    pub subject_id: String,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct StartSessionRequest {
    #[validate(length(min = 1, max = 128))]
    pub subject_id: String,
    #[validate(custom(function = "validate_participant"))]
    pub participant: ParticipantRef,
}

fn validate_participant(participant: &ParticipantRef) -> Result<(), validator::ValidationError> {
    if participant.is_blank() {
        return Err(validator::ValidationError::new("participant_required"));
    }
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StartSessionResponse {
    pub session_id: String,
    pub subject_id: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockResponse {
    pub locked: bool,
    pub state: SessionState,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct SubmitRequest {
    #[validate(length(max = 1000, message = "Too many answers"))]
    pub answers: Vec<AnswerRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            "s1".to_string(),
            "quiz-1".to_string(),
            SubjectKind::Quiz,
            ParticipantRef::guest("a@b.c"),
            Utc::now(),
        )
    }

    fn result() -> AttemptResult {
        AttemptResult {
            score_points: 1,
            max_points: 2,
            correct_answers: 1,
            total_items: 2,
        }
    }

    #[test]
    fn lock_is_one_way_and_idempotent() {
        let mut s = session();
        assert!(s.apply_lock(Utc::now()));
        let first_locked_at = s.locked_at;
        assert!(!s.apply_lock(Utc::now()));
        assert_eq!(s.state, SessionState::Locked);
        assert_eq!(s.locked_at, first_locked_at);
    }

    #[test]
    fn violations_count_only_while_active() {
        let mut s = session();
        assert!(s.register_violation());
        s.apply_lock(Utc::now());
        assert!(!s.register_violation());
        assert_eq!(s.violation_count, 1);
    }

    #[test]
    fn submission_moves_locked_session_to_completed_once() {
        let mut s = session();
        s.apply_lock(Utc::now());
        assert!(s.apply_submission(result(), Utc::now()));
        assert_eq!(s.state, SessionState::Completed);
        assert!(!s.apply_submission(result(), Utc::now()));
    }

    #[test]
    fn lock_after_completion_keeps_completed_state() {
        let mut s = session();
        s.apply_submission(result(), Utc::now());
        assert!(s.apply_lock(Utc::now()));
        assert!(s.locked);
        assert_eq!(s.state, SessionState::Completed);
    }

    #[test]
    fn participant_wire_format_is_tagged() {
        let json = serde_json::to_value(ParticipantRef::guest("g@x.io")).unwrap();
        assert_eq!(json["kind"], "guest");
        assert_eq!(json["email"], "g@x.io");
    }
}
