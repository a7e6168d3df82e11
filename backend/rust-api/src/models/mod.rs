pub mod audit;
pub mod item;
pub mod session;

pub use audit::{AuditEvent, AuditEventType, AuditRequest};
pub use item::{AnswerRecord, Item, Subject};
pub use session::{
    AttemptResult, HistoryRecord, LockResponse, ParticipantRef, Session, SessionState,
    StartSessionRequest, StartSessionResponse, SubjectKind, SubmitRequest, VerifyCodeRequest,
    VerifyCodeResponse,
};
