use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::gateway::{audit_best_effort, SessionGateway};
use super::phase::{AttemptPhase, PhaseCell};
use crate::models::{AuditEventType, AuditRequest};

/// Recoverable violations tolerated before the next one locks the attempt.
pub const MAX_RECOVERABLE: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalClass {
    Recoverable,
    ZeroTolerance,
}

/// Environment signal observed while an attempt is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegritySignal {
    VisibilityLost,
    FullscreenExited,
    /// Raised by the sentinel when another instance holds the same session.
    DuplicateSession,
}

impl IntegritySignal {
    pub fn class(self) -> SignalClass {
        match self {
            IntegritySignal::VisibilityLost | IntegritySignal::FullscreenExited => {
                SignalClass::Recoverable
            }
            IntegritySignal::DuplicateSession => SignalClass::ZeroTolerance,
        }
    }

    pub fn audit_type(self) -> AuditEventType {
        match self {
            IntegritySignal::VisibilityLost => AuditEventType::VisibilityLost,
            IntegritySignal::FullscreenExited => AuditEventType::FullscreenExited,
            IntegritySignal::DuplicateSession => AuditEventType::DuplicateSession,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationDecision {
    /// Counted but below the threshold.
    Tolerated { count: u32 },
    Lock,
    /// Attempt is no longer active; the signal was audited and nothing else.
    Ignored,
}

/// Classifies and counts integrity signals for one attempt.
///
/// Every signal is audited before the policy runs, so the evidence exists even
/// when the resulting lock or submit never reaches the server.
pub struct ViolationAggregator {
    gateway: Arc<dyn SessionGateway>,
    phase: Arc<PhaseCell>,
    max_recoverable: u32,
    recoverable_count: AtomicU32,
}

impl ViolationAggregator {
    pub fn new(gateway: Arc<dyn SessionGateway>, phase: Arc<PhaseCell>, max_recoverable: u32) -> Self {
        Self {
            gateway,
            phase,
            max_recoverable,
            recoverable_count: AtomicU32::new(0),
        }
    }

    pub fn recoverable_count(&self) -> u32 {
        self.recoverable_count.load(Ordering::Acquire)
    }

    pub async fn on_signal(&self, session_id: &str, signal: IntegritySignal) -> ViolationDecision {
        let event_type = signal.audit_type();
        audit_best_effort(
            self.gateway.as_ref(),
            session_id,
            AuditRequest::now(event_type, serde_json::json!({})),
        )
        .await;

        if self.phase.load() != AttemptPhase::Active {
            tracing::debug!(
                "Signal {} ignored in phase {}",
                event_type.as_str(),
                self.phase.load().as_str()
            );
            return ViolationDecision::Ignored;
        }

        match signal.class() {
            SignalClass::ZeroTolerance => {
                tracing::warn!(
                    "Zero-tolerance signal {} for session {}",
                    event_type.as_str(),
                    session_id
                );
                ViolationDecision::Lock
            }
            SignalClass::Recoverable => {
                let count = self.recoverable_count.fetch_add(1, Ordering::AcqRel) + 1;
                if count > self.max_recoverable {
                    tracing::warn!(
                        "Recoverable violations exceeded: session={}, count={}, max={}",
                        session_id,
                        count,
                        self.max_recoverable
                    );
                    ViolationDecision::Lock
                } else {
                    tracing::info!(
                        "Recoverable violation tolerated: session={}, count={}",
                        session_id,
                        count
                    );
                    ViolationDecision::Tolerated { count }
                }
            }
        }
    }
}
