//! Edge side of a proctored attempt: the monitor that runs one attempt, and
//! the pieces it is composed from.

pub mod broadcast;
pub mod gateway;
pub mod http_gateway;
pub mod local_gateway;
pub mod monitor;
pub mod phase;
pub mod redis_broadcast;
pub mod sentinel;
pub mod surface;
pub mod timer;
pub mod violations;

pub use broadcast::{BroadcastStore, LocalBroadcast, LocalBroadcastHub};
pub use gateway::{GatewayError, ItemSequence, SessionGateway, StartedSession};
pub use http_gateway::HttpSessionGateway;
pub use local_gateway::LocalSessionGateway;
pub use monitor::{AttemptMonitor, TerminationReason};
pub use phase::AttemptPhase;
pub use redis_broadcast::RedisBroadcast;
pub use sentinel::CrossTabSentinel;
pub use surface::{AttemptSurface, ItemView, TerminalView};
pub use violations::{IntegritySignal, ViolationAggregator, ViolationDecision, MAX_RECOVERABLE};
