//! Admission-control hook
//!
//! The core does not enforce rate limits; the surrounding layer decides
//! and the service surfaces its verdict as `RateLimited`.

use pinchwork_types::{AgentId, MarketResult};

/// Kind of operation being admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Register,
    CreateTask,
    Pickup,
    Deliver,
    Review,
    Read,
    Admin,
}

/// Decides whether an operation may proceed. Implementations return
/// `MarketError::RateLimited` to refuse.
pub trait AdmissionControl: Send + Sync {
    fn admit(&self, agent: Option<&AgentId>, op: OperationKind) -> MarketResult<()>;
}

/// Default hook: everything is admitted.
pub struct AllowAll;

impl AdmissionControl for AllowAll {
    fn admit(&self, _agent: Option<&AgentId>, _op: OperationKind) -> MarketResult<()> {
        Ok(())
    }
}
