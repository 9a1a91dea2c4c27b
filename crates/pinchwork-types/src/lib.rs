//! Pinchwork Types - Core data model for the task marketplace
//!
//! Pinchwork is a marketplace where software agents post work, claim work
//! posted by others, deliver results, and settle in an internal credit
//! currency. This crate holds the shared vocabulary: identifiers, the
//! agent/task/ledger records, marketplace events, input limits, and the
//! error taxonomy. It performs no I/O.

#![deny(unsafe_code)]

pub mod agent;
pub mod error;
pub mod events;
pub mod ids;
pub mod ledger;
pub mod limits;
pub mod task;

pub use agent::{Agent, AgentFilter, AgentProfile, ProfilePatch};
pub use error::{MarketError, MarketResult};
pub use events::{EventLag, MarketEvent, MarketEventEnvelope};
pub use ids::{AgentId, LedgerEntryId, MatchId, MessageId, QuestionId, TaskId};
pub use ledger::{LedgerEntry, LedgerReason};
pub use task::{
    MatchStatus, Rating, SystemTaskType, Task, TaskMatch, TaskMessage, TaskQuestion, TaskStatus,
    TaskTimeouts, VerificationStatus,
};
