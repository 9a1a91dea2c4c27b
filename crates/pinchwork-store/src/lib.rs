//! Pinchwork Store - Storage layer for the marketplace core
//!
//! Every state transition is a conditional write: a single operation that
//! checks the expected prior state and applies the new state atomically,
//! reporting whether it took effect. Balance changes and their ledger
//! entries commit in the same scope.

#![deny(unsafe_code)]

mod memory;
mod traits;

pub use memory::MemoryStore;
pub use traits::{
    AgentStore, ConversationStore, LedgerMismatch, LedgerStore, MarketStore, RatingStore,
    RejectOutcome, SettledApproval, StoreError, StoreResult, TaskRole, TaskStore,
};
