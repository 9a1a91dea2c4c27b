//! Pinchwork Engine - Marketplace lifecycle, arbitration, and delegation
//!
//! The engine drives the task state machine (create, pickup, deliver,
//! approve, reject, cancel, abandon) and its credit side effects, arbitrates
//! pickups through the strict phase order, and delegates matching and
//! verification back to participating agents as recursive system tasks.

#![deny(unsafe_code)]

pub mod config;
pub mod delegation;
pub mod events;
pub mod lifecycle;
pub mod messaging;
pub mod pickup;
pub mod signals;

pub use config::MarketConfig;
pub use delegation::DelegationEngine;
pub use events::{EventBus, EventStream};
pub use lifecycle::{CreateTask, LifecycleEngine};
pub use pickup::PickupFilter;
pub use signals::TaskSignals;
