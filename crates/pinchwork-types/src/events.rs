//! Marketplace notification events
//!
//! Events provide a best-effort stream of task lifecycle activity per
//! agent. A slow consumer may miss events; the lag marker lets it resync
//! by polling.

use crate::ids::{AgentId, TaskId};
use crate::task::TaskStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping every marketplace event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketEventEnvelope {
    /// Unique event ID
    pub id: Uuid,

    /// Event timestamp
    pub timestamp: DateTime<Utc>,

    /// The actual event
    pub event: MarketEvent,
}

impl MarketEventEnvelope {
    pub fn new(event: MarketEvent) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }

    /// The task this event concerns.
    pub fn task_id(&self) -> &TaskId {
        self.event.task_id()
    }
}

/// Task lifecycle events, each carrying the task id and the relevant
/// before/after fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MarketEvent {
    /// Sent to matched agents when a task becomes visible to them.
    TaskPosted {
        task_id: TaskId,
        need_preview: String,
        max_credits: u64,
    },

    /// Sent to the poster when a worker claims the task.
    TaskClaimed {
        task_id: TaskId,
        worker_id: AgentId,
    },

    /// Sent to the poster when work is delivered.
    TaskDelivered {
        task_id: TaskId,
        worker_id: AgentId,
        credits_charged: u64,
    },

    /// Sent to both poster and worker on approval.
    TaskApproved {
        task_id: TaskId,
        credits_charged: u64,
        auto: bool,
    },

    /// Sent to the worker on rejection.
    TaskRejected {
        task_id: TaskId,
        reason: String,
        rejection_count: u32,
        terminal: bool,
    },

    /// Sent to the current worker (if any) or matched agents on cancel.
    TaskCancelled { task_id: TaskId },

    /// Sent to the poster when an unclaimed task expires.
    TaskExpired {
        task_id: TaskId,
        prior_status: TaskStatus,
    },

    /// Sent to the poster when a question is asked on their task.
    TaskQuestion {
        task_id: TaskId,
        question_id: crate::ids::QuestionId,
    },

    /// Sent to the asker when their question is answered.
    QuestionAnswered {
        task_id: TaskId,
        question_id: crate::ids::QuestionId,
    },

    /// Sent to the counterparty of a mid-task message.
    TaskMessage {
        task_id: TaskId,
        message_id: crate::ids::MessageId,
        sender_id: AgentId,
    },
}

impl MarketEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            MarketEvent::TaskPosted { task_id, .. }
            | MarketEvent::TaskClaimed { task_id, .. }
            | MarketEvent::TaskDelivered { task_id, .. }
            | MarketEvent::TaskApproved { task_id, .. }
            | MarketEvent::TaskRejected { task_id, .. }
            | MarketEvent::TaskCancelled { task_id }
            | MarketEvent::TaskExpired { task_id, .. }
            | MarketEvent::TaskQuestion { task_id, .. }
            | MarketEvent::QuestionAnswered { task_id, .. }
            | MarketEvent::TaskMessage { task_id, .. } => task_id,
        }
    }
}

/// Marker surfaced to a consumer whose bounded buffer overflowed; the
/// stream dropped `missed` events and the consumer should resync by
/// polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventLag {
    pub missed: u64,
}
