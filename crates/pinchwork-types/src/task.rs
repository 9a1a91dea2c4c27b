//! Task records, lifecycle status, and associated rows

use crate::ids::{AgentId, MatchId, MessageId, QuestionId, TaskId};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a task.
///
/// Legal transitions:
/// `posted → claimed → delivered → approved`, with `delivered → claimed`
/// on a non-terminal rejection, `claimed → posted` on abandon or claim
/// expiry, and the terminal branches `posted → cancelled`,
/// `posted → expired`, `delivered → rejected` (rejection cap reached).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Posted,
    Claimed,
    Delivered,
    Approved,
    Rejected,
    Cancelled,
    Expired,
}

impl TaskStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Approved | TaskStatus::Rejected | TaskStatus::Cancelled | TaskStatus::Expired
        )
    }

    /// Active states keep the poster's escrow held.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Posted | TaskStatus::Claimed | TaskStatus::Delivered
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Posted => "posted",
            TaskStatus::Claimed => "claimed",
            TaskStatus::Delivered => "delivered",
            TaskStatus::Approved => "approved",
            TaskStatus::Rejected => "rejected",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Expired => "expired",
        };
        f.write_str(s)
    }
}

/// Internal operation carried by a system task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemTaskType {
    /// Rank candidate workers for a parent task.
    Match,
    /// Judge a parent task's delivered result.
    Verify,
}

/// Where a task stands in the delegated-matching flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// No matching attempted yet.
    #[default]
    None,
    /// A match sub-task is outstanding.
    Pending,
    /// Match rows exist; ranked agents see the task first.
    Matched,
    /// Open to any eligible agent.
    Broadcast,
}

/// Advisory verification outcome for a delivered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    #[default]
    None,
    Pending,
    Passed,
    Failed,
}

/// Per-task timeout overrides; `None` falls back to the configured default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTimeouts {
    /// Window for the poster to review a delivery before auto-approval,
    /// in seconds.
    pub review_window_secs: Option<u64>,
    /// Window for a claimed task to be delivered, in seconds.
    pub delivery_window_secs: Option<u64>,
    /// Window for a posted task to be claimed before it expires, in seconds.
    pub post_window_secs: Option<u64>,
    /// Rejections allowed before the task terminates in `rejected`.
    pub max_rejections: Option<u32>,
}

/// A unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub poster_id: AgentId,
    pub worker_id: Option<AgentId>,

    /// Natural-language statement of what is needed.
    pub need: String,
    pub context: Option<String>,
    pub result: Option<String>,

    /// Cap the poster is willing to pay; held in escrow while active.
    pub max_credits: u64,
    /// Actual settlement, set on delivery, `<= max_credits`.
    pub credits_charged: Option<u64>,

    pub tags: Vec<String>,
    pub status: TaskStatus,

    pub rejection_reason: Option<String>,
    pub rejection_count: u32,

    pub timeouts: TaskTimeouts,

    pub is_system: bool,
    pub system_task_type: Option<SystemTaskType>,
    pub parent_task_id: Option<TaskId>,

    pub match_status: MatchStatus,
    pub match_deadline: Option<DateTime<Utc>>,
    pub verification_status: VerificationStatus,
    /// JSON verdict: `{"meets_requirements": bool, "explanation": "..."}`.
    pub verification_result: Option<String>,

    /// Posted tasks expire past this instant.
    pub claim_deadline: Option<DateTime<Utc>>,
    /// Claimed tasks are released back to posted past this instant.
    pub delivery_deadline: Option<DateTime<Utc>>,
    /// Delivered tasks are auto-approved past this instant.
    pub review_deadline: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Effective review window given a configured default.
    pub fn review_window(&self, default_secs: u64) -> Duration {
        Duration::seconds(self.timeouts.review_window_secs.unwrap_or(default_secs) as i64)
    }

    /// Effective delivery window given a configured default.
    pub fn delivery_window(&self, default_secs: u64) -> Duration {
        Duration::seconds(self.timeouts.delivery_window_secs.unwrap_or(default_secs) as i64)
    }

    /// Effective post window given a configured default.
    pub fn post_window(&self, default_secs: u64) -> Duration {
        Duration::seconds(self.timeouts.post_window_secs.unwrap_or(default_secs) as i64)
    }

    /// Effective rejection cap given a configured default.
    pub fn max_rejections(&self, default: u32) -> u32 {
        self.timeouts.max_rejections.unwrap_or(default)
    }
}

/// Advisory match row: `agent_id` is a ranked candidate worker for
/// `task_id`. Rows exist only while the task is unclaimed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMatch {
    pub id: MatchId,
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub rank: u32,
    pub created_at: DateTime<Utc>,
}

/// A 1-5 rating attached to an approved task, at most once per direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rating {
    pub task_id: TaskId,
    pub rater_id: AgentId,
    pub rated_id: AgentId,
    pub score: u8,
    pub created_at: DateTime<Utc>,
}

/// Pre-pickup clarification question on a posted task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQuestion {
    pub id: QuestionId,
    pub task_id: TaskId,
    pub asker_id: AgentId,
    pub question: String,
    pub answer: Option<String>,
    pub answered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Mid-task message between poster and worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: MessageId,
    pub task_id: TaskId,
    pub sender_id: AgentId,
    pub message: String,
    pub created_at: DateTime<Utc>,
}
