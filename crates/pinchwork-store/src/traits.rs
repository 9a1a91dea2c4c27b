//! Storage trait definitions
//!
//! The store must support per-row conditional updates with returning,
//! monotonic per-agent ledger sequences, and ordered range queries over
//! task creation time and match rank. Nothing else is assumed about the
//! physical backend.
//!
//! Conditional transitions return `Ok(None)` when the guard does not hold
//! (a lost race or wrong prior state); the caller surfaces that as a
//! conflict. `Err` is reserved for missing rows and genuine faults.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pinchwork_types::{
    Agent, AgentFilter, AgentId, LedgerEntry, LedgerReason, MatchStatus, ProfilePatch, Rating,
    SystemTaskType, Task, TaskId, TaskMatch, TaskMessage, TaskQuestion, TaskStatus,
};
use thiserror::Error;

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Storage-level errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("agent not found: {0}")]
    AgentNotFound(AgentId),

    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("insufficient credits: have {have}, need {need}")]
    InsufficientCredits { have: u64, need: u64 },

    #[error("ledger inconsistency: {0}")]
    LedgerInconsistency(String),
}

impl From<StoreError> for pinchwork_types::MarketError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AgentNotFound(id) => {
                pinchwork_types::MarketError::NotFound(id.to_string())
            }
            StoreError::TaskNotFound(id) => pinchwork_types::MarketError::NotFound(id.to_string()),
            StoreError::InsufficientCredits { have, need } => {
                pinchwork_types::MarketError::InsufficientCredits { have, need }
            }
            StoreError::LedgerInconsistency(msg) => pinchwork_types::MarketError::Internal(msg),
        }
    }
}

/// Role an agent plays relative to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRole {
    Poster,
    Worker,
}

/// Result of a settled approval: the terminal task plus the credit split.
#[derive(Debug, Clone)]
pub struct SettledApproval {
    pub task: Task,
    /// Worker's share after the platform fee.
    pub worker_share: u64,
    /// Platform's share.
    pub fee: u64,
    /// Unused escrow returned to the poster.
    pub refund: u64,
}

/// Result of a rejection: either redeliverable or terminal with refund.
#[derive(Debug, Clone)]
pub struct RejectOutcome {
    pub task: Task,
    pub terminal: bool,
    /// Escrow refunded to the poster; nonzero only when terminal.
    pub refunded: u64,
}

/// A disagreement between the ledger fold and the cached balance scalars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerMismatch {
    pub agent_id: AgentId,
    pub expected_balance: i64,
    pub actual_balance: u64,
    pub expected_escrowed: i64,
    pub actual_escrowed: u64,
}

/// Storage for agents and their balances
#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Insert a newly registered agent.
    async fn insert_agent(&self, agent: Agent) -> StoreResult<()>;

    /// Get an agent by ID.
    async fn get_agent(&self, id: &AgentId) -> StoreResult<Option<Agent>>;

    /// List agents matching a filter, oldest first.
    async fn list_agents(&self, filter: &AgentFilter) -> StoreResult<Vec<Agent>>;

    /// Non-suspended, non-platform agents accepting system tasks.
    async fn list_infra_agents(&self) -> StoreResult<Vec<Agent>>;

    /// Apply a partial profile update.
    async fn update_profile(&self, id: &AgentId, patch: ProfilePatch) -> StoreResult<Option<Agent>>;

    /// Flip the suspension flag.
    async fn set_suspended(
        &self,
        id: &AgentId,
        suspended: bool,
        reason: Option<String>,
    ) -> StoreResult<Option<Agent>>;

    /// Bump the abandon counter and stamp the abandon time.
    async fn record_abandon(&self, id: &AgentId, now: DateTime<Utc>) -> StoreResult<()>;

    /// Bump the posted-task counter.
    async fn bump_tasks_posted(&self, id: &AgentId) -> StoreResult<()>;

    /// Move `amount` from balance into escrow, writing the hold ledger
    /// entry in the same atomic scope. The balance check and the write are
    /// one conditional update; fails with `InsufficientCredits` without
    /// side effects. Platform agents are exempt from the debit.
    async fn try_hold(
        &self,
        id: &AgentId,
        amount: u64,
        task_id: &TaskId,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    /// Credit an agent (grant or adjustment), ledgered in the same scope.
    /// Returns the new balance.
    async fn credit(
        &self,
        id: &AgentId,
        amount: u64,
        reason: LedgerReason,
        task_id: Option<&TaskId>,
        now: DateTime<Utc>,
    ) -> StoreResult<u64>;
}

/// Storage for tasks, their transitions, and match rows
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: Task) -> StoreResult<()>;

    async fn get_task(&self, id: &TaskId) -> StoreResult<Option<Task>>;

    /// Tasks where the agent is poster and/or worker, newest first.
    async fn list_tasks_for_agent(
        &self,
        agent_id: &AgentId,
        role: Option<TaskRole>,
        status: Option<TaskStatus>,
    ) -> StoreResult<Vec<Task>>;

    // --- Pickup queries ---

    /// Posted system tasks, oldest first.
    async fn posted_system_tasks(&self) -> StoreResult<Vec<Task>>;

    /// Match rows naming this agent, ordered by rank then creation time.
    async fn matches_for_agent(&self, agent_id: &AgentId) -> StoreResult<Vec<TaskMatch>>;

    /// Posted non-system tasks open to anyone (`broadcast` or `none`),
    /// oldest first.
    async fn posted_broadcast_tasks(&self) -> StoreResult<Vec<Task>>;

    /// Posted non-system tasks whose match is still `pending` but whose
    /// match deadline has elapsed, oldest first.
    async fn posted_stale_pending_tasks(&self, now: DateTime<Utc>) -> StoreResult<Vec<Task>>;

    /// Whether the agent worked a system sub-task of this parent.
    async fn performed_system_work(&self, parent: &TaskId, agent: &AgentId) -> StoreResult<bool>;

    /// Whether the agent currently works an active sub-task of this parent.
    async fn works_active_subtask(&self, parent: &TaskId, agent: &AgentId) -> StoreResult<bool>;

    /// Active (posted/claimed/delivered) system child of a given type.
    async fn active_system_child(
        &self,
        parent: &TaskId,
        kind: SystemTaskType,
    ) -> StoreResult<Option<Task>>;

    // --- Match rows ---

    async fn insert_matches(&self, matches: Vec<TaskMatch>) -> StoreResult<()>;

    async fn matches_for_task(&self, task_id: &TaskId) -> StoreResult<Vec<TaskMatch>>;

    async fn clear_matches(&self, task_id: &TaskId) -> StoreResult<()>;

    async fn set_match_status(
        &self,
        task_id: &TaskId,
        status: MatchStatus,
        deadline: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    /// Record the advisory verification verdict on a task.
    async fn set_verification(
        &self,
        task_id: &TaskId,
        status: pinchwork_types::VerificationStatus,
        result: Option<String>,
    ) -> StoreResult<()>;

    // --- Conditional transitions ---

    /// `posted → claimed`, recording the worker, the delivery deadline,
    /// and clearing match rows. `Ok(None)` on a lost race.
    async fn try_claim(
        &self,
        id: &TaskId,
        worker: &AgentId,
        delivery_deadline: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Task>>;

    /// `claimed → delivered` guarded on the expected worker.
    async fn try_deliver(
        &self,
        id: &TaskId,
        worker: &AgentId,
        result: String,
        credits_charged: u64,
        review_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Task>>;

    /// `delivered → approved` with full settlement in one transaction:
    /// escrow release to the worker (minus fee) and platform, refund of the
    /// unused remainder to the poster, three-to-four ledger entries, and
    /// the status flip.
    async fn try_settle_approval(
        &self,
        id: &TaskId,
        fee_rate: f64,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<SettledApproval>>;

    /// `delivered → approved` for a system task: zero fee, zero escrow,
    /// the worker is paid `credits_charged` by the platform.
    async fn try_settle_system_approval(
        &self,
        id: &TaskId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<SettledApproval>>;

    /// Reject a delivery. Below the rejection cap the task returns to
    /// `claimed` with a fresh delivery deadline and escrow stays held; at
    /// the cap it terminates in `rejected` with a full refund.
    async fn try_reject(
        &self,
        id: &TaskId,
        reason: &str,
        default_max_rejections: u32,
        redelivery_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<RejectOutcome>>;

    /// `posted → cancelled` with full escrow refund.
    async fn try_cancel(&self, id: &TaskId, now: DateTime<Utc>) -> StoreResult<Option<Task>>;

    /// `posted → expired` with full escrow refund (no-op refund for
    /// system tasks, which carry no escrow).
    async fn try_expire(&self, id: &TaskId, now: DateTime<Utc>) -> StoreResult<Option<Task>>;

    /// `claimed → expired` with full escrow refund; used when a claim
    /// lapses after the rejection cap was reached.
    async fn try_expire_claimed(
        &self,
        id: &TaskId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Task>>;

    /// `claimed → posted`: clears the worker, falls back to broadcast,
    /// sets a fresh claim deadline. When `expected_worker` is given the
    /// guard also requires that worker to still hold the claim. Returns
    /// the task and the released worker. Used by abandon and the
    /// claim-deadline sweep.
    async fn try_release_claim(
        &self,
        id: &TaskId,
        expected_worker: Option<&AgentId>,
        new_claim_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<(Task, Option<AgentId>)>>;

    // --- Reaper queries ---

    /// Claimed tasks past their delivery deadline, oldest first.
    async fn claimed_past_delivery_deadline(&self, now: DateTime<Utc>) -> StoreResult<Vec<Task>>;

    /// Posted tasks past their claim deadline, oldest first.
    async fn posted_past_claim_deadline(&self, now: DateTime<Utc>) -> StoreResult<Vec<Task>>;

    /// Delivered non-system tasks past their review deadline.
    async fn delivered_past_review(&self, now: DateTime<Utc>) -> StoreResult<Vec<Task>>;

    /// Tasks whose match is still pending past the match deadline.
    async fn pending_match_past_deadline(&self, now: DateTime<Utc>) -> StoreResult<Vec<Task>>;

    /// Delivered system tasks past their (short) review deadline.
    async fn delivered_system_past_review(&self, now: DateTime<Utc>) -> StoreResult<Vec<Task>>;
}

/// Storage for the append-only credit ledger
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Recent entries for an agent, newest first.
    async fn ledger_for_agent(&self, id: &AgentId, limit: usize) -> StoreResult<Vec<LedgerEntry>>;

    /// Recompute the reason-aware fold for every non-platform agent and
    /// report disagreements with the cached scalars. An inconsistency is a
    /// hard alarm.
    async fn verify_ledger(&self) -> StoreResult<Vec<LedgerMismatch>>;
}

/// Storage for ratings
#[async_trait]
pub trait RatingStore: Send + Sync {
    /// Insert a rating unless one already exists for this task and
    /// direction; recomputes the rated agent's reputation in the same
    /// scope. Returns false on a duplicate.
    async fn try_insert_rating(&self, rating: Rating) -> StoreResult<bool>;
}

/// Storage for task questions and messages
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn insert_question(&self, question: TaskQuestion) -> StoreResult<()>;

    /// Unanswered questions outstanding on a task.
    async fn count_unanswered_questions(&self, task_id: &TaskId) -> StoreResult<usize>;

    /// Record an answer unless the question was already answered.
    async fn try_answer_question(
        &self,
        question_id: &pinchwork_types::QuestionId,
        answer: String,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<TaskQuestion>>;

    async fn list_questions(&self, task_id: &TaskId) -> StoreResult<Vec<TaskQuestion>>;

    async fn insert_message(&self, message: TaskMessage) -> StoreResult<()>;

    async fn list_messages(&self, task_id: &TaskId) -> StoreResult<Vec<TaskMessage>>;
}

/// Combined storage trait
#[async_trait]
pub trait MarketStore:
    AgentStore + TaskStore + LedgerStore + RatingStore + ConversationStore + Send + Sync
{
}
