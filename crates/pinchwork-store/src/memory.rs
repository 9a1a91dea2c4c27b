//! In-memory storage implementation
//!
//! The whole market state lives behind one `RwLock`; every conditional
//! transition takes the write guard once, checks its precondition, and
//! applies the full mutation (status flip, balance moves, ledger entries)
//! before releasing it. The guard is never held across an await, so the
//! critical sections stay short and the store behaves like a per-operation
//! transaction.

use crate::traits::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pinchwork_types::{
    Agent, AgentFilter, AgentId, LedgerEntry, LedgerEntryId, LedgerReason, MatchStatus,
    ProfilePatch, Rating, SystemTaskType, Task, TaskId, TaskMatch, TaskMessage, TaskQuestion,
    TaskStatus, VerificationStatus,
};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-memory market store; the reference backend for tests and
/// single-process deployments.
pub struct MemoryStore {
    state: RwLock<State>,
}

struct State {
    agents: HashMap<AgentId, Agent>,
    tasks: HashMap<TaskId, Task>,
    matches: Vec<TaskMatch>,
    ledger: Vec<LedgerEntry>,
    sequences: HashMap<AgentId, u64>,
    ratings: Vec<Rating>,
    questions: Vec<TaskQuestion>,
    messages: Vec<TaskMessage>,
}

impl State {
    fn next_sequence(&mut self, agent_id: &AgentId) -> u64 {
        let seq = self.sequences.entry(agent_id.clone()).or_insert(0);
        *seq += 1;
        *seq
    }

    fn push_entry(
        &mut self,
        agent_id: &AgentId,
        amount: i64,
        reason: LedgerReason,
        task_id: Option<&TaskId>,
        now: DateTime<Utc>,
    ) {
        if amount == 0 {
            return;
        }
        let sequence = self.next_sequence(agent_id);
        self.ledger.push(LedgerEntry {
            id: LedgerEntryId::generate(),
            agent_id: agent_id.clone(),
            amount,
            reason,
            task_id: task_id.cloned(),
            sequence,
            created_at: now,
        });
    }

    /// Return held escrow to the poster's balance with a refund entry.
    fn refund_escrow(
        &mut self,
        poster_id: &AgentId,
        amount: u64,
        task_id: &TaskId,
        now: DateTime<Utc>,
    ) {
        if amount == 0 {
            return;
        }
        if let Some(poster) = self.agents.get_mut(poster_id) {
            if poster.is_platform {
                return;
            }
            poster.escrowed = poster.escrowed.saturating_sub(amount);
            poster.balance += amount;
            self.push_entry(
                poster_id,
                amount as i64,
                LedgerReason::EscrowRefund,
                Some(task_id),
                now,
            );
        }
    }

    fn sorted_tasks<'a>(&'a self, mut filter: impl FnMut(&Task) -> bool) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.values().filter(|t| filter(t)).cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }
}

impl MemoryStore {
    /// Create a new store with the platform agent already present.
    pub fn new() -> Self {
        let mut agents = HashMap::new();
        let platform = Agent {
            id: AgentId::platform(),
            name: "platform".to_string(),
            capabilities: None,
            accepts_system_tasks: false,
            balance: 0,
            escrowed: 0,
            initial_grant: 0,
            is_platform: true,
            suspended: false,
            suspend_reason: None,
            reputation: 0.0,
            tasks_posted: 0,
            tasks_completed: 0,
            abandon_count: 0,
            last_abandon_at: None,
            created_at: Utc::now(),
        };
        agents.insert(platform.id.clone(), platform);

        Self {
            state: RwLock::new(State {
                agents,
                tasks: HashMap::new(),
                matches: Vec::new(),
                ledger: Vec::new(),
                sequences: HashMap::new(),
                ratings: Vec::new(),
                questions: Vec::new(),
                messages: Vec::new(),
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentStore for MemoryStore {
    async fn insert_agent(&self, agent: Agent) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    async fn get_agent(&self, id: &AgentId) -> StoreResult<Option<Agent>> {
        let state = self.state.read().await;
        Ok(state.agents.get(id).cloned())
    }

    async fn list_agents(&self, filter: &AgentFilter) -> StoreResult<Vec<Agent>> {
        let state = self.state.read().await;
        let needle = filter.search.as_ref().map(|s| s.to_lowercase());
        let mut agents: Vec<Agent> = state
            .agents
            .values()
            .filter(|a| !a.is_platform)
            .filter(|a| filter.include_suspended || !a.suspended)
            .filter(|a| !filter.infra_only || a.accepts_system_tasks)
            .filter(|a| match &needle {
                Some(needle) => {
                    a.name.to_lowercase().contains(needle)
                        || a.capabilities
                            .as_deref()
                            .is_some_and(|c| c.to_lowercase().contains(needle))
                }
                None => true,
            })
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(agents)
    }

    async fn list_infra_agents(&self) -> StoreResult<Vec<Agent>> {
        let state = self.state.read().await;
        let mut agents: Vec<Agent> = state
            .agents
            .values()
            .filter(|a| a.is_infra())
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(agents)
    }

    async fn update_profile(&self, id: &AgentId, patch: ProfilePatch) -> StoreResult<Option<Agent>> {
        let mut state = self.state.write().await;
        let Some(agent) = state.agents.get_mut(id) else {
            return Ok(None);
        };
        if let Some(name) = patch.name {
            agent.name = name;
        }
        if let Some(capabilities) = patch.capabilities {
            agent.capabilities = Some(capabilities);
        }
        if let Some(accepts) = patch.accepts_system_tasks {
            agent.accepts_system_tasks = accepts;
        }
        Ok(Some(agent.clone()))
    }

    async fn set_suspended(
        &self,
        id: &AgentId,
        suspended: bool,
        reason: Option<String>,
    ) -> StoreResult<Option<Agent>> {
        let mut state = self.state.write().await;
        let Some(agent) = state.agents.get_mut(id) else {
            return Ok(None);
        };
        agent.suspended = suspended;
        agent.suspend_reason = if suspended { reason } else { None };
        Ok(Some(agent.clone()))
    }

    async fn record_abandon(&self, id: &AgentId, now: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let agent = state
            .agents
            .get_mut(id)
            .ok_or_else(|| StoreError::AgentNotFound(id.clone()))?;
        agent.abandon_count += 1;
        agent.last_abandon_at = Some(now);
        Ok(())
    }

    async fn bump_tasks_posted(&self, id: &AgentId) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if let Some(agent) = state.agents.get_mut(id) {
            agent.tasks_posted += 1;
        }
        Ok(())
    }

    async fn try_hold(
        &self,
        id: &AgentId,
        amount: u64,
        task_id: &TaskId,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let agent = state
            .agents
            .get_mut(id)
            .ok_or_else(|| StoreError::AgentNotFound(id.clone()))?;
        if agent.is_platform {
            return Ok(());
        }
        if agent.balance < amount {
            return Err(StoreError::InsufficientCredits {
                have: agent.balance,
                need: amount,
            });
        }
        agent.balance -= amount;
        agent.escrowed += amount;
        state.push_entry(id, -(amount as i64), LedgerReason::EscrowHold, Some(task_id), now);
        Ok(())
    }

    async fn credit(
        &self,
        id: &AgentId,
        amount: u64,
        reason: LedgerReason,
        task_id: Option<&TaskId>,
        now: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let agent = state
            .agents
            .get_mut(id)
            .ok_or_else(|| StoreError::AgentNotFound(id.clone()))?;
        agent.balance += amount;
        let balance = agent.balance;
        state.push_entry(id, amount as i64, reason, task_id, now);
        Ok(balance)
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: Task) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get_task(&self, id: &TaskId) -> StoreResult<Option<Task>> {
        let state = self.state.read().await;
        Ok(state.tasks.get(id).cloned())
    }

    async fn list_tasks_for_agent(
        &self,
        agent_id: &AgentId,
        role: Option<TaskRole>,
        status: Option<TaskStatus>,
    ) -> StoreResult<Vec<Task>> {
        let state = self.state.read().await;
        let mut tasks = state.sorted_tasks(|t| {
            if t.is_system {
                return false;
            }
            if let Some(status) = status {
                if t.status != status {
                    return false;
                }
            }
            let as_poster = t.poster_id == *agent_id;
            let as_worker = t.worker_id.as_ref() == Some(agent_id);
            match role {
                Some(TaskRole::Poster) => as_poster,
                Some(TaskRole::Worker) => as_worker,
                None => as_poster || as_worker,
            }
        });
        tasks.reverse();
        Ok(tasks)
    }

    async fn posted_system_tasks(&self) -> StoreResult<Vec<Task>> {
        let state = self.state.read().await;
        Ok(state.sorted_tasks(|t| t.is_system && t.status == TaskStatus::Posted))
    }

    async fn matches_for_agent(&self, agent_id: &AgentId) -> StoreResult<Vec<TaskMatch>> {
        let state = self.state.read().await;
        let mut matches: Vec<TaskMatch> = state
            .matches
            .iter()
            .filter(|m| m.agent_id == *agent_id)
            .cloned()
            .collect();
        matches.sort_by(|a, b| a.rank.cmp(&b.rank).then(a.created_at.cmp(&b.created_at)));
        Ok(matches)
    }

    async fn posted_broadcast_tasks(&self) -> StoreResult<Vec<Task>> {
        let state = self.state.read().await;
        Ok(state.sorted_tasks(|t| {
            !t.is_system
                && t.status == TaskStatus::Posted
                && matches!(t.match_status, MatchStatus::Broadcast | MatchStatus::None)
        }))
    }

    async fn posted_stale_pending_tasks(&self, now: DateTime<Utc>) -> StoreResult<Vec<Task>> {
        let state = self.state.read().await;
        Ok(state.sorted_tasks(|t| {
            !t.is_system
                && t.status == TaskStatus::Posted
                && t.match_status == MatchStatus::Pending
                && t.match_deadline.is_some_and(|d| d < now)
        }))
    }

    async fn performed_system_work(&self, parent: &TaskId, agent: &AgentId) -> StoreResult<bool> {
        let state = self.state.read().await;
        Ok(state.tasks.values().any(|t| {
            t.is_system
                && t.parent_task_id.as_ref() == Some(parent)
                && t.worker_id.as_ref() == Some(agent)
        }))
    }

    async fn works_active_subtask(&self, parent: &TaskId, agent: &AgentId) -> StoreResult<bool> {
        let state = self.state.read().await;
        Ok(state.tasks.values().any(|t| {
            t.is_system
                && t.status.is_active()
                && t.parent_task_id.as_ref() == Some(parent)
                && t.worker_id.as_ref() == Some(agent)
        }))
    }

    async fn active_system_child(
        &self,
        parent: &TaskId,
        kind: SystemTaskType,
    ) -> StoreResult<Option<Task>> {
        let state = self.state.read().await;
        Ok(state
            .tasks
            .values()
            .find(|t| {
                t.is_system
                    && t.status.is_active()
                    && t.system_task_type == Some(kind)
                    && t.parent_task_id.as_ref() == Some(parent)
            })
            .cloned())
    }

    async fn insert_matches(&self, matches: Vec<TaskMatch>) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.matches.extend(matches);
        Ok(())
    }

    async fn matches_for_task(&self, task_id: &TaskId) -> StoreResult<Vec<TaskMatch>> {
        let state = self.state.read().await;
        let mut matches: Vec<TaskMatch> = state
            .matches
            .iter()
            .filter(|m| m.task_id == *task_id)
            .cloned()
            .collect();
        matches.sort_by_key(|m| m.rank);
        Ok(matches)
    }

    async fn clear_matches(&self, task_id: &TaskId) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.matches.retain(|m| m.task_id != *task_id);
        Ok(())
    }

    async fn set_match_status(
        &self,
        task_id: &TaskId,
        status: MatchStatus,
        deadline: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.clone()))?;
        task.match_status = status;
        task.match_deadline = deadline;
        Ok(())
    }

    async fn set_verification(
        &self,
        task_id: &TaskId,
        status: VerificationStatus,
        result: Option<String>,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.clone()))?;
        task.verification_status = status;
        if result.is_some() {
            task.verification_result = result;
        }
        Ok(())
    }

    async fn try_claim(
        &self,
        id: &TaskId,
        worker: &AgentId,
        delivery_deadline: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Task>> {
        let mut state = self.state.write().await;
        let Some(task) = state.tasks.get_mut(id) else {
            return Err(StoreError::TaskNotFound(id.clone()));
        };
        if task.status != TaskStatus::Posted {
            return Ok(None);
        }
        task.status = TaskStatus::Claimed;
        task.worker_id = Some(worker.clone());
        task.claimed_at = Some(now);
        task.delivery_deadline = delivery_deadline;
        let claimed = task.clone();
        state.matches.retain(|m| m.task_id != *id);
        Ok(Some(claimed))
    }

    async fn try_deliver(
        &self,
        id: &TaskId,
        worker: &AgentId,
        result: String,
        credits_charged: u64,
        review_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Task>> {
        let mut state = self.state.write().await;
        let Some(task) = state.tasks.get_mut(id) else {
            return Err(StoreError::TaskNotFound(id.clone()));
        };
        if task.status != TaskStatus::Claimed || task.worker_id.as_ref() != Some(worker) {
            return Ok(None);
        }
        task.status = TaskStatus::Delivered;
        task.result = Some(result);
        task.credits_charged = Some(credits_charged);
        task.delivered_at = Some(now);
        task.review_deadline = Some(review_deadline);
        task.delivery_deadline = None;
        Ok(Some(task.clone()))
    }

    async fn try_settle_approval(
        &self,
        id: &TaskId,
        fee_rate: f64,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<SettledApproval>> {
        let mut state = self.state.write().await;
        let Some(task) = state.tasks.get_mut(id) else {
            return Err(StoreError::TaskNotFound(id.clone()));
        };
        if task.status != TaskStatus::Delivered || task.is_system {
            return Ok(None);
        }

        let charged = task.credits_charged.unwrap_or(task.max_credits);
        let worker_share = (charged as f64 * (1.0 - fee_rate)).floor() as u64;
        let fee = charged - worker_share;
        let refund = task.max_credits - charged;

        task.status = TaskStatus::Approved;
        task.approved_at = Some(now);
        task.review_deadline = None;
        let settled_task = task.clone();
        let poster_id = settled_task.poster_id.clone();
        let worker_id = settled_task.worker_id.clone();
        let max_credits = settled_task.max_credits;

        if let Some(poster) = state.agents.get_mut(&poster_id) {
            if !poster.is_platform {
                poster.escrowed = poster.escrowed.saturating_sub(max_credits);
                poster.balance += refund;
            }
        }
        state.push_entry(
            &poster_id,
            -(charged as i64),
            LedgerReason::EscrowRelease,
            Some(id),
            now,
        );
        state.push_entry(
            &poster_id,
            refund as i64,
            LedgerReason::EscrowRefund,
            Some(id),
            now,
        );

        if let Some(worker_id) = &worker_id {
            if let Some(worker) = state.agents.get_mut(worker_id) {
                worker.balance += worker_share;
                worker.tasks_completed += 1;
            }
            state.push_entry(worker_id, worker_share as i64, LedgerReason::Payment, Some(id), now);
        }

        let platform_id = AgentId::platform();
        if let Some(platform) = state.agents.get_mut(&platform_id) {
            platform.balance += fee;
        }
        state.push_entry(&platform_id, fee as i64, LedgerReason::Fee, Some(id), now);

        Ok(Some(SettledApproval {
            task: settled_task,
            worker_share,
            fee,
            refund,
        }))
    }

    async fn try_settle_system_approval(
        &self,
        id: &TaskId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<SettledApproval>> {
        let mut state = self.state.write().await;
        let Some(task) = state.tasks.get_mut(id) else {
            return Err(StoreError::TaskNotFound(id.clone()));
        };
        if task.status != TaskStatus::Delivered || !task.is_system {
            return Ok(None);
        }

        let charged = task.credits_charged.unwrap_or(task.max_credits);
        task.status = TaskStatus::Approved;
        task.approved_at = Some(now);
        task.review_deadline = None;
        let settled_task = task.clone();
        let worker_id = settled_task.worker_id.clone();

        // System work is paid by the platform, fee-free; the platform's
        // own balance is unbounded and is not debited.
        if let Some(worker_id) = &worker_id {
            if let Some(worker) = state.agents.get_mut(worker_id) {
                worker.balance += charged;
                worker.tasks_completed += 1;
            }
            state.push_entry(worker_id, charged as i64, LedgerReason::Payment, Some(id), now);
        }

        Ok(Some(SettledApproval {
            task: settled_task,
            worker_share: charged,
            fee: 0,
            refund: 0,
        }))
    }

    async fn try_reject(
        &self,
        id: &TaskId,
        reason: &str,
        default_max_rejections: u32,
        redelivery_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<RejectOutcome>> {
        let mut state = self.state.write().await;
        let Some(task) = state.tasks.get_mut(id) else {
            return Err(StoreError::TaskNotFound(id.clone()));
        };
        if task.status != TaskStatus::Delivered {
            return Ok(None);
        }

        task.rejection_count += 1;
        task.rejection_reason = Some(reason.to_string());
        task.result = None;
        task.credits_charged = None;
        task.delivered_at = None;
        task.review_deadline = None;
        task.verification_status = VerificationStatus::None;
        task.verification_result = None;

        let terminal = task.rejection_count >= task.max_rejections(default_max_rejections);
        if terminal {
            task.status = TaskStatus::Rejected;
            task.delivery_deadline = None;
            let rejected = task.clone();
            let poster_id = rejected.poster_id.clone();
            let refunded = rejected.max_credits;
            if !rejected.is_system {
                state.refund_escrow(&poster_id, refunded, id, now);
            }
            Ok(Some(RejectOutcome {
                task: rejected,
                terminal: true,
                refunded,
            }))
        } else {
            task.status = TaskStatus::Claimed;
            task.delivery_deadline = Some(redelivery_deadline);
            Ok(Some(RejectOutcome {
                task: task.clone(),
                terminal: false,
                refunded: 0,
            }))
        }
    }

    async fn try_cancel(&self, id: &TaskId, now: DateTime<Utc>) -> StoreResult<Option<Task>> {
        let mut state = self.state.write().await;
        let Some(task) = state.tasks.get_mut(id) else {
            return Err(StoreError::TaskNotFound(id.clone()));
        };
        if task.status != TaskStatus::Posted {
            return Ok(None);
        }
        task.status = TaskStatus::Cancelled;
        let cancelled = task.clone();
        if !cancelled.is_system {
            state.refund_escrow(&cancelled.poster_id.clone(), cancelled.max_credits, id, now);
        }
        state.matches.retain(|m| m.task_id != *id);
        Ok(Some(cancelled))
    }

    async fn try_expire(&self, id: &TaskId, now: DateTime<Utc>) -> StoreResult<Option<Task>> {
        let mut state = self.state.write().await;
        let Some(task) = state.tasks.get_mut(id) else {
            return Err(StoreError::TaskNotFound(id.clone()));
        };
        if task.status != TaskStatus::Posted {
            return Ok(None);
        }
        task.status = TaskStatus::Expired;
        let expired = task.clone();
        if !expired.is_system {
            state.refund_escrow(&expired.poster_id.clone(), expired.max_credits, id, now);
        }
        state.matches.retain(|m| m.task_id != *id);
        Ok(Some(expired))
    }

    async fn try_expire_claimed(
        &self,
        id: &TaskId,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<Task>> {
        let mut state = self.state.write().await;
        let Some(task) = state.tasks.get_mut(id) else {
            return Err(StoreError::TaskNotFound(id.clone()));
        };
        if task.status != TaskStatus::Claimed {
            return Ok(None);
        }
        task.status = TaskStatus::Expired;
        task.worker_id = None;
        task.claimed_at = None;
        task.delivery_deadline = None;
        let expired = task.clone();
        if !expired.is_system {
            state.refund_escrow(&expired.poster_id.clone(), expired.max_credits, id, now);
        }
        Ok(Some(expired))
    }

    async fn try_release_claim(
        &self,
        id: &TaskId,
        expected_worker: Option<&AgentId>,
        new_claim_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<(Task, Option<AgentId>)>> {
        let _ = now;
        let mut state = self.state.write().await;
        let Some(task) = state.tasks.get_mut(id) else {
            return Err(StoreError::TaskNotFound(id.clone()));
        };
        if task.status != TaskStatus::Claimed {
            return Ok(None);
        }
        if let Some(expected) = expected_worker {
            if task.worker_id.as_ref() != Some(expected) {
                return Ok(None);
            }
        }
        let released_worker = task.worker_id.take();
        task.status = TaskStatus::Posted;
        task.claimed_at = None;
        task.delivery_deadline = None;
        task.claim_deadline = Some(new_claim_deadline);
        task.match_status = MatchStatus::Broadcast;
        task.match_deadline = None;
        Ok(Some((task.clone(), released_worker)))
    }

    async fn claimed_past_delivery_deadline(&self, now: DateTime<Utc>) -> StoreResult<Vec<Task>> {
        let state = self.state.read().await;
        Ok(state.sorted_tasks(|t| {
            t.status == TaskStatus::Claimed && t.delivery_deadline.is_some_and(|d| d < now)
        }))
    }

    async fn posted_past_claim_deadline(&self, now: DateTime<Utc>) -> StoreResult<Vec<Task>> {
        let state = self.state.read().await;
        Ok(state.sorted_tasks(|t| {
            t.status == TaskStatus::Posted && t.claim_deadline.is_some_and(|d| d < now)
        }))
    }

    async fn delivered_past_review(&self, now: DateTime<Utc>) -> StoreResult<Vec<Task>> {
        let state = self.state.read().await;
        Ok(state.sorted_tasks(|t| {
            !t.is_system
                && t.status == TaskStatus::Delivered
                && t.review_deadline.is_some_and(|d| d < now)
        }))
    }

    async fn pending_match_past_deadline(&self, now: DateTime<Utc>) -> StoreResult<Vec<Task>> {
        let state = self.state.read().await;
        Ok(state.sorted_tasks(|t| {
            t.status == TaskStatus::Posted
                && t.match_status == MatchStatus::Pending
                && t.match_deadline.is_some_and(|d| d < now)
        }))
    }

    async fn delivered_system_past_review(&self, now: DateTime<Utc>) -> StoreResult<Vec<Task>> {
        let state = self.state.read().await;
        Ok(state.sorted_tasks(|t| {
            t.is_system
                && t.status == TaskStatus::Delivered
                && t.review_deadline.is_some_and(|d| d < now)
        }))
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn ledger_for_agent(&self, id: &AgentId, limit: usize) -> StoreResult<Vec<LedgerEntry>> {
        let state = self.state.read().await;
        let mut entries: Vec<LedgerEntry> = state
            .ledger
            .iter()
            .filter(|e| e.agent_id == *id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn verify_ledger(&self) -> StoreResult<Vec<LedgerMismatch>> {
        let state = self.state.read().await;
        let mut mismatches = Vec::new();

        for agent in state.agents.values() {
            if agent.is_platform {
                continue;
            }
            let entries = state.ledger.iter().filter(|e| e.agent_id == agent.id);
            let (balance_delta, escrow_delta) = pinchwork_types::ledger::fold_entries(entries);
            let expected_balance = agent.initial_grant as i64 + balance_delta;
            let expected_escrowed = escrow_delta;

            if expected_balance != agent.balance as i64
                || expected_escrowed != agent.escrowed as i64
            {
                tracing::error!(
                    agent_id = %agent.id,
                    expected_balance,
                    actual_balance = agent.balance,
                    expected_escrowed,
                    actual_escrowed = agent.escrowed,
                    "Ledger fold disagrees with cached balances"
                );
                mismatches.push(LedgerMismatch {
                    agent_id: agent.id.clone(),
                    expected_balance,
                    actual_balance: agent.balance,
                    expected_escrowed,
                    actual_escrowed: agent.escrowed,
                });
            }
        }

        Ok(mismatches)
    }
}

#[async_trait]
impl RatingStore for MemoryStore {
    async fn try_insert_rating(&self, rating: Rating) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let duplicate = state
            .ratings
            .iter()
            .any(|r| r.task_id == rating.task_id && r.rater_id == rating.rater_id);
        if duplicate {
            return Ok(false);
        }
        let rated_id = rating.rated_id.clone();
        state.ratings.push(rating);

        let scores: Vec<u8> = state
            .ratings
            .iter()
            .filter(|r| r.rated_id == rated_id)
            .map(|r| r.score)
            .collect();
        if let Some(agent) = state.agents.get_mut(&rated_id) {
            let mean = scores.iter().map(|s| *s as f64).sum::<f64>() / scores.len() as f64;
            agent.reputation = (mean * 100.0).round() / 100.0;
        }
        Ok(true)
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn insert_question(&self, question: TaskQuestion) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.questions.push(question);
        Ok(())
    }

    async fn count_unanswered_questions(&self, task_id: &TaskId) -> StoreResult<usize> {
        let state = self.state.read().await;
        Ok(state
            .questions
            .iter()
            .filter(|q| q.task_id == *task_id && q.answer.is_none())
            .count())
    }

    async fn try_answer_question(
        &self,
        question_id: &pinchwork_types::QuestionId,
        answer: String,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<TaskQuestion>> {
        let mut state = self.state.write().await;
        let Some(question) = state.questions.iter_mut().find(|q| q.id == *question_id) else {
            return Ok(None);
        };
        if question.answer.is_some() {
            return Ok(None);
        }
        question.answer = Some(answer);
        question.answered_at = Some(now);
        Ok(Some(question.clone()))
    }

    async fn list_questions(&self, task_id: &TaskId) -> StoreResult<Vec<TaskQuestion>> {
        let state = self.state.read().await;
        let mut questions: Vec<TaskQuestion> = state
            .questions
            .iter()
            .filter(|q| q.task_id == *task_id)
            .cloned()
            .collect();
        questions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(questions)
    }

    async fn insert_message(&self, message: TaskMessage) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.messages.push(message);
        Ok(())
    }

    async fn list_messages(&self, task_id: &TaskId) -> StoreResult<Vec<TaskMessage>> {
        let state = self.state.read().await;
        let mut messages: Vec<TaskMessage> = state
            .messages
            .iter()
            .filter(|m| m.task_id == *task_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(messages)
    }
}

#[async_trait]
impl MarketStore for MemoryStore {}
