//! Pinchwork Service - the unified marketplace facade
//!
//! Aggregates the store, lifecycle engine, and reaper behind the service
//! contract the outer layers (HTTP, streaming transport, CLI) consume:
//! registration, task lifecycle, pickup, credits, events, and admin
//! operations.

#![deny(unsafe_code)]

mod admission;

pub use admission::{AdmissionControl, AllowAll, OperationKind};
pub use pinchwork_engine::{CreateTask, EventStream, MarketConfig, PickupFilter};
pub use pinchwork_reaper::{Reaper, ReaperConfig};

use chrono::Utc;
use pinchwork_engine::LifecycleEngine;
use pinchwork_reaper::SweepReport;
use pinchwork_store::{
    AgentStore, LedgerMismatch, LedgerStore, MarketStore, MemoryStore, RatingStore, TaskStore,
};
pub use pinchwork_store::TaskRole;
use pinchwork_types::{
    limits, Agent, AgentFilter, AgentId, AgentProfile, LedgerEntry, LedgerReason, MarketError,
    MarketResult, ProfilePatch, QuestionId, Rating, Task, TaskId, TaskMessage, TaskQuestion,
    TaskStatus,
};

use std::sync::Arc;
use tracing::info;

/// Balance summary returned by `get_credits`.
#[derive(Debug, Clone)]
pub struct CreditReport {
    pub balance: u64,
    pub escrowed: u64,
    pub recent: Vec<LedgerEntry>,
}

/// Ledger entries included in a credit report.
const RECENT_LEDGER_LIMIT: usize = 50;

/// The marketplace service.
pub struct MarketplaceService {
    store: Arc<dyn MarketStore>,
    engine: Arc<LifecycleEngine>,
    admission: Arc<dyn AdmissionControl>,
}

impl MarketplaceService {
    /// Create a service over a fresh in-memory store.
    pub fn new(config: MarketConfig) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), config)
    }

    /// Create a service over an existing store.
    pub fn with_store(store: Arc<dyn MarketStore>, config: MarketConfig) -> Self {
        let engine = Arc::new(LifecycleEngine::new(store.clone(), config));
        Self {
            store,
            engine,
            admission: Arc::new(AllowAll),
        }
    }

    /// Replace the admission-control hook.
    pub fn with_admission(mut self, admission: Arc<dyn AdmissionControl>) -> Self {
        self.admission = admission;
        self
    }

    pub fn engine(&self) -> &Arc<LifecycleEngine> {
        &self.engine
    }

    pub fn config(&self) -> &MarketConfig {
        self.engine.config()
    }

    /// Spawn the reaper loop on the current runtime.
    pub fn start_reaper(&self, config: ReaperConfig) -> Arc<Reaper> {
        let (reaper, trigger_rx) = Reaper::new(self.engine.clone(), config);
        tokio::spawn(reaper.clone().start(trigger_rx));
        reaper
    }

    /// Run one reaper sweep inline, without the background loop.
    pub async fn sweep_once(&self) -> MarketResult<SweepReport> {
        let (reaper, _rx) = Reaper::new(self.engine.clone(), ReaperConfig::default());
        reaper.sweep().await
    }

    // ============ Agents ============

    /// Register a new agent with the configured initial grant. The grant
    /// is the fold baseline and is not ledgered.
    pub async fn register(&self, profile: AgentProfile) -> MarketResult<Agent> {
        self.admission.admit(None, OperationKind::Register)?;
        limits::validate_name(&profile.name)?;
        if let Some(capabilities) = &profile.capabilities {
            limits::validate_capabilities(capabilities)?;
        }

        let config = self.engine.config();
        let agent = Agent {
            id: AgentId::generate(),
            name: profile.name,
            capabilities: profile.capabilities,
            accepts_system_tasks: profile.accepts_system_tasks,
            balance: config.initial_credits,
            escrowed: 0,
            initial_grant: config.initial_credits,
            is_platform: false,
            suspended: false,
            suspend_reason: None,
            reputation: 0.0,
            tasks_posted: 0,
            tasks_completed: 0,
            abandon_count: 0,
            last_abandon_at: None,
            created_at: Utc::now(),
        };
        self.store.insert_agent(agent.clone()).await?;
        info!(agent_id = %agent.id, name = %agent.name, "Agent registered");
        Ok(agent)
    }

    pub async fn get_agent(&self, id: &AgentId) -> MarketResult<Agent> {
        self.store
            .get_agent(id)
            .await?
            .ok_or_else(|| MarketError::NotFound(id.to_string()))
    }

    pub async fn list_agents(&self, filter: &AgentFilter) -> MarketResult<Vec<Agent>> {
        Ok(self.store.list_agents(filter).await?)
    }

    pub async fn update_profile(
        &self,
        id: &AgentId,
        patch: ProfilePatch,
    ) -> MarketResult<Agent> {
        if let Some(name) = &patch.name {
            limits::validate_name(name)?;
        }
        if let Some(capabilities) = &patch.capabilities {
            limits::validate_capabilities(capabilities)?;
        }
        self.store
            .update_profile(id, patch)
            .await?
            .ok_or_else(|| MarketError::NotFound(id.to_string()))
    }

    // ============ Task lifecycle ============

    pub async fn create_task(&self, poster: &AgentId, input: CreateTask) -> MarketResult<Task> {
        self.admission.admit(Some(poster), OperationKind::CreateTask)?;
        self.engine.create_task(poster, input).await
    }

    /// Fetch a task, optionally blocking up to `wait_secs` (capped by
    /// configuration) until it is delivered or terminal.
    pub async fn get_task(
        &self,
        task_id: &TaskId,
        wait_secs: Option<u64>,
    ) -> MarketResult<Task> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| MarketError::NotFound(task_id.to_string()))?;

        let Some(wait_secs) = wait_secs else {
            return Ok(task);
        };
        if Self::wait_done(&task) {
            return Ok(task);
        }

        let wait_secs = wait_secs.min(self.engine.config().max_wait_secs);
        let deadline =
            tokio::time::Instant::now() + std::time::Duration::from_secs(wait_secs);
        let notify = self.engine.signals().handle(task_id);

        loop {
            // Enable the waiter before re-reading so a wake between the
            // check and the sleep is not lost.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let task = self
                .store
                .get_task(task_id)
                .await?
                .ok_or_else(|| MarketError::NotFound(task_id.to_string()))?;
            if Self::wait_done(&task) {
                return Ok(task);
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    // One final read so a wake lost to the timeout race
                    // still returns fresh state.
                    return self
                        .store
                        .get_task(task_id)
                        .await?
                        .ok_or_else(|| MarketError::NotFound(task_id.to_string()));
                }
            }
        }
    }

    fn wait_done(task: &Task) -> bool {
        task.status == TaskStatus::Delivered || task.status.is_terminal()
    }

    pub async fn pickup_next(
        &self,
        worker: &AgentId,
        filter: &PickupFilter,
    ) -> MarketResult<Option<Task>> {
        self.admission.admit(Some(worker), OperationKind::Pickup)?;
        self.engine.pickup_next(worker, filter).await
    }

    pub async fn pickup_specific(&self, worker: &AgentId, task_id: &TaskId) -> MarketResult<Task> {
        self.admission.admit(Some(worker), OperationKind::Pickup)?;
        self.engine.pickup_specific(worker, task_id).await
    }

    /// Claim up to `count` tasks; each claim is individually atomic.
    pub async fn pickup_batch(
        &self,
        worker: &AgentId,
        count: usize,
        filter: &PickupFilter,
    ) -> MarketResult<Vec<Task>> {
        self.admission.admit(Some(worker), OperationKind::Pickup)?;
        let mut claimed = Vec::new();
        for _ in 0..count {
            match self.engine.pickup_next(worker, filter).await? {
                Some(task) => claimed.push(task),
                None => break,
            }
        }
        Ok(claimed)
    }

    pub async fn deliver_task(
        &self,
        worker: &AgentId,
        task_id: &TaskId,
        result: String,
        credits_claimed: Option<u64>,
    ) -> MarketResult<Task> {
        self.admission.admit(Some(worker), OperationKind::Deliver)?;
        self.engine
            .deliver_task(worker, task_id, result, credits_claimed)
            .await
    }

    pub async fn approve_task(
        &self,
        poster: &AgentId,
        task_id: &TaskId,
        rating: Option<u8>,
    ) -> MarketResult<Task> {
        self.admission.admit(Some(poster), OperationKind::Review)?;
        self.engine.approve_task(poster, task_id, rating).await
    }

    pub async fn reject_task(
        &self,
        poster: &AgentId,
        task_id: &TaskId,
        reason: String,
        feedback: Option<String>,
    ) -> MarketResult<Task> {
        self.admission.admit(Some(poster), OperationKind::Review)?;
        self.engine
            .reject_task(poster, task_id, reason, feedback)
            .await
    }

    pub async fn cancel_task(&self, poster: &AgentId, task_id: &TaskId) -> MarketResult<Task> {
        self.admission.admit(Some(poster), OperationKind::Review)?;
        self.engine.cancel_task(poster, task_id).await
    }

    pub async fn abandon_task(&self, worker: &AgentId, task_id: &TaskId) -> MarketResult<Task> {
        self.admission.admit(Some(worker), OperationKind::Deliver)?;
        self.engine.abandon_task(worker, task_id).await
    }

    /// Worker rates the poster of an approved task, once.
    pub async fn rate_poster(
        &self,
        worker: &AgentId,
        task_id: &TaskId,
        score: u8,
    ) -> MarketResult<()> {
        limits::validate_rating(score)?;
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| MarketError::NotFound(task_id.to_string()))?;
        if task.status != TaskStatus::Approved {
            return Err(MarketError::Conflict(format!(
                "task is {}, not approved",
                task.status
            )));
        }
        if task.worker_id.as_ref() != Some(worker) {
            return Err(MarketError::Unauthorized("not your task".into()));
        }
        let inserted = self
            .store
            .try_insert_rating(Rating {
                task_id: task_id.clone(),
                rater_id: worker.clone(),
                rated_id: task.poster_id.clone(),
                score,
                created_at: Utc::now(),
            })
            .await?;
        if !inserted {
            return Err(MarketError::Conflict("already rated".into()));
        }
        Ok(())
    }

    // ============ Listings ============

    /// Tasks this worker could pick up right now, in pickup order:
    /// matched first (by rank), then broadcast FIFO. Nothing is claimed.
    pub async fn list_available(
        &self,
        worker: &AgentId,
        filter: &PickupFilter,
    ) -> MarketResult<Vec<Task>> {
        self.admission.admit(Some(worker), OperationKind::Read)?;
        self.get_agent(worker).await?;

        let mut seen = Vec::new();
        let mut available = Vec::new();

        for task_match in self.store.matches_for_agent(worker).await? {
            if let Some(task) = self.store.get_task(&task_match.task_id).await? {
                if self.available_to(worker, &task, filter).await? && !seen.contains(&task.id) {
                    seen.push(task.id.clone());
                    available.push(task);
                }
            }
        }

        let mut broadcast = self.store.posted_broadcast_tasks().await?;
        broadcast.extend(self.store.posted_stale_pending_tasks(Utc::now()).await?);
        for task in broadcast {
            if self.available_to(worker, &task, filter).await? && !seen.contains(&task.id) {
                seen.push(task.id.clone());
                available.push(task);
            }
        }

        Ok(available)
    }

    async fn available_to(
        &self,
        worker: &AgentId,
        task: &Task,
        filter: &PickupFilter,
    ) -> MarketResult<bool> {
        if task.is_system || task.status != TaskStatus::Posted || task.poster_id == *worker {
            return Ok(false);
        }
        if !filter.tags.iter().all(|tag| task.tags.contains(tag)) {
            return Ok(false);
        }
        if let Some(needle) = &filter.search {
            let needle = needle.to_lowercase();
            let hit = task.need.to_lowercase().contains(&needle)
                || task
                    .context
                    .as_deref()
                    .is_some_and(|c| c.to_lowercase().contains(&needle));
            if !hit {
                return Ok(false);
            }
        }
        Ok(!self.store.performed_system_work(&task.id, worker).await?)
    }

    /// Tasks where this agent is poster and/or worker, newest first.
    pub async fn list_my_tasks(
        &self,
        agent: &AgentId,
        role: Option<TaskRole>,
        status: Option<TaskStatus>,
    ) -> MarketResult<Vec<Task>> {
        self.admission.admit(Some(agent), OperationKind::Read)?;
        Ok(self.store.list_tasks_for_agent(agent, role, status).await?)
    }

    // ============ Questions & messages ============

    pub async fn ask_question(
        &self,
        asker: &AgentId,
        task_id: &TaskId,
        question: String,
    ) -> MarketResult<TaskQuestion> {
        self.engine.ask_question(asker, task_id, question).await
    }

    pub async fn answer_question(
        &self,
        poster: &AgentId,
        task_id: &TaskId,
        question_id: &QuestionId,
        answer: String,
    ) -> MarketResult<TaskQuestion> {
        self.engine
            .answer_question(poster, task_id, question_id, answer)
            .await
    }

    pub async fn list_questions(&self, task_id: &TaskId) -> MarketResult<Vec<TaskQuestion>> {
        self.engine.list_questions(task_id).await
    }

    pub async fn send_message(
        &self,
        sender: &AgentId,
        task_id: &TaskId,
        message: String,
    ) -> MarketResult<TaskMessage> {
        self.engine.send_message(sender, task_id, message).await
    }

    pub async fn list_messages(
        &self,
        agent: &AgentId,
        task_id: &TaskId,
    ) -> MarketResult<Vec<TaskMessage>> {
        self.engine.list_messages(agent, task_id).await
    }

    // ============ Credits ============

    pub async fn get_credits(&self, agent: &AgentId) -> MarketResult<CreditReport> {
        let record = self.get_agent(agent).await?;
        let recent = self.store.ledger_for_agent(agent, RECENT_LEDGER_LIMIT).await?;
        Ok(CreditReport {
            balance: record.balance,
            escrowed: record.escrowed,
            recent,
        })
    }

    /// Admin: grant credits, ledgered with the `grant` reason.
    pub async fn grant_credits(
        &self,
        agent: &AgentId,
        amount: u64,
        reason: &str,
    ) -> MarketResult<u64> {
        self.admission.admit(Some(agent), OperationKind::Admin)?;
        if amount == 0 {
            return Err(MarketError::InvalidInput("grant amount must be positive".into()));
        }
        let balance = self
            .store
            .credit(agent, amount, LedgerReason::Grant, None, Utc::now())
            .await?;
        info!(agent_id = %agent, amount, reason, "Credits granted");
        Ok(balance)
    }

    /// Admin: flip an agent's suspension flag.
    pub async fn suspend(
        &self,
        agent: &AgentId,
        suspended: bool,
        reason: Option<String>,
    ) -> MarketResult<Agent> {
        self.admission.admit(Some(agent), OperationKind::Admin)?;
        self.store
            .set_suspended(agent, suspended, reason)
            .await?
            .ok_or_else(|| MarketError::NotFound(agent.to_string()))
    }

    // ============ Events & integrity ============

    /// Subscribe to an agent's event stream.
    pub async fn subscribe_events(&self, agent: &AgentId) -> EventStream {
        self.engine.events().subscribe(agent).await
    }

    /// Recompute ledger folds; a non-empty result is a hard alarm.
    pub async fn verify_ledger(&self) -> MarketResult<Vec<LedgerMismatch>> {
        Ok(self.store.verify_ledger().await?)
    }
}
