//! Task lifecycle operations
//!
//! Implements create, deliver, approve, reject, cancel, and abandon (pickup
//! lives in [`crate::pickup`]). Every transition is guarded by the expected
//! prior state at the store layer; a guard that does not hold surfaces as
//! `Conflict`. Credit side effects commit in the same store transaction as
//! the status flip.

use crate::config::MarketConfig;
use crate::delegation::{DelegationEngine, DelegationOutcome};
use crate::events::EventBus;
use crate::signals::TaskSignals;
use chrono::{DateTime, Duration, Utc};
use pinchwork_store::{AgentStore, MarketStore, RatingStore, SettledApproval, TaskStore};
use pinchwork_types::{
    limits, Agent, AgentId, MarketError, MarketEvent, MarketResult, MatchStatus, Rating, Task,
    TaskId, TaskStatus, TaskTimeouts, VerificationStatus,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Input for task creation.
#[derive(Debug, Clone, Default)]
pub struct CreateTask {
    pub need: String,
    pub max_credits: u64,
    pub tags: Vec<String>,
    pub context: Option<String>,
    pub timeouts: TaskTimeouts,
}

/// The marketplace lifecycle engine.
pub struct LifecycleEngine {
    store: Arc<dyn MarketStore>,
    config: MarketConfig,
    events: EventBus,
    signals: TaskSignals,
    delegation: DelegationEngine,
}

impl LifecycleEngine {
    pub fn new(store: Arc<dyn MarketStore>, config: MarketConfig) -> Self {
        let events = EventBus::new(config.event_buffer);
        let delegation = DelegationEngine::new(store.clone(), config.clone());
        Self {
            store,
            config,
            events,
            signals: TaskSignals::new(),
            delegation,
        }
    }

    pub fn store(&self) -> &Arc<dyn MarketStore> {
        &self.store
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn signals(&self) -> &TaskSignals {
        &self.signals
    }

    // --- Guard helpers ---

    /// Fetch an agent or fail with `NotFound`.
    pub(crate) async fn require_agent(&self, id: &AgentId) -> MarketResult<Agent> {
        self.store
            .get_agent(id)
            .await?
            .ok_or_else(|| MarketError::NotFound(id.to_string()))
    }

    /// Fetch a task or fail with `NotFound`.
    pub(crate) async fn require_task(&self, id: &TaskId) -> MarketResult<Task> {
        self.store
            .get_task(id)
            .await?
            .ok_or_else(|| MarketError::NotFound(id.to_string()))
    }

    pub(crate) fn require_not_suspended(&self, agent: &Agent) -> MarketResult<()> {
        if agent.suspended {
            return Err(MarketError::Suspended(agent.id.to_string()));
        }
        Ok(())
    }

    /// Refuse pickups from an agent inside its abandon cooldown window.
    pub(crate) fn require_no_cooldown(&self, agent: &Agent, now: DateTime<Utc>) -> MarketResult<()> {
        if agent.abandon_count < self.config.max_abandons_before_cooldown {
            return Ok(());
        }
        let Some(last) = agent.last_abandon_at else {
            return Ok(());
        };
        let until = last + Duration::seconds(self.config.abandon_cooldown_secs as i64);
        if now < until {
            return Err(MarketError::Cooldown { until });
        }
        Ok(())
    }

    fn conflict(task: &Task, wanted: &str) -> MarketError {
        MarketError::Conflict(format!("task is {}, not {}", task.status, wanted))
    }

    // --- Operations ---

    /// Post a new task: validate, escrow the credit cap, and hand matching
    /// to the delegation engine.
    pub async fn create_task(&self, poster_id: &AgentId, input: CreateTask) -> MarketResult<Task> {
        limits::validate_need(&input.need)?;
        limits::validate_max_credits(input.max_credits)?;
        limits::validate_tags(&input.tags)?;
        if let Some(context) = &input.context {
            limits::validate_context(context)?;
        }

        let poster = self.require_agent(poster_id).await?;
        self.require_not_suspended(&poster)?;

        let now = Utc::now();
        let task = Task {
            id: TaskId::generate(),
            poster_id: poster_id.clone(),
            worker_id: None,
            need: input.need,
            context: input.context,
            result: None,
            max_credits: input.max_credits,
            credits_charged: None,
            tags: input.tags,
            status: TaskStatus::Posted,
            rejection_reason: None,
            rejection_count: 0,
            timeouts: input.timeouts,
            is_system: false,
            system_task_type: None,
            parent_task_id: None,
            match_status: MatchStatus::None,
            match_deadline: None,
            verification_status: VerificationStatus::None,
            verification_result: None,
            claim_deadline: Some(now + task_post_window(&input.timeouts, &self.config)),
            delivery_deadline: None,
            review_deadline: None,
            created_at: now,
            claimed_at: None,
            delivered_at: None,
            approved_at: None,
        };
        let task_id = task.id.clone();

        // The hold is the conditional write; no task row exists yet to
        // clean up if it fails.
        self.store
            .try_hold(poster_id, task.max_credits, &task_id, now)
            .await?;
        self.store.insert_task(task).await?;
        self.store.bump_tasks_posted(poster_id).await?;

        self.delegation
            .spawn_matching(&self.require_task(&task_id).await?, now)
            .await?;

        let task = self.require_task(&task_id).await?;
        info!(task_id = %task.id, poster_id = %poster_id, max_credits = task.max_credits, "Task posted");
        Ok(task)
    }

    /// Deliver work on a claimed task. System-task deliveries are routed
    /// through the delegation engine and settled immediately.
    pub async fn deliver_task(
        &self,
        worker_id: &AgentId,
        task_id: &TaskId,
        result: String,
        credits_claimed: Option<u64>,
    ) -> MarketResult<Task> {
        limits::validate_result(&result)?;

        let task = self.require_task(task_id).await?;
        if task.worker_id.as_ref() != Some(worker_id) {
            return Err(MarketError::Unauthorized("not your task".into()));
        }

        let charged = credits_claimed
            .unwrap_or(task.max_credits)
            .min(task.max_credits);

        let now = Utc::now();
        let review_window = if task.is_system {
            Duration::seconds(self.config.system_review_window_secs as i64)
        } else {
            task.review_window(self.config.review_window_secs)
        };

        let delivered = self
            .store
            .try_deliver(task_id, worker_id, result, charged, now + review_window, now)
            .await?
            .ok_or_else(|| Self::conflict(&task, "claimed"))?;

        info!(task_id = %task_id, worker_id = %worker_id, credits_charged = charged, "Task delivered");

        if delivered.is_system {
            self.process_system_delivery(&delivered).await?;
        } else {
            self.delegation.spawn_verification(&delivered, now).await?;
            self.events
                .publish(
                    &delivered.poster_id,
                    MarketEvent::TaskDelivered {
                        task_id: task_id.clone(),
                        worker_id: worker_id.clone(),
                        credits_charged: charged,
                    },
                )
                .await;
        }

        self.signals.notify(task_id);
        self.require_task(task_id).await
    }

    /// Apply a delivered system task's advisory result and settle it.
    async fn process_system_delivery(&self, system_task: &Task) -> MarketResult<()> {
        let outcome = self.delegation.process_delivery(system_task).await?;

        // System tasks settle fee-free as soon as their result is
        // processed; the reaper sweep is the backstop.
        self.store
            .try_settle_system_approval(&system_task.id, Utc::now())
            .await?;

        match outcome {
            DelegationOutcome::Matched(agent_ids) => {
                if let Some(parent_id) = &system_task.parent_task_id {
                    if let Some(parent) = self.store.get_task(parent_id).await? {
                        let preview: String =
                            parent.need.chars().take(self.config.need_preview_len).collect();
                        self.events
                            .publish_many(
                                &agent_ids,
                                MarketEvent::TaskPosted {
                                    task_id: parent.id.clone(),
                                    need_preview: preview,
                                    max_credits: parent.max_credits,
                                },
                            )
                            .await;
                    }
                }
            }
            DelegationOutcome::AutoApprove(parent_id) => {
                // Advisory: a lost race with the poster is fine.
                if let Err(err) = self.auto_approve(&parent_id).await {
                    if !err.is_conflict() {
                        return Err(err);
                    }
                }
            }
            DelegationOutcome::Recorded => {}
        }
        Ok(())
    }

    /// Poster approves a delivery, optionally rating the worker.
    pub async fn approve_task(
        &self,
        poster_id: &AgentId,
        task_id: &TaskId,
        rating: Option<u8>,
    ) -> MarketResult<Task> {
        if let Some(score) = rating {
            limits::validate_rating(score)?;
        }

        let task = self.require_task(task_id).await?;
        if task.poster_id != *poster_id {
            return Err(MarketError::Unauthorized("not your task".into()));
        }

        let settled = self.settle(task_id, &task, false).await?;

        if let (Some(score), Some(worker_id)) = (rating, &settled.task.worker_id) {
            let inserted = self
                .store
                .try_insert_rating(Rating {
                    task_id: task_id.clone(),
                    rater_id: poster_id.clone(),
                    rated_id: worker_id.clone(),
                    score,
                    created_at: Utc::now(),
                })
                .await?;
            if !inserted {
                warn!(task_id = %task_id, "Duplicate rating ignored");
            }
        }

        Ok(settled.task)
    }

    /// Approve on behalf of the poster (review expiry or verification
    /// pass). No rating.
    pub async fn auto_approve(&self, task_id: &TaskId) -> MarketResult<Task> {
        let task = self.require_task(task_id).await?;
        let settled = self.settle(task_id, &task, true).await?;
        Ok(settled.task)
    }

    async fn settle(
        &self,
        task_id: &TaskId,
        task: &Task,
        auto: bool,
    ) -> MarketResult<SettledApproval> {
        let settled = self
            .store
            .try_settle_approval(task_id, self.config.fee_rate, Utc::now())
            .await?
            .ok_or_else(|| Self::conflict(task, "delivered"))?;

        info!(
            task_id = %task_id,
            worker_share = settled.worker_share,
            fee = settled.fee,
            refund = settled.refund,
            auto,
            "Task approved and settled"
        );

        let event = MarketEvent::TaskApproved {
            task_id: task_id.clone(),
            credits_charged: settled.task.credits_charged.unwrap_or(0),
            auto,
        };
        self.events.publish(&settled.task.poster_id, event.clone()).await;
        if let Some(worker_id) = &settled.task.worker_id {
            self.events.publish(worker_id, event).await;
        }

        self.signals.notify(task_id);
        self.signals.cleanup(task_id);
        Ok(settled)
    }

    /// Poster rejects a delivery. Below the rejection cap the task goes
    /// back to the worker with a fresh delivery deadline and escrow stays
    /// held; at the cap it terminates with a full refund.
    pub async fn reject_task(
        &self,
        poster_id: &AgentId,
        task_id: &TaskId,
        reason: String,
        feedback: Option<String>,
    ) -> MarketResult<Task> {
        limits::validate_feedback(&reason)?;
        if let Some(feedback) = &feedback {
            limits::validate_feedback(feedback)?;
        }

        let task = self.require_task(task_id).await?;
        if task.poster_id != *poster_id {
            return Err(MarketError::Unauthorized("not your task".into()));
        }

        let now = Utc::now();
        let redelivery_deadline = now + task.delivery_window(self.config.delivery_window_secs);
        let outcome = self
            .store
            .try_reject(
                task_id,
                &reason,
                self.config.max_rejections,
                redelivery_deadline,
                now,
            )
            .await?
            .ok_or_else(|| Self::conflict(&task, "delivered"))?;

        info!(
            task_id = %task_id,
            rejection_count = outcome.task.rejection_count,
            terminal = outcome.terminal,
            "Task rejected"
        );

        if let Some(worker_id) = &outcome.task.worker_id {
            self.events
                .publish(
                    worker_id,
                    MarketEvent::TaskRejected {
                        task_id: task_id.clone(),
                        reason,
                        rejection_count: outcome.task.rejection_count,
                        terminal: outcome.terminal,
                    },
                )
                .await;
        }

        if outcome.terminal {
            self.signals.notify(task_id);
            self.signals.cleanup(task_id);
        }
        Ok(outcome.task)
    }

    /// Poster cancels an unclaimed task; escrow is refunded in full.
    pub async fn cancel_task(&self, poster_id: &AgentId, task_id: &TaskId) -> MarketResult<Task> {
        let task = self.require_task(task_id).await?;
        if task.poster_id != *poster_id {
            return Err(MarketError::Unauthorized("not your task".into()));
        }

        // Collect match recipients before the cancel clears the rows.
        let matched: Vec<AgentId> = self
            .store
            .matches_for_task(task_id)
            .await?
            .into_iter()
            .map(|m| m.agent_id)
            .collect();

        let cancelled = self
            .store
            .try_cancel(task_id, Utc::now())
            .await?
            .ok_or_else(|| Self::conflict(&task, "posted"))?;

        info!(task_id = %task_id, refunded = cancelled.max_credits, "Task cancelled");

        self.events
            .publish_many(&matched, MarketEvent::TaskCancelled { task_id: task_id.clone() })
            .await;

        self.signals.notify(task_id);
        self.signals.cleanup(task_id);
        Ok(cancelled)
    }

    /// Worker gives a claimed task back; it returns to `posted` and the
    /// worker's abandon counter feeds the pickup cooldown.
    pub async fn abandon_task(&self, worker_id: &AgentId, task_id: &TaskId) -> MarketResult<Task> {
        let task = self.require_task(task_id).await?;
        if task.worker_id.as_ref() != Some(worker_id) {
            return Err(MarketError::Unauthorized("not your task".into()));
        }

        let now = Utc::now();
        let new_claim_deadline = now + task.post_window(self.config.post_window_secs);
        let (released, _) = self
            .store
            .try_release_claim(task_id, Some(worker_id), new_claim_deadline, now)
            .await?
            .ok_or_else(|| Self::conflict(&task, "claimed"))?;

        self.store.record_abandon(worker_id, now).await?;
        info!(task_id = %task_id, worker_id = %worker_id, "Task abandoned");
        Ok(released)
    }

    // --- Reaper entry points ---

    /// A claimed task ran out its delivery deadline: back to `posted`, or
    /// `expired` with refund once the rejection cap is exhausted. Returns
    /// false when the transition lost a race.
    pub async fn release_overdue_claim(&self, task: &Task, now: DateTime<Utc>) -> MarketResult<bool> {
        let worker_id = task.worker_id.clone();
        let max_rejections = task.max_rejections(self.config.max_rejections);

        let transitioned = if task.rejection_count >= max_rejections {
            match self.store.try_expire_claimed(&task.id, now).await? {
                Some(expired) => {
                    self.events
                        .publish(
                            &expired.poster_id,
                            MarketEvent::TaskExpired {
                                task_id: task.id.clone(),
                                prior_status: TaskStatus::Claimed,
                            },
                        )
                        .await;
                    self.signals.notify(&task.id);
                    self.signals.cleanup(&task.id);
                    true
                }
                None => false,
            }
        } else {
            let new_claim_deadline = now + task.post_window(self.config.post_window_secs);
            self.store
                .try_release_claim(&task.id, None, new_claim_deadline, now)
                .await?
                .is_some()
        };

        if transitioned {
            if let Some(worker_id) = &worker_id {
                self.store.record_abandon(worker_id, now).await?;
            }
            info!(task_id = %task.id, "Claim deadline elapsed");
        }
        Ok(transitioned)
    }

    /// A posted task was never claimed inside its window: `expired` with
    /// refund.
    pub async fn expire_posted(&self, task: &Task, now: DateTime<Utc>) -> MarketResult<bool> {
        let Some(expired) = self.store.try_expire(&task.id, now).await? else {
            return Ok(false);
        };
        info!(task_id = %task.id, refunded = expired.max_credits, "Unclaimed task expired");
        if !expired.is_system {
            self.events
                .publish(
                    &expired.poster_id,
                    MarketEvent::TaskExpired {
                        task_id: task.id.clone(),
                        prior_status: TaskStatus::Posted,
                    },
                )
                .await;
        }
        self.signals.notify(&task.id);
        self.signals.cleanup(&task.id);
        Ok(true)
    }

    /// A pending match ran out its deadline: fall back to broadcast and
    /// cancel the still-posted match sub-task.
    pub async fn broadcast_stale_match(&self, task: &Task, now: DateTime<Utc>) -> MarketResult<()> {
        self.store
            .set_match_status(&task.id, MatchStatus::Broadcast, None)
            .await?;
        if let Some(child) = self
            .store
            .active_system_child(&task.id, pinchwork_types::SystemTaskType::Match)
            .await?
        {
            if child.status == TaskStatus::Posted {
                self.store.try_cancel(&child.id, now).await?;
            }
        }
        info!(task_id = %task.id, "Match deadline elapsed, falling back to broadcast");
        Ok(())
    }

    /// Settle a delivered system task whose short review window elapsed.
    pub async fn auto_approve_system(&self, task_id: &TaskId, now: DateTime<Utc>) -> MarketResult<bool> {
        Ok(self
            .store
            .try_settle_system_approval(task_id, now)
            .await?
            .is_some())
    }
}

fn task_post_window(timeouts: &TaskTimeouts, config: &MarketConfig) -> Duration {
    Duration::seconds(timeouts.post_window_secs.unwrap_or(config.post_window_secs) as i64)
}
