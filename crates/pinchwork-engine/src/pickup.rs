//! Pickup arbitration
//!
//! Selects at most one task for a candidate worker via strict phase order:
//!
//! 0. Infra agents: posted system tasks, oldest first.
//! 1. Tasks whose match rows name this agent, by rank then age.
//! 2. Posted broadcast tasks, FIFO.
//! 3. Posted tasks whose pending match deadline elapsed before the reaper
//!    flipped them; treated as broadcast.
//!
//! Selection is atomic: the claim is a compare-and-set against `posted`,
//! and a lost race simply moves on to the next candidate.

use crate::lifecycle::LifecycleEngine;
use chrono::{DateTime, Utc};
use pinchwork_store::TaskStore;
use pinchwork_types::{Agent, AgentId, MarketError, MarketEvent, MarketResult, Task, TaskId};
use tracing::info;

/// Tag and text constraints a worker applies to pickup.
#[derive(Debug, Clone, Default)]
pub struct PickupFilter {
    /// Every listed tag must be present on the task.
    pub tags: Vec<String>,
    /// Case-insensitive substring of need or context.
    pub search: Option<String>,
}

impl PickupFilter {
    fn matches(&self, task: &Task) -> bool {
        if !self.tags.iter().all(|tag| task.tags.contains(tag)) {
            return false;
        }
        match &self.search {
            None => true,
            Some(needle) => {
                let needle = needle.to_lowercase();
                task.need.to_lowercase().contains(&needle)
                    || task
                        .context
                        .as_deref()
                        .is_some_and(|c| c.to_lowercase().contains(&needle))
            }
        }
    }
}

impl LifecycleEngine {
    /// Claim the next available task for this worker, or `None` when
    /// nothing is eligible.
    pub async fn pickup_next(
        &self,
        worker_id: &AgentId,
        filter: &PickupFilter,
    ) -> MarketResult<Option<Task>> {
        let now = Utc::now();
        let worker = self.require_agent(worker_id).await?;
        self.require_not_suspended(&worker)?;
        self.require_no_cooldown(&worker, now)?;

        // Phase 0: infra agents serve system tasks first.
        if worker.accepts_system_tasks {
            if let Some(task) = self.pickup_system_task(&worker, now).await? {
                return Ok(Some(task));
            }
        }

        // Phase 1: matched tasks in rank order.
        let matches = self.store().matches_for_agent(worker_id).await?;
        for task_match in matches {
            let Some(task) = self.store().get_task(&task_match.task_id).await? else {
                continue;
            };
            if self.eligible(&worker, &task, filter).await? {
                if let Some(claimed) = self.claim_regular(&worker.id, &task, now).await? {
                    return Ok(Some(claimed));
                }
            }
        }

        // Phase 2: broadcast tasks, FIFO.
        for task in self.store().posted_broadcast_tasks().await? {
            if self.eligible(&worker, &task, filter).await? {
                if let Some(claimed) = self.claim_regular(&worker.id, &task, now).await? {
                    return Ok(Some(claimed));
                }
            }
        }

        // Phase 3: pending matches past deadline the reaper has not yet
        // flipped; treated as broadcast.
        for task in self.store().posted_stale_pending_tasks(now).await? {
            if self.eligible(&worker, &task, filter).await? {
                if let Some(claimed) = self.claim_regular(&worker.id, &task, now).await? {
                    return Ok(Some(claimed));
                }
            }
        }

        Ok(None)
    }

    /// Claim one specific posted task.
    pub async fn pickup_specific(
        &self,
        worker_id: &AgentId,
        task_id: &TaskId,
    ) -> MarketResult<Task> {
        let now = Utc::now();
        let worker = self.require_agent(worker_id).await?;
        self.require_not_suspended(&worker)?;
        self.require_no_cooldown(&worker, now)?;

        let task = self.require_task(task_id).await?;
        if task.is_system {
            return Err(MarketError::Conflict(
                "system tasks cannot be claimed directly".into(),
            ));
        }
        if task.poster_id == *worker_id {
            return Err(MarketError::Conflict("cannot pick up your own task".into()));
        }
        if self
            .store()
            .performed_system_work(task_id, worker_id)
            .await?
        {
            return Err(MarketError::Conflict(
                "agent performed system work for this task".into(),
            ));
        }

        let claimed = self
            .claim_regular(worker_id, &task, now)
            .await?
            .ok_or_else(|| MarketError::Conflict(format!("task is {}, not posted", task.status)))?;
        Ok(claimed)
    }

    /// Eligibility rules applied in every phase.
    async fn eligible(
        &self,
        worker: &Agent,
        task: &Task,
        filter: &PickupFilter,
    ) -> MarketResult<bool> {
        if task.is_system || task.status != pinchwork_types::TaskStatus::Posted {
            return Ok(false);
        }
        if task.poster_id == worker.id {
            return Ok(false);
        }
        if !filter.matches(task) {
            return Ok(false);
        }
        if self
            .store()
            .performed_system_work(&task.id, &worker.id)
            .await?
        {
            return Ok(false);
        }
        Ok(true)
    }

    async fn claim_regular(
        &self,
        worker_id: &AgentId,
        task: &Task,
        now: DateTime<Utc>,
    ) -> MarketResult<Option<Task>> {
        let delivery_deadline =
            now + task.delivery_window(self.config().delivery_window_secs);
        let Some(claimed) = self
            .store()
            .try_claim(&task.id, worker_id, Some(delivery_deadline), now)
            .await?
        else {
            return Ok(None);
        };

        info!(task_id = %claimed.id, worker_id = %worker_id, "Task claimed");
        self.events()
            .publish(
                &claimed.poster_id,
                MarketEvent::TaskClaimed {
                    task_id: claimed.id.clone(),
                    worker_id: worker_id.clone(),
                },
            )
            .await;
        Ok(Some(claimed))
    }

    /// Phase 0: oldest eligible system task.
    async fn pickup_system_task(
        &self,
        worker: &Agent,
        now: DateTime<Utc>,
    ) -> MarketResult<Option<Task>> {
        for task in self.store().posted_system_tasks().await? {
            let Some(parent_id) = &task.parent_task_id else {
                continue;
            };
            let Some(parent) = self.store().get_task(parent_id).await? else {
                continue;
            };
            // Never route an agent's own work back to it: not the parent's
            // poster, not its worker, and no prior system work on the
            // family.
            if parent.poster_id == worker.id || parent.worker_id.as_ref() == Some(&worker.id) {
                continue;
            }
            if self
                .store()
                .performed_system_work(parent_id, &worker.id)
                .await?
            {
                continue;
            }
            if self
                .store()
                .works_active_subtask(parent_id, &worker.id)
                .await?
            {
                continue;
            }
            // System claims carry no delivery deadline; the match deadline
            // and system review window bound their usefulness instead.
            if let Some(claimed) = self.store().try_claim(&task.id, &worker.id, None, now).await? {
                info!(task_id = %claimed.id, worker_id = %worker.id, "System task claimed");
                return Ok(Some(claimed));
            }
        }
        Ok(None)
    }
}
