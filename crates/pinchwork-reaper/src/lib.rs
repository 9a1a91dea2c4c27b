//! Pinchwork Reaper - time-based lifecycle transitions
//!
//! A periodic loop that releases overdue claims, expires unclaimed tasks,
//! auto-approves deliveries whose review window elapsed, flips stale
//! pending matches to broadcast, and settles delivered system tasks. A
//! transition that loses a race with a live request is skipped and retried
//! on the next tick.

#![deny(unsafe_code)]

use chrono::Utc;
use pinchwork_engine::LifecycleEngine;
use pinchwork_store::TaskStore;
use pinchwork_types::MarketResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};

/// Reaper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    /// Sweep interval in seconds.
    #[serde(default = "default_tick")]
    pub tick_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick(),
        }
    }
}

fn default_tick() -> u64 {
    10
}

/// Counts of transitions applied in one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub claims_released: usize,
    pub posted_expired: usize,
    pub auto_approved: usize,
    pub matches_broadcast: usize,
    pub system_approved: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.claims_released
            + self.posted_expired
            + self.auto_approved
            + self.matches_broadcast
            + self.system_approved
    }
}

/// The background reaper.
pub struct Reaper {
    engine: Arc<LifecycleEngine>,
    config: ReaperConfig,
    trigger_tx: mpsc::Sender<()>,
    running: Arc<RwLock<bool>>,
}

impl Reaper {
    /// Create a reaper; the returned receiver is handed back to `start`.
    pub fn new(engine: Arc<LifecycleEngine>, config: ReaperConfig) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (trigger_tx, trigger_rx) = mpsc::channel(10);
        let reaper = Arc::new(Self {
            engine,
            config,
            trigger_tx,
            running: Arc::new(RwLock::new(false)),
        });
        (reaper, trigger_rx)
    }

    /// Request an immediate sweep (used by tests).
    pub async fn trigger(&self) {
        let _ = self.trigger_tx.send(()).await;
    }

    /// Run the sweep loop until stopped.
    pub async fn start(self: Arc<Self>, mut trigger_rx: mpsc::Receiver<()>) {
        {
            let mut running = self.running.write().await;
            *running = true;
        }

        info!(tick_secs = self.config.tick_secs, "Reaper started");

        let mut ticker = interval(Duration::from_secs(self.config.tick_secs.max(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Sweep failed");
                    }
                }
                Some(_) = trigger_rx.recv() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Triggered sweep failed");
                    }
                }
                else => break,
            }

            let running = self.running.read().await;
            if !*running {
                break;
            }
        }

        info!("Reaper stopped");
    }

    /// Stop the loop after the current iteration.
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        *running = false;
    }

    /// Run every sweep once, in order.
    pub async fn sweep(&self) -> MarketResult<SweepReport> {
        let mut report = SweepReport::default();
        report.claims_released = self.sweep_claim_deadlines().await?;
        report.posted_expired = self.sweep_posted_expiry().await?;
        report.auto_approved = self.sweep_review_windows().await?;
        report.matches_broadcast = self.sweep_match_deadlines().await?;
        report.system_approved = self.sweep_system_approvals().await?;

        if report.total() > 0 {
            info!(
                claims_released = report.claims_released,
                posted_expired = report.posted_expired,
                auto_approved = report.auto_approved,
                matches_broadcast = report.matches_broadcast,
                system_approved = report.system_approved,
                "Sweep applied transitions"
            );
        }
        Ok(report)
    }

    /// Claimed tasks past their delivery deadline return to `posted`, or
    /// expire with refund once the rejection cap is exhausted.
    async fn sweep_claim_deadlines(&self) -> MarketResult<usize> {
        let now = Utc::now();
        let overdue = self.engine.store().claimed_past_delivery_deadline(now).await?;
        let mut count = 0;
        for task in overdue {
            match self.engine.release_overdue_claim(&task, now).await {
                Ok(true) => count += 1,
                Ok(false) => debug!(task_id = %task.id, "Claim release lost a race, retrying next tick"),
                Err(e) if e.is_conflict() => {}
                Err(e) => error!(task_id = %task.id, error = %e, "Claim release failed"),
            }
        }
        Ok(count)
    }

    /// Posted tasks past their claim deadline expire with a full refund.
    async fn sweep_posted_expiry(&self) -> MarketResult<usize> {
        let now = Utc::now();
        let overdue = self.engine.store().posted_past_claim_deadline(now).await?;
        let mut count = 0;
        for task in overdue {
            match self.engine.expire_posted(&task, now).await {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(e) if e.is_conflict() => {}
                Err(e) => error!(task_id = %task.id, error = %e, "Expiry failed"),
            }
        }
        Ok(count)
    }

    /// Delivered tasks whose review window elapsed are approved on behalf
    /// of the poster.
    async fn sweep_review_windows(&self) -> MarketResult<usize> {
        let now = Utc::now();
        let overdue = self.engine.store().delivered_past_review(now).await?;
        let mut count = 0;
        for task in overdue {
            match self.engine.auto_approve(&task.id).await {
                Ok(_) => count += 1,
                Err(e) if e.is_conflict() => {}
                Err(e) => error!(task_id = %task.id, error = %e, "Auto-approval failed"),
            }
        }
        Ok(count)
    }

    /// Pending matches past their deadline fall back to broadcast.
    async fn sweep_match_deadlines(&self) -> MarketResult<usize> {
        let now = Utc::now();
        let stale = self.engine.store().pending_match_past_deadline(now).await?;
        let mut count = 0;
        for task in stale {
            match self.engine.broadcast_stale_match(&task, now).await {
                Ok(()) => count += 1,
                Err(e) if e.is_conflict() => {}
                Err(e) => error!(task_id = %task.id, error = %e, "Match broadcast failed"),
            }
        }
        Ok(count)
    }

    /// Delivered system tasks past their short review window settle
    /// fee-free.
    async fn sweep_system_approvals(&self) -> MarketResult<usize> {
        let now = Utc::now();
        let overdue = self.engine.store().delivered_system_past_review(now).await?;
        let mut count = 0;
        for task in overdue {
            match self.engine.auto_approve_system(&task.id, now).await {
                Ok(true) => count += 1,
                Ok(false) => {}
                Err(e) if e.is_conflict() => {}
                Err(e) => error!(task_id = %task.id, error = %e, "System approval failed"),
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinchwork_engine::{CreateTask, MarketConfig};
    use pinchwork_store::{AgentStore, MarketStore, MemoryStore};
    use pinchwork_types::{Agent, AgentId, AgentProfile, TaskStatus, TaskTimeouts};

    async fn register(engine: &LifecycleEngine, profile: AgentProfile) -> AgentId {
        let config = engine.config();
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
        let id = agent.id.clone();
        engine.store().insert_agent(agent).await.unwrap();
        id
    }

    fn test_engine() -> Arc<LifecycleEngine> {
        let store: Arc<dyn MarketStore> = Arc::new(MemoryStore::new());
        Arc::new(LifecycleEngine::new(store, MarketConfig::default()))
    }

    #[tokio::test]
    async fn test_review_window_sweep_auto_approves() {
        let engine = test_engine();
        let (reaper, _rx) = Reaper::new(engine.clone(), ReaperConfig::default());

        let alice = register(&engine, AgentProfile { name: "alice".into(), ..Default::default() }).await;
        let bob = register(&engine, AgentProfile { name: "bob".into(), ..Default::default() }).await;

        let task = engine
            .create_task(
                &alice,
                CreateTask {
                    need: "translate".into(),
                    max_credits: 30,
                    timeouts: TaskTimeouts {
                        review_window_secs: Some(0),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        engine
            .pickup_specific(&bob, &task.id)
            .await
            .unwrap();
        engine
            .deliver_task(&bob, &task.id, "done".into(), Some(25))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let report = reaper.sweep().await.unwrap();
        assert_eq!(report.auto_approved, 1);

        let task = engine.store().get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Approved);

        // Same split as a manual approval.
        let worker = engine.store().get_agent(&bob).await.unwrap().unwrap();
        assert_eq!(worker.balance, 122);
    }

    #[tokio::test]
    async fn test_claim_deadline_sweep_reposts() {
        let engine = test_engine();
        let (reaper, _rx) = Reaper::new(engine.clone(), ReaperConfig::default());

        let alice = register(&engine, AgentProfile { name: "alice".into(), ..Default::default() }).await;
        let bob = register(&engine, AgentProfile { name: "bob".into(), ..Default::default() }).await;

        let task = engine
            .create_task(
                &alice,
                CreateTask {
                    need: "summarize".into(),
                    max_credits: 10,
                    timeouts: TaskTimeouts {
                        delivery_window_secs: Some(0),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        engine.pickup_specific(&bob, &task.id).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let report = reaper.sweep().await.unwrap();
        assert_eq!(report.claims_released, 1);

        let task = engine.store().get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Posted);
        assert_eq!(task.worker_id, None);

        let worker = engine.store().get_agent(&bob).await.unwrap().unwrap();
        assert_eq!(worker.abandon_count, 1);
    }

    #[tokio::test]
    async fn test_posted_expiry_sweep_refunds() {
        let engine = test_engine();
        let (reaper, _rx) = Reaper::new(engine.clone(), ReaperConfig::default());

        let alice = register(&engine, AgentProfile { name: "alice".into(), ..Default::default() }).await;
        let task = engine
            .create_task(
                &alice,
                CreateTask {
                    need: "never picked up".into(),
                    max_credits: 40,
                    timeouts: TaskTimeouts {
                        post_window_secs: Some(0),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let report = reaper.sweep().await.unwrap();
        assert_eq!(report.posted_expired, 1);

        let task = engine.store().get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Expired);

        let poster = engine.store().get_agent(&alice).await.unwrap().unwrap();
        assert_eq!(poster.balance, 100);
        assert_eq!(poster.escrowed, 0);
    }

    #[tokio::test]
    async fn test_stop_ends_loop() {
        let engine = test_engine();
        let (reaper, rx) = Reaper::new(engine, ReaperConfig { tick_secs: 1 });

        let handle = tokio::spawn(reaper.clone().start(rx));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        reaper.stop().await;
        reaper.trigger().await;
        tokio::time::timeout(std::time::Duration::from_secs(5), handle)
            .await
            .expect("loop should stop")
            .unwrap();
    }
}
