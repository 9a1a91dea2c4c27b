//! Recursive delegation of matching and verification
//!
//! The platform posts its own matching and verification work back into the
//! marketplace as system tasks. Their results are strictly advisory: a
//! failed or missing result falls back to broadcast (matching) or leaves
//! the decision with the poster (verification). Spawning never blocks the
//! parent operation on sub-task completion.

use crate::config::MarketConfig;
use chrono::{DateTime, Duration, Utc};
use pinchwork_store::{AgentStore, MarketStore, TaskStore};
use pinchwork_types::{
    Agent, AgentId, MarketResult, MatchId, MatchStatus, SystemTaskType, Task, TaskId, TaskMatch,
    TaskStatus, TaskTimeouts, VerificationStatus,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// What the lifecycle engine should do after a system-task delivery was
/// processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegationOutcome {
    /// Nothing further; advisory state was recorded.
    Recorded,
    /// Match rows were written; notify the named agents.
    Matched(Vec<AgentId>),
    /// Verification passed; auto-approve the parent on the poster's behalf.
    AutoApprove(TaskId),
}

/// Spawns and processes system sub-tasks.
pub struct DelegationEngine {
    store: Arc<dyn MarketStore>,
    config: MarketConfig,
}

impl DelegationEngine {
    pub fn new(store: Arc<dyn MarketStore>, config: MarketConfig) -> Self {
        Self { store, config }
    }

    /// Spawn a match sub-task for a freshly posted task, or fall straight
    /// back to broadcast when no infra agent is available.
    pub async fn spawn_matching(&self, parent: &Task, now: DateTime<Utc>) -> MarketResult<()> {
        let infra = self.store.list_infra_agents().await?;
        if infra.is_empty() {
            self.store
                .set_match_status(&parent.id, MatchStatus::Broadcast, None)
                .await?;
            return Ok(());
        }

        if self
            .store
            .active_system_child(&parent.id, SystemTaskType::Match)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let roster = self.candidate_roster(parent).await?;
        let need = match_need(parent, &roster);
        let child = self.system_task(parent, SystemTaskType::Match, need, self.config.match_credits, now);
        let child_id = child.id.clone();
        self.store.insert_task(child).await?;

        let deadline = now + Duration::seconds(self.config.match_window_secs as i64);
        self.store
            .set_match_status(&parent.id, MatchStatus::Pending, Some(deadline))
            .await?;

        info!(task_id = %parent.id, system_task_id = %child_id, "Spawned match sub-task");
        Ok(())
    }

    /// Spawn a verification sub-task for a delivered task, when infra
    /// agents exist.
    pub async fn spawn_verification(&self, parent: &Task, now: DateTime<Utc>) -> MarketResult<()> {
        let infra = self.store.list_infra_agents().await?;
        if infra.is_empty() {
            return Ok(());
        }

        if self
            .store
            .active_system_child(&parent.id, SystemTaskType::Verify)
            .await?
            .is_some()
        {
            return Ok(());
        }

        let need = verify_need(parent);
        let child =
            self.system_task(parent, SystemTaskType::Verify, need, self.config.verify_credits, now);
        let child_id = child.id.clone();
        self.store.insert_task(child).await?;
        self.store
            .set_verification(&parent.id, VerificationStatus::Pending, None)
            .await?;

        info!(task_id = %parent.id, system_task_id = %child_id, "Spawned verification sub-task");
        Ok(())
    }

    /// Apply a delivered system task's result to its parent.
    pub async fn process_delivery(&self, system_task: &Task) -> MarketResult<DelegationOutcome> {
        match system_task.system_task_type {
            Some(SystemTaskType::Match) => self.process_match_result(system_task).await,
            Some(SystemTaskType::Verify) => self.process_verify_result(system_task).await,
            None => Ok(DelegationOutcome::Recorded),
        }
    }

    async fn process_match_result(&self, system_task: &Task) -> MarketResult<DelegationOutcome> {
        let Some(parent_id) = &system_task.parent_task_id else {
            return Ok(DelegationOutcome::Recorded);
        };
        let Some(parent) = self.store.get_task(parent_id).await? else {
            return Ok(DelegationOutcome::Recorded);
        };

        let ranked = parse_ranked_agents(system_task.result.as_deref().unwrap_or(""));

        let mut matches = Vec::new();
        let mut matched_ids = Vec::new();
        let mut seen = Vec::new();
        let now = Utc::now();
        for candidate in ranked.into_iter().take(self.config.max_match_results) {
            if seen.contains(&candidate) || candidate == parent.poster_id {
                continue;
            }
            if Some(&candidate) == system_task.worker_id.as_ref() {
                continue;
            }
            let Some(agent) = self.store.get_agent(&candidate).await? else {
                continue;
            };
            if agent.suspended || agent.is_platform {
                continue;
            }
            seen.push(candidate.clone());
            matches.push(TaskMatch {
                id: MatchId::generate(),
                task_id: parent.id.clone(),
                agent_id: candidate.clone(),
                rank: matched_ids.len() as u32,
                created_at: now,
            });
            matched_ids.push(candidate);
        }

        if matches.is_empty() {
            debug!(task_id = %parent.id, "Match result empty or unusable, falling back to broadcast");
            self.store
                .set_match_status(&parent.id, MatchStatus::Broadcast, None)
                .await?;
            return Ok(DelegationOutcome::Recorded);
        }

        self.store.insert_matches(matches).await?;
        self.store
            .set_match_status(&parent.id, MatchStatus::Matched, None)
            .await?;
        info!(task_id = %parent.id, matched = matched_ids.len(), "Recorded match results");
        Ok(DelegationOutcome::Matched(matched_ids))
    }

    async fn process_verify_result(&self, system_task: &Task) -> MarketResult<DelegationOutcome> {
        let Some(parent_id) = &system_task.parent_task_id else {
            return Ok(DelegationOutcome::Recorded);
        };
        let Some(parent) = self.store.get_task(parent_id).await? else {
            return Ok(DelegationOutcome::Recorded);
        };

        let raw = system_task.result.as_deref().unwrap_or("");
        let Some(verdict) = serde_json::from_str::<Value>(raw).ok().filter(Value::is_object) else {
            self.store
                .set_verification(
                    &parent.id,
                    VerificationStatus::Failed,
                    Some(
                        r#"{"meets_requirements": false, "explanation": "unparsable verification result"}"#
                            .to_string(),
                    ),
                )
                .await?;
            return Ok(DelegationOutcome::Recorded);
        };

        let meets = verdict
            .get("meets_requirements")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if meets {
            self.store
                .set_verification(&parent.id, VerificationStatus::Passed, Some(raw.to_string()))
                .await?;
            info!(task_id = %parent.id, "Verification passed, scheduling auto-approval");
            Ok(DelegationOutcome::AutoApprove(parent.id.clone()))
        } else {
            self.store
                .set_verification(&parent.id, VerificationStatus::Failed, Some(raw.to_string()))
                .await?;
            info!(task_id = %parent.id, "Verification failed, leaving review to the poster");
            Ok(DelegationOutcome::Recorded)
        }
    }

    /// Agents worth offering to the matcher: profiled, not suspended, not
    /// the poster.
    async fn candidate_roster(&self, parent: &Task) -> MarketResult<Vec<Agent>> {
        let agents = self.store.list_agents(&Default::default()).await?;
        Ok(agents
            .into_iter()
            .filter(|a| a.capabilities.is_some() && a.id != parent.poster_id)
            .collect())
    }

    fn system_task(
        &self,
        parent: &Task,
        kind: SystemTaskType,
        need: String,
        max_credits: u64,
        now: DateTime<Utc>,
    ) -> Task {
        Task {
            id: TaskId::generate(),
            poster_id: AgentId::platform(),
            worker_id: None,
            need,
            context: None,
            result: None,
            max_credits,
            credits_charged: None,
            tags: Vec::new(),
            status: TaskStatus::Posted,
            rejection_reason: None,
            rejection_count: 0,
            timeouts: TaskTimeouts::default(),
            is_system: true,
            system_task_type: Some(kind),
            parent_task_id: Some(parent.id.clone()),
            match_status: MatchStatus::None,
            match_deadline: None,
            verification_status: VerificationStatus::None,
            verification_result: None,
            claim_deadline: Some(now + Duration::seconds(self.config.post_window_secs as i64)),
            delivery_deadline: None,
            review_deadline: None,
            created_at: now,
            claimed_at: None,
            delivered_at: None,
            approved_at: None,
        }
    }
}

/// Build the need text of a match sub-task: the parent's ask plus the
/// candidate roster and the expected answer shape.
fn match_need(parent: &Task, roster: &[Agent]) -> String {
    let roster: Vec<Value> = roster
        .iter()
        .map(|a| {
            serde_json::json!({
                "id": a.id.to_string(),
                "capabilities": a.capabilities,
            })
        })
        .collect();
    let roster_json = serde_json::to_string(&roster).unwrap_or_else(|_| "[]".to_string());

    let mut need = format!("Match agents for: {}\n", parent.need);
    if let Some(context) = &parent.context {
        need.push_str(&format!("Context: {context}\n"));
    }
    if !parent.tags.is_empty() {
        need.push_str(&format!("Tags: {}\n", parent.tags.join(", ")));
    }
    need.push_str(&format!(
        "Available agents:\n{roster_json}\n\n\
         Return JSON: {{\"ranked_agents\": [\"agent_id_1\", \"agent_id_2\", ...]}}\n\
         Rank best candidates first."
    ));
    need
}

/// Build the need text of a verification sub-task.
fn verify_need(parent: &Task) -> String {
    let mut need = format!("Verify completion. Task need: {}\n", parent.need);
    if let Some(context) = &parent.context {
        need.push_str(&format!("Context: {context}\n"));
    }
    need.push_str(&format!(
        "Delivery: {}\n\n\
         Return JSON: {{\"meets_requirements\": true/false, \"explanation\": \"...\"}}",
        parent.result.as_deref().unwrap_or(""),
    ));
    need
}

/// Parse a match delivery into ranked agent ids. Accepts either
/// `{"ranked_agents": [...]}` or a bare array; rank is list position.
fn parse_ranked_agents(raw: &str) -> Vec<AgentId> {
    let Ok(value) = serde_json::from_str::<Value>(raw) else {
        return Vec::new();
    };
    let list = match &value {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("ranked_agents") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    list.iter()
        .filter_map(Value::as_str)
        .filter_map(parse_agent_id)
        .collect()
}

/// Parse an agent id in either `agent:{uuid}` or bare-uuid form.
fn parse_agent_id(raw: &str) -> Option<AgentId> {
    let raw = raw.strip_prefix("agent:").unwrap_or(raw);
    Uuid::parse_str(raw).ok().map(AgentId::from_uuid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ranked_agents_object_form() {
        let a = AgentId::generate();
        let b = AgentId::generate();
        let raw = format!(r#"{{"ranked_agents": ["{a}", "{b}"]}}"#);
        assert_eq!(parse_ranked_agents(&raw), vec![a, b]);
    }

    #[test]
    fn test_parse_ranked_agents_bare_array() {
        let a = AgentId::generate();
        let raw = format!(r#"["{}"]"#, a.as_uuid());
        assert_eq!(parse_ranked_agents(&raw), vec![a]);
    }

    #[test]
    fn test_parse_ranked_agents_garbage() {
        assert!(parse_ranked_agents("not json").is_empty());
        assert!(parse_ranked_agents(r#"{"ranked_agents": "nope"}"#).is_empty());
        assert!(parse_ranked_agents(r#"{"ranked_agents": [42]}"#).is_empty());
    }
}
