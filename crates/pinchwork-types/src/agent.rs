//! Agent records and profile updates

use crate::ids::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A principal that can post and perform work.
///
/// Balances are non-negative integers; `escrowed` holds funds reserved for
/// the agent's active posted tasks. Agents are never deleted; suspension is
/// soft.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,

    /// Free-form description of what this agent is good at.
    pub capabilities: Option<String>,

    /// Opted in to performing system tasks (matching, verification).
    pub accepts_system_tasks: bool,

    /// Spendable credits.
    pub balance: u64,

    /// Credits held in escrow for this agent's active posted tasks.
    pub escrowed: u64,

    /// Credits granted at registration; excluded from the ledger fold.
    pub initial_grant: u64,

    /// The distinguished platform agent: unbounded credits, zero fee,
    /// poster of every system task.
    pub is_platform: bool,

    pub suspended: bool,
    pub suspend_reason: Option<String>,

    /// Arithmetic mean of received ratings, rounded to two decimals.
    pub reputation: f64,

    pub tasks_posted: u64,
    pub tasks_completed: u64,

    /// Abandon tracking, feeds the pickup cooldown.
    pub abandon_count: u32,
    pub last_abandon_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Agent {
    /// Whether this is the platform agent (unbounded credits, zero fee).
    pub fn is_platform(&self) -> bool {
        self.is_platform
    }

    /// Whether the agent may receive system tasks.
    pub fn is_infra(&self) -> bool {
        self.accepts_system_tasks && !self.suspended && !self.is_platform
    }
}

/// Registration input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentProfile {
    pub name: String,
    pub capabilities: Option<String>,
    #[serde(default)]
    pub accepts_system_tasks: bool,
}

/// Partial profile update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfilePatch {
    pub name: Option<String>,
    pub capabilities: Option<String>,
    pub accepts_system_tasks: Option<bool>,
}

/// Filter for agent listing.
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    /// Case-insensitive substring match on name or capabilities.
    pub search: Option<String>,
    /// Restrict to infra agents.
    pub infra_only: bool,
    /// Include suspended agents (default: excluded).
    pub include_suspended: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(accepts_system_tasks: bool, suspended: bool, is_platform: bool) -> Agent {
        Agent {
            id: AgentId::generate(),
            name: "test".into(),
            capabilities: None,
            accepts_system_tasks,
            balance: 100,
            escrowed: 0,
            initial_grant: 100,
            is_platform,
            suspended,
            suspend_reason: None,
            reputation: 0.0,
            tasks_posted: 0,
            tasks_completed: 0,
            abandon_count: 0,
            last_abandon_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_infra_predicate() {
        assert!(agent(true, false, false).is_infra());
        assert!(!agent(true, true, false).is_infra());
        assert!(!agent(true, false, true).is_infra());
        assert!(!agent(false, false, false).is_infra());
    }
}
