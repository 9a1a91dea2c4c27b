//! Credit ledger entries
//!
//! The ledger is append-only and is the authority for reconstructing agent
//! balances; the scalar columns on the agent record are a cache that must
//! equal the ledger fold at every observable moment.

use crate::ids::{AgentId, LedgerEntryId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reason code attached to every balance change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerReason {
    /// Credits moved from balance into escrow at task creation.
    EscrowHold,
    /// Escrowed credits paid out to the worker and platform on approval.
    EscrowRelease,
    /// Escrowed credits returned to balance (cancel, expiry, terminal
    /// rejection, or the unused remainder on approval).
    EscrowRefund,
    /// Worker's share of an approved task.
    Payment,
    /// Platform's share of an approved task.
    Fee,
    /// Admin credit grant.
    Grant,
    /// Manual correction.
    Adjustment,
}

/// An immutable record of one balance change.
///
/// `amount` is signed from the affected account's perspective: negative for
/// holds and releases, positive for refunds, payments, fees, and grants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub agent_id: AgentId,
    pub amount: i64,
    pub reason: LedgerReason,
    pub task_id: Option<TaskId>,
    /// Monotonic per-agent sequence number.
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Signed effect of this entry on the agent's spendable balance.
    pub fn balance_delta(&self) -> i64 {
        match self.reason {
            LedgerReason::EscrowHold | LedgerReason::EscrowRefund => self.amount,
            LedgerReason::EscrowRelease => 0,
            LedgerReason::Payment
            | LedgerReason::Fee
            | LedgerReason::Grant
            | LedgerReason::Adjustment => self.amount,
        }
    }

    /// Signed effect of this entry on the agent's escrowed amount.
    pub fn escrow_delta(&self) -> i64 {
        match self.reason {
            LedgerReason::EscrowHold | LedgerReason::EscrowRefund => -self.amount,
            LedgerReason::EscrowRelease => self.amount,
            LedgerReason::Payment
            | LedgerReason::Fee
            | LedgerReason::Grant
            | LedgerReason::Adjustment => 0,
        }
    }

    /// Net effect on the agent's total holdings (balance + escrowed).
    /// Zero for internal moves (hold, refund), `amount` otherwise.
    pub fn holdings_delta(&self) -> i64 {
        self.balance_delta() + self.escrow_delta()
    }
}

/// Fold a sequence of entries into `(balance_delta, escrow_delta)`.
pub fn fold_entries<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> (i64, i64) {
    entries.into_iter().fold((0, 0), |(bal, esc), entry| {
        (bal + entry.balance_delta(), esc + entry.escrow_delta())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(amount: i64, reason: LedgerReason) -> LedgerEntry {
        LedgerEntry {
            id: LedgerEntryId::generate(),
            agent_id: AgentId::generate(),
            amount,
            reason,
            task_id: None,
            sequence: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_hold_moves_balance_into_escrow() {
        let e = entry(-30, LedgerReason::EscrowHold);
        assert_eq!(e.balance_delta(), -30);
        assert_eq!(e.escrow_delta(), 30);
        assert_eq!(e.holdings_delta(), 0);
    }

    #[test]
    fn test_release_leaves_balance_untouched() {
        let e = entry(-25, LedgerReason::EscrowRelease);
        assert_eq!(e.balance_delta(), 0);
        assert_eq!(e.escrow_delta(), -25);
        assert_eq!(e.holdings_delta(), -25);
    }

    #[test]
    fn test_fold_reconstructs_settlement() {
        // Poster holds 30, has 25 released to others, gets 5 refunded.
        let entries = vec![
            entry(-30, LedgerReason::EscrowHold),
            entry(-25, LedgerReason::EscrowRelease),
            entry(5, LedgerReason::EscrowRefund),
        ];
        let (bal, esc) = fold_entries(&entries);
        assert_eq!(bal, -25);
        assert_eq!(esc, 0);
    }

    #[test]
    fn test_payment_and_fee_are_pure_credits() {
        let entries = vec![entry(22, LedgerReason::Payment), entry(3, LedgerReason::Fee)];
        let (bal, esc) = fold_entries(&entries);
        assert_eq!(bal, 25);
        assert_eq!(esc, 0);
    }
}
