//! Sample aggregate kind used across the test suites: a ledger account whose
//! state is a lifecycle sum type.

use cairn_core::aggregate::AggregateState;
use cairn_core::change::ChangeKind;
use cairn_core::error::DomainError;
use serde::{Deserialize, Serialize};

/// Type tag of the ledger aggregate.
pub const LEDGER_KIND: &str = "ledger";

/// Changes a ledger records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LedgerChange {
    /// The account was opened.
    Opened {
        /// Account holder.
        owner: String,
    },
    /// Funds were deposited.
    Deposited {
        /// Amount in minor units.
        amount: u64,
    },
    /// Funds were withdrawn.
    Withdrawn {
        /// Amount in minor units.
        amount: u64,
    },
    /// The account was closed.
    Closed,
}

impl ChangeKind for LedgerChange {
    fn change_type(&self) -> &'static str {
        match self {
            Self::Opened { .. } => "ledger.opened",
            Self::Deposited { .. } => "ledger.deposited",
            Self::Withdrawn { .. } => "ledger.withdrawn",
            Self::Closed => "ledger.closed",
        }
    }
}

/// Ledger state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerState {
    /// Not opened yet.
    #[default]
    Unopened,
    /// Accepting deposits and withdrawals.
    Open {
        /// Account holder.
        owner: String,
        /// Current balance.
        balance: u64,
        /// Number of deposits and withdrawals applied.
        entries: u32,
    },
    /// No longer accepting entries.
    Closed {
        /// Account holder.
        owner: String,
        /// Balance at closing.
        balance: u64,
    },
}

impl LedgerState {
    /// Current balance; zero before opening.
    #[must_use]
    pub fn balance(&self) -> u64 {
        match self {
            Self::Unopened => 0,
            Self::Open { balance, .. } | Self::Closed { balance, .. } => *balance,
        }
    }
}

impl AggregateState for LedgerState {
    const KIND: &'static str = LEDGER_KIND;
    type Change = LedgerChange;

    fn apply(&mut self, change: &LedgerChange) {
        let next = match (&mut *self, change) {
            (Self::Unopened, LedgerChange::Opened { owner }) => Some(Self::Open {
                owner: owner.clone(),
                balance: 0,
                entries: 0,
            }),
            (Self::Open { balance, entries, .. }, LedgerChange::Deposited { amount }) => {
                *balance += amount;
                *entries += 1;
                None
            }
            (Self::Open { balance, entries, .. }, LedgerChange::Withdrawn { amount }) => {
                *balance = balance.saturating_sub(*amount);
                *entries += 1;
                None
            }
            (Self::Open { owner, balance, .. }, LedgerChange::Closed) => Some(Self::Closed {
                owner: std::mem::take(owner),
                balance: *balance,
            }),
            _ => None,
        };
        if let Some(next) = next {
            *self = next;
        }
    }

    fn validate(&self, change: &LedgerChange) -> Result<(), DomainError> {
        match (self, change) {
            (Self::Unopened, LedgerChange::Opened { .. })
            | (Self::Open { .. }, LedgerChange::Deposited { .. } | LedgerChange::Closed) => Ok(()),
            (Self::Open { balance, .. }, LedgerChange::Withdrawn { amount }) => {
                if amount > balance {
                    Err(DomainError::Validation(format!(
                        "insufficient funds: balance {balance}, withdrawal {amount}"
                    )))
                } else {
                    Ok(())
                }
            }
            (state, change) => Err(DomainError::Validation(format!(
                "{} not allowed in state {state:?}",
                change.change_type()
            ))),
        }
    }
}
