//! In-process lamport custody.
//!
//! The bank is the shared funds pool behind both components: player wallets,
//! the engine's round custody, and the ledger's reward custody are all plain
//! accounts here. Transfers are fallible; callers that pay out best-effort
//! (winner payout, refunds) handle the error instead of unwinding.

use dashmap::DashMap;

/// Account identifier. Player identities double as wallet account names.
pub type AccountId = str;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("account {account} holds {available} lamports, {needed} needed")]
    InsufficientFunds {
        account: String,
        needed: u64,
        available: u64,
    },
}

/// Lamport balance table.
///
/// Accounts spring into existence at zero on first touch. There is no
/// negative balance: a debit either fully applies or fails.
#[derive(Default)]
pub struct Bank {
    balances: DashMap<String, u64>,
}

impl Bank {
    pub fn new() -> Self {
        Self::default()
    }

    /// External inflow (top-up from outside the system).
    pub fn deposit(&self, account: &AccountId, amount: u64) {
        *self.balances.entry(account.to_string()).or_insert(0) += amount;
    }

    pub fn balance(&self, account: &AccountId) -> u64 {
        self.balances.get(account).map(|b| *b).unwrap_or(0)
    }

    /// Move `amount` lamports between accounts. All-or-nothing.
    pub fn transfer(&self, from: &AccountId, to: &AccountId, amount: u64) -> Result<(), TransferError> {
        if amount == 0 || from == to {
            return Ok(());
        }

        {
            let mut source = self.balances.entry(from.to_string()).or_insert(0);
            if *source < amount {
                return Err(TransferError::InsufficientFunds {
                    account: from.to_string(),
                    needed: amount,
                    available: *source,
                });
            }
            *source -= amount;
        }
        // Debit entry is dropped before the credit entry is taken; DashMap
        // shards must not be held across each other.
        *self.balances.entry(to.to_string()).or_insert(0) += amount;
        Ok(())
    }

    /// Sum of all balances. Constant under `transfer`, grows under `deposit`.
    pub fn total_supply(&self) -> u64 {
        self.balances.iter().map(|e| *e.value()).sum()
    }
}
