//! Referral relationships and reward custody.
//!
//! The ledger owns three things: the invitee→inviter map (write-once), the
//! per-inviter reward accounts, and the per-round settlement guard. Round
//! settlement is all-or-nothing and idempotent: a round identifier settles
//! at most once, and any mismatch in the declared amounts rejects the whole
//! call with nothing credited.

use crate::bank::Bank;
use crate::engine::round::RoundId;
use crate::errors::{
    AuthorizationError, ConsistencyError, EngineError, EngineResult, ValidationError,
};
use crate::referral::codes::CodeMint;
use crate::{unix_now, PlayerId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Claimable-reward account for one inviter.
///
/// `pending + claimed == lifetime_credited` holds at every instant;
/// `claimed` and `lifetime_credited` never decrease.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardAccount {
    pub pending: u64,
    pub claimed: u64,
    pub lifetime_credited: u64,
}

/// Idempotency record: one per settled round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SettlementRecord {
    pub round_id: RoundId,
    pub net_platform_fee: u64,
    pub total_credited: u64,
    pub settled_at: u64,
}

struct LedgerState {
    code_of: HashMap<PlayerId, String>,
    inviter_by_code: HashMap<String, PlayerId>,
    inviter_of: HashMap<PlayerId, PlayerId>,
    accounts: HashMap<PlayerId, RewardAccount>,
    settled: HashMap<RoundId, SettlementRecord>,
    platform_balance: u64,
    fee_receiver: PlayerId,
    authorized: HashSet<PlayerId>,
}

pub struct ReferralLedger {
    bank: Arc<Bank>,
    /// Custody account holding claimable rewards and accrued platform fees.
    account: String,
    owner: PlayerId,
    mint: CodeMint,
    state: Mutex<LedgerState>,
}

impl ReferralLedger {
    pub fn new(bank: Arc<Bank>, owner: PlayerId, fee_receiver: PlayerId) -> Self {
        Self {
            bank,
            account: "rondo:referral-ledger".to_string(),
            owner,
            mint: CodeMint::default(),
            state: Mutex::new(LedgerState {
                code_of: HashMap::new(),
                inviter_by_code: HashMap::new(),
                inviter_of: HashMap::new(),
                accounts: HashMap::new(),
                settled: HashMap::new(),
                platform_balance: 0,
                fee_receiver,
                authorized: HashSet::new(),
            }),
        }
    }

    /// Bank account settlement escrow is paid into and claims are paid from.
    pub fn account_id(&self) -> &str {
        &self.account
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn require_owner(&self, caller: &PlayerId) -> EngineResult<()> {
        if caller != &self.owner {
            return Err(AuthorizationError::NotOwner(caller.clone()).into());
        }
        Ok(())
    }

    // ── invite codes & relationships ─────────────────────────────────

    /// Return the inviter's code, minting one on first use.
    pub fn mint_invite_code(&self, inviter: &PlayerId) -> EngineResult<String> {
        let mut state = self.state();
        if let Some(code) = state.code_of.get(inviter) {
            return Ok(code.clone());
        }
        let code = self
            .mint
            .mint(|candidate| state.inviter_by_code.contains_key(candidate))?;
        state.code_of.insert(inviter.clone(), code.clone());
        state.inviter_by_code.insert(code.clone(), inviter.clone());
        Ok(code)
    }

    /// Bind `invitee` to the inviter behind `code`. One-time, irreversible.
    pub fn establish_relationship(&self, invitee: &PlayerId, code: &str) -> EngineResult<PlayerId> {
        let mut state = self.state();
        if state.inviter_of.contains_key(invitee) {
            return Err(ValidationError::AlreadyReferred(invitee.clone()).into());
        }
        let inviter = state
            .inviter_by_code
            .get(code)
            .cloned()
            .ok_or_else(|| ValidationError::UnknownInviteCode(code.to_string()))?;
        if &inviter == invitee {
            return Err(ValidationError::SelfReferral.into());
        }
        state.inviter_of.insert(invitee.clone(), inviter.clone());
        tracing::debug!(invitee = %invitee, inviter = %inviter, "referral relationship established");
        Ok(inviter)
    }

    pub fn get_inviter(&self, player: &PlayerId) -> Option<PlayerId> {
        self.state().inviter_of.get(player).cloned()
    }

    // ── settlement ───────────────────────────────────────────────────

    /// Apply a finished round's referral and platform shares.
    ///
    /// `caller` must be on the allow-list and is also the bank account the
    /// escrowed value is pulled from. The escrow must exactly equal
    /// `net_platform_fee + sum(amounts)`; anything else rejects the whole
    /// call and credits nothing.
    pub fn settle_round(
        &self,
        caller: &PlayerId,
        round_id: RoundId,
        net_platform_fee: u64,
        inviters: &[PlayerId],
        amounts: &[u64],
        escrowed: u64,
    ) -> EngineResult<()> {
        let mut state = self.state();

        if !state.authorized.contains(caller) {
            return Err(AuthorizationError::SettlementCallerNotAllowed(caller.clone()).into());
        }
        if state.settled.contains_key(&round_id) {
            return Err(ConsistencyError::AlreadySettled(round_id).into());
        }
        if inviters.len() != amounts.len() {
            return Err(ConsistencyError::LengthMismatch {
                inviters: inviters.len(),
                amounts: amounts.len(),
            }
            .into());
        }
        let total_credited: u128 = amounts.iter().map(|a| *a as u128).sum();
        let declared = net_platform_fee as u128 + total_credited;
        if declared != escrowed as u128 {
            return Err(ConsistencyError::EscrowMismatch {
                escrowed,
                declared: declared.min(u64::MAX as u128) as u64,
            }
            .into());
        }

        // Pull the escrow first; a failed transfer leaves the ledger
        // untouched. Everything after this point is infallible.
        self.bank.transfer(caller, &self.account, escrowed)?;

        for (inviter, amount) in inviters.iter().zip(amounts.iter()) {
            if *amount == 0 {
                continue;
            }
            let account = state.accounts.entry(inviter.clone()).or_default();
            account.pending += amount;
            account.lifetime_credited += amount;
        }
        state.platform_balance += net_platform_fee;
        state.settled.insert(
            round_id,
            SettlementRecord {
                round_id,
                net_platform_fee,
                total_credited: total_credited as u64,
                settled_at: unix_now(),
            },
        );
        tracing::info!(
            round = round_id,
            escrowed,
            net_platform_fee,
            payees = inviters.len(),
            "round settled"
        );
        Ok(())
    }

    pub fn is_settled(&self, round_id: RoundId) -> bool {
        self.state().settled.contains_key(&round_id)
    }

    pub fn settlement_record(&self, round_id: RoundId) -> Option<SettlementRecord> {
        self.state().settled.get(&round_id).cloned()
    }

    // ── claims & fees ────────────────────────────────────────────────

    /// Pay out the caller's entire pending balance. State commits before
    /// the transfer so a reentering observer sees pending already zeroed.
    pub fn claim(&self, caller: &PlayerId) -> EngineResult<u64> {
        let mut state = self.state();
        let pending = state.accounts.get(caller).map(|a| a.pending).unwrap_or(0);
        if pending == 0 {
            return Err(ValidationError::NothingToClaim.into());
        }
        let custody = self.bank.balance(&self.account);
        if custody < pending {
            return Err(ValidationError::InsufficientCustody {
                needed: pending,
                available: custody,
            }
            .into());
        }

        if let Some(account) = state.accounts.get_mut(caller) {
            account.pending = 0;
            account.claimed += pending;
        }
        // Custody was checked under the lock; this cannot underfund.
        self.bank.transfer(&self.account, caller, pending)?;
        tracing::info!(player = %caller, amount = pending, "referral rewards claimed");
        Ok(pending)
    }

    /// Pay the accumulated platform-fee balance to the fee receiver.
    pub fn withdraw_platform_fees(&self, caller: &PlayerId) -> EngineResult<u64> {
        self.require_owner(caller)?;
        let mut state = self.state();
        let amount = state.platform_balance;
        if amount == 0 {
            return Err(ValidationError::NothingToClaim.into());
        }
        state.platform_balance = 0;
        let receiver = state.fee_receiver.clone();
        self.bank.transfer(&self.account, &receiver, amount)?;
        tracing::info!(receiver = %receiver, amount, "platform fees withdrawn");
        Ok(amount)
    }

    pub fn reward_account(&self, player: &PlayerId) -> RewardAccount {
        self.state().accounts.get(player).copied().unwrap_or_default()
    }

    pub fn platform_balance(&self) -> u64 {
        self.state().platform_balance
    }

    // ── administration ───────────────────────────────────────────────

    pub fn authorize_settlement_caller(
        &self,
        caller: &PlayerId,
        who: &PlayerId,
    ) -> EngineResult<()> {
        self.require_owner(caller)?;
        self.state().authorized.insert(who.clone());
        Ok(())
    }

    pub fn deauthorize_settlement_caller(
        &self,
        caller: &PlayerId,
        who: &PlayerId,
    ) -> EngineResult<()> {
        self.require_owner(caller)?;
        self.state().authorized.remove(who);
        Ok(())
    }

    pub fn set_fee_receiver(&self, caller: &PlayerId, receiver: PlayerId) -> EngineResult<()> {
        self.require_owner(caller)?;
        self.state().fee_receiver = receiver;
        Ok(())
    }
}
