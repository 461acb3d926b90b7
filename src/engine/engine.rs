//! Round lifecycle engine.
//!
//! Owns the round arena, participation, fee accounting, and settlement
//! orchestration. Every mutating operation is one critical section over the
//! engine state: validation happens before any mutation, and outbound value
//! transfers are sequenced after state has been committed. The asynchronous
//! edge of the system is randomness delivery, which re-enters through
//! [`GameEngine::on_randomness_delivered`] and is guarded by the pending
//! token table plus the round state machine.

use crate::bank::Bank;
use crate::config::EngineConfig;
use crate::engine::randomness::{
    RandomnessContext, RandomnessProvider, RandomnessSink, RequestToken,
};
use crate::engine::round::{FeeSplit, Round, RoundId, RoundSnapshot, RoundStatus};
use crate::errors::{
    AuthorizationError, ConsistencyError, EngineError, EngineResult, ValidationError,
};
use crate::referral::ledger::ReferralLedger;
use crate::{unix_now, PlayerId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// How a participation interacted with the referral ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ReferralCredit {
    /// Inviter found, accrual recorded against the round.
    Credited { inviter: PlayerId, amount: u64 },
    /// Player has no inviter.
    NoInviter,
    /// Lookup skipped: no ledger is configured. Participation proceeds.
    Skipped,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParticipationReceipt {
    pub round_id: RoundId,
    /// Zero-based seat in the round's frozen ordering.
    pub position: usize,
    /// Whether this entry filled the round.
    pub filled: bool,
    pub referral: ReferralCredit,
}

/// Disposition of the winner payout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum PayoutStatus {
    Paid { amount: u64 },
    /// Transfer failed; funds stay in engine custody for manual recovery.
    Deferred { amount: u64, reason: String },
}

/// Disposition of the referral-ledger settlement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum SettlementDispatch {
    Released { escrowed: u64 },
    /// Settlement call failed or no ledger is configured; the escrow stays
    /// in engine custody and the round's settlement flag remains unset.
    Deferred { amount: u64, reason: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FinalizeReport {
    pub round_id: RoundId,
    pub winner: PlayerId,
    pub split: FeeSplit,
    pub payout: PayoutStatus,
    pub settlement: SettlementDispatch,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RefundReport {
    pub round_id: RoundId,
    pub participants: usize,
    pub amount_each: u64,
    /// Lamports actually returned; differs from `participants × amount_each`
    /// only if an individual transfer failed.
    pub returned: u64,
}

/// Outcome of recomputing a finished round's winner from its stored seed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoundVerification {
    pub round_id: RoundId,
    pub seed: u64,
    pub winner_index: usize,
    pub expected_winner: PlayerId,
    pub recorded_winner: PlayerId,
    pub valid: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FinishedRoundSummary {
    pub id: RoundId,
    pub winner: PlayerId,
    pub winner_payout: u64,
    pub participant_count: usize,
    pub settlement_released: bool,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub rounds_total: u64,
    pub rounds_finished: u64,
    pub total_distributed: u64,
    pub total_participants: u64,
}

struct EngineState {
    rounds: Vec<Round>,
    /// Outstanding randomness requests, token → round.
    pending: HashMap<RequestToken, RoundId>,
    paused: bool,
    fee_receiver: PlayerId,
    total_distributed: u64,
    total_participants: u64,
}

pub struct GameEngine {
    config: EngineConfig,
    capacity: usize,
    bank: Arc<Bank>,
    /// Custody account; also the engine's identity on the ledger allow-list.
    account: PlayerId,
    ledger: RwLock<Option<Arc<ReferralLedger>>>,
    provider: RwLock<Arc<dyn RandomnessProvider>>,
    state: Mutex<EngineState>,
}

impl GameEngine {
    pub fn new(config: EngineConfig, bank: Arc<Bank>, provider: Arc<dyn RandomnessProvider>) -> Self {
        let capacity = config.variant.capacity();
        let fee_receiver = config.fee_receiver.clone();
        Self {
            config,
            capacity,
            bank,
            account: "rondo:engine".to_string(),
            ledger: RwLock::new(None),
            provider: RwLock::new(provider),
            state: Mutex::new(EngineState {
                rounds: Vec::new(),
                pending: HashMap::new(),
                paused: false,
                fee_receiver,
                total_distributed: 0,
                total_participants: 0,
            }),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account
    }

    pub fn entry_fee(&self) -> u64 {
        self.config.entry_fee_lamports
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ledger_handle(&self) -> Option<Arc<ReferralLedger>> {
        self.ledger
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn provider_handle(&self) -> Arc<dyn RandomnessProvider> {
        self.provider
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn require_owner(&self, caller: &PlayerId) -> EngineResult<()> {
        if caller != &self.config.owner {
            return Err(AuthorizationError::NotOwner(caller.clone()).into());
        }
        Ok(())
    }

    // ── participation ────────────────────────────────────────────────

    pub fn participate(&self, caller: &PlayerId, paid: u64) -> EngineResult<ParticipationReceipt> {
        self.participate_at(caller, paid, unix_now())
    }

    /// Clock-explicit participation.
    pub fn participate_at(
        &self,
        caller: &PlayerId,
        paid: u64,
        now: u64,
    ) -> EngineResult<ParticipationReceipt> {
        let entry_fee = self.config.entry_fee_lamports;
        let mut state = self.state();

        if state.paused {
            return Err(ValidationError::EnginePaused.into());
        }
        if paid != entry_fee {
            return Err(ValidationError::WrongEntryFee {
                expected: entry_fee,
                got: paid,
            }
            .into());
        }

        // Decide where this entry lands before touching anything.
        let open_fresh = match state.rounds.last() {
            None => true,
            Some(round) if round.is_terminal() => true,
            Some(round) => {
                match round.status {
                    RoundStatus::AwaitingRandomness => {
                        return Err(ValidationError::RoundFull(round.id).into());
                    }
                    RoundStatus::Open => {
                        if round.is_expired(now, self.config.refund_timeout_secs) {
                            return Err(ValidationError::RoundExpired(round.id).into());
                        }
                        if round.contains(caller) {
                            return Err(ValidationError::DuplicateParticipant(caller.clone()).into());
                        }
                        if round.participants.len() >= self.capacity {
                            return Err(ValidationError::RoundFull(round.id).into());
                        }
                    }
                    RoundStatus::Finished | RoundStatus::Refunded => {}
                }
                false
            }
        };

        // Escrow the entry fee; a failed debit rejects the whole call
        // before any round state has changed.
        self.bank.transfer(caller, &self.account, paid)?;

        if open_fresh {
            let id = state.rounds.len() as RoundId + 1;
            state.rounds.push(Round::new(id, now));
        }
        let idx = state.rounds.len() - 1;
        state.total_participants += 1;

        let round = &mut state.rounds[idx];
        round.participants.push(caller.clone());
        let position = round.participants.len() - 1;
        let round_id = round.id;

        // Best-effort inviter lookup: a missing ledger never blocks entry.
        let referral = match self.ledger_handle() {
            None => ReferralCredit::Skipped,
            Some(ledger) => match ledger.get_inviter(caller) {
                Some(inviter) => {
                    let amount = entry_fee * self.config.referral_percent / 100;
                    if amount > 0 {
                        round.accrue(&inviter, amount);
                        tracing::debug!(
                            round = round_id,
                            inviter = %inviter,
                            amount,
                            "referral accrued"
                        );
                    }
                    ReferralCredit::Credited { inviter, amount }
                }
                None => ReferralCredit::NoInviter,
            },
        };

        // Fill: freeze the ordering and issue exactly one request.
        let mut filled = false;
        let mut issued: Option<RequestToken> = None;
        if round.participants.len() == self.capacity {
            filled = true;
            round.status = RoundStatus::AwaitingRandomness;
            let ctx = RandomnessContext {
                round_id,
                participant_count: self.capacity,
                requested_at: now,
            };
            match self.provider_handle().request(ctx) {
                Ok(token) => {
                    round.pending_token = Some(token.clone());
                    issued = Some(token);
                }
                Err(e) => {
                    // Round stays AwaitingRandomness without a token; the
                    // admin retry path reissues.
                    tracing::warn!(round = round_id, "randomness request failed: {e}");
                }
            }
        }
        if let Some(token) = issued {
            state.pending.insert(token, round_id);
        }

        tracing::info!(round = round_id, player = %caller, position, filled, "participation accepted");
        Ok(ParticipationReceipt {
            round_id,
            position,
            filled,
            referral,
        })
    }

    // ── randomness delivery & finalization ───────────────────────────

    /// Accept a delivered random value and finalize its round.
    ///
    /// Only the outstanding token is accepted, only once: the entry is
    /// removed from the pending table up front, so duplicates and
    /// post-refund deliveries fail with `UnknownToken`.
    pub fn on_randomness_delivered(
        &self,
        token: RequestToken,
        value: u64,
    ) -> EngineResult<FinalizeReport> {
        let entry_fee = self.config.entry_fee_lamports;
        let mut state = self.state();

        let round_id = state
            .pending
            .remove(&token)
            .ok_or_else(|| ConsistencyError::UnknownToken(token.to_string()))?;
        let idx = (round_id - 1) as usize;

        let (winner, split, accruals, accrued) = {
            let round = &mut state.rounds[idx];
            if round.is_terminal() {
                return Err(ConsistencyError::AlreadyFinished(round_id).into());
            }
            if round.participants.len() != self.capacity {
                return Err(ConsistencyError::RoundNotFull {
                    round: round_id,
                    have: round.participants.len(),
                    need: self.capacity,
                }
                .into());
            }

            let winner_index = Round::winner_index(value, self.capacity);
            let winner = round.participants[winner_index].clone();
            round.seed = Some(value);
            round.winner = Some(winner.clone());
            round.status = RoundStatus::Finished;
            round.pending_token = None;

            let split = FeeSplit::compute(
                entry_fee,
                self.capacity,
                self.config.platform_fee_percent,
                round.total_referral_accrued,
            );
            if split.clamped(round.total_referral_accrued) {
                tracing::warn!(
                    round = round_id,
                    accrued = round.total_referral_accrued,
                    gross = split.platform_fee_gross,
                    "referral accrual exceeds gross fee; net fee clamped to zero"
                );
            }
            (
                winner,
                split,
                round.accruals.clone(),
                round.total_referral_accrued,
            )
        };

        // Round state is committed; transfers happen last.
        let payout = match self.bank.transfer(&self.account, &winner, split.winner_payout) {
            Ok(()) => {
                state.total_distributed += split.winner_payout;
                PayoutStatus::Paid {
                    amount: split.winner_payout,
                }
            }
            Err(e) => {
                tracing::warn!(round = round_id, winner = %winner, "winner payout deferred: {e}");
                PayoutStatus::Deferred {
                    amount: split.winner_payout,
                    reason: e.to_string(),
                }
            }
        };

        let escrow = split.net_platform_fee + accrued;
        let settlement = match self.ledger_handle() {
            None => {
                tracing::warn!(round = round_id, "settlement deferred: no referral ledger configured");
                SettlementDispatch::Deferred {
                    amount: escrow,
                    reason: "no referral ledger configured".to_string(),
                }
            }
            Some(ledger) => {
                let (inviters, amounts): (Vec<PlayerId>, Vec<u64>) =
                    accruals.into_iter().unzip();
                match ledger.settle_round(
                    &self.account,
                    round_id,
                    split.net_platform_fee,
                    &inviters,
                    &amounts,
                    escrow,
                ) {
                    Ok(()) => {
                        state.rounds[idx].settlement_released = true;
                        SettlementDispatch::Released { escrowed: escrow }
                    }
                    Err(e) => {
                        tracing::warn!(round = round_id, "settlement deferred: {e}");
                        SettlementDispatch::Deferred {
                            amount: escrow,
                            reason: e.to_string(),
                        }
                    }
                }
            }
        };

        tracing::info!(
            round = round_id,
            winner = %winner,
            payout = split.winner_payout,
            "round finished"
        );
        Ok(FinalizeReport {
            round_id,
            winner,
            split,
            payout,
            settlement,
        })
    }

    // ── refunds ──────────────────────────────────────────────────────

    pub fn refund(&self, round_id: RoundId) -> EngineResult<RefundReport> {
        self.refund_at(round_id, unix_now())
    }

    /// Timeout refund; callable by anyone once the round has gone stale.
    pub fn refund_at(&self, round_id: RoundId, now: u64) -> EngineResult<RefundReport> {
        let entry_fee = self.config.entry_fee_lamports;
        let timeout = self.config.refund_timeout_secs;
        let mut state = self.state();

        let idx = round_index(&state.rounds, round_id)?;
        let participants = {
            let round = &mut state.rounds[idx];
            if round.is_terminal() {
                return Err(ValidationError::RoundClosed(round_id).into());
            }
            if round.participants.is_empty() {
                return Err(ValidationError::EmptyRound(round_id).into());
            }
            if !round.is_expired(now, timeout) {
                return Err(ValidationError::TimeoutNotReached {
                    round: round_id,
                    age_secs: round.age_secs(now),
                    timeout_secs: timeout,
                }
                .into());
            }

            round.status = RoundStatus::Refunded;
            let stale_token = round.pending_token.take();
            let participants = round.participants.clone();
            if let Some(token) = stale_token {
                // A late delivery for this token is now rejected outright.
                state.pending.remove(&token);
            }
            participants
        };

        let mut returned = 0;
        for player in &participants {
            match self.bank.transfer(&self.account, player, entry_fee) {
                Ok(()) => returned += entry_fee,
                Err(e) => {
                    tracing::warn!(round = round_id, player = %player, "refund transfer failed: {e}");
                }
            }
        }

        tracing::info!(
            round = round_id,
            participants = participants.len(),
            returned,
            "round refunded"
        );
        Ok(RefundReport {
            round_id,
            participants: participants.len(),
            amount_each: entry_fee,
            returned,
        })
    }

    // ── administration ───────────────────────────────────────────────

    /// Reissue a randomness request for a stalled full round.
    pub fn retry_randomness_request(
        &self,
        caller: &PlayerId,
        round_id: RoundId,
    ) -> EngineResult<RequestToken> {
        self.require_owner(caller)?;
        let mut state = self.state();

        let idx = round_index(&state.rounds, round_id)?;
        {
            let round = &state.rounds[idx];
            if round.is_terminal() {
                return Err(ValidationError::RoundClosed(round_id).into());
            }
            if round.participants.len() != self.capacity {
                return Err(ConsistencyError::RoundNotFull {
                    round: round_id,
                    have: round.participants.len(),
                    need: self.capacity,
                }
                .into());
            }
        }

        let ctx = RandomnessContext {
            round_id,
            participant_count: self.capacity,
            requested_at: unix_now(),
        };
        let token = self.provider_handle().request(ctx)?;

        let round = &mut state.rounds[idx];
        if let Some(stale) = round.pending_token.replace(token.clone()) {
            state.pending.remove(&stale);
        }
        state.pending.insert(token.clone(), round_id);
        tracing::info!(round = round_id, token = %token, "randomness request reissued");
        Ok(token)
    }

    pub fn pause(&self, caller: &PlayerId) -> EngineResult<()> {
        self.require_owner(caller)?;
        self.state().paused = true;
        tracing::info!("participation paused");
        Ok(())
    }

    pub fn unpause(&self, caller: &PlayerId) -> EngineResult<()> {
        self.require_owner(caller)?;
        self.state().paused = false;
        tracing::info!("participation resumed");
        Ok(())
    }

    pub fn set_fee_receiver(&self, caller: &PlayerId, receiver: PlayerId) -> EngineResult<()> {
        self.require_owner(caller)?;
        self.state().fee_receiver = receiver;
        Ok(())
    }

    pub fn set_referral_ledger(
        &self,
        caller: &PlayerId,
        ledger: Option<Arc<ReferralLedger>>,
    ) -> EngineResult<()> {
        self.require_owner(caller)?;
        *self.ledger.write().unwrap_or_else(|e| e.into_inner()) = ledger;
        Ok(())
    }

    pub fn set_randomness_provider(
        &self,
        caller: &PlayerId,
        provider: Arc<dyn RandomnessProvider>,
    ) -> EngineResult<()> {
        self.require_owner(caller)?;
        *self.provider.write().unwrap_or_else(|e| e.into_inner()) = provider;
        Ok(())
    }

    /// Move the engine's remaining custody to the fee receiver. Last-resort
    /// recovery for residue left by deferred payouts or settlements.
    pub fn emergency_sweep(&self, caller: &PlayerId) -> EngineResult<u64> {
        self.require_owner(caller)?;
        let state = self.state();
        let amount = self.bank.balance(&self.account);
        let receiver = state.fee_receiver.clone();
        self.bank.transfer(&self.account, &receiver, amount)?;
        tracing::warn!(amount, receiver = %receiver, "engine custody swept");
        Ok(amount)
    }

    // ── read-only surface ────────────────────────────────────────────

    pub fn current_round(&self) -> Option<RoundSnapshot> {
        let state = self.state();
        state
            .rounds
            .last()
            .map(|r| r.snapshot(self.capacity, self.config.entry_fee_lamports))
    }

    pub fn round(&self, round_id: RoundId) -> Option<RoundSnapshot> {
        let state = self.state();
        round_index(&state.rounds, round_id)
            .ok()
            .map(|idx| state.rounds[idx].snapshot(self.capacity, self.config.entry_fee_lamports))
    }

    /// Page through round history, newest first.
    pub fn history(&self, offset: usize, limit: usize) -> (usize, Vec<RoundSnapshot>) {
        let state = self.state();
        let total = state.rounds.len();
        let page = state
            .rounds
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .map(|r| r.snapshot(self.capacity, self.config.entry_fee_lamports))
            .collect();
        (total, page)
    }

    /// Most recent finished rounds with their computed winner payouts.
    pub fn recent_finished(&self, limit: usize) -> Vec<FinishedRoundSummary> {
        let state = self.state();
        state
            .rounds
            .iter()
            .rev()
            .filter(|r| r.status == RoundStatus::Finished)
            .take(limit)
            .map(|r| {
                let split = FeeSplit::compute(
                    self.config.entry_fee_lamports,
                    r.participants.len(),
                    self.config.platform_fee_percent,
                    r.total_referral_accrued,
                );
                FinishedRoundSummary {
                    id: r.id,
                    winner: r.winner.clone().unwrap_or_default(),
                    winner_payout: split.winner_payout,
                    participant_count: r.participants.len(),
                    settlement_released: r.settlement_released,
                }
            })
            .collect()
    }

    /// Recompute the winner index from the stored seed and compare it to
    /// the recorded winner.
    pub fn verify_round(&self, round_id: RoundId) -> EngineResult<RoundVerification> {
        let state = self.state();
        let idx = round_index(&state.rounds, round_id)?;
        let round = &state.rounds[idx];
        let (seed, recorded_winner) = match (round.seed, round.winner.clone()) {
            (Some(seed), Some(winner)) if round.status == RoundStatus::Finished => (seed, winner),
            _ => return Err(ValidationError::RoundNotFinished(round_id).into()),
        };

        let winner_index = Round::winner_index(seed, round.participants.len());
        let expected_winner = round.participants[winner_index].clone();
        let valid = expected_winner == recorded_winner;
        Ok(RoundVerification {
            round_id,
            seed,
            winner_index,
            expected_winner,
            recorded_winner,
            valid,
        })
    }

    pub fn stats(&self) -> EngineStats {
        let state = self.state();
        EngineStats {
            rounds_total: state.rounds.len() as u64,
            rounds_finished: state
                .rounds
                .iter()
                .filter(|r| r.status == RoundStatus::Finished)
                .count() as u64,
            total_distributed: state.total_distributed,
            total_participants: state.total_participants,
        }
    }
}

fn round_index(rounds: &[Round], round_id: RoundId) -> Result<usize, ValidationError> {
    if round_id == 0 || round_id as usize > rounds.len() {
        return Err(ValidationError::UnknownRound(round_id));
    }
    Ok((round_id - 1) as usize)
}

#[async_trait]
impl RandomnessSink for GameEngine {
    async fn deliver(&self, token: RequestToken, value: u64) {
        if let Err(e) = self.on_randomness_delivered(token.clone(), value) {
            tracing::warn!(token = %token, "randomness delivery rejected: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GameVariant;
    use crate::engine::randomness::ManualProvider;

    const FEE: u64 = 10_000_000;
    const DAY: u64 = 86_400;

    fn operator() -> PlayerId {
        "operator".to_string()
    }

    fn config(variant: GameVariant) -> EngineConfig {
        EngineConfig {
            variant,
            ..EngineConfig::default()
        }
    }

    struct Fixture {
        bank: Arc<Bank>,
        provider: Arc<ManualProvider>,
        ledger: Arc<ReferralLedger>,
        engine: GameEngine,
    }

    fn setup(variant: GameVariant) -> Fixture {
        let bank = Arc::new(Bank::new());
        let provider = Arc::new(ManualProvider::new());
        let ledger = Arc::new(ReferralLedger::new(
            bank.clone(),
            operator(),
            "operator:fees".to_string(),
        ));
        let engine = GameEngine::new(config(variant), bank.clone(), provider.clone());
        engine
            .set_referral_ledger(&operator(), Some(ledger.clone()))
            .unwrap();
        ledger
            .authorize_settlement_caller(&operator(), &engine.account_id().to_string())
            .unwrap();
        Fixture {
            bank,
            provider,
            ledger,
            engine,
        }
    }

    fn fund(fixture: &Fixture, player: &str) -> PlayerId {
        fixture.bank.deposit(player, 10 * FEE);
        player.to_string()
    }

    fn fill_round(fixture: &Fixture, names: &[&str], now: u64) -> RequestToken {
        for name in names {
            let player = fund(fixture, name);
            fixture.engine.participate_at(&player, FEE, now).unwrap();
        }
        let mut requests = fixture.provider.take_requests();
        assert_eq!(requests.len(), 1, "exactly one request per filled round");
        requests.remove(0).0
    }

    #[test]
    fn test_wrong_fee_rejected_without_side_effects() {
        let fixture = setup(GameVariant::Duel);
        let alice = fund(&fixture, "alice");
        let err = fixture.engine.participate_at(&alice, FEE - 1, 0).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::WrongEntryFee { .. })
        ));
        assert!(fixture.engine.current_round().is_none());
        assert_eq!(fixture.bank.balance("alice"), 10 * FEE);
    }

    #[test]
    fn test_duplicate_participant_rejected() {
        let fixture = setup(GameVariant::FiveSeat);
        let alice = fund(&fixture, "alice");
        fixture.engine.participate_at(&alice, FEE, 0).unwrap();
        let err = fixture.engine.participate_at(&alice, FEE, 1).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::DuplicateParticipant(_))
        ));
        let snapshot = fixture.engine.current_round().unwrap();
        assert_eq!(snapshot.participants, vec!["alice".to_string()]);
    }

    #[test]
    fn test_fill_requests_randomness_once_and_blocks_entry() {
        let fixture = setup(GameVariant::Duel);
        fill_round(&fixture, &["alice", "bob"], 0);

        let snapshot = fixture.engine.current_round().unwrap();
        assert_eq!(snapshot.status, RoundStatus::AwaitingRandomness);

        let carol = fund(&fixture, "carol");
        let err = fixture.engine.participate_at(&carol, FEE, 1).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::RoundFull(1))
        ));
        assert!(fixture.provider.take_requests().is_empty());
    }

    #[test]
    fn test_delivery_finalizes_pays_and_settles() {
        let fixture = setup(GameVariant::Duel);
        let token = fill_round(&fixture, &["alice", "bob"], 0);

        let report = fixture.engine.on_randomness_delivered(token, 7).unwrap();
        // seed 7 % 2 == 1 → bob
        assert_eq!(report.winner, "bob");
        assert_eq!(report.split.total_pool, 20_000_000);
        assert_eq!(report.split.platform_fee_gross, 1_200_000);
        assert_eq!(report.split.winner_payout, 18_800_000);
        assert_eq!(
            report.payout,
            PayoutStatus::Paid { amount: 18_800_000 }
        );
        assert_eq!(
            report.settlement,
            SettlementDispatch::Released {
                escrowed: 1_200_000
            }
        );

        // bob started with 10×FEE, paid one fee, won the pool minus fees.
        assert_eq!(fixture.bank.balance("bob"), 9 * FEE + 18_800_000);
        assert_eq!(fixture.bank.balance(fixture.engine.account_id()), 0);
        assert_eq!(fixture.ledger.platform_balance(), 1_200_000);
        assert!(fixture.ledger.is_settled(1));

        let snapshot = fixture.engine.round(1).unwrap();
        assert_eq!(snapshot.status, RoundStatus::Finished);
        assert!(snapshot.settlement_released);
        assert_eq!(snapshot.seed, Some(7));
    }

    #[test]
    fn test_duplicate_delivery_rejected() {
        let fixture = setup(GameVariant::Duel);
        let token = fill_round(&fixture, &["alice", "bob"], 0);

        fixture
            .engine
            .on_randomness_delivered(token.clone(), 0)
            .unwrap();
        let err = fixture.engine.on_randomness_delivered(token, 1).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Consistency(ConsistencyError::UnknownToken(_))
        ));

        // Winner unchanged.
        assert_eq!(fixture.engine.round(1).unwrap().winner, Some("alice".to_string()));
    }

    #[test]
    fn test_referred_participant_accrues_for_inviter() {
        let fixture = setup(GameVariant::FiveSeat);
        let ivy = fund(&fixture, "ivy");
        let code = fixture.ledger.mint_invite_code(&ivy).unwrap();
        fixture
            .ledger
            .establish_relationship(&"dina".to_string(), &code)
            .unwrap();

        for name in ["alice", "bob", "carol"] {
            let player = fund(&fixture, name);
            fixture.engine.participate_at(&player, FEE, 0).unwrap();
        }
        let dina = fund(&fixture, "dina");
        let receipt = fixture.engine.participate_at(&dina, FEE, 0).unwrap();
        assert_eq!(
            receipt.referral,
            ReferralCredit::Credited {
                inviter: ivy.clone(),
                amount: 200_000
            }
        );

        let eve = fund(&fixture, "eve");
        fixture.engine.participate_at(&eve, FEE, 0).unwrap();
        let token = fixture.provider.take_requests().remove(0).0;

        let report = fixture.engine.on_randomness_delivered(token, 0).unwrap();
        assert_eq!(report.split.winner_payout, 47_000_000);
        assert_eq!(report.split.net_platform_fee, 2_800_000);

        assert_eq!(fixture.ledger.reward_account(&ivy).pending, 200_000);
        assert_eq!(fixture.ledger.platform_balance(), 2_800_000);
    }

    #[test]
    fn test_unconfigured_ledger_skips_referral_and_defers_settlement() {
        let fixture = setup(GameVariant::Duel);
        fixture.engine.set_referral_ledger(&operator(), None).unwrap();

        let alice = fund(&fixture, "alice");
        let receipt = fixture.engine.participate_at(&alice, FEE, 0).unwrap();
        assert_eq!(receipt.referral, ReferralCredit::Skipped);

        let bob = fund(&fixture, "bob");
        fixture.engine.participate_at(&bob, FEE, 0).unwrap();
        let token = fixture.provider.take_requests().remove(0).0;

        let report = fixture.engine.on_randomness_delivered(token, 0).unwrap();
        assert!(matches!(report.settlement, SettlementDispatch::Deferred { .. }));
        // Escrow residue stays in engine custody.
        assert_eq!(
            fixture.bank.balance(fixture.engine.account_id()),
            1_200_000
        );
        assert!(!fixture.engine.round(1).unwrap().settlement_released);
    }

    #[test]
    fn test_deauthorized_engine_defers_settlement_and_sweep_recovers() {
        let fixture = setup(GameVariant::Duel);
        fixture
            .ledger
            .deauthorize_settlement_caller(&operator(), &fixture.engine.account_id().to_string())
            .unwrap();

        let token = fill_round(&fixture, &["alice", "bob"], 0);
        let report = fixture.engine.on_randomness_delivered(token, 0).unwrap();
        assert!(matches!(report.settlement, SettlementDispatch::Deferred { .. }));
        assert!(!fixture.ledger.is_settled(1));

        let swept = fixture.engine.emergency_sweep(&operator()).unwrap();
        assert_eq!(swept, 1_200_000);
        assert_eq!(fixture.bank.balance("operator:fees"), 1_200_000);
    }

    #[test]
    fn test_refund_requires_timeout_then_pays_everyone_back() {
        let fixture = setup(GameVariant::FiveSeat);
        for name in ["alice", "bob", "carol"] {
            let player = fund(&fixture, name);
            fixture.engine.participate_at(&player, FEE, 1_000).unwrap();
        }

        let err = fixture.engine.refund_at(1, 1_000 + DAY).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::TimeoutNotReached { .. })
        ));

        let report = fixture.engine.refund_at(1, 1_000 + DAY + 1).unwrap();
        assert_eq!(report.participants, 3);
        assert_eq!(report.returned, 3 * FEE);
        for name in ["alice", "bob", "carol"] {
            assert_eq!(fixture.bank.balance(name), 10 * FEE);
        }
        assert_eq!(fixture.engine.round(1).unwrap().status, RoundStatus::Refunded);
        // No randomness was ever requested for a part-filled round.
        assert!(fixture.provider.take_requests().is_empty());

        let err = fixture.engine.refund_at(1, 1_000 + DAY + 2).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::RoundClosed(1))
        ));
    }

    #[test]
    fn test_late_delivery_after_refund_rejected() {
        let fixture = setup(GameVariant::Duel);
        let token = fill_round(&fixture, &["alice", "bob"], 0);

        fixture.engine.refund_at(1, DAY + 1).unwrap();
        let err = fixture.engine.on_randomness_delivered(token, 3).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Consistency(ConsistencyError::UnknownToken(_))
        ));
        assert_eq!(fixture.engine.round(1).unwrap().status, RoundStatus::Refunded);
    }

    #[test]
    fn test_participation_into_expired_round_rejected() {
        let fixture = setup(GameVariant::FiveSeat);
        let alice = fund(&fixture, "alice");
        fixture.engine.participate_at(&alice, FEE, 0).unwrap();

        let bob = fund(&fixture, "bob");
        let err = fixture.engine.participate_at(&bob, FEE, DAY + 1).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::RoundExpired(1))
        ));
    }

    #[test]
    fn test_new_round_opens_after_finish() {
        let fixture = setup(GameVariant::Duel);
        let token = fill_round(&fixture, &["alice", "bob"], 0);
        fixture.engine.on_randomness_delivered(token, 0).unwrap();

        let carol = fund(&fixture, "carol");
        let receipt = fixture.engine.participate_at(&carol, FEE, 10).unwrap();
        assert_eq!(receipt.round_id, 2);
        assert_eq!(fixture.engine.stats().rounds_total, 2);
    }

    #[test]
    fn test_pause_blocks_participation_only() {
        let fixture = setup(GameVariant::Duel);
        let token = fill_round(&fixture, &["alice", "bob"], 0);

        fixture.engine.pause(&operator()).unwrap();
        let carol = fund(&fixture, "carol");
        let err = fixture.engine.participate_at(&carol, FEE, 1).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::EnginePaused)
        ));

        // In-flight rounds still terminate while paused.
        fixture.engine.on_randomness_delivered(token, 0).unwrap();

        fixture.engine.unpause(&operator()).unwrap();
        fixture.engine.participate_at(&carol, FEE, 2).unwrap();
    }

    #[test]
    fn test_retry_reissues_and_invalidates_old_token() {
        let fixture = setup(GameVariant::Duel);
        let stale = fill_round(&fixture, &["alice", "bob"], 0);

        let err = fixture
            .engine
            .retry_randomness_request(&"mallory".to_string(), 1)
            .unwrap_err();
        assert!(matches!(err, EngineError::Authorization(_)));

        let fresh = fixture.engine.retry_randomness_request(&operator(), 1).unwrap();
        assert_eq!(fixture.provider.take_requests().len(), 1);

        let err = fixture.engine.on_randomness_delivered(stale, 9).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Consistency(ConsistencyError::UnknownToken(_))
        ));
        fixture.engine.on_randomness_delivered(fresh, 9).unwrap();
        assert_eq!(fixture.engine.round(1).unwrap().status, RoundStatus::Finished);
    }

    #[test]
    fn test_retry_rejected_for_open_or_terminal_rounds() {
        let fixture = setup(GameVariant::Duel);
        let alice = fund(&fixture, "alice");
        fixture.engine.participate_at(&alice, FEE, 0).unwrap();

        let err = fixture.engine.retry_randomness_request(&operator(), 1).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Consistency(ConsistencyError::RoundNotFull { .. })
        ));

        let err = fixture.engine.retry_randomness_request(&operator(), 9).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::UnknownRound(9))
        ));
    }

    #[test]
    fn test_verify_round_recomputes_winner() {
        let fixture = setup(GameVariant::Duel);
        let token = fill_round(&fixture, &["alice", "bob"], 0);
        fixture.engine.on_randomness_delivered(token, 5).unwrap();

        let verification = fixture.engine.verify_round(1).unwrap();
        assert!(verification.valid);
        assert_eq!(verification.seed, 5);
        assert_eq!(verification.winner_index, 1);
        assert_eq!(verification.expected_winner, "bob");

        let err = fixture.engine.verify_round(2).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Validation(ValidationError::UnknownRound(2))
        ));
    }

    #[test]
    fn test_history_pages_newest_first() {
        let fixture = setup(GameVariant::Duel);
        for (round, pair) in [["a1", "b1"], ["a2", "b2"], ["a3", "b3"]].iter().enumerate() {
            let token = fill_round(&fixture, pair, round as u64);
            fixture.engine.on_randomness_delivered(token, 0).unwrap();
        }

        let (total, page) = fixture.engine.history(0, 2);
        assert_eq!(total, 3);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, 3);
        assert_eq!(page[1].id, 2);

        let (_, tail) = fixture.engine.history(2, 2);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].id, 1);

        let recent = fixture.engine.recent_finished(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].winner_payout, 18_800_000);

        let stats = fixture.engine.stats();
        assert_eq!(stats.rounds_total, 3);
        assert_eq!(stats.rounds_finished, 3);
        assert_eq!(stats.total_participants, 6);
        assert_eq!(stats.total_distributed, 3 * 18_800_000);
    }
}
