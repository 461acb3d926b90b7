//! Round records and the fee arithmetic applied at finalization.

use crate::engine::randomness::RequestToken;
use crate::PlayerId;
use serde::{Deserialize, Serialize};

pub type RoundId = u64;

/// Round lifecycle. `Finished` and `Refunded` are terminal: the participant
/// list, seed, and winner never change afterwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Open,
    AwaitingRandomness,
    Finished,
    Refunded,
}

/// One instance of the pooled-stake game.
#[derive(Clone, Debug)]
pub struct Round {
    pub id: RoundId,
    pub started_at: u64,
    pub status: RoundStatus,
    /// Ordered, duplicate-free. Frozen once the round fills: the winner
    /// index is taken against this exact ordering.
    pub participants: Vec<PlayerId>,
    pub seed: Option<u64>,
    pub winner: Option<PlayerId>,
    /// Per-inviter accruals in first-accrual order.
    pub accruals: Vec<(PlayerId, u64)>,
    pub total_referral_accrued: u64,
    /// Guards against paying the referral ledger twice. Set at most once,
    /// only on a Finished round.
    pub settlement_released: bool,
    pub pending_token: Option<RequestToken>,
}

impl Round {
    pub fn new(id: RoundId, started_at: u64) -> Self {
        Self {
            id,
            started_at,
            status: RoundStatus::Open,
            participants: Vec::new(),
            seed: None,
            winner: None,
            accruals: Vec::new(),
            total_referral_accrued: 0,
            settlement_released: false,
            pending_token: None,
        }
    }

    pub fn contains(&self, player: &PlayerId) -> bool {
        // Linear scan; capacity is single digits.
        self.participants.iter().any(|p| p == player)
    }

    pub fn age_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.started_at)
    }

    pub fn is_expired(&self, now: u64, timeout_secs: u64) -> bool {
        self.age_secs(now) > timeout_secs
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, RoundStatus::Finished | RoundStatus::Refunded)
    }

    /// Credit a referral accrual against this round. The first accrual for
    /// an inviter also adds them to the payee list.
    pub fn accrue(&mut self, inviter: &PlayerId, amount: u64) {
        match self.accruals.iter_mut().find(|(p, _)| p == inviter) {
            Some((_, total)) => *total += amount,
            None => self.accruals.push((inviter.clone(), amount)),
        }
        self.total_referral_accrued += amount;
    }

    /// Winner position for a delivered seed. Always in `[0, len)`.
    pub fn winner_index(seed: u64, participant_count: usize) -> usize {
        (seed % participant_count as u64) as usize
    }

    pub fn snapshot(&self, capacity: usize, entry_fee: u64) -> RoundSnapshot {
        RoundSnapshot {
            id: self.id,
            status: self.status,
            started_at: self.started_at,
            capacity,
            entry_fee,
            participants: self.participants.clone(),
            seed: self.seed,
            winner: self.winner.clone(),
            total_referral_accrued: self.total_referral_accrued,
            settlement_released: self.settlement_released,
        }
    }
}

/// Serializable view of a round for the read-only surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoundSnapshot {
    pub id: RoundId,
    pub status: RoundStatus,
    pub started_at: u64,
    pub capacity: usize,
    pub entry_fee: u64,
    pub participants: Vec<PlayerId>,
    pub seed: Option<u64>,
    pub winner: Option<PlayerId>,
    pub total_referral_accrued: u64,
    pub settlement_released: bool,
}

/// Exact integer split of a finished round's pool.
///
/// `winner_payout + platform_fee_gross == total_pool` always; truncation in
/// the gross fee goes to the winner, never lost.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSplit {
    pub total_pool: u64,
    pub platform_fee_gross: u64,
    pub winner_payout: u64,
    pub net_platform_fee: u64,
}

impl FeeSplit {
    /// Split a full round's pool. `net_platform_fee` clamps to zero if the
    /// referral accrual ever exceeds the gross fee.
    pub fn compute(
        entry_fee: u64,
        participant_count: usize,
        platform_fee_percent: u64,
        total_referral_accrued: u64,
    ) -> Self {
        let total_pool = entry_fee * participant_count as u64;
        let platform_fee_gross = total_pool * platform_fee_percent / 100;
        let winner_payout = total_pool - platform_fee_gross;
        let net_platform_fee = platform_fee_gross.saturating_sub(total_referral_accrued);
        Self {
            total_pool,
            platform_fee_gross,
            winner_payout,
            net_platform_fee,
        }
    }

    pub fn clamped(&self, total_referral_accrued: u64) -> bool {
        total_referral_accrued > self.platform_fee_gross
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player(n: u32) -> PlayerId {
        format!("player-{n}")
    }

    #[test]
    fn test_two_player_split() {
        // 0.01 SOL entry, two seats.
        let split = FeeSplit::compute(10_000_000, 2, 6, 0);
        assert_eq!(split.total_pool, 20_000_000);
        assert_eq!(split.platform_fee_gross, 1_200_000);
        assert_eq!(split.winner_payout, 18_800_000);
        assert_eq!(split.net_platform_fee, 1_200_000);
    }

    #[test]
    fn test_five_player_split_with_referral_accrual() {
        let split = FeeSplit::compute(10_000_000, 5, 6, 200_000);
        assert_eq!(split.total_pool, 50_000_000);
        assert_eq!(split.platform_fee_gross, 3_000_000);
        assert_eq!(split.winner_payout, 47_000_000);
        assert_eq!(split.net_platform_fee, 2_800_000);
        assert!(!split.clamped(200_000));
    }

    #[test]
    fn test_split_accounts_for_every_lamport() {
        for count in 1..=10 {
            for fee in [1u64, 3, 999, 10_000_000, 12_345_678] {
                let split = FeeSplit::compute(fee, count, 6, 0);
                assert_eq!(
                    split.winner_payout + split.platform_fee_gross,
                    fee * count as u64
                );
            }
        }
    }

    #[test]
    fn test_net_fee_clamps_to_zero() {
        let split = FeeSplit::compute(100, 2, 6, 50);
        assert_eq!(split.platform_fee_gross, 12);
        assert_eq!(split.net_platform_fee, 0);
        assert!(split.clamped(50));
    }

    #[test]
    fn test_winner_index_in_range() {
        for seed in [0u64, 1, 4, 5, 17, u64::MAX] {
            let idx = Round::winner_index(seed, 5);
            assert!(idx < 5);
        }
        assert_eq!(Round::winner_index(7, 5), 2);
        assert_eq!(Round::winner_index(u64::MAX, 2), 1);
    }

    #[test]
    fn test_accrue_merges_per_inviter() {
        let mut round = Round::new(1, 0);
        round.accrue(&player(1), 200_000);
        round.accrue(&player(2), 200_000);
        round.accrue(&player(1), 200_000);
        assert_eq!(round.accruals.len(), 2);
        assert_eq!(round.accruals[0], (player(1), 400_000));
        assert_eq!(round.accruals[1], (player(2), 200_000));
        assert_eq!(round.total_referral_accrued, 600_000);
    }

    #[test]
    fn test_expiry_is_strict() {
        let round = Round::new(1, 1_000);
        assert!(!round.is_expired(1_000 + 86_400, 86_400));
        assert!(round.is_expired(1_000 + 86_401, 86_400));
    }
}
