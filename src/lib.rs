//! rondo - pooled-stake lottery engine with a referral reward ledger.
//!
//! Players deposit a fixed entry fee into a round; when the round fills, a
//! verifiable random value picks the winner. The pool splits between the
//! winner, a platform fee, and referral rewards owed to whoever invited
//! each participant. The referral ledger tracks relationships and claimable
//! balances independently of any single round.

use chrono::Utc;

pub mod api;
pub mod bank;
pub mod config;
pub mod engine;
pub mod errors;
pub mod referral;

pub use bank::Bank;
pub use config::{GameVariant, RondoConfig};
pub use engine::{GameEngine, VrfProvider};
pub use errors::{EngineError, EngineResult};
pub use referral::ReferralLedger;

/// Player identity. Doubles as the player's bank account name.
pub type PlayerId = String;

/// Current unix time in seconds.
pub(crate) fn unix_now() -> u64 {
    Utc::now().timestamp().max(0) as u64
}
