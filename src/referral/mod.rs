pub mod codes;
pub mod ledger;

pub use codes::CodeMint;
pub use ledger::{ReferralLedger, RewardAccount, SettlementRecord};
