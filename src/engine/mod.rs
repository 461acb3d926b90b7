pub mod engine;
pub mod randomness;
pub mod round;

pub use engine::{
    EngineStats, FinalizeReport, FinishedRoundSummary, GameEngine, ParticipationReceipt,
    PayoutStatus, RefundReport, ReferralCredit, RoundVerification, SettlementDispatch,
};
pub use randomness::{
    DrawRecord, ManualProvider, RandomnessContext, RandomnessProvider, RandomnessSink,
    RequestToken, VrfProvider,
};
pub use round::{FeeSplit, Round, RoundId, RoundSnapshot, RoundStatus};
