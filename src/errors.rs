//! Error taxonomy for the rondo engine and referral ledger.
//!
//! Every user-visible failure is a synchronous rejection that leaves state
//! untouched. The only partial-success paths (winner payout and referral
//! settlement during finalize, inviter lookup during participation) are
//! reported through result types, not through these errors.

use crate::bank::TransferError;
use crate::PlayerId;

/// Root error type for engine and ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("unauthorized: {0}")]
    Authorization(#[from] AuthorizationError),

    #[error("consistency violation: {0}")]
    Consistency(#[from] ConsistencyError),

    #[error("transfer failed: {0}")]
    External(#[from] TransferError),

    #[error("randomness provider error: {0}")]
    Randomness(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Rejections of well-formed but invalid requests. No state change.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("participation is paused")]
    EnginePaused,

    #[error("wrong entry fee: expected {expected} lamports, got {got}")]
    WrongEntryFee { expected: u64, got: u64 },

    #[error("round {0} is full")]
    RoundFull(u64),

    #[error("round {0} is closed")]
    RoundClosed(u64),

    #[error("round {0} is past the refund timeout")]
    RoundExpired(u64),

    #[error("player {0} already participates in this round")]
    DuplicateParticipant(PlayerId),

    #[error("unknown round {0}")]
    UnknownRound(u64),

    #[error("round {round} is {age_secs}s old, refundable after {timeout_secs}s")]
    TimeoutNotReached {
        round: u64,
        age_secs: u64,
        timeout_secs: u64,
    },

    #[error("round {0} has no participants to refund")]
    EmptyRound(u64),

    #[error("round {0} is not finished")]
    RoundNotFinished(u64),

    #[error("nothing to claim")]
    NothingToClaim,

    #[error("custody holds {available} lamports, {needed} needed")]
    InsufficientCustody { needed: u64, available: u64 },

    #[error("player {0} already has an inviter")]
    AlreadyReferred(PlayerId),

    #[error("unknown invite code {0}")]
    UnknownInviteCode(String),

    #[error("players cannot refer themselves")]
    SelfReferral,
}

/// Caller is not allowed to perform the operation. No state change.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthorizationError {
    #[error("{0} is not the owner")]
    NotOwner(PlayerId),

    #[error("{0} is not an authorized settlement caller")]
    SettlementCallerNotAllowed(PlayerId),
}

/// Internal-protocol violations: stale tokens, duplicate settlement,
/// mismatched settlement payloads. Rejected whole, nothing is credited.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConsistencyError {
    #[error("unknown randomness token {0}")]
    UnknownToken(String),

    #[error("round {0} is already finished")]
    AlreadyFinished(u64),

    #[error("round {round} holds {have} of {need} participants")]
    RoundNotFull { round: u64, have: usize, need: usize },

    #[error("round {0} was already settled")]
    AlreadySettled(u64),

    #[error("settlement lists differ in length: {inviters} inviters, {amounts} amounts")]
    LengthMismatch { inviters: usize, amounts: usize },

    #[error("escrowed {escrowed} lamports, settlement declares {declared}")]
    EscrowMismatch { escrowed: u64, declared: u64 },

    #[error("could not mint a unique invite code after {0} attempts")]
    CodeMintExhausted(u32),
}

pub type EngineResult<T> = Result<T, EngineError>;
