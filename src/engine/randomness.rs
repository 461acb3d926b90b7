//! Randomness acquisition for winner selection.
//!
//! The engine consumes randomness through a narrow two-phase protocol:
//! `request` returns a token synchronously, and a value for that token is
//! delivered later, exactly once or never. There is no latency guarantee;
//! the timeout-refund path races against delivery and wins by design when a
//! request stalls.
//!
//! The shipped [`VrfProvider`] signs the request context with an sr25519
//! key and hashes the signature into the delivered value, keeping a proof
//! record so any draw can be re-verified after the fact.

use crate::engine::round::RoundId;
use crate::errors::EngineError;
use async_trait::async_trait;
use dashmap::DashMap;
use schnorrkel::{context::SigningContext, Keypair, PublicKey, Signature};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

const DRAW_SIGNING_CONTEXT: &[u8] = b"rondo draw";

/// Opaque handle tying a delivery back to the round that requested it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestToken(String);

impl RequestToken {
    pub fn mint() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a provider may bind into its proof for one request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RandomnessContext {
    pub round_id: RoundId,
    pub participant_count: usize,
    pub requested_at: u64,
}

impl RandomnessContext {
    /// Deterministic input message; re-derivable by verifiers.
    pub fn input_message(&self, token: &RequestToken) -> String {
        format!(
            "round:{}:players:{}:at:{}:token:{}",
            self.round_id, self.participant_count, self.requested_at, token
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RandomnessError {
    #[error("randomness worker is not running")]
    WorkerStopped,

    #[error("invalid draw proof: {0}")]
    InvalidProof(String),
}

impl From<RandomnessError> for EngineError {
    fn from(e: RandomnessError) -> Self {
        EngineError::Randomness(e.to_string())
    }
}

/// Issues randomness requests. Delivery happens out-of-band through the
/// [`RandomnessSink`] the provider was started with.
pub trait RandomnessProvider: Send + Sync {
    fn request(&self, ctx: RandomnessContext) -> Result<RequestToken, RandomnessError>;
}

/// Inbound half of the protocol; implemented by the engine.
#[async_trait]
pub trait RandomnessSink: Send + Sync {
    async fn deliver(&self, token: RequestToken, value: u64);
}

/// Proof material for one completed draw.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DrawRecord {
    pub token: RequestToken,
    pub input_message: String,
    /// Hex-encoded SHA-256 of the signature (32 bytes).
    pub output: String,
    /// Hex-encoded sr25519 signature (64 bytes).
    pub proof: String,
    /// Hex-encoded public key (32 bytes).
    pub public_key: String,
    /// Value handed to the sink: big-endian u64 from the output head.
    pub value: u64,
}

struct PendingDraw {
    token: RequestToken,
    input_message: String,
}

/// VRF-style provider: sign the request context, hash the signature.
///
/// Requests are queued and served from a background worker so that delivery
/// is genuinely asynchronous with respect to the requesting call.
pub struct VrfProvider {
    keypair: Arc<Keypair>,
    queue: mpsc::UnboundedSender<PendingDraw>,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<PendingDraw>>>,
    records: Arc<DashMap<RequestToken, DrawRecord>>,
}

impl VrfProvider {
    pub fn new(keypair: Keypair) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        Self {
            keypair: Arc::new(keypair),
            queue,
            inbox: Mutex::new(Some(rx)),
            records: Arc::new(DashMap::new()),
        }
    }

    /// Fresh random keypair; public key changes every run.
    pub fn new_random() -> Self {
        use rand_core::OsRng;
        Self::new(Keypair::generate_with(OsRng))
    }

    /// Start delivering queued draws into `sink`. Call once, after wiring.
    pub fn start(&self, sink: Arc<dyn RandomnessSink>) {
        let rx = match self.inbox.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(mut rx) = rx else {
            tracing::warn!("vrf provider already started; ignoring");
            return;
        };

        let keypair = self.keypair.clone();
        let records = self.records.clone();
        tokio::spawn(async move {
            while let Some(draw) = rx.recv().await {
                let record = sign_draw(&keypair, &draw.token, &draw.input_message);
                tracing::debug!(token = %draw.token, value = record.value, "draw delivered");
                records.insert(draw.token.clone(), record.clone());
                sink.deliver(draw.token, record.value).await;
            }
        });
    }

    /// Proof record for an already-delivered draw.
    pub fn draw_record(&self, token: &RequestToken) -> Option<DrawRecord> {
        self.records.get(token).map(|r| r.clone())
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.keypair.public.to_bytes())
    }

    /// Re-verify a draw record against its embedded public key: signature
    /// checks out, output is the signature hash, value is the output head.
    pub fn verify_draw(record: &DrawRecord) -> Result<bool, RandomnessError> {
        let output = hex::decode(&record.output)
            .map_err(|e| RandomnessError::InvalidProof(format!("output hex: {e}")))?;
        let proof = hex::decode(&record.proof)
            .map_err(|e| RandomnessError::InvalidProof(format!("proof hex: {e}")))?;
        let public_key = hex::decode(&record.public_key)
            .map_err(|e| RandomnessError::InvalidProof(format!("public key hex: {e}")))?;

        let public_key: [u8; 32] = public_key
            .try_into()
            .map_err(|_| RandomnessError::InvalidProof("public key must be 32 bytes".to_string()))?;
        let public_key = PublicKey::from_bytes(&public_key)
            .map_err(|e| RandomnessError::InvalidProof(format!("public key: {e:?}")))?;

        let proof: [u8; 64] = proof
            .try_into()
            .map_err(|_| RandomnessError::InvalidProof("signature must be 64 bytes".to_string()))?;
        let signature = Signature::from_bytes(&proof)
            .map_err(|e| RandomnessError::InvalidProof(format!("signature: {e:?}")))?;

        let ctx = SigningContext::new(DRAW_SIGNING_CONTEXT);
        let transcript = ctx.bytes(record.input_message.as_bytes());
        if public_key.verify(transcript, &signature).is_err() {
            return Ok(false);
        }

        let expected_output = Sha256::digest(proof);
        if expected_output.as_slice() != output.as_slice() {
            return Ok(false);
        }

        Ok(record.value == value_from_output(&output))
    }
}

impl RandomnessProvider for VrfProvider {
    fn request(&self, ctx: RandomnessContext) -> Result<RequestToken, RandomnessError> {
        let token = RequestToken::mint();
        let input_message = ctx.input_message(&token);
        self.queue
            .send(PendingDraw {
                token: token.clone(),
                input_message,
            })
            .map_err(|_| RandomnessError::WorkerStopped)?;
        Ok(token)
    }
}

fn sign_draw(keypair: &Keypair, token: &RequestToken, input_message: &str) -> DrawRecord {
    let ctx = SigningContext::new(DRAW_SIGNING_CONTEXT);
    let transcript = ctx.bytes(input_message.as_bytes());
    let signature = keypair.sign(transcript);
    let proof = signature.to_bytes();
    let output = Sha256::digest(proof);

    DrawRecord {
        token: token.clone(),
        input_message: input_message.to_string(),
        output: hex::encode(output),
        proof: hex::encode(proof),
        public_key: hex::encode(keypair.public.to_bytes()),
        value: value_from_output(&output),
    }
}

fn value_from_output(output: &[u8]) -> u64 {
    let mut head = [0u8; 8];
    for (slot, byte) in head.iter_mut().zip(output.iter()) {
        *slot = *byte;
    }
    u64::from_be_bytes(head)
}

/// Hand-cranked provider: records requests, delivers nothing on its own.
/// Used by tests and local tooling that want to control delivery timing.
#[derive(Default)]
pub struct ManualProvider {
    requests: Mutex<Vec<(RequestToken, RandomnessContext)>>,
}

impl ManualProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain every request issued since the last call.
    pub fn take_requests(&self) -> Vec<(RequestToken, RandomnessContext)> {
        match self.requests.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => Vec::new(),
        }
    }
}

impl RandomnessProvider for ManualProvider {
    fn request(&self, ctx: RandomnessContext) -> Result<RequestToken, RandomnessError> {
        let token = RequestToken::mint();
        match self.requests.lock() {
            Ok(mut pending) => {
                pending.push((token.clone(), ctx));
                Ok(token)
            }
            Err(_) => Err(RandomnessError::WorkerStopped),
        }
    }
}
