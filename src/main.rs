//! rondo service binary.
//!
//! Wires the bank, referral ledger, VRF provider, and game engine together
//! and serves the HTTP surface.

use clap::Parser;
use rondo::api::{self, ApiContext};
use rondo::engine::VrfProvider;
use rondo::{Bank, GameEngine, ReferralLedger, RondoConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rondo")]
#[command(about = "Pooled-stake lottery engine with referral rewards", long_about = None)]
struct Args {
    /// Path to a TOML configuration file; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the API bind port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => RondoConfig::load(path)?,
        None => RondoConfig::default(),
    };
    if let Some(port) = args.port {
        config.api.bind_port = port;
    }
    config.validate()?;

    let owner = config.engine.owner.clone();
    let bank = Arc::new(Bank::new());
    let ledger = Arc::new(ReferralLedger::new(
        bank.clone(),
        owner.clone(),
        config.engine.fee_receiver.clone(),
    ));

    let provider = Arc::new(VrfProvider::new_random());
    let engine = Arc::new(GameEngine::new(
        config.engine.clone(),
        bank,
        provider.clone(),
    ));
    engine.set_referral_ledger(&owner, Some(ledger.clone()))?;
    ledger.authorize_settlement_caller(&owner, &engine.account_id().to_string())?;

    // Deliveries flow from the provider's worker back into the engine.
    provider.start(engine.clone());

    tracing::info!(
        variant = %config.engine.variant,
        capacity = engine.capacity(),
        entry_fee = engine.entry_fee(),
        vrf_public_key = %provider.public_key_hex(),
        "rondo engine ready"
    );

    api::serve(ApiContext {
        engine,
        ledger,
        config: config.api.clone(),
    })
    .await?;
    Ok(())
}
