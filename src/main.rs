// =============================================================================
// Predatory Hunter — Main Entry Point
// =============================================================================
//
// A scheduler invokes this process once every two minutes; each invocation
// runs a single session against the broker's streaming price API for at
// most `max_stream_secs` (default 110s), well under the hosting runtime's
// own deadline. The process exits after printing the session report.
// =============================================================================

mod broker;
mod config;
mod errors;
mod executor;
mod exit_authority;
mod guards;
mod instrument_state;
mod persistence;
mod predator;
mod session;
mod tick;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::broker::client::BrokerClient;
use crate::config::BrokerEnv;
use crate::persistence::{FilePersistenceAdapter, PersistenceAdapter};
use crate::session::Session;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("predatory-hunter session starting");

    let env = match BrokerEnv::from_env() {
        Ok(env) => env,
        Err(e) => {
            error!(error = %e, "missing broker credentials, cannot start session");
            return Err(e);
        }
    };

    if !env.live_trading_enabled {
        error!("LIVE_TRADING_ENABLED is not set to true, refusing to open the broker stream");
        return Err(anyhow::anyhow!(
            "LIVE_TRADING_ENABLED must be explicitly \"true\" or \"1\" to start a session"
        ));
    }

    let instruments: Vec<String> = std::env::var("PREDATOR_INSTRUMENTS")
        .unwrap_or_else(|_| "EUR_USD,GBP_USD,USD_JPY,AUD_USD".to_string())
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();

    let data_dir = std::env::var("PREDATOR_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    let persistence: Box<dyn PersistenceAdapter> = Box::new(FilePersistenceAdapter::new(data_dir)?);

    let broker = BrokerClient::new(env.api_base.clone(), env.account_id.clone(), env.token.clone());

    info!(instruments = ?instruments, account_id = %env.account_id, "opening session");

    let session = Session::start(persistence, broker, env.admin_user_id.clone(), instruments).await?;
    let report = session.run().await?;

    info!(
        duration_ms = report.duration_ms,
        ticks = report.ticks_processed,
        fires = report.fires,
        autonomous_exits = report.autonomous_exits,
        "session complete"
    );

    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
