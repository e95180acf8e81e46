// =============================================================================
// Coinbase Event Engine — command-line entry point
// =============================================================================
//
// Usage: coinbase-event-engine [request.json]
//
// Reads one wait request (from the file argument, or stdin), waits for the
// market event, and prints the outcome JSON on stdout. Logs go to stderr.
// Ctrl-C cancels the wait.
// =============================================================================

use std::io::Read;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use coinbase_event_engine::coinbase::{AnonymousSigner, CdpKeySigner, CoinbaseClient, TokenSigner};
use coinbase_event_engine::config::EngineConfig;
use coinbase_event_engine::market_data::{MarketDataPool, PoolDeps};
use coinbase_event_engine::stream::WebSocketTransport;
use coinbase_event_engine::triggers::{EventWaiter, WaitRequest};

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = EngineConfig::from_env();
    let request = read_request(std::env::args().nth(1))?;

    // ── 2. Collaborators & pool ──────────────────────────────────────────
    let signer: Arc<dyn TokenSigner> = match config.credentials() {
        Some((name, pem)) => Arc::new(CdpKeySigner::new(name, pem)?),
        None => {
            warn!("no Coinbase API credentials; streaming anonymously");
            Arc::new(AnonymousSigner)
        }
    };
    let fetcher = Arc::new(CoinbaseClient::new(
        config.rest_base_url.clone(),
        config.request_timeout(),
    )?);
    let pool = MarketDataPool::new(
        PoolDeps {
            transport: Arc::new(WebSocketTransport),
            fetcher,
            signer,
        },
        config.pool_settings(),
    );
    let waiter = EventWaiter::new(pool.clone(), config.max_wait_timeout_secs);

    // ── 3. Ctrl-C → cancel ───────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling wait");
            on_signal.cancel();
        }
    });

    // ── 4. Wait & report ─────────────────────────────────────────────────
    info!(subscriptions = request.subscriptions.len(), timeout = request.timeout, "waiting for market event");
    let outcome = waiter.wait_for_market_event(request, cancel).await;
    pool.close();

    let json = serde_json::to_string_pretty(&outcome).context("failed to serialise wait outcome")?;
    println!("{json}");
    Ok(())
}

fn read_request(path: Option<String>) -> Result<WaitRequest> {
    let content = match path {
        Some(path) => std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read wait request from {path}"))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read wait request from stdin")?;
            buf
        }
    };
    serde_json::from_str(&content).context("failed to parse wait request")
}
