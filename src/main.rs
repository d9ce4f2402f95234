// =============================================================================
// Breakout Bot — Main Entry Point
// =============================================================================
//
// Starts in paper mode unless `paper_trading` is false (or BOT_PAPER=0).
// Market data always comes from the public OKX endpoints.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use breakout_bot::api;
use breakout_bot::exchange::okx::{OkxClient, OkxGatewayFactory};
use breakout_bot::exchange::paper::PaperGatewayFactory;
use breakout_bot::exchange::{ExchangeGateway, GatewayFactory};
use breakout_bot::hub::StrategyHub;
use breakout_bot::market_data;
use breakout_bot::notifier::{ConfirmOutcome, LogNotifier, Notifier};
use breakout_bot::router::{Router, RouterConfig};
use breakout_bot::runtime_config::RuntimeConfig;
use breakout_bot::settings::{AccountSettings, Credentials};
use breakout_bot::settings_store::{JsonSettingsStore, SettingsStore};
use breakout_bot::strategy::{DonchianBreakoutEngine, SignalEngine};
use breakout_bot::types::normalize_timeframe;

const CONFIG_PATH: &str = "runtime_config.json";
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Breakout Bot — Starting Up                        ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();
    config.strategy.validate().context("invalid strategy parameters")?;

    info!(
        symbols = ?config.symbols,
        ltf = %config.strategy.ltf,
        htf = %config.strategy.htf,
        paper = config.paper_trading,
        "Configured watchlist"
    );

    // ── 2. Gateways ──────────────────────────────────────────────────────
    let market = Arc::new(OkxClient::public(config.rest_base_url.clone())?);

    let paper = config.paper_trading.then(|| {
        Arc::new(PaperGatewayFactory::new(
            config.paper_equity,
            Some(market.clone() as Arc<dyn ExchangeGateway>),
        ))
    });
    let factory: Arc<dyn GatewayFactory> = match &paper {
        Some(p) => p.clone() as Arc<dyn GatewayFactory>,
        None => Arc::new(OkxGatewayFactory::new(config.rest_base_url.clone())),
    };

    // ── 3. Engine, router, hub ───────────────────────────────────────────
    let engine: Arc<dyn SignalEngine> =
        Arc::new(DonchianBreakoutEngine::new(config.strategy.clone())?);
    let store: Arc<dyn SettingsStore> = Arc::new(JsonSettingsStore::new(&config.settings_path));

    let router = Arc::new(Router::new(
        RouterConfig::from(&config),
        factory,
        Some(store.clone()),
        Some(engine.clone()),
    ));
    let hub = Arc::new(StrategyHub::new(
        engine,
        router.clone(),
        config.symbols.len(),
        Duration::from_secs(config.warmup_stall_secs),
    ));

    // ── 4. Accounts ──────────────────────────────────────────────────────
    let mut accounts = store.load_all().await.unwrap_or_else(|e| {
        error!(error = %e, "Failed to load account settings");
        Vec::new()
    });
    if accounts.is_empty() {
        let default = AccountSettings {
            account_id: "default".into(),
            name: "default".into(),
            trading: config.default_trading.clone(),
            trailing: config.default_trailing.clone(),
            credentials: Credentials::from_env(),
        };
        if let Err(e) = store.save(&default).await {
            warn!(error = %e, "Failed to persist default account");
        }
        accounts.push(default);
    }

    let auto = config.auto_approve.then_some(ConfirmOutcome::Approved);
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier::new(auto));
    for settings in accounts {
        let id = settings.account_id.clone();
        if let Err(e) = router.enable_account(settings, notifier.clone()) {
            error!(account = %id, error = %e, "Failed to enable account");
        }
    }
    info!(count = router.accounts().len(), "Accounts enabled");

    // ── 5. REST warmup ───────────────────────────────────────────────────
    hub.warmup(
        market.clone(),
        &config.symbols,
        &config.strategy,
        config.warmup_concurrency,
    )
    .await;

    // ── 6. Candle streams ────────────────────────────────────────────────
    let (tx, mut rx) = mpsc::channel(1024);
    let mut timeframes: Vec<String> = Vec::new();
    for tf in [config.strategy.ltf.as_str(), config.strategy.htf.as_str(), "1m"] {
        let tf = normalize_timeframe(tf);
        if !timeframes.contains(&tf) {
            timeframes.push(tf);
        }
    }

    for tf in timeframes {
        let tx = tx.clone();
        let url = config.ws_business_url.clone();
        let symbols = config.symbols.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) =
                    market_data::run_candle_stream(&url, &tf, &symbols, &tx).await
                {
                    error!(tf = %tf, error = %e, "Candle stream error, reconnecting in 5s");
                }
                if tx.is_closed() {
                    break;
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });
    }
    drop(tx);

    let candle_hub = hub.clone();
    let candle_paper = paper.clone();
    tokio::spawn(async move {
        while let Some(candle) = rx.recv().await {
            if let Some(p) = &candle_paper {
                p.set_price(&candle.inst_id, candle.close);
            }
            candle_hub.on_candle(&candle);
        }
        warn!("Candle channel closed");
    });

    info!("Market data streams launched");

    // ── 7. Trailing drain ────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    tokio::spawn(router.clone().run_trail_drain(
        Duration::from_millis(config.trail_drain_interval_ms),
        shutdown.clone(),
    ));

    // ── 8. API server ────────────────────────────────────────────────────
    let app = api::rest::router(router.clone());
    let bind_addr = config.bind_addr.clone();
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "Failed to bind API server");
                return;
            }
        };
        info!(addr = %bind_addr, "API server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    // ── 9. Shutdown ──────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received");
    shutdown.cancel();
    router.shutdown();
    Ok(())
}
