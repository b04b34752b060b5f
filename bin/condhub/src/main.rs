use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bus::{EventBus, InMemoryBus};
use common::{Config, StaticTokenAuthorizer};
use evaluator::{BinanceMarketData, Evaluator, EvaluatorConfig};
use notifier::{HandlerFileConfig, Notifier};
use registry::{ConditionRegistry, SubscriptionStore, TriggerLog};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ────────────────────────────────────────────────────────────────
    let cfg = Config::from_env();
    info!(
        tick = ?cfg.eval_tick,
        max_concurrent_pairs = cfg.eval_max_concurrent_pairs,
        market = %cfg.market_data_url,
        "CondHub starting"
    );

    // ── Database ──────────────────────────────────────────────────────────────
    let db = common::db::connect(&cfg.database_url)
        .await
        .context("failed to open database")?;
    info!("Database ready");

    let registry = ConditionRegistry::new(db.clone());
    let subs = SubscriptionStore::new(db.clone());
    let trigger_log = TriggerLog::new(db);

    // ── Bus ───────────────────────────────────────────────────────────────────
    let bus = Arc::new(InMemoryBus::new(cfg.bus_capacity));

    // ── Evaluator ─────────────────────────────────────────────────────────────
    let market = BinanceMarketData::new(cfg.market_data_url.clone())
        .context("failed to build market data client")?;
    let (evaluator, evaluator_handle) = Evaluator::new(
        registry.clone(),
        trigger_log.clone(),
        Arc::new(market),
        bus.clone(),
        EvaluatorConfig {
            tick: cfg.eval_tick,
            max_concurrent_pairs: cfg.eval_max_concurrent_pairs,
            candle_limit: cfg.eval_candle_limit,
            fetch_timeout: cfg.fetch_timeout,
        },
    );

    // ── Notifier ──────────────────────────────────────────────────────────────
    let handlers = HandlerFileConfig::load(&cfg.handler_config_path)
        .and_then(|file| file.into_registry(cfg.dispatch_timeout))
        .context("failed to load action handlers")?;
    if handlers.is_empty() {
        warn!(path = %cfg.handler_config_path, "No action handlers configured — every dispatch will fail");
    }
    let notifier = Notifier::new(subs.clone(), handlers, bus.clone(), cfg.dispatch_timeout);

    // ── API ───────────────────────────────────────────────────────────────────
    let api_state = api::AppState {
        registry,
        subs,
        trigger_log,
        authorizer: Arc::new(StaticTokenAuthorizer::new(cfg.api_tokens.clone())),
        evaluator: evaluator_handle,
    };

    // ── Spawn all tasks ───────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<(&str, JoinHandle<()>)> = vec![
        ("notifier", tokio::spawn(notifier.run(shutdown_rx.clone()))),
        ("evaluator", tokio::spawn(evaluator.run(shutdown_rx.clone()))),
    ];
    let port = cfg.api_port;
    let api_shutdown = shutdown_rx.clone();
    tasks.push((
        "api",
        tokio::spawn(async move {
            if let Err(e) = api::serve(api_state, port, api_shutdown).await {
                error!(error = %e, "API server stopped");
            }
        }),
    ));

    info!("All subsystems started. Waiting for shutdown signal.");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!(grace = ?cfg.shutdown_grace, "Shutdown signal received. Draining.");

    // ── Shutdown ──────────────────────────────────────────────────────────────
    let _ = shutdown_tx.send(true);
    let deadline = tokio::time::Instant::now() + cfg.shutdown_grace;
    for (name, mut task) in tasks {
        match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(Ok(())) => info!(task = name, "Stopped"),
            Ok(Err(e)) => error!(task = name, error = %e, "Task ended abnormally"),
            Err(_) => {
                warn!(task = name, "Did not stop within grace period — aborting");
                task.abort();
            }
        }
    }
    bus.close().await;
    info!("Shutdown complete");
    Ok(())
}
