// ===============================
// src/main.rs
// ===============================
//
// pairbot_rust: paper-trading automation core for statistical-arbitrage
// pairs. Streams market data (mock/Binance), fills orders against a
// simulated book, asks an external decision provider what to do each
// cycle, tracks pair lifecycles, and persists every state transition to
// a JSONL ledger plus an embedded SQLite store. Prometheus metrics on
// /metrics.
//

mod account;
mod config;
mod decision;
mod domain;
mod engine;
mod feed;
mod gateway;
mod ledger;
mod metrics;
mod pairs;
mod persist;
mod scheduler;
mod store;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::info;

use crate::decision::HttpDecisionProvider;
use crate::engine::MatchingEngine;
use crate::feed::PriceFeed;
use crate::gateway::PaperGateway;
use crate::ledger::Ledger;
use crate::pairs::PairLifecycleTracker;
use crate::persist::Persistence;
use crate::scheduler::{Scheduler, SchedulerCfg, SharedCandidates};
use crate::store::Store;

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt().with_env_filter("info").init();

    // ---- Load config & risk params ----
    let (cfg, risk) = config::load();

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(cfg.metrics_port));

    let feed_mode_str = match cfg.feed_mode {
        config::FeedMode::Mock => "mock",
        config::FeedMode::Binance => "binance",
    };
    info!(
        feed_mode = %feed_mode_str,
        symbols = ?cfg.symbols,
        db_file = %cfg.db_file,
        ledger_file = %cfg.ledger_file,
        decider = %cfg.decider_url,
        cycle_interval_secs = cfg.cycle_interval_secs,
        "startup config"
    );

    // ---- Persistence (ledger + store) ----
    // Refusing to trade without a durable record is deliberate.
    let ledger = Ledger::open(&cfg.ledger_file)
        .await
        .unwrap_or_else(|e| panic!("cannot open ledger {}: {e}", cfg.ledger_file));
    let store = Store::open(&cfg.db_file)
        .await
        .unwrap_or_else(|e| panic!("cannot open store {}: {e}", cfg.db_file));
    let persistence = Arc::new(Persistence::new(ledger, store));

    // ---- Recovery: reload pairs that were open at shutdown ----
    let mut tracker = PairLifecycleTracker::new();
    match persistence.store().load_open_pairs().await {
        Ok(open) => {
            if !open.is_empty() {
                info!(count = open.len(), "restored open pairs from store");
            }
            tracker.restore(open);
        }
        Err(e) => panic!("cannot recover open pairs: {e}"),
    }
    let pairs = Arc::new(Mutex::new(tracker));

    // ---- Matching engine (paper venue) ----
    let engine = Arc::new(Mutex::new(MatchingEngine::new(&cfg.symbols)));

    // ---- Market data ----
    let feed = PriceFeed::new();
    feed.subscribe(&cfg.symbols);
    match cfg.feed_mode {
        config::FeedMode::Mock => {
            tokio::spawn(feed.clone().run_mock());
        }
        config::FeedMode::Binance => {
            tokio::spawn(feed.clone().run_binance(cfg.binance_ws_url.clone()));
        }
    }

    // ---- Decision provider & gateway ----
    let provider = HttpDecisionProvider::new(
        &cfg.decider_url,
        Duration::from_secs(cfg.decider_timeout_secs),
        cfg.decider_max_attempts,
    );
    let gateway = PaperGateway::new(engine.clone());

    // ---- Loops ----
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let candidates: SharedCandidates = Arc::new(std::sync::RwLock::new(Vec::new()));

    tokio::spawn(scheduler::run_price_sync(
        engine.clone(),
        feed.clone(),
        persistence.clone(),
        cfg.price_sync_interval_ms,
        shutdown_rx.clone(),
    ));

    let sched = Scheduler::new(
        engine,
        pairs,
        feed.clone(),
        persistence.clone(),
        provider,
        gateway,
        SchedulerCfg {
            base_capital_usd: cfg.base_capital_usd,
            realized_lookback_ms: cfg.realized_lookback_hours as i64 * 3_600_000,
        },
        risk,
        candidates,
    );
    let cycle_task = tokio::spawn(sched.run(cfg.cycle_interval_secs, shutdown_rx));

    // ---- Shutdown ----
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(?e, "ctrl-c handler failed");
    }
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    feed.stop();
    // let the in-flight cycle finish before closing the ledger
    let _ = cycle_task.await;
    persistence.close().await;
    info!("bye");
}
