// ===============================
// src/config.rs
// ===============================
use std::env;

use dotenvy::dotenv;

/// Where market data comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedMode {
    Mock,
    Binance,
}

impl FeedMode {
    pub fn from_env(key: &str, default_mode: FeedMode) -> FeedMode {
        match env::var(key).unwrap_or_default().to_ascii_lowercase().as_str() {
            "mock" => FeedMode::Mock,
            "binance" => FeedMode::Binance,
            _ => default_mode,
        }
    }

    pub fn default_ws_url(&self) -> &'static str {
        match self {
            FeedMode::Mock => "wss://stream.binance.com:9443", // unused in mock mode
            FeedMode::Binance => "wss://stream.binance.com:9443",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub symbols: Vec<String>,

    // persistence
    pub db_file: String,
    pub ledger_file: String,

    // metrics
    pub metrics_port: u16,

    // market data
    pub feed_mode: FeedMode,
    pub binance_ws_url: String,

    // account
    pub base_capital_usd: f64,
    pub realized_lookback_hours: u64,

    // loops
    pub cycle_interval_secs: u64,
    pub price_sync_interval_ms: u64,

    // decision provider
    pub decider_url: String,
    pub decider_timeout_secs: u64,
    pub decider_max_attempts: u32,
}

/// Pair-lifecycle risk parameters (exit triggers, sizing caps).
#[derive(Clone, Debug)]
pub struct RiskParams {
    /// Convergence fraction of the entry z-score at which a pair exits.
    pub exit_convergence_pct: f64,
    /// Holding-time cap, expressed in multiples of the entry half-life.
    pub max_half_lives: f64,
    /// Divergence stop: |z| >= |entry z| * this multiple.
    pub stop_z_mult: f64,
    /// Seconds per half-life period (screener bar interval).
    pub half_life_period_secs: u64,
    /// Fraction of each leg closed on a REDUCE signal.
    pub reduce_fraction: f64,
    /// Leverage cap applied to decision-provider sizing.
    pub max_leverage: u32,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

pub fn load() -> (Config, RiskParams) {
    // Read .env first so SYMBOLS, DB_FILE etc. are visible.
    let _ = dotenv();

    // Multi-symbol universe: SYMBOLS=BTCUSDT,ETHUSDT,ADAUSDT,NEARUSDT
    let symbols: Vec<String> = env::var("SYMBOLS")
        .ok()
        .map(|s| {
            s.split(',')
                .map(|x| x.trim())
                .filter(|x| !x.is_empty())
                .map(|x| x.to_ascii_uppercase())
                .collect()
        })
        .filter(|v: &Vec<String>| !v.is_empty())
        .unwrap_or_else(|| vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);

    let db_file = env::var("DB_FILE").unwrap_or_else(|_| "data/pairbot.db".to_string());
    let ledger_file =
        env::var("LEDGER_FILE").unwrap_or_else(|_| "data/ledger.jsonl".to_string());

    let metrics_port = env_parse("METRICS_PORT", 9898u16);

    let feed_mode = FeedMode::from_env("FEED_MODE", FeedMode::Mock);
    let binance_ws_url = env::var("BINANCE_WS_URL")
        .unwrap_or_else(|_| feed_mode.default_ws_url().to_string());

    let base_capital_usd = env_parse("BASE_CAPITAL_USD", 10_000.0f64);
    let realized_lookback_hours = env_parse("REALIZED_LOOKBACK_HOURS", 720u64);

    let cycle_interval_secs = env_parse("CYCLE_INTERVAL_SECS", 60u64);
    let price_sync_interval_ms = env_parse("PRICE_SYNC_INTERVAL_MS", 1_000u64);

    let decider_url = env::var("DECIDER_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:8787/decide".to_string());
    let decider_timeout_secs = env_parse("DECIDER_TIMEOUT_SECS", 30u64);
    let decider_max_attempts = env_parse("DECIDER_MAX_ATTEMPTS", 3u32);

    let cfg = Config {
        symbols,
        db_file,
        ledger_file,
        metrics_port,
        feed_mode,
        binance_ws_url,
        base_capital_usd,
        realized_lookback_hours,
        cycle_interval_secs,
        price_sync_interval_ms,
        decider_url,
        decider_timeout_secs,
        decider_max_attempts,
    };

    let risk = RiskParams {
        exit_convergence_pct: env_parse("EXIT_CONVERGENCE_PCT", 0.5f64),
        max_half_lives: env_parse("MAX_HALF_LIVES", 2.0f64),
        stop_z_mult: env_parse("STOP_Z_MULT", 2.0f64),
        half_life_period_secs: env_parse("HALF_LIFE_PERIOD_SECS", 3_600u64),
        reduce_fraction: env_parse("REDUCE_FRACTION", 0.5f64),
        max_leverage: env_parse("MAX_LEVERAGE", 5u32),
    };

    (cfg, risk)
}
