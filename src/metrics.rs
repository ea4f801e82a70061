// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Market data --------
pub static TICKS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_total", "price feed messages applied").unwrap());

pub static WS_RECONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("feed_ws_reconnects_total", "price feed socket reconnects").unwrap()
});

// -------- Matching / positions --------
pub static ORDERS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_total", "orders by terminal outcome"),
        &["status"],
    )
    .unwrap()
});

pub static FILLS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("fills_total", "paper fills applied").unwrap());

pub static PNL_REALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_realized_usd", "realized PnL (USD, process lifetime)").unwrap());

pub static PNL_UNREALIZED: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("pnl_unrealized_usd", "mark-to-market PnL (USD)").unwrap());

pub static EQUITY: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("account_equity_usd", "derived account equity (USD)").unwrap());

// -------- Pairs --------
pub static PAIRS_OPEN: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("pairs_open", "open pair positions").unwrap());

// -------- Scheduler / persistence --------
pub static CYCLES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("agent_cycles_total", "agent decision cycles by result"),
        &["result"],
    )
    .unwrap()
});

pub static DECIDER_RETRIES: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("decider_retries_total", "decision provider retry attempts").unwrap()
});

pub static LEDGER_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("ledger_write_errors_total", "append-only ledger write failures").unwrap()
});

pub static STORE_DEGRADED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "store_degraded",
        "1 if a relational write has failed and recording degraded to ledger-only",
    )
    .unwrap()
});

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(TICKS.clone())),
        REGISTRY.register(Box::new(WS_RECONNECTS.clone())),
        REGISTRY.register(Box::new(ORDERS.clone())),
        REGISTRY.register(Box::new(FILLS.clone())),
        REGISTRY.register(Box::new(PNL_REALIZED.clone())),
        REGISTRY.register(Box::new(PNL_UNREALIZED.clone())),
        REGISTRY.register(Box::new(EQUITY.clone())),
        REGISTRY.register(Box::new(PAIRS_OPEN.clone())),
        REGISTRY.register(Box::new(CYCLES.clone())),
        REGISTRY.register(Box::new(DECIDER_RETRIES.clone())),
        REGISTRY.register(Box::new(LEDGER_ERRORS.clone())),
        REGISTRY.register(Box::new(STORE_DEGRADED.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub async fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr)
            .unwrap_or_else(|e| panic!("metrics bind {} failed: {}", addr, e));
        eprintln!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => eprintln!("metrics accept error: {}", e),
            }
        }
    });
}
