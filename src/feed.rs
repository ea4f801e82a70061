// ===============================
// src/feed.rs
// ===============================
//
// PriceFeed: live best-bid/ask/mid/last snapshots per symbol.
// - run_binance : combined-stream WS (<sym>@bookTicker + <sym>@trade),
//                 reconnects with backoff, always resubscribes the full
//                 current symbol set (the set is the source of truth,
//                 the socket is disposable).
// - run_mock    : random-walk generator for offline runs.
//
// Reads never block: get() snapshots whatever was last received. A symbol
// is "ready" only once both the book and a trade print have been seen.
//

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use ahash::AHashMap as HashMap;
use futures_util::StreamExt; // for .next()
use rand::Rng;
use tokio::sync::{watch, Notify};
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};
use url::Url;

use crate::domain::{now_ms, LastTrade, PriceSnapshot, TopOfBook};
use crate::metrics::{TICKS, WS_RECONNECTS};

#[derive(Debug, Clone, Copy, Default)]
struct Quote {
    book: Option<TopOfBook>,
    last: Option<LastTrade>,
}

struct FeedShared {
    quotes: RwLock<HashMap<String, Quote>>,
    symbols: RwLock<BTreeSet<String>>,
    resub: Notify,
    shutdown_tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct PriceFeed {
    shared: Arc<FeedShared>,
}

impl PriceFeed {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(FeedShared {
                quotes: RwLock::new(HashMap::new()),
                symbols: RwLock::new(BTreeSet::new()),
                resub: Notify::new(),
                shutdown_tx,
            }),
        }
    }

    /// Idempotently add symbols to the subscription set. The socket task
    /// reconnects with the full set whenever the set grows.
    pub fn subscribe(&self, symbols: &[String]) {
        let mut changed = false;
        {
            let mut set = self.shared.symbols.write().unwrap();
            for s in symbols {
                changed |= set.insert(s.to_ascii_uppercase());
            }
        }
        if changed {
            self.shared.resub.notify_waiters();
        }
    }

    pub fn symbols(&self) -> Vec<String> {
        self.shared.symbols.read().unwrap().iter().cloned().collect()
    }

    /// Latest full snapshot, or None until both book and last have been seen.
    pub fn get(&self, symbol: &str) -> Option<PriceSnapshot> {
        let quotes = self.shared.quotes.read().unwrap();
        let q = quotes.get(symbol)?;
        let (book, last) = (q.book?, q.last?);
        Some(PriceSnapshot {
            symbol: symbol.to_string(),
            best_bid: book.best_bid,
            best_ask: book.best_ask,
            mid: book.mid(),
            last: last.price,
            observed_at: book.ts.max(last.ts),
        })
    }

    pub fn mid(&self, symbol: &str) -> Option<f64> {
        let quotes = self.shared.quotes.read().unwrap();
        quotes.get(symbol).and_then(|q| q.book).map(|b| b.mid())
    }

    /// Snapshots for every ready symbol (markets view for persistence).
    pub fn snapshot_all(&self) -> Vec<PriceSnapshot> {
        self.symbols().iter().filter_map(|s| self.get(s)).collect()
    }

    /// Stop the socket / generator task. Reads keep working on stale data.
    pub fn stop(&self) {
        let _ = self.shared.shutdown_tx.send(true);
    }

    fn apply_book(&self, symbol: &str, best_bid: f64, best_ask: f64) {
        let mut quotes = self.shared.quotes.write().unwrap();
        let q = quotes.entry(symbol.to_string()).or_default();
        q.book = Some(TopOfBook { best_bid, best_ask, ts: now_ms() });
    }

    fn apply_trade(&self, symbol: &str, price: f64) {
        let mut quotes = self.shared.quotes.write().unwrap();
        let q = quotes.entry(symbol.to_string()).or_default();
        q.last = Some(LastTrade { price, ts: now_ms() });
    }

    /// Route one combined-stream frame. Symbol comes from the stream name,
    /// not the payload.
    fn apply_message(&self, txt: &str) {
        let v: serde_json::Value = match serde_json::from_str(txt) {
            Ok(v) => v,
            Err(_) => return,
        };
        let stream = match v.get("stream").and_then(|s| s.as_str()) {
            Some(s) => s,
            None => return,
        };
        let data = match v.get("data") {
            Some(d) => d,
            None => return,
        };
        let (sym, kind) = match stream.split_once('@') {
            Some((s, k)) => (s.to_ascii_uppercase(), k),
            None => return,
        };
        match kind {
            "bookTicker" => {
                let b = data.get("b").and_then(|x| x.as_str()).and_then(|s| s.parse::<f64>().ok());
                let a = data.get("a").and_then(|x| x.as_str()).and_then(|s| s.parse::<f64>().ok());
                if let (Some(b), Some(a)) = (b, a) {
                    if b > 0.0 && a > 0.0 {
                        self.apply_book(&sym, b, a);
                        TICKS.inc();
                    }
                }
            }
            "trade" => {
                let p = data.get("p").and_then(|x| x.as_str()).and_then(|s| s.parse::<f64>().ok());
                if let Some(p) = p {
                    if p > 0.0 {
                        self.apply_trade(&sym, p);
                        TICKS.inc();
                    }
                }
            }
            _ => {}
        }
    }

    fn combined_url(&self, ws_base: &str) -> Option<String> {
        let set = self.shared.symbols.read().unwrap();
        if set.is_empty() {
            return None;
        }
        let streams: Vec<String> = set
            .iter()
            .flat_map(|s| {
                let low = s.to_ascii_lowercase();
                [format!("{low}@bookTicker"), format!("{low}@trade")]
            })
            .collect();
        Some(format!(
            "{}/stream?streams={}",
            ws_base.trim_end_matches('/'),
            streams.join("/")
        ))
    }

    /// Binance combined-stream adapter (read-only).
    pub async fn run_binance(self, ws_base: String) {
        let mut shutdown = self.shared.shutdown_tx.subscribe();
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return;
            }

            let ws_url = match self.combined_url(&ws_base) {
                Some(u) => u,
                None => {
                    // Nothing subscribed yet; wait for subscribe() or stop().
                    tokio::select! {
                        _ = self.shared.resub.notified() => {}
                        _ = shutdown.changed() => {}
                    }
                    continue;
                }
            };

            if let Err(e) = Url::parse(&ws_url) {
                error!(?e, %ws_url, "bad ws url");
                return;
            }

            info!(%ws_url, "connecting combined market stream");
            match connect_async(ws_url.as_str()).await {
                Ok((mut ws, _resp)) => {
                    info!(symbols = ?self.symbols(), "market stream connected");
                    attempt = 0; // reset backoff

                    loop {
                        tokio::select! {
                            frame = ws.next() => {
                                match frame {
                                    Some(Ok(m)) if m.is_text() => {
                                        match m.into_text() {
                                            Ok(txt) => self.apply_message(&txt),
                                            Err(e) => warn!(?e, "failed to read text frame"),
                                        }
                                    }
                                    Some(Ok(_)) => {
                                        // ignore non-text frames
                                    }
                                    Some(Err(e)) => {
                                        error!(?e, "ws read error");
                                        break;
                                    }
                                    None => break,
                                }
                            }
                            _ = self.shared.resub.notified() => {
                                info!("subscription set changed, reconnecting with full set");
                                break;
                            }
                            _ = shutdown.changed() => {
                                if *shutdown.borrow() {
                                    let _ = ws.close(None).await;
                                    info!("market stream stopped");
                                    return;
                                }
                            }
                        }
                    }
                    info!("market stream disconnected, will reconnect…");
                }
                Err(e) => {
                    error!(?e, "connect failed");
                }
            }

            // Exponential backoff + jitter
            WS_RECONNECTS.inc();
            attempt = attempt.saturating_add(1);
            let shift = attempt.min(6);                  // 0..=6
            let factor = 1u64 << shift;                  // 1,2,4,...,64
            let base_ms = 500u64.saturating_mul(factor); // 0.5s..32s
            let jitter = rand::thread_rng().gen_range(0..=250);
            sleep(Duration::from_millis(base_ms + jitter)).await;
        }
    }

    /// Mock market data (random walk) for offline runs and dev.
    pub async fn run_mock(self) {
        let mut shutdown = self.shared.shutdown_tx.subscribe();
        let mut px: HashMap<String, f64> = HashMap::new();

        loop {
            for (i, sym) in self.symbols().into_iter().enumerate() {
                // don't hold ThreadRng across an .await
                let drift = rand::thread_rng().gen_range(-0.001..=0.001);
                let p = px.entry(sym.clone()).or_insert(100.0 * (i as f64 + 1.0));
                *p = (*p * (1.0 + drift)).max(0.01);
                let (bid, ask) = (*p * 0.9999, *p * 1.0001);
                self.apply_book(&sym, bid, ask);
                self.apply_trade(&sym, *p);
                TICKS.inc();
            }
            tokio::select! {
                _ = sleep(Duration::from_millis(100)) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { return; }
                }
            }
        }
    }
}

impl Default for PriceFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_until_both_streams_seen() {
        let feed = PriceFeed::new();
        feed.subscribe(&["BTCUSDT".to_string()]);
        assert!(feed.get("BTCUSDT").is_none());

        feed.apply_book("BTCUSDT", 49_999.0, 50_001.0);
        // book alone is not enough
        assert!(feed.get("BTCUSDT").is_none());
        assert_eq!(feed.mid("BTCUSDT"), Some(50_000.0));

        feed.apply_trade("BTCUSDT", 50_000.5);
        let snap = feed.get("BTCUSDT").unwrap();
        assert_eq!(snap.mid, 50_000.0);
        assert_eq!(snap.last, 50_000.5);
    }

    #[test]
    fn combined_stream_message_routing() {
        let feed = PriceFeed::new();
        feed.subscribe(&["ETHUSDT".to_string()]);
        feed.apply_message(
            r#"{"stream":"ethusdt@bookTicker","data":{"b":"3000.0","B":"5","a":"3002.0","A":"4"}}"#,
        );
        feed.apply_message(r#"{"stream":"ethusdt@trade","data":{"p":"3001.5","q":"0.2"}}"#);
        let snap = feed.get("ETHUSDT").unwrap();
        assert_eq!(snap.best_bid, 3000.0);
        assert_eq!(snap.best_ask, 3002.0);
        assert_eq!(snap.last, 3001.5);
    }

    #[test]
    fn subscribe_is_idempotent() {
        let feed = PriceFeed::new();
        feed.subscribe(&["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        feed.subscribe(&["btcusdt".to_string()]);
        assert_eq!(feed.symbols(), vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
    }
}
