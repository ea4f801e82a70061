// ===============================
// src/domain.rs
// ===============================
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side { Buy, Sell }
impl Side {
    pub fn sign(&self) -> f64 { match self { Side::Buy => 1.0, Side::Sell => -1.0 } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType { Limit, Market }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus { New, PartiallyFilled, Filled, Canceled, Rejected }
impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide { Long, Short }

/// Order intent as submitted to the matching engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub quantity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_in_force: Option<String>,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<u32>,
}

impl OrderRequest {
    pub fn market(symbol: &str, side: Side, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            time_in_force: None,
            reduce_only: false,
            client_order_id: None,
            leverage: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub requested_qty: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    pub status: OrderStatus,
    pub executed_qty: f64,
    pub avg_fill_price: f64,
    pub leverage: u32,
    pub reduce_only: bool,
    pub created_at: i64,
}

/// Result of applying an order against the book: the (possibly resting)
/// order plus the fill delta, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderFill {
    pub order: Order,
    pub fill_qty: f64,
    pub fill_price: f64,
    pub realized_pnl_usd: f64,
}

/// Netted per-symbol position. Quantity is signed: positive long, negative short.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub symbol: String,
    pub qty: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub realized_pnl_usd: f64,
}

impl Position {
    pub fn side(&self) -> PositionSide {
        if self.qty >= 0.0 { PositionSide::Long } else { PositionSide::Short }
    }
    pub fn notional(&self, mid: f64) -> f64 {
        self.qty.abs() * mid
    }
    pub fn unrealized_pnl(&self, mid: f64) -> f64 {
        (mid - self.entry_price) * self.qty
    }
}

/// Snapshot view of a position, marked against the latest known mid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionView {
    pub symbol: String,
    pub side: PositionSide,
    pub qty: f64,
    pub entry_price: f64,
    pub leverage: u32,
    pub mark_price: f64,
    pub notional_usd: f64,
    pub unrealized_pnl_usd: f64,
}

/// Canonical order-independent key for a (long, short) symbol pair.
pub fn pair_key(a: &str, b: &str) -> String {
    if a <= b { format!("{}|{}", a, b) } else { format!("{}|{}", b, a) }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairPosition {
    pub pair_key: String,
    pub long_symbol: String,
    pub short_symbol: String,
    pub entry_time: i64,
    pub entry_spread_z: f64,
    pub entry_half_life: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<i64>,
    pub realized_pnl_usd: f64,
}

impl PairPosition {
    pub fn is_open(&self) -> bool { self.closed_at.is_none() }
}

/// Candidate pair produced by the external screener, consumed as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairCandidate {
    pub long_symbol: String,
    pub short_symbol: String,
    pub spread_z: f64,
    pub half_life: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hedge_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Open-pair view with convergence metrics, used in pairs snapshots,
/// the decision context, and pair_state_history rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairView {
    pub pair_key: String,
    pub long_symbol: String,
    pub short_symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spread_z: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub half_life: Option<f64>,
    pub pnl_usd: f64,
    pub entry_spread_z: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_spread_z: Option<f64>,
    pub entry_half_life: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_half_life: Option<f64>,
    pub elapsed_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub convergence_pct: Option<f64>,
}

/// Derived account view. Recomputed on every read, only snapshots persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSnapshot {
    pub balance_usd: f64,
    pub equity_usd: f64,
    pub margin_used_usd: f64,
    pub available_margin_usd: f64,
    pub open_positions_count: usize,
}

// ---- Price model ----
// Book and last-trade arrive on independent streams; a full snapshot
// exists only once both field groups have been observed for the symbol.

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopOfBook {
    pub best_bid: f64,
    pub best_ask: f64,
    pub ts: i64,
}

impl TopOfBook {
    pub fn mid(&self) -> f64 { (self.best_bid + self.best_ask) / 2.0 }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastTrade {
    pub price: f64,
    pub ts: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceSnapshot {
    pub symbol: String,
    pub best_bid: f64,
    pub best_ask: f64,
    pub mid: f64,
    pub last: f64,
    pub observed_at: i64,
}

// ---- Ledger event taxonomy ----
// One line per record in the append-only ledger: { ts, type, data }.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub ts: i64,
    #[serde(flatten)]
    pub event: LedgerEvent,
}

impl LedgerRecord {
    pub fn new(event: LedgerEvent) -> Self {
        Self { ts: now_ms(), event }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LedgerEvent {
    Order(OrderEvent),
    OrderPlan(OrderPlan),
    OrderCancelled(OrderEvent),
    OrderError(ErrorEvent),
    PairExit(PairEvent),
    PairReduce(PairEvent),
    Portfolio(PortfolioEvent),
    PortfolioPre(PortfolioEvent),
    PortfolioPost(PortfolioEvent),
    Pairs(PairsEvent),
    PairsSnapshot(PairsEvent),
    InvalidPair(ErrorEvent),
    KlineError(ErrorEvent),
    PairsError(ErrorEvent),
    Error(ErrorEvent),
    /// Catch-all for tags this build does not know. Produced only by the
    /// line parser, never emitted by this process.
    Unknown(UnknownEvent),
}

impl LedgerEvent {
    pub fn tag(&self) -> &str {
        match self {
            LedgerEvent::Order(_) => "order",
            LedgerEvent::OrderPlan(_) => "order_plan",
            LedgerEvent::OrderCancelled(_) => "order_cancelled",
            LedgerEvent::OrderError(_) => "order_error",
            LedgerEvent::PairExit(_) => "pair_exit",
            LedgerEvent::PairReduce(_) => "pair_reduce",
            LedgerEvent::Portfolio(_) => "portfolio",
            LedgerEvent::PortfolioPre(_) => "portfolio_pre",
            LedgerEvent::PortfolioPost(_) => "portfolio_post",
            LedgerEvent::Pairs(_) => "pairs",
            LedgerEvent::PairsSnapshot(_) => "pairs_snapshot",
            LedgerEvent::InvalidPair(_) => "invalid_pair",
            LedgerEvent::KlineError(_) => "kline_error",
            LedgerEvent::PairsError(_) => "pairs_error",
            LedgerEvent::Error(_) => "error",
            LedgerEvent::Unknown(u) => &u.tag,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    pub order: Order,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pair_long: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pair_short: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_pnl_usd: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPlan {
    pub signal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pair_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_size_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_size_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<u32>,
    #[serde(default)]
    pub rationale: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEvent {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_ts: Option<i64>,
}

impl ErrorEvent {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), context: None, cycle_ts: None }
    }
    pub fn for_cycle(message: impl Into<String>, cycle_ts: i64) -> Self {
        Self { message: message.into(), context: None, cycle_ts: Some(cycle_ts) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairEvent {
    pub pair_key: String,
    pub long_symbol: String,
    pub short_symbol: String,
    pub realized_delta_usd: f64,
    pub realized_pnl_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioEvent {
    pub account: AccountSnapshot,
    pub positions: Vec<PositionView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairsEvent {
    pub pairs: Vec<PairView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnknownEvent {
    pub tag: String,
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_key_is_order_independent() {
        assert_eq!(pair_key("ADAUSDT", "NEARUSDT"), pair_key("NEARUSDT", "ADAUSDT"));
        assert_eq!(pair_key("ADAUSDT", "NEARUSDT"), "ADAUSDT|NEARUSDT");
    }

    #[test]
    fn ledger_record_wire_shape() {
        let rec = LedgerRecord {
            ts: 1_700_000_000_000,
            event: LedgerEvent::Error(ErrorEvent::for_cycle("boom", 42)),
        };
        let v: Value = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["ts"], 1_700_000_000_000_i64);
        assert_eq!(v["type"], "error");
        assert_eq!(v["data"]["message"], "boom");
        assert_eq!(v["data"]["cycleTs"], 42);
    }

    #[test]
    fn order_status_terminal() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(!OrderStatus::New.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }
}
