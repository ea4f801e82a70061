// ===============================
// src/engine.rs (paper matching & positions)
// ===============================
//
// Matching policy (paper-trading semantics):
// - MARKET fills immediately in full at the current mid, or NoLiquidity
//   if no price is known yet for the symbol.
// - LIMIT fills in full the moment its price crosses the reference side
//   (buy px >= ask ref, sell px <= bid ref); otherwise it rests as NEW
//   and is re-checked against every set_mid. Full-fill-or-rest, no
//   partial fills on resting orders.
//
// Positions are netted per symbol: same-direction fills recompute the
// quantity-weighted average entry, opposite-direction fills realize PnL
// first and flip with the remainder at the fill price.
//

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use rand::Rng;
use thiserror::Error;

use crate::domain::{
    now_ms, Order, OrderFill, OrderRequest, OrderStatus, OrderType, Position, PositionView, Side,
};
use crate::metrics::{FILLS, ORDERS, PNL_REALIZED};

const QTY_EPS: f64 = 1e-9;
pub const MAX_ORDER_LEVERAGE: u32 = 125;

/// In-memory terminal-order history kept beyond the open set; the store
/// holds the durable audit trail.
pub const ORDER_HISTORY_CAP: usize = 256;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown symbol: {0}")]
    InvalidSymbol(String),
    #[error("no price known yet for {0}")]
    NoLiquidity(String),
    #[error("order not found or already terminal")]
    OrderNotFound,
    #[error("invalid order request: {0}")]
    InvalidRequest(String),
    #[error("live order routing is not implemented")]
    LiveUnsupported,
}

#[derive(Debug, Clone, Default)]
pub struct CancelRequest {
    pub order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub symbol: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AmendRequest {
    pub order_id: String,
    pub symbol: Option<String>,
    pub price: Option<f64>,
    pub quantity: Option<f64>,
}

/// Latest mark for a symbol. Bid/ask references collapse to mid when the
/// spread is unknown.
#[derive(Debug, Clone, Copy)]
struct Mark {
    mid: f64,
    spread: f64,
}

impl Mark {
    fn bid_ref(&self) -> f64 { self.mid - self.spread / 2.0 }
    fn ask_ref(&self) -> f64 { self.mid + self.spread / 2.0 }
}

fn crosses(side: Side, limit_px: f64, mark: &Mark) -> bool {
    match side {
        Side::Buy => limit_px >= mark.ask_ref(),
        Side::Sell => limit_px <= mark.bid_ref(),
    }
}

pub struct MatchingEngine {
    symbols: HashSet<String>,
    marks: HashMap<String, Mark>,
    orders: HashMap<String, Order>,
    order_log: Vec<String>,
    by_client_id: HashMap<String, String>,
    positions: HashMap<String, Position>,
    realized_total_usd: f64,
}

impl MatchingEngine {
    pub fn new(symbols: &[String]) -> Self {
        Self {
            symbols: symbols.iter().map(|s| s.to_ascii_uppercase()).collect(),
            marks: HashMap::new(),
            orders: HashMap::new(),
            order_log: Vec::new(),
            by_client_id: HashMap::new(),
            positions: HashMap::new(),
            realized_total_usd: 0.0,
        }
    }

    pub fn symbols(&self) -> impl Iterator<Item = &String> {
        self.symbols.iter()
    }

    pub fn knows_symbol(&self, symbol: &str) -> bool {
        self.symbols.contains(symbol)
    }

    pub fn mark(&self, symbol: &str) -> Option<f64> {
        self.marks.get(symbol).map(|m| m.mid)
    }

    /// Push a fresh mid (and optionally the book spread) and re-evaluate
    /// resting limit orders for the symbol. Returns fills triggered by
    /// the price move.
    pub fn set_mid(&mut self, symbol: &str, mid: f64, spread: Option<f64>) -> Vec<OrderFill> {
        if !self.symbols.contains(symbol) || mid <= 0.0 {
            return Vec::new();
        }
        let mark = Mark { mid, spread: spread.unwrap_or(0.0).max(0.0) };
        self.marks.insert(symbol.to_string(), mark);

        let resting: Vec<String> = self
            .orders
            .values()
            .filter(|o| {
                o.symbol == symbol
                    && !o.status.is_terminal()
                    && o.order_type == OrderType::Limit
                    && o.price.map(|px| crosses(o.side, px, &mark)).unwrap_or(false)
            })
            .map(|o| o.id.clone())
            .collect();

        let mut fills = Vec::with_capacity(resting.len());
        for id in resting {
            if let Some(fill) = self.fill_order(&id, mark.mid) {
                fills.push(fill);
            }
        }
        fills
    }

    pub fn place_order(&mut self, req: OrderRequest) -> Result<OrderFill, EngineError> {
        let symbol = req.symbol.to_ascii_uppercase();
        if !self.symbols.contains(&symbol) {
            return Err(EngineError::InvalidSymbol(symbol));
        }
        if !(req.quantity > 0.0) {
            return Err(EngineError::InvalidRequest("quantity must be > 0".into()));
        }
        if req.order_type == OrderType::Limit && !req.price.map(|p| p > 0.0).unwrap_or(false) {
            return Err(EngineError::InvalidRequest("limit order requires a price".into()));
        }
        let leverage = req.leverage.unwrap_or(1).clamp(1, MAX_ORDER_LEVERAGE);

        let id = next_order_id();
        let order = Order {
            id: id.clone(),
            client_order_id: req.client_order_id.clone(),
            symbol: symbol.clone(),
            side: req.side,
            order_type: req.order_type,
            requested_qty: req.quantity,
            price: req.price,
            status: OrderStatus::New,
            executed_qty: 0.0,
            avg_fill_price: 0.0,
            leverage,
            reduce_only: req.reduce_only,
            created_at: now_ms(),
        };

        if let Some(cid) = &order.client_order_id {
            self.by_client_id.insert(cid.clone(), id.clone());
        }
        self.order_log.push(id.clone());
        self.orders.insert(id.clone(), order);
        self.prune_terminal();

        match req.order_type {
            OrderType::Market => {
                let mid = match self.marks.get(&symbol) {
                    Some(m) => m.mid,
                    None => {
                        // reject and keep the terminal order for the audit trail
                        if let Some(o) = self.orders.get_mut(&id) {
                            o.status = OrderStatus::Rejected;
                        }
                        ORDERS.with_label_values(&["rejected"]).inc();
                        return Err(EngineError::NoLiquidity(symbol));
                    }
                };
                self.fill_order(&id, mid).ok_or(EngineError::OrderNotFound)
            }
            OrderType::Limit => {
                let mark = self.marks.get(&symbol).copied();
                let px = req.price.unwrap_or(0.0);
                match mark {
                    Some(m) if crosses(req.side, px, &m) => {
                        self.fill_order(&id, m.mid).ok_or(EngineError::OrderNotFound)
                    }
                    _ => {
                        // rests NEW, re-evaluated on every set_mid
                        let order = self.orders.get(&id).cloned().ok_or(EngineError::OrderNotFound)?;
                        Ok(OrderFill { order, fill_qty: 0.0, fill_price: 0.0, realized_pnl_usd: 0.0 })
                    }
                }
            }
        }
    }

    /// Evict the oldest terminal orders once the log exceeds
    /// ORDER_HISTORY_CAP. Open orders are never evicted.
    fn prune_terminal(&mut self) {
        if self.order_log.len() <= ORDER_HISTORY_CAP {
            return;
        }
        let excess = self.order_log.len() - ORDER_HISTORY_CAP;
        let log = std::mem::take(&mut self.order_log);
        let mut dropped = 0usize;
        let mut kept = Vec::with_capacity(ORDER_HISTORY_CAP);
        for id in log {
            let terminal =
                self.orders.get(&id).map(|o| o.status.is_terminal()).unwrap_or(true);
            if dropped < excess && terminal {
                if let Some(o) = self.orders.remove(&id) {
                    if let Some(cid) = &o.client_order_id {
                        self.by_client_id.remove(cid);
                    }
                }
                dropped += 1;
            } else {
                kept.push(id);
            }
        }
        self.order_log = kept;
    }

    pub fn cancel_order(&mut self, req: &CancelRequest) -> Result<Order, EngineError> {
        let id = self.resolve_id(req.order_id.as_deref(), req.client_order_id.as_deref())?;
        let order = self.orders.get_mut(&id).ok_or(EngineError::OrderNotFound)?;
        if order.status.is_terminal() {
            return Err(EngineError::OrderNotFound);
        }
        if let Some(sym) = &req.symbol {
            if !order.symbol.eq_ignore_ascii_case(sym) {
                return Err(EngineError::OrderNotFound);
            }
        }
        order.status = OrderStatus::Canceled;
        ORDERS.with_label_values(&["canceled"]).inc();
        Ok(order.clone())
    }

    /// Amend price/quantity of a resting order. The amended terms are
    /// re-checked against the current mark right away.
    pub fn amend_order(&mut self, req: &AmendRequest) -> Result<Order, EngineError> {
        let order = self.orders.get_mut(&req.order_id).ok_or(EngineError::OrderNotFound)?;
        if order.status.is_terminal() || order.order_type != OrderType::Limit {
            return Err(EngineError::OrderNotFound);
        }
        if let Some(sym) = &req.symbol {
            if !order.symbol.eq_ignore_ascii_case(sym) {
                return Err(EngineError::OrderNotFound);
            }
        }
        if let Some(px) = req.price {
            if !(px > 0.0) {
                return Err(EngineError::InvalidRequest("price must be > 0".into()));
            }
            order.price = Some(px);
        }
        if let Some(qty) = req.quantity {
            if !(qty > 0.0) {
                return Err(EngineError::InvalidRequest("quantity must be > 0".into()));
            }
            order.requested_qty = qty;
        }

        let symbol = order.symbol.clone();
        let side = order.side;
        let px = order.price.unwrap_or(0.0);
        let id = order.id.clone();

        if let Some(mark) = self.marks.get(&symbol).copied() {
            if crosses(side, px, &mark) {
                if let Some(fill) = self.fill_order(&id, mark.mid) {
                    return Ok(fill.order);
                }
            }
        }
        self.orders.get(&id).cloned().ok_or(EngineError::OrderNotFound)
    }

    pub fn list_open_orders(&self) -> Vec<Order> {
        self.order_log
            .iter()
            .filter_map(|id| self.orders.get(id))
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect()
    }

    pub fn recent_orders(&self, limit: usize) -> Vec<Order> {
        self.order_log
            .iter()
            .rev()
            .take(limit)
            .filter_map(|id| self.orders.get(id))
            .cloned()
            .collect()
    }

    pub fn list_positions(&self) -> Vec<Position> {
        self.positions.values().cloned().collect()
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Positions marked against the latest mid (entry price when no mark yet).
    pub fn position_views(&self) -> Vec<PositionView> {
        self.positions
            .values()
            .map(|p| {
                let mark = self.mark(&p.symbol).unwrap_or(p.entry_price);
                PositionView {
                    symbol: p.symbol.clone(),
                    side: p.side(),
                    qty: p.qty,
                    entry_price: p.entry_price,
                    leverage: p.leverage,
                    mark_price: mark,
                    notional_usd: p.notional(mark),
                    unrealized_pnl_usd: p.unrealized_pnl(mark),
                }
            })
            .collect()
    }

    pub fn unrealized_total_usd(&self) -> f64 {
        self.positions
            .values()
            .map(|p| p.unrealized_pnl(self.mark(&p.symbol).unwrap_or(p.entry_price)))
            .sum()
    }

    pub fn realized_total_usd(&self) -> f64 {
        self.realized_total_usd
    }

    fn resolve_id(
        &self,
        order_id: Option<&str>,
        client_order_id: Option<&str>,
    ) -> Result<String, EngineError> {
        if let Some(id) = order_id {
            return Ok(id.to_string());
        }
        if let Some(cid) = client_order_id {
            if let Some(id) = self.by_client_id.get(cid) {
                return Ok(id.clone());
            }
        }
        Err(EngineError::OrderNotFound)
    }

    /// Fill a known order in full at `price` and apply the position delta.
    fn fill_order(&mut self, id: &str, price: f64) -> Option<OrderFill> {
        let (symbol, side, qty, leverage) = {
            let order = self.orders.get_mut(id)?;
            order.status = OrderStatus::Filled;
            order.executed_qty = order.requested_qty;
            order.avg_fill_price = price;
            (order.symbol.clone(), order.side, order.requested_qty, order.leverage)
        };
        let realized = self.apply_fill(&symbol, side, qty, price, leverage);
        FILLS.inc();
        ORDERS.with_label_values(&["filled"]).inc();
        let order = self.orders.get(id)?.clone();
        Some(OrderFill { order, fill_qty: qty, fill_price: price, realized_pnl_usd: realized })
    }

    /// Position update on fill. Same-direction fills re-average the entry;
    /// opposite-direction fills realize `(fill - entry) * closed * sign`
    /// and flip with the remainder. Returns the realized delta.
    fn apply_fill(&mut self, symbol: &str, side: Side, qty: f64, price: f64, leverage: u32) -> f64 {
        let signed = side.sign() * qty;
        let mut realized = 0.0;

        {
            let pos = self.positions.entry(symbol.to_string()).or_insert_with(|| Position {
                symbol: symbol.to_string(),
                qty: 0.0,
                entry_price: 0.0,
                leverage,
                realized_pnl_usd: 0.0,
            });
            let prev = pos.qty;

            if prev.abs() < QTY_EPS || prev.signum() == signed.signum() {
                // same direction -> quantity-weighted average entry
                pos.entry_price = if prev.abs() < QTY_EPS {
                    price
                } else {
                    (pos.entry_price * prev.abs() + price * qty) / (prev.abs() + qty)
                };
                pos.qty = prev + signed;
                pos.leverage = leverage;
            } else {
                // opposite direction -> realize against the entry first
                let closed = qty.min(prev.abs());
                realized = (price - pos.entry_price) * closed * prev.signum();
                pos.realized_pnl_usd += realized;
                pos.qty = prev + signed;
                if pos.qty.abs() >= QTY_EPS && pos.qty.signum() != prev.signum() {
                    // flipped: the remainder opens a fresh entry at the fill
                    pos.entry_price = price;
                    pos.leverage = leverage;
                }
            }
        }

        // magnitude back to zero -> position leaves the open set
        if self.positions.get(symbol).map(|p| p.qty.abs() < QTY_EPS).unwrap_or(false) {
            self.positions.remove(symbol);
        }

        self.realized_total_usd += realized;
        PNL_REALIZED.set(self.realized_total_usd);
        realized
    }
}

fn next_order_id() -> String {
    format!("PB-{}-{}", now_ms(), rand::thread_rng().gen::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(symbols: &[&str]) -> MatchingEngine {
        MatchingEngine::new(&symbols.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn market_buy_fills_at_mid_then_marks_to_market() {
        let mut eng = engine(&["BTCUSDT"]);
        eng.set_mid("BTCUSDT", 50_000.0, None);

        let fill = eng.place_order(OrderRequest::market("BTCUSDT", Side::Buy, 1.0)).unwrap();
        assert_eq!(fill.order.status, OrderStatus::Filled);
        assert_eq!(fill.fill_price, 50_000.0);

        let pos = eng.position("BTCUSDT").unwrap();
        assert_eq!(pos.side(), crate::domain::PositionSide::Long);
        assert_eq!(pos.qty, 1.0);
        assert_eq!(pos.entry_price, 50_000.0);

        eng.set_mid("BTCUSDT", 51_000.0, None);
        let pos = eng.position("BTCUSDT").unwrap();
        assert!((pos.unrealized_pnl(eng.mark("BTCUSDT").unwrap()) - 1_000.0).abs() < 1e-9);
        assert!((eng.unrealized_total_usd() - 1_000.0).abs() < 1e-9);
    }

    #[test]
    fn market_without_price_is_no_liquidity() {
        let mut eng = engine(&["BTCUSDT"]);
        let err = eng.place_order(OrderRequest::market("BTCUSDT", Side::Buy, 1.0)).unwrap_err();
        assert!(matches!(err, EngineError::NoLiquidity(_)));
    }

    #[test]
    fn unknown_symbol_rejected() {
        let mut eng = engine(&["BTCUSDT"]);
        let err = eng.place_order(OrderRequest::market("DOGEUSDT", Side::Buy, 1.0)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidSymbol(_)));
    }

    #[test]
    fn same_direction_fills_weight_the_entry() {
        let mut eng = engine(&["ETHUSDT"]);
        eng.set_mid("ETHUSDT", 3_000.0, None);
        eng.place_order(OrderRequest::market("ETHUSDT", Side::Buy, 1.0)).unwrap();
        eng.set_mid("ETHUSDT", 3_100.0, None);
        eng.place_order(OrderRequest::market("ETHUSDT", Side::Buy, 3.0)).unwrap();

        let pos = eng.position("ETHUSDT").unwrap();
        assert_eq!(pos.qty, 4.0);
        assert!((pos.entry_price - 3_075.0).abs() < 1e-9); // (3000*1 + 3100*3)/4
    }

    #[test]
    fn full_close_realizes_and_removes() {
        let mut eng = engine(&["ETHUSDT"]);
        eng.set_mid("ETHUSDT", 3_000.0, None);
        eng.place_order(OrderRequest::market("ETHUSDT", Side::Buy, 2.0)).unwrap();
        eng.set_mid("ETHUSDT", 3_050.0, None);
        let fill = eng.place_order(OrderRequest::market("ETHUSDT", Side::Sell, 2.0)).unwrap();

        assert!((fill.realized_pnl_usd - 100.0).abs() < 1e-9); // (3050-3000)*2
        assert!(eng.position("ETHUSDT").is_none());
        assert!((eng.realized_total_usd() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn oversized_opposite_fill_flips_direction() {
        let mut eng = engine(&["ETHUSDT"]);
        eng.set_mid("ETHUSDT", 3_000.0, None);
        eng.place_order(OrderRequest::market("ETHUSDT", Side::Buy, 1.0)).unwrap();
        eng.set_mid("ETHUSDT", 2_900.0, None);
        let fill = eng.place_order(OrderRequest::market("ETHUSDT", Side::Sell, 3.0)).unwrap();

        assert!((fill.realized_pnl_usd + 100.0).abs() < 1e-9); // closed 1 @ -100
        let pos = eng.position("ETHUSDT").unwrap();
        assert_eq!(pos.qty, -2.0);
        assert_eq!(pos.entry_price, 2_900.0); // fresh entry at the flip fill
    }

    #[test]
    fn limit_rests_then_fills_when_mid_crosses() {
        let mut eng = engine(&["BTCUSDT"]);
        eng.set_mid("BTCUSDT", 50_000.0, Some(2.0));

        let mut req = OrderRequest::market("BTCUSDT", Side::Buy, 0.5);
        req.order_type = OrderType::Limit;
        req.price = Some(49_000.0);
        let placed = eng.place_order(req).unwrap();
        assert_eq!(placed.order.status, OrderStatus::New);
        assert_eq!(placed.fill_qty, 0.0);
        assert_eq!(eng.list_open_orders().len(), 1);

        // not crossed yet
        assert!(eng.set_mid("BTCUSDT", 49_500.0, Some(2.0)).is_empty());

        // crossed: ask ref = 48998 + 1 <= limit 49000
        let fills = eng.set_mid("BTCUSDT", 48_998.0, Some(2.0));
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].order.status, OrderStatus::Filled);
        assert_eq!(fills[0].fill_price, 48_998.0);
        assert!(eng.list_open_orders().is_empty());
        assert_eq!(eng.position("BTCUSDT").unwrap().qty, 0.5);
    }

    #[test]
    fn marketable_limit_fills_immediately() {
        let mut eng = engine(&["BTCUSDT"]);
        eng.set_mid("BTCUSDT", 50_000.0, None);

        let mut req = OrderRequest::market("BTCUSDT", Side::Buy, 0.5);
        req.order_type = OrderType::Limit;
        req.price = Some(50_100.0);
        let fill = eng.place_order(req).unwrap();
        assert_eq!(fill.order.status, OrderStatus::Filled);
        assert_eq!(fill.fill_price, 50_000.0);
    }

    #[test]
    fn cancel_only_non_terminal() {
        let mut eng = engine(&["BTCUSDT"]);
        eng.set_mid("BTCUSDT", 50_000.0, None);

        let mut req = OrderRequest::market("BTCUSDT", Side::Sell, 0.5);
        req.order_type = OrderType::Limit;
        req.price = Some(60_000.0);
        req.client_order_id = Some("cl-1".into());
        let placed = eng.place_order(req).unwrap();

        let cancelled = eng
            .cancel_order(&CancelRequest {
                client_order_id: Some("cl-1".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(cancelled.status, OrderStatus::Canceled);

        // second cancel targets a terminal order
        let err = eng
            .cancel_order(&CancelRequest {
                order_id: Some(placed.order.id),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::OrderNotFound));
    }

    #[test]
    fn amend_resting_order_terms() {
        let mut eng = engine(&["BTCUSDT"]);
        eng.set_mid("BTCUSDT", 50_000.0, None);

        let mut req = OrderRequest::market("BTCUSDT", Side::Buy, 0.5);
        req.order_type = OrderType::Limit;
        req.price = Some(48_000.0);
        let placed = eng.place_order(req).unwrap();

        let amended = eng
            .amend_order(&AmendRequest {
                order_id: placed.order.id.clone(),
                symbol: None,
                price: Some(49_000.0),
                quantity: Some(1.0),
            })
            .unwrap();
        assert_eq!(amended.price, Some(49_000.0));
        assert_eq!(amended.requested_qty, 1.0);
        assert_eq!(amended.status, OrderStatus::New);

        // an amend across the mid fills on the spot
        let filled = eng
            .amend_order(&AmendRequest {
                order_id: placed.order.id,
                symbol: None,
                price: Some(50_500.0),
                quantity: None,
            })
            .unwrap();
        assert_eq!(filled.status, OrderStatus::Filled);
    }

    #[test]
    fn terminal_history_is_bounded_and_open_orders_survive() {
        let mut eng = engine(&["BTCUSDT"]);
        eng.set_mid("BTCUSDT", 50_000.0, Some(2.0));

        // one resting order that must outlive the churn
        let mut req = OrderRequest::market("BTCUSDT", Side::Buy, 0.1);
        req.order_type = OrderType::Limit;
        req.price = Some(40_000.0);
        req.client_order_id = Some("keeper".into());
        let resting = eng.place_order(req).unwrap();
        assert_eq!(resting.order.status, OrderStatus::New);

        for _ in 0..(ORDER_HISTORY_CAP + 50) {
            eng.place_order(OrderRequest::market("BTCUSDT", Side::Buy, 0.01)).unwrap();
        }

        assert!(eng.order_log.len() <= ORDER_HISTORY_CAP + 1);
        assert!(eng.orders.len() <= ORDER_HISTORY_CAP + 1);
        assert_eq!(eng.recent_orders(20).len(), 20);
        assert_eq!(eng.list_open_orders().len(), 1);

        // the survivor is still addressable by client id
        let cancelled = eng
            .cancel_order(&CancelRequest {
                client_order_id: Some("keeper".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(cancelled.id, resting.order.id);
    }
}
