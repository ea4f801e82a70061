// ===============================
// src/account.rs (derived account view)
// ===============================

use crate::domain::AccountSnapshot;
use crate::engine::MatchingEngine;
use crate::metrics::{EQUITY, PNL_UNREALIZED};
use crate::persist::PersistError;
use crate::store::Store;

/// Derive the consolidated account view. Pure read: nothing is persisted.
///
/// Balance reconstructs realized P&L by scanning the store's order history
/// within `lookback_ms` instead of keeping a running counter. The figure is
/// exact while every realized event falls inside the window; older realized
/// P&L is simply not counted.
pub async fn aggregate(
    base_capital_usd: f64,
    engine: &MatchingEngine,
    store: &Store,
    now: i64,
    lookback_ms: i64,
) -> Result<AccountSnapshot, PersistError> {
    let realized = store.realized_pnl_since(now.saturating_sub(lookback_ms)).await?;
    Ok(from_parts(base_capital_usd, realized, engine))
}

/// Assemble the snapshot from already-known parts (sync; used by
/// `aggregate` and by tests that pin the realized component).
pub fn from_parts(
    base_capital_usd: f64,
    realized_pnl_usd: f64,
    engine: &MatchingEngine,
) -> AccountSnapshot {
    let positions = engine.list_positions();
    let unrealized = engine.unrealized_total_usd();
    let mut margin_used = 0.0;
    for p in &positions {
        let mark = engine.mark(&p.symbol).unwrap_or(p.entry_price);
        margin_used += p.notional(mark) / p.leverage.max(1) as f64;
    }

    let balance = base_capital_usd + realized_pnl_usd;
    let equity = balance + unrealized;

    PNL_UNREALIZED.set(unrealized);
    EQUITY.set(equity);

    AccountSnapshot {
        balance_usd: balance,
        equity_usd: equity,
        margin_used_usd: margin_used,
        available_margin_usd: (equity - margin_used).max(0.0),
        open_positions_count: positions.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OrderRequest, Side};

    #[test]
    fn equity_is_balance_plus_unrealized() {
        let symbols = vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()];
        let mut eng = MatchingEngine::new(&symbols);
        eng.set_mid("BTCUSDT", 50_000.0, None);
        eng.set_mid("ETHUSDT", 3_000.0, None);

        let mut req = OrderRequest::market("BTCUSDT", Side::Buy, 1.0);
        req.leverage = Some(5);
        eng.place_order(req).unwrap();
        eng.place_order(OrderRequest::market("ETHUSDT", Side::Sell, 10.0)).unwrap();

        eng.set_mid("BTCUSDT", 51_000.0, None); // +1000 on the long
        eng.set_mid("ETHUSDT", 3_050.0, None); // -500 on the short

        let snap = from_parts(10_000.0, 250.0, &eng);
        assert_eq!(snap.open_positions_count, 2);
        assert!((snap.balance_usd - 10_250.0).abs() < 1e-9);
        assert!((snap.equity_usd - (snap.balance_usd + 500.0)).abs() < 1e-9);

        // margin: 51000/5 + 30500/1
        assert!((snap.margin_used_usd - (10_200.0 + 30_500.0)).abs() < 1e-9);
        assert!(
            (snap.available_margin_usd - (snap.equity_usd - snap.margin_used_usd).max(0.0)).abs()
                < 1e-9
        );
    }

    #[test]
    fn available_margin_floors_at_zero() {
        let symbols = vec!["BTCUSDT".to_string()];
        let mut eng = MatchingEngine::new(&symbols);
        eng.set_mid("BTCUSDT", 50_000.0, None);
        eng.place_order(OrderRequest::market("BTCUSDT", Side::Buy, 1.0)).unwrap();

        let snap = from_parts(1_000.0, 0.0, &eng);
        assert_eq!(snap.available_margin_usd, 0.0);
    }
}
