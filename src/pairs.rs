// ===============================
// src/pairs.rs (pair lifecycle tracker)
// ===============================
//
// Tracks open statistical-arbitrage pair positions (one long leg, one
// short leg) and their entry baselines. A symbol may belong to at most
// one open pair at a time; that invariant is enforced here, not in the
// matching engine.
//

use ahash::AHashMap as HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RiskParams;
use crate::domain::{pair_key, PairPosition, PairView};
use crate::metrics::PAIRS_OPEN;

#[derive(Debug, Error)]
pub enum PairError {
    #[error("symbol {0} is already part of an open pair")]
    SymbolAlreadyActive(String),
    #[error("no open pair for key {0}")]
    PairNotOpen(String),
}

#[derive(Debug, Clone)]
pub struct PairEntry {
    pub long_symbol: String,
    pub short_symbol: String,
    pub entry_time: i64,
    pub entry_spread_z: f64,
    pub entry_half_life: f64,
}

/// Exit-trigger outcome for an open pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitTrigger {
    /// Spread z pulled back past the convergence threshold.
    Converged,
    /// Held longer than the half-life based horizon.
    MaxHoldingElapsed,
    /// Spread blew out past the divergence stop.
    DivergenceStop,
}

impl ExitTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitTrigger::Converged => "converged",
            ExitTrigger::MaxHoldingElapsed => "max_holding_elapsed",
            ExitTrigger::DivergenceStop => "divergence_stop",
        }
    }
}

pub struct PairLifecycleTracker {
    pairs: HashMap<String, PairPosition>,
}

impl PairLifecycleTracker {
    pub fn new() -> Self {
        Self { pairs: HashMap::new() }
    }

    /// Reload previously open pairs (store recovery at startup).
    pub fn restore(&mut self, pairs: Vec<PairPosition>) {
        for p in pairs {
            self.pairs.insert(p.pair_key.clone(), p);
        }
        self.update_gauge();
    }

    pub fn open_pair(&mut self, entry: PairEntry) -> Result<&PairPosition, PairError> {
        for leg in [&entry.long_symbol, &entry.short_symbol] {
            if self.symbol_active(leg) {
                return Err(PairError::SymbolAlreadyActive(leg.clone()));
            }
        }
        let key = pair_key(&entry.long_symbol, &entry.short_symbol);
        let pos = PairPosition {
            pair_key: key.clone(),
            long_symbol: entry.long_symbol,
            short_symbol: entry.short_symbol,
            entry_time: entry.entry_time,
            entry_spread_z: entry.entry_spread_z,
            entry_half_life: entry.entry_half_life,
            closed_at: None,
            realized_pnl_usd: 0.0,
        };
        // a closed previous life under the same key is replaced
        self.pairs.insert(key.clone(), pos);
        self.update_gauge();
        Ok(&self.pairs[&key])
    }

    /// Close an open pair, accumulating the final realized delta.
    /// Idempotent: a second close of the same key is a no-op (a retried
    /// cycle must not double-close).
    pub fn close_pair(&mut self, key: &str, realized_delta: f64, now: i64) -> Option<&PairPosition> {
        let pos = self.pairs.get_mut(key)?;
        if pos.closed_at.is_none() {
            pos.realized_pnl_usd += realized_delta;
            pos.closed_at = Some(now);
        }
        self.update_gauge();
        self.pairs.get(key)
    }

    /// Accumulate realized P&L from a partial reduction on a still-open pair.
    pub fn reduce_pair(&mut self, key: &str, realized_delta: f64) -> Result<&PairPosition, PairError> {
        let pos = self
            .pairs
            .get_mut(key)
            .filter(|p| p.is_open())
            .ok_or_else(|| PairError::PairNotOpen(key.to_string()))?;
        pos.realized_pnl_usd += realized_delta;
        Ok(&self.pairs[key])
    }

    pub fn get(&self, key: &str) -> Option<&PairPosition> {
        self.pairs.get(key)
    }

    pub fn list_open(&self) -> Vec<&PairPosition> {
        let mut out: Vec<&PairPosition> = self.pairs.values().filter(|p| p.is_open()).collect();
        out.sort_by(|a, b| a.pair_key.cmp(&b.pair_key));
        out
    }

    pub fn symbol_active(&self, symbol: &str) -> bool {
        self.pairs
            .values()
            .any(|p| p.is_open() && (p.long_symbol == symbol || p.short_symbol == symbol))
    }

    /// Snapshot view with convergence metrics, given the latest observed
    /// spread state (None when the screener has not refreshed this pair).
    pub fn view(
        &self,
        pair: &PairPosition,
        current_z: Option<f64>,
        current_half_life: Option<f64>,
        now: i64,
    ) -> PairView {
        PairView {
            pair_key: pair.pair_key.clone(),
            long_symbol: pair.long_symbol.clone(),
            short_symbol: pair.short_symbol.clone(),
            spread_z: current_z,
            half_life: current_half_life,
            pnl_usd: pair.realized_pnl_usd,
            entry_spread_z: pair.entry_spread_z,
            delta_spread_z: current_z.map(|z| z - pair.entry_spread_z),
            entry_half_life: pair.entry_half_life,
            delta_half_life: current_half_life.map(|h| h - pair.entry_half_life),
            elapsed_ms: now.saturating_sub(pair.entry_time),
            convergence_pct: current_z.and_then(|z| convergence_pct(pair.entry_spread_z, z)),
        }
    }

    fn update_gauge(&self) {
        PAIRS_OPEN.set(self.pairs.values().filter(|p| p.is_open()).count() as i64);
    }
}

impl Default for PairLifecycleTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Fraction of the entry z-score magnitude that has reverted.
pub fn convergence_pct(entry_z: f64, current_z: f64) -> Option<f64> {
    if entry_z.abs() < f64::EPSILON {
        return None;
    }
    Some((entry_z.abs() - current_z.abs()) / entry_z.abs())
}

/// Evaluate exit triggers for an open pair against the latest spread state.
pub fn evaluate_exit(
    pair: &PairPosition,
    current_z: Option<f64>,
    now: i64,
    params: &RiskParams,
) -> Option<ExitTrigger> {
    if let Some(z) = current_z {
        if let Some(pct) = convergence_pct(pair.entry_spread_z, z) {
            if pct >= params.exit_convergence_pct {
                return Some(ExitTrigger::Converged);
            }
        }
        if pair.entry_spread_z.abs() > f64::EPSILON
            && z.abs() >= pair.entry_spread_z.abs() * params.stop_z_mult
        {
            return Some(ExitTrigger::DivergenceStop);
        }
    }

    // half-life based holding horizon
    if pair.entry_half_life > 0.0 {
        let horizon_ms = (pair.entry_half_life
            * params.max_half_lives
            * params.half_life_period_secs as f64
            * 1_000.0) as i64;
        if now.saturating_sub(pair.entry_time) >= horizon_ms {
            return Some(ExitTrigger::MaxHoldingElapsed);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> RiskParams {
        RiskParams {
            exit_convergence_pct: 0.5,
            max_half_lives: 2.0,
            stop_z_mult: 2.0,
            half_life_period_secs: 3_600,
            reduce_fraction: 0.5,
            max_leverage: 5,
        }
    }

    fn entry(long: &str, short: &str, z: f64) -> PairEntry {
        PairEntry {
            long_symbol: long.to_string(),
            short_symbol: short.to_string(),
            entry_time: 1_000,
            entry_spread_z: z,
            entry_half_life: 4.0,
        }
    }

    #[test]
    fn symbol_isolation_across_open_pairs() {
        let mut trk = PairLifecycleTracker::new();
        trk.open_pair(entry("ADAUSDT", "NEARUSDT", -1.5)).unwrap();

        let err = trk.open_pair(entry("ADAUSDT", "SOLUSDT", -2.0)).unwrap_err();
        assert!(matches!(err, PairError::SymbolAlreadyActive(s) if s == "ADAUSDT"));

        let err = trk.open_pair(entry("DOTUSDT", "NEARUSDT", 2.0)).unwrap_err();
        assert!(matches!(err, PairError::SymbolAlreadyActive(s) if s == "NEARUSDT"));

        // legs free again once the pair closes
        let key = pair_key("ADAUSDT", "NEARUSDT");
        trk.close_pair(&key, 12.0, 2_000);
        trk.open_pair(entry("ADAUSDT", "SOLUSDT", -2.0)).unwrap();
    }

    #[test]
    fn close_is_idempotent() {
        let mut trk = PairLifecycleTracker::new();
        trk.open_pair(entry("ADAUSDT", "NEARUSDT", -1.5)).unwrap();
        let key = pair_key("ADAUSDT", "NEARUSDT");

        let first = trk.close_pair(&key, 25.0, 5_000).unwrap().clone();
        assert_eq!(first.closed_at, Some(5_000));
        assert_eq!(first.realized_pnl_usd, 25.0);

        // second close: no-op, not an error
        let second = trk.close_pair(&key, 99.0, 9_000).unwrap().clone();
        assert_eq!(second.closed_at, Some(5_000));
        assert_eq!(second.realized_pnl_usd, 25.0);
    }

    #[test]
    fn reduce_accumulates_without_closing() {
        let mut trk = PairLifecycleTracker::new();
        trk.open_pair(entry("ADAUSDT", "NEARUSDT", -1.5)).unwrap();
        let key = pair_key("ADAUSDT", "NEARUSDT");

        trk.reduce_pair(&key, 10.0).unwrap();
        let p = trk.reduce_pair(&key, -4.0).unwrap().clone();
        assert!(p.is_open());
        assert!((p.realized_pnl_usd - 6.0).abs() < 1e-12);

        trk.close_pair(&key, 1.0, 5_000);
        assert!(matches!(trk.reduce_pair(&key, 1.0), Err(PairError::PairNotOpen(_))));
    }

    #[test]
    fn convergence_crossing_half_triggers_exit() {
        // entry z -1.47 moves to -0.3: (1.47-0.3)/1.47 ≈ 0.796 >= 0.5
        let mut trk = PairLifecycleTracker::new();
        let pair = trk.open_pair(entry("ADAUSDT", "NEARUSDT", -1.47)).unwrap().clone();

        let pct = convergence_pct(pair.entry_spread_z, -0.3).unwrap();
        assert!((pct - 0.7959).abs() < 1e-3);

        let trigger = evaluate_exit(&pair, Some(-0.3), pair.entry_time + 1_000, &params());
        assert_eq!(trigger, Some(ExitTrigger::Converged));

        // far from converged, inside horizon, inside stop: no trigger
        let none = evaluate_exit(&pair, Some(-1.4), pair.entry_time + 1_000, &params());
        assert_eq!(none, None);
    }

    #[test]
    fn divergence_and_holding_triggers() {
        let mut trk = PairLifecycleTracker::new();
        let pair = trk.open_pair(entry("ADAUSDT", "NEARUSDT", -1.5)).unwrap().clone();

        let stop = evaluate_exit(&pair, Some(-3.1), pair.entry_time + 1_000, &params());
        assert_eq!(stop, Some(ExitTrigger::DivergenceStop));

        // horizon: 4 half-lives entry * 2.0 multiple * 3600s = 8h
        let late = pair.entry_time + 8 * 3_600 * 1_000;
        let held = evaluate_exit(&pair, Some(-1.4), late, &params());
        assert_eq!(held, Some(ExitTrigger::MaxHoldingElapsed));
    }
}
