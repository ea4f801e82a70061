// ===============================
// src/scheduler.rs (decision cycle + price sync)
// ===============================
//
// Per-cycle state machine:
//   Idle -> PreSnapshot -> Deciding -> Applying -> PostSnapshot -> Idle
// with ErrorLogged -> Idle reachable from any state. A failed cycle is
// recorded as one `error` ledger entry stamped with the cycle's start
// timestamp, and the loop continues on the next tick. One bad cycle
// never halts the process.
//
// The agent loop never overlaps itself (the next tick waits for the
// in-flight cycle); the faster price-sync loop runs independently.
//

use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::account;
use crate::config::RiskParams;
use crate::decision::{DecisionContext, DecisionError, DecisionIntent, DecisionProvider, TradeSignal};
use crate::domain::{
    now_ms, pair_key, ErrorEvent, LedgerEvent, LedgerRecord, OrderEvent, OrderPlan, OrderRequest,
    PairCandidate, PairEvent, PairPosition, PairView, PairsEvent, PortfolioEvent, Side,
};
use crate::engine::MatchingEngine;
use crate::feed::PriceFeed;
use crate::gateway::OrderGateway;
use crate::metrics::CYCLES;
use crate::pairs::{evaluate_exit, PairEntry, PairLifecycleTracker};
use crate::persist::{PersistError, Persistence};

const RECENT_ORDERS_LIMIT: usize = 20;

/// Candidates are pushed in by the external screener; the scheduler only
/// reads them.
pub type SharedCandidates = Arc<RwLock<Vec<PairCandidate>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    PreSnapshot,
    Deciding,
    Applying,
    PostSnapshot,
    ErrorLogged,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error(transparent)]
    Decide(#[from] DecisionError),
}

#[derive(Clone, Debug)]
pub struct SchedulerCfg {
    pub base_capital_usd: f64,
    pub realized_lookback_ms: i64,
}

pub struct Scheduler<D, G> {
    engine: Arc<Mutex<MatchingEngine>>,
    pairs: Arc<Mutex<PairLifecycleTracker>>,
    feed: PriceFeed,
    persistence: Arc<Persistence>,
    provider: D,
    gateway: G,
    cfg: SchedulerCfg,
    risk: RiskParams,
    candidates: SharedCandidates,
    phase: CyclePhase,
}

impl<D: DecisionProvider, G: OrderGateway> Scheduler<D, G> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        engine: Arc<Mutex<MatchingEngine>>,
        pairs: Arc<Mutex<PairLifecycleTracker>>,
        feed: PriceFeed,
        persistence: Arc<Persistence>,
        provider: D,
        gateway: G,
        cfg: SchedulerCfg,
        risk: RiskParams,
        candidates: SharedCandidates,
    ) -> Self {
        Self {
            engine,
            pairs,
            feed,
            persistence,
            provider,
            gateway,
            cfg,
            risk,
            candidates,
            phase: CyclePhase::Idle,
        }
    }

    pub fn phase(&self) -> CyclePhase {
        self.phase
    }

    /// Agent loop. Ticks never overlap: the next tick waits for the
    /// in-flight cycle to finish.
    pub async fn run(mut self, interval_secs: u64, mut shutdown: watch::Receiver<bool>) {
        let mut tick = interval(Duration::from_secs(interval_secs.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs, "agent cycle loop started");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.run_cycle().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("agent cycle loop stopped");
                        return;
                    }
                }
            }
        }
    }

    /// Execute exactly one cycle. Public so tests can step ticks
    /// deterministically instead of waiting on wall-clock timers.
    pub async fn run_cycle(&mut self) {
        let cycle_ts = now_ms();
        self.phase = CyclePhase::PreSnapshot;

        match self.cycle_inner(cycle_ts).await {
            Ok(()) => {
                CYCLES.with_label_values(&["ok"]).inc();
            }
            Err(e) => {
                self.phase = CyclePhase::ErrorLogged;
                CYCLES.with_label_values(&["error"]).inc();
                error!(?e, cycle_ts, "cycle failed");
                let rec = LedgerRecord {
                    ts: cycle_ts,
                    event: LedgerEvent::Error(ErrorEvent::for_cycle(e.to_string(), cycle_ts)),
                };
                if let Err(e2) = self.persistence.record_at(rec).await {
                    // ledger down as well: nothing durable left to do
                    error!(?e2, "failed to record cycle error");
                }
            }
        }

        self.phase = CyclePhase::Idle;
    }

    async fn cycle_inner(&mut self, cycle_ts: i64) -> Result<(), CycleError> {
        // ---- PreSnapshot ----
        let (pre_account, pre_positions, recent_orders) = self.portfolio().await?;
        self.persistence
            .record(LedgerEvent::PortfolioPre(PortfolioEvent {
                account: pre_account.clone(),
                positions: pre_positions.clone(),
            }))
            .await?;

        // Store-only convenience snapshot: a store failure degrades, it
        // never aborts the cycle.
        let markets = self.feed.snapshot_all();
        if !markets.is_empty() {
            self.persistence.snapshot_markets(now_ms(), &markets).await;
        }

        let open_pairs = self.pair_views(cycle_ts).await;
        self.persistence
            .record(LedgerEvent::Pairs(PairsEvent { pairs: open_pairs.clone() }))
            .await?;

        // ---- Deciding ----
        self.phase = CyclePhase::Deciding;
        let ctx = DecisionContext {
            ts: cycle_ts,
            account: pre_account,
            positions: pre_positions,
            recent_orders,
            open_pairs,
            candidates: self.candidates.read().unwrap().clone(),
        };
        let intent = self.provider.decide(&ctx).await?;
        debug!(signal = ?intent.signal, rationale = ?intent.rationale, "decision received");

        // ---- Applying ----
        // Simulation-domain failures are recorded and leave the cycle a
        // no-op; only persistence failures abort it.
        self.phase = CyclePhase::Applying;
        self.apply_intent(&intent, cycle_ts).await?;
        self.apply_exit_triggers(cycle_ts).await?;

        // ---- PostSnapshot ----
        self.phase = CyclePhase::PostSnapshot;
        let (post_account, post_positions, _) = self.portfolio().await?;
        self.persistence
            .record(LedgerEvent::PortfolioPost(PortfolioEvent {
                account: post_account,
                positions: post_positions,
            }))
            .await?;

        Ok(())
    }

    async fn portfolio(
        &self,
    ) -> Result<
        (crate::domain::AccountSnapshot, Vec<crate::domain::PositionView>, Vec<crate::domain::Order>),
        PersistError,
    > {
        let engine = self.engine.lock().await;
        let account = account::aggregate(
            self.cfg.base_capital_usd,
            &engine,
            self.persistence.store(),
            now_ms(),
            self.cfg.realized_lookback_ms,
        )
        .await?;
        Ok((account, engine.position_views(), engine.recent_orders(RECENT_ORDERS_LIMIT)))
    }

    /// Open pairs with convergence metrics, using the screener's latest
    /// spread state when it covers the pair.
    async fn pair_views(&self, now: i64) -> Vec<PairView> {
        let candidates = self.candidates.read().unwrap().clone();
        let pairs = self.pairs.lock().await;
        pairs
            .list_open()
            .into_iter()
            .map(|p| {
                let cand = candidates
                    .iter()
                    .find(|c| pair_key(&c.long_symbol, &c.short_symbol) == p.pair_key);
                pairs.view(p, cand.map(|c| c.spread_z), cand.map(|c| c.half_life), now)
            })
            .collect()
    }

    async fn apply_intent(&mut self, intent: &DecisionIntent, cycle_ts: i64) -> Result<(), CycleError> {
        match intent.signal {
            TradeSignal::None => {
                debug!("no action this cycle");
                Ok(())
            }
            TradeSignal::Enter => self.apply_enter(intent, cycle_ts).await,
            TradeSignal::Exit => match &intent.pair {
                Some(p) => {
                    let key = pair_key(&p.long_symbol, &p.short_symbol);
                    self.close_pair_full(&key, "agent_exit", cycle_ts).await
                }
                None => self.record_invalid_pair("EXIT signal without a pair", cycle_ts).await,
            },
            TradeSignal::Reduce => match &intent.pair {
                Some(p) => {
                    let key = pair_key(&p.long_symbol, &p.short_symbol);
                    let fraction = intent
                        .risk
                        .as_ref()
                        .and_then(|r| r.reduce_fraction)
                        .unwrap_or(self.risk.reduce_fraction)
                        .clamp(0.0, 1.0);
                    self.reduce_pair(&key, fraction, cycle_ts).await
                }
                None => self.record_invalid_pair("REDUCE signal without a pair", cycle_ts).await,
            },
        }
    }

    async fn apply_enter(&mut self, intent: &DecisionIntent, cycle_ts: i64) -> Result<(), CycleError> {
        let Some(p) = &intent.pair else {
            return self.record_invalid_pair("ENTER signal without a pair", cycle_ts).await;
        };
        let long = p.long_symbol.to_ascii_uppercase();
        let short = p.short_symbol.to_ascii_uppercase();
        if long == short {
            return self.record_invalid_pair("ENTER with identical legs", cycle_ts).await;
        }
        let key = pair_key(&long, &short);

        let Some(sizing) = &intent.sizing else {
            return self.record_invalid_pair("ENTER signal without sizing", cycle_ts).await;
        };

        // symbol universe + marks
        let (long_mid, short_mid) = {
            let engine = self.engine.lock().await;
            if !engine.knows_symbol(&long) || !engine.knows_symbol(&short) {
                drop(engine);
                return self.record_invalid_pair("ENTER references an unknown symbol", cycle_ts).await;
            }
            (engine.mark(&long), engine.mark(&short))
        };
        let (Some(long_mid), Some(short_mid)) = (long_mid, short_mid) else {
            return self
                .record_order_error("no price known yet for one of the legs", cycle_ts)
                .await;
        };

        // cross-pair symbol isolation, enforced before any order goes out
        {
            let pairs = self.pairs.lock().await;
            for leg in [&long, &short] {
                if pairs.symbol_active(leg) {
                    drop(pairs);
                    return self
                        .record_invalid_pair(
                            &format!("symbol {leg} already belongs to an open pair"),
                            cycle_ts,
                        )
                        .await;
                }
            }
        }

        let leverage = sizing.leverage.clamp(1, self.risk.max_leverage);
        let long_qty = sizing.long_size_usd / long_mid;
        let short_qty = sizing.short_size_usd / short_mid;
        if !(long_qty > 0.0) || !(short_qty > 0.0) {
            return self.record_invalid_pair("ENTER sizes must be positive", cycle_ts).await;
        }

        self.persistence
            .record(LedgerEvent::OrderPlan(OrderPlan {
                signal: "ENTER".into(),
                pair_key: Some(key.clone()),
                long_symbol: Some(long.clone()),
                short_symbol: Some(short.clone()),
                long_size_usd: Some(sizing.long_size_usd),
                short_size_usd: Some(sizing.short_size_usd),
                leverage: Some(leverage),
                rationale: intent.rationale.clone(),
            }))
            .await?;

        // long leg first; unwind it if the short leg is refused
        let mut long_req = OrderRequest::market(&long, Side::Buy, long_qty);
        long_req.leverage = Some(leverage);
        let long_fill = match self.gateway.place(long_req).await {
            Ok(f) => f,
            Err(e) => {
                return self.record_order_error(&format!("long leg rejected: {e}"), cycle_ts).await;
            }
        };
        self.record_pair_order(&long_fill.order, &long, &short, long_fill.realized_pnl_usd).await?;

        let mut short_req = OrderRequest::market(&short, Side::Sell, short_qty);
        short_req.leverage = Some(leverage);
        match self.gateway.place(short_req).await {
            Ok(short_fill) => {
                self.record_pair_order(&short_fill.order, &long, &short, short_fill.realized_pnl_usd)
                    .await?;
            }
            Err(e) => {
                self.record_order_error(&format!("short leg rejected: {e}"), cycle_ts).await?;
                let mut unwind = OrderRequest::market(&long, Side::Sell, long_qty);
                unwind.reduce_only = true;
                match self.gateway.place(unwind).await {
                    Ok(f) => {
                        self.record_pair_order(&f.order, &long, &short, f.realized_pnl_usd).await?
                    }
                    Err(e2) => {
                        self.record_order_error(&format!("unwind failed: {e2}"), cycle_ts).await?
                    }
                }
                return Ok(());
            }
        }

        // entry baselines: intent first, screener candidate as fallback
        let cand = {
            let candidates = self.candidates.read().unwrap();
            candidates
                .iter()
                .find(|c| pair_key(&c.long_symbol, &c.short_symbol) == key)
                .cloned()
        };
        let entry = PairEntry {
            long_symbol: long.clone(),
            short_symbol: short.clone(),
            entry_time: cycle_ts,
            entry_spread_z: p.spread_z.or(cand.as_ref().map(|c| c.spread_z)).unwrap_or(0.0),
            entry_half_life: p.half_life.or(cand.as_ref().map(|c| c.half_life)).unwrap_or(0.0),
        };
        {
            let mut pairs = self.pairs.lock().await;
            if let Err(e) = pairs.open_pair(entry) {
                drop(pairs);
                return self.record_invalid_pair(&e.to_string(), cycle_ts).await;
            }
        }
        info!(%key, "pair opened");

        self.snapshot_pairs(cycle_ts).await
    }

    /// Close both legs in full, accumulate the realized delta, and mark
    /// the pair closed.
    async fn close_pair_full(&mut self, key: &str, reason: &str, cycle_ts: i64) -> Result<(), CycleError> {
        let Some(pair) = self.open_pair_snapshot(key).await else {
            return self.record_invalid_pair(&format!("no open pair for key {key}"), cycle_ts).await;
        };

        let delta = self.flatten_legs(&pair, 1.0, cycle_ts).await?;

        let total = {
            let mut pairs = self.pairs.lock().await;
            pairs
                .close_pair(key, delta, now_ms())
                .map(|p| p.realized_pnl_usd)
                .unwrap_or(delta)
        };

        self.persistence
            .record(LedgerEvent::PairExit(PairEvent {
                pair_key: key.to_string(),
                long_symbol: pair.long_symbol.clone(),
                short_symbol: pair.short_symbol.clone(),
                realized_delta_usd: delta,
                realized_pnl_usd: total,
                reason: Some(reason.to_string()),
            }))
            .await?;
        info!(%key, reason, realized_delta = delta, "pair closed");

        self.snapshot_pairs(cycle_ts).await
    }

    async fn reduce_pair(&mut self, key: &str, fraction: f64, cycle_ts: i64) -> Result<(), CycleError> {
        let Some(pair) = self.open_pair_snapshot(key).await else {
            return self.record_invalid_pair(&format!("no open pair for key {key}"), cycle_ts).await;
        };
        if fraction <= 0.0 {
            return Ok(());
        }

        let delta = self.flatten_legs(&pair, fraction.min(1.0), cycle_ts).await?;

        let total = {
            let mut pairs = self.pairs.lock().await;
            match pairs.reduce_pair(key, delta) {
                Ok(p) => p.realized_pnl_usd,
                Err(e) => {
                    warn!(?e, %key, "reduce on a non-open pair");
                    delta
                }
            }
        };

        self.persistence
            .record(LedgerEvent::PairReduce(PairEvent {
                pair_key: key.to_string(),
                long_symbol: pair.long_symbol.clone(),
                short_symbol: pair.short_symbol.clone(),
                realized_delta_usd: delta,
                realized_pnl_usd: total,
                reason: None,
            }))
            .await?;

        self.snapshot_pairs(cycle_ts).await
    }

    /// Close `fraction` of each leg with reduce-only market orders.
    /// Returns the realized delta across both legs.
    async fn flatten_legs(
        &mut self,
        pair: &PairPosition,
        fraction: f64,
        cycle_ts: i64,
    ) -> Result<f64, CycleError> {
        let mut delta = 0.0;
        for (symbol, close_side) in [
            (pair.long_symbol.clone(), Side::Sell),
            (pair.short_symbol.clone(), Side::Buy),
        ] {
            let qty = {
                let engine = self.engine.lock().await;
                engine.position(&symbol).map(|p| p.qty.abs() * fraction).unwrap_or(0.0)
            };
            if qty <= 0.0 {
                continue;
            }
            let mut req = OrderRequest::market(&symbol, close_side, qty);
            req.reduce_only = true;
            match self.gateway.place(req).await {
                Ok(fill) => {
                    delta += fill.realized_pnl_usd;
                    self.record_pair_order(
                        &fill.order,
                        &pair.long_symbol,
                        &pair.short_symbol,
                        fill.realized_pnl_usd,
                    )
                    .await?;
                }
                Err(e) => {
                    self.record_order_error(
                        &format!("close leg {symbol} rejected: {e}"),
                        cycle_ts,
                    )
                    .await?;
                }
            }
        }
        Ok(delta)
    }

    /// Lifecycle safety net: pairs whose exit condition has triggered are
    /// closed even when the provider said NONE.
    async fn apply_exit_triggers(&mut self, cycle_ts: i64) -> Result<(), CycleError> {
        let candidates = self.candidates.read().unwrap().clone();
        let triggered: Vec<(String, &'static str)> = {
            let pairs = self.pairs.lock().await;
            pairs
                .list_open()
                .into_iter()
                .filter_map(|p| {
                    let z = candidates
                        .iter()
                        .find(|c| pair_key(&c.long_symbol, &c.short_symbol) == p.pair_key)
                        .map(|c| c.spread_z);
                    evaluate_exit(p, z, now_ms(), &self.risk)
                        .map(|t| (p.pair_key.clone(), t.as_str()))
                })
                .collect()
        };

        for (key, reason) in triggered {
            self.close_pair_full(&key, reason, cycle_ts).await?;
        }
        Ok(())
    }

    async fn open_pair_snapshot(&self, key: &str) -> Option<PairPosition> {
        let pairs = self.pairs.lock().await;
        pairs.get(key).filter(|p| p.is_open()).cloned()
    }

    async fn snapshot_pairs(&self, cycle_ts: i64) -> Result<(), CycleError> {
        let views = self.pair_views(cycle_ts).await;
        self.persistence.record(LedgerEvent::Pairs(PairsEvent { pairs: views })).await?;
        Ok(())
    }

    async fn record_pair_order(
        &self,
        order: &crate::domain::Order,
        pair_long: &str,
        pair_short: &str,
        realized: f64,
    ) -> Result<(), CycleError> {
        self.persistence
            .record(LedgerEvent::Order(OrderEvent {
                order: order.clone(),
                pair_long: Some(pair_long.to_string()),
                pair_short: Some(pair_short.to_string()),
                realized_pnl_usd: Some(realized),
            }))
            .await?;
        Ok(())
    }

    async fn record_invalid_pair(&self, message: &str, cycle_ts: i64) -> Result<(), CycleError> {
        warn!(message, "invalid pair intent");
        self.persistence
            .record(LedgerEvent::InvalidPair(ErrorEvent::for_cycle(message, cycle_ts)))
            .await?;
        Ok(())
    }

    async fn record_order_error(&self, message: &str, cycle_ts: i64) -> Result<(), CycleError> {
        warn!(message, "order application failed");
        self.persistence
            .record(LedgerEvent::OrderError(ErrorEvent::for_cycle(message, cycle_ts)))
            .await?;
        Ok(())
    }
}

/// Faster sub-loop: pushes fresh feed readings into the engine. Resting
/// limit fills triggered by a price move are state transitions and get
/// recorded like any other fill.
pub async fn run_price_sync(
    engine: Arc<Mutex<MatchingEngine>>,
    feed: PriceFeed,
    persistence: Arc<Persistence>,
    interval_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = interval(Duration::from_millis(interval_ms.max(10)));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_ms, "price sync loop started");

    loop {
        tokio::select! {
            _ = tick.tick() => {
                let symbols: Vec<String> = {
                    let engine = engine.lock().await;
                    engine.symbols().cloned().collect()
                };
                for sym in symbols {
                    let Some(snap) = feed.get(&sym) else { continue };
                    let fills = {
                        let mut engine = engine.lock().await;
                        engine.set_mid(&sym, snap.mid, Some(snap.best_ask - snap.best_bid))
                    };
                    for fill in fills {
                        let ev = LedgerEvent::Order(OrderEvent {
                            order: fill.order.clone(),
                            pair_long: None,
                            pair_short: None,
                            realized_pnl_usd: Some(fill.realized_pnl_usd),
                        });
                        if let Err(e) = persistence.record(ev).await {
                            error!(?e, order_id = %fill.order.id, "failed to record resting fill");
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("price sync loop stopped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{IntentPair, Sizing};
    use crate::gateway::PaperGateway;
    use crate::ledger::Ledger;
    use crate::store::Store;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    struct Scripted {
        intents: StdMutex<VecDeque<Result<DecisionIntent, DecisionError>>>,
    }

    impl Scripted {
        fn new(seq: Vec<Result<DecisionIntent, DecisionError>>) -> Self {
            Self { intents: StdMutex::new(seq.into()) }
        }
    }

    impl DecisionProvider for Scripted {
        async fn decide(&self, _ctx: &DecisionContext) -> Result<DecisionIntent, DecisionError> {
            let next = self.intents.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(DecisionIntent::none()))
        }
    }

    fn temp_ledger_path() -> String {
        std::env::temp_dir()
            .join(format!("pairbot-sched-{}", rand::random::<u32>()))
            .join("events.jsonl")
            .to_string_lossy()
            .into_owned()
    }

    fn risk() -> RiskParams {
        RiskParams {
            exit_convergence_pct: 0.5,
            max_half_lives: 2.0,
            stop_z_mult: 2.0,
            half_life_period_secs: 3_600,
            reduce_fraction: 0.5,
            max_leverage: 5,
        }
    }

    async fn harness(provider: Scripted) -> (Scheduler<Scripted, PaperGateway>, String) {
        let symbols =
            vec!["BTCUSDT".to_string(), "ETHUSDT".to_string(), "SOLUSDT".to_string()];
        let engine = Arc::new(Mutex::new(MatchingEngine::new(&symbols)));
        {
            let mut e = engine.lock().await;
            e.set_mid("BTCUSDT", 50_000.0, Some(2.0));
            e.set_mid("ETHUSDT", 2_500.0, Some(0.5));
            e.set_mid("SOLUSDT", 150.0, Some(0.1));
        }
        let ledger_path = temp_ledger_path();
        let ledger = Ledger::open(&ledger_path).await.unwrap();
        let store = Store::open_in_memory().unwrap();
        let sched = Scheduler::new(
            engine.clone(),
            Arc::new(Mutex::new(PairLifecycleTracker::new())),
            PriceFeed::new(),
            Arc::new(Persistence::new(ledger, store)),
            provider,
            PaperGateway::new(engine),
            SchedulerCfg { base_capital_usd: 10_000.0, realized_lookback_ms: 3_600_000 },
            risk(),
            Arc::new(RwLock::new(Vec::new())),
        );
        (sched, ledger_path)
    }

    fn enter_intent(long: &str, short: &str, z: f64) -> DecisionIntent {
        DecisionIntent {
            signal: TradeSignal::Enter,
            pair: Some(IntentPair {
                long_symbol: long.into(),
                short_symbol: short.into(),
                spread_z: Some(z),
                half_life: Some(6.0),
            }),
            sizing: Some(Sizing { long_size_usd: 1_000.0, short_size_usd: 1_000.0, leverage: 3 }),
            risk: None,
            rationale: vec!["spread stretched".into()],
        }
    }

    #[tokio::test]
    async fn failed_cycle_logs_one_error_and_continues() {
        let provider =
            Scripted::new(vec![Err(DecisionError::Invalid("provider offline".into()))]);
        let (mut s, ledger_path) = harness(provider).await;

        let before = now_ms();
        s.run_cycle().await;
        let after = now_ms();
        assert_eq!(s.phase(), CyclePhase::Idle);
        assert_eq!(s.persistence.store().count("cycles").await, 1);

        // one error record in the ledger, stamped with the cycle start
        let raw = std::fs::read_to_string(&ledger_path).unwrap();
        let errors: Vec<LedgerRecord> = raw
            .lines()
            .map(|l| crate::ledger::parse_line(l).unwrap())
            .filter(|r| r.event.tag() == "error")
            .collect();
        assert_eq!(errors.len(), 1);
        let rec = &errors[0];
        assert!(before <= rec.ts && rec.ts <= after);
        match &rec.event {
            LedgerEvent::Error(ev) => assert_eq!(ev.cycle_ts, Some(rec.ts)),
            other => panic!("unexpected event: {other:?}"),
        }

        // next tick runs a clean cycle, no new error rows
        tokio::time::sleep(Duration::from_millis(5)).await;
        s.run_cycle().await;
        assert_eq!(s.persistence.store().count("cycles").await, 1);
        assert!(s.persistence.store().count("portfolio_snapshots").await >= 3);
    }

    #[tokio::test]
    async fn broken_markets_table_degrades_without_failing_the_cycle() {
        let (mut s, _ledger_path) =
            harness(Scripted::new(vec![Ok(DecisionIntent::none())])).await;
        s.feed.subscribe(&["BTCUSDT".to_string()]);
        tokio::spawn(s.feed.clone().run_mock());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!s.feed.snapshot_all().is_empty());

        s.persistence.store().execute_raw("DROP TABLE markets_snapshot").await;
        s.run_cycle().await;
        s.feed.stop();

        assert_eq!(s.persistence.store().count("cycles").await, 0);
        assert!(s.persistence.is_degraded());
        assert!(s.persistence.store().count("portfolio_snapshots").await >= 2);
    }

    #[tokio::test]
    async fn enter_opens_pair_and_places_both_legs() {
        let (mut s, _ledger_path) =
            harness(Scripted::new(vec![Ok(enter_intent("BTCUSDT", "ETHUSDT", -1.8))])).await;
        s.run_cycle().await;

        let key = pair_key("BTCUSDT", "ETHUSDT");
        {
            let pairs = s.pairs.lock().await;
            let p = pairs.get(&key).unwrap();
            assert!(p.is_open());
            assert_eq!(p.entry_spread_z, -1.8);
        }
        {
            let engine = s.engine.lock().await;
            assert!(engine.position("BTCUSDT").unwrap().qty > 0.0);
            assert!(engine.position("ETHUSDT").unwrap().qty < 0.0);
        }
        // order plan + two leg fills
        assert_eq!(s.persistence.store().count("orders").await, 3);
        assert_eq!(s.persistence.store().count("active_pairs").await, 1);
    }

    #[tokio::test]
    async fn enter_on_active_symbol_is_rejected() {
        let (mut s, _ledger_path) = harness(Scripted::new(vec![
            Ok(enter_intent("BTCUSDT", "ETHUSDT", -1.8)),
            Ok(enter_intent("BTCUSDT", "SOLUSDT", 1.2)),
        ]))
        .await;
        s.run_cycle().await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        s.run_cycle().await;

        let pairs = s.pairs.lock().await;
        assert_eq!(pairs.list_open().len(), 1);
        assert!(pairs.get(&pair_key("BTCUSDT", "SOLUSDT")).is_none());
        drop(pairs);
        // invalid_pair recorded, SOLUSDT untouched
        assert_eq!(s.persistence.store().count("pairs_events").await, 1);
        let engine = s.engine.lock().await;
        assert!(engine.position("SOLUSDT").is_none());
    }

    #[tokio::test]
    async fn convergence_trigger_closes_pair() {
        let (mut s, _ledger_path) =
            harness(Scripted::new(vec![Ok(enter_intent("BTCUSDT", "ETHUSDT", -1.8))])).await;
        s.run_cycle().await;

        // screener reports the spread mostly reverted
        s.candidates.write().unwrap().push(PairCandidate {
            long_symbol: "BTCUSDT".into(),
            short_symbol: "ETHUSDT".into(),
            spread_z: -0.2,
            half_life: 6.0,
            hedge_ratio: None,
            score: None,
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        s.run_cycle().await;

        let key = pair_key("BTCUSDT", "ETHUSDT");
        {
            let pairs = s.pairs.lock().await;
            assert!(!pairs.get(&key).unwrap().is_open());
        }
        let engine = s.engine.lock().await;
        assert!(engine.position("BTCUSDT").is_none());
        assert!(engine.position("ETHUSDT").is_none());
        drop(engine);
        assert_eq!(s.persistence.store().count("pairs_events").await, 1);
    }

    #[tokio::test]
    async fn reduce_shrinks_both_legs() {
        let reduce = DecisionIntent {
            signal: TradeSignal::Reduce,
            pair: Some(IntentPair {
                long_symbol: "BTCUSDT".into(),
                short_symbol: "ETHUSDT".into(),
                spread_z: None,
                half_life: None,
            }),
            sizing: None,
            risk: None,
            rationale: Vec::new(),
        };
        let (mut s, _ledger_path) = harness(Scripted::new(vec![
            Ok(enter_intent("BTCUSDT", "ETHUSDT", -1.8)),
            Ok(reduce),
        ]))
        .await;
        s.run_cycle().await;
        let full_qty = s.engine.lock().await.position("BTCUSDT").unwrap().qty;
        tokio::time::sleep(Duration::from_millis(5)).await;
        s.run_cycle().await;

        let engine = s.engine.lock().await;
        let remaining = engine.position("BTCUSDT").unwrap().qty;
        assert!((remaining - full_qty * 0.5).abs() < 1e-9);
        drop(engine);
        let pairs = s.pairs.lock().await;
        assert!(pairs.get(&pair_key("BTCUSDT", "ETHUSDT")).unwrap().is_open());
    }
}
