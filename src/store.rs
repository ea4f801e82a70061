// ===============================
// src/store.rs (embedded relational store)
// ===============================
//
// Structured sink: every ledger record is routed into a typed table with
// INSERT OR IGNORE on a (timestamp, type, natural-key) uniqueness
// constraint, so replaying the same logical event after a crash is a
// no-op. At-least-once into the ledger, at-most-once effect here.
//

use std::path::Path;

use rusqlite::{params, Connection};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use crate::domain::{
    LedgerEvent, LedgerRecord, OrderEvent, PairEvent, PairPosition, PairView, PairsEvent,
    PortfolioEvent,
};
use crate::persist::PersistError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    ts INTEGER NOT NULL,
    type TEXT NOT NULL,
    symbol TEXT,
    side TEXT,
    status TEXT,
    price REAL,
    executed_qty REAL,
    order_id TEXT NOT NULL DEFAULT '',
    pair_long TEXT,
    pair_short TEXT,
    realized_pnl_usd REAL,
    raw_json TEXT NOT NULL,
    UNIQUE (ts, type, order_id)
);
CREATE INDEX IF NOT EXISTS idx_orders_ts ON orders (ts);
CREATE INDEX IF NOT EXISTS idx_orders_type_ts ON orders (type, ts);

CREATE TABLE IF NOT EXISTS portfolio_snapshots (
    ts INTEGER NOT NULL,
    phase TEXT NOT NULL,
    account_json TEXT NOT NULL,
    positions_json TEXT NOT NULL,
    UNIQUE (ts, phase)
);
CREATE INDEX IF NOT EXISTS idx_portfolio_ts ON portfolio_snapshots (ts);

CREATE TABLE IF NOT EXISTS cycles (
    ts INTEGER NOT NULL,
    type TEXT NOT NULL,
    data_json TEXT NOT NULL,
    UNIQUE (ts, type)
);
CREATE INDEX IF NOT EXISTS idx_cycles_type_ts ON cycles (type, ts);

CREATE TABLE IF NOT EXISTS active_pairs (
    pair_key TEXT PRIMARY KEY,
    long_symbol TEXT NOT NULL,
    short_symbol TEXT NOT NULL,
    entry_time INTEGER NOT NULL,
    entry_spread_z REAL,
    entry_half_life REAL,
    closed_at INTEGER,
    realized_pnl_usd REAL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS pair_state_history (
    pair_key TEXT NOT NULL,
    ts INTEGER NOT NULL,
    spread_z REAL,
    half_life REAL,
    pnl_usd REAL,
    entry_spread_z REAL,
    delta_spread_z REAL,
    entry_half_life REAL,
    delta_half_life REAL,
    elapsed_ms INTEGER,
    UNIQUE (pair_key, ts)
);
CREATE INDEX IF NOT EXISTS idx_pair_history_ts ON pair_state_history (ts);

CREATE TABLE IF NOT EXISTS pairs_snapshot (
    as_of INTEGER PRIMARY KEY,
    data_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS markets_snapshot (
    as_of INTEGER PRIMARY KEY,
    data_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pairs_events (
    ts INTEGER NOT NULL,
    type TEXT NOT NULL,
    data_json TEXT NOT NULL,
    UNIQUE (ts, type)
);
CREATE INDEX IF NOT EXISTS idx_pairs_events_type_ts ON pairs_events (type, ts);
"#;

/// Serde-facing enum value as its wire string ("BUY", "FILLED", ...).
fn enum_str<T: Serialize>(v: &T) -> String {
    serde_json::to_value(v)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the store file. One connection per store file,
    /// constructed once at startup and passed down.
    pub async fn open(db_path: &str) -> Result<Self, PersistError> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let conn = Connection::open(db_path)?;
        Self::init(conn, db_path)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, PersistError> {
        Self::init(Connection::open_in_memory()?, ":memory:")
    }

    fn init(conn: Connection, label: &str) -> Result<Self, PersistError> {
        // WAL serializes writers internally; the app adds no write lock
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %label, "store initialized");
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Route one ledger record into its typed table(s). Idempotent per
    /// record: dedup keys make a second application a no-op.
    pub async fn apply(&self, rec: &LedgerRecord) -> Result<(), PersistError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        match &rec.event {
            LedgerEvent::Order(ev) | LedgerEvent::OrderCancelled(ev) => {
                insert_order_row(&tx, rec.ts, rec.event.tag(), ev)?;
            }
            LedgerEvent::OrderPlan(plan) => {
                tx.execute(
                    "INSERT OR IGNORE INTO orders (ts, type, order_id, pair_long, pair_short, raw_json)
                     VALUES (?1, ?2, '', ?3, ?4, ?5)",
                    params![
                        rec.ts,
                        rec.event.tag(),
                        plan.long_symbol,
                        plan.short_symbol,
                        serde_json::to_string(plan)?,
                    ],
                )?;
            }
            LedgerEvent::PairExit(ev) => {
                if insert_pairs_event(&tx, rec.ts, rec.event.tag(), ev)? {
                    tx.execute(
                        "UPDATE active_pairs
                         SET realized_pnl_usd = realized_pnl_usd + ?1, closed_at = ?2
                         WHERE pair_key = ?3 AND closed_at IS NULL",
                        params![ev.realized_delta_usd, rec.ts, ev.pair_key],
                    )?;
                }
            }
            LedgerEvent::PairReduce(ev) => {
                if insert_pairs_event(&tx, rec.ts, rec.event.tag(), ev)? {
                    tx.execute(
                        "UPDATE active_pairs
                         SET realized_pnl_usd = realized_pnl_usd + ?1
                         WHERE pair_key = ?2 AND closed_at IS NULL",
                        params![ev.realized_delta_usd, ev.pair_key],
                    )?;
                }
            }
            LedgerEvent::Portfolio(ev) | LedgerEvent::PortfolioPre(ev)
            | LedgerEvent::PortfolioPost(ev) => {
                let phase = match rec.event.tag() {
                    "portfolio_pre" => "pre",
                    "portfolio_post" => "post",
                    _ => "",
                };
                insert_portfolio_row(&tx, rec.ts, phase, ev)?;
            }
            LedgerEvent::Pairs(ev) | LedgerEvent::PairsSnapshot(ev) => {
                insert_pairs_snapshot(&tx, rec.ts, ev)?;
            }
            LedgerEvent::InvalidPair(ev) => {
                tx.execute(
                    "INSERT OR IGNORE INTO pairs_events (ts, type, data_json) VALUES (?1, ?2, ?3)",
                    params![rec.ts, rec.event.tag(), serde_json::to_string(ev)?],
                )?;
            }
            LedgerEvent::OrderError(ev)
            | LedgerEvent::KlineError(ev)
            | LedgerEvent::PairsError(ev)
            | LedgerEvent::Error(ev) => {
                tx.execute(
                    "INSERT OR IGNORE INTO cycles (ts, type, data_json) VALUES (?1, ?2, ?3)",
                    params![rec.ts, rec.event.tag(), serde_json::to_string(ev)?],
                )?;
            }
            LedgerEvent::Unknown(ev) => {
                tx.execute(
                    "INSERT OR IGNORE INTO cycles (ts, type, data_json) VALUES (?1, ?2, ?3)",
                    params![rec.ts, ev.tag, serde_json::to_string(&ev.data)?],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Re-ingest ledger records (recovery after a crash). Dedup keys make
    /// already-applied records no-ops.
    pub async fn replay<I>(&self, records: I) -> Result<usize, PersistError>
    where
        I: IntoIterator<Item = LedgerRecord>,
    {
        let mut n = 0;
        for rec in records {
            self.apply(&rec).await?;
            n += 1;
        }
        Ok(n)
    }

    /// Markets view sampled from the price feed. Keyed on as_of, replay safe.
    pub async fn insert_markets_snapshot(
        &self,
        as_of: i64,
        data: &impl Serialize,
    ) -> Result<(), PersistError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO markets_snapshot (as_of, data_json) VALUES (?1, ?2)",
            params![as_of, serde_json::to_string(data)?],
        )?;
        Ok(())
    }

    /// Σ realized P&L recorded on order fills since `since_ms` (the
    /// aggregator's bounded lookback scan).
    pub async fn realized_pnl_since(&self, since_ms: i64) -> Result<f64, PersistError> {
        let conn = self.conn.lock().await;
        let sum = conn.query_row(
            "SELECT COALESCE(SUM(realized_pnl_usd), 0.0) FROM orders
             WHERE ts >= ?1 AND type = 'order' AND realized_pnl_usd IS NOT NULL",
            params![since_ms],
            |row| row.get::<_, f64>(0),
        )?;
        Ok(sum)
    }

    /// Open pair rows for startup recovery.
    pub async fn load_open_pairs(&self) -> Result<Vec<PairPosition>, PersistError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT pair_key, long_symbol, short_symbol, entry_time, entry_spread_z,
                    entry_half_life, closed_at, realized_pnl_usd
             FROM active_pairs WHERE closed_at IS NULL",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PairPosition {
                    pair_key: row.get(0)?,
                    long_symbol: row.get(1)?,
                    short_symbol: row.get(2)?,
                    entry_time: row.get(3)?,
                    entry_spread_z: row.get::<_, Option<f64>>(4)?.unwrap_or(0.0),
                    entry_half_life: row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
                    closed_at: row.get(6)?,
                    realized_pnl_usd: row.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    #[cfg(test)]
    pub async fn execute_raw(&self, sql: &str) {
        let conn = self.conn.lock().await;
        conn.execute_batch(sql).unwrap();
    }

    #[cfg(test)]
    pub async fn count(&self, table: &str) -> i64 {
        let conn = self.conn.lock().await;
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .unwrap()
    }
}

fn insert_order_row(
    tx: &rusqlite::Transaction<'_>,
    ts: i64,
    tag: &str,
    ev: &OrderEvent,
) -> Result<(), PersistError> {
    let o = &ev.order;
    tx.execute(
        "INSERT OR IGNORE INTO orders
         (ts, type, symbol, side, status, price, executed_qty, order_id,
          pair_long, pair_short, realized_pnl_usd, raw_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            ts,
            tag,
            o.symbol,
            enum_str(&o.side),
            enum_str(&o.status),
            o.price.unwrap_or(o.avg_fill_price),
            o.executed_qty,
            o.id,
            ev.pair_long,
            ev.pair_short,
            ev.realized_pnl_usd,
            serde_json::to_string(ev)?,
        ],
    )?;
    Ok(())
}

/// Returns true when the row was actually inserted (first application).
fn insert_pairs_event(
    tx: &rusqlite::Transaction<'_>,
    ts: i64,
    tag: &str,
    ev: &PairEvent,
) -> Result<bool, PersistError> {
    let n = tx.execute(
        "INSERT OR IGNORE INTO pairs_events (ts, type, data_json) VALUES (?1, ?2, ?3)",
        params![ts, tag, serde_json::to_string(ev)?],
    )?;
    Ok(n == 1)
}

fn insert_portfolio_row(
    tx: &rusqlite::Transaction<'_>,
    ts: i64,
    phase: &str,
    ev: &PortfolioEvent,
) -> Result<(), PersistError> {
    tx.execute(
        "INSERT OR IGNORE INTO portfolio_snapshots (ts, phase, account_json, positions_json)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            ts,
            phase,
            serde_json::to_string(&ev.account)?,
            serde_json::to_string(&ev.positions)?,
        ],
    )?;
    Ok(())
}

fn insert_pairs_snapshot(
    tx: &rusqlite::Transaction<'_>,
    ts: i64,
    ev: &PairsEvent,
) -> Result<(), PersistError> {
    tx.execute(
        "INSERT OR IGNORE INTO pairs_snapshot (as_of, data_json) VALUES (?1, ?2)",
        params![ts, serde_json::to_string(ev)?],
    )?;
    for view in &ev.pairs {
        insert_pair_history_row(tx, ts, view)?;
        // entry row for the open pair; close/reduce events update it later
        tx.execute(
            "INSERT OR IGNORE INTO active_pairs
             (pair_key, long_symbol, short_symbol, entry_time, entry_spread_z,
              entry_half_life, closed_at, realized_pnl_usd)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7)",
            params![
                view.pair_key,
                view.long_symbol,
                view.short_symbol,
                ts - view.elapsed_ms,
                view.entry_spread_z,
                view.entry_half_life,
                view.pnl_usd,
            ],
        )?;
    }
    Ok(())
}

fn insert_pair_history_row(
    tx: &rusqlite::Transaction<'_>,
    ts: i64,
    view: &PairView,
) -> Result<(), PersistError> {
    tx.execute(
        "INSERT OR IGNORE INTO pair_state_history
         (pair_key, ts, spread_z, half_life, pnl_usd, entry_spread_z, delta_spread_z,
          entry_half_life, delta_half_life, elapsed_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            view.pair_key,
            ts,
            view.spread_z,
            view.half_life,
            view.pnl_usd,
            view.entry_spread_z,
            view.delta_spread_z,
            view.entry_half_life,
            view.delta_half_life,
            view.elapsed_ms,
        ],
    )?;
    Ok(())
}
