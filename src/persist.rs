// ===============================
// src/persist.rs (dual-sink recording)
// ===============================
//
// Write order per transition: (1) the append-only ledger, which must
// succeed or the transition is unobserved and the caller fails; (2) the
// relational store, where a failure degrades to ledger-only recording.
// The ledger remains the durability source of truth.
//

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::warn;

use crate::domain::{LedgerEvent, LedgerRecord};
use crate::ledger::Ledger;
use crate::metrics::STORE_DEGRADED;
use crate::store::Store;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("ledger write failed: {0}")]
    Ledger(#[from] std::io::Error),
    #[error("store write failed: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

pub struct Persistence {
    ledger: Ledger,
    store: Store,
    degraded: AtomicBool,
}

impl Persistence {
    pub fn new(ledger: Ledger, store: Store) -> Self {
        Self { ledger, store, degraded: AtomicBool::new(false) }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Record a transition stamped now.
    pub async fn record(&self, event: LedgerEvent) -> Result<LedgerRecord, PersistError> {
        self.record_at(LedgerRecord::new(event)).await
    }

    /// Record with a caller-chosen timestamp (cycle-start stamping).
    pub async fn record_at(&self, rec: LedgerRecord) -> Result<LedgerRecord, PersistError> {
        self.ledger.append(&rec).await?;
        if let Err(e) = self.store.apply(&rec).await {
            warn!(?e, tag = rec.event.tag(), "store write failed, ledger-only from here");
            self.mark_degraded();
        }
        Ok(rec)
    }

    /// Store-only markets snapshot. The store is the queryable convenience
    /// sink, so a failed write degrades without failing the cycle.
    pub async fn snapshot_markets(&self, as_of: i64, markets: &impl serde::Serialize) {
        if let Err(e) = self.store.insert_markets_snapshot(as_of, markets).await {
            warn!(?e, "markets snapshot write failed, store degraded");
            self.mark_degraded();
        }
    }

    fn mark_degraded(&self) {
        self.degraded.store(true, Ordering::Relaxed);
        STORE_DEGRADED.set(1);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub async fn close(&self) {
        self.ledger.close().await;
    }
}
