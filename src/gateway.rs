// ===============================
// src/gateway.rs (order routing seam)
// ===============================

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::domain::{OrderFill, OrderRequest};
use crate::engine::{EngineError, MatchingEngine};

/// Seam between the scheduler's Applying step and order execution.
pub trait OrderGateway {
    fn place(
        &self,
        req: OrderRequest,
    ) -> impl Future<Output = Result<OrderFill, EngineError>> + Send;
}

/// Paper execution: every intent is applied to the in-process matching
/// engine against the latest feed-synced mid.
#[derive(Clone)]
pub struct PaperGateway {
    engine: Arc<Mutex<MatchingEngine>>,
}

impl PaperGateway {
    pub fn new(engine: Arc<Mutex<MatchingEngine>>) -> Self {
        Self { engine }
    }
}

impl OrderGateway for PaperGateway {
    async fn place(&self, req: OrderRequest) -> Result<OrderFill, EngineError> {
        let mut engine = self.engine.lock().await;
        engine.place_order(req)
    }
}

/// Live exchange routing is deliberately not implemented: every request
/// is refused before it can reach a venue.
#[derive(Clone, Default)]
pub struct LiveGateway;

impl OrderGateway for LiveGateway {
    async fn place(&self, req: OrderRequest) -> Result<OrderFill, EngineError> {
        info!(symbol = %req.symbol, side = ?req.side, "live order routing requested");
        Err(EngineError::LiveUnsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Side;

    #[tokio::test]
    async fn paper_gateway_routes_to_engine() {
        let symbols = vec!["BTCUSDT".to_string()];
        let engine = Arc::new(Mutex::new(MatchingEngine::new(&symbols)));
        engine.lock().await.set_mid("BTCUSDT", 50_000.0, None);

        let gw = PaperGateway::new(engine.clone());
        let fill = gw.place(OrderRequest::market("BTCUSDT", Side::Buy, 1.0)).await.unwrap();
        assert_eq!(fill.fill_price, 50_000.0);
        assert!(engine.lock().await.position("BTCUSDT").is_some());
    }

    #[tokio::test]
    async fn live_gateway_is_a_stub() {
        let gw = LiveGateway;
        let err = gw.place(OrderRequest::market("BTCUSDT", Side::Buy, 1.0)).await.unwrap_err();
        assert!(matches!(err, EngineError::LiveUnsupported));
    }
}
