// ===============================
// src/decision.rs (decision-provider boundary)
// ===============================
//
// The reasoning service is an external collaborator: it is handed the
// current state bundle and returns a structured trade intent. Transient
// transport errors are retried with exponential backoff (honoring
// Retry-After); a malformed response fails fast and is never coerced
// into core state.
//

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

use crate::domain::{AccountSnapshot, Order, PairCandidate, PairView, PositionView};
use crate::metrics::DECIDER_RETRIES;

#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("decision request failed after {attempts} attempts: {last}")]
    Transport { attempts: u32, last: String },
    #[error("invalid decision response: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeSignal {
    Enter,
    Exit,
    Reduce,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntentPair {
    pub long_symbol: String,
    pub short_symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spread_z: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub half_life: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sizing {
    pub long_size_usd: f64,
    pub short_size_usd: f64,
    pub leverage: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskControls {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reduce_fraction: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss_z: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_holding_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionIntent {
    pub signal: TradeSignal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pair: Option<IntentPair>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sizing: Option<Sizing>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskControls>,
    #[serde(default)]
    pub rationale: Vec<String>,
}

impl DecisionIntent {
    pub fn none() -> Self {
        Self { signal: TradeSignal::None, pair: None, sizing: None, risk: None, rationale: Vec::new() }
    }
}

/// State bundle handed to the provider each cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionContext {
    pub ts: i64,
    pub account: AccountSnapshot,
    pub positions: Vec<PositionView>,
    pub recent_orders: Vec<Order>,
    pub open_pairs: Vec<PairView>,
    pub candidates: Vec<PairCandidate>,
}

pub trait DecisionProvider {
    fn decide(
        &self,
        ctx: &DecisionContext,
    ) -> impl Future<Output = Result<DecisionIntent, DecisionError>> + Send;
}

pub struct HttpDecisionProvider {
    client: reqwest::Client,
    url: String,
    max_attempts: u32,
}

impl HttpDecisionProvider {
    pub fn new(url: &str, timeout: Duration, max_attempts: u32) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| panic!("decision http client build failed: {}", e));
        Self { client, url: url.to_string(), max_attempts: max_attempts.max(1) }
    }

    fn backoff_ms(attempt: u32) -> u64 {
        let shift = attempt.min(5);
        500u64.saturating_mul(1 << shift) // 0.5s, 1s, 2s, ...
    }
}

impl DecisionProvider for HttpDecisionProvider {
    async fn decide(&self, ctx: &DecisionContext) -> Result<DecisionIntent, DecisionError> {
        let mut last_err = String::new();

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                DECIDER_RETRIES.inc();
            }

            let resp = match self.client.post(&self.url).json(ctx).send().await {
                Ok(r) => r,
                Err(e) => {
                    last_err = e.to_string();
                    warn!(attempt, err = %last_err, "decision request failed");
                    sleep(Duration::from_millis(Self::backoff_ms(attempt))).await;
                    continue;
                }
            };

            let status = resp.status();
            if status.is_server_error() || status.as_u16() == 429 {
                // transient: honor Retry-After when the server sends one
                let retry_after_ms = resp
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(|secs| secs * 1_000)
                    .unwrap_or_else(|| Self::backoff_ms(attempt));
                last_err = format!("status {}", status);
                warn!(attempt, %status, retry_after_ms, "decision provider busy");
                sleep(Duration::from_millis(retry_after_ms)).await;
                continue;
            }
            if !status.is_success() {
                // non-retryable: treat as a boundary validation failure
                return Err(DecisionError::Invalid(format!("status {}", status)));
            }

            let body = resp
                .text()
                .await
                .map_err(|e| DecisionError::Invalid(format!("unreadable body: {e}")))?;
            return serde_json::from_str::<DecisionIntent>(&body)
                .map_err(|e| DecisionError::Invalid(format!("malformed intent: {e}")));
        }

        Err(DecisionError::Transport { attempts: self.max_attempts, last: last_err })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_parses_wire_shape() {
        let intent: DecisionIntent = serde_json::from_str(
            r#"{
                "signal": "ENTER",
                "pair": {"longSymbol": "ADAUSDT", "shortSymbol": "NEARUSDT", "spreadZ": -1.47},
                "sizing": {"longSizeUsd": 500.0, "shortSizeUsd": 500.0, "leverage": 3},
                "rationale": ["spread stretched", "half-life ok"]
            }"#,
        )
        .unwrap();
        assert_eq!(intent.signal, TradeSignal::Enter);
        assert_eq!(intent.pair.unwrap().long_symbol, "ADAUSDT");
        assert_eq!(intent.sizing.unwrap().leverage, 3);
        assert_eq!(intent.rationale.len(), 2);
    }

    #[test]
    fn malformed_signal_is_rejected_by_parsing() {
        let res = serde_json::from_str::<DecisionIntent>(r#"{"signal": "YOLO"}"#);
        assert!(res.is_err());
    }

    #[test]
    fn backoff_grows_and_caps() {
        assert_eq!(HttpDecisionProvider::backoff_ms(0), 500);
        assert_eq!(HttpDecisionProvider::backoff_ms(2), 2_000);
        assert_eq!(HttpDecisionProvider::backoff_ms(9), 16_000);
    }
}
