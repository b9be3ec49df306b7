//! Admission control and request relay for an LLM gateway.
//!
//! A request passes through credential authentication, the per-product access policy, token
//! estimation and an ordered throttle chain before it reaches the upstream [`Backend`]. What the
//! request actually consumed is settled back into the throttles once the response (or stream)
//! finishes.

pub mod auth;
pub mod catalog;
pub mod config;
pub mod counter_store;
pub mod metrics;
#[cfg(feature = "gateway-cli")]
pub mod observability;
pub mod pipeline;
pub mod policy;
#[cfg(feature = "gateway-store-redis")]
pub mod redis_store;
pub mod relay;
pub mod runner;
pub mod telemetry;
pub mod throttle;
pub mod token_bucket;
pub mod token_count;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use auth::{AuthMethod, AuthService, AuthenticatedIdentity, CredentialRecord, CredentialStore};
pub use catalog::{ModelCatalog, ModelInfo};
pub use config::{GatewayConfig, ThrottleConfig};
pub use counter_store::{MemoryCounterStore, SharedCounterStore, StoreError, StorePool};
pub use metrics::{MetricsHandle, MetricsSnapshot, StreamOutcome};
pub use pipeline::{Gateway, GatewayBuilder};
pub use policy::{ProductAccessPolicy, ProductConfig};
#[cfg(feature = "gateway-store-redis")]
pub use redis_store::RedisStore;
pub use relay::{RelayStream, StreamRelay, UpstreamChunk, UpstreamError, UpstreamStream};
pub use runner::{Admission, ThrottleRunner};
pub use throttle::{
    RateKey, RatePeriod, RateSpec, RateThrottle, Settlement, Throttle, ThrottleContext,
    ThrottleResult, TokenBudgetThrottle, Usage,
};
pub use token_count::TokenEstimator;

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

/// One inbound request, as the HTTP layer hands it over.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub request_id: String,
    #[serde(default, skip_serializing)]
    pub authorization: Option<String>,
    #[serde(default, skip_serializing)]
    pub x_api_key: Option<String>,
    pub product: String,
    pub model: String,
    /// OpenAI-style chat or responses body. Only read for estimation; passed to the backend as is.
    pub body: Value,
    #[serde(default)]
    pub stream: bool,
}

impl GatewayRequest {
    pub fn new(product: impl Into<String>, model: impl Into<String>, body: Value) -> Self {
        let stream = body
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Self {
            request_id: next_request_id(),
            authorization: None,
            x_api_key: None,
            product: product.into(),
            model: model.into(),
            body,
            stream,
        }
    }

    pub fn with_bearer(mut self, token: impl AsRef<str>) -> Self {
        self.authorization = Some(format!("Bearer {}", token.as_ref()));
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.x_api_key = Some(key.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

fn next_request_id() -> String {
    let seq = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("req-{:x}-{seq}", SystemClock.now_epoch_millis())
}

/// What the backend sees: the admitted request plus who sent it.
#[derive(Clone, Debug)]
pub struct BackendRequest {
    pub request_id: String,
    pub identity: Arc<AuthenticatedIdentity>,
    pub product: String,
    pub model: String,
    pub body: Value,
    pub stream: bool,
}

pub enum BackendResponse {
    Complete { body: Value, usage: Option<Usage> },
    Stream(UpstreamStream),
}

impl std::fmt::Debug for BackendResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete { body, usage } => f
                .debug_struct("Complete")
                .field("body", body)
                .field("usage", usage)
                .finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

pub enum GatewayResponse {
    Complete { body: Value, usage: Option<Usage> },
    /// SSE frames, ready for the wire.
    Stream(RelayStream),
}

impl std::fmt::Debug for GatewayResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete { body, usage } => f
                .debug_struct("Complete")
                .field("body", body)
                .field("usage", usage)
                .finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("access denied: {reason}")]
    AccessDenied { reason: String },
    #[error("rate limited by {scope}: {detail}")]
    RateLimited {
        scope: String,
        detail: String,
        retry_after_seconds: Option<u64>,
    },
    #[error("upstream error: {message}")]
    Upstream { status: Option<u16>, message: String },
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },
}

impl GatewayError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::AccessDenied { .. } => 403,
            Self::RateLimited { .. } => 429,
            Self::Upstream { status, .. } => status
                .filter(|status| (400..=599).contains(status))
                .unwrap_or(502),
            Self::InvalidRequest { .. } => 400,
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Unauthorized => "authentication_error",
            Self::AccessDenied { .. } => "permission_error",
            Self::RateLimited { .. } => "rate_limit_error",
            Self::Upstream { .. } => "upstream_error",
            Self::InvalidRequest { .. } => "invalid_request_error",
        }
    }

    /// OpenAI-compatible error body.
    pub fn to_body(&self) -> Value {
        serde_json::json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
            }
        })
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn call(&self, request: &BackendRequest) -> Result<BackendResponse, UpstreamError>;
}

pub trait Clock: Send + Sync {
    fn now_epoch_millis(&self) -> u64;

    fn now_epoch_seconds(&self) -> u64 {
        self.now_epoch_millis() / 1000
    }
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_epoch_millis(&self) -> u64 {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_else(|_| std::time::Duration::from_secs(0));
        u64::try_from(now.as_millis()).unwrap_or(u64::MAX)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(now_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn advance_millis(&self, millis: u64) {
        self.now_ms.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set_millis(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_epoch_millis(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_status_codes() {
        assert_eq!(GatewayError::Unauthorized.status_code(), 401);
        assert_eq!(
            GatewayError::AccessDenied {
                reason: "no".to_string()
            }
            .status_code(),
            403
        );
        let upstream = |status| GatewayError::Upstream {
            status,
            message: "boom".to_string(),
        };
        assert_eq!(upstream(Some(503)).status_code(), 503);
        assert_eq!(upstream(Some(200)).status_code(), 502);
        assert_eq!(upstream(None).status_code(), 502);

        let body = GatewayError::RateLimited {
            scope: "rate".to_string(),
            detail: "slow down".to_string(),
            retry_after_seconds: Some(1),
        }
        .to_body();
        assert_eq!(body["error"]["type"], "rate_limit_error");
    }

    #[test]
    fn request_picks_up_stream_flag_and_unique_ids() {
        let a = GatewayRequest::new("p", "m", serde_json::json!({"stream": true}));
        let b = GatewayRequest::new("p", "m", serde_json::json!({}));
        assert!(a.stream);
        assert!(!b.stream);
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(1_500);
        assert_eq!(clock.now_epoch_seconds(), 1);
        clock.advance_millis(600);
        assert_eq!(clock.now_epoch_millis(), 2_100);
        clock.set_millis(0);
        assert_eq!(clock.now_epoch_seconds(), 0);
    }
}
