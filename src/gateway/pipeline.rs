use std::fs;
use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use super::auth::{
    AuthCache, AuthService, Authenticator, CredentialStore, KeyAuthenticator,
    MemoryCredentialStore, SessionTokenAuthenticator, extract_credential,
};
use super::catalog::ModelCatalog;
use super::config::{GatewayConfig, ThrottleConfig};
use super::counter_store::{DEFAULT_STORE_OP_TIMEOUT, SharedCounterStore};
use super::metrics::{MetricsHandle, StreamOutcome};
use super::policy::ProductAccessPolicy;
use super::relay::{RelayOutcome, StreamRelay};
use super::runner::{Admission, ThrottleRunner};
use super::throttle::{
    BudgetUnit, RateThrottle, Settlement, Throttle, ThrottleContext, TokenBudgetThrottle, Usage,
};
use super::token_count::TokenEstimator;
use super::{
    Backend, BackendRequest, BackendResponse, Clock, GatewayError, GatewayRequest,
    GatewayResponse, SystemClock,
};
use crate::DittoError;

struct GatewayInner {
    auth: AuthService,
    policy: ProductAccessPolicy,
    estimator: TokenEstimator,
    runner: ThrottleRunner,
    relay: StreamRelay,
    catalog: Arc<ModelCatalog>,
    metrics: MetricsHandle,
    backend: Arc<dyn Backend>,
}

/// The admission pipeline in front of one upstream backend. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("throttles", &self.inner.runner)
            .field("models", &self.inner.catalog.len())
            .finish()
    }
}

impl Gateway {
    pub fn builder(config: GatewayConfig, backend: Arc<dyn Backend>) -> GatewayBuilder {
        GatewayBuilder::new(config, backend)
    }

    pub fn new(config: GatewayConfig, backend: Arc<dyn Backend>) -> crate::Result<Self> {
        GatewayBuilder::new(config, backend).build()
    }

    pub fn metrics(&self) -> &MetricsHandle {
        &self.inner.metrics
    }

    pub fn catalog(&self) -> &Arc<ModelCatalog> {
        &self.inner.catalog
    }

    pub fn policy(&self) -> &ProductAccessPolicy {
        &self.inner.policy
    }

    pub fn auth(&self) -> &AuthService {
        &self.inner.auth
    }

    pub fn runner(&self) -> &ThrottleRunner {
        &self.inner.runner
    }

    pub async fn handle(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
        let span = tracing::info_span!(
            "gateway_request",
            request_id = %request.request_id,
            product = %request.product,
            model = %request.model,
        );
        self.handle_inner(request).instrument(span).await
    }

    async fn handle_inner(
        &self,
        request: GatewayRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        let inner = &self.inner;

        let Some(credential) = extract_credential(
            request.authorization.as_deref(),
            request.x_api_key.as_deref(),
        ) else {
            tracing::warn!(auth_method = "missing", "request unauthenticated");
            inner
                .metrics
                .record(|metrics| metrics.record_auth_invalid("missing"));
            return Err(GatewayError::Unauthorized);
        };
        let outcome = inner.auth.authenticate_detailed(credential).await;
        let auth_method = outcome.method().map_or("unknown", |method| method.as_str());
        let Some(identity) = outcome.into_identity() else {
            tracing::warn!(auth_method, "request unauthenticated");
            return Err(GatewayError::Unauthorized);
        };
        inner.metrics.record(|metrics| {
            metrics.record_request(identity.auth_method.as_str(), &request.product)
        });

        let decision = inner.policy.check(
            &request.product,
            identity.auth_method,
            identity.application_id.as_deref(),
            &request.model,
        );
        if !decision.allowed {
            let reason = decision
                .reason
                .unwrap_or_else(|| "access denied".to_string());
            tracing::info!(user_id = %identity.user_id, %reason, "request denied by product policy");
            inner
                .metrics
                .record(|metrics| metrics.record_policy_denied(&request.product));
            return Err(GatewayError::AccessDenied { reason });
        }

        if request.stream
            && inner
                .catalog
                .get(&request.model)
                .is_some_and(|info| !info.supports_streaming)
        {
            return Err(GatewayError::InvalidRequest {
                reason: format!("model {} does not support streaming", request.model),
            });
        }

        let input = inner
            .estimator
            .estimate_request(&request.model, &request.body);
        let max_output = inner
            .estimator
            .estimate_max_output(&request.model, &request.body, input);
        let ctx = ThrottleContext::new(
            identity.clone(),
            request.product.clone(),
            request.model.clone(),
            input,
            max_output,
            request.request_id.clone(),
        );
        let admission = inner.runner.check(ctx).await.map_err(|denied| {
            GatewayError::RateLimited {
                scope: denied.scope,
                detail: denied.detail,
                retry_after_seconds: denied.retry_after_seconds,
            }
        })?;

        let backend_request = BackendRequest {
            request_id: request.request_id,
            identity,
            product: request.product,
            model: request.model,
            body: request.body,
            stream: request.stream,
        };

        match inner.backend.call(&backend_request).await {
            Err(err) => {
                tracing::warn!(status = ?err.status, error = %err, "upstream call failed");
                inner
                    .metrics
                    .record(|metrics| metrics.record_upstream_failure());
                inner.runner.settle(admission, Settlement::Cancelled).await;
                Err(GatewayError::Upstream {
                    status: err.status,
                    message: err.message,
                })
            }
            Ok(BackendResponse::Complete { body, usage }) => {
                inner.account(admission.context(), usage);
                let settlement = usage.map_or(Settlement::Unknown, Settlement::Actual);
                inner.runner.settle(admission, settlement).await;
                Ok(GatewayResponse::Complete { body, usage })
            }
            Ok(BackendResponse::Stream(upstream)) => {
                let finisher = self.inner.clone();
                let stream = inner.relay.relay(upstream, move |outcome| {
                    finisher.finish_stream(admission, outcome)
                });
                Ok(GatewayResponse::Stream(stream))
            }
        }
    }
}

impl GatewayInner {
    fn account(&self, ctx: &ThrottleContext, usage: Option<Usage>) {
        let Some(usage) = usage else {
            return;
        };
        let input = usage.input_tokens.unwrap_or(ctx.estimated_input_tokens);
        let cost = self
            .catalog
            .get(&ctx.model)
            .map(|info| info.cost_usd_micros(input, usage.output_tokens));
        self.metrics.record(|metrics| {
            metrics.record_tokens(&ctx.identity.user_id, input.saturating_add(usage.output_tokens));
            if let Some(cost) = cost {
                metrics.record_cost(&ctx.identity.tenant_id, cost);
            }
        });
    }

    /// Runs from the relay's completion hook, which may fire inside `Drop`; settlement is
    /// async, so it is handed to the runtime.
    fn finish_stream(self: Arc<Self>, admission: Admission, outcome: RelayOutcome) {
        self.account(admission.context(), outcome.usage);
        // A broken stream may have reported usage before failing; it never charges more than
        // was reserved.
        let settlement = match (outcome.outcome, outcome.usage) {
            (_, None) => Settlement::Unknown,
            (StreamOutcome::Completed, Some(usage)) => Settlement::Actual(usage),
            (StreamOutcome::Error | StreamOutcome::Aborted, Some(usage)) => {
                Settlement::Interrupted(usage)
            }
        };
        tracing::debug!(
            request_id = %admission.context().request_id,
            outcome = ?outcome.outcome,
            ?settlement,
            "stream finished"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    self.runner.settle(admission, settlement).await;
                });
            }
            Err(_) => {
                tracing::warn!(
                    request_id = %admission.context().request_id,
                    "no runtime to settle stream; reservations stay charged"
                );
                drop(admission);
            }
        }
    }
}

/// Assembles a [`Gateway`] from configuration. Stores, catalog and clock default to in-process
/// implementations and can be swapped before [`build`](Self::build).
pub struct GatewayBuilder {
    config: GatewayConfig,
    backend: Arc<dyn Backend>,
    credential_store: Option<Arc<dyn CredentialStore>>,
    counter_store: Option<Arc<dyn SharedCounterStore>>,
    catalog: Option<Arc<ModelCatalog>>,
    clock: Arc<dyn Clock>,
    extra_throttles: Vec<Arc<dyn Throttle>>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig, backend: Arc<dyn Backend>) -> Self {
        Self {
            config,
            backend,
            credential_store: None,
            counter_store: None,
            catalog: None,
            clock: Arc::new(SystemClock),
            extra_throttles: Vec::new(),
        }
    }

    /// Replaces the inline credential list from the config.
    pub fn credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credential_store = Some(store);
        self
    }

    /// Shared counters for budget throttles configured with `shared = true`.
    pub fn counter_store(mut self, store: Arc<dyn SharedCounterStore>) -> Self {
        self.counter_store = Some(store);
        self
    }

    /// Takes precedence over `catalog.litellm_pricing_path`.
    pub fn catalog(mut self, catalog: Arc<ModelCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Appended after the configured throttles.
    pub fn throttle(mut self, throttle: Arc<dyn Throttle>) -> Self {
        self.extra_throttles.push(throttle);
        self
    }

    pub fn build(self) -> crate::Result<Gateway> {
        let config = self.config;
        config.validate()?;
        let metrics = MetricsHandle::new(config.metrics.clone());
        let clock = self.clock;

        let catalog = match (self.catalog, config.catalog.litellm_pricing_path.as_ref()) {
            (Some(catalog), _) => catalog,
            (None, Some(path)) => {
                let raw = fs::read_to_string(path)?;
                let catalog = ModelCatalog::from_litellm_json_str(&raw).map_err(|err| {
                    DittoError::InvalidConfig(format!("pricing file {}: {err}", path.display()))
                })?;
                tracing::info!(models = catalog.len(), path = %path.display(), "loaded model catalog");
                Arc::new(catalog)
            }
            (None, None) => Arc::new(ModelCatalog::default()),
        };

        let credential_store = match self.credential_store {
            Some(store) => {
                if !config.credentials.is_empty() {
                    tracing::warn!(
                        store = store.name(),
                        "inline credentials ignored in favour of the configured credential store"
                    );
                }
                store
            }
            None => Arc::new(MemoryCredentialStore::from_records(
                config.credential_records(),
            )),
        };
        let authenticators: Vec<Arc<dyn Authenticator>> = vec![
            Arc::new(
                KeyAuthenticator::new(config.auth.api_key_prefix.clone())
                    .with_required_scope(config.auth.required_scope.clone())
                    .with_clock(clock.clone()),
            ),
            Arc::new(
                SessionTokenAuthenticator::new(
                    config.auth.session_token_prefix.clone(),
                    config.auth.required_scope.clone(),
                )
                .with_clock(clock.clone()),
            ),
        ];
        let auth = AuthService::new(
            authenticators,
            credential_store,
            AuthCache::with_clock(config.auth.cache.clone(), clock.clone()),
        )
        .with_metrics(metrics.clone());

        if config.debug_skip_application_check {
            tracing::warn!("application allow-lists are disabled; do not run this in production");
        }
        let policy = ProductAccessPolicy::new(config.product_map())
            .with_debug_skip_application_check(config.debug_skip_application_check);

        let prefix = config
            .redis
            .as_ref()
            .map(|redis| redis.prefix.clone())
            .unwrap_or_else(|| "ditto".to_string());
        let store_timeout = config
            .redis
            .as_ref()
            .map_or(DEFAULT_STORE_OP_TIMEOUT, |redis| {
                Duration::from_millis(redis.op_timeout_ms)
            });
        let mut throttles: Vec<Arc<dyn Throttle>> = Vec::with_capacity(config.throttles.len());
        for throttle in &config.throttles {
            let name = throttle.name();
            let built: Arc<dyn Throttle> = match throttle {
                ThrottleConfig::Rate { limit, key, .. } => {
                    Arc::new(RateThrottle::with_clock(name, *limit, *key, clock.clone()))
                }
                ThrottleConfig::Budget {
                    scope,
                    direction,
                    limit,
                    unit,
                    model_limits,
                    shared,
                    ..
                } => {
                    let mut budget =
                        TokenBudgetThrottle::new(*scope, *direction, *limit, clock.clone())
                            .with_name(name)
                            .with_metrics(metrics.clone());
                    for (model, model_limit) in model_limits {
                        budget = budget.with_model_limit(model.clone(), *model_limit);
                    }
                    if *unit == BudgetUnit::UsdMicros {
                        budget = budget.with_unit(*unit, catalog.clone());
                    }
                    if *shared {
                        if let Some(store) = self.counter_store.as_ref() {
                            budget = budget
                                .with_shared_store(store.clone(), prefix.clone())
                                .with_store_timeout(store_timeout);
                        }
                    }
                    Arc::new(budget)
                }
            };
            throttles.push(built);
        }
        throttles.extend(self.extra_throttles);
        let runner = ThrottleRunner::new(throttles).with_metrics(metrics.clone());
        tracing::info!(throttles = ?runner.names(), "admission chain ready");

        let estimator = TokenEstimator::new()
            .with_catalog(catalog.clone())
            .with_default_max_output_tokens(config.estimator.default_max_output_tokens);

        Ok(Gateway {
            inner: Arc::new(GatewayInner {
                auth,
                policy,
                estimator,
                runner,
                relay: StreamRelay::new(metrics.clone()),
                catalog,
                metrics,
                backend: self.backend,
            }),
        })
    }
}
