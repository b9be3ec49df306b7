//! Admission throttles: a fixed-rate limiter and the per-user / per-product token budgets.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::auth::AuthenticatedIdentity;
use super::catalog::ModelCatalog;
use super::counter_store::{DEFAULT_STORE_OP_TIMEOUT, SharedCounterStore, StoreError, with_deadline};
use super::metrics::MetricsHandle;
use super::token_bucket::TokenBucket;
use super::{Clock, SystemClock};

const RESERVATION_TTL_MS: u64 = 60 * 60 * 1000;
const RESERVATION_PURGE_INTERVAL_MS: u64 = 60 * 1000;

static NEXT_ADMISSION_ID: AtomicU64 = AtomicU64::new(1);

/// Everything a throttle may look at. Each context gets a process-unique admission id that
/// keys reservations; `request_id` comes from the caller and is only used for logging.
#[derive(Clone, Debug)]
pub struct ThrottleContext {
    pub identity: Arc<AuthenticatedIdentity>,
    pub product: String,
    pub model: String,
    pub estimated_input_tokens: u64,
    pub estimated_max_output_tokens: u64,
    pub request_id: String,
    admission_id: u64,
}

impl ThrottleContext {
    pub fn new(
        identity: Arc<AuthenticatedIdentity>,
        product: impl Into<String>,
        model: impl Into<String>,
        estimated_input_tokens: u64,
        estimated_max_output_tokens: u64,
        request_id: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            product: product.into(),
            model: model.into(),
            estimated_input_tokens,
            estimated_max_output_tokens,
            request_id: request_id.into(),
            admission_id: NEXT_ADMISSION_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn admission_id(&self) -> u64 {
        self.admission_id
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThrottleResult {
    pub allowed: bool,
    pub status: u16,
    pub detail: String,
    pub scope: String,
    pub retry_after_seconds: Option<u64>,
}

impl ThrottleResult {
    pub fn allow(scope: impl Into<String>) -> Self {
        Self {
            allowed: true,
            status: 200,
            detail: String::new(),
            scope: scope.into(),
            retry_after_seconds: None,
        }
    }

    pub fn deny(
        scope: impl Into<String>,
        detail: impl Into<String>,
        retry_after_seconds: Option<u64>,
    ) -> Self {
        Self {
            allowed: false,
            status: 429,
            detail: detail.into(),
            scope: scope.into(),
            retry_after_seconds,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: Option<u64>,
    #[serde(default)]
    pub output_tokens: u64,
}

/// What happened to a request after admission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Settlement {
    /// The upstream call finished and reported (or the relay observed) this usage.
    Actual(Usage),
    /// Nothing was consumed upstream; every reservation is returned.
    Cancelled,
    /// The outcome is unknown (e.g. the stream broke before usage was seen). Reservations stay
    /// charged.
    Unknown,
    /// The upstream failed after reporting this usage. Unused reservation is returned but
    /// nothing beyond the reservation is charged.
    Interrupted(Usage),
}

#[async_trait]
pub trait Throttle: Send + Sync {
    fn name(&self) -> &str;

    async fn allow(&self, ctx: &ThrottleContext) -> ThrottleResult;

    async fn settle(&self, _ctx: &ThrottleContext, _settlement: &Settlement) {}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateSpecError {
    #[error("rate spec must look like N/period: {0:?}")]
    Malformed(String),
    #[error("invalid rate limit count: {0:?}")]
    InvalidCount(String),
    #[error("unknown rate period {0:?} (expected second, minute, hour or day)")]
    UnknownPeriod(String),
}

/// Length of a rate window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RatePeriod {
    Second,
    Minute,
    Hour,
    Day,
}

impl RatePeriod {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(match self {
            Self::Second => 1,
            Self::Minute => 60,
            Self::Hour => 60 * 60,
            Self::Day => 24 * 60 * 60,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }
}

impl FromStr for RatePeriod {
    type Err = RateSpecError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "s" | "sec" | "second" | "seconds" => Ok(Self::Second),
            "m" | "min" | "minute" | "minutes" => Ok(Self::Minute),
            "h" | "hour" | "hours" => Ok(Self::Hour),
            "d" | "day" | "days" => Ok(Self::Day),
            other => Err(RateSpecError::UnknownPeriod(other.to_string())),
        }
    }
}

/// `"N/period"` where period is one of second, minute, hour or day.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RateSpec {
    pub limit: u64,
    pub period: Duration,
    unit: RatePeriod,
}

impl RateSpec {
    pub fn new(limit: u64, unit: RatePeriod) -> Self {
        Self {
            limit,
            period: unit.duration(),
            unit,
        }
    }

    pub fn unit(&self) -> RatePeriod {
        self.unit
    }

    pub fn capacity(&self) -> f64 {
        self.limit as f64
    }

    pub fn rate_per_sec(&self) -> f64 {
        let secs = self.period.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.limit as f64 / secs
    }

    pub fn period_millis(&self) -> u64 {
        u64::try_from(self.period.as_millis())
            .unwrap_or(u64::MAX)
            .max(1)
    }

    /// Seconds until one unit of budget refills.
    pub fn retry_after_seconds(&self) -> u64 {
        if self.limit == 0 {
            return self.period.as_secs().max(1);
        }
        (self.period.as_secs_f64() / self.limit as f64).ceil().max(1.0) as u64
    }

}

impl FromStr for RateSpec {
    type Err = RateSpecError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let Some((count, period)) = raw.trim().split_once('/') else {
            return Err(RateSpecError::Malformed(raw.to_string()));
        };
        let limit = count
            .trim()
            .parse::<u64>()
            .map_err(|_| RateSpecError::InvalidCount(count.trim().to_string()))?;
        Ok(Self::new(limit, period.parse()?))
    }
}

impl TryFrom<String> for RateSpec {
    type Error = RateSpecError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl From<RateSpec> for String {
    fn from(spec: RateSpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.limit, self.unit.as_str())
    }
}

/// Which part of the request a rate throttle counts against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateKey {
    #[default]
    User,
    Tenant,
    Product,
    UserModel,
    Application,
}

impl RateKey {
    pub fn key(&self, ctx: &ThrottleContext) -> String {
        match self {
            Self::User => ctx.identity.user_id.clone(),
            Self::Tenant => ctx.identity.tenant_id.clone(),
            Self::Product => ctx.product.clone(),
            Self::UserModel => format!("{}:{}", ctx.identity.user_id, ctx.model),
            Self::Application => ctx
                .identity
                .application_id
                .clone()
                .unwrap_or_else(|| ctx.identity.user_id.clone()),
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Tenant => "tenant",
            Self::Product => "product",
            Self::UserModel => "user_model",
            Self::Application => "application",
        }
    }
}

/// Plain requests-per-period limiting. Purely local, so it belongs at the front of the chain.
#[derive(Debug)]
pub struct RateThrottle {
    name: String,
    spec: RateSpec,
    key: RateKey,
    bucket: TokenBucket,
}

impl RateThrottle {
    pub fn new(name: impl Into<String>, spec: RateSpec, key: RateKey) -> Self {
        Self::with_clock(name, spec, key, Arc::new(SystemClock))
    }

    pub fn with_clock(
        name: impl Into<String>,
        spec: RateSpec,
        key: RateKey,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            spec,
            key,
            bucket: TokenBucket::with_clock(spec.capacity(), spec.rate_per_sec(), clock),
        }
    }

    pub fn spec(&self) -> RateSpec {
        self.spec
    }
}

#[async_trait]
impl Throttle for RateThrottle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn allow(&self, ctx: &ThrottleContext) -> ThrottleResult {
        if self.bucket.consume(&self.key.key(ctx), 1.0) {
            return ThrottleResult::allow(&self.name);
        }
        ThrottleResult::deny(
            &self.name,
            format!(
                "rate limit of {} per {} exceeded",
                self.spec,
                self.key.as_str()
            ),
            Some(self.spec.retry_after_seconds()),
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    User,
    Product,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetDirection {
    Input,
    Output,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetUnit {
    #[default]
    Tokens,
    UsdMicros,
}

#[derive(Clone, Debug)]
enum ReservationPath {
    Local { bucket_key: String },
    Shared { counter_key: String, period: Duration },
}

#[derive(Clone, Debug)]
struct Reservation {
    model: String,
    amount: f64,
    path: ReservationPath,
    created_at_ms: u64,
}

#[derive(Debug, Default)]
struct Reservations {
    by_admission: HashMap<u64, Reservation>,
    last_purge_ms: u64,
}

struct SharedBudget {
    store: Arc<dyn SharedCounterStore>,
    prefix: String,
}

/// Reserves an estimate of input or output tokens per `(scope id, model)` on admission and
/// trues it up against actual usage on settlement.
///
/// With a [`SharedCounterStore`] configured the reservation goes to a fixed-window counter
/// shared by every instance; when the store fails the throttle degrades to its local bucket
/// and records the fallback.
pub struct TokenBudgetThrottle {
    name: String,
    scope: BudgetScope,
    direction: BudgetDirection,
    unit: BudgetUnit,
    default_limit: RateSpec,
    default_bucket: TokenBucket,
    model_limits: HashMap<String, (RateSpec, TokenBucket)>,
    shared: Option<SharedBudget>,
    catalog: Option<Arc<ModelCatalog>>,
    metrics: MetricsHandle,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
    reservations: Mutex<Reservations>,
}

impl fmt::Debug for TokenBudgetThrottle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBudgetThrottle")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("direction", &self.direction)
            .field("unit", &self.unit)
            .field("default_limit", &self.default_limit)
            .field("model_limits", &self.model_limits.keys().collect::<Vec<_>>())
            .field("shared", &self.shared.as_ref().map(|shared| shared.store.name()))
            .finish()
    }
}

impl TokenBudgetThrottle {
    pub fn new(
        scope: BudgetScope,
        direction: BudgetDirection,
        limit: RateSpec,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let name = match (scope, direction) {
            (BudgetScope::User, BudgetDirection::Input) => "user_input_tokens",
            (BudgetScope::User, BudgetDirection::Output) => "user_output_tokens",
            (BudgetScope::Product, BudgetDirection::Input) => "product_input_tokens",
            (BudgetScope::Product, BudgetDirection::Output) => "product_output_tokens",
        };
        Self {
            name: name.to_string(),
            scope,
            direction,
            unit: BudgetUnit::Tokens,
            default_limit: limit,
            default_bucket: TokenBucket::with_clock(
                limit.capacity(),
                limit.rate_per_sec(),
                clock.clone(),
            ),
            model_limits: HashMap::new(),
            shared: None,
            catalog: None,
            metrics: MetricsHandle::default(),
            clock,
            store_timeout: DEFAULT_STORE_OP_TIMEOUT,
            reservations: Mutex::new(Reservations::default()),
        }
    }

    pub fn user_input(limit: RateSpec) -> Self {
        Self::new(BudgetScope::User, BudgetDirection::Input, limit, Arc::new(SystemClock))
    }

    pub fn user_output(limit: RateSpec) -> Self {
        Self::new(BudgetScope::User, BudgetDirection::Output, limit, Arc::new(SystemClock))
    }

    pub fn product_input(limit: RateSpec) -> Self {
        Self::new(BudgetScope::Product, BudgetDirection::Input, limit, Arc::new(SystemClock))
    }

    pub fn product_output(limit: RateSpec) -> Self {
        Self::new(BudgetScope::Product, BudgetDirection::Output, limit, Arc::new(SystemClock))
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_model_limit(mut self, model: impl Into<String>, limit: RateSpec) -> Self {
        let bucket =
            TokenBucket::with_clock(limit.capacity(), limit.rate_per_sec(), self.clock.clone());
        self.model_limits.insert(model.into(), (limit, bucket));
        self
    }

    pub fn with_unit(mut self, unit: BudgetUnit, catalog: Arc<ModelCatalog>) -> Self {
        self.unit = unit;
        self.catalog = Some(catalog);
        self
    }

    pub fn with_shared_store(
        mut self,
        store: Arc<dyn SharedCounterStore>,
        prefix: impl Into<String>,
    ) -> Self {
        self.shared = Some(SharedBudget {
            store,
            prefix: prefix.into(),
        });
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = metrics;
        self
    }

    /// Upper bound on each shared-store call. A store that does not answer in time is treated
    /// as unavailable and the local bucket takes over.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Remaining local budget for a scope id and model. Ignores the shared store.
    pub fn local_remaining(&self, scope_id: &str, model: &str) -> f64 {
        let (_, bucket) = self.limit_for(model);
        bucket.remaining(&format!("{scope_id}:{model}"))
    }

    fn scope_id<'a>(&self, ctx: &'a ThrottleContext) -> &'a str {
        match self.scope {
            BudgetScope::User => &ctx.identity.user_id,
            BudgetScope::Product => &ctx.product,
        }
    }

    fn limit_for(&self, model: &str) -> (&RateSpec, &TokenBucket) {
        match self.model_limits.get(model) {
            Some((spec, bucket)) => (spec, bucket),
            None => (&self.default_limit, &self.default_bucket),
        }
    }

    fn estimated_tokens(&self, ctx: &ThrottleContext) -> u64 {
        match self.direction {
            BudgetDirection::Input => ctx.estimated_input_tokens,
            BudgetDirection::Output => ctx.estimated_max_output_tokens,
        }
    }

    fn actual_tokens(&self, ctx: &ThrottleContext, usage: &Usage) -> u64 {
        match self.direction {
            // Providers that do not report input usage keep the pre-flight estimate.
            BudgetDirection::Input => usage.input_tokens.unwrap_or(ctx.estimated_input_tokens),
            BudgetDirection::Output => usage.output_tokens,
        }
    }

    fn charge(&self, model: &str, tokens: u64) -> f64 {
        match self.unit {
            BudgetUnit::Tokens => tokens as f64,
            BudgetUnit::UsdMicros => {
                let Some(info) = self.catalog.as_ref().and_then(|catalog| catalog.get(model))
                else {
                    tracing::debug!(throttle = %self.name, model, "no price for model; charging zero");
                    return 0.0;
                };
                let per_token = match self.direction {
                    BudgetDirection::Input => info.input_usd_micros_per_token,
                    BudgetDirection::Output => info.output_usd_micros_per_token,
                };
                tokens as f64 * per_token
            }
        }
    }

    fn remember(&self, admission_id: u64, reservation: Reservation) {
        let now = reservation.created_at_ms;
        let mut reservations = self
            .reservations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if now.saturating_sub(reservations.last_purge_ms) >= RESERVATION_PURGE_INTERVAL_MS {
            // Requests that were never settled must not pin memory forever.
            reservations
                .by_admission
                .retain(|_, held| now.saturating_sub(held.created_at_ms) < RESERVATION_TTL_MS);
            reservations.last_purge_ms = now;
        }
        reservations.by_admission.insert(admission_id, reservation);
    }

    fn take(&self, admission_id: u64) -> Option<Reservation> {
        self.reservations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .by_admission
            .remove(&admission_id)
    }

    async fn store_increment(
        &self,
        store: &dyn SharedCounterStore,
        key: &str,
        amount: i64,
        ttl: Duration,
    ) -> Result<i64, StoreError> {
        with_deadline(self.store_timeout, store.increment(key, amount, ttl)).await
    }

    async fn store_decrement(
        &self,
        store: &dyn SharedCounterStore,
        key: &str,
        amount: i64,
    ) -> Result<i64, StoreError> {
        with_deadline(self.store_timeout, store.decrement(key, amount)).await
    }

    fn counter_key(
        &self,
        prefix: &str,
        ctx: &ThrottleContext,
        limit: &RateSpec,
        now: u64,
    ) -> String {
        let window = now / limit.period_millis();
        format!(
            "{prefix}:budget:{}:{}:{}:{window}",
            self.name,
            self.scope_id(ctx),
            ctx.model
        )
    }

    fn deny(&self, ctx: &ThrottleContext, limit: &RateSpec, amount: f64) -> ThrottleResult {
        let unit = match self.unit {
            BudgetUnit::Tokens => "tokens",
            BudgetUnit::UsdMicros => "usd_micros",
        };
        ThrottleResult::deny(
            &self.name,
            format!(
                "{} budget of {limit} {unit} exhausted for model {} (requested {})",
                self.name,
                ctx.model,
                amount.ceil()
            ),
            Some(limit.retry_after_seconds()),
        )
    }

    async fn try_shared(
        &self,
        shared: &SharedBudget,
        ctx: &ThrottleContext,
        limit: &RateSpec,
        amount: f64,
        now: u64,
    ) -> Option<Result<ReservationPath, ()>> {
        let counter_key = self.counter_key(&shared.prefix, ctx, limit, now);
        let units = to_units(amount);
        match self
            .store_increment(shared.store.as_ref(), &counter_key, units, limit.period)
            .await
        {
            Ok(value) if value <= i64::try_from(limit.limit).unwrap_or(i64::MAX) => {
                Some(Ok(ReservationPath::Shared {
                    counter_key,
                    period: limit.period,
                }))
            }
            Ok(_) => {
                if let Err(err) = self
                    .store_decrement(shared.store.as_ref(), &counter_key, units)
                    .await
                {
                    tracing::warn!(throttle = %self.name, error = %err, "failed to revert denied shared reservation");
                    self.record_store_error(&err);
                }
                Some(Err(()))
            }
            Err(err) => {
                tracing::warn!(
                    throttle = %self.name,
                    store = shared.store.name(),
                    error = %err,
                    "shared counter store unavailable; using local budget"
                );
                self.record_store_error(&err);
                None
            }
        }
    }

    fn record_store_error(&self, err: &StoreError) {
        let pool_exhausted = err.is_pool_exhausted();
        self.metrics.record(|metrics| {
            metrics.record_store_fallback(&self.name);
            if pool_exhausted {
                metrics.record_store_pool_exhausted("counter");
            }
        });
    }

    async fn give_back(&self, reservation: &Reservation, amount: f64) {
        match &reservation.path {
            ReservationPath::Local { bucket_key } => {
                let (_, bucket) = self.limit_for(&reservation.model);
                bucket.release(bucket_key, amount);
            }
            ReservationPath::Shared { counter_key, .. } => {
                let Some(shared) = self.shared.as_ref() else {
                    return;
                };
                if let Err(err) = self
                    .store_decrement(shared.store.as_ref(), counter_key, to_units(amount))
                    .await
                {
                    tracing::warn!(throttle = %self.name, error = %err, "failed to release shared reservation");
                    self.record_store_error(&err);
                }
            }
        }
    }

    async fn charge_more(&self, reservation: &Reservation, amount: f64) {
        match &reservation.path {
            ReservationPath::Local { bucket_key } => {
                let (_, bucket) = self.limit_for(&reservation.model);
                bucket.debit(bucket_key, amount);
            }
            ReservationPath::Shared {
                counter_key,
                period,
            } => {
                let Some(shared) = self.shared.as_ref() else {
                    return;
                };
                let units = to_units(amount);
                if let Err(err) = self
                    .store_increment(shared.store.as_ref(), counter_key, units, *period)
                    .await
                {
                    tracing::warn!(throttle = %self.name, error = %err, "failed to debit shared overrun");
                    self.record_store_error(&err);
                }
            }
        }
    }
}

#[async_trait]
impl Throttle for TokenBudgetThrottle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn allow(&self, ctx: &ThrottleContext) -> ThrottleResult {
        let amount = self.charge(&ctx.model, self.estimated_tokens(ctx));
        let (limit, bucket) = self.limit_for(&ctx.model);
        let now = self.clock.now_epoch_millis();

        if amount <= 0.0 {
            // Nothing to reserve, but settlement still needs somewhere to debit an overrun.
            let path = match self.shared.as_ref() {
                Some(shared) => ReservationPath::Shared {
                    counter_key: self.counter_key(&shared.prefix, ctx, limit, now),
                    period: limit.period,
                },
                None => ReservationPath::Local {
                    bucket_key: format!("{}:{}", self.scope_id(ctx), ctx.model),
                },
            };
            self.remember(
                ctx.admission_id,
                Reservation {
                    model: ctx.model.clone(),
                    amount: 0.0,
                    path,
                    created_at_ms: now,
                },
            );
            return ThrottleResult::allow(&self.name);
        }

        if let Some(shared) = self.shared.as_ref() {
            match self.try_shared(shared, ctx, limit, amount, now).await {
                Some(Ok(path)) => {
                    self.remember(
                        ctx.admission_id,
                        Reservation {
                            model: ctx.model.clone(),
                            amount,
                            path,
                            created_at_ms: now,
                        },
                    );
                    return ThrottleResult::allow(&self.name);
                }
                Some(Err(())) => return self.deny(ctx, limit, amount),
                None => {}
            }
        }

        let bucket_key = format!("{}:{}", self.scope_id(ctx), ctx.model);
        if !bucket.consume(&bucket_key, amount) {
            return self.deny(ctx, limit, amount);
        }
        self.remember(
            ctx.admission_id,
            Reservation {
                model: ctx.model.clone(),
                amount,
                path: ReservationPath::Local { bucket_key },
                created_at_ms: now,
            },
        );
        ThrottleResult::allow(&self.name)
    }

    async fn settle(&self, ctx: &ThrottleContext, settlement: &Settlement) {
        let Some(reservation) = self.take(ctx.admission_id) else {
            return;
        };
        match settlement {
            Settlement::Unknown => {}
            Settlement::Cancelled => self.give_back(&reservation, reservation.amount).await,
            Settlement::Interrupted(usage) => {
                let actual = self.charge(&reservation.model, self.actual_tokens(ctx, usage));
                if actual < reservation.amount {
                    self.give_back(&reservation, reservation.amount - actual)
                        .await;
                }
            }
            Settlement::Actual(usage) => {
                let actual = self.charge(&reservation.model, self.actual_tokens(ctx, usage));
                if actual < reservation.amount {
                    self.give_back(&reservation, reservation.amount - actual)
                        .await;
                } else if actual > reservation.amount {
                    tracing::debug!(
                        throttle = %self.name,
                        request_id = %ctx.request_id,
                        reserved = reservation.amount,
                        actual,
                        "usage exceeded reservation; debiting overrun"
                    );
                    self.charge_more(&reservation, actual - reservation.amount)
                        .await;
                }
            }
        }
    }
}

fn to_units(amount: f64) -> i64 {
    let rounded = amount.ceil();
    if rounded >= i64::MAX as f64 {
        i64::MAX
    } else if rounded <= 0.0 {
        0
    } else {
        rounded as i64
    }
}
