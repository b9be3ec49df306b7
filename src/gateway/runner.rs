use std::sync::Arc;

use super::metrics::MetricsHandle;
use super::throttle::{Settlement, Throttle, ThrottleContext, ThrottleResult};

/// Proof that every throttle in the chain admitted a request. Settling consumes it, so a
/// request cannot be settled twice.
#[derive(Debug)]
#[must_use = "an admission must be settled or its reservations stay charged"]
pub struct Admission {
    ctx: ThrottleContext,
    reached: usize,
}

impl Admission {
    pub fn context(&self) -> &ThrottleContext {
        &self.ctx
    }

    /// How many throttles were consulted; all of them allowed.
    pub fn reached(&self) -> usize {
        self.reached
    }
}

/// Ordered throttle chain. The first denial short-circuits: later throttles are never asked and
/// never settled, and earlier ones have their reservations cancelled.
#[derive(Clone, Default)]
pub struct ThrottleRunner {
    throttles: Vec<Arc<dyn Throttle>>,
    metrics: MetricsHandle,
}

impl std::fmt::Debug for ThrottleRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleRunner")
            .field("throttles", &self.names())
            .finish()
    }
}

impl ThrottleRunner {
    pub fn new(throttles: Vec<Arc<dyn Throttle>>) -> Self {
        Self {
            throttles,
            metrics: MetricsHandle::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.throttles.iter().map(|throttle| throttle.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.throttles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.throttles.is_empty()
    }

    pub async fn check(&self, ctx: ThrottleContext) -> Result<Admission, ThrottleResult> {
        for (index, throttle) in self.throttles.iter().enumerate() {
            let result = throttle.allow(&ctx).await;
            if result.allowed {
                continue;
            }

            tracing::info!(
                request_id = %ctx.request_id,
                scope = %result.scope,
                user_id = %ctx.identity.user_id,
                product = %ctx.product,
                model = %ctx.model,
                "request throttled"
            );
            self.metrics
                .record(|metrics| metrics.record_throttle_denied(&result.scope));
            for earlier in &self.throttles[..index] {
                earlier.settle(&ctx, &Settlement::Cancelled).await;
            }
            return Err(result);
        }
        Ok(Admission {
            reached: self.throttles.len(),
            ctx,
        })
    }

    pub async fn settle(&self, admission: Admission, settlement: Settlement) {
        let reached = admission.reached.min(self.throttles.len());
        for throttle in &self.throttles[..reached] {
            throttle.settle(&admission.ctx, &settlement).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::gateway::auth::{AuthMethod, AuthenticatedIdentity};
    use crate::gateway::throttle::Usage;

    #[derive(Default)]
    struct Log(Mutex<Vec<String>>);

    impl Log {
        fn push(&self, entry: String) {
            self.0.lock().unwrap().push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }
    }

    struct Fixed {
        name: &'static str,
        allow: bool,
        log: Arc<Log>,
    }

    #[async_trait]
    impl Throttle for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn allow(&self, _ctx: &ThrottleContext) -> ThrottleResult {
            self.log.push(format!("allow:{}", self.name));
            if self.allow {
                ThrottleResult::allow(self.name)
            } else {
                ThrottleResult::deny(self.name, "no", Some(1))
            }
        }

        async fn settle(&self, _ctx: &ThrottleContext, settlement: &Settlement) {
            let kind = match settlement {
                Settlement::Actual(_) => "actual",
                Settlement::Cancelled => "cancelled",
                Settlement::Unknown => "unknown",
                Settlement::Interrupted(_) => "interrupted",
            };
            self.log.push(format!("settle:{}:{kind}", self.name));
        }
    }

    fn ctx() -> ThrottleContext {
        ThrottleContext::new(
            Arc::new(AuthenticatedIdentity {
                user_id: "u".to_string(),
                tenant_id: "t".to_string(),
                auth_method: AuthMethod::ApiKey,
                scopes: Vec::new(),
                application_id: None,
                expires_at_ms: None,
            }),
            "p",
            "m",
            1,
            1,
            "req",
        )
    }

    fn runner(allows: &[(&'static str, bool)], log: &Arc<Log>) -> ThrottleRunner {
        let throttles = allows
            .iter()
            .map(|&(name, allow)| {
                Arc::new(Fixed {
                    name,
                    allow,
                    log: log.clone(),
                }) as Arc<dyn Throttle>
            })
            .collect();
        ThrottleRunner::new(throttles)
    }

    #[tokio::test]
    async fn first_denial_short_circuits_and_cancels_earlier() {
        let log = Arc::new(Log::default());
        let metrics = MetricsHandle::default();
        let runner = runner(&[("a", true), ("b", false), ("c", true)], &log)
            .with_metrics(metrics.clone());

        let denied = runner.check(ctx()).await.expect_err("denied");
        assert_eq!(denied.scope, "b");
        assert_eq!(denied.status, 429);
        assert_eq!(log.entries(), vec!["allow:a", "allow:b", "settle:a:cancelled"]);
        assert_eq!(
            metrics.snapshot().throttle_denied_by_scope.get("b"),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn settles_every_reached_throttle_in_order() {
        let log = Arc::new(Log::default());
        let runner = runner(&[("a", true), ("b", true)], &log);

        let admission = runner.check(ctx()).await.expect("admitted");
        assert_eq!(admission.reached(), 2);
        runner
            .settle(admission, Settlement::Actual(Usage::default()))
            .await;
        assert_eq!(
            log.entries(),
            vec!["allow:a", "allow:b", "settle:a:actual", "settle:b:actual"]
        );
    }

    #[tokio::test]
    async fn empty_chain_admits() {
        let runner = ThrottleRunner::default();
        let admission = runner.check(ctx()).await.expect("admitted");
        assert_eq!(admission.reached(), 0);
        runner.settle(admission, Settlement::Unknown).await;
    }
}
