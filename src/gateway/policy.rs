use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use super::auth::AuthMethod;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductConfig {
    /// OAuth client ids allowed to call this product. `None` allows any.
    #[serde(default)]
    pub allowed_applications: Option<BTreeSet<String>>,
    /// Model names must start with one of these. `None` allows any model.
    #[serde(default)]
    pub allowed_model_prefixes: Option<Vec<String>>,
    #[serde(default = "default_allow_api_keys")]
    pub allow_api_keys: bool,
}

fn default_allow_api_keys() -> bool {
    true
}

impl Default for ProductConfig {
    fn default() -> Self {
        Self {
            allowed_applications: None,
            allowed_model_prefixes: None,
            allow_api_keys: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl PolicyDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Per-product allow-lists, checked after authentication and before any throttle.
#[derive(Debug, Default)]
pub struct ProductAccessPolicy {
    products: RwLock<Arc<HashMap<String, ProductConfig>>>,
    skip_application_check: bool,
}

impl ProductAccessPolicy {
    pub fn new(products: HashMap<String, ProductConfig>) -> Self {
        Self {
            products: RwLock::new(Arc::new(products)),
            skip_application_check: false,
        }
    }

    /// Development override: accept any OAuth client. Never enable in production.
    pub fn with_debug_skip_application_check(mut self, skip: bool) -> Self {
        self.skip_application_check = skip;
        self
    }

    pub fn refresh(&self, products: HashMap<String, ProductConfig>) {
        let next = Arc::new(products);
        match self.products.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    pub fn product(&self, product: &str) -> Option<ProductConfig> {
        self.snapshot().get(product).cloned()
    }

    /// Checks run in a fixed order and the first failure wins: unknown product, API keys
    /// disallowed, application not allowed, model not allowed.
    ///
    /// The application allow-list applies to session tokens and to any caller that presents an
    /// application id; plain API keys are governed by `allow_api_keys` alone.
    pub fn check(
        &self,
        product: &str,
        auth_method: AuthMethod,
        application_id: Option<&str>,
        model: &str,
    ) -> PolicyDecision {
        let products = self.snapshot();
        let Some(config) = products.get(product) else {
            return PolicyDecision::deny(format!("unknown product: {product}"));
        };

        if auth_method == AuthMethod::ApiKey && !config.allow_api_keys {
            return PolicyDecision::deny(format!("product {product} does not accept API keys"));
        }

        if let Some(allowed) = config.allowed_applications.as_ref() {
            let applies = auth_method == AuthMethod::SessionToken || application_id.is_some();
            if applies && !self.skip_application_check {
                let permitted = application_id.is_some_and(|id| allowed.contains(id));
                if !permitted {
                    return PolicyDecision::deny(format!(
                        "application {} is not allowed for product {product}",
                        application_id.unwrap_or("<none>")
                    ));
                }
            }
        }

        if let Some(prefixes) = config.allowed_model_prefixes.as_ref() {
            if !prefixes.iter().any(|prefix| model.starts_with(prefix.as_str())) {
                return PolicyDecision::deny(format!(
                    "model {model} is not available for product {product}"
                ));
            }
        }

        PolicyDecision::allow()
    }

    fn snapshot(&self) -> Arc<HashMap<String, ProductConfig>> {
        self.products
            .read()
            .map(|products| products.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ProductAccessPolicy {
        let mut products = HashMap::new();
        products.insert(
            "ide".to_string(),
            ProductConfig {
                allowed_applications: Some(BTreeSet::from(["ide-plugin".to_string()])),
                allowed_model_prefixes: Some(vec!["gpt-4o".to_string(), "claude-".to_string()]),
                allow_api_keys: false,
            },
        );
        products.insert("api".to_string(), ProductConfig::default());
        ProductAccessPolicy::new(products)
    }

    #[test]
    fn unknown_product_is_denied() {
        let decision = policy().check("nope", AuthMethod::ApiKey, None, "gpt-4o");
        assert!(!decision.allowed);
        assert_eq!(decision.reason.as_deref(), Some("unknown product: nope"));
    }

    #[test]
    fn api_keys_can_be_excluded() {
        let decision = policy().check("ide", AuthMethod::ApiKey, Some("ide-plugin"), "gpt-4o");
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("API keys"));

        assert!(policy().check("api", AuthMethod::ApiKey, None, "anything").allowed);
    }

    #[test]
    fn applications_and_models_are_checked_in_order() {
        let policy = policy();
        let wrong_app =
            policy.check("ide", AuthMethod::SessionToken, Some("other"), "unlisted-model");
        assert!(wrong_app.reason.unwrap().contains("application other"));

        let missing_app = policy.check("ide", AuthMethod::SessionToken, None, "gpt-4o");
        assert!(!missing_app.allowed);

        let wrong_model =
            policy.check("ide", AuthMethod::SessionToken, Some("ide-plugin"), "llama-3");
        assert!(wrong_model.reason.unwrap().contains("model llama-3"));

        assert!(
            policy
                .check("ide", AuthMethod::SessionToken, Some("ide-plugin"), "claude-sonnet")
                .allowed
        );
    }

    #[test]
    fn debug_override_skips_application_check_only() {
        let policy = policy().with_debug_skip_application_check(true);
        assert!(
            policy
                .check("ide", AuthMethod::SessionToken, Some("other"), "gpt-4o-mini")
                .allowed
        );
        assert!(
            !policy
                .check("ide", AuthMethod::SessionToken, Some("other"), "llama-3")
                .allowed
        );
    }

    #[test]
    fn refresh_swaps_products() {
        let policy = policy();
        policy.refresh(HashMap::new());
        assert!(!policy.check("api", AuthMethod::ApiKey, None, "m").allowed);
        assert!(policy.product("ide").is_none());
    }
}
