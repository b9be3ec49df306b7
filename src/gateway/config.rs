use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::auth::{
    AuthCacheConfig, CredentialRecord, DEFAULT_API_KEY_PREFIX, DEFAULT_REQUIRED_SCOPE,
    DEFAULT_SESSION_TOKEN_PREFIX, hash_credential,
};
use super::metrics::MetricsConfig;
use super::policy::ProductConfig;
use super::throttle::{BudgetDirection, BudgetScope, BudgetUnit, RateKey, RateSpec};
use super::token_count::DEFAULT_MAX_OUTPUT_TOKENS;
use crate::{DittoError, Result};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub auth: AuthConfig,
    pub credentials: Vec<CredentialConfig>,
    pub products: BTreeMap<String, ProductConfig>,
    /// Development only: accept any OAuth client for every product.
    pub debug_skip_application_check: bool,
    /// Evaluated in order. Put cheap local throttles first.
    pub throttles: Vec<ThrottleConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisConfig>,
    pub catalog: CatalogConfig,
    pub estimator: EstimatorConfig,
    pub metrics: MetricsConfig,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub api_key_prefix: String,
    pub session_token_prefix: String,
    /// Required on session tokens; required on API keys only when they carry scopes.
    pub required_scope: String,
    pub cache: AuthCacheConfig,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key_prefix: DEFAULT_API_KEY_PREFIX.to_string(),
            session_token_prefix: DEFAULT_SESSION_TOKEN_PREFIX.to_string(),
            required_scope: DEFAULT_REQUIRED_SCOPE.to_string(),
            cache: AuthCacheConfig::default(),
        }
    }
}

/// An inline credential. Either the raw `token` (hashed at load time) or its `hash`.
#[derive(Clone, Serialize, Deserialize)]
pub struct CredentialConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(flatten)]
    pub record: CredentialRecord,
}

impl std::fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("hash", &self.hash)
            .field("record", &self.record)
            .finish()
    }
}

impl CredentialConfig {
    pub fn resolved_hash(&self) -> Option<String> {
        match (&self.hash, &self.token) {
            (Some(hash), _) => Some(hash.to_ascii_lowercase()),
            (None, Some(token)) => Some(hash_credential(token)),
            (None, None) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ThrottleConfig {
    Rate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        limit: RateSpec,
        #[serde(default)]
        key: RateKey,
    },
    Budget {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        scope: BudgetScope,
        direction: BudgetDirection,
        limit: RateSpec,
        #[serde(default)]
        unit: BudgetUnit,
        #[serde(default)]
        model_limits: BTreeMap<String, RateSpec>,
        /// Use the shared counter store when one is configured.
        #[serde(default = "default_true")]
        shared: bool,
    },
}

fn default_true() -> bool {
    true
}

impl ThrottleConfig {
    pub fn name(&self) -> String {
        match self {
            Self::Rate { name, .. } => name.clone().unwrap_or_else(|| "rate".to_string()),
            Self::Budget {
                name,
                scope,
                direction,
                ..
            } => name.clone().unwrap_or_else(|| {
                let scope = match scope {
                    BudgetScope::User => "user",
                    BudgetScope::Product => "product",
                };
                let direction = match direction {
                    BudgetDirection::Input => "input",
                    BudgetDirection::Output => "output",
                };
                format!("{scope}_{direction}_tokens")
            }),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Per-call deadline; a slower Redis counts as unavailable.
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
}

fn default_redis_prefix() -> String {
    "ditto".to_string()
}

fn default_max_in_flight() -> usize {
    64
}

fn default_acquire_timeout_ms() -> u64 {
    50
}

fn default_op_timeout_ms() -> u64 {
    250
}

impl std::fmt::Debug for RedisConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConfig")
            .field("url", &"<redacted>")
            .field("prefix", &self.prefix)
            .field("max_in_flight", &self.max_in_flight)
            .field("acquire_timeout_ms", &self.acquire_timeout_ms)
            .field("op_timeout_ms", &self.op_timeout_ms)
            .finish()
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// LiteLLM `model_prices_and_context_window.json`, relative to the working directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub litellm_pricing_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub default_max_output_tokens: u64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            default_max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
        }
    }
}

impl GatewayConfig {
    /// Loads `.toml` files as TOML and everything else as JSON, then validates.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let config = match path.extension().and_then(|value| value.to_str()) {
            Some("toml") => Self::from_toml_str(&raw)?,
            _ => Self::from_json_str(&raw)?,
        };
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let api = self.auth.api_key_prefix.as_str();
        let session = self.auth.session_token_prefix.as_str();
        if api.is_empty() || session.is_empty() {
            return Err(invalid("credential prefixes must not be empty"));
        }
        if api.starts_with(session) || session.starts_with(api) {
            return Err(invalid(format!(
                "credential prefixes overlap: {api:?} and {session:?}"
            )));
        }

        for (index, credential) in self.credentials.iter().enumerate() {
            if credential.resolved_hash().is_none() {
                return Err(invalid(format!(
                    "credentials[{index}] needs either token or hash"
                )));
            }
        }

        let mut names = BTreeSet::new();
        for throttle in &self.throttles {
            let name = throttle.name();
            if !names.insert(name.clone()) {
                return Err(invalid(format!("duplicate throttle name: {name}")));
            }
            if let ThrottleConfig::Budget {
                unit: BudgetUnit::UsdMicros,
                ..
            } = throttle
            {
                if self.catalog.litellm_pricing_path.is_none() {
                    tracing::warn!(
                        throttle = %name,
                        "usd_micros budget without a pricing file charges nothing unless the host supplies a catalog"
                    );
                }
            }
        }

        if let Some(redis) = self.redis.as_ref() {
            if redis.url.trim().is_empty() {
                return Err(invalid("redis.url must not be empty"));
            }
            if redis.max_in_flight == 0 {
                return Err(invalid("redis.max_in_flight must be at least 1"));
            }
            if redis.op_timeout_ms == 0 {
                return Err(invalid("redis.op_timeout_ms must be at least 1"));
            }
        }
        Ok(())
    }

    pub fn credential_records(&self) -> HashMap<String, CredentialRecord> {
        self.credentials
            .iter()
            .filter_map(|credential| {
                credential
                    .resolved_hash()
                    .map(|hash| (hash, credential.record.clone()))
            })
            .collect()
    }

    pub fn product_map(&self) -> HashMap<String, ProductConfig> {
        self.products
            .iter()
            .map(|(name, product)| (name.clone(), product.clone()))
            .collect()
    }
}

fn invalid(message: impl Into<String>) -> DittoError {
    DittoError::InvalidConfig(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::throttle::RatePeriod;

    const JSON: &str = r#"{
      "credentials": [
        {"token": "sk-ditto-dev", "owner_id": "dev", "tenant_id": "local"}
      ],
      "products": {"chat": {"allowed_model_prefixes": ["gpt-"]}},
      "throttles": [
        {"type": "rate", "limit": "10/second"},
        {"type": "budget", "scope": "user", "direction": "input", "limit": "100000/day",
         "model_limits": {"gpt-4o": "5000/day"}}
      ]
    }"#;

    #[test]
    fn parses_json_with_defaults() {
        let config = GatewayConfig::from_json_str(JSON).expect("config");
        assert_eq!(config.auth.api_key_prefix, "sk-ditto-");
        assert_eq!(config.throttles.len(), 2);
        assert_eq!(config.throttles[0].name(), "rate");
        assert_eq!(config.throttles[1].name(), "user_input_tokens");
        match &config.throttles[1] {
            ThrottleConfig::Budget {
                model_limits,
                shared,
                unit,
                ..
            } => {
                assert_eq!(
                    model_limits.get("gpt-4o"),
                    Some(&RateSpec::new(5000, RatePeriod::Day))
                );
                assert!(*shared);
                assert_eq!(*unit, BudgetUnit::Tokens);
            }
            other => panic!("unexpected throttle: {other:?}"),
        }

        let records = config.credential_records();
        assert_eq!(
            records.get(&hash_credential("sk-ditto-dev")).map(|r| r.owner_id.as_str()),
            Some("dev")
        );
        assert!(config.product_map().contains_key("chat"));
    }

    #[test]
    fn loads_toml_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gateway.toml");
        fs::write(
            &path,
            r#"
debug_skip_application_check = true

[auth]
required_scope = "llm:call"

[[throttles]]
type = "budget"
scope = "product"
direction = "output"
limit = "1000000/hour"
unit = "usd_micros"
shared = false

[redis]
url = "redis://127.0.0.1/"
"#,
        )
        .expect("write");

        let config = GatewayConfig::load(&path).expect("config");
        assert!(config.debug_skip_application_check);
        assert_eq!(config.auth.required_scope, "llm:call");
        assert_eq!(config.auth.session_token_prefix, "st-ditto-");
        assert_eq!(config.throttles[0].name(), "product_output_tokens");
        let redis = config.redis.expect("redis");
        assert_eq!(redis.prefix, "ditto");
        assert_eq!(redis.max_in_flight, 64);
        assert_eq!(redis.op_timeout_ms, 250);
        assert!(!format!("{redis:?}").contains("127.0.0.1"));
    }

    #[test]
    fn rejects_invalid_configs() {
        let duplicate = r#"{"throttles": [
          {"type": "rate", "limit": "1/second"},
          {"type": "rate", "limit": "2/second"}
        ]}"#;
        assert!(matches!(
            GatewayConfig::from_json_str(duplicate),
            Err(DittoError::InvalidConfig(_))
        ));

        let bad_rate = r#"{"throttles": [{"type": "rate", "limit": "1/fortnight"}]}"#;
        assert!(matches!(
            GatewayConfig::from_json_str(bad_rate),
            Err(DittoError::Json(_))
        ));

        let overlapping = r#"{"auth": {"api_key_prefix": "sk-", "session_token_prefix": "sk-session-"}}"#;
        assert!(matches!(
            GatewayConfig::from_json_str(overlapping),
            Err(DittoError::InvalidConfig(_))
        ));

        let anonymous = r#"{"credentials": [{"owner_id": "a", "tenant_id": "b"}]}"#;
        assert!(GatewayConfig::from_json_str(anonymous).is_err());
    }

    #[test]
    fn debug_redacts_raw_tokens() {
        let config = GatewayConfig::from_json_str(JSON).expect("config");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-ditto-dev"));
    }
}
