use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

/// Capability and price snapshot for one model. Prices are USD micros per token and may be
/// fractional (cheap models cost well under a micro-dollar per token).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ModelInfo {
    pub context_window: Option<u32>,
    pub supports_streaming: bool,
    pub input_usd_micros_per_token: f64,
    pub output_usd_micros_per_token: f64,
}

impl Default for ModelInfo {
    fn default() -> Self {
        Self {
            context_window: None,
            supports_streaming: true,
            input_usd_micros_per_token: 0.0,
            output_usd_micros_per_token: 0.0,
        }
    }
}

impl ModelInfo {
    pub fn cost_usd_micros(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        input_tokens as f64 * self.input_usd_micros_per_token
            + output_tokens as f64 * self.output_usd_micros_per_token
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("invalid pricing json: expected object at root")]
    InvalidRoot,
    #[error("invalid pricing entry for model {model}: expected object")]
    InvalidModelEntry { model: String },
    #[error("invalid pricing entry for model {model}: invalid cost value for {field}")]
    InvalidCostValue { model: String, field: &'static str },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The model cost/capability table. Owned by the host, refreshed by whatever schedule the host
/// runs, and read by the throttles and the gateway as an immutable snapshot.
#[derive(Debug, Default)]
pub struct ModelCatalog {
    models: RwLock<Arc<HashMap<String, ModelInfo>>>,
}

impl ModelCatalog {
    pub fn new(models: HashMap<String, ModelInfo>) -> Self {
        Self {
            models: RwLock::new(Arc::new(models)),
        }
    }

    pub fn from_litellm_json_str(raw: &str) -> Result<Self, CatalogError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        Ok(Self::new(parse_litellm_models(&value)?))
    }

    pub fn get(&self, model: &str) -> Option<ModelInfo> {
        self.snapshot().get(model).copied()
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, ModelInfo>> {
        self.models
            .read()
            .map(|models| models.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Swaps in a new table. Readers holding an older snapshot keep using it until they drop
    /// it.
    pub fn refresh(&self, models: HashMap<String, ModelInfo>) {
        let next = Arc::new(models);
        match self.models.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    pub fn refresh_from_litellm_json_str(&self, raw: &str) -> Result<usize, CatalogError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let models = parse_litellm_models(&value)?;
        let count = models.len();
        self.refresh(models);
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_litellm_models(
    value: &serde_json::Value,
) -> Result<HashMap<String, ModelInfo>, CatalogError> {
    let Some(root) = value.as_object() else {
        return Err(CatalogError::InvalidRoot);
    };

    let mut models = HashMap::new();
    for (model, entry) in root {
        // LiteLLM ships a documentation entry alongside the real ones.
        if model == "sample_spec" {
            continue;
        }
        let Some(obj) = entry.as_object() else {
            return Err(CatalogError::InvalidModelEntry {
                model: model.clone(),
            });
        };

        let input = parse_cost(obj, "input_cost_per_token", "input_cost_per_1k_tokens")
            .map(|usd| usd_to_micros(usd, model, "input_cost"))
            .transpose()?
            .unwrap_or(0.0);
        let output = parse_cost(obj, "output_cost_per_token", "output_cost_per_1k_tokens")
            .map(|usd| usd_to_micros(usd, model, "output_cost"))
            .transpose()?
            .unwrap_or(0.0);

        let context_window = ["max_input_tokens", "max_tokens"]
            .iter()
            .find_map(|field| obj.get(*field).and_then(|value| value.as_u64()))
            .map(|tokens| u32::try_from(tokens).unwrap_or(u32::MAX));

        // `supports_native_streaming: false` only means the provider fakes streaming, which
        // still works for clients. Only an explicit `supports_streaming: false` gates requests.
        let supports_streaming = obj
            .get("supports_streaming")
            .and_then(|value| value.as_bool())
            .unwrap_or(true);

        models.insert(
            model.clone(),
            ModelInfo {
                context_window,
                supports_streaming,
                input_usd_micros_per_token: input,
                output_usd_micros_per_token: output,
            },
        );
    }
    Ok(models)
}

fn parse_cost(
    obj: &serde_json::Map<String, serde_json::Value>,
    per_token_key: &'static str,
    per_1k_key: &'static str,
) -> Option<f64> {
    obj.get(per_token_key)
        .and_then(|value| value.as_f64())
        .or_else(|| {
            obj.get(per_1k_key)
                .and_then(|value| value.as_f64())
                .map(|per_1k| per_1k / 1000.0)
        })
}

fn usd_to_micros(
    usd_per_token: f64,
    model: &str,
    field: &'static str,
) -> Result<f64, CatalogError> {
    let micros = usd_per_token * 1_000_000.0;
    if !micros.is_finite() || micros < 0.0 {
        return Err(CatalogError::InvalidCostValue {
            model: model.to_string(),
            field,
        });
    }
    Ok(micros)
}
