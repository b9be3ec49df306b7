//! Pre-flight token estimates for admission control.
//!
//! Exact counts come from the model's BPE when `gateway-tokenizer` is enabled and the model is
//! known to `tiktoken-rs`. Everything else (unknown models, malformed messages, the feature
//! being off) falls back to `chars / 4` over the flattened text. Only text parts count; images,
//! audio and tool payloads inside message content are ignored.

use std::sync::Arc;

use serde_json::Value;
#[cfg(feature = "gateway-tokenizer")]
use tiktoken_rs::{CoreBPE, tokenizer};

use super::catalog::ModelCatalog;

pub const DEFAULT_MAX_OUTPUT_TOKENS: u64 = 4096;

#[derive(Clone, Debug)]
pub struct TokenEstimator {
    catalog: Option<Arc<ModelCatalog>>,
    default_max_output_tokens: u64,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenEstimator {
    pub fn new() -> Self {
        Self {
            catalog: None,
            default_max_output_tokens: DEFAULT_MAX_OUTPUT_TOKENS,
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<ModelCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn with_default_max_output_tokens(mut self, tokens: u64) -> Self {
        self.default_max_output_tokens = tokens;
        self
    }

    /// Token count of a chat message list.
    pub fn count(&self, model: &str, messages: &[Value]) -> u64 {
        if messages.is_empty() {
            return 0;
        }
        if let Some(tokens) = exact_chat_tokens(model, messages) {
            return tokens;
        }
        tracing::trace!(model, "no exact tokenizer; using length heuristic");
        let mut text = String::new();
        for message in messages {
            collect_message_text(message, &mut text);
        }
        heuristic_tokens(&text)
    }

    /// Input estimate for a whole request body: chat `messages`, plus a top-level `system` or
    /// `instructions` string, or a responses-style `input`.
    pub fn estimate_request(&self, model: &str, request: &Value) -> u64 {
        let mut messages: Vec<Value> = Vec::new();
        for field in ["system", "instructions"] {
            if let Some(text) = request.get(field).and_then(Value::as_str) {
                messages.push(serde_json::json!({"role": "system", "content": text}));
            }
        }
        match request.get("messages").and_then(Value::as_array) {
            Some(items) => messages.extend(items.iter().cloned()),
            None => match request.get("input") {
                Some(Value::Array(items)) => {
                    for item in items {
                        match item {
                            Value::Object(_) => messages.push(item.clone()),
                            other => messages
                                .push(serde_json::json!({"role": "user", "content": other})),
                        }
                    }
                }
                Some(other) => {
                    messages.push(serde_json::json!({"role": "user", "content": other}))
                }
                None => {}
            },
        }
        self.count(model, &messages)
    }

    /// Upper bound on output tokens: the request's own limit, else what is left of the model's
    /// context window, else the configured default.
    pub fn estimate_max_output(&self, model: &str, request: &Value, input_tokens: u64) -> u64 {
        let requested = ["max_tokens", "max_completion_tokens", "max_output_tokens"]
            .iter()
            .find_map(|field| request.get(*field).and_then(Value::as_u64));
        if let Some(requested) = requested {
            return requested;
        }
        let remaining_context = self
            .catalog
            .as_ref()
            .and_then(|catalog| catalog.get(model))
            .and_then(|info| info.context_window)
            .map(|window| u64::from(window).saturating_sub(input_tokens))
            .filter(|remaining| *remaining > 0);
        remaining_context.unwrap_or(self.default_max_output_tokens)
    }
}

pub fn heuristic_tokens(text: &str) -> u64 {
    (text.chars().count() / 4) as u64
}

fn collect_message_text(message: &Value, out: &mut String) {
    match message {
        Value::String(text) => out.push_str(text),
        Value::Object(obj) => {
            if let Some(content) = obj.get("content") {
                collect_content_text(content, out);
            }
        }
        _ => {}
    }
}

fn collect_content_text(content: &Value, out: &mut String) {
    match content {
        Value::String(text) => out.push_str(text),
        Value::Array(parts) => {
            for part in parts {
                if let Some(text) = text_part(part) {
                    out.push_str(text);
                }
            }
        }
        _ => {}
    }
}

fn text_part(part: &Value) -> Option<&str> {
    match part {
        Value::String(text) => Some(text),
        Value::Object(obj) => {
            let part_type = obj.get("type").and_then(Value::as_str).unwrap_or_default();
            if part_type != "text" && part_type != "input_text" {
                return None;
            }
            obj.get("text").and_then(Value::as_str)
        }
        _ => None,
    }
}

#[cfg(feature = "gateway-tokenizer")]
fn bpe_for_model(model: &str) -> Option<&'static CoreBPE> {
    let bpe = match tokenizer::get_tokenizer(model)? {
        tokenizer::Tokenizer::O200kHarmony => tiktoken_rs::o200k_harmony_singleton(),
        tokenizer::Tokenizer::O200kBase => tiktoken_rs::o200k_base_singleton(),
        tokenizer::Tokenizer::Cl100kBase => tiktoken_rs::cl100k_base_singleton(),
        tokenizer::Tokenizer::R50kBase | tokenizer::Tokenizer::Gpt2 => {
            tiktoken_rs::r50k_base_singleton()
        }
        tokenizer::Tokenizer::P50kBase => tiktoken_rs::p50k_base_singleton(),
        tokenizer::Tokenizer::P50kEdit => tiktoken_rs::p50k_edit_singleton(),
    };
    Some(bpe)
}

#[cfg(feature = "gateway-tokenizer")]
fn exact_chat_tokens(model: &str, messages: &[Value]) -> Option<u64> {
    let bpe = bpe_for_model(model)?;
    let (tokens_per_message, tokens_per_name) = if model.starts_with("gpt-3.5") {
        (4i64, -1i64)
    } else {
        (3i64, 1i64)
    };

    let mut num_tokens: i64 = 0;
    for message in messages {
        let obj = message.as_object()?;
        let role = obj.get("role").and_then(Value::as_str).unwrap_or_default();

        num_tokens = num_tokens.saturating_add(tokens_per_message);
        num_tokens = num_tokens.saturating_add(encoded_len(bpe, role));

        if let Some(content) = obj.get("content") {
            let mut text = String::new();
            match content {
                Value::String(content) => text.push_str(content),
                Value::Array(parts) => {
                    for part in parts {
                        if let Some(part) = text_part(part) {
                            num_tokens = num_tokens.saturating_add(encoded_len(bpe, part));
                        }
                    }
                }
                _ => {}
            }
            num_tokens = num_tokens.saturating_add(encoded_len(bpe, &text));
        }

        if let Some(name) = obj.get("name").and_then(Value::as_str) {
            num_tokens = num_tokens.saturating_add(encoded_len(bpe, name));
            num_tokens = num_tokens.saturating_add(tokens_per_name);
        }
    }
    // Every reply is primed with <|start|>assistant<|message|>.
    num_tokens = num_tokens.saturating_add(3);

    Some(num_tokens.max(0) as u64)
}

#[cfg(not(feature = "gateway-tokenizer"))]
fn exact_chat_tokens(_model: &str, _messages: &[Value]) -> Option<u64> {
    None
}

#[cfg(feature = "gateway-tokenizer")]
fn encoded_len(bpe: &CoreBPE, text: &str) -> i64 {
    if text.is_empty() {
        return 0;
    }
    i64::try_from(bpe.encode_with_special_tokens(text).len()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::gateway::catalog::ModelInfo;

    #[test]
    fn unknown_models_use_length_heuristic() {
        let estimator = TokenEstimator::new();
        let messages = vec![serde_json::json!({"role": "user", "content": "abcdefgh"})];
        assert_eq!(estimator.count("my-local-llama", &messages), 2);
    }

    #[test]
    fn heuristic_ignores_non_text_parts() {
        let estimator = TokenEstimator::new();
        let messages = vec![serde_json::json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "abcd"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAAAAAAAAAAAAAA"}},
                {"type": "input_text", "text": "efgh"}
            ]
        })];
        assert_eq!(estimator.count("my-local-llama", &messages), 2);
    }

    #[test]
    fn empty_message_list_is_free() {
        assert_eq!(TokenEstimator::new().count("gpt-4o-mini", &[]), 0);
    }

    #[cfg(feature = "gateway-tokenizer")]
    #[test]
    fn counts_chat_messages_like_tiktoken() {
        let messages = vec![serde_json::json!({"role": "user", "content": "hello"})];
        let tokens = TokenEstimator::new().count("gpt-4o-mini", &messages);

        let expected = tiktoken_rs::num_tokens_from_messages(
            "gpt-4o-mini",
            &[tiktoken_rs::ChatCompletionRequestMessage {
                role: "user".to_string(),
                content: Some("hello".to_string()),
                name: None,
                function_call: None,
            }],
        )
        .expect("num_tokens_from_messages") as u64;

        assert_eq!(tokens, expected);
    }

    #[cfg(feature = "gateway-tokenizer")]
    #[test]
    fn exact_count_skips_image_parts() {
        let with_image = vec![serde_json::json!({
            "role": "user",
            "content": [
                {"type": "text", "text": "hello"},
                {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}},
            ]
        })];
        let text_only = vec![serde_json::json!({"role": "user", "content": "hello"})];
        let estimator = TokenEstimator::new();
        assert_eq!(
            estimator.count("gpt-4o-mini", &with_image),
            estimator.count("gpt-4o-mini", &text_only)
        );
    }

    #[test]
    fn request_estimate_includes_system_prompt() {
        let estimator = TokenEstimator::new();
        let request = serde_json::json!({
            "system": "abcdabcd",
            "messages": [{"role": "user", "content": "abcd"}]
        });
        assert_eq!(estimator.estimate_request("my-local-llama", &request), 3);

        let request = serde_json::json!({"input": "abcdabcdabcd"});
        assert_eq!(estimator.estimate_request("my-local-llama", &request), 3);
    }

    #[test]
    fn max_output_prefers_request_then_context_window() {
        let mut models = HashMap::new();
        models.insert(
            "small".to_string(),
            ModelInfo {
                context_window: Some(1000),
                ..ModelInfo::default()
            },
        );
        let estimator = TokenEstimator::new()
            .with_catalog(Arc::new(ModelCatalog::new(models)))
            .with_default_max_output_tokens(256);

        let explicit = serde_json::json!({"max_tokens": 64});
        assert_eq!(estimator.estimate_max_output("small", &explicit, 10), 64);

        let bare = serde_json::json!({});
        assert_eq!(estimator.estimate_max_output("small", &bare, 300), 700);
        assert_eq!(estimator.estimate_max_output("small", &bare, 5000), 256);
        assert_eq!(estimator.estimate_max_output("unknown", &bare, 0), 256);
    }
}
