//! OpenAI-compatible chat completions backend.
//!
//! Talks to `POST {base_url}/chat/completions`. Works with the hosted API and
//! with local servers that speak the same protocol (set `OPENAI_BASE_URL`).
//! Cost is derived from reported token usage and a per-model price table.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use agentry_core::backend::{Completion, CompletionRequest, LlmBackend, TokenUsage};
use agentry_core::BackendError;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const BASE_URL_ENV: &str = "OPENAI_BASE_URL";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_ERROR_BODY: usize = 512;

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub prompt_per_million: f64,
    pub completion_per_million: f64,
}

impl ModelPrice {
    pub const fn new(prompt_per_million: f64, completion_per_million: f64) -> Self {
        Self {
            prompt_per_million,
            completion_per_million,
        }
    }

    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.prompt_tokens as f64 * self.prompt_per_million
            + usage.completion_tokens as f64 * self.completion_per_million)
            / 1_000_000.0
    }
}

// Matched by prefix; the longest matching prefix wins.
const PRICES: &[(&str, ModelPrice)] = &[
    ("gpt-4o-mini", ModelPrice::new(0.15, 0.60)),
    ("gpt-4o", ModelPrice::new(2.50, 10.00)),
    ("gpt-4.1-nano", ModelPrice::new(0.10, 0.40)),
    ("gpt-4.1-mini", ModelPrice::new(0.40, 1.60)),
    ("gpt-4.1", ModelPrice::new(2.00, 8.00)),
    ("gpt-4-turbo", ModelPrice::new(10.00, 30.00)),
    ("gpt-3.5-turbo", ModelPrice::new(0.50, 1.50)),
    ("o1-mini", ModelPrice::new(1.10, 4.40)),
    ("o3-mini", ModelPrice::new(1.10, 4.40)),
];

/// Known price for `model`, if any.
pub fn price_for(model: &str) -> Option<ModelPrice> {
    PRICES
        .iter()
        .filter(|(prefix, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, price)| *price)
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    /// Price applied to models missing from the table. `None` records zero cost.
    pub fallback_price: Option<ModelPrice>,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            timeout: DEFAULT_TIMEOUT,
            fallback_price: None,
        }
    }
}

impl OpenAiConfig {
    /// Read `OPENAI_API_KEY` and `OPENAI_BASE_URL`.
    pub fn from_env() -> Self {
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            base_url: non_empty(BASE_URL_ENV).unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: non_empty(API_KEY_ENV),
            ..Self::default()
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// The hosted API needs a key; compatible local servers usually do not.
    fn missing_key(&self) -> bool {
        self.api_key.is_none() && self.base_url.trim_end_matches('/') == DEFAULT_BASE_URL
    }
}

fn missing_key_error() -> BackendError {
    BackendError::NotConfigured(format!("{API_KEY_ENV} is not set"))
}

pub struct OpenAiBackend {
    config: OpenAiConfig,
    client: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new(config: OpenAiConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("agentry/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()
            .map_err(|e| BackendError::NotConfigured(format!("http client: {e}")))?;
        Ok(Self { config, client })
    }

    /// Backend configured from the environment. Fails early when the hosted
    /// API is selected without a key.
    pub fn from_env() -> Result<Self, BackendError> {
        let config = OpenAiConfig::from_env();
        if config.missing_key() {
            return Err(missing_key_error());
        }
        Self::new(config)
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn price(&self, model: &str) -> Option<ModelPrice> {
        price_for(model).or(self.config.fallback_price)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn chat_request(request: &CompletionRequest) -> ChatRequest<'_> {
    let mut messages = Vec::with_capacity(2);
    if let Some(system) = request.system.as_deref() {
        messages.push(ChatMessage {
            role: "system",
            content: system,
        });
    }
    messages.push(ChatMessage {
        role: "user",
        content: &request.prompt,
    });
    ChatRequest {
        model: &request.model,
        messages,
        temperature: request.temperature,
        max_tokens: request.max_tokens,
    }
}

fn parse_response(body: &str, price: Option<ModelPrice>) -> Result<Completion, BackendError> {
    let response: ChatResponse =
        serde_json::from_str(body).map_err(|e| BackendError::Decode(e.to_string()))?;
    let text = response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .ok_or_else(|| BackendError::Decode("response has no message content".to_string()))?;
    let usage = response
        .usage
        .map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        })
        .unwrap_or_default();
    let cost_usd = price.map(|p| p.cost(&usage)).unwrap_or(0.0);
    Ok(Completion {
        text,
        usage,
        cost_usd,
    })
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    #[instrument(skip_all, fields(model = %request.model))]
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, BackendError> {
        if self.config.missing_key() {
            return Err(missing_key_error());
        }
        let mut call = self.client.post(self.endpoint()).json(&chat_request(request));
        if let Some(key) = self.config.api_key.as_deref() {
            call = call.bearer_auth(key);
        }

        let response = call
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        if !status.is_success() {
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: truncate(&body),
            });
        }

        let completion = parse_response(&body, self.price(&request.model))?;
        debug!(
            prompt_tokens = completion.usage.prompt_tokens,
            completion_tokens = completion.usage.completion_tokens,
            cost_usd = completion.cost_usd,
            "completion received"
        );
        Ok(completion)
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(model: &str) -> CompletionRequest {
        CompletionRequest {
            model: model.to_string(),
            system: Some("You are a builder.".to_string()),
            prompt: "Write main.py".to_string(),
            temperature: 0.2,
            max_tokens: 256,
        }
    }

    const REPLY: &str = r#"{
        "id": "chatcmpl-1",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "print('hi')"}}],
        "usage": {"prompt_tokens": 1000, "completion_tokens": 500, "total_tokens": 1500}
    }"#;

    #[test]
    fn test_price_lookup_prefers_longest_prefix() {
        assert_eq!(price_for("gpt-4o-mini-2024-07-18"), Some(ModelPrice::new(0.15, 0.60)));
        assert_eq!(price_for("gpt-4o-2024-08-06"), Some(ModelPrice::new(2.50, 10.00)));
        assert_eq!(price_for("gpt-4.1-mini"), Some(ModelPrice::new(0.40, 1.60)));
        assert_eq!(price_for("llama3"), None);
    }

    #[test]
    fn test_cost_from_usage() {
        let usage = TokenUsage {
            prompt_tokens: 2_000_000,
            completion_tokens: 1_000_000,
        };
        let cost = ModelPrice::new(0.15, 0.60).cost(&usage);
        assert!((cost - 0.90).abs() < 1e-9);
    }

    #[test]
    fn test_request_includes_system_message_first() {
        let value = serde_json::to_value(chat_request(&request("gpt-4o"))).unwrap();
        assert_eq!(value["model"], "gpt-4o");
        assert_eq!(value["max_tokens"], 256);
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["role"], "user");
        assert_eq!(value["messages"][1]["content"], "Write main.py");

        let mut bare = request("gpt-4o");
        bare.system = None;
        let value = serde_json::to_value(chat_request(&bare)).unwrap();
        assert_eq!(value["messages"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_parse_response_prices_usage() {
        let completion = parse_response(REPLY, price_for("gpt-4o-mini")).unwrap();
        assert_eq!(completion.text, "print('hi')");
        assert_eq!(completion.usage.total(), 1500);
        assert!((completion.cost_usd - 0.00045).abs() < 1e-9);
    }

    #[test]
    fn test_parse_response_without_content_is_decode_error() {
        let err = parse_response(r#"{"choices": []}"#, None).unwrap_err();
        assert!(matches!(err, BackendError::Decode(_)));
        let err = parse_response("not json", None).unwrap_err();
        assert!(matches!(err, BackendError::Decode(_)));
    }

    #[test]
    fn test_truncate_long_bodies() {
        let body = "x".repeat(2 * MAX_ERROR_BODY);
        let short = truncate(&body);
        assert_eq!(short.len(), MAX_ERROR_BODY + 3);
        assert_eq!(truncate("short"), "short");
    }

    #[tokio::test]
    async fn test_missing_key_for_hosted_api() {
        let backend = OpenAiBackend::new(OpenAiConfig::default()).unwrap();
        let err = backend.complete(&request("gpt-4o")).await.unwrap_err();
        assert!(matches!(err, BackendError::NotConfigured(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_complete_against_compatible_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_string(REPLY))
            .expect(1)
            .mount(&server)
            .await;

        let config = OpenAiConfig::default()
            .with_base_url(format!("{}/v1/", server.uri()))
            .with_api_key("sk-test");
        let backend = OpenAiBackend::new(config).unwrap();

        let completion = backend.complete(&request("gpt-4o-mini")).await.unwrap();
        assert_eq!(completion.text, "print('hi')");
        assert!(completion.cost_usd > 0.0);

        let received = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
    }

    #[tokio::test]
    async fn test_server_errors_are_retryable_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(503).set_body_string(r#"{"error": "overloaded"}"#))
            .expect(1)
            .mount(&server)
            .await;
        let backend =
            OpenAiBackend::new(OpenAiConfig::default().with_base_url(server.uri())).unwrap();

        let err = backend.complete(&request("local-model")).await.unwrap_err();
        match &err {
            BackendError::Status { status, body } => {
                assert_eq!(*status, 503);
                assert!(body.contains("overloaded"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_retryable());
        let received = server.received_requests().await.unwrap();
        assert!(!received[0].headers.contains_key("authorization"));
    }
}
