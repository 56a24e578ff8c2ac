//! OpenAI-compatible LLM client with ordered model rotation.
//!
//! This is the single call site through which every Engram component talks
//! to an LLM. Each call resolves a model pool from the current settings
//! (stage-routed model first, then the configured models in order) and walks
//! it in order: quota and model-availability failures advance to the next
//! model, anything else surfaces immediately. Every attempt is appended to
//! the usage log.

use engram_core::errors::{LlmError, LlmResult};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

mod models;
mod rotation;
mod settings;
mod usage;

pub use models::{
    ChatCompletionResponse, ChatMessage, ChatOutcome, LlmToolCall, ResponseFormat, TokenUsage, Tool,
};
pub use rotation::{should_rotate, ApiFailure};
pub use settings::{
    load_settings, normalize_base_url, resolve_settings_path, routing_presets, save_settings,
    stage_catalog, LlmSettings, RoutingPreset, SettingsHandle, SettingsUpdate, Stage, StageInfo,
    MAX_MODELS, SETTINGS_PATH_ENV,
};
pub use usage::{
    aggregate_usage, read_usage_records, UsageLog, UsageRecord, UsageSummary, UsageTotals,
    DEFAULT_USAGE_LIMIT, MAX_USAGE_LIMIT,
};

use models::{ChatCompletionRequest, ErrorBody, ModelsResponse};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Per-call options: sampling, token limit, stage tag, response format.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub stage: Stage,
    pub response_format: Option<ResponseFormat>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 4096,
            stage: Stage::Fallback,
            response_format: None,
        }
    }
}

impl ChatOptions {
    pub fn for_stage(stage: Stage) -> Self {
        Self {
            stage,
            ..Default::default()
        }
    }

    /// Options for JSON-mode calls: lower temperature, forced JSON output.
    pub fn json(stage: Stage) -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 4096,
            stage,
            response_format: Some(ResponseFormat::json_object()),
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Rotating LLM client over an OpenAI-compatible Chat Completions endpoint.
pub struct RotatingLlmClient {
    http: reqwest::Client,
    settings: Arc<SettingsHandle>,
    usage: UsageLog,
}

impl RotatingLlmClient {
    /// Create a new client over the given settings handle and usage log.
    pub fn new(settings: Arc<SettingsHandle>, usage: UsageLog) -> LlmResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LlmError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http,
            settings,
            usage,
        })
    }

    /// Send a chat request and return the response text.
    pub async fn chat(&self, messages: &[ChatMessage], opts: &ChatOptions) -> LlmResult<String> {
        let (response, _model) = self.execute(messages, None, None, opts).await?;
        Ok(response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }

    /// Send a chat request with native function calling. When the model
    /// chooses to call tools, `content` may be absent and the calls are
    /// returned in `tool_calls`.
    pub async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        tools: Option<Vec<Tool>>,
        tool_choice: Option<serde_json::Value>,
        opts: &ChatOptions,
    ) -> LlmResult<ChatOutcome> {
        let (response, _model) = self.execute(messages, tools, tool_choice, opts).await?;
        let message = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| LlmError::ResponseParseError("No choices in response".to_string()))?;

        let tool_calls = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .filter(|call| call.r#type == "function")
            .map(|call| LlmToolCall {
                id: call.id,
                name: call.function.name,
                arguments_json: if call.function.arguments.is_empty() {
                    "{}".to_string()
                } else {
                    call.function.arguments
                },
            })
            .collect();

        Ok(ChatOutcome {
            content: message.content,
            tool_calls,
        })
    }

    /// Send a chat request in JSON mode and parse the body as JSON.
    ///
    /// A fenced ```json code block wrapping the payload is unwrapped before
    /// parsing. An empty body fails with [`LlmError::EmptyResponse`], an
    /// unparsable one with [`LlmError::MalformedJson`].
    pub async fn chat_json(
        &self,
        messages: &[ChatMessage],
        opts: &ChatOptions,
    ) -> LlmResult<serde_json::Value> {
        let mut opts = opts.clone();
        if opts.response_format.is_none() {
            opts.response_format = Some(ResponseFormat::json_object());
        }

        let text = self.chat(messages, &opts).await?;
        if text.trim().is_empty() {
            warn!("LLM returned an empty response (stage={})", opts.stage);
            return Err(LlmError::EmptyResponse(opts.stage.as_str().to_string()));
        }

        let json_text = extract_json_block(&text);
        serde_json::from_str(json_text).map_err(|e| {
            warn!("LLM returned malformed JSON: {} (body: {:.200})", e, text);
            LlmError::MalformedJson(e.to_string())
        })
    }

    /// List models available upstream (`GET /models`).
    pub async fn list_models(&self) -> LlmResult<Vec<String>> {
        let settings = self.settings.snapshot();
        let (base_url, api_key) = self.endpoint(&settings)?;

        let response = self
            .http
            .get(format!("{}/models", base_url))
            .bearer_auth(api_key)
            .send()
            .await
            .map_err(|e| LlmError::NetworkError(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Api {
                status: Some(status.as_u16()),
                code: None,
                message: body,
            });
        }

        let models: ModelsResponse = response
            .json()
            .await
            .map_err(|e| LlmError::ResponseParseError(format!("Failed to parse models: {}", e)))?;
        Ok(models.data.into_iter().map(|m| m.id).collect())
    }

    fn endpoint(&self, settings: &LlmSettings) -> LlmResult<(String, String)> {
        let api_key = settings.api_key.trim().to_string();
        if api_key.is_empty() {
            return Err(LlmError::ConfigError("LLM api_key is not configured".to_string()));
        }
        let base_url = settings.normalized_base_url();
        let base_url = if base_url.is_empty() {
            DEFAULT_BASE_URL.to_string()
        } else {
            base_url
        };
        Ok((base_url, api_key))
    }

    /// Walk the model pool in order until one attempt succeeds.
    async fn execute(
        &self,
        messages: &[ChatMessage],
        tools: Option<Vec<Tool>>,
        tool_choice: Option<serde_json::Value>,
        opts: &ChatOptions,
    ) -> LlmResult<(ChatCompletionResponse, String)> {
        let settings = self.settings.snapshot();
        let (base_url, api_key) = self.endpoint(&settings)?;
        let pool = settings.model_pool(opts.stage);
        if pool.is_empty() {
            return Err(LlmError::NoModelsConfigured);
        }

        let stage = opts.stage.as_str();
        let mut last_failure: Option<ApiFailure> = None;

        for (idx, model) in pool.iter().enumerate() {
            let request = ChatCompletionRequest {
                model: model.clone(),
                messages: messages.to_vec(),
                max_tokens: Some(opts.max_tokens),
                temperature: Some(opts.temperature),
                response_format: opts.response_format.clone(),
                tools: tools.clone(),
                tool_choice: tool_choice.clone(),
            };

            match self.attempt(&base_url, &api_key, &request).await {
                Ok(response) => {
                    self.usage
                        .append(&UsageRecord::success(stage, model, response.usage.clone()));
                    debug!(stage, model = %model, "LLM call succeeded");
                    return Ok((response, model.clone()));
                }
                Err(failure) => {
                    let (rotate, reason) = should_rotate(&failure);
                    self.usage
                        .append(&UsageRecord::error(stage, model, rotate, reason, failure.clone()));
                    if rotate && idx + 1 < pool.len() {
                        warn!(
                            stage,
                            model = %model,
                            reason,
                            "LLM call failed; rotating to next model"
                        );
                        last_failure = Some(failure);
                        continue;
                    }
                    return Err(failure.into_llm_error());
                }
            }
        }

        // The pool was exhausted by rotatable failures.
        Err(last_failure
            .map(ApiFailure::into_llm_error)
            .unwrap_or(LlmError::NoModelsConfigured))
    }

    async fn attempt(
        &self,
        base_url: &str,
        api_key: &str,
        request: &ChatCompletionRequest,
    ) -> Result<ChatCompletionResponse, ApiFailure> {
        let response = self
            .http
            .post(format!("{}/chat/completions", base_url))
            .bearer_auth(api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| ApiFailure::network(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let (code, message) = parse_error_body(&body);
            return Err(ApiFailure::api(
                status.as_u16(),
                code,
                message.unwrap_or(body),
            ));
        }

        response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|e| ApiFailure::network(format!("Failed to parse response: {}", e)))
    }
}

impl ApiFailure {
    fn into_llm_error(self) -> LlmError {
        match self.kind.as_str() {
            "network" => LlmError::NetworkError(self.message),
            _ => LlmError::Api {
                status: self.status_code,
                code: self.code,
                message: self.message,
            },
        }
    }
}

/// Pull `error.code` / `error.message` out of a structured provider error
/// body, tolerating flat layouts.
fn parse_error_body(body: &str) -> (Option<String>, Option<String>) {
    let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) else {
        return (None, None);
    };
    let code = parsed
        .error
        .as_ref()
        .and_then(|e| e.code.clone())
        .or(parsed.code);
    let message = parsed
        .error
        .as_ref()
        .and_then(|e| e.message.clone())
        .or(parsed.message);
    (code, message)
}

/// Extract the JSON payload from a response body, unwrapping a fenced
/// ```json code block when present.
fn extract_json_block(text: &str) -> &str {
    let trimmed = text.trim();
    for fence in ["```json", "```"] {
        if let Some(rest) = trimmed.strip_prefix(fence) {
            if let Some(end) = rest.rfind("```") {
                let inner = rest[..end].trim();
                if serde_json::from_str::<serde_json::Value>(inner).is_ok() {
                    return inner;
                }
            }
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::tempdir;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_settings(base_url: &str, models: &[&str]) -> LlmSettings {
        LlmSettings {
            base_url: base_url.to_string(),
            api_key: "sk-test".to_string(),
            models: models.iter().map(|m| m.to_string()).collect(),
            model_routing: BTreeMap::new(),
            updated_at: None,
        }
    }

    fn client_with(settings: LlmSettings, usage: UsageLog) -> RotatingLlmClient {
        let handle = SettingsHandle::with_settings(std::env::temp_dir().join("unused.json"), settings);
        RotatingLlmClient::new(Arc::new(handle), usage).unwrap()
    }

    fn chat_body(content: &str) -> serde_json::Value {
        json!({
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "usage": {"prompt_tokens": 7, "completion_tokens": 3, "total_tokens": 10}
        })
    }

    #[test]
    fn json_block_extraction() {
        assert_eq!(extract_json_block("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(extract_json_block("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(extract_json_block("```\n{\"a\":1}\n```"), "{\"a\":1}");
        // A fence around non-JSON falls through to the raw text.
        assert_eq!(extract_json_block("```\nnot json\n```"), "```\nnot json\n```");
    }

    #[tokio::test]
    async fn chat_succeeds_and_logs_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("hello")))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let log_path = dir.path().join("llm_usage.jsonl");
        let client = client_with(
            test_settings(&server.uri(), &["m1"]),
            UsageLog::new(log_path.clone()),
        );

        let reply = client
            .chat(&[ChatMessage::user("hi")], &ChatOptions::default())
            .await
            .unwrap();
        assert_eq!(reply, "hello");

        let records = read_usage_records(&log_path, 10);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event, "success");
        assert_eq!(records[0].model, "m1");
        assert_eq!(records[0].usage.as_ref().unwrap().effective_total(), 10);
    }

    #[tokio::test]
    async fn quota_error_rotates_to_next_model() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"model": "m1"})))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": {"code": "insufficient_quota", "message": "quota exhausted"}
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"model": "m2"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("from m2")))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let log_path = dir.path().join("llm_usage.jsonl");
        let client = client_with(
            test_settings(&server.uri(), &["m1", "m2"]),
            UsageLog::new(log_path.clone()),
        );

        let reply = client
            .chat(&[ChatMessage::user("hi")], &ChatOptions::default())
            .await
            .unwrap();
        assert_eq!(reply, "from m2");

        let records = read_usage_records(&log_path, 10);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event, "error");
        assert_eq!(records[0].model, "m1");
        assert_eq!(records[0].rotate, Some(true));
        assert_eq!(records[0].reason.as_deref(), Some("insufficient_quota"));
        assert_eq!(records[1].event, "success");
        assert_eq!(records[1].model, "m2");
    }

    #[tokio::test]
    async fn auth_error_does_not_rotate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": {"message": "invalid api key"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_with(
            test_settings(&server.uri(), &["m1", "m2"]),
            UsageLog::disabled(),
        );

        let err = client
            .chat(&[ChatMessage::user("hi")], &ChatOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(401));
    }

    #[tokio::test]
    async fn rotatable_errors_exhaust_the_whole_pool() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": {"message": "rate limited"}
            })))
            .expect(3)
            .mount(&server)
            .await;

        let client = client_with(
            test_settings(&server.uri(), &["m1", "m2", "m3"]),
            UsageLog::disabled(),
        );

        let err = client
            .chat(&[ChatMessage::user("hi")], &ChatOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(429));
    }

    #[tokio::test]
    async fn stage_routing_puts_routed_model_first() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"model": "m2"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("{\"ok\":true}")))
            .expect(1)
            .mount(&server)
            .await;

        let mut settings = test_settings(&server.uri(), &["m1", "m2"]);
        settings
            .model_routing
            .insert("json_structure".to_string(), "m2".to_string());
        let client = client_with(settings, UsageLog::disabled());

        let value = client
            .chat_json(
                &[ChatMessage::user("hi")],
                &ChatOptions::json(Stage::JsonStructure),
            )
            .await
            .unwrap();
        assert_eq!(value["ok"], true);
    }

    #[tokio::test]
    async fn chat_json_unwraps_fenced_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(chat_body("```json\n{\"entities\": []}\n```")),
            )
            .mount(&server)
            .await;

        let client = client_with(test_settings(&server.uri(), &["m1"]), UsageLog::disabled());
        let value = client
            .chat_json(
                &[ChatMessage::user("hi")],
                &ChatOptions::json(Stage::JsonStructure),
            )
            .await
            .unwrap();
        assert!(value["entities"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn chat_json_rejects_empty_and_malformed_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"model": "empty"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("   ")))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"model": "garbled"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("not json at all")))
            .mount(&server)
            .await;

        let empty_client =
            client_with(test_settings(&server.uri(), &["empty"]), UsageLog::disabled());
        let err = empty_client
            .chat_json(&[ChatMessage::user("hi")], &ChatOptions::json(Stage::Fallback))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::EmptyResponse(_)));

        let garbled_client =
            client_with(test_settings(&server.uri(), &["garbled"]), UsageLog::disabled());
        let err = garbled_client
            .chat_json(&[ChatMessage::user("hi")], &ChatOptions::json(Stage::Fallback))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::MalformedJson(_)));
    }

    #[tokio::test]
    async fn chat_completion_surfaces_tool_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": {"name": "search", "arguments": "{\"q\":\"x\"}"}
                        }]
                    }
                }]
            })))
            .mount(&server)
            .await;

        let client = client_with(test_settings(&server.uri(), &["m1"]), UsageLog::disabled());
        let outcome = client
            .chat_completion(
                &[ChatMessage::user("hi")],
                Some(vec![Tool::function("search", "Search things", json!({"type": "object"}))]),
                Some(json!("auto")),
                &ChatOptions::default(),
            )
            .await
            .unwrap();
        assert!(outcome.content.is_none());
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_calls[0].name, "search");
    }

    #[tokio::test]
    async fn missing_models_and_key_are_config_errors() {
        let client = client_with(test_settings("http://localhost:1", &[]), UsageLog::disabled());
        let err = client
            .chat(&[ChatMessage::user("hi")], &ChatOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::NoModelsConfigured));

        let mut settings = test_settings("http://localhost:1", &["m1"]);
        settings.api_key = String::new();
        let client = client_with(settings, UsageLog::disabled());
        let err = client
            .chat(&[ChatMessage::user("hi")], &ChatOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::ConfigError(_)));
    }
}
