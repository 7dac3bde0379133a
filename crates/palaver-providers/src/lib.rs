//! Palaver LLM Providers
//!
//! OpenAI-compatible chat completions client with image input,
//! plus native Anthropic/Claude provider

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::time::sleep;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user_with_image(text: impl Into<String>, image_url: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: MessageContent::Parts(vec![
                ContentPart::Text { text: text.into() },
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: image_url.into(),
                    },
                },
            ]),
        }
    }

    /// Text parts joined by newlines; image parts are skipped.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub max_tokens: u32,
    pub model_override: Option<String>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            max_tokens: 500,
            model_override: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub model: String,
    pub usage: Option<Usage>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub window_secs: u64,
    pub initial_delay_secs: u64,
    pub backoff_factor: u32,
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            window_secs: 600,
            initial_delay_secs: 2,
            backoff_factor: 2,
            max_delay_secs: 30,
        }
    }
}

#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
        retry_policy: Option<&RetryPolicy>,
    ) -> Result<ChatResponse>;
    async fn health_check(&self) -> Result<bool>;
}

pub struct OpenAICompatibleProvider {
    client: Client,
    name: String,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAICompatibleProvider {
    pub fn new(
        name: String,
        api_key: String,
        base_url: Option<String>,
        model: Option<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            name,
            api_key,
            base_url: base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: model.unwrap_or_else(|| "gpt-4o-mini".to_string()),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn truncate_for_error(text: &str, max_chars: usize) -> String {
        if text.chars().count() <= max_chars {
            text.to_string()
        } else {
            let truncated: String = text.chars().take(max_chars).collect();
            format!("{}...", truncated)
        }
    }

    async fn request_chat(
        &self,
        body: serde_json::Value,
        retry_policy: Option<&RetryPolicy>,
    ) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let policy = retry_policy.cloned().unwrap_or_default();
        let start = Instant::now();
        let mut attempt: u32 = 1;

        loop {
            let response = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status();
                    let headers = response.headers().clone();
                    let raw_body = response.text().await?;

                    if status.is_success() {
                        let parsed: serde_json::Value =
                            serde_json::from_str(&raw_body).map_err(|e| {
                                anyhow!(
                                    "Provider response decode failed at {}: {} | body={}",
                                    url,
                                    e,
                                    Self::truncate_for_error(&raw_body, 600)
                                )
                            })?;
                        return self.parse_response(parsed);
                    }

                    let snippet = Self::truncate_for_error(&raw_body, 600);
                    let error_msg = format!("Provider HTTP {} at {}: {}", status, url, snippet);
                    if !Self::is_retryable_status(status.as_u16()) {
                        return Err(anyhow!(error_msg));
                    }

                    if let Some(delay) =
                        Self::next_retry_delay(&policy, attempt, &headers, start.elapsed())
                    {
                        tracing::warn!(
                            provider = %self.name,
                            status = %status.as_u16(),
                            attempt = attempt,
                            delay_ms = delay.as_millis(),
                            "Retrying provider request after transient HTTP error"
                        );
                        sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(anyhow!(error_msg));
                }
                Err(err) => {
                    if !Self::is_retryable_reqwest(&err) {
                        return Err(err.into());
                    }

                    if let Some(delay) =
                        Self::next_retry_delay(&policy, attempt, &HeaderMap::new(), start.elapsed())
                    {
                        tracing::warn!(
                            provider = %self.name,
                            attempt = attempt,
                            delay_ms = delay.as_millis(),
                            error = %err,
                            "Retrying provider request after transient network error"
                        );
                        sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(err.into());
                }
            }
        }
    }

    fn parse_response(&self, response: serde_json::Value) -> Result<ChatResponse> {
        if let Some(error) = response.get("error") {
            return Err(anyhow!("API error: {:?}", error));
        }

        let choices = response
            .get("choices")
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow!("Missing 'choices' array in provider response"))?;

        let choice = choices
            .first()
            .ok_or_else(|| anyhow!("Empty 'choices' array in provider response"))?;

        let message = choice
            .get("message")
            .ok_or_else(|| anyhow!("Missing 'message' object in provider response"))?;

        let content = message
            .get("content")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let finish_reason = choice
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let usage = response.get("usage").map(|u| Usage {
            prompt_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            completion_tokens: u
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0) as u32,
            total_tokens: u.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
        });

        let model = response
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.model)
            .to_string();

        Ok(ChatResponse {
            content,
            model,
            usage,
            finish_reason,
        })
    }

    fn is_retryable_status(status: u16) -> bool {
        matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
    }

    fn is_retryable_reqwest(err: &reqwest::Error) -> bool {
        err.is_timeout() || err.is_connect() || err.is_request()
    }

    fn next_retry_delay(
        policy: &RetryPolicy,
        attempt: u32,
        headers: &HeaderMap,
        elapsed: Duration,
    ) -> Option<Duration> {
        let window = Duration::from_secs(policy.window_secs.max(1));
        if elapsed >= window {
            return None;
        }

        let header_delay = Self::parse_retry_after_headers(headers);
        let fallback_delay = Self::exponential_delay(policy, attempt);
        let mut delay = header_delay.unwrap_or(fallback_delay);

        let remaining = window.saturating_sub(elapsed);
        if remaining.is_zero() {
            return None;
        }
        if delay > remaining {
            delay = remaining;
        }

        if delay.is_zero() {
            Some(Duration::from_millis(1))
        } else {
            Some(delay)
        }
    }

    fn exponential_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
        let initial = policy.initial_delay_secs.max(1);
        let factor = policy.backoff_factor.max(1) as u64;
        let max_delay = policy.max_delay_secs.max(1);

        let exponent = attempt.saturating_sub(1).min(20);
        let multiplier = factor.saturating_pow(exponent);
        let secs = initial.saturating_mul(multiplier).min(max_delay);
        Duration::from_secs(secs)
    }

    fn parse_retry_after_headers(headers: &HeaderMap) -> Option<Duration> {
        if let Some(v) = headers.get("retry-after-ms").and_then(|h| h.to_str().ok()) {
            if let Ok(ms) = v.trim().parse::<u64>() {
                if ms > 0 {
                    return Some(Duration::from_millis(ms));
                }
            }
        }

        if let Some(v) = headers.get("retry-after").and_then(|h| h.to_str().ok()) {
            let trimmed = v.trim();
            if let Ok(secs) = trimmed.parse::<u64>() {
                if secs > 0 {
                    return Some(Duration::from_secs(secs));
                }
            }

            if let Ok(http_date) = DateTime::parse_from_rfc2822(trimmed) {
                let now = Utc::now();
                let target = http_date.with_timezone(&Utc);
                if target > now {
                    let millis = (target - now).num_milliseconds();
                    if millis > 0 {
                        return Some(Duration::from_millis(millis as u64));
                    }
                }
            }
        }

        None
    }
}

#[async_trait::async_trait]
impl Provider for OpenAICompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
        retry_policy: Option<&RetryPolicy>,
    ) -> Result<ChatResponse> {
        self.request_chat(
            serde_json::json!({
                "model": options.model_override.as_deref().unwrap_or(&self.model),
                "messages": messages,
                "max_tokens": options.max_tokens
            }),
            retry_policy,
        )
        .await
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/models", self.base_url);
        match self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
        {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

pub struct AnthropicProvider {
    client: Client,
    name: String,
    api_key: String,
    base_url: String,
    model: String,
}

impl AnthropicProvider {
    pub fn new(
        name: String,
        api_key: String,
        base_url: Option<String>,
        model: Option<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            name,
            api_key,
            base_url: base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            model: model.unwrap_or_else(|| "claude-3-5-haiku-latest".to_string()),
        }
    }

    fn convert_messages_to_anthropic(
        messages: &[ChatMessage],
    ) -> (Option<String>, Vec<serde_json::Value>) {
        let mut system_prompt: Option<String> = None;
        let mut anthropic_messages: Vec<serde_json::Value> = Vec::new();

        for msg in messages {
            match msg.role.as_str() {
                "system" => {
                    system_prompt = Some(msg.text());
                }
                "user" | "assistant" => {
                    let content_blocks: Vec<serde_json::Value> = match &msg.content {
                        MessageContent::Text(text) => vec![serde_json::json!({
                            "type": "text",
                            "text": text
                        })],
                        MessageContent::Parts(parts) => parts
                            .iter()
                            .map(|part| match part {
                                ContentPart::Text { text } => serde_json::json!({
                                    "type": "text",
                                    "text": text
                                }),
                                ContentPart::ImageUrl { image_url } => serde_json::json!({
                                    "type": "image",
                                    "source": {
                                        "type": "url",
                                        "url": image_url.url
                                    }
                                }),
                            })
                            .collect(),
                    };

                    if !content_blocks.is_empty() {
                        anthropic_messages.push(serde_json::json!({
                            "role": msg.role,
                            "content": content_blocks
                        }));
                    }
                }
                _ => {}
            }
        }

        (system_prompt, anthropic_messages)
    }

    async fn request_anthropic(
        &self,
        body: serde_json::Value,
        retry_policy: Option<&RetryPolicy>,
    ) -> Result<ChatResponse> {
        let url = format!("{}/v1/messages", self.base_url);
        let policy = retry_policy.cloned().unwrap_or_default();
        let start = Instant::now();
        let mut attempt: u32 = 1;

        loop {
            let response = self
                .client
                .post(&url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match response {
                Ok(response) => {
                    let status = response.status();
                    let headers = response.headers().clone();
                    let raw_body = response.text().await?;

                    if status.is_success() {
                        let parsed: serde_json::Value =
                            serde_json::from_str(&raw_body).map_err(|e| {
                                anyhow!(
                                    "Anthropic response decode failed: {} | body={}",
                                    e,
                                    OpenAICompatibleProvider::truncate_for_error(&raw_body, 600)
                                )
                            })?;
                        return self.parse_anthropic_response(parsed);
                    }

                    let snippet = OpenAICompatibleProvider::truncate_for_error(&raw_body, 600);
                    let error_msg = format!("Anthropic HTTP {} at {}: {}", status, url, snippet);

                    if !OpenAICompatibleProvider::is_retryable_status(status.as_u16()) {
                        return Err(anyhow!(error_msg));
                    }

                    if let Some(delay) = OpenAICompatibleProvider::next_retry_delay(
                        &policy,
                        attempt,
                        &headers,
                        start.elapsed(),
                    ) {
                        tracing::warn!(
                            provider = %self.name,
                            status = %status.as_u16(),
                            attempt = attempt,
                            "Retrying Anthropic request"
                        );
                        sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(anyhow!(error_msg));
                }
                Err(err) => {
                    if !OpenAICompatibleProvider::is_retryable_reqwest(&err) {
                        return Err(err.into());
                    }

                    if let Some(delay) = OpenAICompatibleProvider::next_retry_delay(
                        &policy,
                        attempt,
                        &HeaderMap::new(),
                        start.elapsed(),
                    ) {
                        tracing::warn!(
                            provider = %self.name,
                            attempt = attempt,
                            error = %err,
                            "Retrying Anthropic request after network error"
                        );
                        sleep(delay).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(err.into());
                }
            }
        }
    }

    fn parse_anthropic_response(&self, response: serde_json::Value) -> Result<ChatResponse> {
        if let Some(error) = response.get("error") {
            return Err(anyhow!("Anthropic API error: {:?}", error));
        }

        let content_blocks = response
            .get("content")
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow!("Missing 'content' array in Anthropic response"))?;

        let mut text_content = String::new();
        for block in content_blocks {
            if block.get("type").and_then(|v| v.as_str()) != Some("text") {
                continue;
            }
            if let Some(text) = block.get("text").and_then(|v| v.as_str()) {
                if !text_content.is_empty() {
                    text_content.push('\n');
                }
                text_content.push_str(text);
            }
        }

        let stop_reason = response
            .get("stop_reason")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let usage = response.get("usage").map(|u| {
            let prompt_tokens =
                u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            let completion_tokens =
                u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
            Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens.saturating_add(completion_tokens),
            }
        });

        let model = response
            .get("model")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.model)
            .to_string();

        Ok(ChatResponse {
            content: if text_content.is_empty() {
                None
            } else {
                Some(text_content)
            },
            model,
            usage,
            finish_reason: stop_reason,
        })
    }
}

#[async_trait::async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(
        &self,
        messages: Vec<ChatMessage>,
        options: &ChatOptions,
        retry_policy: Option<&RetryPolicy>,
    ) -> Result<ChatResponse> {
        let (system, anthropic_messages) = Self::convert_messages_to_anthropic(&messages);

        let mut body = serde_json::json!({
            "model": options.model_override.as_deref().unwrap_or(&self.model),
            "max_tokens": options.max_tokens,
            "messages": anthropic_messages
        });

        if let Some(sys) = system {
            body["system"] = serde_json::json!(sys);
        }

        self.request_anthropic(body, retry_policy).await
    }

    async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/v1/models", self.base_url);
        match self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .send()
            .await
        {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}

pub struct ProviderRouter {
    providers: Vec<Box<dyn Provider>>,
    default_provider: String,
}

impl ProviderRouter {
    pub fn new(default_provider: String) -> Self {
        Self {
            providers: Vec::new(),
            default_provider,
        }
    }

    pub fn add_provider(&mut self, provider: Box<dyn Provider>) {
        self.providers.push(provider);
    }

    /// Falls back to the first registered provider when no default is configured.
    pub fn get_provider(&self, name: Option<&str>) -> Option<&dyn Provider> {
        let name = name.unwrap_or(&self.default_provider);
        if name.is_empty() {
            return self.providers.first().map(|p| p.as_ref());
        }
        self.providers
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.as_ref())
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        AnthropicProvider, ChatMessage, ChatOptions, ChatResponse, OpenAICompatibleProvider,
        Provider, ProviderRouter, RetryPolicy,
    };
    use reqwest::header::{HeaderMap, HeaderValue};
    use std::time::Duration;

    fn openai() -> OpenAICompatibleProvider {
        OpenAICompatibleProvider::new(
            "test".to_string(),
            "key".to_string(),
            None,
            Some("fallback-model".to_string()),
        )
    }

    #[test]
    fn parse_response_errors_on_missing_choices() {
        let response = serde_json::json!({
            "id": "x"
        });

        let parsed = openai().parse_response(response);
        assert!(parsed.is_err());
    }

    #[test]
    fn parse_response_reads_content_and_model() {
        let response = serde_json::json!({
            "model": "real-model",
            "choices": [
                {
                    "message": { "content": "Paris." },
                    "finish_reason": "stop"
                }
            ],
            "usage": {
                "prompt_tokens": 1,
                "completion_tokens": 2,
                "total_tokens": 3
            }
        });

        let parsed = openai()
            .parse_response(response)
            .expect("expected parse success");
        assert_eq!(parsed.content.as_deref(), Some("Paris."));
        assert_eq!(parsed.model, "real-model");
        assert_eq!(parsed.finish_reason.as_deref(), Some("stop"));
        assert_eq!(parsed.usage.map(|u| u.total_tokens), Some(3));
    }

    #[test]
    fn parse_response_keeps_null_content_as_none() {
        let response = serde_json::json!({
            "choices": [
                { "message": { "content": null }, "finish_reason": "length" }
            ]
        });

        let parsed = openai()
            .parse_response(response)
            .expect("expected parse success");
        assert!(parsed.content.is_none());
        assert_eq!(parsed.model, "fallback-model");
    }

    #[test]
    fn image_message_serializes_as_openai_content_parts() {
        let msg = ChatMessage::user_with_image("Describe this", "https://cdn.example.com/a.jpg");
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({
                "role": "user",
                "content": [
                    { "type": "text", "text": "Describe this" },
                    { "type": "image_url", "image_url": { "url": "https://cdn.example.com/a.jpg" } }
                ]
            })
        );
        assert_eq!(msg.text(), "Describe this");
    }

    #[test]
    fn plain_message_serializes_content_as_string() {
        let json = serde_json::to_value(ChatMessage::system("be brief")).expect("serialize");
        assert_eq!(json["content"], "be brief");
    }

    #[test]
    fn anthropic_conversion_lifts_system_and_maps_image_blocks() {
        let messages = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user_with_image("What is this?", "https://cdn.example.com/b.png"),
        ];

        let (system, converted) = AnthropicProvider::convert_messages_to_anthropic(&messages);
        assert_eq!(system.as_deref(), Some("be brief"));
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0]["role"], "user");
        assert_eq!(converted[0]["content"][0]["type"], "text");
        assert_eq!(converted[0]["content"][1]["type"], "image");
        assert_eq!(converted[0]["content"][1]["source"]["type"], "url");
        assert_eq!(
            converted[0]["content"][1]["source"]["url"],
            "https://cdn.example.com/b.png"
        );
    }

    #[test]
    fn anthropic_response_joins_text_blocks() {
        let provider = AnthropicProvider::new("claude".to_string(), "k".to_string(), None, None);
        let response = serde_json::json!({
            "model": "claude-x",
            "content": [
                { "type": "text", "text": "First." },
                { "type": "text", "text": "Second." }
            ],
            "stop_reason": "end_turn",
            "usage": { "input_tokens": 4, "output_tokens": 6 }
        });

        let parsed = provider
            .parse_anthropic_response(response)
            .expect("expected parse success");
        assert_eq!(parsed.content.as_deref(), Some("First.\nSecond."));
        assert_eq!(parsed.usage.map(|u| u.total_tokens), Some(10));
    }

    #[test]
    fn retry_header_precedence_prefers_retry_after_ms() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after-ms", HeaderValue::from_static("1500"));
        headers.insert("retry-after", HeaderValue::from_static("99"));

        let delay =
            OpenAICompatibleProvider::parse_retry_after_headers(&headers).expect("expected delay");
        assert_eq!(delay, Duration::from_millis(1500));
    }

    #[test]
    fn retry_fallback_sequence_has_exponential_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(
            OpenAICompatibleProvider::exponential_delay(&policy, 1),
            Duration::from_secs(2)
        );
        assert_eq!(
            OpenAICompatibleProvider::exponential_delay(&policy, 2),
            Duration::from_secs(4)
        );
        assert_eq!(
            OpenAICompatibleProvider::exponential_delay(&policy, 5),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn retry_delay_is_clamped_to_remaining_window() {
        let policy = RetryPolicy {
            window_secs: 10,
            initial_delay_secs: 8,
            backoff_factor: 2,
            max_delay_secs: 30,
        };
        let delay = OpenAICompatibleProvider::next_retry_delay(
            &policy,
            2,
            &HeaderMap::new(),
            Duration::from_secs(7),
        )
        .expect("delay within window");
        assert_eq!(delay, Duration::from_secs(3));
        assert!(OpenAICompatibleProvider::next_retry_delay(
            &policy,
            1,
            &HeaderMap::new(),
            Duration::from_secs(10)
        )
        .is_none());
    }

    struct Canned(&'static str);

    #[async_trait::async_trait]
    impl Provider for Canned {
        fn name(&self) -> &str {
            self.0
        }

        async fn chat(
            &self,
            _messages: Vec<ChatMessage>,
            _options: &ChatOptions,
            _retry_policy: Option<&RetryPolicy>,
        ) -> anyhow::Result<ChatResponse> {
            Ok(ChatResponse {
                content: Some(format!("from {}", self.0)),
                model: "canned".to_string(),
                usage: None,
                finish_reason: None,
            })
        }

        async fn health_check(&self) -> anyhow::Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn router_uses_default_provider_and_rejects_unknown() {
        let mut router = ProviderRouter::new("b".to_string());
        router.add_provider(Box::new(Canned("a")));
        router.add_provider(Box::new(Canned("b")));

        let provider = router.get_provider(None).expect("default provider");
        let response = provider
            .chat(vec![ChatMessage::user("hi")], &ChatOptions::default(), None)
            .await
            .expect("chat");
        assert_eq!(response.content.as_deref(), Some("from b"));
        assert_eq!(router.provider_names(), vec!["a", "b"]);

        assert!(router.get_provider(Some("zzz")).is_none());
    }

    #[test]
    fn router_without_default_uses_first_provider() {
        let mut router = ProviderRouter::new(String::new());
        router.add_provider(Box::new(Canned("only")));
        assert_eq!(router.get_provider(None).map(|p| p.name()), Some("only"));
    }
}
