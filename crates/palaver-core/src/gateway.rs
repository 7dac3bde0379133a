//! Reply generation seam and its provider-backed implementation

use palaver_config::{Config, GatewayConfig, RetryPolicyConfig};
use palaver_events::Locale;
use palaver_providers::{
    AnthropicProvider, ChatMessage, ChatOptions, OpenAICompatibleProvider, Provider,
    ProviderRouter, RetryPolicy,
};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modality {
    Text,
    Image { url: String },
}

impl Modality {
    pub fn name(&self) -> &'static str {
        match self {
            Modality::Text => "text",
            Modality::Image { .. } => "image",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationFailure {
    #[error("provider error: {0}")]
    Provider(String),
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
    #[error("reply rejected: {reason}")]
    Rejected { reason: String },
    #[error("no provider available: {0}")]
    NoProvider(String),
}

#[async_trait::async_trait]
pub trait GenerationGateway: Send + Sync {
    /// One bounded request. Every failure comes back as a `GenerationFailure`.
    async fn generate(
        &self,
        prompt: &str,
        locale: Locale,
        modality: &Modality,
    ) -> Result<String, GenerationFailure>;
}

pub fn system_instruction(locale: Locale) -> &'static str {
    match locale {
        Locale::English => "You are a friendly, helpful assistant chatting in a messaging app. Answer clearly and concisely in English, in a few short sentences. Avoid markdown.",
        Locale::Arabic => "أنت مساعد ودود ومفيد تتحدث عبر تطبيق مراسلة. أجب بوضوح وإيجاز باللغة العربية في جمل قصيرة قليلة. تجنب تنسيق ماركداون.",
    }
}

pub fn image_instruction(locale: Locale) -> &'static str {
    match locale {
        Locale::English => "Describe what you see in this image and point out anything useful about it.",
        Locale::Arabic => "صف ما تراه في هذه الصورة وأشر إلى أي شيء مفيد بخصوصها.",
    }
}

/// Asks for a fresh explanation of a question the sender has already asked.
pub fn reexplain_prompt(locale: Locale, question: &str, previous_reply: Option<&str>) -> String {
    match (locale, previous_reply) {
        (Locale::English, Some(reply)) => format!(
            "I asked: \"{}\" and you answered: \"{}\". I did not quite get it. Please explain it differently, in simpler words.",
            question, reply
        ),
        (Locale::English, None) => format!(
            "I asked: \"{}\" before. Please explain it differently, in simpler words.",
            question
        ),
        (Locale::Arabic, Some(reply)) => format!(
            "سألت: \"{}\" وأجبت: \"{}\". لم أفهم تماماً. من فضلك اشرح ذلك بطريقة مختلفة وبكلمات أبسط.",
            question, reply
        ),
        (Locale::Arabic, None) => format!(
            "سألت: \"{}\" من قبل. من فضلك اشرح ذلك بطريقة مختلفة وبكلمات أبسط.",
            question
        ),
    }
}

/// Trims and enforces the minimum length, counted in characters.
pub fn validate_reply(
    content: Option<&str>,
    min_reply_chars: usize,
) -> Result<String, GenerationFailure> {
    let text = content.map(str::trim).unwrap_or_default();
    if text.is_empty() {
        return Err(GenerationFailure::Rejected {
            reason: "empty reply".to_string(),
        });
    }
    let chars = text.chars().count();
    if chars < min_reply_chars {
        return Err(GenerationFailure::Rejected {
            reason: format!("reply too short ({} < {} chars)", chars, min_reply_chars),
        });
    }
    Ok(text.to_string())
}

pub fn retry_policy_from_config(config: Option<&RetryPolicyConfig>) -> RetryPolicy {
    let default = RetryPolicy::default();
    if let Some(cfg) = config {
        RetryPolicy {
            window_secs: cfg.window_secs.unwrap_or(default.window_secs),
            initial_delay_secs: cfg.initial_delay_secs.unwrap_or(default.initial_delay_secs),
            backoff_factor: cfg.backoff_factor.unwrap_or(default.backoff_factor),
            max_delay_secs: cfg.max_delay_secs.unwrap_or(default.max_delay_secs),
        }
    } else {
        default
    }
}

pub fn router_from_config(config: &Config) -> ProviderRouter {
    let mut router = ProviderRouter::new(config.providers.default_provider.clone());

    for provider_config in &config.providers.providers {
        let provider_type = provider_config
            .provider_type
            .as_deref()
            .map(|t| t.trim().to_lowercase())
            .unwrap_or_else(|| "openai".to_string());

        let provider: Box<dyn Provider> = match provider_type.as_str() {
            "anthropic" => Box::new(AnthropicProvider::new(
                provider_config.name.clone(),
                provider_config.api_key.clone(),
                provider_config.base_url.clone(),
                provider_config.model.clone(),
            )),
            _ => Box::new(OpenAICompatibleProvider::new(
                provider_config.name.clone(),
                provider_config.api_key.clone(),
                provider_config.base_url.clone(),
                provider_config.model.clone(),
            )),
        };
        router.add_provider(provider);
    }

    router
}

pub struct ProviderGateway {
    router: ProviderRouter,
    options: ChatOptions,
    retry_policy: RetryPolicy,
    timeout: Duration,
    min_reply_chars: usize,
}

impl ProviderGateway {
    pub fn new(router: ProviderRouter, config: &GatewayConfig) -> Self {
        Self {
            router,
            options: ChatOptions {
                max_tokens: config.max_tokens,
                model_override: None,
            },
            retry_policy: retry_policy_from_config(config.retry.as_ref()),
            timeout: Duration::from_secs(config.timeout_secs),
            min_reply_chars: config.min_reply_chars,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(router_from_config(config), &config.gateway)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn router(&self) -> &ProviderRouter {
        &self.router
    }

    fn build_messages(prompt: &str, locale: Locale, modality: &Modality) -> Vec<ChatMessage> {
        let system = ChatMessage::system(system_instruction(locale));
        let user = match modality {
            Modality::Text => ChatMessage::user(prompt),
            Modality::Image { url } => ChatMessage::user_with_image(image_instruction(locale), url),
        };
        vec![system, user]
    }
}

#[async_trait::async_trait]
impl GenerationGateway for ProviderGateway {
    async fn generate(
        &self,
        prompt: &str,
        locale: Locale,
        modality: &Modality,
    ) -> Result<String, GenerationFailure> {
        let provider = self
            .router
            .get_provider(None)
            .ok_or_else(|| GenerationFailure::NoProvider("no default provider registered".to_string()))?;

        let messages = Self::build_messages(prompt, locale, modality);
        debug!(
            provider = %provider.name(),
            locale = %locale,
            modality = modality.name(),
            "Requesting generation"
        );

        let request = provider.chat(messages, &self.options, Some(&self.retry_policy));
        let response = match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(provider = %provider.name(), "Generation request failed: {}", e);
                return Err(GenerationFailure::Provider(e.to_string()));
            }
            Err(_) => return Err(GenerationFailure::Timeout(self.timeout)),
        };

        validate_reply(response.content.as_deref(), self.min_reply_chars)
    }
}
