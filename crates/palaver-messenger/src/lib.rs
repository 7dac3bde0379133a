//! Palaver Messenger Adapter
//!
//! Send API channel with message chunking, quick replies, button templates
//! and typing actions, plus webhook payload normalization

pub mod webhook;

use anyhow::{anyhow, Result};
use palaver_config::{Config, MessengerConfig};
use palaver_events::{Button, ButtonAction, ChannelFailure, OutboundChannel, OutboundMessage};
use reqwest::{Client, ClientBuilder};
use std::time::Duration;
use tracing::{debug, warn};

const MESSENGER_MAX_MESSAGE_LEN: usize = 2000;
const MESSENGER_MAX_TEMPLATE_TEXT_LEN: usize = 640;
const MESSENGER_MAX_QUICK_REPLIES: usize = 13;
const MESSENGER_MAX_QUICK_REPLY_TITLE: usize = 20;
const MESSENGER_MAX_BUTTONS: usize = 3;

pub struct MessengerChannel {
    client: Client,
    page_access_token: String,
    endpoint: String,
}

impl MessengerChannel {
    pub fn new(config: &MessengerConfig) -> Self {
        Self {
            client: Self::build_client(),
            page_access_token: config.page_access_token.clone(),
            endpoint: format!(
                "{}/{}/me/messages",
                config.api_base.trim_end_matches('/'),
                config.api_version.trim_matches('/')
            ),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let messenger = config
            .messenger
            .as_ref()
            .ok_or_else(|| anyhow!("[messenger] section is not configured"))?;
        Ok(Self::new(messenger))
    }

    fn build_client() -> Client {
        ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(600))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send API request bodies for one outbound message, in delivery order.
    /// Affordances ride on the last chunk only.
    pub fn build_payloads(sender_id: &str, message: &OutboundMessage) -> Vec<serde_json::Value> {
        let buttons: Vec<&Button> = message.buttons.iter().take(MESSENGER_MAX_BUTTONS).collect();
        let limit = if buttons.is_empty() {
            MESSENGER_MAX_MESSAGE_LEN
        } else {
            MESSENGER_MAX_TEMPLATE_TEXT_LEN
        };
        let chunks = chunk_message(&message.text, limit);
        let last = chunks.len().saturating_sub(1);

        chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                let mut body = if i == last && !buttons.is_empty() {
                    serde_json::json!({
                        "attachment": {
                            "type": "template",
                            "payload": {
                                "template_type": "button",
                                "text": chunk,
                                "buttons": buttons.iter().map(|b| Self::button_json(b)).collect::<Vec<_>>()
                            }
                        }
                    })
                } else {
                    serde_json::json!({ "text": chunk })
                };

                if i == last && !message.quick_replies.is_empty() {
                    body["quick_replies"] = serde_json::json!(message
                        .quick_replies
                        .iter()
                        .take(MESSENGER_MAX_QUICK_REPLIES)
                        .map(|qr| serde_json::json!({
                            "content_type": "text",
                            "title": qr.label.chars().take(MESSENGER_MAX_QUICK_REPLY_TITLE).collect::<String>(),
                            "payload": qr.payload
                        }))
                        .collect::<Vec<_>>());
                }

                serde_json::json!({
                    "recipient": { "id": sender_id },
                    "messaging_type": "RESPONSE",
                    "message": body
                })
            })
            .collect()
    }

    fn button_json(button: &Button) -> serde_json::Value {
        match &button.action {
            ButtonAction::Postback(payload) => serde_json::json!({
                "type": "postback",
                "title": button.label,
                "payload": payload
            }),
            ButtonAction::Url(url) => serde_json::json!({
                "type": "web_url",
                "title": button.label,
                "url": url
            }),
        }
    }

    async fn post(&self, payload: &serde_json::Value) -> Result<(), ChannelFailure> {
        let response = self
            .client
            .post(&self.endpoint)
            .query(&[("access_token", self.page_access_token.as_str())])
            .json(payload)
            .send()
            .await
            .map_err(|e| ChannelFailure::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(ChannelFailure::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait::async_trait]
impl OutboundChannel for MessengerChannel {
    fn channel_name(&self) -> &str {
        "messenger"
    }

    async fn set_typing(&self, sender_id: &str) {
        let payload = serde_json::json!({
            "recipient": { "id": sender_id },
            "sender_action": "typing_on"
        });
        if let Err(e) = self.post(&payload).await {
            debug!(sender_id = %sender_id, "typing_on failed: {}", e);
        }
    }

    async fn send(&self, sender_id: &str, message: &OutboundMessage) -> Result<(), ChannelFailure> {
        for payload in Self::build_payloads(sender_id, message) {
            self.post(&payload).await?;
        }
        Ok(())
    }
}

/// Splits on character boundaries, preferring whitespace and sentence breaks.
pub fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let mut end = (start + max_chars).min(chars.len());

        if end < chars.len() {
            let mut split = end;
            for i in (start..end).rev() {
                let c = chars[i];
                if c == '\n' || c == ' ' || c == '.' || c == '!' || c == '?' {
                    split = i + 1;
                    break;
                }
            }
            if split > start {
                end = split;
            }
        }

        chunks.push(chars[start..end].iter().collect::<String>());
        start = end;
    }

    chunks
}
