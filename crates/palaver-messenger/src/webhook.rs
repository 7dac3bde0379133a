//! Messenger webhook payloads and their normalization into inbound events

use palaver_events::InboundEvent;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub object: String,
    #[serde(default)]
    pub entry: Vec<WebhookEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEntry {
    pub id: String,
    #[serde(default)]
    pub time: Option<i64>,
    #[serde(default)]
    pub messaging: Vec<MessagingEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingEvent {
    pub sender: Participant,
    #[serde(default)]
    pub recipient: Option<Participant>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub message: Option<WebhookMessage>,
    #[serde(default)]
    pub postback: Option<WebhookPostback>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookMessage {
    #[serde(default)]
    pub mid: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub is_echo: bool,
    #[serde(default)]
    pub quick_reply: Option<WebhookQuickReply>,
    #[serde(default)]
    pub attachments: Vec<WebhookAttachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookQuickReply {
    pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAttachment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Option<AttachmentPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentPayload {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPostback {
    #[serde(default)]
    pub title: Option<String>,
    pub payload: String,
}

/// One event per messaging entry the dispatcher can act on, in arrival order.
pub fn normalize(payload: &WebhookPayload) -> Vec<InboundEvent> {
    payload
        .entry
        .iter()
        .flat_map(|entry| entry.messaging.iter())
        .filter_map(normalize_messaging)
        .collect()
}

fn normalize_messaging(event: &MessagingEvent) -> Option<InboundEvent> {
    let sender_id = event.sender.id.as_str();

    if let Some(postback) = &event.postback {
        return Some(InboundEvent::quick_reply(sender_id, &postback.payload));
    }

    let message = event.message.as_ref()?;
    if message.is_echo {
        debug!(sender_id = %sender_id, "Skipping echo message");
        return None;
    }

    if let Some(quick_reply) = &message.quick_reply {
        return Some(InboundEvent::quick_reply(sender_id, &quick_reply.payload));
    }

    let image_url = message
        .attachments
        .iter()
        .filter(|a| a.kind == "image")
        .find_map(|a| a.payload.as_ref().and_then(|p| p.url.as_deref()));
    if let Some(url) = image_url {
        return Some(InboundEvent::image(sender_id, url));
    }

    match message.text.as_deref() {
        Some(text) if !text.trim().is_empty() => Some(InboundEvent::text(sender_id, text)),
        _ => {
            debug!(sender_id = %sender_id, "Ignoring message without usable content");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{normalize, WebhookPayload};
    use palaver_events::InboundPayload;

    fn parse(json: &str) -> WebhookPayload {
        serde_json::from_str(json).expect("webhook payload")
    }

    #[test]
    fn normalizes_text_quick_reply_and_postback() {
        let payload = parse(
            r#"{
                "object": "page",
                "entry": [{
                    "id": "page-1",
                    "time": 1700000000,
                    "messaging": [
                        { "sender": {"id": "u1"}, "message": {"mid": "m1", "text": "hello"} },
                        { "sender": {"id": "u2"}, "message": {"mid": "m2", "text": "Yes, thanks", "quick_reply": {"payload": "CONFIRM"}} },
                        { "sender": {"id": "u3"}, "postback": {"title": "Get started", "payload": "GET_STARTED"} }
                    ]
                }]
            }"#,
        );

        let events = normalize(&payload);
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0].payload,
            InboundPayload::Text {
                text: "hello".to_string()
            }
        );
        assert_eq!(
            events[1].payload,
            InboundPayload::QuickReply {
                payload: "CONFIRM".to_string()
            }
        );
        assert_eq!(events[2].sender_id, "u3");
        assert_eq!(events[2].kind(), "quick_reply");
    }

    #[test]
    fn first_image_attachment_wins_over_text() {
        let payload = parse(
            r#"{
                "object": "page",
                "entry": [{
                    "id": "page-1",
                    "messaging": [{
                        "sender": {"id": "u1"},
                        "message": {
                            "text": "look",
                            "attachments": [
                                {"type": "audio", "payload": {"url": "https://cdn.example.com/a.mp4"}},
                                {"type": "image", "payload": {"url": "https://cdn.example.com/1.jpg"}},
                                {"type": "image", "payload": {"url": "https://cdn.example.com/2.jpg"}}
                            ]
                        }
                    }]
                }]
            }"#,
        );

        let events = normalize(&payload);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].payload,
            InboundPayload::Image {
                image_url: "https://cdn.example.com/1.jpg".to_string()
            }
        );
    }

    #[test]
    fn echoes_and_empty_messages_are_skipped() {
        let payload = parse(
            r#"{
                "object": "page",
                "entry": [{
                    "id": "page-1",
                    "messaging": [
                        { "sender": {"id": "page-1"}, "message": {"text": "our own reply", "is_echo": true} },
                        { "sender": {"id": "u1"}, "message": {"text": "   "} },
                        { "sender": {"id": "u1"}, "message": {"attachments": [{"type": "sticker"}]} },
                        { "sender": {"id": "u1"} }
                    ]
                }]
            }"#,
        );

        assert!(normalize(&payload).is_empty());
    }
}
