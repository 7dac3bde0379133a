//! Palaver Events
//!
//! Normalized inbound events, outbound messages and the in-process event bus
//! shared by the platform adapters and the dispatcher core

pub mod channel;

pub use channel::{ChannelFailure, InstantPacer, OutboundChannel, Paced, Pacer, TokioPacer};

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

static NEXT_TRACE_COUNTER: AtomicU64 = AtomicU64::new(1);

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn generate_trace_id() -> String {
    let ts = now_unix_secs();
    let n = NEXT_TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("trace-{}-{}", ts, n)
}

/// Conversation language mode. `English` is the default locale, `Arabic`
/// the alternate one selected by script detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Locale {
    #[default]
    #[serde(rename = "en")]
    English,
    #[serde(rename = "ar")]
    Arabic,
}

impl Locale {
    pub fn is_alternate(self) -> bool {
        matches!(self, Locale::Arabic)
    }

    pub fn code(self) -> &'static str {
        match self {
            Locale::English => "en",
            Locale::Arabic => "ar",
        }
    }
}

impl std::str::FromStr for Locale {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "en" | "english" | "default" => Ok(Locale::English),
            "ar" | "arabic" | "alternate" => Ok(Locale::Arabic),
            _ => Err(format!("Unknown locale: {}", s)),
        }
    }
}

impl std::fmt::Display for Locale {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InboundPayload {
    Text { text: String },
    Image { image_url: String },
    QuickReply { payload: String },
}

/// One normalized event handed over by the webhook transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    #[serde(default = "generate_trace_id")]
    pub trace_id: String,
    pub sender_id: String,
    pub payload: InboundPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidEvent {
    #[error("sender id is empty")]
    EmptySender,
    #[error("text event has no text")]
    EmptyText,
    #[error("quick reply event has no payload")]
    EmptyPayload,
    #[error("image url is not a valid http(s) url: {0}")]
    BadImageUrl(String),
}

impl InboundEvent {
    pub fn new(sender_id: &str, payload: InboundPayload) -> Self {
        Self {
            trace_id: generate_trace_id(),
            sender_id: sender_id.to_string(),
            payload,
        }
    }

    pub fn text(sender_id: &str, text: &str) -> Self {
        Self::new(
            sender_id,
            InboundPayload::Text {
                text: text.to_string(),
            },
        )
    }

    pub fn image(sender_id: &str, image_url: &str) -> Self {
        Self::new(
            sender_id,
            InboundPayload::Image {
                image_url: image_url.to_string(),
            },
        )
    }

    pub fn quick_reply(sender_id: &str, payload: &str) -> Self {
        Self::new(
            sender_id,
            InboundPayload::QuickReply {
                payload: payload.to_string(),
            },
        )
    }

    pub fn kind(&self) -> &'static str {
        match self.payload {
            InboundPayload::Text { .. } => "text",
            InboundPayload::Image { .. } => "image",
            InboundPayload::QuickReply { .. } => "quick_reply",
        }
    }

    /// Free text body, only for text events.
    pub fn body(&self) -> Option<&str> {
        match &self.payload {
            InboundPayload::Text { text } => Some(text.as_str()),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), InvalidEvent> {
        if self.sender_id.trim().is_empty() {
            return Err(InvalidEvent::EmptySender);
        }

        match &self.payload {
            InboundPayload::Text { text } if text.trim().is_empty() => Err(InvalidEvent::EmptyText),
            InboundPayload::QuickReply { payload } if payload.trim().is_empty() => {
                Err(InvalidEvent::EmptyPayload)
            }
            InboundPayload::Image { image_url } => {
                let parsed = url::Url::parse(image_url.trim())
                    .map_err(|e| InvalidEvent::BadImageUrl(format!("{} ({})", image_url, e)))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(InvalidEvent::BadImageUrl(image_url.clone()));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuickReply {
    pub label: String,
    pub payload: String,
}

impl QuickReply {
    pub fn new(label: &str, payload: &str) -> Self {
        Self {
            label: label.to_string(),
            payload: payload.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ButtonAction {
    Postback(String),
    Url(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    pub label: String,
    pub action: ButtonAction,
}

/// A single outbound message. Delays are declared here and only consumed by
/// the channel adapter (see [`Paced`]).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quick_replies: Vec<QuickReply>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<Button>,
    #[serde(default)]
    pub typing_delay_ms: u64,
    /// Silent wait before typing starts; non-zero only for deferred follow-ups.
    #[serde(default)]
    pub quiet_delay_ms: u64,
}

impl OutboundMessage {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Default::default()
        }
    }

    pub fn with_quick_replies(mut self, quick_replies: Vec<QuickReply>) -> Self {
        self.quick_replies = quick_replies;
        self
    }

    pub fn with_buttons(mut self, buttons: Vec<Button>) -> Self {
        self.buttons = buttons;
        self
    }

    pub fn with_typing_delay_ms(mut self, typing_delay_ms: u64) -> Self {
        self.typing_delay_ms = typing_delay_ms;
        self
    }

    pub fn with_quiet_delay_ms(mut self, quiet_delay_ms: u64) -> Self {
        self.quiet_delay_ms = quiet_delay_ms;
        self
    }
}

pub const EVENT_BUS_CAPACITY: usize = 256;

/// Inbound path from transports to the dispatcher runtime. Publishing waits
/// while the queue is full, so accepted events are never dropped.
#[derive(Clone)]
pub struct EventBus {
    inbound: mpsc::Sender<InboundEvent>,
}

impl EventBus {
    /// The bus and the receiver the runtime consumes; the receiver sees the
    /// end of the stream once every bus clone is dropped.
    pub fn channel() -> (Self, mpsc::Receiver<InboundEvent>) {
        Self::with_capacity(EVENT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<InboundEvent>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        (Self { inbound: inbound_tx }, inbound_rx)
    }

    pub async fn publish(&self, event: InboundEvent) -> anyhow::Result<()> {
        self.inbound
            .send(event)
            .await
            .map_err(|e| anyhow::anyhow!("event bus closed, dropped {}", e.0.trace_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_has_trace_id() {
        let event = InboundEvent::text("42", "hello");
        assert!(event.trace_id.starts_with("trace-"));
        assert_eq!(event.kind(), "text");
        assert_eq!(event.body(), Some("hello"));
    }

    #[test]
    fn trace_id_different_for_each_event() {
        let a = InboundEvent::text("42", "hello");
        let b = InboundEvent::text("42", "hello");
        assert_ne!(a.trace_id, b.trace_id);
    }

    #[test]
    fn deserialize_without_trace_id_generates_one() {
        let json = r#"{"sender_id":"7","payload":{"kind":"quick_reply","payload":"CONFIRM"}}"#;
        let event = InboundEvent::from_json(json).expect("deserialize");
        assert!(event.trace_id.starts_with("trace-"));
        assert_eq!(
            event.payload,
            InboundPayload::QuickReply {
                payload: "CONFIRM".to_string()
            }
        );
        assert_eq!(event.body(), None);
    }

    #[test]
    fn validate_rejects_empty_sender_and_blank_text() {
        assert_eq!(
            InboundEvent::text("  ", "hi").validate(),
            Err(InvalidEvent::EmptySender)
        );
        assert_eq!(
            InboundEvent::text("1", "   ").validate(),
            Err(InvalidEvent::EmptyText)
        );
        assert_eq!(
            InboundEvent::quick_reply("1", "").validate(),
            Err(InvalidEvent::EmptyPayload)
        );
    }

    #[test]
    fn validate_checks_image_url_scheme() {
        assert!(InboundEvent::image("1", "https://cdn.example.com/a.jpg")
            .validate()
            .is_ok());
        assert!(matches!(
            InboundEvent::image("1", "file:///etc/passwd").validate(),
            Err(InvalidEvent::BadImageUrl(_))
        ));
        assert!(matches!(
            InboundEvent::image("1", "not a url").validate(),
            Err(InvalidEvent::BadImageUrl(_))
        ));
    }

    #[test]
    fn locale_parses_aliases_and_serializes_as_code() {
        assert_eq!("alternate".parse::<Locale>(), Ok(Locale::Arabic));
        assert_eq!("EN".parse::<Locale>(), Ok(Locale::English));
        assert!("fr".parse::<Locale>().is_err());
        assert_eq!(
            serde_json::to_string(&Locale::Arabic).expect("serialize"),
            "\"ar\""
        );
        assert_eq!(Locale::default(), Locale::English);
    }

    #[test]
    fn outbound_message_skips_empty_affordances() {
        let msg = OutboundMessage::text("hi").with_typing_delay_ms(1200);
        let json = serde_json::to_value(&msg).expect("serialize");
        assert!(json.get("quick_replies").is_none());
        assert!(json.get("buttons").is_none());
        assert_eq!(json["typing_delay_ms"], 1200);
    }

    #[tokio::test]
    async fn bus_delivers_published_events_and_closes() {
        let (bus, mut rx) = EventBus::channel();
        bus.publish(InboundEvent::text("9", "ping"))
            .await
            .expect("publish");
        drop(bus);

        let received = rx.recv().await.expect("recv");
        assert_eq!(received.sender_id, "9");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn full_bus_waits_instead_of_dropping() {
        let (bus, mut rx) = EventBus::with_capacity(1);
        bus.publish(InboundEvent::text("1", "first"))
            .await
            .expect("publish");

        let producer = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.publish(InboundEvent::text("2", "second")).await })
        };
        tokio::task::yield_now().await;
        assert!(!producer.is_finished());

        assert_eq!(rx.recv().await.expect("first").sender_id, "1");
        producer.await.expect("join").expect("publish");
        assert_eq!(rx.recv().await.expect("second").sender_id, "2");
    }

    #[tokio::test]
    async fn publish_after_receiver_dropped_fails() {
        let (bus, rx) = EventBus::channel();
        drop(rx);
        assert!(bus.publish(InboundEvent::text("1", "late")).await.is_err());
    }
}
