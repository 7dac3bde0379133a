//! Outbound channel seam and message pacing

use crate::OutboundMessage;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelFailure {
    #[error("platform rejected message (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("channel closed")]
    Closed,
}

#[async_trait::async_trait]
pub trait OutboundChannel: Send + Sync {
    fn channel_name(&self) -> &str;

    /// Fire-and-forget typing indicator.
    async fn set_typing(&self, sender_id: &str);

    async fn send(&self, sender_id: &str, message: &OutboundMessage) -> Result<(), ChannelFailure>;
}

#[async_trait::async_trait]
pub trait Pacer: Send + Sync {
    async fn pause(&self, delay: Duration);
}

pub struct TokioPacer;

#[async_trait::async_trait]
impl Pacer for TokioPacer {
    async fn pause(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

pub struct InstantPacer;

#[async_trait::async_trait]
impl Pacer for InstantPacer {
    async fn pause(&self, _delay: Duration) {}
}

/// Honors the declared `quiet_delay_ms` and `typing_delay_ms` of each message
/// before handing it to the wrapped channel.
pub struct Paced<C> {
    inner: C,
    pacer: Arc<dyn Pacer>,
}

impl<C: OutboundChannel> Paced<C> {
    pub fn new(inner: C, pacer: Arc<dyn Pacer>) -> Self {
        Self { inner, pacer }
    }
}

#[async_trait::async_trait]
impl<C: OutboundChannel> OutboundChannel for Paced<C> {
    fn channel_name(&self) -> &str {
        self.inner.channel_name()
    }

    async fn set_typing(&self, sender_id: &str) {
        self.inner.set_typing(sender_id).await;
    }

    async fn send(&self, sender_id: &str, message: &OutboundMessage) -> Result<(), ChannelFailure> {
        if message.quiet_delay_ms > 0 {
            self.pacer
                .pause(Duration::from_millis(message.quiet_delay_ms))
                .await;
        }
        if message.typing_delay_ms > 0 {
            self.inner.set_typing(sender_id).await;
            self.pacer
                .pause(Duration::from_millis(message.typing_delay_ms))
                .await;
        }
        self.inner.send(sender_id, message).await
    }
}
