//! Terminal rendering of outbound messages

use palaver_events::{ButtonAction, ChannelFailure, OutboundChannel, OutboundMessage};
use std::io::Write;

pub struct ConsoleChannel;

impl ConsoleChannel {
    pub fn render(sender_id: &str, message: &OutboundMessage) -> String {
        let mut out = format!("bot → {}: {}", sender_id, message.text);
        for reply in &message.quick_replies {
            out.push_str(&format!("\n    [{}] /qr {}", reply.label, reply.payload));
        }
        for button in &message.buttons {
            let target = match &button.action {
                ButtonAction::Postback(payload) => format!("/qr {}", payload),
                ButtonAction::Url(url) => url.clone(),
            };
            out.push_str(&format!("\n    <{}> {}", button.label, target));
        }
        out
    }
}

#[async_trait::async_trait]
impl OutboundChannel for ConsoleChannel {
    fn channel_name(&self) -> &str {
        "console"
    }

    async fn set_typing(&self, sender_id: &str) {
        println!("bot → {}: …", sender_id);
    }

    async fn send(&self, sender_id: &str, message: &OutboundMessage) -> Result<(), ChannelFailure> {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", Self::render(sender_id, message))
            .and_then(|_| stdout.flush())
            .map_err(|_| ChannelFailure::Closed)
    }
}
