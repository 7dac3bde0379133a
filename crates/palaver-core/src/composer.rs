//! Outbound message sequences per turn intent, with declared pacing

use crate::classifier::{QuickReplyAction, CONFIRM_PAYLOAD, MORE_DETAILS_PAYLOAD};
use palaver_config::{Config, PacingConfig};
use palaver_events::{Button, ButtonAction, Locale, OutboundMessage, QuickReply};

pub const ASK_QUESTION_PAYLOAD: &str = "ASK_QUESTION";
pub const SEND_PHOTO_PAYLOAD: &str = "SEND_PHOTO";

#[derive(Debug, Clone)]
pub struct ResponseComposer {
    pacing: PacingConfig,
    help_url: Option<String>,
}

impl ResponseComposer {
    pub fn new(pacing: PacingConfig, help_url: Option<String>) -> Self {
        Self { pacing, help_url }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.pacing.clone(), config.bot.help_url.clone())
    }

    pub fn typing_delay_ms(&self, locale: Locale) -> u64 {
        if locale.is_alternate() {
            self.pacing.typing_delay_ms + self.pacing.alternate_offset_ms
        } else {
            self.pacing.typing_delay_ms
        }
    }

    fn message(&self, locale: Locale, text: &str) -> OutboundMessage {
        OutboundMessage::text(text).with_typing_delay_ms(self.typing_delay_ms(locale))
    }

    pub fn welcome(&self, locale: Locale) -> Vec<OutboundMessage> {
        let text = match locale {
            Locale::English => "Hi there! 👋 I'm happy to help. Ask me anything, or send me a photo and I'll tell you what I see.",
            Locale::Arabic => "أهلاً بك! 👋 يسعدني مساعدتك. اسألني أي سؤال، أو أرسل لي صورة وسأخبرك بما أراه.",
        };
        let (ask, photo) = match locale {
            Locale::English => ("Ask a question", "Send a photo"),
            Locale::Arabic => ("اطرح سؤالاً", "أرسل صورة"),
        };

        let mut welcome = self.message(locale, text).with_quick_replies(vec![
            QuickReply::new(ask, ASK_QUESTION_PAYLOAD),
            QuickReply::new(photo, SEND_PHOTO_PAYLOAD),
        ]);

        if let Some(url) = &self.help_url {
            let label = match locale {
                Locale::English => "Help",
                Locale::Arabic => "مساعدة",
            };
            welcome = welcome.with_buttons(vec![Button {
                label: label.to_string(),
                action: ButtonAction::Url(url.clone()),
            }]);
        }

        vec![welcome]
    }

    pub fn follow_up(&self, locale: Locale) -> OutboundMessage {
        let text = match locale {
            Locale::English => "Did this help?",
            Locale::Arabic => "هل كان هذا مفيداً؟",
        };
        let (confirm, more) = match locale {
            Locale::English => ("Yes, thanks", "More details"),
            Locale::Arabic => ("نعم، شكراً", "تفاصيل أكثر"),
        };

        self.message(locale, text)
            .with_quick_replies(vec![
                QuickReply::new(confirm, CONFIRM_PAYLOAD),
                QuickReply::new(more, MORE_DETAILS_PAYLOAD),
            ])
            .with_quiet_delay_ms(self.pacing.follow_up_quiet_ms)
    }

    /// An accepted reply followed by the "did this help?" prompt.
    pub fn generated(&self, locale: Locale, reply: &str) -> Vec<OutboundMessage> {
        vec![self.message(locale, reply), self.follow_up(locale)]
    }

    pub fn fallback(&self, locale: Locale) -> Vec<OutboundMessage> {
        let text = match locale {
            Locale::English => "Sorry, I couldn't come up with an answer right now. Please try again in a moment.",
            Locale::Arabic => "عذراً، لم أتمكن من الإجابة الآن. من فضلك حاول مرة أخرى بعد قليل.",
        };
        vec![self.message(locale, text)]
    }

    pub fn acknowledgement(&self, locale: Locale, action: QuickReplyAction) -> Vec<OutboundMessage> {
        let text = match (action, locale) {
            (QuickReplyAction::Confirm, Locale::English) => "Glad it helped! 😊",
            (QuickReplyAction::Confirm, Locale::Arabic) => "يسعدني أن ذلك ساعدك! 😊",
            (_, Locale::English) => "Sure, go ahead!",
            (_, Locale::Arabic) => "بالتأكيد، تفضل!",
        };
        vec![self.message(locale, text)]
    }

    /// The last accepted reply again, verbatim; nothing when there is none.
    pub fn elaborate(&self, locale: Locale, last_reply: Option<&str>) -> Vec<OutboundMessage> {
        last_reply
            .map(|reply| vec![self.message(locale, reply)])
            .unwrap_or_default()
    }
}
