//! Turn classification: a pure function of the post-increment sender state
//! and the inbound event

use crate::similarity::overlap;
use palaver_events::{InboundEvent, InboundPayload};
use palaver_storage::SenderState;

/// Overlap a text must strictly exceed to count as a repeat of the last question.
pub const REPEAT_THRESHOLD: f64 = 0.7;

pub const CONFIRM_PAYLOAD: &str = "CONFIRM";
pub const MORE_DETAILS_PAYLOAD: &str = "MORE_DETAILS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuickReplyAction {
    Confirm,
    MoreDetails,
    Other,
}

impl QuickReplyAction {
    pub fn parse(payload: &str) -> Self {
        let payload = payload.trim();
        if payload.eq_ignore_ascii_case(CONFIRM_PAYLOAD) {
            QuickReplyAction::Confirm
        } else if payload.eq_ignore_ascii_case(MORE_DETAILS_PAYLOAD)
            || payload.eq_ignore_ascii_case("more-details")
        {
            QuickReplyAction::MoreDetails
        } else {
            QuickReplyAction::Other
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnIntent {
    FirstContact,
    /// `Confirm` or `Other`; `MoreDetails` always becomes `QuickReplyElaborate`.
    QuickReplyAck(QuickReplyAction),
    QuickReplyElaborate,
    RepeatedQuestion,
    GenerateTextReply,
    GenerateImageReply,
}

impl TurnIntent {
    pub fn name(&self) -> &'static str {
        match self {
            TurnIntent::FirstContact => "first_contact",
            TurnIntent::QuickReplyAck(_) => "quick_reply_ack",
            TurnIntent::QuickReplyElaborate => "quick_reply_elaborate",
            TurnIntent::RepeatedQuestion => "repeated_question",
            TurnIntent::GenerateTextReply => "generate_text_reply",
            TurnIntent::GenerateImageReply => "generate_image_reply",
        }
    }
}

impl std::fmt::Display for TurnIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// `state` is the value returned by the upsert, so `turn_count == 1` marks the
/// very first turn. Precedence: quick reply, first contact, image, repeat, text.
pub fn classify(state: &SenderState, event: &InboundEvent) -> TurnIntent {
    match &event.payload {
        InboundPayload::QuickReply { payload } => match QuickReplyAction::parse(payload) {
            QuickReplyAction::MoreDetails => TurnIntent::QuickReplyElaborate,
            action => TurnIntent::QuickReplyAck(action),
        },
        _ if state.turn_count <= 1 => TurnIntent::FirstContact,
        InboundPayload::Image { .. } => TurnIntent::GenerateImageReply,
        InboundPayload::Text { text } => match state.last_inbound_text.as_deref() {
            Some(previous) if overlap(previous, text) > REPEAT_THRESHOLD => {
                TurnIntent::RepeatedQuestion
            }
            _ => TurnIntent::GenerateTextReply,
        },
    }
}
