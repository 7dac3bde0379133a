use palaver_events::Locale;
use palaver_storage::SenderState;

fn is_arabic_script(c: char) -> bool {
    matches!(
        c as u32,
        0x0600..=0x06FF | 0x0750..=0x077F | 0x08A0..=0x08FF | 0xFB50..=0xFDFF | 0xFE70..=0xFEFF
    )
}

/// `Arabic` as soon as one Arabic-block code point appears; empty text is `English`.
pub fn detect_script(text: &str) -> Locale {
    if text.chars().any(is_arabic_script) {
        Locale::Arabic
    } else {
        Locale::English
    }
}

/// Effective locale for this turn. Never reverts a stored `Arabic` preference.
pub fn resolve_locale(state: &SenderState, inbound_text: &str) -> Locale {
    if state.preferred_language.is_alternate() || detect_script(inbound_text).is_alternate() {
        Locale::Arabic
    } else {
        Locale::English
    }
}

/// The preference flip the caller must persist, if any.
pub fn language_flip(state: &SenderState, inbound_text: &str) -> Option<Locale> {
    let detected = detect_script(inbound_text);
    (detected.is_alternate() && !state.preferred_language.is_alternate()).then_some(detected)
}
