use std::collections::HashSet;

fn word_set(text: &str) -> HashSet<String> {
    text.split_whitespace().map(|w| w.to_lowercase()).collect()
}

/// Shared-word ratio in `[0, 1]`: `|a ∩ b| / max(|a|, |b|)` over lowercase
/// whitespace-separated words. Zero when either side has no words.
pub fn overlap(a: &str, b: &str) -> f64 {
    let left = word_set(a);
    let right = word_set(b);
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }

    let shared = left.intersection(&right).count();
    shared as f64 / left.len().max(right.len()) as f64
}

#[cfg(test)]
mod tests {
    use super::overlap;

    #[test]
    fn identical_text_scores_one() {
        assert_eq!(overlap("what is the capital", "what is the capital"), 1.0);
        assert_eq!(overlap("Hello World", "hello   world"), 1.0);
    }

    #[test]
    fn empty_side_scores_zero() {
        assert_eq!(overlap("", "anything"), 0.0);
        assert_eq!(overlap("anything", "   "), 0.0);
        assert_eq!(overlap("", ""), 0.0);
    }

    #[test]
    fn score_is_symmetric() {
        let pairs = [
            ("what is the capital of France?", "what is the capital of Spain?"),
            ("a b c", "c d"),
            ("one", "one two three four"),
        ];
        for (a, b) in pairs {
            assert_eq!(overlap(a, b), overlap(b, a));
        }
    }

    #[test]
    fn score_uses_larger_set_as_denominator() {
        assert_eq!(overlap("a b", "a b c d"), 0.5);
        // duplicates collapse
        assert_eq!(overlap("a a a", "a"), 1.0);
    }

    #[test]
    fn punctuation_is_part_of_the_word() {
        assert_eq!(overlap("france?", "france"), 0.0);
    }
}
