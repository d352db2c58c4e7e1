//! Canned reflective replies for `/chat`.
//!
//! Keyword rules are checked in order against the lower-cased text and the
//! first hit wins. Only when no keyword matches does the caller's mood pick
//! the reply.

const KEYWORD_RULES: &[(&[&str], &str)] = &[
    (
        &["why"],
        "It's natural to look for reasons. Sometimes feelings just exist.",
    ),
    (
        &["tired", "sleep"],
        "Rest is productive too. Have you slept well lately?",
    ),
    (
        &["work", "job"],
        "Work carries a heavy weight. Remember you are more than your output.",
    ),
    (
        &["scared", "afraid"],
        "Fear is just a reaction. You are safe right now.",
    ),
];

const MOOD_RULES: &[(&str, &str)] = &[
    (
        "Anxious",
        "Take a breath. That anxiety is trying to protect you, but you are safe.",
    ),
    (
        "Sad",
        "Be gentle with yourself. This feeling is heavy, but it will pass.",
    ),
    (
        "Energized",
        "Hold onto that energy! What is one small thing you can do with it?",
    ),
];

pub const GENERIC_REPLY: &str = "I hear you. Tell me more about that.";

/// Pick the reply for `text` written in `mood`. Mood matching is exact.
pub fn reflect(text: &str, mood: &str) -> &'static str {
    let text = text.to_lowercase();

    if let Some((_, reply)) = KEYWORD_RULES
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|keyword| text.contains(keyword)))
    {
        return *reply;
    }

    MOOD_RULES
        .iter()
        .find(|(rule_mood, _)| *rule_mood == mood)
        .map(|(_, reply)| *reply)
        .unwrap_or(GENERIC_REPLY)
}
