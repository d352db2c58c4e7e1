use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// The closed set of moods the classifier chooses between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Emotion {
    Calm,
    Anxious,
    Overwhelmed,
    Low,
    Focused,
    Energized,
    Sad,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown emotion label: {0}")]
pub struct UnknownEmotion(pub String);

/// A short guided exercise suggested for an emotion.
#[derive(Debug, Clone)]
pub struct Ritual {
    pub title: &'static str,
    pub steps: &'static [&'static str],
}

impl Emotion {
    /// Candidate labels in the order they are offered to the classifier.
    pub const ALL: [Emotion; 7] = [
        Emotion::Calm,
        Emotion::Anxious,
        Emotion::Overwhelmed,
        Emotion::Low,
        Emotion::Focused,
        Emotion::Energized,
        Emotion::Sad,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Emotion::Calm => "Calm",
            Emotion::Anxious => "Anxious",
            Emotion::Overwhelmed => "Overwhelmed",
            Emotion::Low => "Low",
            Emotion::Focused => "Focused",
            Emotion::Energized => "Energized",
            Emotion::Sad => "Sad",
        }
    }

    pub fn ritual(&self) -> Ritual {
        match self {
            Emotion::Anxious => Ritual {
                title: "4-7-8 Breathing",
                steps: &[
                    "Sit comfortably.",
                    "Inhale through nose (4s).",
                    "Hold breath (7s).",
                    "Exhale through mouth (8s).",
                    "Repeat 4 times.",
                ],
            },
            Emotion::Overwhelmed => Ritual {
                title: "5-4-3-2-1 Grounding",
                steps: &[
                    "Look around you.",
                    "Name 5 things you see.",
                    "Name 4 things you can feel.",
                    "Name 3 sounds you hear.",
                    "Name 2 smells.",
                    "Name 1 thing you taste.",
                ],
            },
            Emotion::Low => Ritual {
                title: "The Sunlight Viz",
                steps: &[
                    "Close your eyes.",
                    "Imagine a warm golden light.",
                    "Feel it hitting your forehead.",
                    "Let it fill your chest.",
                    "Sit in the warmth for 30s.",
                ],
            },
            Emotion::Sad => Ritual {
                title: "Hand on Heart",
                steps: &[
                    "Place your hand on your heart.",
                    "Feel its beat.",
                    "Take a deep breath.",
                    "Say: 'I am doing my best.'",
                    "Say: 'I am safe.'",
                ],
            },
            Emotion::Energized => Ritual {
                title: "Channel the Fire",
                steps: &[
                    "Stand up.",
                    "Shake your arms out.",
                    "Pick ONE big task.",
                    "Set a timer for 20 mins.",
                    "GO.",
                ],
            },
            Emotion::Calm => Ritual {
                title: "Gratitude Anchor",
                steps: &[
                    "You are in a good place.",
                    "Think of one person you love.",
                    "Send them a mental 'Thank You'.",
                    "Smile.",
                ],
            },
            Emotion::Focused => Ritual {
                title: "Deep Work Entry",
                steps: &[
                    "Put phone in another room.",
                    "Close all tabs except one.",
                    "Write down your single goal.",
                    "Start.",
                ],
            },
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Emotion {
    type Err = UnknownEmotion;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Emotion::ALL
            .into_iter()
            .find(|emotion| emotion.as_str() == s)
            .ok_or_else(|| UnknownEmotion(s.to_string()))
    }
}
