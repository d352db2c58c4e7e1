use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::labels::Emotion;

#[derive(Debug, Clone, Deserialize)]
pub struct PredictRequest {
    pub text: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PredictResponse {
    pub emotion: String,
    pub confidence: f64,
    pub all_scores: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub text: String,
    pub mood: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub reply: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct RitualResponse {
    pub emotion: Emotion,
    pub title: &'static str,
    pub steps: &'static [&'static str],
}

/// One text scored against a set of candidate labels.
#[derive(Debug, Clone)]
pub struct ZeroShotRequest {
    pub text: String,
    pub labels: Vec<Emotion>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LabelScore {
    pub label: Emotion,
    pub score: f64,
}

/// Scores for every candidate label, best first.
#[derive(Debug, Clone)]
pub struct ZeroShotResponse {
    pub scores: Vec<LabelScore>,
}

impl ZeroShotResponse {
    /// `None` when no label was scored.
    pub fn into_prediction(self) -> Option<PredictResponse> {
        let top = *self.scores.first()?;
        Some(PredictResponse {
            emotion: top.label.to_string(),
            confidence: top.score,
            all_scores: self
                .scores
                .into_iter()
                .map(|s| (s.label.to_string(), s.score))
                .collect(),
        })
    }
}
