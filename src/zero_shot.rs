//! Zero-shot labelling on top of an NLI classifier.
//!
//! Each candidate label becomes a hypothesis paired with the input text. The
//! entailment logits of those pairs are softmaxed across the labels, so the
//! scores for one text always form a distribution.

use anyhow::{Result, bail};
use std::collections::HashMap;

use crate::labels::Emotion;
use crate::types::LabelScore;

pub const DEFAULT_HYPOTHESIS_TEMPLATE: &str = "This example is {}.";

pub fn hypothesis(template: &str, label: Emotion) -> String {
    template.replace("{}", label.as_str())
}

/// Column of the logits holding the entailment class.
///
/// Falls back to the highest class id when the config names no entailment
/// label, which matches the usual `contradiction, neutral, entailment` layout.
pub fn entailment_index(id2label: &HashMap<u32, String>) -> Option<usize> {
    id2label
        .iter()
        .find(|(_, label)| label.to_lowercase().starts_with("entail"))
        .or_else(|| id2label.iter().max_by_key(|(id, _)| **id))
        .map(|(id, _)| *id as usize)
}

pub fn rank(labels: &[Emotion], entailment_logits: &[f32]) -> Result<Vec<LabelScore>> {
    if labels.is_empty() {
        bail!("No candidate labels to rank");
    }
    if labels.len() != entailment_logits.len() {
        bail!(
            "Got {} logits for {} candidate labels",
            entailment_logits.len(),
            labels.len()
        );
    }

    let max = entailment_logits
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max) as f64;
    let exps: Vec<f64> = entailment_logits
        .iter()
        .map(|&logit| (logit as f64 - max).exp())
        .collect();
    let total: f64 = exps.iter().sum();

    let mut scores: Vec<LabelScore> = labels
        .iter()
        .zip(exps)
        .map(|(&label, exp)| LabelScore {
            label,
            score: exp / total,
        })
        .collect();
    // Stable, so equal scores keep label order.
    scores.sort_by(|a, b| b.score.total_cmp(&a.score));

    Ok(scores)
}
