use anyhow::{Result, bail};
use async_trait::async_trait;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::debertav2::{
    Config as DebertaV2Config, DebertaV2SeqClassificationModel, Id2Label,
};
use hf_hub::{Repo, RepoType, api::tokio::Api};
use std::collections::HashMap;
use std::ops::Range;
use std::path::PathBuf;
use tokenizers::{PaddingParams, Tokenizer};

use crate::engine::BatchedEngine;
use crate::types::{ZeroShotRequest, ZeroShotResponse};
use crate::zero_shot;

/// Zero-shot classifier backed by a DeBERTa-v2/v3 model fine-tuned on NLI.
pub struct NliZeroShotEngine {
    model: DebertaV2SeqClassificationModel,
    tokenizer: Tokenizer,
    device: Device,
    entailment_index: usize,
    hypothesis_template: String,
}

#[derive(Debug, Clone)]
pub struct NliConfig {
    pub model_id: String,
    pub model_path: Option<PathBuf>,
    pub revision: String,
    pub use_pth: bool,
    pub cpu: bool,
    pub max_sequence_length: usize,
    pub id2label: Option<HashMap<u32, String>>,
    pub hypothesis_template: String,
}

impl NliZeroShotEngine {
    fn device(cpu: bool) -> Result<Device> {
        if cpu {
            Ok(Device::Cpu)
        } else if metal_is_available() {
            tracing::info!("Using metal acceleration");
            Ok(Device::new_metal(0)?)
        } else if cuda_is_available() {
            tracing::info!("Using CUDA GPU acceleration");
            Ok(Device::new_cuda(0)?)
        } else {
            tracing::info!(
                "CUDA not available, running on CPU. To run on GPU, build with `--features cuda`"
            );
            Ok(Device::Cpu)
        }
    }

    /// Local directory wins over the hub when both are configured.
    async fn model_files(config: &NliConfig) -> Result<(PathBuf, PathBuf, PathBuf)> {
        let weights_name = if config.use_pth {
            "pytorch_model.bin"
        } else {
            "model.safetensors"
        };

        match &config.model_path {
            Some(base_path) => {
                if !base_path.is_dir() {
                    bail!("Model path {} is not a directory.", base_path.display());
                }
                Ok((
                    base_path.join("config.json"),
                    base_path.join("tokenizer.json"),
                    base_path.join(weights_name),
                ))
            }
            None => {
                let repo = Repo::with_revision(
                    config.model_id.clone(),
                    RepoType::Model,
                    config.revision.clone(),
                );
                let api = Api::new()?;
                let api = api.repo(repo);
                Ok((
                    api.get("config.json").await?,
                    api.get("tokenizer.json").await?,
                    api.get(weights_name).await?,
                ))
            }
        }
    }

    #[tracing::instrument(skip(config), fields(model_id = %config.model_id, model_path = ?config.model_path, cpu = config.cpu))]
    pub async fn new(config: NliConfig) -> Result<Self> {
        let device = Self::device(config.cpu)?;

        let (config_filename, tokenizer_filename, weights_filename) =
            Self::model_files(&config).await?;

        let model_config = std::fs::read_to_string(config_filename)?;
        let model_config: DebertaV2Config = serde_json::from_str(&model_config)?;

        // Command-line id2label takes precedence. Otherwise, use model config's id2label.
        let id2label: Id2Label = if let Some(id2label) = config.id2label {
            id2label
        } else if let Some(id2label) = &model_config.id2label {
            id2label.clone()
        } else {
            bail!("Id2Label not found in the model configuration nor specified as a parameter");
        };

        let Some(entailment_index) = zero_shot::entailment_index(&id2label) else {
            bail!("Id2Label is empty, cannot locate the entailment class");
        };
        if entailment_index >= id2label.len() {
            bail!(
                "Entailment class id {entailment_index} is out of range for {} classes",
                id2label.len()
            );
        }
        tracing::info!(
            entailment_index,
            label = %id2label[&(entailment_index as u32)],
            "Resolved entailment class"
        );

        let mut tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;
        tokenizer.with_padding(Some(PaddingParams::default()));
        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: config.max_sequence_length,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("Tokenizer truncation error: {e}"))?;

        let vb = if config.use_pth {
            VarBuilder::from_pth(
                &weights_filename,
                candle_transformers::models::debertav2::DTYPE,
                &device,
            )?
        } else {
            unsafe {
                VarBuilder::from_mmaped_safetensors(
                    &[weights_filename],
                    candle_transformers::models::debertav2::DTYPE,
                    &device,
                )?
            }
        };

        let vb = vb.set_prefix("deberta");
        let model = DebertaV2SeqClassificationModel::load(vb, &model_config, Some(id2label))?;

        Ok(Self {
            model,
            tokenizer,
            device,
            entailment_index,
            hypothesis_template: config.hypothesis_template,
        })
    }

    fn stack(rows: &[Vec<u32>], device: &Device) -> Result<Tensor> {
        let tensors = rows
            .iter()
            .map(|row| Tensor::new(row.as_slice(), device))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Tensor::stack(&tensors, 0)?)
    }
}

#[async_trait]
impl BatchedEngine for NliZeroShotEngine {
    #[tracing::instrument(skip(self, requests), fields(requests = requests.len()))]
    async fn classify_batch(
        &self,
        requests: Vec<ZeroShotRequest>,
    ) -> Result<Vec<Result<ZeroShotResponse>>> {
        // Every (text, hypothesis) pair of every request goes through one forward pass
        let (pairs, request_boundaries) = pair_inputs(&requests, &self.hypothesis_template);

        if pairs.is_empty() {
            return Ok(requests
                .iter()
                .map(|_| Err(anyhow::anyhow!("No candidate labels to score")))
                .collect());
        }

        let tokenizer_clone = self.tokenizer.clone();
        let (input_ids, attention_mask, token_type_ids) =
            tokio::task::spawn_blocking(move || {
                tokenizer_clone
                    .encode_batch(pairs, true)
                    .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))
                    .map(|encodings| {
                        let mut input_id_stack = Vec::with_capacity(encodings.len());
                        let mut attention_mask_stack = Vec::with_capacity(encodings.len());
                        let mut token_type_id_stack = Vec::with_capacity(encodings.len());

                        for encoding in &encodings {
                            input_id_stack.push(encoding.get_ids().to_vec());
                            attention_mask_stack.push(encoding.get_attention_mask().to_vec());
                            token_type_id_stack.push(encoding.get_type_ids().to_vec());
                        }

                        (input_id_stack, attention_mask_stack, token_type_id_stack)
                    })
            })
            .await??;

        let input_ids = Self::stack(&input_ids, &self.device)?;
        let attention_mask = Self::stack(&attention_mask, &self.device)?;
        let token_type_ids = Self::stack(&token_type_ids, &self.device)?;

        let logits = self
            .model
            .forward(&input_ids, Some(token_type_ids), Some(attention_mask))?;
        let logits = logits.to_vec2::<f32>()?;

        score_requests(
            &requests,
            &request_boundaries,
            &logits,
            self.entailment_index,
        )
    }
}

/// Flattens requests into NLI inputs, recording which rows belong to which request.
fn pair_inputs(
    requests: &[ZeroShotRequest],
    hypothesis_template: &str,
) -> (Vec<(String, String)>, Vec<Range<usize>>) {
    let mut pairs = Vec::new();
    let mut request_boundaries = Vec::with_capacity(requests.len());
    for request in requests {
        let start = pairs.len();
        pairs.extend(request.labels.iter().map(|&label| {
            (
                request.text.clone(),
                zero_shot::hypothesis(hypothesis_template, label),
            )
        }));
        request_boundaries.push(start..pairs.len());
    }
    (pairs, request_boundaries)
}

/// Splits one logits matrix (a row per pair) back into per-request rankings.
fn score_requests(
    requests: &[ZeroShotRequest],
    request_boundaries: &[Range<usize>],
    logits: &[Vec<f32>],
    entailment_index: usize,
) -> Result<Vec<Result<ZeroShotResponse>>> {
    let entailment_logits = logits
        .iter()
        .map(|row| {
            row.get(entailment_index).copied().ok_or_else(|| {
                anyhow::anyhow!(
                    "Model returned {} classes, entailment column is {entailment_index}",
                    row.len()
                )
            })
        })
        .collect::<Result<Vec<f32>>>()?;

    if let Some(last) = request_boundaries.last() {
        if last.end > entailment_logits.len() {
            bail!(
                "Model returned {} rows for {} pairs",
                entailment_logits.len(),
                last.end
            );
        }
    }

    Ok(requests
        .iter()
        .zip(request_boundaries)
        .map(|(request, range)| {
            zero_shot::rank(&request.labels, &entailment_logits[range.clone()])
                .map(|scores| ZeroShotResponse { scores })
        })
        .collect())
}
