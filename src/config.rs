use anyhow::{Result, bail};
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::zero_shot::DEFAULT_HYPOTHESIS_TEMPLATE;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Most text/hypothesis pairs sent through one forward pass
    #[arg(long, env = "MAX_BATCH_PAIRS", default_value = "56")]
    pub max_batch_pairs: usize,

    /// Tick duration in milliseconds for batch processing
    #[arg(long, env = "TICK_DURATION_MS", default_value = "100")]
    pub tick_duration_ms: u64,

    /// Server host to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Server port to bind to
    #[arg(long, env = "PORT", default_value = "8000")]
    pub port: u16,

    /// NLI model ID from Hugging Face Hub
    #[arg(
        long,
        env = "MODEL_ID",
        default_value = "MoritzLaurer/DeBERTa-v3-base-mnli-fever-anli"
    )]
    pub model_id: String,

    /// Local path to model directory, takes precedence over the hub
    #[arg(long, env = "MODEL_PATH")]
    pub model_path: Option<PathBuf>,

    /// Model revision/branch on Hugging Face
    #[arg(long, env = "MODEL_REVISION", default_value = "main")]
    pub model_revision: String,

    /// Use PyTorch weights instead of safetensors
    #[arg(long, env = "USE_PTH")]
    pub use_pth: bool,

    /// Run on CPU instead of GPU
    #[arg(long, env = "CPU_ONLY")]
    pub cpu_only: bool,

    /// Maximum sequence length of a text/hypothesis pair
    #[arg(long, env = "MAX_SEQUENCE_LENGTH", default_value = "512")]
    pub max_sequence_length: usize,

    /// NLI labels mapping in format "0=entailment,1=neutral,2=contradiction"
    #[arg(long, env = "ID2LABEL")]
    pub id2label: Option<String>,

    /// Hypothesis each candidate emotion is substituted into
    #[arg(long, env = "HYPOTHESIS_TEMPLATE", default_value = DEFAULT_HYPOTHESIS_TEMPLATE)]
    pub hypothesis_template: String,

    /// Comma-separated origins allowed by CORS
    #[arg(
        long,
        env = "CORS_ORIGINS",
        default_value = "http://localhost:5173,http://localhost:3000",
        value_delimiter = ','
    )]
    pub cors_origins: Vec<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_batch_pairs: usize,
    pub tick_duration: Duration,
}

impl From<&Config> for BatchConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_batch_pairs: config.max_batch_pairs,
            tick_duration: Duration::from_millis(config.tick_duration_ms),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_pairs == 0 {
            bail!("--max-batch-pairs must be at least 1");
        }
        if self.tick_duration_ms == 0 {
            bail!("--tick-duration-ms must be at least 1");
        }
        if !self.hypothesis_template.contains("{}") {
            bail!(
                "Hypothesis template {:?} has no {{}} placeholder for the label",
                self.hypothesis_template
            );
        }
        Ok(())
    }

    pub fn parse_id2label(&self) -> Option<HashMap<u32, String>> {
        self.id2label.as_ref().map(|labels| {
            labels
                .split(',')
                .filter_map(|pair| {
                    let (id, label) = pair.split_once('=')?;
                    let id = id.trim().parse().ok()?;
                    Some((id, label.trim().to_string()))
                })
                .collect()
        })
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
