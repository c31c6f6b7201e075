//! Configuration records
//!
//! The loss engine only reads `DpoConfig`. Everything the training loop and the
//! CLI need lives in `TrainingConfig` and `RunConfig`, validated separately.

use crate::data::ColumnMapping;
use crate::error::{DpoError, DpoResult};
use crate::lora::LoraConfig;
use crate::model::ModelConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
};

pub const DEFAULT_BETA: f64 = 0.1;
pub const DEFAULT_MAX_LENGTH: usize = 512;

/// Which end of the prompt is dropped when a pair exceeds `max_length`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationSide {
    /// Drop the oldest prompt tokens, keeping the context closest to the completion
    #[default]
    Left,
    Right,
}

/// The configuration read by `PreferenceLossEngine` and pair construction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DpoConfig {
    /// Temperature on the implicit reward. Must be positive.
    pub beta: f64,
    /// Maximum length of prompt + completion, in tokens.
    pub max_length: usize,
    pub prompt_truncation: TruncationSide,
}

impl Default for DpoConfig {
    fn default() -> Self {
        Self {
            beta: DEFAULT_BETA,
            max_length: DEFAULT_MAX_LENGTH,
            prompt_truncation: TruncationSide::Left,
        }
    }
}

impl DpoConfig {
    pub fn new(beta: f64) -> Self {
        Self {
            beta,
            ..Default::default()
        }
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn with_prompt_truncation(mut self, side: TruncationSide) -> Self {
        self.prompt_truncation = side;
        self
    }

    pub fn validate(&self) -> DpoResult<()> {
        if !self.beta.is_finite() || self.beta <= 0_f64 {
            return Err(DpoError::InvalidConfiguration(format!(
                "beta must be a positive finite number, got {}",
                self.beta
            )));
        }
        if self.max_length == 0 {
            return Err(DpoError::InvalidConfiguration(
                "max_length must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// How reference log-probabilities are produced
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceMode {
    /// A deep copy of the initial weights, never handed to the optimizer
    #[default]
    SeparateCopy,
    /// The policy itself with its low-rank adapters switched off
    AdapterToggle,
}

/// Prompt framing applied before tokenization
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStyle {
    #[default]
    Raw,
    Instruction,
}

/// Settings of the training loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub num_epochs: usize,
    pub batch_size: usize,
    /// Evaluate every `eval_freq` optimizer steps
    pub eval_freq: usize,
    /// Number of batches averaged per evaluation
    pub eval_iter: usize,
    pub warmup_steps: usize,
    pub seed: u64,
    pub held_out_fraction: f32,
    pub append_eos: bool,
    pub prompt_style: PromptStyle,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 5e-5,
            weight_decay: 0.01,
            num_epochs: 1,
            batch_size: 2,
            eval_freq: 5,
            eval_iter: 5,
            warmup_steps: 0,
            seed: 42,
            held_out_fraction: 0.1,
            append_eos: true,
            prompt_style: PromptStyle::Raw,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> DpoResult<()> {
        let invalid =
            |msg: &str| -> DpoResult<()> { Err(DpoError::InvalidConfiguration(msg.to_string())) };
        if !(self.learning_rate > 0_f64) {
            return invalid("learning_rate must be positive");
        }
        if self.batch_size == 0 {
            return invalid("batch_size must be at least 1");
        }
        if self.eval_freq == 0 || self.eval_iter == 0 {
            return invalid("eval_freq and eval_iter must be at least 1");
        }
        if !(0_f32..1_f32).contains(&self.held_out_fraction) {
            return invalid("held_out_fraction must be in [0, 1)");
        }
        Ok(())
    }
}

/// Where preference records come from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetSource {
    LocalJson {
        path: PathBuf,
    },
    /// JSON file downloaded once into `cache_path`
    Url {
        url: String,
        cache_path: PathBuf,
    },
    /// A parquet file of a Hugging Face Hub dataset repository
    HubParquet {
        repo_id: String,
        filename: String,
        #[serde(default)]
        columns: ColumnMapping,
    },
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenizerSource {
    /// GPT-2 byte-level BPE bundled with `tiktoken-rs`
    #[default]
    Gpt2Bpe,
    /// `tokenizer.json` of a Hugging Face Hub model repository
    HubRepo { repo_id: String, eos_token: String },
    LocalFile { path: PathBuf, eos_token: String },
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("runs").join("dpo")
}

/// Everything `pipeline::run_training` needs, typically read from a JSON file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub dataset: DatasetSource,
    #[serde(default)]
    pub tokenizer: TokenizerSource,
    pub model: ModelConfig,
    /// Path to safetensors weights to start from. Random init when absent.
    #[serde(default)]
    pub init_checkpoint: Option<PathBuf>,
    #[serde(default)]
    pub lora: Option<LoraConfig>,
    #[serde(default)]
    pub dpo: DpoConfig,
    #[serde(default)]
    pub training: TrainingConfig,
    #[serde(default)]
    pub reference_mode: ReferenceMode,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl RunConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let json_str = read_to_string(path.as_ref())
            .with_context(|| format!("Unable to read {}", path.as_ref().display()))?;
        let cfg: RunConfig = serde_json::from_str(&json_str)
            .with_context(|| format!("Invalid run config {}", path.as_ref().display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> DpoResult<()> {
        self.dpo.validate()?;
        self.training.validate()?;
        self.model.validate()?;
        if self.dpo.max_length > self.model.context_length {
            return Err(DpoError::InvalidConfiguration(format!(
                "max_length {} exceeds the model context length {}",
                self.dpo.max_length, self.model.context_length
            )));
        }
        if self.reference_mode == ReferenceMode::AdapterToggle && self.lora.is_none() {
            return Err(DpoError::InvalidConfiguration(
                "reference_mode `adapter_toggle` requires a `lora` section".to_string(),
            ));
        }
        if let Some(lora) = &self.lora {
            lora.validate()?;
        }
        Ok(())
    }
}
