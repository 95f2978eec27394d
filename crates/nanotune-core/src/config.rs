//! Centralized configuration management with TOML support.
//!
//! Provides structured configs for the model, LoRA adapters, optimizer,
//! data pipeline, and checkpointing, with load/save capabilities.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{NanoTuneError, Result};

/// Selective-state-space layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SsmConfig {
    /// Inner width multiplier: d_inner = d_model * expand_factor.
    pub expand_factor: usize,
    /// State dimension per channel.
    pub d_state: usize,
    /// Depthwise causal conv kernel width.
    pub d_conv: usize,
    /// Rank of the Δ bottleneck projection.
    pub dt_rank: usize,
}

impl Default for SsmConfig {
    fn default() -> Self {
        Self {
            expand_factor: 2,
            d_state: 16,
            d_conv: 4,
            dt_rank: 48,
        }
    }
}

/// Mixture-of-experts layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoeConfig {
    /// Number of experts per MoE layer.
    pub num_experts: usize,
    /// Experts activated per token.
    pub top_k: usize,
    /// Expert FFN hidden width.
    pub d_ff: usize,
    /// Per-expert capacity multiplier (device kernels only; the host path
    /// processes every routed token).
    pub capacity_factor: f32,
    /// Weight of the load-balancing auxiliary loss.
    pub aux_loss_weight: f32,
}

impl Default for MoeConfig {
    fn default() -> Self {
        Self {
            num_experts: 8,
            top_k: 2,
            d_ff: 3072,
            capacity_factor: 1.25,
            aux_loss_weight: 0.01,
        }
    }
}

/// Model architecture configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Vocabulary size (embedding rows).
    pub vocab_size: usize,
    /// Hidden width.
    pub d_model: usize,
    /// Number of layers (state-space + MoE interleaved).
    pub num_layers: usize,
    /// Quantization block size for NF4 weights.
    pub block_size: usize,
    /// Enable double (super-block) quantization of block scales.
    pub double_quant: bool,
    /// Selective-state-space settings.
    pub ssm: SsmConfig,
    /// Mixture-of-experts settings.
    pub moe: MoeConfig,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 32000,
            d_model: 2560,
            num_layers: 48,
            block_size: 64,
            double_quant: true,
            ssm: SsmConfig::default(),
            moe: MoeConfig::default(),
        }
    }
}

impl ModelConfig {
    /// Tiny config for tests and smoke runs.
    pub fn tiny() -> Self {
        Self {
            vocab_size: 256,
            d_model: 64,
            num_layers: 2,
            block_size: 64,
            double_quant: false,
            ssm: SsmConfig {
                expand_factor: 2,
                d_state: 8,
                d_conv: 2,
                dt_rank: 4,
            },
            moe: MoeConfig {
                num_experts: 4,
                top_k: 2,
                d_ff: 128,
                capacity_factor: 1.25,
                aux_loss_weight: 0.01,
            },
        }
    }

    /// Inner width of the state-space layers.
    pub fn d_inner(&self) -> usize {
        self.d_model * self.ssm.expand_factor
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.d_model == 0 {
            return Err(NanoTuneError::InvalidConfig("d_model must be > 0".into()));
        }
        if self.vocab_size == 0 {
            return Err(NanoTuneError::InvalidConfig(
                "vocab_size must be > 0".into(),
            ));
        }
        if self.num_layers == 0 {
            return Err(NanoTuneError::InvalidConfig(
                "num_layers must be > 0".into(),
            ));
        }
        if self.block_size == 0 {
            return Err(NanoTuneError::InvalidConfig(
                "block_size must be > 0".into(),
            ));
        }
        if self.ssm.expand_factor == 0 || self.ssm.d_state == 0 || self.ssm.d_conv == 0 {
            return Err(NanoTuneError::InvalidConfig(
                "ssm dimensions must be > 0".into(),
            ));
        }
        if self.ssm.dt_rank == 0 {
            return Err(NanoTuneError::InvalidConfig("dt_rank must be > 0".into()));
        }
        if self.moe.num_experts == 0 {
            return Err(NanoTuneError::InvalidConfig(
                "num_experts must be > 0".into(),
            ));
        }
        if self.moe.top_k == 0 || self.moe.top_k > self.moe.num_experts {
            return Err(NanoTuneError::InvalidConfig(
                "top_k must be in 1..=num_experts".into(),
            ));
        }
        if self.moe.d_ff == 0 {
            return Err(NanoTuneError::InvalidConfig("d_ff must be > 0".into()));
        }
        if self.moe.capacity_factor <= 0.0 {
            return Err(NanoTuneError::InvalidConfig(
                "capacity_factor must be > 0".into(),
            ));
        }
        if self.moe.aux_loss_weight < 0.0 {
            return Err(NanoTuneError::InvalidConfig(
                "aux_loss_weight must be >= 0".into(),
            ));
        }
        Ok(())
    }
}

/// Closed set of modules a LoRA adapter can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetModule {
    StateInProj,
    StateXProj,
    StateOutProj,
    MoeRouter,
    MoeExperts,
    AttentionQ,
    AttentionK,
    AttentionV,
    AttentionOut,
}

impl TargetModule {
    /// Stable name used in adapter keys and checkpoints.
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetModule::StateInProj => "in-proj",
            TargetModule::StateXProj => "x-proj",
            TargetModule::StateOutProj => "out-proj",
            TargetModule::MoeRouter => "router",
            TargetModule::MoeExperts => "experts",
            TargetModule::AttentionQ => "attn-q",
            TargetModule::AttentionK => "attn-k",
            TargetModule::AttentionV => "attn-v",
            TargetModule::AttentionOut => "attn-out",
        }
    }
}

/// LoRA adapter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Adapter rank r.
    pub rank: usize,
    /// Scaling numerator alpha; effective scaling is alpha / rank.
    pub alpha: f32,
    /// Dropout probability on the adapter input during training.
    pub dropout: f32,
    /// Modules the adapters attach to.
    pub target_modules: Vec<TargetModule>,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            rank: 16,
            alpha: 32.0,
            dropout: 0.05,
            target_modules: vec![TargetModule::StateOutProj, TargetModule::MoeRouter],
        }
    }
}

impl LoraConfig {
    /// Derived scaling factor alpha / rank.
    pub fn scaling(&self) -> f32 {
        self.alpha / self.rank as f32
    }

    pub fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            return Err(NanoTuneError::InvalidConfig("lora rank must be > 0".into()));
        }
        if self.alpha <= 0.0 {
            return Err(NanoTuneError::InvalidConfig(
                "lora alpha must be > 0".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(NanoTuneError::InvalidConfig(
                "lora dropout must be in [0, 1)".into(),
            ));
        }
        if self.target_modules.is_empty() {
            return Err(NanoTuneError::InvalidConfig(
                "lora target_modules must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// AdamW optimizer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    /// Global gradient-norm clip threshold; None disables clipping.
    pub max_grad_norm: Option<f64>,
    pub amsgrad: bool,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 2e-4,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.01,
            max_grad_norm: Some(1.0),
            amsgrad: false,
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.learning_rate <= 0.0 {
            return Err(NanoTuneError::InvalidConfig(
                "learning_rate must be > 0".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.beta1) || !(0.0..1.0).contains(&self.beta2) {
            return Err(NanoTuneError::InvalidConfig(
                "betas must be in [0, 1)".into(),
            ));
        }
        if self.epsilon <= 0.0 {
            return Err(NanoTuneError::InvalidConfig("epsilon must be > 0".into()));
        }
        if let Some(c) = self.max_grad_norm {
            if c <= 0.0 {
                return Err(NanoTuneError::InvalidConfig(
                    "max_grad_norm must be > 0".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Data pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    pub batch_size: usize,
    pub seq_length: usize,
    pub vocab_size: usize,
    pub shuffle: bool,
    pub num_workers: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            seq_length: 512,
            vocab_size: 32000,
            shuffle: true,
            num_workers: 1,
        }
    }
}

impl DataConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.seq_length == 0 {
            return Err(NanoTuneError::InvalidConfig(
                "batch_size and seq_length must be > 0".into(),
            ));
        }
        if self.vocab_size == 0 {
            return Err(NanoTuneError::InvalidConfig(
                "data vocab_size must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Gradient-checkpointing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Save the activation entering layer i whenever i % save_every_n == 0.
    pub save_every_n: usize,
    /// Recompute unsaved activations from the nearest checkpoint on backward.
    pub recompute: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            save_every_n: 4,
            recompute: true,
        }
    }
}

impl CheckpointConfig {
    pub fn validate(&self) -> Result<()> {
        if self.save_every_n == 0 {
            return Err(NanoTuneError::InvalidConfig(
                "save_every_n must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Training schedule and loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub total_steps: usize,
    pub warmup_steps: usize,
    /// Floor of the cosine schedule as a fraction of the base learning rate.
    pub min_lr_frac: f64,
    pub grad_accum_steps: usize,
    /// Steps between metric log lines.
    pub log_interval: usize,
    /// Steps between adapter checkpoint snapshots (0 disables).
    pub checkpoint_interval: usize,
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            total_steps: 10000,
            warmup_steps: 500,
            min_lr_frac: 0.1,
            grad_accum_steps: 8,
            log_interval: 10,
            checkpoint_interval: 500,
            seed: 42,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.total_steps == 0 {
            return Err(NanoTuneError::InvalidConfig(
                "total_steps must be > 0".into(),
            ));
        }
        if self.warmup_steps >= self.total_steps {
            return Err(NanoTuneError::InvalidConfig(
                "warmup_steps must be < total_steps".into(),
            ));
        }
        if self.grad_accum_steps == 0 {
            return Err(NanoTuneError::InvalidConfig(
                "grad_accum_steps must be > 0".into(),
            ));
        }
        if self.log_interval == 0 {
            return Err(NanoTuneError::InvalidConfig(
                "log_interval must be > 0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_lr_frac) {
            return Err(NanoTuneError::InvalidConfig(
                "min_lr_frac must be in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub lora: LoraConfig,
    pub optimizer: OptimizerConfig,
    pub train: TrainConfig,
    pub data: DataConfig,
    pub checkpoint: CheckpointConfig,
    /// Logging level (debug, info, warn, error).
    pub log_level: String,
    /// Path to training data (flat u32 token file).
    pub data_path: String,
    /// Adapter checkpoint directory.
    pub checkpoint_dir: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            lora: LoraConfig::default(),
            optimizer: OptimizerConfig::default(),
            train: TrainConfig::default(),
            data: DataConfig::default(),
            checkpoint: CheckpointConfig::default(),
            log_level: "info".into(),
            data_path: "./data/tokens.bin".into(),
            checkpoint_dir: "./checkpoints".into(),
        }
    }
}

impl AppConfig {
    /// Load configuration from TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            NanoTuneError::Other(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.validate()?;
        let content = toml::to_string_pretty(self)
            .map_err(|e| NanoTuneError::Other(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path.as_ref(), content)?;
        Ok(())
    }

    /// Validate all sub-configs.
    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        self.lora.validate()?;
        self.optimizer.validate()?;
        self.train.validate()?;
        self.data.validate()?;
        self.checkpoint.validate()?;
        Ok(())
    }
}
