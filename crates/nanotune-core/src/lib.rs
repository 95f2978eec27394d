//! Core types shared across nanotune crates.
//!
//! Provides:
//! - Centralized error types via thiserror
//! - Configuration management with TOML support

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{
    AppConfig, CheckpointConfig, DataConfig, LoraConfig, ModelConfig, MoeConfig, OptimizerConfig,
    SsmConfig, TargetModule, TrainConfig,
};
pub use error::{NanoTuneError, Result};
