//! Quantized hybrid model: selective-state-space layers interleaved with
//! sparse mixture-of-experts layers over frozen NF4 weights.
//!
//! Provides:
//! - The quantized model container with lazy per-layer dequantization
//! - Selective-state and MoE forward operators
//! - Scan/expert kernel contracts with host reference implementations
//! - The `ForwardHooks` seam the training crate attaches adapters through

pub mod embed;
pub mod hooks;
pub mod kernels;
pub mod model;
pub mod moe;
pub mod ssm;

pub use embed::{QuantizedEmbedding, PAD_TOKEN_ID};
pub use hooks::{ForwardHooks, NoHooks};
pub use kernels::{CpuExpertKernel, CpuScanKernel, ExpertKernel, ScanKernel};
pub use model::{layer_kind, LayerKind, LayerWeights, QuantizedModel};
pub use moe::MoeWeights;
pub use ssm::SsmWeights;
