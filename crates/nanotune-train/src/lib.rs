//! Memory-constrained LoRA fine-tuning runtime for the quantized hybrid
//! model.
//!
//! Provides:
//! - LoRA adapter algebra fused onto the frozen NF4 base
//! - Activation cache and gradient checkpointing discipline
//! - Cross-entropy loss and the LoRA-only backward engine
//! - AdamW with clipping, AMSGrad, and mixed-precision kernels
//! - Adapter-only checkpoint artifacts
//! - Data sources, structured logging, the memory sampler, and the
//!   training loop

pub mod accum;
pub mod backward;
pub mod cache;
pub mod checkpoint;
pub mod data;
pub mod logging;
pub mod lora;
pub mod loss;
pub mod optim;
pub mod sampler;
pub mod train;

pub use accum::GradientAccumulator;
pub use backward::{adapter_gradients, hidden_gradient, AdapterGrads};
pub use cache::ActivationCache;
pub use checkpoint::{
    load_adapters, save_adapters, CheckpointMeta, CheckpointSink, DirectoryCheckpointSink,
};
pub use data::{Batch, DataSource, SyntheticDataSource, TokenFileDataSource};
pub use lora::{LoraAdapter, LoraSet, TrainHooks};
pub use loss::{cross_entropy, cross_entropy_backward, LossOutput};
pub use optim::{AdamW, ConstantLr, CosineWithWarmup, LrSchedule};
pub use sampler::MemorySampler;
pub use train::{CancelToken, StepStats, TrainOutcome, Trainer};
