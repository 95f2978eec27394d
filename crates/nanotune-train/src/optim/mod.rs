pub mod adamw;
pub mod kernel;
pub mod schedule;

pub use adamw::{clip_scale, global_grad_norm, AdamW};
pub use kernel::{
    F16ScalarKernel, F16SimdKernel, KernelPair, KernelStep, OptimizerKernel, SIMD_MIN_ELEMENTS,
    SIMD_WIDTH,
};
pub use schedule::{ConstantLr, CosineWithWarmup, LrSchedule};
