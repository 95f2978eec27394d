//! Tensor substrate for nanotune.
//!
//! Provides:
//! - Typed dense buffers (f32, f16, i8, packed-nf4) with shared-read views
//! - Per-category memory accounting with peak tracking
//! - The linear algebra and activation primitives the layers are built from

pub mod memory;
pub mod ops;
pub mod tensor;

pub use memory::{format_bytes, MemoryAccountant, MemoryCategory, MemoryReport, MemorySnapshot};
pub use tensor::{DType, Tensor, TensorData};
