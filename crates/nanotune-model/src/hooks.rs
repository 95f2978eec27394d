//! Seam through which training attaches adapters to the model graph.

use nanotune_core::Result;
use nanotune_tensor::Tensor;

/// Called at every named projection point during a forward pass.
///
/// `input` is the pre-activation entering the projection, `base` the frozen
/// path's output. Implementations may cache the input and add an adapter
/// delta; the default pass-through leaves the base output untouched.
pub trait ForwardHooks {
    fn adapt(&mut self, name: &str, input: &Tensor, base: Tensor) -> Result<Tensor>;
}

/// Pass-through hooks for plain inference.
#[derive(Debug, Default)]
pub struct NoHooks;

impl ForwardHooks for NoHooks {
    fn adapt(&mut self, _name: &str, _input: &Tensor, base: Tensor) -> Result<Tensor> {
        Ok(base)
    }
}
