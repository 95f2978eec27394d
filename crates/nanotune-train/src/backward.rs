//! LoRA-only backward engine.
//!
//! The loss-side gradient enters as G_logits; the tied head converts it to a
//! hidden gradient (G_hidden = G_logits · W_head, W_head being the
//! dequantized embedding [V, D]). Each adapter whose cached pre-activation
//! is present then receives
//!   grad_B = σ · (x·A)ᵀ · G,
//!   grad_A = σ · xᵀ · (G · Bᵀ).
//! Gradients never propagate into the frozen base weights.

use std::collections::BTreeMap;

use nanotune_core::{NanoTuneError, Result};
use nanotune_tensor::{ops, MemoryCategory, Tensor};

use crate::cache::ActivationCache;
use crate::lora::LoraSet;

/// Gradient pair for one adapter, shaped like (A, B).
#[derive(Debug, Clone)]
pub struct AdapterGrads {
    pub a: Tensor,
    pub b: Tensor,
}

/// Convert the logits gradient to a hidden gradient through the tied head:
/// [B, L, V] · [V, D] -> [B, L, D].
pub fn hidden_gradient(g_logits: &Tensor, head: &Tensor) -> Result<Tensor> {
    if head.shape().len() != 2 {
        return Err(NanoTuneError::shape("head weights", &[0, 0], head.shape()));
    }
    ops::matmul(g_logits, head)
}

/// Compute (grad_A, grad_B) for every attached adapter whose pre-activation
/// "{name}.pre" is in the cache.
///
/// In the single-layer-LoRA regime only adapters feeding the residual stream
/// (out_dim == hidden width) receive loss gradient; the rest get
/// shape-correct zero pairs so the optimizer still sees them.
pub fn adapter_gradients(
    adapters: &LoraSet,
    cache: &ActivationCache,
    g_hidden: &Tensor,
) -> Result<BTreeMap<String, AdapterGrads>> {
    let d_model = *g_hidden.shape().last().expect("non-empty shape");
    let g_rows = g_hidden.numel() / d_model;

    let mut out = BTreeMap::new();
    for (name, adapter) in adapters.iter() {
        let pre_name = format!("{}.pre", name);
        let x = cache.get(&pre_name)?;
        if x.shape().last() != Some(&adapter.in_dim()) {
            return Err(NanoTuneError::shape(
                &format!("cached activation {}", pre_name),
                &[adapter.in_dim()],
                x.shape(),
            ));
        }

        if adapter.out_dim() != d_model {
            // Off the residual stream (e.g. a router adapter): no loss-side
            // gradient reaches it in this regime.
            tracing::debug!(adapter = name.as_str(), "adapter off the residual stream; zero gradient");
            out.insert(
                name.clone(),
                AdapterGrads {
                    a: Tensor::zeros(
                        adapter.a.shape(),
                        MemoryCategory::Gradients,
                        adapter.a.accountant(),
                    )?,
                    b: Tensor::zeros(
                        adapter.b.shape(),
                        MemoryCategory::Gradients,
                        adapter.b.accountant(),
                    )?,
                },
            );
            continue;
        }

        if x.numel() / adapter.in_dim() != g_rows {
            return Err(NanoTuneError::shape(
                &format!("cached activation {} rows", pre_name),
                g_hidden.shape(),
                x.shape(),
            ));
        }

        let xa = ops::matmul(x, &adapter.a)?;
        let grad_b = ops::scale(&ops::matmul_tn(&xa, g_hidden)?, adapter.scaling)?
            .duplicate(MemoryCategory::Gradients)?;
        let gb = ops::matmul_transpose(g_hidden, &adapter.b)?;
        let grad_a = ops::scale(&ops::matmul_tn(x, &gb)?, adapter.scaling)?
            .duplicate(MemoryCategory::Gradients)?;

        out.insert(name.clone(), AdapterGrads { a: grad_a, b: grad_b });
    }
    Ok(out)
}
