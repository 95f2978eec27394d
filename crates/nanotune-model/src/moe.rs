//! Sparse mixture-of-experts layer with top-k routing.
//!
//! Forward on input X of shape [B, L, D]:
//!   1. pre-norm
//!   2. router logits through the (LoRA-hookable) router projection
//!   3. per-token softmax, top-k selection (ties to the lower expert index),
//!      renormalized to sum to 1
//!   4. ReLU-gated expert FFNs through the expert kernel
//!   5. weighted combine + residual
//!   6. assignment-fraction load-balancing auxiliary scalar

use std::sync::Arc;

use nanotune_core::{ModelConfig, NanoTuneError, Result};
use nanotune_tensor::{ops, MemoryAccountant, MemoryCategory, Tensor};
use nf4_core::QuantizedTensor;

use crate::hooks::ForwardHooks;
use crate::kernels::{CpuExpertKernel, ExpertKernel};

const RMS_EPS: f32 = 1e-5;

/// Frozen quantized weights of one MoE layer.
#[derive(Debug, Clone)]
pub struct MoeWeights {
    /// Router projection [d_model, num_experts].
    pub w_router: QuantizedTensor,
    /// Per-expert up projections [d_model, d_ff].
    pub w1: Vec<QuantizedTensor>,
    /// Per-expert down projections [d_ff, d_model].
    pub w2: Vec<QuantizedTensor>,
}

impl MoeWeights {
    /// Named parameter views for reporting and serialization.
    pub fn named(&self) -> Vec<(String, &QuantizedTensor)> {
        let mut out = vec![("w_router".to_string(), &self.w_router)];
        for (e, w) in self.w1.iter().enumerate() {
            out.push((format!("expert{}.w1", e), w));
        }
        for (e, w) in self.w2.iter().enumerate() {
            out.push((format!("expert{}.w2", e), w));
        }
        out
    }
}

/// Top-k routing decision for one token.
#[derive(Debug, Clone)]
struct Route {
    experts: Vec<usize>,
    weights: Vec<f32>,
}

/// Select the k largest probabilities; ties break to the lower expert index.
/// Returned weights are renormalized to sum to 1.
fn top_k_renormalized(probs: &[f32], k: usize) -> Route {
    let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    indexed.truncate(k);
    let sum: f32 = indexed.iter().map(|(_, p)| p).sum();
    let inv = if sum > 0.0 { 1.0 / sum } else { 1.0 / k as f32 };
    Route {
        experts: indexed.iter().map(|&(i, _)| i).collect(),
        weights: indexed
            .iter()
            .map(|&(_, p)| if sum > 0.0 { p * inv } else { inv })
            .collect(),
    }
}

fn dequant(q: &QuantizedTensor, accountant: &Arc<MemoryAccountant>) -> Result<Tensor> {
    Tensor::from_vec(
        q.dequantize(),
        &q.shape,
        MemoryCategory::Temporary,
        accountant,
    )
}

/// Run one MoE layer. Returns the output and the load-balancing auxiliary
/// scalar λ · (1/E) · Σ_j (f_j − 1/E)² over assignment fractions f_j.
pub fn forward(
    weights: &MoeWeights,
    config: &ModelConfig,
    layer_idx: usize,
    input: &Tensor,
    expert_kernel: Option<&dyn ExpertKernel>,
    hooks: &mut dyn ForwardHooks,
    accountant: &Arc<MemoryAccountant>,
) -> Result<(Tensor, f32)> {
    let dims = input.shape();
    if dims.len() != 3 || dims[2] != config.d_model {
        return Err(NanoTuneError::shape(
            "moe input",
            &[0, 0, config.d_model],
            dims,
        ));
    }
    let num_experts = config.moe.num_experts;
    let top_k = config.moe.top_k;
    if weights.w1.len() != num_experts || weights.w2.len() != num_experts {
        return Err(NanoTuneError::shape(
            "moe expert count",
            &[num_experts],
            &[weights.w1.len()],
        ));
    }
    let (batch, seq, d) = (dims[0], dims[1], dims[2]);
    let n_tokens = batch * seq;

    let normed = ops::rms_norm(input, RMS_EPS)?;

    let w_router = dequant(&weights.w_router, accountant)?;
    let logits = {
        let base = ops::matmul(&normed, &w_router)?;
        hooks.adapt(&format!("layer{}.router", layer_idx), &normed, base)?
    };
    drop(w_router);

    let probs = ops::softmax_last_dim(&logits)?;
    drop(logits);
    let probs_flat = probs.data_f32()?;

    let mut routes = Vec::with_capacity(n_tokens);
    let mut assignments = vec![0usize; num_experts];
    for t in 0..n_tokens {
        let route = top_k_renormalized(&probs_flat[t * num_experts..(t + 1) * num_experts], top_k);
        for &e in &route.experts {
            assignments[e] += 1;
        }
        routes.push(route);
    }

    // Gather tokens per expert, run the FFN once per expert, scatter back
    // weighted. Only experts with assigned tokens are dequantized.
    let fallback;
    let kernel: &dyn ExpertKernel = match expert_kernel {
        Some(k) => k,
        None => {
            warn_expert_fallback_once();
            fallback = CpuExpertKernel;
            &fallback
        }
    };

    let normed_flat = normed.data_f32()?;
    let mut combined = vec![0.0f32; n_tokens * d];
    for e in 0..num_experts {
        let token_ids: Vec<usize> = routes
            .iter()
            .enumerate()
            .filter(|(_, r)| r.experts.contains(&e))
            .map(|(t, _)| t)
            .collect();
        if token_ids.is_empty() {
            continue;
        }

        let mut gathered = Vec::with_capacity(token_ids.len() * d);
        for &t in &token_ids {
            gathered.extend_from_slice(&normed_flat[t * d..(t + 1) * d]);
        }
        let x = Tensor::from_vec(
            gathered,
            &[token_ids.len(), d],
            MemoryCategory::Temporary,
            accountant,
        )?;
        let w1 = dequant(&weights.w1[e], accountant)?;
        let w2 = dequant(&weights.w2[e], accountant)?;
        let out = kernel.run(&x, &w1, &w2)?;
        let out_flat = out.data_f32()?;

        for (row, &t) in token_ids.iter().enumerate() {
            let route = &routes[t];
            let pos = route.experts.iter().position(|&x| x == e).expect("routed");
            let w = route.weights[pos];
            let dst = &mut combined[t * d..(t + 1) * d];
            let src = &out_flat[row * d..(row + 1) * d];
            for (o, &v) in dst.iter_mut().zip(src.iter()) {
                *o += w * v;
            }
        }
    }
    drop(normed);

    let combined = Tensor::from_vec(combined, dims, input.category(), accountant)?;
    let output = ops::add(input, &combined)?;

    let total = (n_tokens * top_k) as f32;
    let target = 1.0 / num_experts as f32;
    let aux: f32 = assignments
        .iter()
        .map(|&c| {
            let f = c as f32 / total;
            (f - target) * (f - target)
        })
        .sum::<f32>()
        / num_experts as f32
        * config.moe.aux_loss_weight;

    Ok((output, aux))
}

fn warn_expert_fallback_once() {
    use std::sync::Once;
    static WARN: Once = Once::new();
    WARN.call_once(|| {
        tracing::warn!(
            operator = "moe-experts",
            "expert kernel missing; using dense host fallback"
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NoHooks;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn acc() -> Arc<MemoryAccountant> {
        Arc::new(MemoryAccountant::new())
    }

    #[test]
    fn test_top_k_ties_break_to_lower_index() {
        // E5: equal probabilities -> lowest K indices, renormalized to 0.5
        let route = top_k_renormalized(&[0.25, 0.25, 0.25, 0.25], 2);
        assert_eq!(route.experts, vec![0, 1]);
        assert!((route.weights[0] - 0.5).abs() < 1e-6);
        assert!((route.weights[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_top_k_orders_by_probability() {
        let route = top_k_renormalized(&[0.1, 0.5, 0.3, 0.1], 2);
        assert_eq!(route.experts, vec![1, 2]);
        let sum: f32 = route.weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(route.weights[0] > route.weights[1]);
    }

    fn tiny_moe(config: &ModelConfig, seed: u64) -> MoeWeights {
        let a = acc();
        let mut rng = StdRng::seed_from_u64(seed);
        let d = config.d_model;
        let dff = config.moe.d_ff;
        let e = config.moe.num_experts;
        let mut rand_q = |shape: &[usize], std: f32| {
            let t = Tensor::randn(shape, std, &mut rng, MemoryCategory::Temporary, &a).unwrap();
            nf4_core::quantize(t.data_f32().unwrap(), shape, 64, false).unwrap()
        };
        MoeWeights {
            w_router: rand_q(&[d, e], 0.1),
            w1: (0..e).map(|_| rand_q(&[d, dff], 0.1)).collect(),
            w2: (0..e).map(|_| rand_q(&[dff, d], 0.1)).collect(),
        }
    }

    #[test]
    fn test_forward_shape_residual_and_aux() {
        let config = ModelConfig::tiny();
        let weights = tiny_moe(&config, 3);
        let a = acc();
        let mut rng = StdRng::seed_from_u64(4);
        let x = Tensor::randn(&[1, 6, config.d_model], 0.5, &mut rng, MemoryCategory::Activations, &a)
            .unwrap();

        let (y, aux) = forward(&weights, &config, 3, &x, None, &mut NoHooks, &a).unwrap();
        assert_eq!(y.shape(), x.shape());
        assert!(y.data_f32().unwrap().iter().all(|v| v.is_finite()));
        assert!(aux.is_finite() && aux >= 0.0);
    }

    #[test]
    fn test_aux_loss_uniform_assignment_e5() {
        // All tokens route identically to experts {0, 1} of 4 with K = 2:
        // f = [0.5, 0.5, 0, 0], τ = 0.25, Σ(f−τ)² = 0.25,
        // aux = λ · (1/4) · 0.25.
        let total = 8.0f32; // 4 tokens * K=2
        let assignments = [4usize, 4, 0, 0];
        let lambda = 0.01f32;
        let target = 0.25f32;
        let aux: f32 = assignments
            .iter()
            .map(|&c| {
                let f = c as f32 / total;
                (f - target) * (f - target)
            })
            .sum::<f32>()
            / 4.0
            * lambda;
        assert!((aux - lambda * 0.25 / 4.0).abs() < 1e-7);
    }

    #[test]
    fn test_identical_logits_give_zero_balance_penalty_on_shared_prefix() {
        // When every token ties across all experts, top-k picks the same K
        // lowest indices for every token, so the aux loss is the balanced
        // penalty of K experts carrying everything.
        let route = top_k_renormalized(&[0.25; 4], 2);
        assert_eq!(route.experts, vec![0, 1]);
    }

    #[test]
    fn test_temporaries_released_after_forward() {
        let config = ModelConfig::tiny();
        let weights = tiny_moe(&config, 5);
        let a = acc();
        let mut rng = StdRng::seed_from_u64(6);
        let x = Tensor::randn(&[1, 4, config.d_model], 0.5, &mut rng, MemoryCategory::Activations, &a)
            .unwrap();
        let (y, _aux) = forward(&weights, &config, 3, &x, None, &mut NoHooks, &a).unwrap();
        drop(y);
        drop(x);
        assert_eq!(a.snapshot().category(MemoryCategory::Temporary).current, 0);
        assert_eq!(a.snapshot().category(MemoryCategory::Activations).current, 0);
    }
}
