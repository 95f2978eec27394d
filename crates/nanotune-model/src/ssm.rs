//! Selective-state-space layer.
//!
//! Forward on input X of shape [B, L, D]:
//!   1. pre-norm (RMSNorm, eps 1e-5)
//!   2. input projection to [x | z] along 2 * d_inner
//!   3. depthwise causal conv over the sequence on x
//!   4. SiLU gate on z
//!   5. selective scan y = Scan(x; Δ, A, B, C, D) through the scan kernel
//!      (skip-only y = D·x when no kernel is installed)
//!   6. gated output projection
//!   7. residual
//!
//! Projection weights arrive dequantized from the container on demand.

use std::sync::Arc;

use nanotune_core::{ModelConfig, NanoTuneError, Result};
use nanotune_tensor::{ops, MemoryAccountant, MemoryCategory, Tensor};
use nf4_core::QuantizedTensor;

use crate::hooks::ForwardHooks;
use crate::kernels::{skip_scan, ScanKernel};

const RMS_EPS: f32 = 1e-5;

/// Frozen quantized weights of one selective-state layer.
#[derive(Debug, Clone)]
pub struct SsmWeights {
    /// Input projection [d_model, 2 * d_inner].
    pub w_in: QuantizedTensor,
    /// Depthwise conv kernel [d_inner, d_conv].
    pub conv_w: QuantizedTensor,
    /// Conv bias [d_inner].
    pub conv_b: QuantizedTensor,
    /// Selective projection [d_inner, dt_rank + 2 * d_state] producing
    /// (Δ-bottleneck, B, C) per token.
    pub w_x: QuantizedTensor,
    /// Δ up-projection [dt_rank, d_inner].
    pub w_dt: QuantizedTensor,
    /// State transition log-rates [d_inner, d_state].
    pub a: QuantizedTensor,
    /// Skip connection gains [d_inner].
    pub d_skip: QuantizedTensor,
    /// Output projection [d_inner, d_model].
    pub w_out: QuantizedTensor,
}

impl SsmWeights {
    /// Named parameter views for reporting and serialization.
    pub fn named(&self) -> Vec<(&'static str, &QuantizedTensor)> {
        vec![
            ("w_in", &self.w_in),
            ("conv_w", &self.conv_w),
            ("conv_b", &self.conv_b),
            ("w_x", &self.w_x),
            ("w_dt", &self.w_dt),
            ("a", &self.a),
            ("d_skip", &self.d_skip),
            ("w_out", &self.w_out),
        ]
    }
}

fn dequant(
    q: &QuantizedTensor,
    accountant: &Arc<MemoryAccountant>,
) -> Result<Tensor> {
    Tensor::from_vec(
        q.dequantize(),
        &q.shape,
        MemoryCategory::Temporary,
        accountant,
    )
}

/// Depthwise causal conv over the sequence dimension:
/// out[b, t, c] = bias[c] + Σ_k w[c, k] · x[b, t - (K-1) + k, c].
fn causal_conv1d(x: &Tensor, w: &Tensor, bias: &Tensor) -> Result<Tensor> {
    let dims = x.shape();
    let (batch, seq, ch) = (dims[0], dims[1], dims[2]);
    if w.shape().len() != 2 || w.shape()[0] != ch {
        return Err(NanoTuneError::shape("conv weight", &[ch, 0], w.shape()));
    }
    let k = w.shape()[1];
    let xd = x.data_f32()?;
    let wd = w.data_f32()?;
    let bd = bias.data_f32()?;

    let mut out = vec![0.0f32; xd.len()];
    for b in 0..batch {
        for t in 0..seq {
            for c in 0..ch {
                let mut sum = bd[c];
                for j in 0..k {
                    let src = t as isize - (k as isize - 1) + j as isize;
                    if src >= 0 {
                        sum += wd[c * k + j] * xd[(b * seq + src as usize) * ch + c];
                    }
                }
                out[(b * seq + t) * ch + c] = sum;
            }
        }
    }
    Tensor::from_vec(out, dims, x.category(), x.accountant())
}

/// Run one selective-state layer. `layer_idx` names the hook points
/// ("layer{i}.in-proj", "layer{i}.x-proj", "layer{i}.out-proj").
pub fn forward(
    weights: &SsmWeights,
    config: &ModelConfig,
    layer_idx: usize,
    input: &Tensor,
    scan: Option<&dyn ScanKernel>,
    hooks: &mut dyn ForwardHooks,
    accountant: &Arc<MemoryAccountant>,
) -> Result<Tensor> {
    let dims = input.shape();
    if dims.len() != 3 || dims[2] != config.d_model {
        return Err(NanoTuneError::shape(
            "ssm input",
            &[0, 0, config.d_model],
            dims,
        ));
    }
    let d_inner = config.d_inner();
    let d_state = config.ssm.d_state;
    let dt_rank = config.ssm.dt_rank;

    let normed = ops::rms_norm(input, RMS_EPS)?;

    let w_in = dequant(&weights.w_in, accountant)?;
    let xz = {
        let base = ops::matmul(&normed, &w_in)?;
        hooks.adapt(&format!("layer{}.in-proj", layer_idx), &normed, base)?
    };
    drop(w_in);
    let mut parts = ops::split_last_dim(&xz, &[d_inner, d_inner])?;
    let z = parts.pop().expect("two parts");
    let x_raw = parts.pop().expect("two parts");
    drop(xz);

    let conv_w = dequant(&weights.conv_w, accountant)?;
    let conv_b = dequant(&weights.conv_b, accountant)?;
    let x = causal_conv1d(&x_raw, &conv_w, &conv_b)?;
    drop((conv_w, conv_b, x_raw));

    let gate = ops::silu(&z)?;
    drop(z);

    let w_x = dequant(&weights.w_x, accountant)?;
    let dbc = {
        let base = ops::matmul(&x, &w_x)?;
        hooks.adapt(&format!("layer{}.x-proj", layer_idx), &x, base)?
    };
    drop(w_x);
    let mut parts = ops::split_last_dim(&dbc, &[dt_rank, d_state, d_state])?;
    let c_ssm = parts.pop().expect("three parts");
    let b_ssm = parts.pop().expect("three parts");
    let dt_low = parts.pop().expect("three parts");
    drop(dbc);

    let w_dt = dequant(&weights.w_dt, accountant)?;
    let delta = ops::softplus(&ops::matmul(&dt_low, &w_dt)?)?;
    drop((w_dt, dt_low));

    let a_mat = dequant(&weights.a, accountant)?;
    let d_vec = dequant(&weights.d_skip, accountant)?;
    let y = match scan {
        Some(kernel) => kernel.run(&x, &delta, &a_mat, &b_ssm, &c_ssm, &d_vec)?,
        None => {
            warn_scan_fallback_once();
            skip_scan(&x, &d_vec)?
        }
    };
    drop((a_mat, b_ssm, c_ssm, delta, x));

    let gated = ops::mul(&y, &gate)?;
    drop((y, gate));

    let w_out = dequant(&weights.w_out, accountant)?;
    let projected = {
        let base = ops::matmul(&gated, &w_out)?;
        hooks.adapt(&format!("layer{}.out-proj", layer_idx), &gated, base)?
    };
    drop(w_out);

    ops::add(input, &projected)
}

fn warn_scan_fallback_once() {
    use std::sync::Once;
    static WARN: Once = Once::new();
    WARN.call_once(|| {
        tracing::warn!(
            operator = "selective-scan",
            "scan kernel missing; using skip-only host fallback"
        );
    });
}
