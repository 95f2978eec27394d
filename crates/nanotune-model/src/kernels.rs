//! External compute-kernel contracts and their host reference implementations.
//!
//! The layer operators consume these as opaque collaborators. When no kernel
//! is installed the forward substitutes a host fallback and logs a warning
//! once per operator (the selective-scan fallback is skip-only and produces
//! numerically different but shape-conformant output).

use nanotune_core::{NanoTuneError, Result};
use nanotune_tensor::Tensor;

/// Selective-scan operation.
///
/// Shapes: `x` [B, L, d_inner], `delta` [B, L, d_inner],
/// `a` [d_inner, d_state], `b_ssm` [B, L, d_state], `c_ssm` [B, L, d_state],
/// `d_skip` [d_inner] -> y [B, L, d_inner].
pub trait ScanKernel: Send + Sync {
    fn run(
        &self,
        x: &Tensor,
        delta: &Tensor,
        a: &Tensor,
        b_ssm: &Tensor,
        c_ssm: &Tensor,
        d_skip: &Tensor,
    ) -> Result<Tensor>;
}

/// ReLU-gated expert FFN: out = relu(x · w1) · w2.
///
/// Shapes: `x` [T, d_model], `w1` [d_model, d_ff], `w2` [d_ff, d_model].
pub trait ExpertKernel: Send + Sync {
    fn run(&self, x: &Tensor, w1: &Tensor, w2: &Tensor) -> Result<Tensor>;
}

/// Host reference scan implementing the full recurrence
/// h_t = h_{t-1} * exp(A_c * Δ_t) + B_t * x_t,  y_t = C_t · h_t + D_c * x_t,
/// independently per channel, with h_0 = 0.
#[derive(Debug, Default)]
pub struct CpuScanKernel;

impl ScanKernel for CpuScanKernel {
    fn run(
        &self,
        x: &Tensor,
        delta: &Tensor,
        a: &Tensor,
        b_ssm: &Tensor,
        c_ssm: &Tensor,
        d_skip: &Tensor,
    ) -> Result<Tensor> {
        let dims = x.shape();
        if dims.len() != 3 {
            return Err(NanoTuneError::shape("scan input", &[0, 0, 0], dims));
        }
        let (batch, seq, d_inner) = (dims[0], dims[1], dims[2]);
        if a.shape().len() != 2 || a.shape()[0] != d_inner {
            return Err(NanoTuneError::shape("scan A", &[d_inner, 0], a.shape()));
        }
        let d_state = a.shape()[1];
        if delta.shape() != dims {
            return Err(NanoTuneError::shape("scan delta", dims, delta.shape()));
        }
        let state_dims = [batch, seq, d_state];
        if b_ssm.shape() != &state_dims {
            return Err(NanoTuneError::shape("scan B", &state_dims, b_ssm.shape()));
        }
        if c_ssm.shape() != &state_dims {
            return Err(NanoTuneError::shape("scan C", &state_dims, c_ssm.shape()));
        }
        if d_skip.shape() != &[d_inner] {
            return Err(NanoTuneError::shape("scan D", &[d_inner], d_skip.shape()));
        }

        let xd = x.data_f32()?;
        let dd = delta.data_f32()?;
        let ad = a.data_f32()?;
        let bd = b_ssm.data_f32()?;
        let cd = c_ssm.data_f32()?;
        let sd = d_skip.data_f32()?;

        let mut out = vec![0.0f32; batch * seq * d_inner];
        let mut h = vec![0.0f32; d_state];
        for b in 0..batch {
            for c in 0..d_inner {
                h.fill(0.0);
                let a_row = &ad[c * d_state..(c + 1) * d_state];
                for t in 0..seq {
                    let tok = (b * seq + t) * d_inner + c;
                    let st = (b * seq + t) * d_state;
                    let xv = xd[tok];
                    let dt = dd[tok];
                    let mut y = sd[c] * xv;
                    for s in 0..d_state {
                        h[s] = h[s] * (a_row[s] * dt).exp() + bd[st + s] * xv;
                        y += cd[st + s] * h[s];
                    }
                    out[tok] = y;
                }
            }
        }
        Tensor::from_vec(out, dims, x.category(), x.accountant())
    }
}

/// Skip-only fallback when no scan kernel is installed: y_t = D_c * x_t.
pub fn skip_scan(x: &Tensor, d_skip: &Tensor) -> Result<Tensor> {
    let dims = x.shape();
    let d_inner = *dims.last().expect("non-empty shape");
    if d_skip.shape() != &[d_inner] {
        return Err(NanoTuneError::shape("skip_scan D", &[d_inner], d_skip.shape()));
    }
    let xd = x.data_f32()?;
    let sd = d_skip.data_f32()?;
    let out: Vec<f32> = xd
        .iter()
        .enumerate()
        .map(|(i, &v)| v * sd[i % d_inner])
        .collect();
    Tensor::from_vec(out, dims, x.category(), x.accountant())
}

/// Host reference expert FFN.
#[derive(Debug, Default)]
pub struct CpuExpertKernel;

impl ExpertKernel for CpuExpertKernel {
    fn run(&self, x: &Tensor, w1: &Tensor, w2: &Tensor) -> Result<Tensor> {
        let hidden = nanotune_tensor::ops::relu(&nanotune_tensor::ops::matmul(x, w1)?)?;
        nanotune_tensor::ops::matmul(&hidden, w2)
    }
}
