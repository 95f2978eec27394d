//! Mixed-precision optimizer kernel variants.
//!
//! Two f16 variants are provided behind one contract: a scalar kernel and a
//! SIMD-width kernel that processes fixed-size lanes. Both compute in f32
//! and round the moment buffers through f16 after each update; the state
//! layout stays f32 so variants are interchangeable mid-run. Selection
//! prefers the SIMD variant when the element count is a multiple of the
//! lane width and at least 1024.

use half::f16;

/// Per-call parameters, with bias-correction inverses precomputed.
#[derive(Debug, Clone, Copy)]
pub struct KernelStep {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
    pub bc1_inv: f32,
    pub bc2_inv: f32,
    pub amsgrad: bool,
}

/// One AdamW update over a flat parameter buffer.
pub trait OptimizerKernel: Send + Sync {
    fn name(&self) -> &'static str;
    fn update(
        &self,
        params: &mut [f32],
        grads: &[f32],
        m: &mut [f32],
        v: &mut [f32],
        v_max: Option<&mut [f32]>,
        step: &KernelStep,
    );
}

/// Lane width of the SIMD variant.
pub const SIMD_WIDTH: usize = 8;

/// Minimum element count before the SIMD variant pays off.
pub const SIMD_MIN_ELEMENTS: usize = 1024;

#[inline]
fn adamw_element(
    p: &mut f32,
    g: f32,
    m: &mut f32,
    v: &mut f32,
    v_max: Option<&mut f32>,
    s: &KernelStep,
) {
    *m = s.beta1 * *m + (1.0 - s.beta1) * g;
    *v = s.beta2 * *v + (1.0 - s.beta2) * g * g;
    let m_hat = *m * s.bc1_inv;
    let mut v_hat = *v * s.bc2_inv;
    if let Some(vm) = v_max {
        *vm = vm.max(*v);
        v_hat = v_hat.max(*vm);
    }
    *p -= s.lr * (m_hat / (v_hat.sqrt() + s.eps) + s.weight_decay * *p);
}

#[inline]
fn round_f16(x: &mut f32) {
    *x = f16::from_f32(*x).to_f32();
}

/// Scalar f16 kernel: one element at a time.
#[derive(Debug, Default)]
pub struct F16ScalarKernel;

impl OptimizerKernel for F16ScalarKernel {
    fn name(&self) -> &'static str {
        "f16-scalar"
    }

    fn update(
        &self,
        params: &mut [f32],
        grads: &[f32],
        m: &mut [f32],
        v: &mut [f32],
        mut v_max: Option<&mut [f32]>,
        step: &KernelStep,
    ) {
        for i in 0..params.len() {
            let vm = v_max.as_deref_mut().map(|vm| &mut vm[i]);
            adamw_element(&mut params[i], grads[i], &mut m[i], &mut v[i], vm, step);
            round_f16(&mut m[i]);
            round_f16(&mut v[i]);
        }
    }
}

/// SIMD-width f16 kernel: processes `SIMD_WIDTH` lanes per iteration.
/// Requires the element count to be a multiple of the lane width.
#[derive(Debug, Default)]
pub struct F16SimdKernel;

impl OptimizerKernel for F16SimdKernel {
    fn name(&self) -> &'static str {
        "f16-simd"
    }

    fn update(
        &self,
        params: &mut [f32],
        grads: &[f32],
        m: &mut [f32],
        v: &mut [f32],
        mut v_max: Option<&mut [f32]>,
        step: &KernelStep,
    ) {
        debug_assert_eq!(params.len() % SIMD_WIDTH, 0);
        let lanes = params.len() / SIMD_WIDTH;
        for lane in 0..lanes {
            let base = lane * SIMD_WIDTH;
            for off in 0..SIMD_WIDTH {
                let i = base + off;
                let vm = v_max.as_deref_mut().map(|vm| &mut vm[i]);
                adamw_element(&mut params[i], grads[i], &mut m[i], &mut v[i], vm, step);
            }
            for off in 0..SIMD_WIDTH {
                round_f16(&mut m[base + off]);
                round_f16(&mut v[base + off]);
            }
        }
    }
}

/// A scalar/SIMD pair with the selection policy.
pub struct KernelPair {
    pub scalar: Box<dyn OptimizerKernel>,
    pub simd: Box<dyn OptimizerKernel>,
}

impl KernelPair {
    /// The default f16 pair.
    pub fn f16() -> Self {
        Self {
            scalar: Box::new(F16ScalarKernel),
            simd: Box::new(F16SimdKernel),
        }
    }

    /// Prefer SIMD when `count` is a lane-width multiple and large enough.
    pub fn select(&self, count: usize) -> &dyn OptimizerKernel {
        if count % SIMD_WIDTH == 0 && count >= SIMD_MIN_ELEMENTS {
            self.simd.as_ref()
        } else {
            self.scalar.as_ref()
        }
    }
}
