//! Basic linear algebra and activation operations on f32 tensors.
//!
//! All operations are pure `(inputs) -> output`; the output registers under
//! the category of the first input. Shapes are validated and violations
//! surface as `ShapeMismatch`.

use nanotune_core::{NanoTuneError, Result};

use crate::tensor::Tensor;

fn last_dim(t: &Tensor) -> usize {
    *t.shape().last().expect("non-empty shape")
}

/// Matrix product `a · b` where `a` is [.., k] and `b` is [k, n].
/// Leading dimensions of `a` are carried through to the output.
pub fn matmul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let k = last_dim(a);
    if b.shape().len() != 2 || b.shape()[0] != k {
        return Err(NanoTuneError::shape("matmul rhs", &[k, 0], b.shape()));
    }
    let n = b.shape()[1];
    let rows = a.numel() / k;
    let ad = a.data_f32()?;
    let bd = b.data_f32()?;

    let mut out = vec![0.0f32; rows * n];
    for r in 0..rows {
        let arow = &ad[r * k..(r + 1) * k];
        let orow = &mut out[r * n..(r + 1) * n];
        for (i, &av) in arow.iter().enumerate() {
            if av == 0.0 {
                continue;
            }
            let brow = &bd[i * n..(i + 1) * n];
            for j in 0..n {
                orow[j] += av * brow[j];
            }
        }
    }

    let mut shape = a.shape().to_vec();
    *shape.last_mut().expect("non-empty shape") = n;
    Tensor::from_vec(out, &shape, a.category(), a.accountant())
}

/// Matrix product `a · bᵀ` where `a` is [.., k] and `b` is [n, k].
pub fn matmul_transpose(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let k = last_dim(a);
    if b.shape().len() != 2 || b.shape()[1] != k {
        return Err(NanoTuneError::shape("matmul_transpose rhs", &[0, k], b.shape()));
    }
    let n = b.shape()[0];
    let rows = a.numel() / k;
    let ad = a.data_f32()?;
    let bd = b.data_f32()?;

    let mut out = vec![0.0f32; rows * n];
    for r in 0..rows {
        let arow = &ad[r * k..(r + 1) * k];
        for j in 0..n {
            let brow = &bd[j * k..(j + 1) * k];
            let mut sum = 0.0f32;
            for i in 0..k {
                sum += arow[i] * brow[i];
            }
            out[r * n + j] = sum;
        }
    }

    let mut shape = a.shape().to_vec();
    *shape.last_mut().expect("non-empty shape") = n;
    Tensor::from_vec(out, &shape, a.category(), a.accountant())
}

/// Product `aᵀ · b` where `a` is [.., m] and `b` is [.., n] with identical
/// leading dimensions; returns [m, n]. Used for gradient outer products.
pub fn matmul_tn(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let m = last_dim(a);
    let n = last_dim(b);
    let t = a.numel() / m;
    if b.numel() / n != t {
        return Err(NanoTuneError::shape("matmul_tn lhs/rhs rows", a.shape(), b.shape()));
    }
    let ad = a.data_f32()?;
    let bd = b.data_f32()?;

    let mut out = vec![0.0f32; m * n];
    for r in 0..t {
        let arow = &ad[r * m..(r + 1) * m];
        let brow = &bd[r * n..(r + 1) * n];
        for (i, &av) in arow.iter().enumerate() {
            if av == 0.0 {
                continue;
            }
            let orow = &mut out[i * n..(i + 1) * n];
            for j in 0..n {
                orow[j] += av * brow[j];
            }
        }
    }
    Tensor::from_vec(out, &[m, n], a.category(), a.accountant())
}

fn zip_elementwise(a: &Tensor, b: &Tensor, f: impl Fn(f32, f32) -> f32) -> Result<Tensor> {
    if a.shape() != b.shape() {
        return Err(NanoTuneError::shape("elementwise", a.shape(), b.shape()));
    }
    let out: Vec<f32> = a
        .data_f32()?
        .iter()
        .zip(b.data_f32()?.iter())
        .map(|(&x, &y)| f(x, y))
        .collect();
    Tensor::from_vec(out, a.shape(), a.category(), a.accountant())
}

/// Elementwise sum.
pub fn add(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    zip_elementwise(a, b, |x, y| x + y)
}

/// Elementwise product.
pub fn mul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    zip_elementwise(a, b, |x, y| x * y)
}

/// In-place elementwise accumulate `a += b`. `a` must not be aliased.
pub fn add_assign(a: &mut Tensor, b: &Tensor) -> Result<()> {
    if a.shape() != b.shape() {
        return Err(NanoTuneError::shape("add_assign", a.shape(), b.shape()));
    }
    let bd = b.data_f32()?.to_vec();
    let ad = a.data_f32_mut()?;
    for (x, y) in ad.iter_mut().zip(bd) {
        *x += y;
    }
    Ok(())
}

fn map_elementwise(a: &Tensor, f: impl Fn(f32) -> f32) -> Result<Tensor> {
    let out: Vec<f32> = a.data_f32()?.iter().map(|&x| f(x)).collect();
    Tensor::from_vec(out, a.shape(), a.category(), a.accountant())
}

/// Scalar multiply.
pub fn scale(a: &Tensor, s: f32) -> Result<Tensor> {
    map_elementwise(a, |x| x * s)
}

/// SiLU activation: x * sigmoid(x).
pub fn silu(a: &Tensor) -> Result<Tensor> {
    map_elementwise(a, |x| x / (1.0 + (-x).exp()))
}

/// ReLU activation.
pub fn relu(a: &Tensor) -> Result<Tensor> {
    map_elementwise(a, |x| x.max(0.0))
}

/// Softplus activation: ln(1 + e^x), computed stably.
pub fn softplus(a: &Tensor) -> Result<Tensor> {
    map_elementwise(a, |x| {
        if x > 20.0 {
            x
        } else {
            (1.0 + x.exp()).ln()
        }
    })
}

/// RMSNorm over the last dimension: x / sqrt(mean(x^2) + eps).
pub fn rms_norm(a: &Tensor, eps: f32) -> Result<Tensor> {
    let dim = last_dim(a);
    let ad = a.data_f32()?;
    let mut out = vec![0.0f32; ad.len()];
    for (row_in, row_out) in ad.chunks_exact(dim).zip(out.chunks_exact_mut(dim)) {
        let ss: f32 = row_in.iter().map(|v| v * v).sum();
        let rms_inv = 1.0 / (ss / dim as f32 + eps).sqrt();
        for (o, &v) in row_out.iter_mut().zip(row_in.iter()) {
            *o = v * rms_inv;
        }
    }
    Tensor::from_vec(out, a.shape(), a.category(), a.accountant())
}

/// Softmax over the last dimension, stabilized with max subtraction.
pub fn softmax_last_dim(a: &Tensor) -> Result<Tensor> {
    let dim = last_dim(a);
    let ad = a.data_f32()?;
    let mut out = vec![0.0f32; ad.len()];
    for (row_in, row_out) in ad.chunks_exact(dim).zip(out.chunks_exact_mut(dim)) {
        let max = row_in.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        for (o, &v) in row_out.iter_mut().zip(row_in.iter()) {
            *o = (v - max).exp();
            sum += *o;
        }
        for o in row_out.iter_mut() {
            *o /= sum;
        }
    }
    Tensor::from_vec(out, a.shape(), a.category(), a.accountant())
}

/// Split along the last dimension into parts of the given widths.
/// The widths must sum to the last dimension.
pub fn split_last_dim(a: &Tensor, widths: &[usize]) -> Result<Vec<Tensor>> {
    let dim = last_dim(a);
    let total: usize = widths.iter().sum();
    if total != dim {
        return Err(NanoTuneError::shape("split_last_dim", &[dim], &[total]));
    }
    let rows = a.numel() / dim;
    let ad = a.data_f32()?;
    let leading = &a.shape()[..a.shape().len() - 1];

    let mut parts = Vec::with_capacity(widths.len());
    let mut offset = 0usize;
    for &w in widths {
        let mut out = Vec::with_capacity(rows * w);
        for r in 0..rows {
            let base = r * dim + offset;
            out.extend_from_slice(&ad[base..base + w]);
        }
        let mut shape = leading.to_vec();
        shape.push(w);
        parts.push(Tensor::from_vec(out, &shape, a.category(), a.accountant())?);
        offset += w;
    }
    Ok(parts)
}

/// Transpose a 2-D tensor.
pub fn transpose2d(a: &Tensor) -> Result<Tensor> {
    if a.shape().len() != 2 {
        return Err(NanoTuneError::shape("transpose2d", &[0, 0], a.shape()));
    }
    let (m, n) = (a.shape()[0], a.shape()[1]);
    let ad = a.data_f32()?;
    let mut out = vec![0.0f32; m * n];
    for i in 0..m {
        for j in 0..n {
            out[j * m + i] = ad[i * n + j];
        }
    }
    Tensor::from_vec(out, &[n, m], a.category(), a.accountant())
}

/// Global L2 norm of all elements.
pub fn l2_norm(a: &Tensor) -> Result<f64> {
    Ok(a.data_f32()?
        .iter()
        .map(|&x| (x as f64) * (x as f64))
        .sum::<f64>()
        .sqrt())
}

/// Largest absolute element.
pub fn max_abs(a: &Tensor) -> Result<f32> {
    Ok(a.data_f32()?.iter().fold(0.0f32, |m, &x| m.max(x.abs())))
}
