//! Masked cross-entropy loss over logits [B, L, V].
//!
//! Target id 0 is padding: those positions contribute neither to loss,
//! accuracy, nor gradient.

use nanotune_core::{NanoTuneError, Result};
use nanotune_tensor::{MemoryCategory, Tensor};

use nanotune_model::PAD_TOKEN_ID;

/// Scalar outputs of the loss forward.
#[derive(Debug, Clone, Copy)]
pub struct LossOutput {
    pub loss: f64,
    pub accuracy: f64,
    pub valid_positions: usize,
}

fn check_targets(logits: &Tensor, targets: &[u32]) -> Result<(usize, usize)> {
    let dims = logits.shape();
    if dims.len() != 3 {
        return Err(NanoTuneError::shape("loss logits", &[0, 0, 0], dims));
    }
    let positions = dims[0] * dims[1];
    if targets.len() != positions {
        return Err(NanoTuneError::shape(
            "loss targets",
            &[positions],
            &[targets.len()],
        ));
    }
    Ok((positions, dims[2]))
}

/// Forward: mean negative log-likelihood over non-padding positions, with
/// log-sum-exp stabilized by max subtraction. Accuracy counts argmax hits
/// over the same positions.
pub fn cross_entropy(logits: &Tensor, targets: &[u32]) -> Result<LossOutput> {
    let (positions, vocab) = check_targets(logits, targets)?;
    let ld = logits.data_f32()?;

    let mut loss_sum = 0.0f64;
    let mut correct = 0usize;
    let mut valid = 0usize;
    for p in 0..positions {
        let target = targets[p];
        if target == PAD_TOKEN_ID {
            continue;
        }
        if target as usize >= vocab {
            return Err(NanoTuneError::shape(
                "loss target id",
                &[vocab],
                &[target as usize],
            ));
        }
        let row = &ld[p * vocab..(p + 1) * vocab];
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let sum_exp: f64 = row.iter().map(|&v| ((v - max) as f64).exp()).sum();
        let lse = max as f64 + sum_exp.ln();
        loss_sum += lse - row[target as usize] as f64;

        let argmax = row
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, _)| i)
            .unwrap_or(0);
        if argmax == target as usize {
            correct += 1;
        }
        valid += 1;
    }

    if valid == 0 {
        return Err(NanoTuneError::EmptyBatch(
            "no non-padding targets in batch".into(),
        ));
    }

    Ok(LossOutput {
        loss: loss_sum / valid as f64,
        accuracy: correct as f64 / valid as f64,
        valid_positions: valid,
    })
}

/// Backward: G[b,l,v] = (softmax(logits) − one_hot(target)) / valid for
/// non-padding positions, zero elsewhere. The result is a Gradients-category
/// tensor shaped like the logits.
pub fn cross_entropy_backward(logits: &Tensor, targets: &[u32]) -> Result<Tensor> {
    let (positions, vocab) = check_targets(logits, targets)?;
    let ld = logits.data_f32()?;

    let valid = targets.iter().filter(|&&t| t != PAD_TOKEN_ID).count();
    if valid == 0 {
        return Err(NanoTuneError::EmptyBatch(
            "no non-padding targets in batch".into(),
        ));
    }
    let inv_valid = 1.0 / valid as f32;

    let mut grad = vec![0.0f32; ld.len()];
    for p in 0..positions {
        let target = targets[p];
        if target == PAD_TOKEN_ID {
            continue;
        }
        let row = &ld[p * vocab..(p + 1) * vocab];
        let out = &mut grad[p * vocab..(p + 1) * vocab];
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        for (o, &v) in out.iter_mut().zip(row.iter()) {
            *o = (v - max).exp();
            sum += *o;
        }
        for o in out.iter_mut() {
            *o /= sum;
        }
        out[target as usize] -= 1.0;
        for o in out.iter_mut() {
            *o *= inv_valid;
        }
    }

    Tensor::from_vec(
        grad,
        logits.shape(),
        MemoryCategory::Gradients,
        logits.accountant(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanotune_tensor::MemoryAccountant;
    use std::sync::Arc;

    fn logits(data: &[f32], shape: &[usize]) -> Tensor {
        let acc = Arc::new(MemoryAccountant::new());
        Tensor::from_vec(data.to_vec(), shape, MemoryCategory::Activations, &acc).unwrap()
    }

    #[test]
    fn test_known_loss_value() {
        // Per-position CE with the target logit at 2:
        // loss = ln(e^2 + e + 1 + e^-1) - 2 ≈ 0.4250
        let l = logits(&[1.0, 2.0, 0.0, -1.0], &[1, 1, 4]);
        let out = cross_entropy(&l, &[1]).unwrap();
        let expected = (2f64.exp() + 1f64.exp() + 1.0 + (-1f64).exp()).ln() - 2.0;
        assert!((out.loss - expected).abs() < 1e-6);
        assert_eq!(out.accuracy, 1.0);
        assert_eq!(out.valid_positions, 1);
    }

    #[test]
    fn test_padding_positions_ignored() {
        // E4: targets [0, 0, 1] -> only position 2 counts.
        let l = logits(
            &[
                5.0, 0.0, 0.0, 0.0, // pos 0, padded
                0.0, 5.0, 0.0, 0.0, // pos 1, padded
                0.0, 1.0, 0.0, 0.0, // pos 2, target 1
            ],
            &[1, 3, 4],
        );
        let out = cross_entropy(&l, &[0, 0, 1]).unwrap();
        assert_eq!(out.valid_positions, 1);

        let single = logits(&[0.0, 1.0, 0.0, 0.0], &[1, 1, 4]);
        let single_out = cross_entropy(&single, &[1]).unwrap();
        assert!((out.loss - single_out.loss).abs() < 1e-9);
    }

    #[test]
    fn test_all_padding_is_empty_batch() {
        let l = logits(&[1.0, 2.0, 1.0, 2.0], &[1, 2, 2]);
        assert!(matches!(
            cross_entropy(&l, &[0, 0]),
            Err(NanoTuneError::EmptyBatch(_))
        ));
        assert!(matches!(
            cross_entropy_backward(&l, &[0, 0]),
            Err(NanoTuneError::EmptyBatch(_))
        ));
    }

    #[test]
    fn test_backward_rows_sum_to_zero() {
        let l = logits(&[0.3, -1.2, 2.0, 0.1, 0.5, -0.5], &[1, 2, 3]);
        let g = cross_entropy_backward(&l, &[2, 1]).unwrap();
        assert_eq!(g.category(), MemoryCategory::Gradients);
        for row in g.data_f32().unwrap().chunks_exact(3) {
            let s: f32 = row.iter().sum();
            assert!(s.abs() < 1e-6, "row sums to {}", s);
        }
    }

    #[test]
    fn test_backward_zero_on_padding() {
        let l = logits(&[1.0, 2.0, 3.0, 1.0, 2.0, 3.0], &[1, 2, 3]);
        let g = cross_entropy_backward(&l, &[0, 1]).unwrap();
        let gd = g.data_f32().unwrap();
        assert!(gd[0..3].iter().all(|&v| v == 0.0));
        assert!(gd[3..6].iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_backward_matches_finite_differences() {
        let base = [0.4f32, -0.3, 1.1, 0.0, 0.7, -1.0];
        let targets = [2u32, 1];
        let l = logits(&base, &[1, 2, 3]);
        let analytic = cross_entropy_backward(&l, &targets).unwrap();
        let ad = analytic.data_f32().unwrap();

        let eps = 1e-3f32;
        for i in 0..base.len() {
            let mut plus = base;
            plus[i] += eps;
            let mut minus = base;
            minus[i] -= eps;
            let lp = cross_entropy(&logits(&plus, &[1, 2, 3]), &targets).unwrap().loss;
            let lm = cross_entropy(&logits(&minus, &[1, 2, 3]), &targets).unwrap().loss;
            let numeric = ((lp - lm) / (2.0 * eps as f64)) as f32;
            assert!(
                (numeric - ad[i]).abs() < 1e-3,
                "grad {} numeric {} analytic {}",
                i,
                numeric,
                ad[i]
            );
        }
    }
}
