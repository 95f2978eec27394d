//! Block quantization of f32 tensors to packed NF4 with per-block scales.
//!
//! For each block of `block_size` elements:
//!   1. scale = max(|x|) over the block, floored at 1e-8
//!   2. each element is normalized by the scale and snapped to the nearest
//!      code-book level
//!   3. codes are packed two per byte, low nibble first
//!
//! With double quantization enabled, every 4 consecutive blocks form a
//! super-block whose scales are re-expressed against a shared u8 level-2
//! scale, trading a small extra error for ~0.5 bits/weight.

use half::f16;

use nanotune_core::{NanoTuneError, Result};

use crate::codebook::{nearest_index, pack_pair, unpack_pair, NF4_CODEBOOK};

/// Blocks per super-block for double quantization.
pub const SUPER_BLOCK: usize = 4;

/// Floor applied to block scales so all-zero blocks stay invertible.
const SCALE_FLOOR: f32 = 1e-8;

/// A quantized tensor: packed 4-bit payload plus scale hierarchy.
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    /// Packed codes, two per byte, low nibble first. Length ceil(N/2).
    pub packed: Vec<u8>,
    /// Level-1 scales, one f16 per block. Length ceil(N/block_size).
    pub scales: Vec<f16>,
    /// Level-2 scales, one u8 per super-block of 4 blocks, present when
    /// double quantization is enabled.
    pub scales_l2: Option<Vec<u8>>,
    /// Original shape of the source tensor.
    pub shape: Vec<usize>,
    pub block_size: usize,
    pub double_quant: bool,
}

impl QuantizedTensor {
    /// Logical element count.
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Total bytes of payload + scales.
    pub fn byte_count(&self) -> usize {
        self.packed.len()
            + self.scales.len() * 2
            + self.scales_l2.as_ref().map_or(0, |s| s.len())
    }

    /// Effective dequantization scale for block `b`.
    fn effective_scale(&self, b: usize) -> f32 {
        let l1 = self.scales[b].to_f32();
        match &self.scales_l2 {
            Some(l2) => l1 * (l2[b / SUPER_BLOCK] as f32 / 127.0),
            None => l1,
        }
    }

    /// Dequantize back to a flat f32 buffer of `num_elements()` values.
    pub fn dequantize(&self) -> Vec<f32> {
        self.dequantize_range(0, self.num_elements())
    }

    /// Dequantize `len` elements starting at flat index `start`.
    /// Lets callers gather rows without materializing the whole tensor.
    pub fn dequantize_range(&self, start: usize, len: usize) -> Vec<f32> {
        debug_assert!(start + len <= self.num_elements());
        let mut out = Vec::with_capacity(len);
        let mut block = usize::MAX;
        let mut block_scale = 0.0f32;
        for g in start..start + len {
            if g / self.block_size != block {
                block = g / self.block_size;
                block_scale = self.effective_scale(block);
            }
            let byte = self.packed[g / 2];
            let (lo, hi) = unpack_pair(byte);
            let code = if g % 2 == 0 { lo } else { hi };
            out.push(NF4_CODEBOOK[code as usize] * block_scale);
        }
        out
    }
}

/// Quantize a flat f32 buffer of the given shape.
///
/// Fails with `CodecSize` when the shape is empty (or has a zero dim),
/// the block size is zero, or the buffer length disagrees with the shape.
pub fn quantize(
    data: &[f32],
    shape: &[usize],
    block_size: usize,
    double_quant: bool,
) -> Result<QuantizedTensor> {
    if shape.is_empty() || shape.contains(&0) {
        return Err(NanoTuneError::CodecSize(format!(
            "cannot quantize empty shape {:?}",
            shape
        )));
    }
    if block_size == 0 {
        return Err(NanoTuneError::CodecSize("block_size must be > 0".into()));
    }
    let n: usize = shape.iter().product();
    if data.len() != n {
        return Err(NanoTuneError::CodecSize(format!(
            "buffer length {} != shape element count {}",
            data.len(),
            n
        )));
    }

    let n_blocks = n.div_ceil(block_size);
    let mut packed = vec![0u8; n.div_ceil(2)];
    let mut block_scales = Vec::with_capacity(n_blocks);

    for (b, block) in data.chunks(block_size).enumerate() {
        let mut s = block.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
        if s < SCALE_FLOOR {
            s = SCALE_FLOOR;
        }
        block_scales.push(s);

        let base = b * block_size;
        for (i, &x) in block.iter().enumerate() {
            let g = base + i;
            let code = nearest_index(x / s);
            let byte = &mut packed[g / 2];
            if g % 2 == 0 {
                *byte = (*byte & 0xF0) | (code & 0x0F);
            } else {
                *byte = pack_pair(*byte & 0x0F, code);
            }
        }
    }

    let (scales, scales_l2) = if double_quant {
        let mut l1 = Vec::with_capacity(n_blocks);
        let mut l2 = Vec::with_capacity(n_blocks.div_ceil(SUPER_BLOCK));
        for sb in block_scales.chunks(SUPER_BLOCK) {
            let s_max = sb.iter().fold(0.0f32, |m, &x| m.max(x));
            // Level-2 byte encodes the super-block scale ŝ = s_max / 127;
            // clamped to >= 1 so small-magnitude super-blocks stay invertible.
            let q = (s_max).round().clamp(1.0, 127.0) as u8;
            let dequant_l2 = q as f32 / 127.0;
            l2.push(q);
            for &s in sb {
                l1.push(f16::from_f32(s / dequant_l2));
            }
        }
        (l1, Some(l2))
    } else {
        (
            block_scales.iter().map(|&s| f16::from_f32(s)).collect(),
            None,
        )
    };

    Ok(QuantizedTensor {
        packed,
        scales,
        scales_l2,
        shape: shape.to_vec(),
        block_size,
        double_quant,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_e1_known_block() {
        let t = [1.0f32, -1.0, 0.0, 0.5, -0.25, 0.1, -0.9, 0.3];
        let q = quantize(&t, &[8], 8, false).unwrap();

        assert_eq!(q.scales.len(), 1);
        assert!((q.scales[0].to_f32() - 1.0).abs() < 1e-3);

        // Nearest-in-table positions under the argmin rule of the codec.
        let expected_codes = [15u8, 0, 7, 12, 4, 8, 0, 11];
        for (g, &want) in expected_codes.iter().enumerate() {
            let (lo, hi) = unpack_pair(q.packed[g / 2]);
            let got = if g % 2 == 0 { lo } else { hi };
            assert_eq!(got, want, "element {} quantized to wrong code", g);
        }

        // Dequantization recovers the table values scaled by 1.0.
        let deq = q.dequantize();
        for (g, &code) in expected_codes.iter().enumerate() {
            assert!((deq[g] - NF4_CODEBOOK[code as usize]).abs() < 1e-3);
        }
    }

    #[test]
    fn test_empty_shape_rejected() {
        assert!(matches!(
            quantize(&[], &[], 64, false),
            Err(NanoTuneError::CodecSize(_))
        ));
        assert!(matches!(
            quantize(&[], &[0], 64, false),
            Err(NanoTuneError::CodecSize(_))
        ));
    }

    #[test]
    fn test_zero_block_size_rejected() {
        assert!(matches!(
            quantize(&[1.0], &[1], 0, false),
            Err(NanoTuneError::CodecSize(_))
        ));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        assert!(quantize(&[1.0, 2.0], &[3], 64, false).is_err());
    }

    #[test]
    fn test_all_zero_block_stays_zero() {
        let t = vec![0.0f32; 64];
        let q = quantize(&t, &[64], 64, false).unwrap();
        let deq = q.dequantize();
        for v in deq {
            assert!(v.abs() < 1e-7);
        }
    }

    #[test]
    fn test_short_last_block() {
        let t = [0.5f32, -0.5, 0.25, 1.0, 2.0];
        let q = quantize(&t, &[5], 4, false).unwrap();
        assert_eq!(q.scales.len(), 2);
        assert_eq!(q.packed.len(), 3);
        let deq = q.dequantize();
        assert_eq!(deq.len(), 5);
        // Last block has a single element; it must round-trip exactly.
        assert!((deq[4] - 2.0).abs() < 1e-2);
    }

    fn assert_per_block_bound(t: &[f32], block_size: usize, double_quant: bool) {
        let q = quantize(t, &[t.len()], block_size, double_quant).unwrap();
        let deq = q.dequantize();
        for (b, block) in t.chunks(block_size).enumerate() {
            let max_abs = block.iter().fold(0.0f32, |m, &x| m.max(x.abs()));
            let bound = 0.25 * max_abs + 1e-6;
            for (i, &x) in block.iter().enumerate() {
                let err = (deq[b * block_size + i] - x).abs();
                assert!(
                    err <= bound,
                    "block {} elt {}: err {} exceeds bound {} (dq={})",
                    b,
                    i,
                    err,
                    bound,
                    double_quant
                );
            }
        }
    }

    #[test]
    fn test_roundtrip_bound_gaussian() {
        let mut rng = StdRng::seed_from_u64(1234);
        for &sigma in &[0.01f32, 0.1, 0.5, 1.0] {
            for &dq in &[false, true] {
                let t: Vec<f32> = (0..512)
                    .map(|_| {
                        let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
                        let u2: f32 = rng.gen();
                        (-2.0 * u1.ln()).sqrt()
                            * (2.0 * std::f32::consts::PI * u2).cos()
                            * sigma
                    })
                    .collect();
                assert_per_block_bound(&t, 64, dq);
            }
        }
    }

    #[test]
    fn test_double_quant_scale_layout() {
        let t: Vec<f32> = (0..1024).map(|i| ((i * 37) % 100) as f32 / 100.0 - 0.5).collect();
        let q = quantize(&t, &[1024], 64, false).unwrap();
        let qd = quantize(&t, &[1024], 64, true).unwrap();
        assert_eq!(q.scales.len(), 16);
        assert_eq!(qd.scales_l2.as_ref().unwrap().len(), 4);
        assert_eq!(qd.byte_count(), q.byte_count() + 4);
    }

    #[test]
    fn test_shape_preserved() {
        let t = vec![0.1f32; 24];
        let q = quantize(&t, &[2, 3, 4], 8, true).unwrap();
        assert_eq!(q.shape, vec![2, 3, 4]);
        assert_eq!(q.num_elements(), 24);
        assert_eq!(q.dequantize().len(), 24);
    }

    proptest! {
        #[test]
        fn prop_roundtrip_bound(seed in 0u64..1000, sigma in 0.01f32..1.0, dq in proptest::bool::ANY) {
            let mut rng = StdRng::seed_from_u64(seed);
            let t: Vec<f32> = (0..256)
                .map(|_| {
                    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
                    let u2: f32 = rng.gen();
                    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos() * sigma
                })
                .collect();
            assert_per_block_bound(&t, 64, dq);
        }
    }
}
