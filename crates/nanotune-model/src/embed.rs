//! Quantized token embedding, tied with the language-model head.

use std::sync::Arc;

use nanotune_core::{NanoTuneError, Result};
use nanotune_tensor::{ops, MemoryAccountant, MemoryCategory, Tensor};
use nf4_core::QuantizedTensor;

/// Frozen NF4 embedding table of shape [vocab_size, d_model].
///
/// Rows are gathered with on-demand dequantization; the full table is only
/// materialized (as a Temporary tensor) for the tied-head projection.
#[derive(Debug, Clone)]
pub struct QuantizedEmbedding {
    q: QuantizedTensor,
}

/// Token id reserved for padding; it embeds to the zero row and is ignored
/// by the loss.
pub const PAD_TOKEN_ID: u32 = 0;

impl QuantizedEmbedding {
    pub fn new(q: QuantizedTensor) -> Result<Self> {
        if q.shape.len() != 2 {
            return Err(NanoTuneError::shape("embedding table", &[0, 0], &q.shape));
        }
        Ok(Self { q })
    }

    pub fn vocab_size(&self) -> usize {
        self.q.shape[0]
    }

    pub fn d_model(&self) -> usize {
        self.q.shape[1]
    }

    pub fn quantized(&self) -> &QuantizedTensor {
        &self.q
    }

    /// Gather rows for `ids` (row-major [batch, seq]) into an activation
    /// tensor [batch, seq, d_model]. The padding id and out-of-range ids
    /// yield the zero row.
    pub fn embed(
        &self,
        ids: &[u32],
        batch: usize,
        seq: usize,
        accountant: &Arc<MemoryAccountant>,
    ) -> Result<Tensor> {
        if ids.len() != batch * seq {
            return Err(NanoTuneError::shape("embed ids", &[batch * seq], &[ids.len()]));
        }
        let d = self.d_model();
        let mut out = vec![0.0f32; batch * seq * d];
        for (t, &id) in ids.iter().enumerate() {
            if id == PAD_TOKEN_ID || id as usize >= self.vocab_size() {
                continue;
            }
            let row = self.q.dequantize_range(id as usize * d, d);
            out[t * d..(t + 1) * d].copy_from_slice(&row);
        }
        Tensor::from_vec(out, &[batch, seq, d], MemoryCategory::Activations, accountant)
    }

    /// Dequantize the full table as a Temporary tensor [vocab, d_model].
    pub fn dequantized_table(&self, accountant: &Arc<MemoryAccountant>) -> Result<Tensor> {
        Tensor::from_vec(
            self.q.dequantize(),
            &[self.vocab_size(), self.d_model()],
            MemoryCategory::Temporary,
            accountant,
        )
    }

    /// Tied-head projection: logits = hidden · tableᵀ,
    /// [B, L, D] -> [B, L, V].
    pub fn project_to_vocab(
        &self,
        hidden: &Tensor,
        accountant: &Arc<MemoryAccountant>,
    ) -> Result<Tensor> {
        let d = self.d_model();
        if hidden.shape().last() != Some(&d) {
            return Err(NanoTuneError::shape(
                "project_to_vocab hidden",
                &[d],
                hidden.shape(),
            ));
        }
        let table = self.dequantized_table(accountant)?;
        ops::matmul_transpose(hidden, &table)
    }
}
