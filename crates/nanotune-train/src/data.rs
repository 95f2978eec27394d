//! Batched data sources for training.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use nanotune_core::{DataConfig, NanoTuneError, Result};
use nanotune_model::PAD_TOKEN_ID;

/// One training batch, row-major [batch_size, seq_len].
#[derive(Debug, Clone)]
pub struct Batch {
    pub input_ids: Vec<u32>,
    pub target_ids: Vec<u32>,
    /// 1 for real tokens, 0 for padding.
    pub attention_mask: Vec<u8>,
    pub batch_size: usize,
    pub seq_len: usize,
}

impl Batch {
    /// Drop all but the first `rows` sequences. Used by the allocation-retry
    /// path to shrink the micro-batch.
    pub fn truncate_rows(&mut self, rows: usize) {
        let rows = rows.clamp(1, self.batch_size);
        let keep = rows * self.seq_len;
        self.input_ids.truncate(keep);
        self.target_ids.truncate(keep);
        self.attention_mask.truncate(keep);
        self.batch_size = rows;
    }
}

/// Iterator over training batches.
pub trait DataSource: Send {
    /// Next batch, or None when the source is exhausted.
    fn next_batch(&mut self) -> Option<Batch>;
}

/// Generates patterned and random token sequences for training-loop
/// validation. Token ids stay in [1, vocab_size) so nothing collides with
/// the padding id.
pub struct SyntheticDataSource {
    config: DataConfig,
    rng: StdRng,
    remaining: usize,
    sample_idx: usize,
}

impl SyntheticDataSource {
    pub fn new(config: DataConfig, num_batches: usize, seed: u64) -> Result<Self> {
        config.validate()?;
        if config.vocab_size < 2 {
            return Err(NanoTuneError::InvalidConfig(
                "synthetic data needs vocab_size >= 2".into(),
            ));
        }
        Ok(Self {
            config,
            rng: StdRng::seed_from_u64(seed),
            remaining: num_batches,
            sample_idx: 0,
        })
    }

    fn sequence(&mut self) -> Vec<u32> {
        let len = self.config.seq_length + 1;
        let vocab = self.config.vocab_size as u32;
        let seq = match self.sample_idx % 3 {
            0 => {
                // Repeated token
                let tok = (self.sample_idx as u32 % (vocab - 1)) + 1;
                vec![tok; len]
            }
            1 => {
                // Sequential (modular, skipping the padding id)
                let start = self.sample_idx as u32;
                (0..len as u32)
                    .map(|j| (start + j) % (vocab - 1) + 1)
                    .collect()
            }
            _ => (0..len)
                .map(|_| self.rng.gen_range(1..vocab))
                .collect(),
        };
        self.sample_idx += 1;
        seq
    }
}

impl DataSource for SyntheticDataSource {
    fn next_batch(&mut self) -> Option<Batch> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let (b, l) = (self.config.batch_size, self.config.seq_length);
        let mut input_ids = Vec::with_capacity(b * l);
        let mut target_ids = Vec::with_capacity(b * l);
        for _ in 0..b {
            let seq = self.sequence();
            input_ids.extend_from_slice(&seq[..l]);
            target_ids.extend_from_slice(&seq[1..=l]);
        }
        let attention_mask = input_ids
            .iter()
            .map(|&t| (t != PAD_TOKEN_ID) as u8)
            .collect();
        Some(Batch {
            input_ids,
            target_ids,
            attention_mask,
            batch_size: b,
            seq_len: l,
        })
    }
}

/// Pre-tokenized source backed by a flat buffer of tokens, chunked into
/// non-overlapping sequences with optional seeded shuffling.
pub struct TokenFileDataSource {
    tokens: Vec<u32>,
    config: DataConfig,
    order: Vec<usize>,
    pos: usize,
}

impl TokenFileDataSource {
    pub fn new(tokens: Vec<u32>, config: DataConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let n_chunks = tokens.len().saturating_sub(1) / config.seq_length;
        if n_chunks == 0 {
            return Err(NanoTuneError::InvalidConfig(format!(
                "token buffer of {} tokens too short for seq_length {}",
                tokens.len(),
                config.seq_length
            )));
        }
        let mut order: Vec<usize> = (0..n_chunks).collect();
        if config.shuffle {
            order.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        Ok(Self {
            tokens,
            config,
            order,
            pos: 0,
        })
    }

    /// Load from a binary file of little-endian u32 values.
    pub fn from_binary_file<P: AsRef<std::path::Path>>(
        path: P,
        config: DataConfig,
        seed: u64,
    ) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        if data.len() % 4 != 0 {
            return Err(NanoTuneError::InvalidConfig(format!(
                "token file {} has {} bytes (not a multiple of 4)",
                path.as_ref().display(),
                data.len()
            )));
        }
        let tokens: Vec<u32> = data
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Self::new(tokens, config, seed)
    }

    pub fn num_chunks(&self) -> usize {
        self.order.len()
    }
}

impl DataSource for TokenFileDataSource {
    fn next_batch(&mut self) -> Option<Batch> {
        if self.pos >= self.order.len() {
            return None;
        }
        let l = self.config.seq_length;
        let end = (self.pos + self.config.batch_size).min(self.order.len());
        let chunk_ids = &self.order[self.pos..end];
        self.pos = end;

        let mut input_ids = Vec::with_capacity(chunk_ids.len() * l);
        let mut target_ids = Vec::with_capacity(chunk_ids.len() * l);
        for &c in chunk_ids {
            let start = c * l;
            input_ids.extend_from_slice(&self.tokens[start..start + l]);
            target_ids.extend_from_slice(&self.tokens[start + 1..start + l + 1]);
        }
        let attention_mask = input_ids
            .iter()
            .map(|&t| (t != PAD_TOKEN_ID) as u8)
            .collect();
        Some(Batch {
            input_ids,
            target_ids,
            attention_mask,
            batch_size: chunk_ids.len(),
            seq_len: l,
        })
    }
}
