//! Quantized model container.
//!
//! Owns the tied embedding/LM-head tensor and the per-layer frozen NF4
//! weights. Layer weights are dequantized lazily at layer time; the
//! container never materializes the whole model in f32.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use nanotune_core::{ModelConfig, NanoTuneError, Result};
use nanotune_tensor::{MemoryAccountant, Tensor};
use nf4_core::QuantizedTensor;

use crate::embed::QuantizedEmbedding;
use crate::hooks::ForwardHooks;
use crate::kernels::{ExpertKernel, ScanKernel};
use crate::moe::MoeWeights;
use crate::ssm::SsmWeights;
use crate::{moe, ssm};

/// Kind of a layer in the interleaving schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerKind {
    StateSpace,
    Moe,
}

/// The schedule places a MoE layer at every index with (index mod 4) == 3;
/// all remaining indices are state-space. Pure function of the index so the
/// schedule is reproducible from `num_layers` alone.
pub fn layer_kind(index: usize) -> LayerKind {
    if index % 4 == 3 {
        LayerKind::Moe
    } else {
        LayerKind::StateSpace
    }
}

/// Frozen weights of one layer.
#[derive(Debug, Clone)]
pub enum LayerWeights {
    StateSpace(SsmWeights),
    Moe(MoeWeights),
}

impl LayerWeights {
    pub fn kind(&self) -> LayerKind {
        match self {
            LayerWeights::StateSpace(_) => LayerKind::StateSpace,
            LayerWeights::Moe(_) => LayerKind::Moe,
        }
    }
}

/// Container for the frozen quantized model.
pub struct QuantizedModel {
    pub config: ModelConfig,
    embedding: QuantizedEmbedding,
    layers: Vec<LayerWeights>,
    scan_kernel: Option<Arc<dyn ScanKernel>>,
    expert_kernel: Option<Arc<dyn ExpertKernel>>,
    accountant: Arc<MemoryAccountant>,
}

impl QuantizedModel {
    /// Assemble a model from already-quantized parts. Validates the layer
    /// count and that each layer matches the schedule.
    pub fn from_parts(
        config: ModelConfig,
        embedding: QuantizedEmbedding,
        layers: Vec<LayerWeights>,
        accountant: Arc<MemoryAccountant>,
    ) -> Result<Self> {
        config.validate()?;
        if layers.len() != config.num_layers {
            return Err(NanoTuneError::shape(
                "layer count",
                &[config.num_layers],
                &[layers.len()],
            ));
        }
        for (i, layer) in layers.iter().enumerate() {
            if layer.kind() != layer_kind(i) {
                return Err(NanoTuneError::InvalidConfig(format!(
                    "layer {} kind does not match schedule",
                    i
                )));
            }
        }
        Ok(Self {
            config,
            embedding,
            layers,
            scan_kernel: None,
            expert_kernel: None,
            accountant,
        })
    }

    /// Build a model with random NF4-quantized weights. Used by smoke runs,
    /// benchmarks, and tests; real weights arrive through the external
    /// checkpoint collaborator.
    pub fn new_random(
        config: ModelConfig,
        seed: u64,
        accountant: Arc<MemoryAccountant>,
    ) -> Result<Self> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let d = config.d_model;
        let di = config.d_inner();
        let ds = config.ssm.d_state;
        let dr = config.ssm.dt_rank;
        let dc = config.ssm.d_conv;
        let dff = config.moe.d_ff;
        let e = config.moe.num_experts;
        let bs = config.block_size;
        let dq = config.double_quant;

        let quantize_random = |shape: &[usize], std: f32, rng: &mut StdRng| -> Result<QuantizedTensor> {
            let n: usize = shape.iter().product();
            let mut data = Vec::with_capacity(n);
            while data.len() < n {
                let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
                let u2: f32 = rng.gen();
                let r = (-2.0 * u1.ln()).sqrt();
                let theta = 2.0 * std::f32::consts::PI * u2;
                data.push(r * theta.cos() * std);
                if data.len() < n {
                    data.push(r * theta.sin() * std);
                }
            }
            nf4_core::quantize(&data, shape, bs, dq)
        };

        let emb_std = 1.0 / (d as f32).sqrt();
        let embedding = QuantizedEmbedding::new(quantize_random(
            &[config.vocab_size, d],
            emb_std,
            &mut rng,
        )?)?;

        let proj_std = 1.0 / (d as f32).sqrt();
        let mut layers = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            let layer = match layer_kind(i) {
                LayerKind::StateSpace => LayerWeights::StateSpace(SsmWeights {
                    w_in: quantize_random(&[d, 2 * di], proj_std, &mut rng)?,
                    conv_w: quantize_random(&[di, dc], 0.2, &mut rng)?,
                    conv_b: quantize_random(&[di], 0.01, &mut rng)?,
                    w_x: quantize_random(&[di, dr + 2 * ds], proj_std, &mut rng)?,
                    w_dt: quantize_random(&[dr, di], proj_std, &mut rng)?,
                    a: quantize_random(&[di, ds], 0.5, &mut rng)?,
                    d_skip: quantize_random(&[di], 0.5, &mut rng)?,
                    w_out: quantize_random(&[di, d], proj_std, &mut rng)?,
                }),
                LayerKind::Moe => LayerWeights::Moe(MoeWeights {
                    w_router: quantize_random(&[d, e], proj_std, &mut rng)?,
                    w1: (0..e)
                        .map(|_| quantize_random(&[d, dff], proj_std, &mut rng))
                        .collect::<Result<_>>()?,
                    w2: (0..e)
                        .map(|_| quantize_random(&[dff, d], proj_std, &mut rng))
                        .collect::<Result<_>>()?,
                }),
            };
            layers.push(layer);
        }

        Ok(Self {
            config,
            embedding,
            layers,
            scan_kernel: None,
            expert_kernel: None,
            accountant,
        })
    }

    /// Install a selective-scan kernel.
    pub fn with_scan_kernel(mut self, kernel: Arc<dyn ScanKernel>) -> Self {
        self.scan_kernel = Some(kernel);
        self
    }

    /// Install an expert FFN kernel.
    pub fn with_expert_kernel(mut self, kernel: Arc<dyn ExpertKernel>) -> Self {
        self.expert_kernel = Some(kernel);
        self
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn embedding(&self) -> &QuantizedEmbedding {
        &self.embedding
    }

    pub fn accountant(&self) -> &Arc<MemoryAccountant> {
        &self.accountant
    }

    /// Input dimension of the named projection point (the adapter's fan-in)
    /// and its output dimension, for adapter construction.
    pub fn projection_dims(&self, layer: usize, suffix: &str) -> Result<(usize, usize)> {
        let d = self.config.d_model;
        let di = self.config.d_inner();
        match (layer_kind(layer), suffix) {
            (LayerKind::StateSpace, "in-proj") => Ok((d, 2 * di)),
            (LayerKind::StateSpace, "x-proj") => Ok((
                di,
                self.config.ssm.dt_rank + 2 * self.config.ssm.d_state,
            )),
            (LayerKind::StateSpace, "out-proj") => Ok((di, d)),
            (LayerKind::Moe, "router") => Ok((d, self.config.moe.num_experts)),
            _ => Err(NanoTuneError::InvalidConfig(format!(
                "layer {} has no projection '{}'",
                layer, suffix
            ))),
        }
    }

    /// Gather embeddings for a row-major [batch, seq] id buffer.
    pub fn embed(&self, ids: &[u32], batch: usize, seq: usize) -> Result<Tensor> {
        self.embedding.embed(ids, batch, seq, &self.accountant)
    }

    /// Tied-head projection [B, L, D] -> [B, L, V].
    pub fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor> {
        self.embedding.project_to_vocab(hidden, &self.accountant)
    }

    /// Dequantized head weights [V, D] for the loss-side backward.
    pub fn head_weights(&self) -> Result<Tensor> {
        self.embedding.dequantized_table(&self.accountant)
    }

    /// Dispatch one layer with on-the-fly dequantization. MoE layers return
    /// their auxiliary load-balancing scalar.
    pub fn forward_layer(
        &self,
        index: usize,
        input: &Tensor,
        hooks: &mut dyn ForwardHooks,
    ) -> Result<(Tensor, Option<f32>)> {
        let layer = self.layers.get(index).ok_or_else(|| {
            NanoTuneError::InvalidConfig(format!(
                "layer index {} out of range ({} layers)",
                index,
                self.layers.len()
            ))
        })?;
        match layer {
            LayerWeights::StateSpace(w) => {
                let out = ssm::forward(
                    w,
                    &self.config,
                    index,
                    input,
                    self.scan_kernel.as_deref(),
                    hooks,
                    &self.accountant,
                )?;
                Ok((out, None))
            }
            LayerWeights::Moe(w) => {
                let (out, aux) = moe::forward(
                    w,
                    &self.config,
                    index,
                    input,
                    self.expert_kernel.as_deref(),
                    hooks,
                    &self.accountant,
                )?;
                Ok((out, Some(aux)))
            }
        }
    }

    /// Full forward pass: embed, all layers, tied-head projection.
    /// Returns logits [B, L, V] and the summed auxiliary loss.
    pub fn forward(
        &self,
        ids: &[u32],
        batch: usize,
        seq: usize,
        hooks: &mut dyn ForwardHooks,
    ) -> Result<(Tensor, f32)> {
        let mut hidden = self.embed(ids, batch, seq)?;
        let mut aux_total = 0.0f32;
        for i in 0..self.layers.len() {
            let (next, aux) = self.forward_layer(i, &hidden, hooks)?;
            hidden = next;
            if let Some(a) = aux {
                aux_total += a;
            }
        }
        let logits = self.project_to_vocab(&hidden)?;
        Ok((logits, aux_total))
    }

    /// All quantized parameters with hierarchical names, for reporting.
    pub fn named_params(&self) -> Vec<(String, &QuantizedTensor)> {
        let mut out = vec![("embedding".to_string(), self.embedding.quantized())];
        for (i, layer) in self.layers.iter().enumerate() {
            match layer {
                LayerWeights::StateSpace(w) => {
                    for (name, q) in w.named() {
                        out.push((format!("layer{}.{}", i, name), q));
                    }
                }
                LayerWeights::Moe(w) => {
                    for (name, q) in w.named() {
                        out.push((format!("layer{}.{}", i, name), q));
                    }
                }
            }
        }
        out
    }

    /// Total bytes of the quantized representation (payload + scales).
    pub fn quantized_bytes(&self) -> usize {
        self.named_params().iter().map(|(_, q)| q.byte_count()).sum()
    }
}
