//! Training loop: forward with activation caching and gradient
//! checkpointing, loss, LoRA-only backward, gradient accumulation, and the
//! optimizer step, with recoverable-error handling and periodic
//! checkpointing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use nanotune_core::{
    CheckpointConfig, LoraConfig, NanoTuneError, OptimizerConfig, Result, TrainConfig,
};
use nanotune_model::QuantizedModel;
use nanotune_tensor::Tensor;

use crate::accum::GradientAccumulator;
use crate::backward::{adapter_gradients, hidden_gradient};
use crate::cache::ActivationCache;
use crate::checkpoint::CheckpointSink;
use crate::data::{Batch, DataSource};
use crate::logging::{log_checkpoint_save, log_step_recovery, log_training_step, TrainingMetrics};
use crate::loss::{cross_entropy, cross_entropy_backward};
use crate::lora::{LoraSet, TrainHooks};
use crate::optim::{global_grad_norm, AdamW, CosineWithWarmup, LrSchedule};

/// Cooperative cancellation flag, checked between steps. An in-flight step
/// always runs to completion first.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Statistics of one micro-batch step.
#[derive(Debug, Clone)]
pub struct StepStats {
    /// Task loss plus the MoE auxiliary term.
    pub loss: f64,
    pub aux_loss: f64,
    pub accuracy: f64,
    /// Global gradient norm at the optimizer step (0 between steps).
    pub grad_norm: f64,
    pub lr: f64,
    pub tokens_per_sec: f64,
    /// Whether this micro-batch completed an accumulation window and ran
    /// the optimizer.
    pub optimizer_stepped: bool,
}

/// How a training run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainOutcome {
    Completed,
    Cancelled,
}

/// Orchestrates fetch → forward → loss → backward → accumulate → step.
pub struct Trainer {
    model: QuantizedModel,
    adapters: LoraSet,
    cache: ActivationCache,
    accumulator: GradientAccumulator,
    optimizer: AdamW,
    schedule: Box<dyn LrSchedule>,
    train_config: TrainConfig,
    ckpt_config: CheckpointConfig,
    sink: Option<Box<dyn CheckpointSink>>,
    cancel: CancelToken,
    /// Optimizer steps taken.
    global_step: usize,
    /// Micro-batches accumulated since the last optimizer step.
    micro_step: usize,
    epoch: usize,
    /// Multiplier halved after every Numerical rollback.
    lr_scale: f64,
}

impl Trainer {
    pub fn new(
        model: QuantizedModel,
        lora_config: &LoraConfig,
        optimizer_config: OptimizerConfig,
        train_config: TrainConfig,
        ckpt_config: CheckpointConfig,
    ) -> Result<Self> {
        train_config.validate()?;
        ckpt_config.validate()?;
        let adapters = LoraSet::for_model(&model, lora_config, train_config.seed)?;
        if adapters.is_empty() {
            return Err(NanoTuneError::InvalidConfig(
                "no LoRA target module matches the model's layer schedule".into(),
            ));
        }
        let schedule = Box::new(CosineWithWarmup::new(
            optimizer_config.learning_rate,
            optimizer_config.learning_rate * train_config.min_lr_frac,
            train_config.warmup_steps,
            train_config.total_steps,
        ));
        let optimizer = AdamW::new(optimizer_config)?.with_f16_kernels();
        Ok(Self {
            model,
            adapters,
            cache: ActivationCache::new(),
            accumulator: GradientAccumulator::new(),
            optimizer,
            schedule,
            train_config,
            ckpt_config,
            sink: None,
            cancel: CancelToken::new(),
            global_step: 0,
            micro_step: 0,
            epoch: 0,
            lr_scale: 1.0,
        })
    }

    pub fn with_checkpoint_sink(mut self, sink: Box<dyn CheckpointSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn model(&self) -> &QuantizedModel {
        &self.model
    }

    pub fn adapters(&self) -> &LoraSet {
        &self.adapters
    }

    pub fn adapters_mut(&mut self) -> &mut LoraSet {
        &mut self.adapters
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Dropout/replay seed for the current micro-batch.
    fn step_seed(&self) -> u64 {
        self.train_config
            .seed
            .wrapping_add((self.global_step * self.train_config.grad_accum_steps + self.micro_step) as u64)
    }

    /// Checkpointed forward: returns the final hidden state and the summed
    /// auxiliary loss. With `recompute` enabled, hook pre-activations are
    /// not cached here; only layer-entry checkpoints are saved.
    fn forward_hidden(&mut self, batch: &Batch, seed: u64) -> Result<(Tensor, f32)> {
        let this = &mut *self;
        let model = &this.model;
        let save_every_n = this.ckpt_config.save_every_n;
        let recompute = this.ckpt_config.recompute;
        let mut hooks = TrainHooks {
            adapters: &this.adapters,
            cache: &mut this.cache,
            cache_enabled: !recompute,
            dropout_seed: Some(seed),
        };

        let mut hidden = model.embed(&batch.input_ids, batch.batch_size, batch.seq_len)?;
        let mut aux_total = 0.0f32;
        for i in 0..model.num_layers() {
            if recompute && i % save_every_n == 0 {
                hooks.cache.save(format!("layer{}.input", i), hidden.clone())?;
            }
            let (next, aux) = model.forward_layer(i, &hidden, &mut hooks)?;
            hidden = next;
            if let Some(a) = aux {
                aux_total += a;
            }
        }
        Ok((hidden, aux_total))
    }

    /// Rebuild hook pre-activations by replaying each segment from its
    /// nearest saved layer-entry checkpoint.
    fn recompute_segments(&mut self, seed: u64) -> Result<()> {
        let this = &mut *self;
        let model = &this.model;
        let n = this.ckpt_config.save_every_n;
        let num_layers = model.num_layers();

        let mut cp = 0;
        while cp < num_layers {
            let end = (cp + n).min(num_layers);
            let mut hidden = this.cache.get(&format!("layer{}.input", cp))?.clone();
            let mut hooks = TrainHooks {
                adapters: &this.adapters,
                cache: &mut this.cache,
                cache_enabled: true,
                dropout_seed: Some(seed),
            };
            for i in cp..end {
                let (next, _aux) = model.forward_layer(i, &hidden, &mut hooks)?;
                hidden = next;
            }
            cp = end;
        }
        Ok(())
    }

    /// Execute a single micro-batch step. Clears the activation cache
    /// before returning; zeroes the accumulator when an optimizer step
    /// completes the accumulation window.
    pub fn train_step(&mut self, batch: &Batch) -> Result<StepStats> {
        let step_start = Instant::now();
        let seed = self.step_seed();

        let result = self.train_step_inner(batch, seed);
        // The cache never outlives a step, success or failure.
        self.cache.clear();

        match result {
            Ok((loss, aux, accuracy, grad_norm, lr, stepped)) => {
                let elapsed = step_start.elapsed().as_secs_f64();
                let n_tokens = (batch.batch_size * batch.seq_len) as f64;
                Ok(StepStats {
                    loss,
                    aux_loss: aux,
                    accuracy,
                    grad_norm,
                    lr,
                    tokens_per_sec: if elapsed > 0.0 { n_tokens / elapsed } else { 0.0 },
                    optimizer_stepped: stepped,
                })
            }
            Err(NanoTuneError::Numerical { step, context }) => {
                // Roll back: discard the accumulated gradient and halve the
                // learning rate for subsequent steps.
                self.accumulator.zero();
                self.micro_step = 0;
                self.lr_scale *= 0.5;
                log_step_recovery(
                    step,
                    &context,
                    "discarded gradient, halved learning rate",
                );
                Err(NanoTuneError::Numerical { step, context })
            }
            Err(e) => Err(e),
        }
    }

    #[allow(clippy::type_complexity)]
    fn train_step_inner(
        &mut self,
        batch: &Batch,
        seed: u64,
    ) -> Result<(f64, f64, f64, f64, f64, bool)> {
        let (hidden, aux) = self.forward_hidden(batch, seed)?;
        let logits = self.model.project_to_vocab(&hidden)?;
        drop(hidden);

        let loss_out = cross_entropy(&logits, &batch.target_ids)?;
        let g_logits = cross_entropy_backward(&logits, &batch.target_ids)?;
        drop(logits);

        if self.ckpt_config.recompute {
            self.recompute_segments(seed)?;
        }

        let g_hidden = {
            let head = self.model.head_weights()?;
            hidden_gradient(&g_logits, &head)?
        };
        drop(g_logits);

        let grads = adapter_gradients(&self.adapters, &self.cache, &g_hidden)?;
        drop(g_hidden);
        for (name, pair) in &grads {
            self.accumulator.add(&format!("{}.A", name), &pair.a)?;
            self.accumulator.add(&format!("{}.B", name), &pair.b)?;
        }
        drop(grads);

        self.micro_step += 1;
        let lr = self.schedule.get(self.global_step + 1) * self.lr_scale;
        let mut grad_norm = 0.0;
        let mut stepped = false;
        if self.micro_step >= self.train_config.grad_accum_steps {
            grad_norm = global_grad_norm(&self.accumulator)?;
            let mut params: Vec<(String, &mut Tensor)> = Vec::new();
            for (name, adapter) in self.adapters.iter_mut() {
                params.push((format!("{}.A", name), &mut adapter.a));
                params.push((format!("{}.B", name), &mut adapter.b));
            }
            self.optimizer.step(lr, params, &self.accumulator)?;
            self.accumulator.zero();
            self.micro_step = 0;
            self.global_step += 1;
            stepped = true;
        }

        Ok((
            loss_out.loss + aux as f64,
            aux as f64,
            loss_out.accuracy,
            grad_norm,
            lr,
            stepped,
        ))
    }

    /// Run the loop until the configured number of optimizer steps, the data
    /// source is exhausted, or the cancel token fires.
    pub fn run(&mut self, data: &mut dyn DataSource) -> Result<TrainOutcome> {
        while self.global_step < self.train_config.total_steps {
            if self.cancel.is_cancelled() {
                tracing::info!(step = self.global_step, "training cancelled");
                return Ok(TrainOutcome::Cancelled);
            }
            let batch = match data.next_batch() {
                Some(b) => b,
                None => {
                    self.epoch += 1;
                    tracing::info!(epoch = self.epoch, "data source exhausted");
                    return Ok(TrainOutcome::Completed);
                }
            };

            match self.train_step(&batch) {
                Ok(stats) => self.after_step(&stats)?,
                Err(NanoTuneError::EmptyBatch(msg)) => {
                    log_step_recovery(self.global_step, &msg, "skipped micro-batch");
                }
                Err(NanoTuneError::Numerical { .. }) => {
                    // Already rolled back inside train_step.
                }
                Err(NanoTuneError::AllocationFailed(msg)) => {
                    // Free the cache and retry once at half the micro-batch.
                    log_step_recovery(
                        self.global_step,
                        &msg,
                        "cleared activation cache, retrying at half batch",
                    );
                    self.cache.clear();
                    let mut smaller = batch.clone();
                    smaller.truncate_rows(batch.batch_size / 2);
                    let stats = self.train_step(&smaller)?;
                    self.after_step(&stats)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(TrainOutcome::Completed)
    }

    fn after_step(&mut self, stats: &StepStats) -> Result<()> {
        if !stats.optimizer_stepped {
            return Ok(());
        }
        if self.global_step % self.train_config.log_interval == 0 {
            let metrics = TrainingMetrics {
                loss: stats.loss,
                aux_loss: stats.aux_loss,
                accuracy: stats.accuracy,
                learning_rate: stats.lr,
                grad_norm: stats.grad_norm,
                tokens_per_sec: stats.tokens_per_sec,
            };
            log_training_step(
                self.global_step,
                &metrics,
                &self.model.accountant().snapshot(),
            );
        }
        if self.train_config.checkpoint_interval > 0
            && self.global_step % self.train_config.checkpoint_interval == 0
        {
            if let Some(sink) = self.sink.as_mut() {
                sink.write(self.epoch, self.global_step, stats.loss, &self.adapters)?;
                log_checkpoint_save(self.global_step, "checkpoint sink", stats.loss);
            }
        }
        Ok(())
    }
}
