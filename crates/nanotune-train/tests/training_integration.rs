//! End-to-end training scenarios over the tiny model.

use std::sync::Arc;

use nanotune_core::{
    CheckpointConfig, DataConfig, LoraConfig, ModelConfig, OptimizerConfig, TargetModule,
    TrainConfig,
};
use nanotune_model::{CpuScanKernel, QuantizedModel};
use nanotune_tensor::{MemoryAccountant, MemoryCategory};
use nanotune_train::{
    adapter_gradients, cross_entropy, cross_entropy_backward, hidden_gradient, AdamW,
    ActivationCache, DataSource, DirectoryCheckpointSink, GradientAccumulator, LoraAdapter,
    LoraSet, SyntheticDataSource, TrainHooks, TrainOutcome, Trainer,
};

fn tiny_model(num_layers: usize, seed: u64) -> QuantizedModel {
    let mut config = ModelConfig::tiny();
    config.num_layers = num_layers;
    let accountant = Arc::new(MemoryAccountant::new());
    QuantizedModel::new_random(config, seed, accountant)
        .unwrap()
        .with_scan_kernel(Arc::new(CpuScanKernel))
}

fn lora_config(rank: usize) -> LoraConfig {
    LoraConfig {
        rank,
        alpha: 2.0 * rank as f32,
        dropout: 0.0,
        target_modules: vec![TargetModule::StateOutProj, TargetModule::MoeRouter],
    }
}

fn optimizer_config() -> OptimizerConfig {
    OptimizerConfig {
        learning_rate: 1e-2,
        weight_decay: 0.0,
        max_grad_norm: Some(1.0),
        ..Default::default()
    }
}

fn train_config(total_steps: usize, accum: usize) -> TrainConfig {
    TrainConfig {
        total_steps,
        warmup_steps: 1,
        min_lr_frac: 0.1,
        grad_accum_steps: accum,
        log_interval: 100,
        checkpoint_interval: 0,
        seed: 42,
    }
}

/// Train-step smoke over a 4-layer model (one MoE layer in the schedule)
/// with a rank-8 adapter on "layer0.out-proj": the loss is finite, both
/// adapter matrices receive non-zero gradient once B has left its zero
/// initialization, and A moves measurably.
#[test]
fn train_step_smoke() {
    let model = tiny_model(4, 7);
    let config = lora_config(8);

    // Exactly one adapter, attached by hand.
    let (in_dim, out_dim) = model.projection_dims(0, "out-proj").unwrap();
    let mut rng = <rand::rngs::StdRng as rand::SeedableRng>::seed_from_u64(1);
    let mut adapters = LoraSet::new();
    adapters
        .attach(
            LoraAdapter::new(
                "layer0.out-proj",
                in_dim,
                out_dim,
                &config,
                &mut rng,
                model.accountant(),
            )
            .unwrap(),
        )
        .unwrap();

    let ids = [1u32, 2, 3, 4, 5];
    let targets = [2u32, 3, 4, 5, 1];
    let mut optimizer = AdamW::new(optimizer_config()).unwrap();
    let a_before: Vec<f32> = adapters
        .get("layer0.out-proj")
        .unwrap()
        .a
        .data_f32()
        .unwrap()
        .to_vec();

    let mut saw_nonzero_grad_a = false;
    let mut saw_nonzero_grad_b = false;
    for _step in 0..2 {
        let mut cache = ActivationCache::new();
        let (logits, _aux) = {
            let mut hooks = TrainHooks {
                adapters: &adapters,
                cache: &mut cache,
                cache_enabled: true,
                dropout_seed: None,
            };
            model.forward(&ids, 1, 5, &mut hooks).unwrap()
        };

        let loss = cross_entropy(&logits, &targets).unwrap();
        assert!(loss.loss.is_finite());
        assert_eq!(loss.valid_positions, 5);

        let g_logits = cross_entropy_backward(&logits, &targets).unwrap();
        let head = model.head_weights().unwrap();
        let g_hidden = hidden_gradient(&g_logits, &head).unwrap();
        let grads = adapter_gradients(&adapters, &cache, &g_hidden).unwrap();

        let pair = grads.get("layer0.out-proj").unwrap();
        saw_nonzero_grad_a |= pair.a.data_f32().unwrap().iter().any(|&v| v != 0.0);
        saw_nonzero_grad_b |= pair.b.data_f32().unwrap().iter().any(|&v| v != 0.0);

        let mut accum = GradientAccumulator::new();
        accum.add("layer0.out-proj.A", &pair.a).unwrap();
        accum.add("layer0.out-proj.B", &pair.b).unwrap();

        let adapter = adapters.get_mut("layer0.out-proj").unwrap();
        optimizer
            .step(
                1e-2,
                vec![
                    ("layer0.out-proj.A".to_string(), &mut adapter.a),
                    ("layer0.out-proj.B".to_string(), &mut adapter.b),
                ],
                &accum,
            )
            .unwrap();
    }

    assert!(saw_nonzero_grad_b, "grad_B never became non-zero");
    assert!(saw_nonzero_grad_a, "grad_A never became non-zero");

    let a_after = adapters.get("layer0.out-proj").unwrap().a.data_f32().unwrap().to_vec();
    let max_change = a_before
        .iter()
        .zip(a_after.iter())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0f32, f32::max);
    assert!(max_change >= 1e-6, "A barely moved: {}", max_change);
}

/// After a full training step plus cache.clear() and accumulator.zero(),
/// the activations, gradients, and temporary counters return to their
/// pre-step values.
#[test]
fn memory_counters_return_to_baseline() {
    for recompute in [false, true] {
        let model = tiny_model(4, 11);
        let accountant = Arc::clone(model.accountant());
        let mut trainer = Trainer::new(
            model,
            &lora_config(4),
            optimizer_config(),
            train_config(10, 1),
            CheckpointConfig {
                save_every_n: 2,
                recompute,
            },
        )
        .unwrap();

        let data_cfg = DataConfig {
            batch_size: 2,
            seq_length: 6,
            vocab_size: 256,
            shuffle: false,
            num_workers: 1,
        };
        let mut source = SyntheticDataSource::new(data_cfg, 4, 3).unwrap();

        let before = accountant.snapshot();
        let batch = source.next_batch().unwrap();
        let stats = trainer.train_step(&batch).unwrap();
        assert!(stats.optimizer_stepped);
        let after = accountant.snapshot();

        for cat in [
            MemoryCategory::Activations,
            MemoryCategory::Gradients,
            MemoryCategory::Temporary,
        ] {
            assert_eq!(
                before.category(cat).current,
                after.category(cat).current,
                "category {:?} leaked (recompute={})",
                cat,
                recompute
            );
        }
        // Optimizer state persists by design.
        assert!(after.category(MemoryCategory::OptimizerStates).current > 0);
    }
}

/// Gradient checkpointing with recomputation produces the same parameters
/// as caching everything (dropout disabled).
#[test]
fn recompute_matches_full_caching() {
    let run = |recompute: bool| -> Vec<f32> {
        let model = tiny_model(4, 13);
        let mut trainer = Trainer::new(
            model,
            &lora_config(4),
            optimizer_config(),
            train_config(10, 1),
            CheckpointConfig {
                save_every_n: 2,
                recompute,
            },
        )
        .unwrap();
        let data_cfg = DataConfig {
            batch_size: 1,
            seq_length: 5,
            vocab_size: 256,
            shuffle: false,
            num_workers: 1,
        };
        let mut source = SyntheticDataSource::new(data_cfg, 2, 9).unwrap();
        for _ in 0..2 {
            let batch = source.next_batch().unwrap();
            trainer.train_step(&batch).unwrap();
        }
        trainer
            .adapters()
            .get("layer0.out-proj")
            .unwrap()
            .b
            .data_f32()
            .unwrap()
            .to_vec()
    };

    let cached = run(false);
    let recomputed = run(true);
    assert_eq!(cached.len(), recomputed.len());
    for (c, r) in cached.iter().zip(recomputed.iter()) {
        assert!((c - r).abs() < 1e-6, "{} vs {}", c, r);
    }
}

/// The loop runs to completion, takes optimizer steps, and honors
/// accumulation windows.
#[test]
fn run_completes_with_accumulation() {
    let model = tiny_model(4, 17);
    let mut trainer = Trainer::new(
        model,
        &lora_config(4),
        optimizer_config(),
        train_config(3, 2),
        CheckpointConfig::default(),
    )
    .unwrap();

    let data_cfg = DataConfig {
        batch_size: 1,
        seq_length: 5,
        vocab_size: 256,
        shuffle: false,
        num_workers: 1,
    };
    // 2 micro-batches per optimizer step, 3 steps -> 6 batches needed.
    let mut source = SyntheticDataSource::new(data_cfg, 8, 5).unwrap();
    let outcome = trainer.run(&mut source).unwrap();
    assert_eq!(outcome, TrainOutcome::Completed);
    assert_eq!(trainer.global_step(), 3);
}

/// A pre-fired cancel token stops the loop before any step.
#[test]
fn cancellation_between_steps() {
    let model = tiny_model(4, 19);
    let mut trainer = Trainer::new(
        model,
        &lora_config(4),
        optimizer_config(),
        train_config(100, 1),
        CheckpointConfig::default(),
    )
    .unwrap();
    trainer.cancel_token().cancel();

    let data_cfg = DataConfig {
        batch_size: 1,
        seq_length: 5,
        vocab_size: 256,
        shuffle: false,
        num_workers: 1,
    };
    let mut source = SyntheticDataSource::new(data_cfg, 4, 5).unwrap();
    let outcome = trainer.run(&mut source).unwrap();
    assert_eq!(outcome, TrainOutcome::Cancelled);
    assert_eq!(trainer.global_step(), 0);
}

/// All-padding batches surface EmptyBatch from the loss and the loop skips
/// them without advancing the optimizer.
#[test]
fn empty_batch_is_skipped() {
    let model = tiny_model(4, 23);
    let mut trainer = Trainer::new(
        model,
        &lora_config(4),
        optimizer_config(),
        train_config(10, 1),
        CheckpointConfig::default(),
    )
    .unwrap();

    let batch = nanotune_train::Batch {
        input_ids: vec![1, 2, 3],
        target_ids: vec![0, 0, 0],
        attention_mask: vec![1, 1, 1],
        batch_size: 1,
        seq_len: 3,
    };
    let err = trainer.train_step(&batch).unwrap_err();
    assert!(matches!(err, nanotune_core::NanoTuneError::EmptyBatch(_)));
    assert_eq!(trainer.global_step(), 0);
}

/// Periodic checkpoints land in the sink during a run and restore
/// element-wise into a compatible adapter set.
#[test]
fn checkpoints_written_during_run() {
    let tmp = tempfile::tempdir().unwrap();
    let model = tiny_model(4, 29);
    let mut train_cfg = train_config(2, 1);
    train_cfg.checkpoint_interval = 1;
    let mut trainer = Trainer::new(
        model,
        &lora_config(4),
        optimizer_config(),
        train_cfg,
        CheckpointConfig::default(),
    )
    .unwrap()
    .with_checkpoint_sink(Box::new(DirectoryCheckpointSink::new(tmp.path())));

    let data_cfg = DataConfig {
        batch_size: 1,
        seq_length: 5,
        vocab_size: 256,
        shuffle: false,
        num_workers: 1,
    };
    let mut source = SyntheticDataSource::new(data_cfg, 4, 5).unwrap();
    trainer.run(&mut source).unwrap();

    let bin = tmp.path().join("step_000002").join("adapters.bin");
    assert!(bin.exists());

    // Restore into the live set and confirm the artifact matches it.
    let saved: Vec<f32> = trainer
        .adapters()
        .get("layer0.out-proj")
        .unwrap()
        .b
        .data_f32()
        .unwrap()
        .to_vec();
    let mut file = std::fs::File::open(bin).unwrap();
    nanotune_train::load_adapters(&mut file, trainer.adapters_mut()).unwrap();
    let restored: Vec<f32> = trainer
        .adapters()
        .get("layer0.out-proj")
        .unwrap()
        .b
        .data_f32()
        .unwrap()
        .to_vec();
    assert_eq!(saved, restored);
}
