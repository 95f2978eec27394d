//! Command-line driver for nanotune.
//!
//! Provides subcommands:
//! - info: model/memory report
//! - benchmark-optimizer: time the optimizer kernel variants
//! - train: run the fine-tuning loop
//! - test-forward: run one forward pass
//!
//! Exit codes: 0 success, 1 initialization failure, 2 training failure,
//! 3 cancelled.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nanotune_core::{AppConfig, DataConfig};
use nanotune_model::{CpuExpertKernel, CpuScanKernel, NoHooks, QuantizedModel};
use nanotune_tensor::{format_bytes, MemoryAccountant, MemoryCategory, Tensor};
use nanotune_train::{
    cross_entropy, AdamW, DataSource, DirectoryCheckpointSink, GradientAccumulator,
    MemorySampler, SyntheticDataSource, TokenFileDataSource, TrainOutcome, Trainer,
};

#[derive(Parser)]
#[command(name = "nanotune")]
#[command(about = "Memory-constrained LoRA fine-tuning for a quantized hybrid model", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a TOML configuration file (defaults when omitted).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the quantized-model footprint and memory accountant report.
    Info,

    /// Time the optimizer over a fixed-shape tensor.
    BenchmarkOptimizer {
        /// Number of optimizer iterations per variant.
        #[arg(short = 'n', long, default_value = "100")]
        iterations: usize,

        /// Elements in the benchmark tensor.
        #[arg(short, long, default_value = "65536")]
        elements: usize,
    },

    /// Run the training loop.
    Train,

    /// Run a single forward pass on a synthetic batch.
    TestForward,
}

fn load_config(path: &Option<PathBuf>) -> anyhow::Result<AppConfig> {
    match path {
        Some(p) => Ok(AppConfig::from_file(p)?),
        None => Ok(AppConfig::default()),
    }
}

fn build_model(config: &AppConfig, accountant: Arc<MemoryAccountant>) -> anyhow::Result<QuantizedModel> {
    let model = QuantizedModel::new_random(config.model.clone(), config.train.seed, accountant)?
        .with_scan_kernel(Arc::new(CpuScanKernel))
        .with_expert_kernel(Arc::new(CpuExpertKernel));
    Ok(model)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    nanotune_train::logging::init_console_logging();

    let config = match load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Initialization failed: {}", e);
            return ExitCode::from(1);
        }
    };

    match cli.command {
        Commands::Info => match run_info(&config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Initialization failed: {}", e);
                ExitCode::from(1)
            }
        },
        Commands::BenchmarkOptimizer { iterations, elements } => {
            match run_benchmark(iterations, elements) {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("Benchmark failed: {}", e);
                    ExitCode::from(1)
                }
            }
        }
        Commands::Train => match run_train(&config) {
            Ok(TrainOutcome::Completed) => ExitCode::SUCCESS,
            Ok(TrainOutcome::Cancelled) => ExitCode::from(3),
            Err(StageError::Init(e)) => {
                eprintln!("Initialization failed: {}", e);
                ExitCode::from(1)
            }
            Err(StageError::Train(e)) => {
                eprintln!("Training failed: {}", e);
                ExitCode::from(2)
            }
        },
        Commands::TestForward => match run_test_forward(&config) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("Forward pass failed: {}", e);
                ExitCode::from(1)
            }
        },
    }
}

fn run_info(config: &AppConfig) -> anyhow::Result<()> {
    let accountant = Arc::new(MemoryAccountant::new());
    println!("Building quantized model (random weights)...");
    let start = Instant::now();
    let model = build_model(config, Arc::clone(&accountant))?;
    println!("  built in {:.2}s", start.elapsed().as_secs_f32());

    let params = model.named_params();
    let total_elems: usize = params.iter().map(|(_, q)| q.num_elements()).sum();
    println!(
        "Model: d_model={}, layers={}, vocab={}",
        model.config.d_model, model.config.num_layers, model.config.vocab_size
    );
    println!("  quantized tensors: {}", params.len());
    println!("  logical weights:   {}", total_elems);
    println!(
        "  NF4 footprint:     {} (f32 would be {})",
        format_bytes(model.quantized_bytes() as u64),
        format_bytes(4 * total_elems as u64)
    );

    let report = accountant.report(start.elapsed());
    println!("Memory accountant ({:.2}s window):", report.window_secs);
    for cat in MemoryCategory::ALL {
        let c = report.snapshot.category(cat);
        println!(
            "  {:<17} current {:>10}  peak {:>10}",
            cat.name(),
            format_bytes(c.current),
            format_bytes(c.peak)
        );
    }
    println!(
        "  {:<17} current {:>10}  peak {:>10}",
        "total",
        format_bytes(report.snapshot.total_current),
        format_bytes(report.snapshot.total_peak)
    );
    Ok(())
}

fn run_benchmark(iterations: usize, elements: usize) -> anyhow::Result<()> {
    println!(
        "Optimizer benchmark: {} elements, {} iterations per variant",
        elements, iterations
    );
    let accountant = Arc::new(MemoryAccountant::new());

    for (label, use_kernels) in [("host-f32", false), ("f16-kernels", true)] {
        let mut p = Tensor::zeros(&[elements], MemoryCategory::ModelWeights, &accountant)?;
        let g = Tensor::ones(&[elements], MemoryCategory::Gradients, &accountant)?;
        let mut grads = GradientAccumulator::new();
        grads.add("bench", &g)?;

        let mut opt = AdamW::new(Default::default())?;
        if use_kernels {
            opt = opt.with_f16_kernels();
        }

        let start = Instant::now();
        for _ in 0..iterations {
            opt.step(1e-3, vec![("bench".to_string(), &mut p)], &grads)?;
        }
        let elapsed = start.elapsed();
        println!(
            "  {:<12} {:>8.1} ms total, {:>8.2} us/iter, state {}",
            label,
            elapsed.as_secs_f64() * 1e3,
            elapsed.as_secs_f64() * 1e6 / iterations as f64,
            format_bytes(opt.state_bytes()),
        );
    }
    Ok(())
}

enum StageError {
    Init(anyhow::Error),
    Train(anyhow::Error),
}

fn run_train(config: &AppConfig) -> Result<TrainOutcome, StageError> {
    let accountant = Arc::new(MemoryAccountant::new());
    let model = build_model(config, Arc::clone(&accountant)).map_err(StageError::Init)?;

    let mut trainer = Trainer::new(
        model,
        &config.lora,
        config.optimizer.clone(),
        config.train.clone(),
        config.checkpoint.clone(),
    )
    .map_err(|e| StageError::Init(e.into()))?
    .with_checkpoint_sink(Box::new(DirectoryCheckpointSink::new(&config.checkpoint_dir)));

    println!(
        "Training {} adapters ({} trainable params) for {} steps",
        trainer.adapters().len(),
        trainer.adapters().total_params(),
        config.train.total_steps
    );

    let sampler = MemorySampler::start(Arc::clone(&accountant), Duration::from_secs(5));

    let data_config = config.data.clone();
    let outcome = if std::path::Path::new(&config.data_path).exists() {
        let mut source =
            TokenFileDataSource::from_binary_file(&config.data_path, data_config, config.train.seed)
                .map_err(|e| StageError::Init(e.into()))?;
        trainer.run(&mut source)
    } else {
        println!(
            "data file '{}' not found; using the synthetic source",
            config.data_path
        );
        let mut source = SyntheticDataSource::new(data_config, usize::MAX, config.train.seed)
            .map_err(|e| StageError::Init(e.into()))?;
        trainer.run(&mut source)
    }
    .map_err(|e| StageError::Train(e.into()))?;

    sampler.stop();
    println!(
        "Run finished after {} optimizer steps ({:?})",
        trainer.global_step(),
        outcome
    );
    Ok(outcome)
}

fn run_test_forward(config: &AppConfig) -> anyhow::Result<()> {
    let accountant = Arc::new(MemoryAccountant::new());
    let model = build_model(config, Arc::clone(&accountant))?;

    let data_config = DataConfig {
        batch_size: 1,
        seq_length: config.data.seq_length.min(16),
        vocab_size: config.model.vocab_size,
        shuffle: false,
        num_workers: 1,
    };
    let mut source = SyntheticDataSource::new(data_config, 1, config.train.seed)?;
    let batch = source.next_batch().expect("one synthetic batch");

    let start = Instant::now();
    let (logits, aux) = model.forward(
        &batch.input_ids,
        batch.batch_size,
        batch.seq_len,
        &mut NoHooks,
    )?;
    let loss = cross_entropy(&logits, &batch.target_ids)?;
    println!(
        "Forward OK in {:.1} ms: loss={:.4}, accuracy={:.3}, aux={:.6}",
        start.elapsed().as_secs_f64() * 1e3,
        loss.loss,
        loss.accuracy,
        aux
    );

    let snap = accountant.snapshot();
    println!(
        "Peak memory: {} (current {})",
        format_bytes(snap.total_peak),
        format_bytes(snap.total_current)
    );
    Ok(())
}
