//! Structured logging for training with tracing.
//!
//! Provides JSON logging for production monitoring, a pretty console
//! variant for local runs, per-step metrics, and automatic warnings for
//! anomalies (non-finite loss, gradient explosion).

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nanotune_tensor::{format_bytes, MemorySnapshot};

/// Initialize structured logging.
///
/// Reads the log level from RUST_LOG (defaults to "info"). Outputs
/// JSON-formatted logs.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "info,nanotune_train=info,nanotune_model=info,nanotune_tensor=info".into()
        }))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Structured logging initialized");
}

/// Initialize simple console logging (for examples/debugging).
pub fn init_console_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,nanotune_train=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().pretty())
        .init();
}

/// Per-step training metrics.
#[derive(Debug, Clone)]
pub struct TrainingMetrics {
    /// Task loss plus the MoE auxiliary term.
    pub loss: f64,
    /// MoE load-balancing auxiliary loss.
    pub aux_loss: f64,
    pub accuracy: f64,
    pub learning_rate: f64,
    pub grad_norm: f64,
    pub tokens_per_sec: f64,
}

/// Log a training step with structured fields.
///
/// Automatically emits warnings for:
/// - Non-finite loss (divergence)
/// - High gradient norm (> 10.0): potential instability
pub fn log_training_step(step: usize, metrics: &TrainingMetrics, memory: &MemorySnapshot) {
    if !metrics.loss.is_finite() {
        error!(
            loss = metrics.loss,
            step = step,
            "Training diverged! NaN or infinite loss detected"
        );
        return;
    }

    info!(
        step = step,
        loss = metrics.loss,
        aux_loss = metrics.aux_loss,
        accuracy = metrics.accuracy,
        lr = metrics.learning_rate,
        grad_norm = metrics.grad_norm,
        tokens_per_sec = metrics.tokens_per_sec,
        mem_current = format_bytes(memory.total_current).as_str(),
        mem_peak = format_bytes(memory.total_peak).as_str(),
        "Training step completed"
    );

    if metrics.grad_norm > 10.0 {
        warn!(
            grad_norm = metrics.grad_norm,
            step = step,
            threshold = 10.0,
            "High gradient norm detected - potential instability. Consider \
             reducing the learning rate or tightening max_grad_norm"
        );
    }
}

/// Log a checkpoint save event.
pub fn log_checkpoint_save(step: usize, path: &str, loss: f64) {
    info!(
        step = step,
        path = path,
        loss = loss,
        event = "checkpoint_saved",
        "Checkpoint saved successfully"
    );
}

/// Log a recoverable step failure and how it was handled.
pub fn log_step_recovery(step: usize, error: &str, action: &str) {
    warn!(
        step = step,
        error = error,
        action = action,
        event = "step_recovered",
        "Recoverable training error"
    );
}

/// Log a memory report from the accountant.
pub fn log_memory_report(memory: &MemorySnapshot) {
    info!(
        total_current = format_bytes(memory.total_current).as_str(),
        total_peak = format_bytes(memory.total_peak).as_str(),
        model_weights = memory.by_category[0].current,
        activations = memory.by_category[1].current,
        optimizer_states = memory.by_category[2].current,
        gradients = memory.by_category[3].current,
        temporary = memory.by_category[4].current,
        event = "memory_report",
        "Memory accountant report"
    );
}
