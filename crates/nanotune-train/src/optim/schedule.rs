//! Learning-rate schedules.

/// Resolves the learning rate for a given optimizer step.
pub trait LrSchedule: Send {
    fn get(&self, step: usize) -> f64;
}

/// Cosine annealing with linear warmup:
/// - warmup phase: base_lr · step / warmup
/// - cosine phase: min_lr + (base_lr − min_lr) · 0.5 · (1 + cos(π · progress))
#[derive(Debug, Clone)]
pub struct CosineWithWarmup {
    pub base_lr: f64,
    pub min_lr: f64,
    pub warmup_steps: usize,
    pub total_steps: usize,
}

impl CosineWithWarmup {
    pub fn new(base_lr: f64, min_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            min_lr,
            warmup_steps,
            total_steps,
        }
    }
}

impl LrSchedule for CosineWithWarmup {
    fn get(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps.max(1) as f64;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let progress = ((step - self.warmup_steps) as f64 / decay_steps as f64).min(1.0);
        self.min_lr
            + (self.base_lr - self.min_lr) * 0.5 * (1.0 + (std::f64::consts::PI * progress).cos())
    }
}

/// Constant learning rate, for benchmarks and tests.
#[derive(Debug, Clone)]
pub struct ConstantLr(pub f64);

impl LrSchedule for ConstantLr {
    fn get(&self, _step: usize) -> f64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_phase_is_linear() {
        let s = CosineWithWarmup::new(1e-3, 1e-4, 100, 1000);
        assert!((s.get(0) - 0.0).abs() < 1e-12);
        assert!((s.get(50) - 5e-4).abs() < 1e-12);
        assert!((s.get(99) - 9.9e-4).abs() < 1e-12);
    }

    #[test]
    fn test_peak_at_warmup_end() {
        let s = CosineWithWarmup::new(1e-3, 1e-4, 100, 1000);
        assert!((s.get(100) - 1e-3).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_midpoint_and_floor() {
        let s = CosineWithWarmup::new(1e-3, 1e-4, 100, 1000);
        // Midpoint of the cosine phase: halfway between base and min.
        let mid = s.get(550);
        assert!((mid - 5.5e-4).abs() < 1e-9, "mid {}", mid);
        // End of schedule reaches the floor and stays there.
        assert!((s.get(1000) - 1e-4).abs() < 1e-12);
        assert!((s.get(2000) - 1e-4).abs() < 1e-12);
    }

    #[test]
    fn test_constant_schedule() {
        let s = ConstantLr(3e-4);
        assert_eq!(s.get(0), 3e-4);
        assert_eq!(s.get(10_000), 3e-4);
    }
}
