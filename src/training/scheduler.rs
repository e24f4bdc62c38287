/// Epoch-level learning rate schedulers
use std::f64::consts::PI;

use crate::config::SchedulerConfig;

/// Learning rate schedule advanced once per epoch
pub trait LrScheduler {
    /// Advance by one epoch
    fn step(&mut self);

    /// Learning rate for the current epoch
    fn get_lr(&self) -> f64;
}

/// Build the scheduler described by `config`, starting from `base_lr`
pub fn build_scheduler(config: &SchedulerConfig, base_lr: f64) -> Box<dyn LrScheduler> {
    match *config {
        SchedulerConfig::Constant => Box::new(ConstantLr::new(base_lr)),
        SchedulerConfig::Step { step_size, gamma } => {
            Box::new(StepLr::new(base_lr, step_size, gamma))
        }
        SchedulerConfig::Cosine {
            lr_min,
            warmup_epochs,
            total_epochs,
        } => Box::new(CosineScheduler::new(CosineSchedulerConfig {
            lr_init: base_lr,
            lr_min,
            warmup_steps: warmup_epochs,
            total_steps: total_epochs,
        })),
    }
}

/// Fixed learning rate
pub struct ConstantLr {
    lr: f64,
}

impl ConstantLr {
    pub fn new(lr: f64) -> Self {
        Self { lr }
    }
}

impl LrScheduler for ConstantLr {
    fn step(&mut self) {}

    fn get_lr(&self) -> f64 {
        self.lr
    }
}

/// Decays the learning rate by `gamma` every `step_size` epochs
pub struct StepLr {
    base_lr: f64,
    step_size: usize,
    gamma: f64,
    epoch: usize,
}

impl StepLr {
    pub fn new(base_lr: f64, step_size: usize, gamma: f64) -> Self {
        Self {
            base_lr,
            step_size: step_size.max(1),
            gamma,
            epoch: 0,
        }
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

impl LrScheduler for StepLr {
    fn step(&mut self) {
        self.epoch += 1;
    }

    fn get_lr(&self) -> f64 {
        let decays = (self.epoch / self.step_size) as i32;
        self.base_lr * self.gamma.powi(decays)
    }
}

/// Cosine annealing learning rate scheduler configuration
#[derive(Debug, Clone)]
pub struct CosineSchedulerConfig {
    /// Initial learning rate
    pub lr_init: f64,
    /// Minimum learning rate (at end of schedule)
    pub lr_min: f64,
    /// Number of warmup epochs
    pub warmup_steps: usize,
    /// Total number of epochs
    pub total_steps: usize,
}

/// Cosine learning rate scheduler
///
/// - Linear warmup over warmup_steps, reaching lr_init on the last warmup step
/// - Cosine annealing from lr_init to lr_min over the remaining steps
pub struct CosineScheduler {
    config: CosineSchedulerConfig,
    current_step: usize,
}

impl CosineScheduler {
    pub fn new(config: CosineSchedulerConfig) -> Self {
        Self {
            config,
            current_step: 0,
        }
    }

    /// Learning rate at a specific step
    pub fn get_lr_at_step(&self, step: usize) -> f64 {
        let CosineSchedulerConfig {
            lr_init,
            lr_min,
            warmup_steps,
            total_steps,
        } = self.config;

        if step < warmup_steps {
            return lr_init * ((step + 1) as f64 / warmup_steps as f64);
        }
        if total_steps <= warmup_steps {
            return lr_min;
        }

        let progress = ((step - warmup_steps) as f64 / (total_steps - warmup_steps) as f64)
            .clamp(0.0, 1.0);
        let cosine_factor = 0.5 * (1.0 + (PI * progress).cos());
        lr_min + (lr_init - lr_min) * cosine_factor
    }

    pub fn get_step(&self) -> usize {
        self.current_step
    }
}

impl LrScheduler for CosineScheduler {
    fn step(&mut self) {
        self.current_step += 1;
    }

    fn get_lr(&self) -> f64 {
        self.get_lr_at_step(self.current_step)
    }
}
