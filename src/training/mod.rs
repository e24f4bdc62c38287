/// Training infrastructure: trainer, optimizer, EMA, schedules and persistence
pub mod checkpoint;
pub mod ema;
pub mod history;
pub mod optimizer;
pub mod scheduler;
pub mod telemetry;
pub mod timer;
pub mod trainer;

pub use checkpoint::Checkpoint;
pub use ema::{EMAConfig, EMA};
pub use history::{EpochRecord, History};
pub use optimizer::{Adam, AdamConfig, OptimizerState};
pub use scheduler::{build_scheduler, ConstantLr, CosineScheduler, LrScheduler, StepLr};
pub use telemetry::{JsonlScalarWriter, LogSink, NullSink, ScalarSink};
pub use timer::Timer;
pub use trainer::{Trainer, TrainerBuilder};
