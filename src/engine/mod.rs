//! Optimization, devices, checkpoints and the training loop.

pub mod checkpoint;
pub mod device;
pub mod eval;
pub mod optim;
pub mod scaler;
pub mod scheduler;
pub mod strategy;
pub mod trainer;

pub use self::device::{Device, DeviceProvider, DeviceSpec, EnvDeviceProvider, FixedDeviceProvider};
pub use self::eval::{eval_model, eval_model_with, EvalReport};
pub use self::optim::{clip_grad_norm, Optimizer, OptimizerState};
pub use self::scaler::GradScaler;
pub use self::scheduler::LrScheduler;
pub use self::strategy::{Distributed, ExecutionStrategy, Placement, ProcessGroup, SingleDevice};
pub use self::trainer::{Phase, Trainer, TrainingReport};
