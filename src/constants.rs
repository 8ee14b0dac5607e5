pub mod training {
	pub const DEFAULT_EPOCHS: usize = 10;
	pub const DEFAULT_LEARNING_RATE: f32 = 1e-4;
	pub const DEFAULT_BATCH_SIZE: usize = 4;
	pub const DEFAULT_NUM_WORKERS: usize = 2;
	pub const DEFAULT_VALIDATE_INTERVAL: usize = 1;
	pub const DEFAULT_CKPT_INTERVAL: usize = 1;
	pub const DEFAULT_LOG_ITERATIONS_INTERVAL: usize = 100;
	pub const DEFAULT_GRAD_CLIP: f32 = 1.0;
	pub const DEFAULT_TARGET_SCALE_FACTOR: f32 = 1.0;
	pub const ADAM_BETA1: f32 = 0.9;
	pub const ADAM_BETA2: f32 = 0.999;
	pub const ADAM_EPSILON: f32 = 1e-8;
	pub const ADAMW_WEIGHT_DECAY: f32 = 0.01;
	pub const DEFAULT_STEP_SIZE: usize = 10;
	pub const DEFAULT_STEP_GAMMA: f32 = 0.1;
}

pub mod scaler {
	pub const INIT_SCALE: f32 = 65536.0;
	pub const GROWTH_FACTOR: f32 = 2.0;
	pub const BACKOFF_FACTOR: f32 = 0.5;
	pub const GROWTH_INTERVAL: usize = 2000;
}

pub mod loss {
	pub const SEQUENCE_GAMMA: f32 = 0.8;
	pub const MAX_FLOW: f32 = 400.0;
	pub const VALID_THRESHOLD: f32 = 0.5;
	pub const EPE_EPSILON: f32 = 1e-8;
	pub const FLOW_OFFSET_GAMMA: f32 = 0.25;
	pub const DEFAULT_ANNEAL_MAX_ITER: usize = 100_000;
	/// FlowNet weights, finest scale first.
	pub const MULTISCALE_WEIGHTS: [f32; 5] = [0.005, 0.01, 0.02, 0.08, 0.32];
}

pub mod model {
	pub const LEAKY_SLOPE: f32 = 0.1;
	pub const NORM_EPSILON: f32 = 1e-5;
	pub const NORM_MOMENTUM: f32 = 0.1;
	pub const GROUP_NORM_GROUPS: usize = 8;
	pub const MAX_DISPLACEMENT: usize = 4;
	pub const REDIRECT_CHANNELS: usize = 32;
}

pub mod data {
	pub const DENSE_FLOW_LIMIT: f32 = 1000.0;
	pub const KITTI_FLOW_OFFSET: f32 = 32768.0;
	pub const KITTI_FLOW_SCALE: f32 = 64.0;
	pub const FLO_MAGIC: f32 = 202_021.25;
	pub const PREFETCH_BATCHES_PER_WORKER: usize = 2;
	pub const NORM_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
	pub const NORM_STD: [f32; 3] = [0.229, 0.224, 0.225];
	pub const DEFAULT_CROP_SIZE: [usize; 2] = [256, 256];
}

pub mod file {
	pub const CHECKPOINT_EXTENSION: &str = ".pth";
	pub const SCALARS_FILE: &str = "scalars.jsonl";
	pub const LOG_FILE: &str = "flowforge.log";
}

pub mod env {
	pub const MASTER_ADDR: &str = "MASTER_ADDR";
	pub const MASTER_PORT: &str = "MASTER_PORT";
	pub const VISIBLE_DEVICES: &str = "FLOWFORGE_VISIBLE_DEVICES";
}
