use std::env;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::constants::{env as env_keys, training};
use crate::error::{FlowError, Result};

/// A read-only node of a configuration tree.
///
/// Components never see the raw tree; they map a node onto their own `Args`
/// struct through [`CfgNode::args`], which rejects unknown keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CfgNode(toml::Value);

impl Default for CfgNode {
	fn default() -> Self {
		CfgNode::empty()
	}
}

impl CfgNode {
	pub fn new(value: toml::Value) -> Self {
		CfgNode(value)
	}

	pub fn empty() -> Self {
		CfgNode(toml::Value::Table(toml::value::Table::new()))
	}

	pub fn parse(text: &str) -> Result<Self> {
		let value: toml::Value = toml::from_str(text)?;
		Ok(CfgNode(value))
	}

	pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
		toml::Value::try_from(value)
			.map(CfgNode)
			.map_err(|e| FlowError::Config(e.to_string()))
	}

	pub fn value(&self) -> &toml::Value {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		match &self.0 {
			toml::Value::Table(table) => table.is_empty(),
			_ => false,
		}
	}

	pub fn contains(&self, key: &str) -> bool {
		self.0.get(key).is_some()
	}

	pub fn child(&self, key: &str) -> Option<CfgNode> {
		self.0.get(key).cloned().map(CfgNode)
	}

	/// Like `child` but missing keys are configuration errors.
	pub fn require(&self, key: &str) -> Result<CfgNode> {
		self.child(key)
			.ok_or_else(|| FlowError::Config(format!("missing required key '{}'", key)))
	}

	pub fn get_str(&self, key: &str) -> Option<&str> {
		self.0.get(key).and_then(|v| v.as_str())
	}

	/// The `name` entry used to look a component up in a registry.
	pub fn name(&self) -> Result<&str> {
		self.get_str("name")
			.ok_or_else(|| FlowError::Config("component node has no 'name' entry".into()))
	}

	/// This node with its `name` entry removed, ready to deserialize into `Args`.
	pub fn args(&self) -> CfgNode {
		match &self.0 {
			toml::Value::Table(table) => {
				let mut table = table.clone();
				table.remove("name");
				CfgNode(toml::Value::Table(table))
			}
			other => CfgNode(other.clone()),
		}
	}

	pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
		self.0
			.clone()
			.try_into()
			.map_err(|e: toml::de::Error| FlowError::Config(e.to_string()))
	}

	/// Returns a copy with `key` set; used to assemble nodes in code.
	pub fn with(mut self, key: &str, value: impl Into<toml::Value>) -> Self {
		if !self.0.is_table() {
			self.0 = toml::Value::Table(toml::value::Table::new());
		}
		if let toml::Value::Table(table) = &mut self.0 {
			table.insert(key.to_string(), value.into());
		}
		self
	}

	pub fn with_node(self, key: &str, node: CfgNode) -> Self {
		self.with(key, node.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidateOn {
	Loss,
	Metric,
}

/// A component picked by name together with its parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComponentSection {
	pub name: String,
	pub params: CfgNode,
}

impl ComponentSection {
	pub fn named(name: &str) -> Self {
		Self {
			name: name.to_string(),
			params: CfgNode::empty(),
		}
	}
}

impl Default for ComponentSection {
	fn default() -> Self {
		ComponentSection::named("SequenceLoss")
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizerSection {
	pub name: String,
	pub lr: f32,
	pub params: CfgNode,
}

impl Default for OptimizerSection {
	fn default() -> Self {
		Self {
			name: "Adam".to_string(),
			lr: training::DEFAULT_LEARNING_RATE,
			params: CfgNode::empty(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerSection {
	#[serde(rename = "use")]
	pub enabled: bool,
	pub name: String,
	pub params: CfgNode,
}

impl Default for SchedulerSection {
	fn default() -> Self {
		Self {
			enabled: false,
			name: "StepLR".to_string(),
			params: CfgNode::empty(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GradClipSection {
	#[serde(rename = "use")]
	pub enabled: bool,
	pub value: f32,
}

impl Default for GradClipSection {
	fn default() -> Self {
		Self {
			enabled: false,
			value: training::DEFAULT_GRAD_CLIP,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DataSection {
	/// Ground-truth flow is divided by this before the loss.
	pub target_scale_factor: f32,
	pub batch_size: usize,
	pub num_workers: usize,
	pub shuffle: bool,
	pub drop_last: bool,
	pub train_datasets: Vec<CfgNode>,
	pub val_datasets: Vec<CfgNode>,
}

impl Default for DataSection {
	fn default() -> Self {
		Self {
			target_scale_factor: training::DEFAULT_TARGET_SCALE_FACTOR,
			batch_size: training::DEFAULT_BATCH_SIZE,
			num_workers: training::DEFAULT_NUM_WORKERS,
			shuffle: true,
			drop_last: true,
			train_datasets: Vec::new(),
			val_datasets: Vec::new(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DistributedSection {
	#[serde(rename = "use")]
	pub enabled: bool,
	pub backend: String,
	pub master_addr: String,
	pub master_port: u16,
	/// Defaults to the number of selected devices.
	pub world_size: Option<usize>,
	/// Average BatchNorm running statistics across ranks after every step.
	pub sync_batch_norm: bool,
}

impl Default for DistributedSection {
	fn default() -> Self {
		Self {
			enabled: false,
			backend: "threads".to_string(),
			master_addr: "127.0.0.1".to_string(),
			master_port: 12355,
			world_size: None,
			sync_batch_norm: false,
		}
	}
}

impl DistributedSection {
	/// `MASTER_ADDR` and `MASTER_PORT` take precedence over the file.
	pub fn apply_env_overrides(&mut self) -> Result<()> {
		if let Ok(addr) = env::var(env_keys::MASTER_ADDR) {
			self.master_addr = addr;
		}
		if let Ok(port) = env::var(env_keys::MASTER_PORT) {
			self.master_port = port.parse().map_err(|_| {
				FlowError::Config(format!("{} must be a port number, got '{}'", env_keys::MASTER_PORT, port))
			})?;
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainerConfig {
	/// "cpu", "-1", a device id, a comma separated id list, or "all".
	pub device: String,
	pub mixed_precision: bool,
	pub epochs: usize,
	/// Switches the trainer to the step loop when set.
	pub num_steps: Option<usize>,
	pub seed: u64,
	pub validate_interval: usize,
	pub ckpt_interval: usize,
	pub log_iterations_interval: usize,
	pub ckpt_dir: PathBuf,
	pub log_dir: PathBuf,
	pub validate_on: ValidateOn,
	pub criterion: ComponentSection,
	pub optimizer: OptimizerSection,
	pub scheduler: SchedulerSection,
	pub grad_clip: GradClipSection,
	pub data: DataSection,
	pub distributed: DistributedSection,
	pub model: CfgNode,
}

impl Default for TrainerConfig {
	fn default() -> Self {
		Self {
			device: "cpu".to_string(),
			mixed_precision: false,
			epochs: training::DEFAULT_EPOCHS,
			num_steps: None,
			seed: 0,
			validate_interval: training::DEFAULT_VALIDATE_INTERVAL,
			ckpt_interval: training::DEFAULT_CKPT_INTERVAL,
			log_iterations_interval: training::DEFAULT_LOG_ITERATIONS_INTERVAL,
			ckpt_dir: PathBuf::from("./ckpts"),
			log_dir: PathBuf::from("./logs"),
			validate_on: ValidateOn::Loss,
			criterion: ComponentSection::default(),
			optimizer: OptimizerSection::default(),
			scheduler: SchedulerSection::default(),
			grad_clip: GradClipSection::default(),
			data: DataSection::default(),
			distributed: DistributedSection::default(),
			model: CfgNode::empty(),
		}
	}
}

impl TrainerConfig {
	pub fn builder() -> TrainerConfigBuilder {
		TrainerConfigBuilder::default()
	}

	pub fn validate(&self) -> Result<()> {
		if self.num_steps.is_none() && self.epochs == 0 {
			return Err(FlowError::InvalidParameter(
				"Either epochs must be greater than 0 or num_steps must be set".into(),
			));
		}
		if self.num_steps == Some(0) {
			return Err(FlowError::InvalidParameter("num_steps must be greater than 0".into()));
		}
		if self.validate_interval == 0 {
			return Err(FlowError::InvalidParameter("validate_interval must be greater than 0".into()));
		}
		if self.ckpt_interval == 0 {
			return Err(FlowError::InvalidParameter("ckpt_interval must be greater than 0".into()));
		}
		if self.log_iterations_interval == 0 {
			return Err(FlowError::InvalidParameter(
				"log_iterations_interval must be greater than 0".into(),
			));
		}
		if !(self.optimizer.lr >= 0.0) {
			return Err(FlowError::InvalidParameter(format!(
				"Learning rate ({}) must not be negative",
				self.optimizer.lr
			)));
		}
		if self.data.batch_size == 0 {
			return Err(FlowError::InvalidParameter("Batch size must be greater than 0".into()));
		}
		if !(self.data.target_scale_factor > 0.0) {
			return Err(FlowError::InvalidParameter(format!(
				"target_scale_factor ({}) must be greater than 0",
				self.data.target_scale_factor
			)));
		}
		if self.grad_clip.enabled && !(self.grad_clip.value > 0.0) {
			return Err(FlowError::InvalidParameter("grad_clip.value must be greater than 0".into()));
		}
		Ok(())
	}
}

#[derive(Default)]
pub struct TrainerConfigBuilder {
	config: TrainerConfig,
}

impl TrainerConfigBuilder {
	pub fn device(mut self, device: &str) -> Self {
		self.config.device = device.to_string();
		self
	}

	pub fn epochs(mut self, epochs: usize) -> Self {
		self.config.epochs = epochs;
		self
	}

	pub fn num_steps(mut self, steps: usize) -> Self {
		self.config.num_steps = Some(steps);
		self
	}

	pub fn learning_rate(mut self, lr: f32) -> Self {
		self.config.optimizer.lr = lr;
		self
	}

	pub fn optimizer(mut self, name: &str) -> Self {
		self.config.optimizer.name = name.to_string();
		self
	}

	pub fn criterion(mut self, name: &str, params: CfgNode) -> Self {
		self.config.criterion = ComponentSection {
			name: name.to_string(),
			params,
		};
		self
	}

	pub fn batch_size(mut self, size: usize) -> Self {
		self.config.data.batch_size = size;
		self
	}

	pub fn num_workers(mut self, workers: usize) -> Self {
		self.config.data.num_workers = workers;
		self
	}

	pub fn shuffle(mut self, shuffle: bool) -> Self {
		self.config.data.shuffle = shuffle;
		self
	}

	pub fn validate_on(mut self, on: ValidateOn) -> Self {
		self.config.validate_on = on;
		self
	}

	pub fn intervals(mut self, validate: usize, ckpt: usize, log: usize) -> Self {
		self.config.validate_interval = validate;
		self.config.ckpt_interval = ckpt;
		self.config.log_iterations_interval = log;
		self
	}

	pub fn dirs(mut self, ckpt_dir: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
		self.config.ckpt_dir = ckpt_dir.into();
		self.config.log_dir = log_dir.into();
		self
	}

	pub fn mixed_precision(mut self, enabled: bool) -> Self {
		self.config.mixed_precision = enabled;
		self
	}

	pub fn grad_clip(mut self, value: f32) -> Self {
		self.config.grad_clip = GradClipSection { enabled: true, value };
		self
	}

	pub fn model(mut self, model: CfgNode) -> Self {
		self.config.model = model;
		self
	}

	pub fn seed(mut self, seed: u64) -> Self {
		self.config.seed = seed;
		self
	}

	pub fn build(self) -> TrainerConfig {
		self.config
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn args_strips_component_name() {
		let node = CfgNode::empty().with("name", "SequenceLoss").with("gamma", 0.5);
		let args = node.args();
		assert!(!args.contains("name"));
		assert!(args.contains("gamma"));
		assert_eq!(node.name().unwrap(), "SequenceLoss");
	}

	#[test]
	fn sections_parse_use_keyword() {
		let cfg: TrainerConfig = CfgNode::parse(
			r#"
			epochs = 3
			[scheduler]
			use = true
			name = "OneCycleLR"
			[grad_clip]
			use = true
			value = 2.5
			"#,
		)
		.unwrap()
		.deserialize()
		.unwrap();
		assert_eq!(cfg.epochs, 3);
		assert!(cfg.scheduler.enabled);
		assert_eq!(cfg.scheduler.name, "OneCycleLR");
		assert_eq!(cfg.grad_clip.value, 2.5);
	}

	#[test]
	fn unknown_keys_are_rejected() {
		let result: Result<TrainerConfig> = CfgNode::parse("epochz = 3").unwrap().deserialize();
		assert!(matches!(result, Err(FlowError::Config(_))));
	}

	#[test]
	fn validate_rejects_zero_intervals() {
		let cfg = TrainerConfig::builder().intervals(0, 1, 1).build();
		assert!(cfg.validate().is_err());
		let cfg = TrainerConfig::builder().learning_rate(0.0).build();
		assert!(cfg.validate().is_ok());
	}
}
