//! Learning-rate schedules stepped once per training iteration.

use std::f32::consts::PI;
use std::fmt;

use crate::constants::training;
use crate::error::{FlowError, Result};
use crate::registry::{builder_for, Configurable, Registries, Registry};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
	pub step: u64,
	pub base_lr: f32,
	pub total_steps: usize,
}

pub trait LrScheduler: Send + fmt::Debug {
	/// Fixes the optimizer's starting learning rate and the planned number of
	/// iterations. Must be called before the first `step`.
	fn bind(&mut self, base_lr: f32, total_steps: usize) -> Result<()>;

	fn step(&mut self);

	/// Learning rate for the current step.
	fn lr(&self) -> f32;

	fn state(&self) -> SchedulerState;

	fn load_state(&mut self, state: &SchedulerState) -> Result<()>;

	fn clone_box(&self) -> Box<dyn LrScheduler>;
}

impl Clone for Box<dyn LrScheduler> {
	fn clone(&self) -> Self {
		self.clone_box()
	}
}

pub fn register(registry: &mut Registry<Box<dyn LrScheduler>>) -> Result<()> {
	registry.register("StepLR", builder_for(|s: StepLR| Box::new(s) as Box<dyn LrScheduler>))?;
	registry.register(
		"CosineAnnealingLR",
		builder_for(|s: CosineAnnealingLR| Box::new(s) as Box<dyn LrScheduler>),
	)?;
	registry.register(
		"OneCycleLR",
		builder_for(|s: OneCycleLR| Box::new(s) as Box<dyn LrScheduler>),
	)?;
	Ok(())
}

fn cosine(start: f32, end: f32, pct: f32) -> f32 {
	end + (start - end) / 2.0 * ((PI * pct).cos() + 1.0)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StepLRArgs {
	pub step_size: usize,
	pub gamma: f32,
}

impl Default for StepLRArgs {
	fn default() -> Self {
		Self {
			step_size: training::DEFAULT_STEP_SIZE,
			gamma: training::DEFAULT_STEP_GAMMA,
		}
	}
}

/// Multiplies the rate by `gamma` every `step_size` iterations.
#[derive(Debug, Clone)]
pub struct StepLR {
	args: StepLRArgs,
	state: SchedulerState,
}

impl StepLR {
	pub fn new(args: StepLRArgs) -> Result<Self> {
		if args.step_size == 0 {
			return Err(FlowError::InvalidParameter("StepLR step_size must be greater than 0".into()));
		}
		Ok(StepLR {
			args,
			state: SchedulerState::default(),
		})
	}
}

impl Configurable for StepLR {
	type Args = StepLRArgs;

	fn from_args(args: Self::Args, _registries: &Registries) -> Result<Self> {
		Self::new(args)
	}
}

impl LrScheduler for StepLR {
	fn bind(&mut self, base_lr: f32, total_steps: usize) -> Result<()> {
		self.state = SchedulerState {
			step: 0,
			base_lr,
			total_steps,
		};
		Ok(())
	}

	fn step(&mut self) {
		self.state.step += 1;
	}

	fn lr(&self) -> f32 {
		let decays = self.state.step / self.args.step_size as u64;
		self.state.base_lr * self.args.gamma.powi(decays as i32)
	}

	fn state(&self) -> SchedulerState {
		self.state
	}

	fn load_state(&mut self, state: &SchedulerState) -> Result<()> {
		self.state = *state;
		Ok(())
	}

	fn clone_box(&self) -> Box<dyn LrScheduler> {
		Box::new(self.clone())
	}
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CosineAnnealingLRArgs {
	/// Half period in iterations; the planned run length when unset.
	pub t_max: Option<usize>,
	pub eta_min: f32,
}

#[derive(Debug, Clone)]
pub struct CosineAnnealingLR {
	args: CosineAnnealingLRArgs,
	state: SchedulerState,
}

impl CosineAnnealingLR {
	pub fn new(args: CosineAnnealingLRArgs) -> Result<Self> {
		if args.t_max == Some(0) {
			return Err(FlowError::InvalidParameter("CosineAnnealingLR t_max must be greater than 0".into()));
		}
		Ok(CosineAnnealingLR {
			args,
			state: SchedulerState::default(),
		})
	}

	fn t_max(&self) -> usize {
		self.args.t_max.unwrap_or(self.state.total_steps).max(1)
	}
}

impl Configurable for CosineAnnealingLR {
	type Args = CosineAnnealingLRArgs;

	fn from_args(args: Self::Args, _registries: &Registries) -> Result<Self> {
		Self::new(args)
	}
}

impl LrScheduler for CosineAnnealingLR {
	fn bind(&mut self, base_lr: f32, total_steps: usize) -> Result<()> {
		if self.args.t_max.is_none() && total_steps == 0 {
			return Err(FlowError::InvalidParameter(
				"CosineAnnealingLR needs t_max when the run length is unknown".into(),
			));
		}
		self.state = SchedulerState {
			step: 0,
			base_lr,
			total_steps,
		};
		Ok(())
	}

	fn step(&mut self) {
		self.state.step += 1;
	}

	fn lr(&self) -> f32 {
		let t_max = self.t_max() as f32;
		let t = (self.state.step as f32).min(t_max);
		cosine(self.state.base_lr, self.args.eta_min, t / t_max)
	}

	fn state(&self) -> SchedulerState {
		self.state
	}

	fn load_state(&mut self, state: &SchedulerState) -> Result<()> {
		self.state = *state;
		Ok(())
	}

	fn clone_box(&self) -> Box<dyn LrScheduler> {
		Box::new(self.clone())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnealStrategy {
	Cos,
	Linear,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OneCycleLRArgs {
	/// Peak rate; the optimizer's rate when unset.
	pub max_lr: Option<f32>,
	pub pct_start: f32,
	pub div_factor: f32,
	pub final_div_factor: f32,
	pub anneal_strategy: AnnealStrategy,
}

impl Default for OneCycleLRArgs {
	fn default() -> Self {
		Self {
			max_lr: None,
			pct_start: 0.3,
			div_factor: 25.0,
			final_div_factor: 1e4,
			anneal_strategy: AnnealStrategy::Cos,
		}
	}
}

/// Warms up from `max_lr / div_factor` to `max_lr` over the first
/// `pct_start` of the run, then anneals to `initial / final_div_factor`.
#[derive(Debug, Clone)]
pub struct OneCycleLR {
	args: OneCycleLRArgs,
	state: SchedulerState,
}

impl OneCycleLR {
	pub fn new(args: OneCycleLRArgs) -> Result<Self> {
		if !(0.0..=1.0).contains(&args.pct_start) {
			return Err(FlowError::InvalidParameter(format!(
				"OneCycleLR pct_start ({}) must lie in [0, 1]",
				args.pct_start
			)));
		}
		if args.div_factor <= 0.0 || args.final_div_factor <= 0.0 {
			return Err(FlowError::InvalidParameter("OneCycleLR divisors must be positive".into()));
		}
		Ok(OneCycleLR {
			args,
			state: SchedulerState::default(),
		})
	}

	fn anneal(&self, start: f32, end: f32, pct: f32) -> f32 {
		match self.args.anneal_strategy {
			AnnealStrategy::Cos => cosine(start, end, pct),
			AnnealStrategy::Linear => start + (end - start) * pct,
		}
	}
}

impl Configurable for OneCycleLR {
	type Args = OneCycleLRArgs;

	fn from_args(args: Self::Args, _registries: &Registries) -> Result<Self> {
		Self::new(args)
	}
}

impl LrScheduler for OneCycleLR {
	fn bind(&mut self, base_lr: f32, total_steps: usize) -> Result<()> {
		if total_steps == 0 {
			return Err(FlowError::InvalidParameter("OneCycleLR needs a known, non-zero run length".into()));
		}
		self.state = SchedulerState {
			step: 0,
			base_lr,
			total_steps,
		};
		Ok(())
	}

	fn step(&mut self) {
		self.state.step += 1;
	}

	fn lr(&self) -> f32 {
		let max_lr = self.args.max_lr.unwrap_or(self.state.base_lr);
		let initial = max_lr / self.args.div_factor;
		let min_lr = initial / self.args.final_div_factor;

		let last = self.state.total_steps.saturating_sub(1) as f32;
		let warm_end = (self.args.pct_start * self.state.total_steps as f32 - 1.0).max(0.0);
		let step = (self.state.step as f32).min(last);
		if step <= warm_end && warm_end > 0.0 {
			self.anneal(initial, max_lr, step / warm_end)
		} else {
			let span = (last - warm_end).max(1.0);
			self.anneal(max_lr, min_lr, ((step - warm_end) / span).clamp(0.0, 1.0))
		}
	}

	fn state(&self) -> SchedulerState {
		self.state
	}

	fn load_state(&mut self, state: &SchedulerState) -> Result<()> {
		if state.total_steps == 0 {
			return Err(FlowError::Serialization("OneCycleLR state has no run length".into()));
		}
		self.state = *state;
		Ok(())
	}

	fn clone_box(&self) -> Box<dyn LrScheduler> {
		Box::new(self.clone())
	}
}
