//! First-order optimizers over [`Param`] lists.
//!
//! Per-parameter state is keyed by parameter name so it survives a
//! checkpoint round trip independently of parameter order.

use std::fmt;

use indexmap::IndexMap;
use ndarray::{ArrayD, Zip};

use crate::constants::training;
use crate::error::{FlowError, Result};
use crate::nn::Param;
use crate::registry::{builder_for, Configurable, Registries, Registry};

/// Serializable optimizer state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptimizerState {
	pub step: u64,
	pub lr: f32,
	pub slots: IndexMap<String, Vec<ArrayD<f32>>>,
}

pub trait Optimizer: Send + fmt::Debug {
	/// Applies one update using each trainable parameter's `grad`.
	fn step(&mut self, params: &mut [&mut Param]) -> Result<()>;

	fn lr(&self) -> f32;

	fn set_lr(&mut self, lr: f32);

	fn state(&self) -> OptimizerState;

	fn load_state(&mut self, state: &OptimizerState) -> Result<()>;

	fn clone_box(&self) -> Box<dyn Optimizer>;
}

impl Clone for Box<dyn Optimizer> {
	fn clone(&self) -> Self {
		self.clone_box()
	}
}

pub fn register(registry: &mut Registry<Box<dyn Optimizer>>) -> Result<()> {
	registry.register("SGD", builder_for(|o: Sgd| Box::new(o) as Box<dyn Optimizer>))?;
	registry.register("Adam", builder_for(|o: Adam| Box::new(o) as Box<dyn Optimizer>))?;
	registry.register("AdamW", builder_for(|o: AdamW| Box::new(o) as Box<dyn Optimizer>))?;
	Ok(())
}

/// Rescales all gradients so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(params: &mut [&mut Param], max_norm: f32) -> f32 {
	let total = params
		.iter()
		.filter(|p| p.trainable)
		.map(|p| p.grad.iter().map(|g| g * g).sum::<f32>())
		.sum::<f32>()
		.sqrt();
	if total > max_norm {
		let factor = max_norm / (total + 1e-6);
		for param in params.iter_mut().filter(|p| p.trainable) {
			param.grad.mapv_inplace(|g| g * factor);
		}
	}
	total
}

fn check_lr(lr: f32) -> Result<()> {
	if !(lr >= 0.0) {
		return Err(FlowError::InvalidParameter(format!("Learning rate ({}) must not be negative", lr)));
	}
	Ok(())
}

fn restore_slots(
	slots: &mut IndexMap<String, Vec<ArrayD<f32>>>,
	state: &OptimizerState,
	per_param: usize,
) -> Result<()> {
	for (name, values) in &state.slots {
		if values.len() != per_param {
			return Err(FlowError::Serialization(format!(
				"optimizer state for '{}' has {} slots, expected {}",
				name,
				values.len(),
				per_param
			)));
		}
	}
	*slots = state.slots.clone();
	Ok(())
}

fn slot<'a>(
	slots: &'a mut IndexMap<String, Vec<ArrayD<f32>>>,
	param: &Param,
	count: usize,
) -> Result<&'a mut Vec<ArrayD<f32>>> {
	let entry = slots
		.entry(param.name.clone())
		.or_insert_with(|| vec![ArrayD::zeros(param.value.raw_dim()); count]);
	if entry.iter().any(|s| s.shape() != param.value.shape()) {
		return Err(FlowError::shape_mismatch(param.value.shape(), entry[0].shape()));
	}
	Ok(entry)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SgdArgs {
	pub lr: f32,
	pub momentum: f32,
	pub weight_decay: f32,
	pub nesterov: bool,
}

impl Default for SgdArgs {
	fn default() -> Self {
		Self {
			lr: training::DEFAULT_LEARNING_RATE,
			momentum: 0.0,
			weight_decay: 0.0,
			nesterov: false,
		}
	}
}

/// Stochastic gradient descent with optional momentum and L2 weight decay.
#[derive(Debug, Clone)]
pub struct Sgd {
	args: SgdArgs,
	step: u64,
	velocity: IndexMap<String, Vec<ArrayD<f32>>>,
}

impl Sgd {
	pub fn new(args: SgdArgs) -> Result<Self> {
		check_lr(args.lr)?;
		if args.nesterov && args.momentum <= 0.0 {
			return Err(FlowError::InvalidParameter("Nesterov momentum requires momentum > 0".into()));
		}
		Ok(Sgd {
			args,
			step: 0,
			velocity: IndexMap::new(),
		})
	}
}

impl Configurable for Sgd {
	type Args = SgdArgs;

	fn from_args(args: Self::Args, _registries: &Registries) -> Result<Self> {
		Self::new(args)
	}
}

impl Optimizer for Sgd {
	fn step(&mut self, params: &mut [&mut Param]) -> Result<()> {
		self.step += 1;
		let a = self.args;
		for param in params.iter_mut().filter(|p| p.trainable) {
			let mut grad = param.grad.clone();
			if a.weight_decay != 0.0 {
				grad.zip_mut_with(&param.value, |g, &p| *g += a.weight_decay * p);
			}
			if a.momentum != 0.0 {
				let buf = &mut slot(&mut self.velocity, param, 1)?[0];
				Zip::from(&mut *buf).and(&grad).for_each(|b, &g| *b = a.momentum * *b + g);
				if a.nesterov {
					grad.zip_mut_with(buf, |g, &b| *g += a.momentum * b);
				} else {
					grad.assign(buf);
				}
			}
			param.value.zip_mut_with(&grad, |p, &g| *p -= a.lr * g);
		}
		Ok(())
	}

	fn lr(&self) -> f32 {
		self.args.lr
	}

	fn set_lr(&mut self, lr: f32) {
		self.args.lr = lr;
	}

	fn state(&self) -> OptimizerState {
		OptimizerState {
			step: self.step,
			lr: self.args.lr,
			slots: self.velocity.clone(),
		}
	}

	fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
		restore_slots(&mut self.velocity, state, 1)?;
		self.step = state.step;
		self.args.lr = state.lr;
		Ok(())
	}

	fn clone_box(&self) -> Box<dyn Optimizer> {
		Box::new(self.clone())
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdamArgs {
	pub lr: f32,
	pub betas: [f32; 2],
	pub eps: f32,
	pub weight_decay: f32,
}

impl Default for AdamArgs {
	fn default() -> Self {
		Self {
			lr: training::DEFAULT_LEARNING_RATE,
			betas: [training::ADAM_BETA1, training::ADAM_BETA2],
			eps: training::ADAM_EPSILON,
			weight_decay: 0.0,
		}
	}
}

/// Shared Adam update; `decoupled` selects AdamW-style weight decay.
#[derive(Debug, Clone)]
struct AdamCore {
	args: AdamArgs,
	decoupled: bool,
	step: u64,
	moments: IndexMap<String, Vec<ArrayD<f32>>>,
}

impl AdamCore {
	fn new(args: AdamArgs, decoupled: bool) -> Result<Self> {
		check_lr(args.lr)?;
		let [b1, b2] = args.betas;
		if !(0.0..1.0).contains(&b1) || !(0.0..1.0).contains(&b2) {
			return Err(FlowError::InvalidParameter(format!("Adam betas must lie in [0, 1), got {:?}", args.betas)));
		}
		Ok(AdamCore {
			args,
			decoupled,
			step: 0,
			moments: IndexMap::new(),
		})
	}

	fn step(&mut self, params: &mut [&mut Param]) -> Result<()> {
		self.step += 1;
		let a = self.args;
		let [b1, b2] = a.betas;
		let bc1 = 1.0 - b1.powi(self.step as i32);
		let bc2 = 1.0 - b2.powi(self.step as i32);
		for param in params.iter_mut().filter(|p| p.trainable) {
			let mut grad = param.grad.clone();
			if a.weight_decay != 0.0 {
				if self.decoupled {
					param.value.mapv_inplace(|p| p - a.lr * a.weight_decay * p);
				} else {
					grad.zip_mut_with(&param.value, |g, &p| *g += a.weight_decay * p);
				}
			}
			let slots = slot(&mut self.moments, param, 2)?;
			let (m, v) = slots.split_at_mut(1);
			Zip::from(&mut m[0])
				.and(&mut v[0])
				.and(&grad)
				.and(&mut param.value)
				.for_each(|m, v, &g, p| {
					*m = b1 * *m + (1.0 - b1) * g;
					*v = b2 * *v + (1.0 - b2) * g * g;
					let m_hat = *m / bc1;
					let v_hat = *v / bc2;
					*p -= a.lr * m_hat / (v_hat.sqrt() + a.eps);
				});
		}
		Ok(())
	}

	fn state(&self) -> OptimizerState {
		OptimizerState {
			step: self.step,
			lr: self.args.lr,
			slots: self.moments.clone(),
		}
	}

	fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
		restore_slots(&mut self.moments, state, 2)?;
		self.step = state.step;
		self.args.lr = state.lr;
		Ok(())
	}
}

#[derive(Debug, Clone)]
pub struct Adam(AdamCore);

impl Adam {
	pub fn new(args: AdamArgs) -> Result<Self> {
		AdamCore::new(args, false).map(Adam)
	}
}

impl Configurable for Adam {
	type Args = AdamArgs;

	fn from_args(args: Self::Args, _registries: &Registries) -> Result<Self> {
		Self::new(args)
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdamWArgs {
	pub lr: f32,
	pub betas: [f32; 2],
	pub eps: f32,
	pub weight_decay: f32,
}

impl Default for AdamWArgs {
	fn default() -> Self {
		Self {
			weight_decay: training::ADAMW_WEIGHT_DECAY,
			..AdamW::base_args()
		}
	}
}

/// Adam with weight decay applied to the weights directly.
#[derive(Debug, Clone)]
pub struct AdamW(AdamCore);

impl AdamW {
	fn base_args() -> AdamWArgs {
		let base = AdamArgs::default();
		AdamWArgs {
			lr: base.lr,
			betas: base.betas,
			eps: base.eps,
			weight_decay: base.weight_decay,
		}
	}

	pub fn new(args: AdamWArgs) -> Result<Self> {
		let args = AdamArgs {
			lr: args.lr,
			betas: args.betas,
			eps: args.eps,
			weight_decay: args.weight_decay,
		};
		AdamCore::new(args, true).map(AdamW)
	}
}

impl Configurable for AdamW {
	type Args = AdamWArgs;

	fn from_args(args: Self::Args, _registries: &Registries) -> Result<Self> {
		Self::new(args)
	}
}

macro_rules! adam_optimizer {
	($name:ident) => {
		impl Optimizer for $name {
			fn step(&mut self, params: &mut [&mut Param]) -> Result<()> {
				self.0.step(params)
			}

			fn lr(&self) -> f32 {
				self.0.args.lr
			}

			fn set_lr(&mut self, lr: f32) {
				self.0.args.lr = lr;
			}

			fn state(&self) -> OptimizerState {
				self.0.state()
			}

			fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
				self.0.load_state(state)
			}

			fn clone_box(&self) -> Box<dyn Optimizer> {
				Box::new(self.clone())
			}
		}
	};
}

adam_optimizer!(Adam);
adam_optimizer!(AdamW);

#[cfg(test)]
mod tests {
	use super::*;
	use ndarray::arr1;

	fn param(value: f32, grad: f32) -> Param {
		let mut p = Param::new("w", arr1(&[value]).into_dyn());
		p.grad = arr1(&[grad]).into_dyn();
		p
	}

	#[test]
	fn sgd_momentum_accumulates() {
		let mut opt = Sgd::new(SgdArgs {
			lr: 0.1,
			momentum: 0.9,
			..Default::default()
		})
		.unwrap();
		let mut p = param(1.0, 1.0);
		opt.step(&mut [&mut p]).unwrap();
		assert!((p.value[[0]] - 0.9).abs() < 1e-6);
		opt.step(&mut [&mut p]).unwrap();
		// velocity is 0.9 * 1 + 1
		assert!((p.value[[0]] - (0.9 - 0.19)).abs() < 1e-6);
	}

	#[test]
	fn first_adam_step_moves_by_lr() {
		let mut opt = Adam::new(AdamArgs {
			lr: 0.01,
			..Default::default()
		})
		.unwrap();
		let mut p = param(0.5, -3.0);
		opt.step(&mut [&mut p]).unwrap();
		assert!((p.value[[0]] - 0.51).abs() < 1e-5);
	}

	#[test]
	fn adamw_decays_weights_without_gradient() {
		let mut opt = AdamW::new(AdamWArgs {
			lr: 0.1,
			weight_decay: 0.5,
			..Default::default()
		})
		.unwrap();
		let mut p = param(2.0, 0.0);
		opt.step(&mut [&mut p]).unwrap();
		assert!((p.value[[0]] - 1.9).abs() < 1e-6);
	}

	#[test]
	fn zero_lr_and_buffers_leave_values_alone() {
		let mut opt = Adam::new(AdamArgs {
			lr: 0.0,
			..Default::default()
		})
		.unwrap();
		let mut p = param(1.5, 2.0);
		let mut buffer = Param::buffer("running_mean", arr1(&[3.0]).into_dyn());
		buffer.grad = arr1(&[1.0]).into_dyn();
		opt.step(&mut [&mut p, &mut buffer]).unwrap();
		assert_eq!(p.value[[0]], 1.5);
		assert_eq!(buffer.value[[0]], 3.0);
	}

	#[test]
	fn state_restores_moments() {
		let mut a = Adam::new(AdamArgs::default()).unwrap();
		let mut p = param(1.0, 0.5);
		a.step(&mut [&mut p]).unwrap();
		let mut b = Adam::new(AdamArgs::default()).unwrap();
		b.load_state(&a.state()).unwrap();

		let mut pa = p.clone();
		let mut pb = p.clone();
		a.step(&mut [&mut pa]).unwrap();
		b.step(&mut [&mut pb]).unwrap();
		assert_eq!(pa.value, pb.value);
		assert!(Sgd::new(SgdArgs::default()).unwrap().load_state(&a.state()).is_err());
	}

	#[test]
	fn clipping_bounds_global_norm() {
		let mut a = param(0.0, 3.0);
		let mut b = param(0.0, 4.0);
		let norm = clip_grad_norm(&mut [&mut a, &mut b], 1.0);
		assert!((norm - 5.0).abs() < 1e-6);
		assert!((a.grad[[0]] - 0.6).abs() < 1e-5);
		assert!((b.grad[[0]] - 0.8).abs() < 1e-5);
	}
}
