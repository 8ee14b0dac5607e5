//! Dynamic loss scaling for reduced-precision training.

use crate::constants::scaler;
use crate::engine::optim::Optimizer;
use crate::error::Result;
use crate::nn::Param;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradScalerState {
	pub scale: f32,
	pub growth_tracker: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GradScalerArgs {
	pub enabled: bool,
	pub init_scale: f32,
	pub growth_factor: f32,
	pub backoff_factor: f32,
	pub growth_interval: usize,
}

impl Default for GradScalerArgs {
	fn default() -> Self {
		Self {
			enabled: false,
			init_scale: scaler::INIT_SCALE,
			growth_factor: scaler::GROWTH_FACTOR,
			backoff_factor: scaler::BACKOFF_FACTOR,
			growth_interval: scaler::GROWTH_INTERVAL,
		}
	}
}

/// Scales the loss gradient up before back-propagation and checks the
/// unscaled parameter gradients for overflow. A disabled scaler is the
/// identity and never skips a step.
#[derive(Debug, Clone)]
pub struct GradScaler {
	args: GradScalerArgs,
	scale: f32,
	growth_tracker: usize,
	found_inf: bool,
}

impl GradScaler {
	pub fn new(args: GradScalerArgs) -> Self {
		GradScaler {
			args,
			scale: args.init_scale,
			growth_tracker: 0,
			found_inf: false,
		}
	}

	pub fn enabled(enabled: bool) -> Self {
		GradScaler::new(GradScalerArgs {
			enabled,
			..Default::default()
		})
	}

	pub fn is_enabled(&self) -> bool {
		self.args.enabled
	}

	/// Factor to multiply the loss gradient by.
	pub fn scale(&self) -> f32 {
		if self.args.enabled {
			self.scale
		} else {
			1.0
		}
	}

	/// Divides every gradient by the current scale and records whether any
	/// of them is non-finite.
	pub fn unscale(&mut self, params: &mut [&mut Param]) {
		if !self.args.enabled {
			return;
		}
		let inv = 1.0 / self.scale;
		let mut found_inf = false;
		for param in params.iter_mut().filter(|p| p.trainable) {
			param.grad.mapv_inplace(|g| g * inv);
			found_inf |= param.grad.iter().any(|g| !g.is_finite());
		}
		self.found_inf = found_inf;
	}

	/// Runs the optimizer unless the last unscale saw an overflow.
	/// Returns whether the step was taken.
	pub fn step(&mut self, optimizer: &mut dyn Optimizer, params: &mut [&mut Param]) -> Result<bool> {
		if self.args.enabled && self.found_inf {
			tracing::debug!("Skipping optimizer step, non-finite gradients at scale {}", self.scale);
			return Ok(false);
		}
		optimizer.step(params)?;
		Ok(true)
	}

	/// Backs off after an overflow, grows after `growth_interval` clean steps.
	pub fn update(&mut self) {
		if !self.args.enabled {
			return;
		}
		if self.found_inf {
			self.scale *= self.args.backoff_factor;
			self.growth_tracker = 0;
		} else {
			self.growth_tracker += 1;
			if self.growth_tracker >= self.args.growth_interval {
				self.scale *= self.args.growth_factor;
				self.growth_tracker = 0;
			}
		}
		self.found_inf = false;
	}

	pub fn state(&self) -> GradScalerState {
		GradScalerState {
			scale: self.scale,
			growth_tracker: self.growth_tracker,
		}
	}

	pub fn load_state(&mut self, state: &GradScalerState) {
		self.scale = state.scale;
		self.growth_tracker = state.growth_tracker;
		self.found_inf = false;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::engine::optim::{Sgd, SgdArgs};
	use ndarray::arr1;

	fn param(grad: f32) -> Param {
		let mut p = Param::new("w", arr1(&[1.0]).into_dyn());
		p.grad = arr1(&[grad]).into_dyn();
		p
	}

	fn sgd() -> Sgd {
		Sgd::new(SgdArgs {
			lr: 1.0,
			..Default::default()
		})
		.unwrap()
	}

	#[test]
	fn disabled_scaler_is_identity() {
		let mut scaler = GradScaler::enabled(false);
		let mut p = param(f32::INFINITY);
		assert_eq!(scaler.scale(), 1.0);
		scaler.unscale(&mut [&mut p]);
		assert!(scaler.step(&mut sgd(), &mut [&mut p]).unwrap());
		scaler.update();
		assert_eq!(scaler.state().scale, scaler::INIT_SCALE);
	}

	#[test]
	fn overflow_skips_step_and_backs_off() {
		let mut scaler = GradScaler::enabled(true);
		let mut p = param(f32::INFINITY);
		scaler.unscale(&mut [&mut p]);
		assert!(!scaler.step(&mut sgd(), &mut [&mut p]).unwrap());
		assert_eq!(p.value[[0]], 1.0);
		scaler.update();
		assert_eq!(scaler.scale(), scaler::INIT_SCALE * scaler::BACKOFF_FACTOR);
	}

	#[test]
	fn clean_steps_grow_the_scale() {
		let mut scaler = GradScaler::new(GradScalerArgs {
			enabled: true,
			init_scale: 4.0,
			growth_interval: 2,
			..Default::default()
		});
		for _ in 0..2 {
			let mut p = param(8.0);
			scaler.unscale(&mut [&mut p]);
			assert_eq!(p.grad[[0]], 8.0 / scaler.scale());
			assert!(scaler.step(&mut sgd(), &mut [&mut p]).unwrap());
			scaler.update();
		}
		assert_eq!(scaler.scale(), 8.0);
	}
}
