//! Loss weights as pure functions of the training iteration.

use std::f32::consts::PI;
use std::fmt;

use crate::constants::loss;
use crate::error::{FlowError, Result};
use crate::registry::{Configurable, Registries};

pub trait Annealer: Send + Sync + fmt::Debug {
	fn weight(&self, iteration: usize) -> f32;

	fn clone_box(&self) -> Box<dyn Annealer>;
}

impl Clone for Box<dyn Annealer> {
	fn clone(&self) -> Self {
		self.clone_box()
	}
}

fn check_max_iter(max_iter: usize) -> Result<()> {
	if max_iter == 0 {
		return Err(FlowError::InvalidParameter("annealer max_iter must be greater than 0".into()));
	}
	Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CosineAnnealerArgs {
	pub init_weight: f32,
	pub min_weight: f32,
	pub max_iter: usize,
}

impl Default for CosineAnnealerArgs {
	fn default() -> Self {
		Self {
			init_weight: 1.0,
			min_weight: 0.0,
			max_iter: loss::DEFAULT_ANNEAL_MAX_ITER,
		}
	}
}

/// `min + (init - min) * (1 + cos(pi * t / max_iter)) / 2`, held at `min` past `max_iter`.
#[derive(Debug, Clone)]
pub struct CosineAnnealer {
	args: CosineAnnealerArgs,
}

impl CosineAnnealer {
	pub fn new(args: CosineAnnealerArgs) -> Result<Self> {
		check_max_iter(args.max_iter)?;
		Ok(CosineAnnealer { args })
	}
}

impl Configurable for CosineAnnealer {
	type Args = CosineAnnealerArgs;

	fn from_args(args: Self::Args, _registries: &Registries) -> Result<Self> {
		Self::new(args)
	}
}

impl Annealer for CosineAnnealer {
	fn weight(&self, iteration: usize) -> f32 {
		let a = &self.args;
		let t = iteration.min(a.max_iter) as f32 / a.max_iter as f32;
		a.min_weight + (a.init_weight - a.min_weight) * (1.0 + (PI * t).cos()) / 2.0
	}

	fn clone_box(&self) -> Box<dyn Annealer> {
		Box::new(self.clone())
	}
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolyAnnealerArgs {
	pub init_weight: f32,
	pub min_weight: f32,
	pub max_iter: usize,
	pub power: f32,
}

impl Default for PolyAnnealerArgs {
	fn default() -> Self {
		Self {
			init_weight: 1.0,
			min_weight: 0.0,
			max_iter: loss::DEFAULT_ANNEAL_MAX_ITER,
			power: 1.0,
		}
	}
}

/// `min + (init - min) * (1 - t / max_iter)^power`, held at `min` past `max_iter`.
#[derive(Debug, Clone)]
pub struct PolyAnnealer {
	args: PolyAnnealerArgs,
}

impl PolyAnnealer {
	pub fn new(args: PolyAnnealerArgs) -> Result<Self> {
		check_max_iter(args.max_iter)?;
		if !(args.power > 0.0) {
			return Err(FlowError::InvalidParameter(format!(
				"PolyAnnealer power must be positive, got {}",
				args.power
			)));
		}
		Ok(PolyAnnealer { args })
	}
}

impl Configurable for PolyAnnealer {
	type Args = PolyAnnealerArgs;

	fn from_args(args: Self::Args, _registries: &Registries) -> Result<Self> {
		Self::new(args)
	}
}

impl Annealer for PolyAnnealer {
	fn weight(&self, iteration: usize) -> f32 {
		let a = &self.args;
		let t = iteration.min(a.max_iter) as f32 / a.max_iter as f32;
		a.min_weight + (a.init_weight - a.min_weight) * (1.0 - t).powf(a.power)
	}

	fn clone_box(&self) -> Box<dyn Annealer> {
		Box::new(self.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cosine_runs_from_init_to_min() {
		let annealer = CosineAnnealer::new(CosineAnnealerArgs {
			init_weight: 1.0,
			min_weight: 0.2,
			max_iter: 100,
		})
		.unwrap();
		assert!((annealer.weight(0) - 1.0).abs() < 1e-6);
		assert!((annealer.weight(50) - 0.6).abs() < 1e-5);
		assert!((annealer.weight(100) - 0.2).abs() < 1e-6);
		assert!((annealer.weight(1000) - 0.2).abs() < 1e-6);
	}

	#[test]
	fn poly_is_linear_for_unit_power() {
		let annealer = PolyAnnealer::new(PolyAnnealerArgs {
			init_weight: 2.0,
			min_weight: 0.0,
			max_iter: 10,
			power: 1.0,
		})
		.unwrap();
		assert!((annealer.weight(5) - 1.0).abs() < 1e-6);
		assert!(CosineAnnealer::new(CosineAnnealerArgs {
			max_iter: 0,
			..Default::default()
		})
		.is_err());
	}
}
