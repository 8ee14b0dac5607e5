//! Loss functions, weight annealers and data augmentation.

pub mod anneal;
pub mod augment;
mod multiscale;
mod offset;
mod sequence;

pub use self::anneal::{Annealer, CosineAnnealer, CosineAnnealerArgs, PolyAnnealer, PolyAnnealerArgs};
pub use self::augment::{AugmentationParams, FlowAugmentor};
pub use self::multiscale::{MultiScaleLoss, MultiScaleLossArgs};
pub use self::offset::{FlowOffsetLoss, FlowOffsetLossArgs, OffsetCrossEntropyLoss, OffsetCrossEntropyLossArgs};
pub use self::sequence::{SequenceLoss, SequenceLossArgs};

use std::fmt;

use ndarray::{Array3, Array4, Axis, Zip};

use crate::constants::loss;
use crate::error::{FlowError, Result};
use crate::models::{FlowGrads, FlowOutput};
use crate::registry::{builder_for, Registry};

/// Ground truth for one batch.
#[derive(Debug, Clone)]
pub struct FlowTarget {
	/// `[N, 2, H, W]`
	pub flow: Array4<f32>,
	/// `[N, H, W]`; pixels below 0.5 are ignored.
	pub valid: Option<Array3<f32>>,
}

impl FlowTarget {
	pub fn new(flow: Array4<f32>, valid: Option<Array3<f32>>) -> Self {
		FlowTarget { flow, valid }
	}

	pub fn hw(&self) -> (usize, usize) {
		let (_, _, h, w) = self.flow.dim();
		(h, w)
	}

	/// 1.0 where the pixel takes part in the loss, 0.0 elsewhere.
	pub fn mask(&self, max_flow: Option<f32>) -> Result<Array3<f32>> {
		let (n, _, h, w) = self.flow.dim();
		let mut mask = match &self.valid {
			Some(valid) => {
				if valid.dim() != (n, h, w) {
					return Err(FlowError::shape_mismatch((n, h, w), valid.dim()));
				}
				valid.mapv(|v| if v >= loss::VALID_THRESHOLD { 1.0 } else { 0.0 })
			}
			None => Array3::ones((n, h, w)),
		};
		if let Some(max_flow) = max_flow {
			let u = self.flow.index_axis(Axis(1), 0);
			let v = self.flow.index_axis(Axis(1), 1);
			Zip::from(&mut mask).and(&u).and(&v).for_each(|m, &u, &v| {
				if (u * u + v * v).sqrt() >= max_flow {
					*m = 0.0;
				}
			});
		}
		Ok(mask)
	}
}

#[derive(Debug, Clone)]
pub struct LossOutput {
	pub value: f32,
	pub grads: FlowGrads,
}

pub trait Criterion: Send + Sync + fmt::Debug {
	fn compute(&self, output: &FlowOutput, target: &FlowTarget, iteration: usize) -> Result<LossOutput>;

	fn clone_box(&self) -> Box<dyn Criterion>;
}

impl Clone for Box<dyn Criterion> {
	fn clone(&self) -> Self {
		self.clone_box()
	}
}

pub fn register_criteria(registry: &mut Registry<Box<dyn Criterion>>) -> Result<()> {
	registry.register(
		"SequenceLoss",
		builder_for(|c: SequenceLoss| Box::new(c) as Box<dyn Criterion>),
	)?;
	registry.register(
		"MultiScaleLoss",
		builder_for(|c: MultiScaleLoss| Box::new(c) as Box<dyn Criterion>),
	)?;
	registry.register(
		"OffsetCrossEntropyLoss",
		builder_for(|c: OffsetCrossEntropyLoss| Box::new(c) as Box<dyn Criterion>),
	)?;
	registry.register(
		"FlowOffsetLoss",
		builder_for(|c: FlowOffsetLoss| Box::new(c) as Box<dyn Criterion>),
	)?;
	Ok(())
}

pub fn register_annealers(registry: &mut Registry<Box<dyn Annealer>>) -> Result<()> {
	registry.register(
		"CosineAnnealer",
		builder_for(|a: CosineAnnealer| Box::new(a) as Box<dyn Annealer>),
	)?;
	registry.register(
		"PolyAnnealer",
		builder_for(|a: PolyAnnealer| Box::new(a) as Box<dyn Annealer>),
	)?;
	Ok(())
}

/// Softmax over the channel axis of `[N, K, H, W]` logits.
pub fn softmax_channels(z: &Array4<f32>) -> Array4<f32> {
	let max = z.fold_axis(Axis(1), f32::NEG_INFINITY, |&m, &v| m.max(v));
	let mut e = z - &max.insert_axis(Axis(1));
	e.mapv_inplace(f32::exp);
	let sum = e.sum_axis(Axis(1)).insert_axis(Axis(1));
	e / &sum
}

/// Mean end-point error between two `[N, 2, H, W]` flow fields.
pub fn average_epe(pred: &Array4<f32>, target: &Array4<f32>) -> Result<f32> {
	if pred.dim() != target.dim() {
		return Err(FlowError::shape_mismatch(target.dim(), pred.dim()));
	}
	let diff = pred - target;
	let du = diff.index_axis(Axis(1), 0);
	let dv = diff.index_axis(Axis(1), 1);
	let total = Zip::from(&du).and(&dv).fold(0.0f32, |acc, &u, &v| acc + (u * u + v * v).sqrt());
	Ok(total / du.len().max(1) as f32)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn softmax_sums_to_one_per_pixel() {
		let z = Array4::from_shape_fn((2, 5, 3, 3), |(b, k, y, x)| (b + k * 40 + y + x) as f32);
		let p = softmax_channels(&z);
		for s in p.sum_axis(Axis(1)).iter() {
			assert!((s - 1.0).abs() < 1e-5);
		}
	}

	#[test]
	fn mask_drops_invalid_and_large_flow() {
		let mut flow = Array4::<f32>::zeros((1, 2, 1, 3));
		flow[[0, 0, 0, 2]] = 500.0;
		let valid = Array3::from_shape_vec((1, 1, 3), vec![1.0, 0.2, 1.0]).unwrap();
		let mask = FlowTarget::new(flow, Some(valid)).mask(Some(400.0)).unwrap();
		assert_eq!(mask.iter().cloned().collect::<Vec<_>>(), vec![1.0, 0.0, 0.0]);
	}

	#[test]
	fn epe_of_unit_offset_is_one() {
		let a = Array4::<f32>::zeros((1, 2, 2, 2));
		let mut b = a.clone();
		b.index_axis_mut(Axis(1), 1).fill(1.0);
		assert!((average_epe(&a, &b).unwrap() - 1.0).abs() < 1e-6);
	}
}
