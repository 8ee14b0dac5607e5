use ndarray::{s, Array4, Axis, Zip};

use super::{Criterion, FlowTarget, LossOutput};
use crate::constants::loss;
use crate::error::{FlowError, Result};
use crate::models::{FlowGrads, FlowOutput};
use crate::nn::resample::{avg_pool, scale_factor};
use crate::registry::{Configurable, Registries};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MultiScaleLossArgs {
	/// One weight per prediction, finest first.
	pub weights: Vec<f32>,
}

impl Default for MultiScaleLossArgs {
	fn default() -> Self {
		Self {
			weights: loss::MULTISCALE_WEIGHTS.to_vec(),
		}
	}
}

/// FlowNet's multi-scale end-point error.
///
/// The target is average-pooled to each prediction's resolution and its
/// vectors are divided by the pooling factor.
#[derive(Debug, Clone)]
pub struct MultiScaleLoss {
	weights: Vec<f32>,
}

impl MultiScaleLoss {
	pub fn new(args: MultiScaleLossArgs) -> Result<Self> {
		if args.weights.is_empty() {
			return Err(FlowError::InvalidParameter("MultiScaleLoss needs at least one weight".into()));
		}
		Ok(MultiScaleLoss { weights: args.weights })
	}
}

impl Configurable for MultiScaleLoss {
	type Args = MultiScaleLossArgs;

	fn from_args(args: Self::Args, _registries: &Registries) -> Result<Self> {
		Self::new(args)
	}
}

impl Criterion for MultiScaleLoss {
	fn compute(&self, output: &FlowOutput, target: &FlowTarget, _iteration: usize) -> Result<LossOutput> {
		let preds = &output.flow_preds;
		if preds.len() > self.weights.len() {
			return Err(FlowError::InvalidParameter(format!(
				"MultiScaleLoss has {} weights for {} predictions",
				self.weights.len(),
				preds.len()
			)));
		}

		let mut grads = FlowGrads::zeros_like(output);
		let mut value = 0.0;
		for (i, pred) in preds.iter().enumerate() {
			let weight = self.weights[preds.len() - 1 - i];
			let (_, _, ph, pw) = pred.dim();
			let factor = scale_factor(target.hw(), (ph, pw))?;
			let scaled = avg_pool(&target.flow, factor)?.mapv(|v| v / factor as f32);
			if scaled.dim() != pred.dim() {
				return Err(FlowError::shape_mismatch(scaled.dim(), pred.dim()));
			}

			let count = (pred.len() / 2).max(1) as f32;
			let diff = pred - &scaled;
			let mut epe = 0.0;
			let grad = &mut grads.flow_preds[i];
			let (mut gu, mut gv) = grad.multi_slice_mut((s![.., 0, .., ..], s![.., 1, .., ..]));
			Zip::from(&mut gu)
				.and(&mut gv)
				.and(diff.index_axis(Axis(1), 0))
				.and(diff.index_axis(Axis(1), 1))
				.for_each(|gu, gv, &du, &dv| {
					let norm = (du * du + dv * dv).sqrt();
					epe += norm;
					let scale = weight / (norm.max(loss::EPE_EPSILON) * count);
					*gu = du * scale;
					*gv = dv * scale;
				});
			value += weight * epe / count;
		}
		Ok(LossOutput { value, grads })
	}

	fn clone_box(&self) -> Box<dyn Criterion> {
		Box::new(self.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn finest_prediction_takes_first_weight() {
		let loss = MultiScaleLoss::new(MultiScaleLossArgs {
			weights: vec![1.0, 0.5],
		})
		.unwrap();
		let target = FlowTarget::new(Array4::from_elem((1, 2, 4, 4), 4.0), None);
		let output = FlowOutput {
			// coarse is exact after pooling and rescaling, fine is off by (3, 4)
			flow_preds: vec![Array4::from_elem((1, 2, 2, 2), 2.0), {
				let mut fine = Array4::from_elem((1, 2, 4, 4), 4.0);
				fine.index_axis_mut(Axis(1), 0).fill(7.0);
				fine.index_axis_mut(Axis(1), 1).fill(8.0);
				fine
			}],
			flow_logits: None,
			flow_upsampled: None,
		};
		let out = loss.compute(&output, &target, 0).unwrap();
		assert!((out.value - 5.0).abs() < 1e-5);
		assert!(out.grads.flow_preds[0].iter().all(|&g| g == 0.0));
	}

	#[test]
	fn too_many_predictions_is_an_error() {
		let loss = MultiScaleLoss::new(MultiScaleLossArgs { weights: vec![1.0] }).unwrap();
		let target = FlowTarget::new(Array4::zeros((1, 2, 4, 4)), None);
		let output = FlowOutput {
			flow_preds: vec![Array4::zeros((1, 2, 2, 2)), Array4::zeros((1, 2, 4, 4))],
			flow_logits: None,
			flow_upsampled: None,
		};
		assert!(loss.compute(&output, &target, 0).is_err());
	}
}
