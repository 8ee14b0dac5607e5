use ndarray::{Array3, Array4, Axis, Zip};

use super::{Criterion, FlowTarget, LossOutput};
use crate::constants::loss;
use crate::error::{FlowError, Result};
use crate::models::{FlowGrads, FlowOutput};
use crate::nn::resample::{scale_factor, upsample_flow, upsample_flow_backward};
use crate::registry::{Configurable, Registries};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SequenceLossArgs {
	pub gamma: f32,
	pub max_flow: f32,
}

impl Default for SequenceLossArgs {
	fn default() -> Self {
		Self {
			gamma: loss::SEQUENCE_GAMMA,
			max_flow: loss::MAX_FLOW,
		}
	}
}

/// Exponentially weighted L1 over a sequence of predictions.
///
/// Prediction `i` of `n` gets weight `gamma^(n - 1 - i)`, so the last (finest)
/// one counts most. Predictions below the target resolution are upsampled
/// with their vectors rescaled before comparison. Pixels with `valid < 0.5`
/// or ground-truth magnitude `>= max_flow` are masked out.
#[derive(Debug, Clone)]
pub struct SequenceLoss {
	args: SequenceLossArgs,
}

impl SequenceLoss {
	pub fn new(args: SequenceLossArgs) -> Result<Self> {
		if !(args.gamma > 0.0) || !(args.max_flow > 0.0) {
			return Err(FlowError::InvalidParameter(format!(
				"SequenceLoss needs positive gamma and max_flow, got {:?}",
				args
			)));
		}
		Ok(SequenceLoss { args })
	}

	/// Loss value and dLoss/dPred for every prediction.
	pub(crate) fn evaluate(&self, preds: &[Array4<f32>], target: &FlowTarget) -> Result<(f32, Vec<Array4<f32>>)> {
		if preds.is_empty() {
			return Err(FlowError::InvalidParameter("SequenceLoss got no predictions".into()));
		}
		let mask = target.mask(Some(self.args.max_flow))?;
		let n = preds.len();
		let mut value = 0.0;
		let mut grads = Vec::with_capacity(n);
		for (i, pred) in preds.iter().enumerate() {
			let weight = self.args.gamma.powi((n - 1 - i) as i32);
			let (l1, grad) = masked_l1(pred, &target.flow, &mask)?;
			value += weight * l1;
			grads.push(grad.mapv(|g| g * weight));
		}
		Ok((value, grads))
	}
}

/// Mean of `|up(pred) - flow| * mask` over every element of `flow`, and its
/// gradient with respect to `pred`.
fn masked_l1(pred: &Array4<f32>, flow: &Array4<f32>, mask: &Array3<f32>) -> Result<(f32, Array4<f32>)> {
	let (n, c, h, w) = flow.dim();
	let (pn, pc, ph, pw) = pred.dim();
	if (pn, pc) != (n, c) {
		return Err(FlowError::shape_mismatch((n, c), (pn, pc)));
	}
	let factor = scale_factor((h, w), (ph, pw))?;
	let up = upsample_flow(pred, factor);
	let count = (n * c * h * w) as f32;

	let mut total = 0.0;
	let mut grad_up = Array4::<f32>::zeros(up.raw_dim());
	for ch in 0..c {
		Zip::from(grad_up.index_axis_mut(Axis(1), ch))
			.and(up.index_axis(Axis(1), ch))
			.and(flow.index_axis(Axis(1), ch))
			.and(mask)
			.for_each(|g, &p, &t, &m| {
				let diff = p - t;
				total += diff.abs() * m;
				*g = if diff > 0.0 {
					m / count
				} else if diff < 0.0 {
					-m / count
				} else {
					0.0
				};
			});
	}
	Ok((total / count, upsample_flow_backward(&grad_up, factor)?))
}

impl Configurable for SequenceLoss {
	type Args = SequenceLossArgs;

	fn from_args(args: Self::Args, _registries: &Registries) -> Result<Self> {
		Self::new(args)
	}
}

impl Criterion for SequenceLoss {
	fn compute(&self, output: &FlowOutput, target: &FlowTarget, _iteration: usize) -> Result<LossOutput> {
		let (value, flow_preds) = self.evaluate(&output.flow_preds, target)?;
		let mut grads = FlowGrads::zeros_like(output);
		grads.flow_preds = flow_preds;
		Ok(LossOutput { value, grads })
	}

	fn clone_box(&self) -> Box<dyn Criterion> {
		Box::new(self.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn output(preds: Vec<Array4<f32>>) -> FlowOutput {
		FlowOutput {
			flow_preds: preds,
			flow_logits: None,
			flow_upsampled: None,
		}
	}

	#[test]
	fn later_predictions_weigh_more() {
		let loss = SequenceLoss::new(SequenceLossArgs::default()).unwrap();
		let target = FlowTarget::new(Array4::zeros((1, 2, 4, 4)), None);
		let off = Array4::from_elem((1, 2, 4, 4), 1.0);
		let zero = Array4::zeros((1, 2, 4, 4));

		let early = loss.compute(&output(vec![off.clone(), zero.clone()]), &target, 0).unwrap();
		let late = loss.compute(&output(vec![zero, off]), &target, 0).unwrap();
		assert!((early.value - 0.8).abs() < 1e-6);
		assert!((late.value - 1.0).abs() < 1e-6);
	}

	#[test]
	fn coarse_prediction_is_upsampled_with_scaled_vectors() {
		let loss = SequenceLoss::new(SequenceLossArgs::default()).unwrap();
		// a 0.5 px flow at quarter resolution is 2 px at full resolution
		let target = FlowTarget::new(Array4::from_elem((1, 2, 8, 8), 2.0), None);
		let coarse = Array4::from_elem((1, 2, 2, 2), 0.5);
		let out = loss.compute(&output(vec![coarse]), &target, 0).unwrap();
		assert!(out.value.abs() < 1e-6);
		assert_eq!(out.grads.flow_preds[0].dim(), (1, 2, 2, 2));
	}

	#[test]
	fn invalid_pixels_get_no_gradient() {
		let loss = SequenceLoss::new(SequenceLossArgs::default()).unwrap();
		let mut valid = Array3::<f32>::ones((1, 2, 2));
		valid[[0, 1, 1]] = 0.0;
		let target = FlowTarget::new(Array4::zeros((1, 2, 2, 2)), Some(valid));
		let out = loss
			.compute(&output(vec![Array4::from_elem((1, 2, 2, 2), 3.0)]), &target, 0)
			.unwrap();
		let g = &out.grads.flow_preds[0];
		assert_eq!(g[[0, 0, 1, 1]], 0.0);
		assert!(g[[0, 0, 0, 0]] > 0.0);
		assert!((out.value - 3.0 * 6.0 / 8.0).abs() < 1e-6);
	}
}
