use ndarray::{Array3, Array4, Axis};

use super::sequence::{SequenceLoss, SequenceLossArgs};
use super::{softmax_channels, Annealer, Criterion, FlowTarget, LossOutput};
use crate::config::CfgNode;
use crate::constants::loss;
use crate::decoder::max_displacement_for;
use crate::error::{FlowError, Result};
use crate::models::{FlowGrads, FlowOutput};
use crate::nn::resample::scale_factor;
use crate::registry::{Configurable, Registries};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OffsetCrossEntropyLossArgs {
	/// Subsampling between the target and the logit maps. Derived from the
	/// shapes when unset; checked against them when set.
	pub stride: Option<usize>,
	/// Initial weight of each logit map, in the order the model emits them.
	pub offset_loss_weight: Vec<f32>,
	pub weight_anneal_fn: String,
	pub min_weight: f32,
	pub max_iter: usize,
	/// Forwarded to the annealer only when set.
	pub power: Option<f32>,
}

impl Default for OffsetCrossEntropyLossArgs {
	fn default() -> Self {
		Self {
			stride: None,
			offset_loss_weight: vec![0.0, 1.0],
			weight_anneal_fn: "CosineAnnealer".to_string(),
			min_weight: 0.0,
			max_iter: loss::DEFAULT_ANNEAL_MAX_ITER,
			power: None,
		}
	}
}

/// Cross entropy between offset logits and soft labels built from the target.
///
/// The target flow at each logit pixel is expressed in logit-map pixels and
/// spread over the four surrounding displacement bins with bilinear weights.
/// Pixels that are invalid or whose displacement falls outside the grid add
/// neither loss nor gradient. The per-map loss is the mean over all pixels.
#[derive(Debug, Clone)]
pub struct OffsetCrossEntropyLoss {
	stride: Option<usize>,
	annealers: Vec<Box<dyn Annealer>>,
}

impl OffsetCrossEntropyLoss {
	pub fn new(args: OffsetCrossEntropyLossArgs, registries: &Registries) -> Result<Self> {
		if !registries.annealers.contains(&args.weight_anneal_fn) {
			return Err(FlowError::NotFound {
				kind: registries.annealers.kind().to_string(),
				name: args.weight_anneal_fn.clone(),
				available: registries.annealers.names().join(", "),
			});
		}
		let annealers = args
			.offset_loss_weight
			.iter()
			.map(|&init_weight| {
				let mut node = CfgNode::empty()
					.with("init_weight", init_weight)
					.with("min_weight", args.min_weight)
					.with("max_iter", args.max_iter as i64);
				if let Some(power) = args.power {
					node = node.with("power", power);
				}
				registries.annealers.build(&args.weight_anneal_fn, &node, registries)
			})
			.collect::<Result<Vec<_>>>()?;
		Ok(OffsetCrossEntropyLoss {
			stride: args.stride,
			annealers,
		})
	}

	pub(crate) fn evaluate(
		&self,
		logits: &[Array4<f32>],
		target: &FlowTarget,
		iteration: usize,
	) -> Result<(f32, Vec<Array4<f32>>)> {
		if logits.len() > self.annealers.len() {
			return Err(FlowError::InvalidParameter(format!(
				"{} offset loss weights for {} logit maps",
				self.annealers.len(),
				logits.len()
			)));
		}
		let mask = target.mask(None)?;
		let mut value = 0.0;
		let mut grads = Vec::with_capacity(logits.len());
		for (z, annealer) in logits.iter().zip(&self.annealers) {
			let weight = annealer.weight(iteration);
			let (map_loss, mut grad) = self.map_loss(z, target, &mask)?;
			value += weight * map_loss;
			grad.mapv_inplace(|g| g * weight);
			grads.push(grad);
		}
		Ok((value, grads))
	}

	fn map_loss(&self, z: &Array4<f32>, target: &FlowTarget, mask: &Array3<f32>) -> Result<(f32, Array4<f32>)> {
		let (n, k, h, w) = z.dim();
		let (tn, _, _, _) = target.flow.dim();
		if tn != n {
			return Err(FlowError::shape_mismatch(tn, n));
		}
		let stride = scale_factor(target.hw(), (h, w))?;
		if let Some(expected) = self.stride {
			if expected != stride {
				return Err(FlowError::shape_mismatch(
					format!("logits at stride {}", expected),
					format!("stride {}", stride),
				));
			}
		}
		let d = max_displacement_for(k)?;
		let side = 2 * d + 1;
		let count = (n * h * w) as f32;

		let log_z = log_softmax_channels(z);
		let probs = softmax_channels(z);
		let mut grad = Array4::<f32>::zeros(z.raw_dim());
		let mut total = 0.0;
		let mut labels = vec![0.0f32; k];

		for b in 0..n {
			for y in 0..h {
				for x in 0..w {
					let (ty, tx) = (y * stride, x * stride);
					if mask[[b, ty, tx]] < loss::VALID_THRESHOLD {
						continue;
					}
					let u = target.flow[[b, 0, ty, tx]] / stride as f32;
					let v = target.flow[[b, 1, ty, tx]] / stride as f32;
					if !soft_labels(u, v, d, &mut labels) {
						continue;
					}
					for c in 0..side * side {
						if labels[c] > 0.0 {
							total -= labels[c] * log_z[[b, c, y, x]];
						}
						grad[[b, c, y, x]] = (probs[[b, c, y, x]] - labels[c]) / count;
					}
				}
			}
		}
		Ok((total / count, grad))
	}
}

/// Writes bilinear weights of displacement `(u, v)` over the `(2d+1)^2` grid
/// into `labels`. Returns false when the displacement lies outside the grid.
fn soft_labels(u: f32, v: f32, d: usize, labels: &mut [f32]) -> bool {
	let df = d as f32;
	if !(u >= -df && u <= df && v >= -df && v <= df) {
		return false;
	}
	labels.iter_mut().for_each(|l| *l = 0.0);
	let side = 2 * d + 1;
	let (gx, gy) = (u + df, v + df);
	let (x0, y0) = (gx.floor(), gy.floor());
	let (fx, fy) = (gx - x0, gy - y0);
	let (x0, y0) = (x0 as usize, y0 as usize);
	let corners = [
		(x0, y0, (1.0 - fx) * (1.0 - fy)),
		(x0 + 1, y0, fx * (1.0 - fy)),
		(x0, y0 + 1, (1.0 - fx) * fy),
		(x0 + 1, y0 + 1, fx * fy),
	];
	for (cx, cy, wgt) in corners {
		if wgt > 0.0 && cx < side && cy < side {
			labels[cy * side + cx] += wgt;
		}
	}
	true
}

fn log_softmax_channels(z: &Array4<f32>) -> Array4<f32> {
	let max = z.fold_axis(Axis(1), f32::NEG_INFINITY, |&m, &v| m.max(v));
	let shifted = z - &max.insert_axis(Axis(1));
	let log_sum = shifted.mapv(f32::exp).sum_axis(Axis(1)).mapv(f32::ln).insert_axis(Axis(1));
	shifted - &log_sum
}

impl Configurable for OffsetCrossEntropyLoss {
	type Args = OffsetCrossEntropyLossArgs;

	fn from_args(args: Self::Args, registries: &Registries) -> Result<Self> {
		Self::new(args, registries)
	}
}

impl Criterion for OffsetCrossEntropyLoss {
	fn compute(&self, output: &FlowOutput, target: &FlowTarget, iteration: usize) -> Result<LossOutput> {
		let logits = output
			.flow_logits
			.as_ref()
			.ok_or_else(|| FlowError::InvalidParameter("OffsetCrossEntropyLoss needs a model that emits flow_logits".into()))?;
		let (value, logit_grads) = self.evaluate(logits, target, iteration)?;
		let mut grads = FlowGrads::zeros_like(output);
		grads.flow_logits = Some(logit_grads);
		Ok(LossOutput { value, grads })
	}

	fn clone_box(&self) -> Box<dyn Criterion> {
		Box::new(self.clone())
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowOffsetLossArgs {
	pub gamma: f32,
	pub max_flow: f32,
	pub stride: Option<usize>,
	pub offset_loss_weight: Vec<f32>,
	pub weight_anneal_fn: String,
	pub min_weight: f32,
	pub max_iter: usize,
	pub power: Option<f32>,
}

impl Default for FlowOffsetLossArgs {
	fn default() -> Self {
		let offset = OffsetCrossEntropyLossArgs::default();
		Self {
			gamma: loss::FLOW_OFFSET_GAMMA,
			max_flow: loss::MAX_FLOW,
			stride: offset.stride,
			offset_loss_weight: offset.offset_loss_weight,
			weight_anneal_fn: offset.weight_anneal_fn,
			min_weight: offset.min_weight,
			max_iter: offset.max_iter,
			power: offset.power,
		}
	}
}

/// Sequence L1 on the flow predictions plus offset cross entropy on the logits.
#[derive(Debug, Clone)]
pub struct FlowOffsetLoss {
	l1: SequenceLoss,
	cross_entropy: OffsetCrossEntropyLoss,
}

impl FlowOffsetLoss {
	pub fn new(args: FlowOffsetLossArgs, registries: &Registries) -> Result<Self> {
		Ok(FlowOffsetLoss {
			l1: SequenceLoss::new(SequenceLossArgs {
				gamma: args.gamma,
				max_flow: args.max_flow,
			})?,
			cross_entropy: OffsetCrossEntropyLoss::new(
				OffsetCrossEntropyLossArgs {
					stride: args.stride,
					offset_loss_weight: args.offset_loss_weight,
					weight_anneal_fn: args.weight_anneal_fn,
					min_weight: args.min_weight,
					max_iter: args.max_iter,
					power: args.power,
				},
				registries,
			)?,
		})
	}
}

impl Configurable for FlowOffsetLoss {
	type Args = FlowOffsetLossArgs;

	fn from_args(args: Self::Args, registries: &Registries) -> Result<Self> {
		Self::new(args, registries)
	}
}

impl Criterion for FlowOffsetLoss {
	fn compute(&self, output: &FlowOutput, target: &FlowTarget, iteration: usize) -> Result<LossOutput> {
		if target.valid.is_none() {
			return Err(FlowError::InvalidParameter(
				"FlowOffsetLoss needs a valid mask; enable append_valid_mask on the datasets".into(),
			));
		}
		let mut out = self.l1.compute(output, target, iteration)?;
		let ce = self.cross_entropy.compute(output, target, iteration)?;
		out.value += ce.value;
		out.grads.add_assign(&ce.grads)?;
		Ok(out)
	}

	fn clone_box(&self) -> Box<dyn Criterion> {
		Box::new(self.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn loss(weights: Vec<f32>) -> OffsetCrossEntropyLoss {
		OffsetCrossEntropyLoss::new(
			OffsetCrossEntropyLossArgs {
				offset_loss_weight: weights,
				..Default::default()
			},
			&Registries::with_defaults(),
		)
		.unwrap()
	}

	#[test]
	fn soft_labels_split_fractional_offsets() {
		let mut labels = vec![0.0; 9];
		assert!(soft_labels(0.5, 0.0, 1, &mut labels));
		assert!((labels[4] - 0.5).abs() < 1e-6);
		assert!((labels[5] - 0.5).abs() < 1e-6);
		assert!(!soft_labels(1.5, 0.0, 1, &mut labels));
	}

	#[test]
	fn stride_and_grid_follow_shapes() {
		let ce = loss(vec![1.0]);
		let flow = Array4::from_elem((1, 2, 8, 8), 4.0);
		let target = FlowTarget::new(flow, None);
		// stride 4, d = 1: a 4 px flow is exactly one bin
		let z = Array4::<f32>::zeros((1, 9, 2, 2));
		let (value, grads) = ce.evaluate(&[z], &target, 0).unwrap();
		assert!((value - (9.0f32).ln()).abs() < 1e-5);
		let g = &grads[0];
		assert!(g[[0, 8, 0, 0]] < 0.0);
		assert!(g[[0, 0, 0, 0]] > 0.0);
	}

	#[test]
	fn unknown_annealer_is_rejected() {
		let result = OffsetCrossEntropyLoss::new(
			OffsetCrossEntropyLossArgs {
				weight_anneal_fn: "StepAnnealer".into(),
				..Default::default()
			},
			&Registries::with_defaults(),
		);
		assert!(matches!(result, Err(FlowError::NotFound { .. })));
	}

	#[test]
	fn flow_offset_loss_requires_valid_mask() {
		let loss = FlowOffsetLoss::new(FlowOffsetLossArgs::default(), &Registries::with_defaults()).unwrap();
		let output = FlowOutput {
			flow_preds: vec![Array4::zeros((1, 2, 4, 4))],
			flow_logits: Some(vec![Array4::zeros((1, 9, 4, 4))]),
			flow_upsampled: None,
		};
		let target = FlowTarget::new(Array4::zeros((1, 2, 4, 4)), None);
		assert!(loss.compute(&output, &target, 0).is_err());
	}
}
