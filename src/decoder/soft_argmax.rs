use ndarray::{Array4, Axis, Zip};

use super::Decoder;
use crate::error::{FlowError, Result};
use crate::functional::softmax_channels;
use crate::nn::{Module, Param};
use crate::registry::{Configurable, Registries};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SoftArgmaxDecoderArgs {
	/// Channels of each logit map. Filled in by the model.
	pub in_channels: Vec<usize>,
	/// Parameter-free; accepted so every decoder node has the same shape.
	pub seed: u64,
}

/// Turns offset logits into flow as the probability-weighted mean displacement.
///
/// Each input has `(2d+1)^2` channels, one per displacement in the order of
/// [`Correlation::offsets`](crate::similarity::Correlation::offsets). Output
/// flow is measured in pixels of the logit map.
#[derive(Debug, Clone)]
pub struct SoftArgmaxDecoder {
	in_channels: Vec<usize>,
	probs: Vec<Array4<f32>>,
}

/// Recovers `d` from a `(2d+1)^2` channel count.
pub fn max_displacement_for(channels: usize) -> Result<usize> {
	let side = (channels as f64).sqrt().round() as usize;
	if side * side != channels || side % 2 == 0 {
		return Err(FlowError::InvalidParameter(format!(
			"{} channels is not a (2d+1)^2 displacement grid",
			channels
		)));
	}
	Ok(side / 2)
}

/// `(dx, dy)` of every channel of a `(2d+1)^2` grid.
pub fn displacement_grid(d: usize) -> (Vec<f32>, Vec<f32>) {
	let side = 2 * d + 1;
	let dx = (0..side * side).map(|k| (k % side) as f32 - d as f32).collect();
	let dy = (0..side * side).map(|k| (k / side) as f32 - d as f32).collect();
	(dx, dy)
}

impl SoftArgmaxDecoder {
	pub fn new(args: SoftArgmaxDecoderArgs) -> Result<Self> {
		for &c in &args.in_channels {
			max_displacement_for(c)?;
		}
		Ok(SoftArgmaxDecoder {
			in_channels: args.in_channels,
			probs: Vec::new(),
		})
	}
}

impl Configurable for SoftArgmaxDecoder {
	type Args = SoftArgmaxDecoderArgs;

	fn from_args(args: Self::Args, _registries: &Registries) -> Result<Self> {
		Self::new(args)
	}
}

impl Module for SoftArgmaxDecoder {
	fn params(&self) -> Vec<&Param> {
		Vec::new()
	}

	fn params_mut(&mut self) -> Vec<&mut Param> {
		Vec::new()
	}
}

impl Decoder for SoftArgmaxDecoder {
	fn forward(&mut self, logits: &[Array4<f32>]) -> Result<Vec<Array4<f32>>> {
		if !self.in_channels.is_empty() && self.in_channels.len() != logits.len() {
			return Err(FlowError::shape_mismatch(self.in_channels.len(), logits.len()));
		}
		self.probs.clear();
		let mut flows = Vec::with_capacity(logits.len());
		for z in logits {
			let (n, k, h, w) = z.dim();
			let (dx, dy) = displacement_grid(max_displacement_for(k)?);
			let p = softmax_channels(z);
			let mut flow = Array4::<f32>::zeros((n, 2, h, w));
			for (c, (&ox, &oy)) in dx.iter().zip(&dy).enumerate() {
				let pk = p.index_axis(Axis(1), c);
				Zip::from(flow.index_axis_mut(Axis(1), 0)).and(&pk).for_each(|u, &pv| *u += pv * ox);
				Zip::from(flow.index_axis_mut(Axis(1), 1)).and(&pk).for_each(|v, &pv| *v += pv * oy);
			}
			self.probs.push(p);
			flows.push(flow);
		}
		Ok(flows)
	}

	fn backward(&mut self, flow_grads: &[Array4<f32>]) -> Result<Vec<Array4<f32>>> {
		if flow_grads.len() != self.probs.len() {
			return Err(FlowError::shape_mismatch(self.probs.len(), flow_grads.len()));
		}
		let mut grads = Vec::with_capacity(flow_grads.len());
		for (p, g) in self.probs.drain(..).zip(flow_grads) {
			let (n, k, h, w) = p.dim();
			if g.dim() != (n, 2, h, w) {
				return Err(FlowError::shape_mismatch((n, 2, h, w), g.dim()));
			}
			let (dx, dy) = displacement_grid(max_displacement_for(k)?);

			let mut u = Array4::<f32>::zeros((n, 1, h, w));
			let mut v = Array4::<f32>::zeros((n, 1, h, w));
			for (c, (&ox, &oy)) in dx.iter().zip(&dy).enumerate() {
				let pk = p.index_axis(Axis(1), c);
				Zip::from(u.index_axis_mut(Axis(1), 0)).and(&pk).for_each(|a, &pv| *a += pv * ox);
				Zip::from(v.index_axis_mut(Axis(1), 0)).and(&pk).for_each(|a, &pv| *a += pv * oy);
			}

			// dz_k = p_k * ((dx_k - u) * gu + (dy_k - v) * gv)
			let mut dz = p.clone();
			let (gu, gv) = (g.index_axis(Axis(1), 0), g.index_axis(Axis(1), 1));
			let (u, v) = (u.index_axis(Axis(1), 0), v.index_axis(Axis(1), 0));
			for (c, (&ox, &oy)) in dx.iter().zip(&dy).enumerate() {
				Zip::from(dz.index_axis_mut(Axis(1), c))
					.and(&u)
					.and(&v)
					.and(&gu)
					.and(&gv)
					.for_each(|d, &uu, &vv, &a, &b| *d *= (ox - uu) * a + (oy - vv) * b);
			}
			grads.push(dz);
		}
		Ok(grads)
	}

	fn clone_box(&self) -> Box<dyn Decoder> {
		Box::new(self.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn peaked_logits_give_that_displacement() {
		let mut decoder = SoftArgmaxDecoder::new(SoftArgmaxDecoderArgs::default()).unwrap();
		let mut logits = Array4::<f32>::zeros((1, 9, 2, 2));
		// d = 1: channel 5 is (dy, dx) = (0, +1)
		logits.index_axis_mut(Axis(1), 5).fill(50.0);
		let flow = decoder.forward(&[logits]).unwrap().remove(0);
		assert!((flow[[0, 0, 1, 1]] - 1.0).abs() < 1e-4);
		assert!(flow[[0, 1, 1, 1]].abs() < 1e-4);
	}

	#[test]
	fn backward_matches_finite_differences() {
		let mut decoder = SoftArgmaxDecoder::new(SoftArgmaxDecoderArgs::default()).unwrap();
		let z = Array4::from_shape_fn((1, 9, 2, 3), |(_, k, y, x)| ((k * 3 + y + x * 2) % 5) as f32 * 0.4);
		let weights = Array4::from_shape_fn((1, 2, 2, 3), |(_, c, y, x)| (c + y + x) as f32 - 1.5);
		decoder.forward(&[z.clone()]).unwrap();
		let dz = decoder.backward(&[weights.clone()]).unwrap().remove(0);

		let eps = 1e-2;
		let mut loss = |z: Array4<f32>| (decoder.forward(&[z]).unwrap().remove(0) * &weights).sum();
		let idx = [0, 4, 1, 2];
		let (mut zp, mut zm) = (z.clone(), z.clone());
		zp[idx] += eps;
		zm[idx] -= eps;
		let numeric = (loss(zp) - loss(zm)) / (2.0 * eps);
		assert!((numeric - dz[idx]).abs() < 1e-3);
	}

	#[test]
	fn rejects_non_square_grids() {
		assert!(max_displacement_for(8).is_err());
		assert!(max_displacement_for(16).is_err());
		assert_eq!(max_displacement_for(81).unwrap(), 4);
	}
}
