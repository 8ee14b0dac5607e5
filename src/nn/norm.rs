use ndarray::{s, Array4, Zip};

use super::{init, Layer, Module, Param};
use crate::constants::model;
use crate::error::{FlowError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormKind {
	Batch,
	Instance,
	Group,
	None,
}

impl Default for NormKind {
	fn default() -> Self {
		NormKind::Batch
	}
}

#[derive(Debug, Clone)]
struct NormCache {
	xhat: Array4<f32>,
	invstd: Vec<f32>,
	group_len: usize,
	batch_stats: bool,
}

/// Batch, instance or group normalisation with a per-channel affine transform.
///
/// Scales start at 1 and shifts at 0. Only batch normalisation keeps running
/// statistics; the other kinds always normalise with the current sample.
#[derive(Debug, Clone)]
pub struct Norm2d {
	kind: NormKind,
	channels: usize,
	groups: usize,
	weight: Param,
	bias: Param,
	running_mean: Param,
	running_var: Param,
	training: bool,
	cache: Option<NormCache>,
}

impl Norm2d {
	pub fn new(name: &str, kind: NormKind, channels: usize) -> Result<Self> {
		let groups = match kind {
			NormKind::Group => {
				let groups = model::GROUP_NORM_GROUPS.min(channels);
				if channels % groups != 0 {
					return Err(FlowError::InvalidParameter(format!(
						"{}: group norm needs channels ({}) divisible by {}",
						name, channels, groups
					)));
				}
				groups
			}
			_ => 1,
		};
		Ok(Norm2d {
			kind,
			channels,
			groups,
			weight: Param::new(format!("{}.weight", name), init::constant(&[channels], 1.0)),
			bias: Param::new(format!("{}.bias", name), init::constant(&[channels], 0.0)),
			running_mean: Param::buffer(format!("{}.running_mean", name), init::constant(&[channels], 0.0)),
			running_var: Param::buffer(format!("{}.running_var", name), init::constant(&[channels], 1.0)),
			training: true,
			cache: None,
		})
	}

	pub fn kind(&self) -> NormKind {
		self.kind
	}

	fn num_groups(&self, batch: usize) -> usize {
		match self.kind {
			NormKind::Batch | NormKind::None => self.channels,
			NormKind::Instance => batch * self.channels,
			NormKind::Group => batch * self.groups,
		}
	}

	fn group_of(&self, b: usize, c: usize) -> usize {
		match self.kind {
			NormKind::Batch | NormKind::None => c,
			NormKind::Instance => b * self.channels + c,
			NormKind::Group => b * self.groups + c / (self.channels / self.groups),
		}
	}

	fn group_len(&self, n: usize, h: usize, w: usize) -> usize {
		match self.kind {
			NormKind::Batch | NormKind::None => n * h * w,
			NormKind::Instance => h * w,
			NormKind::Group => (self.channels / self.groups) * h * w,
		}
	}
}

impl Module for Norm2d {
	fn params(&self) -> Vec<&Param> {
		match self.kind {
			NormKind::None => Vec::new(),
			NormKind::Batch => vec![&self.weight, &self.bias, &self.running_mean, &self.running_var],
			_ => vec![&self.weight, &self.bias],
		}
	}

	fn params_mut(&mut self) -> Vec<&mut Param> {
		match self.kind {
			NormKind::None => Vec::new(),
			NormKind::Batch => vec![
				&mut self.weight,
				&mut self.bias,
				&mut self.running_mean,
				&mut self.running_var,
			],
			_ => vec![&mut self.weight, &mut self.bias],
		}
	}

	fn set_training(&mut self, training: bool) {
		self.training = training;
	}
}

impl Layer for Norm2d {
	fn forward(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
		if self.kind == NormKind::None {
			return Ok(input.clone());
		}
		let (n, c, h, w) = input.dim();
		if c != self.channels {
			return Err(FlowError::shape_mismatch(self.channels, c));
		}

		let batch_stats = self.training || self.kind != NormKind::Batch;
		let ng = self.num_groups(n);
		let group_len = self.group_len(n, h, w);
		let mut mean = vec![0.0f32; ng];
		let mut var = vec![0.0f32; ng];

		if batch_stats {
			for b in 0..n {
				for ch in 0..c {
					mean[self.group_of(b, ch)] += input.slice(s![b, ch, .., ..]).sum();
				}
			}
			mean.iter_mut().for_each(|m| *m /= group_len as f32);
			for b in 0..n {
				for ch in 0..c {
					let mu = mean[self.group_of(b, ch)];
					var[self.group_of(b, ch)] += input.slice(s![b, ch, .., ..]).fold(0.0, |acc, &v| acc + (v - mu) * (v - mu));
				}
			}
			var.iter_mut().for_each(|v| *v /= group_len as f32);

			if self.kind == NormKind::Batch && self.training {
				let momentum = model::NORM_MOMENTUM;
				let unbias = if group_len > 1 {
					group_len as f32 / (group_len - 1) as f32
				} else {
					1.0
				};
				for ch in 0..c {
					let rm = &mut self.running_mean.value[[ch]];
					*rm = (1.0 - momentum) * *rm + momentum * mean[ch];
					let rv = &mut self.running_var.value[[ch]];
					*rv = (1.0 - momentum) * *rv + momentum * var[ch] * unbias;
				}
			}
		} else {
			for ch in 0..c {
				mean[ch] = self.running_mean.value[[ch]];
				var[ch] = self.running_var.value[[ch]];
			}
		}

		let invstd: Vec<f32> = var.iter().map(|v| 1.0 / (v + model::NORM_EPSILON).sqrt()).collect();
		let mut xhat = input.clone();
		let mut out = Array4::<f32>::zeros(input.raw_dim());
		for b in 0..n {
			for ch in 0..c {
				let g = self.group_of(b, ch);
				let (mu, is) = (mean[g], invstd[g]);
				let (gamma, beta) = (self.weight.value[[ch]], self.bias.value[[ch]]);
				let mut xh = xhat.slice_mut(s![b, ch, .., ..]);
				xh.mapv_inplace(|v| (v - mu) * is);
				Zip::from(out.slice_mut(s![b, ch, .., ..]))
					.and(&xh)
					.for_each(|o, &x| *o = x * gamma + beta);
			}
		}

		self.cache = Some(NormCache {
			xhat,
			invstd,
			group_len,
			batch_stats,
		});
		Ok(out)
	}

	fn backward(&mut self, grad_output: &Array4<f32>) -> Result<Array4<f32>> {
		if self.kind == NormKind::None {
			return Ok(grad_output.clone());
		}
		let cache = self
			.cache
			.take()
			.ok_or_else(|| FlowError::InvalidState(format!("{} backward before forward", self.weight.name)))?;
		if cache.xhat.dim() != grad_output.dim() {
			return Err(FlowError::shape_mismatch(cache.xhat.dim(), grad_output.dim()));
		}
		let (n, c, _, _) = grad_output.dim();

		let mut dxhat = grad_output.clone();
		for ch in 0..c {
			let g = grad_output.slice(s![.., ch, .., ..]);
			let xh = cache.xhat.slice(s![.., ch, .., ..]);
			self.weight.grad[[ch]] += Zip::from(&g).and(&xh).fold(0.0, |acc, &gv, &xv| acc + gv * xv);
			self.bias.grad[[ch]] += g.sum();
			let gamma = self.weight.value[[ch]];
			dxhat.slice_mut(s![.., ch, .., ..]).mapv_inplace(|v| v * gamma);
		}

		if !cache.batch_stats {
			for b in 0..n {
				for ch in 0..c {
					let is = cache.invstd[self.group_of(b, ch)];
					dxhat.slice_mut(s![b, ch, .., ..]).mapv_inplace(|v| v * is);
				}
			}
			return Ok(dxhat);
		}

		let ng = self.num_groups(n);
		let mut sum_dxhat = vec![0.0f32; ng];
		let mut sum_dxhat_xhat = vec![0.0f32; ng];
		for b in 0..n {
			for ch in 0..c {
				let g = self.group_of(b, ch);
				let d = dxhat.slice(s![b, ch, .., ..]);
				let xh = cache.xhat.slice(s![b, ch, .., ..]);
				sum_dxhat[g] += d.sum();
				sum_dxhat_xhat[g] += Zip::from(&d).and(&xh).fold(0.0, |acc, &dv, &xv| acc + dv * xv);
			}
		}

		let m = cache.group_len as f32;
		let mut dx = dxhat;
		for b in 0..n {
			for ch in 0..c {
				let g = self.group_of(b, ch);
				let (s1, s2, is) = (sum_dxhat[g], sum_dxhat_xhat[g], cache.invstd[g]);
				Zip::from(dx.slice_mut(s![b, ch, .., ..]))
					.and(cache.xhat.slice(s![b, ch, .., ..]))
					.for_each(|d, &xh| *d = is / m * (m * *d - s1 - xh * s2));
			}
		}
		Ok(dx)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample() -> Array4<f32> {
		Array4::from_shape_fn((2, 8, 3, 3), |(b, c, y, x)| (b * 7 + c * 3 + y * 2 + x) as f32 * 0.37 % 5.0)
	}

	#[test]
	fn batch_norm_output_is_standardised() {
		let mut norm = Norm2d::new("bn", NormKind::Batch, 8).unwrap();
		let y = norm.forward(&sample()).unwrap();
		let channel = y.slice(s![.., 0, .., ..]);
		let mean = channel.sum() / channel.len() as f32;
		assert!(mean.abs() < 1e-4);
		assert!(norm.running_mean.value[[0]] != 0.0);
		assert!(!norm.running_mean.trainable);
	}

	#[test]
	fn eval_mode_uses_running_statistics() {
		let mut norm = Norm2d::new("bn", NormKind::Batch, 8).unwrap();
		norm.set_training(false);
		let x = sample();
		let y = norm.forward(&x).unwrap();
		let scale = 1.0 / (1.0 + model::NORM_EPSILON).sqrt();
		assert!((y[[1, 2, 1, 1]] - x[[1, 2, 1, 1]] * scale).abs() < 1e-5);
	}

	#[test]
	fn group_norm_gradient_matches_finite_difference() {
		for kind in [NormKind::Group, NormKind::Instance, NormKind::Batch] {
			let mut norm = Norm2d::new("gn", kind, 8).unwrap();
			let x = sample();
			// weighted sum so the gradient is not trivially zero
			let weights = Array4::from_shape_fn(x.raw_dim(), |(b, c, y, x)| ((b + c + y * x) % 4) as f32 - 1.5);
			norm.forward(&x).unwrap();
			let dx = norm.backward(&weights).unwrap();

			let eps = 1e-2;
			let loss = |norm: &mut Norm2d, x: &Array4<f32>| (norm.forward(x).unwrap() * &weights).sum();
			let mut xp = x.clone();
			xp[[1, 3, 2, 0]] += eps;
			let mut xm = x.clone();
			xm[[1, 3, 2, 0]] -= eps;
			let numeric = (loss(&mut norm, &xp) - loss(&mut norm, &xm)) / (2.0 * eps);
			assert!((numeric - dx[[1, 3, 2, 0]]).abs() < 2e-2, "{:?}: {} vs {}", kind, numeric, dx[[1, 3, 2, 0]]);
		}
	}

	#[test]
	fn group_norm_rejects_indivisible_channels() {
		assert!(Norm2d::new("gn", NormKind::Group, 12).is_err());
	}
}
