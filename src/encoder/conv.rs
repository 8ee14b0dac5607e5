use ndarray::Array4;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{accumulate, Encoder};
use crate::constants::model;
use crate::error::{FlowError, Result};
use crate::nn::{ConvBlock, Layer, Module, NormKind, Param};
use crate::registry::{Configurable, Registries};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BasicConvEncoderArgs {
	pub in_channels: usize,
	/// Output channels of each stage; one pyramid level per entry.
	pub channels: Vec<usize>,
	/// Stride of the first stage. Later stages always halve the resolution.
	pub first_stride: usize,
	pub norm: NormKind,
	pub seed: u64,
}

impl Default for BasicConvEncoderArgs {
	fn default() -> Self {
		Self {
			in_channels: 3,
			channels: vec![16, 32, 64],
			first_stride: 2,
			norm: NormKind::Batch,
			seed: 0,
		}
	}
}

/// A stack of strided conv + norm + leaky ReLU stages.
#[derive(Debug, Clone)]
pub struct BasicConvEncoder {
	stages: Vec<ConvBlock>,
	input_dim: Option<(usize, usize, usize, usize)>,
}

impl BasicConvEncoder {
	pub fn new(args: BasicConvEncoderArgs) -> Result<Self> {
		if args.channels.is_empty() {
			return Err(FlowError::InvalidParameter(
				"BasicConvEncoder needs at least one stage".into(),
			));
		}
		let mut rng = StdRng::seed_from_u64(args.seed);
		let mut stages = Vec::with_capacity(args.channels.len());
		let mut in_channels = args.in_channels;
		for (i, &out_channels) in args.channels.iter().enumerate() {
			let stride = if i == 0 { args.first_stride } else { 2 };
			stages.push(ConvBlock::new(
				&format!("stages.{}", i),
				in_channels,
				out_channels,
				3,
				stride,
				args.norm,
				model::LEAKY_SLOPE,
				&mut rng,
			)?);
			in_channels = out_channels;
		}
		Ok(BasicConvEncoder {
			stages,
			input_dim: None,
		})
	}
}

impl Configurable for BasicConvEncoder {
	type Args = BasicConvEncoderArgs;

	fn from_args(args: Self::Args, _registries: &Registries) -> Result<Self> {
		Self::new(args)
	}
}

impl Module for BasicConvEncoder {
	fn params(&self) -> Vec<&Param> {
		self.stages.iter().flat_map(|s| s.params()).collect()
	}

	fn params_mut(&mut self) -> Vec<&mut Param> {
		self.stages.iter_mut().flat_map(|s| s.params_mut()).collect()
	}

	fn set_training(&mut self, training: bool) {
		self.stages.iter_mut().for_each(|s| s.set_training(training));
	}
}

impl Encoder for BasicConvEncoder {
	fn forward(&mut self, x: &Array4<f32>) -> Result<Vec<Array4<f32>>> {
		self.input_dim = Some(x.dim());
		let mut pyramid = Vec::with_capacity(self.stages.len());
		let mut h = x.clone();
		for stage in self.stages.iter_mut() {
			h = stage.forward(&h)?;
			pyramid.push(h.clone());
		}
		Ok(pyramid)
	}

	fn backward(&mut self, mut grads: Vec<Option<Array4<f32>>>) -> Result<Array4<f32>> {
		if grads.len() != self.stages.len() {
			return Err(FlowError::shape_mismatch(self.stages.len(), grads.len()));
		}
		let input_dim = self
			.input_dim
			.ok_or_else(|| FlowError::InvalidState("encoder backward before forward".into()))?;
		let mut carry = None;
		for (i, stage) in self.stages.iter_mut().enumerate().rev() {
			carry = match accumulate(carry, grads[i].take()) {
				Some(g) => Some(stage.backward(&g)?),
				None => None,
			};
		}
		Ok(carry.unwrap_or_else(|| Array4::zeros(input_dim)))
	}

	fn out_channels(&self) -> Vec<usize> {
		self.stages.iter().map(|s| s.out_channels()).collect()
	}

	fn clone_box(&self) -> Box<dyn Encoder> {
		Box::new(self.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pyramid_halves_each_level() {
		let mut encoder = BasicConvEncoder::new(BasicConvEncoderArgs {
			norm: NormKind::Instance,
			..Default::default()
		})
		.unwrap();
		let pyramid = encoder.forward(&Array4::zeros((2, 3, 16, 24))).unwrap();
		let dims: Vec<_> = pyramid.iter().map(|p| p.dim()).collect();
		assert_eq!(dims, vec![(2, 16, 8, 12), (2, 32, 4, 6), (2, 64, 2, 3)]);
		assert_eq!(encoder.out_channels(), vec![16, 32, 64]);
	}

	#[test]
	fn backward_without_gradients_returns_zeros() {
		let mut encoder = BasicConvEncoder::new(BasicConvEncoderArgs {
			channels: vec![4, 8],
			norm: NormKind::None,
			..Default::default()
		})
		.unwrap();
		encoder.forward(&Array4::ones((1, 3, 8, 8))).unwrap();
		let dx = encoder.backward(vec![None, None]).unwrap();
		assert_eq!(dx.dim(), (1, 3, 8, 8));
		assert!(dx.iter().all(|&v| v == 0.0));
	}
}
