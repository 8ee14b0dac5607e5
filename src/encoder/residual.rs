use ndarray::Array4;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{accumulate, Encoder};
use crate::error::{FlowError, Result};
use crate::nn::{Activation, Conv2d, Layer, Module, Norm2d, NormKind, Param, ResidualBlock};
use crate::registry::{Configurable, Registries};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BasicEncoderArgs {
	pub in_channels: usize,
	/// Width of the 1x1 head applied to the coarsest stage.
	pub out_channels: usize,
	pub norm: NormKind,
	/// Channels of each residual stage.
	pub layer_config: Vec<usize>,
	pub seed: u64,
}

impl Default for BasicEncoderArgs {
	fn default() -> Self {
		Self {
			in_channels: 3,
			out_channels: 64,
			norm: NormKind::Batch,
			layer_config: vec![32, 48, 64],
			seed: 0,
		}
	}
}

#[derive(Debug, Clone)]
struct Stage {
	blocks: [ResidualBlock; 2],
}

impl Stage {
	fn forward(&mut self, x: &Array4<f32>) -> Result<Array4<f32>> {
		let y = self.blocks[0].forward(x)?;
		self.blocks[1].forward(&y)
	}

	fn backward(&mut self, g: &Array4<f32>) -> Result<Array4<f32>> {
		let g = self.blocks[1].backward(g)?;
		self.blocks[0].backward(&g)
	}
}

/// ResNet style encoder built from basic residual blocks.
///
/// A 7x7 stride-2 stem is followed by two blocks per stage; the first stage
/// keeps the stem resolution and every later stage halves it. The coarsest
/// level goes through a 1x1 head. One pyramid level is produced per stage.
#[derive(Debug, Clone)]
pub struct BasicEncoder {
	stem: Conv2d,
	stem_norm: Norm2d,
	stem_relu: Activation,
	stages: Vec<Stage>,
	head: Conv2d,
	input_dim: Option<(usize, usize, usize, usize)>,
}

impl BasicEncoder {
	pub fn new(args: BasicEncoderArgs) -> Result<Self> {
		let (first, last) = match (args.layer_config.first(), args.layer_config.last()) {
			(Some(&first), Some(&last)) => (first, last),
			_ => {
				return Err(FlowError::InvalidParameter(
					"BasicEncoder layer_config must not be empty".into(),
				))
			}
		};
		let mut rng = StdRng::seed_from_u64(args.seed);
		let stem = Conv2d::new("stem.conv", args.in_channels, first, 7, 2, 0.0, &mut rng);
		let stem_norm = Norm2d::new("stem.norm", args.norm, first)?;

		let mut stages = Vec::with_capacity(args.layer_config.len());
		let mut in_channels = first;
		for (i, &channels) in args.layer_config.iter().enumerate() {
			let stride = if i == 0 { 1 } else { 2 };
			stages.push(Stage {
				blocks: [
					ResidualBlock::new(&format!("layer{}.0", i + 1), in_channels, channels, args.norm, stride, &mut rng)?,
					ResidualBlock::new(&format!("layer{}.1", i + 1), channels, channels, args.norm, 1, &mut rng)?,
				],
			});
			in_channels = channels;
		}
		let head = Conv2d::new("head", last, args.out_channels, 1, 1, 0.0, &mut rng);

		Ok(BasicEncoder {
			stem,
			stem_norm,
			stem_relu: Activation::relu(),
			stages,
			head,
			input_dim: None,
		})
	}
}

impl Configurable for BasicEncoder {
	type Args = BasicEncoderArgs;

	fn from_args(args: Self::Args, _registries: &Registries) -> Result<Self> {
		Self::new(args)
	}
}

impl Module for BasicEncoder {
	fn params(&self) -> Vec<&Param> {
		let mut params = self.stem.params();
		params.extend(self.stem_norm.params());
		for stage in &self.stages {
			for block in &stage.blocks {
				params.extend(block.params());
			}
		}
		params.extend(self.head.params());
		params
	}

	fn params_mut(&mut self) -> Vec<&mut Param> {
		let mut params = self.stem.params_mut();
		params.extend(self.stem_norm.params_mut());
		for stage in &mut self.stages {
			for block in &mut stage.blocks {
				params.extend(block.params_mut());
			}
		}
		params.extend(self.head.params_mut());
		params
	}

	fn set_training(&mut self, training: bool) {
		self.stem_norm.set_training(training);
		for stage in &mut self.stages {
			stage.blocks.iter_mut().for_each(|b| b.set_training(training));
		}
	}
}

impl Encoder for BasicEncoder {
	fn forward(&mut self, x: &Array4<f32>) -> Result<Vec<Array4<f32>>> {
		self.input_dim = Some(x.dim());
		let h = self.stem.forward(x)?;
		let mut h = self.stem_relu.forward(&self.stem_norm.forward(&h)?)?;

		let mut pyramid = Vec::with_capacity(self.stages.len());
		for stage in self.stages.iter_mut() {
			h = stage.forward(&h)?;
			pyramid.push(h.clone());
		}
		if let Some(top) = pyramid.last_mut() {
			*top = self.head.forward(top)?;
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

		let top = grads.len() - 1;
		grads[top] = match grads[top].take() {
			Some(g) => Some(self.head.backward(&g)?),
			None => None,
		};

		let mut carry = None;
		for (i, stage) in self.stages.iter_mut().enumerate().rev() {
			carry = match accumulate(carry, grads[i].take()) {
				Some(g) => Some(stage.backward(&g)?),
				None => None,
			};
		}

		match carry {
			Some(g) => {
				let g = self.stem_relu.backward(&g)?;
				self.stem.backward(&self.stem_norm.backward(&g)?)
			}
			None => Ok(Array4::zeros(input_dim)),
		}
	}

	fn out_channels(&self) -> Vec<usize> {
		let mut channels: Vec<usize> = self.stages.iter().map(|s| s.blocks[1].out_channels()).collect();
		if let Some(top) = channels.last_mut() {
			*top = self.head.out_channels();
		}
		channels
	}

	fn clone_box(&self) -> Box<dyn Encoder> {
		Box::new(self.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn small() -> BasicEncoder {
		BasicEncoder::new(BasicEncoderArgs {
			out_channels: 12,
			norm: NormKind::Group,
			layer_config: vec![8, 16],
			..Default::default()
		})
		.unwrap()
	}

	#[test]
	fn head_sets_coarsest_width() {
		let mut encoder = small();
		let pyramid = encoder.forward(&Array4::zeros((1, 3, 16, 16))).unwrap();
		assert_eq!(pyramid[0].dim(), (1, 8, 8, 8));
		assert_eq!(pyramid[1].dim(), (1, 12, 4, 4));
		assert_eq!(encoder.out_channels(), vec![8, 12]);
	}

	#[test]
	fn same_seed_gives_same_weights() {
		let a = crate::nn::state_dict(&small());
		let b = crate::nn::state_dict(&small());
		assert_eq!(a, b);
	}

	#[test]
	fn gradient_reaches_input() {
		let mut encoder = small();
		let x = Array4::from_shape_fn((1, 3, 16, 16), |(_, c, y, x)| ((c + y * x) % 9) as f32 * 0.1);
		let pyramid = encoder.forward(&x).unwrap();
		let grads = pyramid.iter().map(|p| Some(Array4::ones(p.raw_dim()))).collect();
		let dx = encoder.backward(grads).unwrap();
		assert_eq!(dx.dim(), x.dim());
		assert!(dx.iter().any(|&v| v != 0.0));
	}
}
