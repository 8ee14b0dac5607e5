use ndarray::Array4;
use rand::Rng;

use super::{Activation, Conv2d, Layer, Module, Norm2d, NormKind, Param};
use crate::error::Result;

/// Convolution, normalisation and (leaky) ReLU.
#[derive(Debug, Clone)]
pub struct ConvBlock {
	conv: Conv2d,
	norm: Norm2d,
	act: Activation,
}

impl ConvBlock {
	#[allow(clippy::too_many_arguments)]
	pub fn new<R: Rng + ?Sized>(
		name: &str,
		in_channels: usize,
		out_channels: usize,
		kernel_size: usize,
		stride: usize,
		norm: NormKind,
		negative_slope: f32,
		rng: &mut R,
	) -> Result<Self> {
		let mut conv = Conv2d::new(
			&format!("{}.conv", name),
			in_channels,
			out_channels,
			kernel_size,
			stride,
			negative_slope,
			rng,
		);
		// the norm shift makes the conv bias redundant
		if norm != NormKind::None {
			conv = conv.without_bias();
		}
		Ok(ConvBlock {
			conv,
			norm: Norm2d::new(&format!("{}.norm", name), norm, out_channels)?,
			act: Activation::leaky(negative_slope),
		})
	}

	pub fn out_channels(&self) -> usize {
		self.conv.out_channels()
	}
}

impl Module for ConvBlock {
	fn params(&self) -> Vec<&Param> {
		let mut params = self.conv.params();
		params.extend(self.norm.params());
		params
	}

	fn params_mut(&mut self) -> Vec<&mut Param> {
		let mut params = self.conv.params_mut();
		params.extend(self.norm.params_mut());
		params
	}

	fn set_training(&mut self, training: bool) {
		self.norm.set_training(training);
	}
}

impl Layer for ConvBlock {
	fn forward(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
		let x = self.conv.forward(input)?;
		let x = self.norm.forward(&x)?;
		self.act.forward(&x)
	}

	fn backward(&mut self, grad_output: &Array4<f32>) -> Result<Array4<f32>> {
		let g = self.act.backward(grad_output)?;
		let g = self.norm.backward(&g)?;
		self.conv.backward(&g)
	}
}

#[derive(Debug, Clone)]
struct Downsample {
	conv: Conv2d,
	norm: Norm2d,
}

/// ResNet basic block: two 3x3 convolutions with a projected skip connection
/// whenever the stride or channel count changes.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
	conv1: Conv2d,
	norm1: Norm2d,
	relu1: Activation,
	conv2: Conv2d,
	norm2: Norm2d,
	relu2: Activation,
	downsample: Option<Downsample>,
	out_relu: Activation,
}

impl ResidualBlock {
	pub fn new<R: Rng + ?Sized>(
		name: &str,
		in_channels: usize,
		out_channels: usize,
		norm: NormKind,
		stride: usize,
		rng: &mut R,
	) -> Result<Self> {
		let downsample = if stride != 1 || in_channels != out_channels {
			Some(Downsample {
				conv: Conv2d::new(&format!("{}.downsample.conv", name), in_channels, out_channels, 1, stride, 0.0, rng),
				norm: Norm2d::new(&format!("{}.downsample.norm", name), norm, out_channels)?,
			})
		} else {
			None
		};
		Ok(ResidualBlock {
			conv1: Conv2d::new(&format!("{}.conv1", name), in_channels, out_channels, 3, stride, 0.0, rng),
			norm1: Norm2d::new(&format!("{}.norm1", name), norm, out_channels)?,
			relu1: Activation::relu(),
			conv2: Conv2d::new(&format!("{}.conv2", name), out_channels, out_channels, 3, 1, 0.0, rng),
			norm2: Norm2d::new(&format!("{}.norm2", name), norm, out_channels)?,
			relu2: Activation::relu(),
			downsample,
			out_relu: Activation::relu(),
		})
	}

	pub fn out_channels(&self) -> usize {
		self.conv2.out_channels()
	}
}

impl Module for ResidualBlock {
	fn params(&self) -> Vec<&Param> {
		let mut params = self.conv1.params();
		params.extend(self.norm1.params());
		params.extend(self.conv2.params());
		params.extend(self.norm2.params());
		if let Some(ds) = &self.downsample {
			params.extend(ds.conv.params());
			params.extend(ds.norm.params());
		}
		params
	}

	fn params_mut(&mut self) -> Vec<&mut Param> {
		let mut params = self.conv1.params_mut();
		params.extend(self.norm1.params_mut());
		params.extend(self.conv2.params_mut());
		params.extend(self.norm2.params_mut());
		if let Some(ds) = &mut self.downsample {
			params.extend(ds.conv.params_mut());
			params.extend(ds.norm.params_mut());
		}
		params
	}

	fn set_training(&mut self, training: bool) {
		self.norm1.set_training(training);
		self.norm2.set_training(training);
		if let Some(ds) = &mut self.downsample {
			ds.norm.set_training(training);
		}
	}
}

impl Layer for ResidualBlock {
	fn forward(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
		let y = self.conv1.forward(input)?;
		let y = self.relu1.forward(&self.norm1.forward(&y)?)?;
		let y = self.conv2.forward(&y)?;
		let y = self.relu2.forward(&self.norm2.forward(&y)?)?;

		let skip = match &mut self.downsample {
			Some(ds) => {
				let s = ds.conv.forward(input)?;
				ds.norm.forward(&s)?
			}
			None => input.clone(),
		};
		self.out_relu.forward(&(skip + &y))
	}

	fn backward(&mut self, grad_output: &Array4<f32>) -> Result<Array4<f32>> {
		let g = self.out_relu.backward(grad_output)?;

		let gm = self.relu2.backward(&g)?;
		let gm = self.conv2.backward(&self.norm2.backward(&gm)?)?;
		let gm = self.relu1.backward(&gm)?;
		let gm = self.conv1.backward(&self.norm1.backward(&gm)?)?;

		let gs = match &mut self.downsample {
			Some(ds) => {
				let s = ds.norm.backward(&g)?;
				ds.conv.backward(&s)?
			}
			None => g,
		};
		Ok(gm + &gs)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rand::rngs::StdRng;
	use rand::SeedableRng;

	#[test]
	fn strided_block_projects_skip() {
		let mut rng = StdRng::seed_from_u64(0);
		let mut block = ResidualBlock::new("layer1.0", 8, 16, NormKind::Instance, 2, &mut rng).unwrap();
		let x = Array4::from_shape_fn((1, 8, 6, 6), |(_, c, y, x)| ((c + y + x) % 5) as f32 * 0.2);
		let y = block.forward(&x).unwrap();
		assert_eq!(y.dim(), (1, 16, 3, 3));
		assert!(y.iter().all(|&v| v >= 0.0));
		let dx = block.backward(&Array4::ones(y.raw_dim())).unwrap();
		assert_eq!(dx.dim(), x.dim());
		assert!(block.params().iter().any(|p| p.name == "layer1.0.downsample.conv.weight"));
	}

	#[test]
	fn conv_block_gradient_matches_finite_difference() {
		let mut rng = StdRng::seed_from_u64(5);
		let mut block = ConvBlock::new("blk", 2, 4, 3, 1, NormKind::None, 0.1, &mut rng).unwrap();
		let x = Array4::from_shape_fn((1, 2, 4, 4), |(_, c, y, x)| ((c * 3 + y * 2 + x) % 7) as f32 * 0.3 - 0.8);
		let y = block.forward(&x).unwrap();
		let dx = block.backward(&Array4::ones(y.raw_dim())).unwrap();

		let eps = 1e-3;
		let mut xp = x.clone();
		xp[[0, 1, 1, 2]] += eps;
		let mut xm = x.clone();
		xm[[0, 1, 1, 2]] -= eps;
		let numeric = (block.forward(&xp).unwrap().sum() - block.forward(&xm).unwrap().sum()) / (2.0 * eps);
		assert!((numeric - dx[[0, 1, 1, 2]]).abs() < 2e-2);
	}
}
