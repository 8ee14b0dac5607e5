use ndarray::parallel::prelude::*;
use ndarray::{Array2, Array4, Axis, Ix1, IxDyn};
use rand::Rng;

use super::{init, Layer, Module, Param};
use crate::error::{FlowError, Result};

#[derive(Debug, Clone)]
struct ConvCache {
	cols: Array2<f32>,
	input_dim: (usize, usize, usize, usize),
	out_hw: (usize, usize),
}

/// 2D convolution implemented as im2col followed by a matrix product.
#[derive(Debug, Clone)]
pub struct Conv2d {
	weight: Param,
	bias: Option<Param>,
	in_channels: usize,
	out_channels: usize,
	kernel_size: usize,
	stride: usize,
	padding: usize,
	cache: Option<ConvCache>,
}

impl Conv2d {
	/// Padding defaults to `kernel_size / 2` so stride 1 preserves the spatial size.
	pub fn new<R: Rng + ?Sized>(
		name: &str,
		in_channels: usize,
		out_channels: usize,
		kernel_size: usize,
		stride: usize,
		negative_slope: f32,
		rng: &mut R,
	) -> Self {
		let shape = [out_channels, in_channels, kernel_size, kernel_size];
		Conv2d {
			weight: Param::new(
				format!("{}.weight", name),
				init::kaiming_normal_fan_out(&shape, negative_slope, rng),
			),
			bias: Some(Param::new(format!("{}.bias", name), init::constant(&[out_channels], 0.0))),
			in_channels,
			out_channels,
			kernel_size,
			stride: stride.max(1),
			padding: kernel_size / 2,
			cache: None,
		}
	}

	pub fn without_bias(mut self) -> Self {
		self.bias = None;
		self
	}

	pub fn out_channels(&self) -> usize {
		self.out_channels
	}

	pub fn output_size(&self, h: usize, w: usize) -> Result<(usize, usize)> {
		let k = self.kernel_size;
		if h + 2 * self.padding < k || w + 2 * self.padding < k {
			return Err(FlowError::shape_mismatch(
				format!("spatial size >= {}", k),
				(h, w),
			));
		}
		Ok((
			(h + 2 * self.padding - k) / self.stride + 1,
			(w + 2 * self.padding - k) / self.stride + 1,
		))
	}

	/// Rows of the column matrix are filled in parallel, one per `(channel, ki, kj)`.
	fn im2col(&self, x: &Array4<f32>, ho: usize, wo: usize) -> Array2<f32> {
		let (n, c, h, w) = x.dim();
		let k = self.kernel_size;
		let (s, p) = (self.stride as isize, self.padding as isize);
		let mut cols = Array2::<f32>::zeros((c * k * k, n * ho * wo));
		cols.axis_iter_mut(Axis(0))
			.into_par_iter()
			.enumerate()
			.for_each(|(row, mut line)| {
				let (ch, ki, kj) = (row / (k * k), (row / k) % k, row % k);
				for b in 0..n {
					for oy in 0..ho {
						let iy = oy as isize * s + ki as isize - p;
						if iy < 0 || iy >= h as isize {
							continue;
						}
						for ox in 0..wo {
							let ix = ox as isize * s + kj as isize - p;
							if ix < 0 || ix >= w as isize {
								continue;
							}
							line[(b * ho + oy) * wo + ox] = x[[b, ch, iy as usize, ix as usize]];
						}
					}
				}
			});
		cols
	}

	fn col2im(&self, dcols: &Array2<f32>, cache: &ConvCache) -> Array4<f32> {
		let (n, c, h, w) = cache.input_dim;
		let (ho, wo) = cache.out_hw;
		let k = self.kernel_size;
		let (s, p) = (self.stride as isize, self.padding as isize);
		let mut dx = Array4::<f32>::zeros((n, c, h, w));
		dx.axis_iter_mut(Axis(0))
			.into_par_iter()
			.enumerate()
			.for_each(|(b, mut dxb)| {
				for ch in 0..c {
					for ki in 0..k {
						for kj in 0..k {
							let row = (ch * k + ki) * k + kj;
							for oy in 0..ho {
								let iy = oy as isize * s + ki as isize - p;
								if iy < 0 || iy >= h as isize {
									continue;
								}
								for ox in 0..wo {
									let ix = ox as isize * s + kj as isize - p;
									if ix < 0 || ix >= w as isize {
										continue;
									}
									dxb[[ch, iy as usize, ix as usize]] += dcols[[row, (b * ho + oy) * wo + ox]];
								}
							}
						}
					}
				}
			});
		dx
	}

	fn weight_matrix(&self) -> Result<Array2<f32>> {
		let k = self.kernel_size;
		Ok(self
			.weight
			.value
			.view()
			.into_shape((self.out_channels, self.in_channels * k * k))?
			.to_owned())
	}
}

impl Module for Conv2d {
	fn params(&self) -> Vec<&Param> {
		let mut params = vec![&self.weight];
		if let Some(bias) = &self.bias {
			params.push(bias);
		}
		params
	}

	fn params_mut(&mut self) -> Vec<&mut Param> {
		let mut params = vec![&mut self.weight];
		if let Some(bias) = &mut self.bias {
			params.push(bias);
		}
		params
	}
}

impl Layer for Conv2d {
	fn forward(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
		let (n, c, h, w) = input.dim();
		if c != self.in_channels {
			return Err(FlowError::shape_mismatch(
				format!("{} input channels for {}", self.in_channels, self.weight.name),
				c,
			));
		}
		let (ho, wo) = self.output_size(h, w)?;
		let cols = self.im2col(input, ho, wo);
		let mut out = self.weight_matrix()?.dot(&cols);
		if let Some(bias) = &self.bias {
			let bias = bias.value.view().into_dimensionality::<Ix1>()?;
			out += &bias.insert_axis(Axis(1));
		}

		let out = out
			.into_shape((self.out_channels, n, ho, wo))?
			.permuted_axes([1, 0, 2, 3])
			.as_standard_layout()
			.into_owned();

		self.cache = Some(ConvCache {
			cols,
			input_dim: (n, c, h, w),
			out_hw: (ho, wo),
		});
		Ok(out)
	}

	fn backward(&mut self, grad_output: &Array4<f32>) -> Result<Array4<f32>> {
		let cache = self
			.cache
			.take()
			.ok_or_else(|| FlowError::InvalidState(format!("{} backward before forward", self.weight.name)))?;
		let (n, _, _, _) = cache.input_dim;
		let (ho, wo) = cache.out_hw;
		if grad_output.dim() != (n, self.out_channels, ho, wo) {
			return Err(FlowError::shape_mismatch((n, self.out_channels, ho, wo), grad_output.dim()));
		}

		let g = grad_output
			.view()
			.permuted_axes([1, 0, 2, 3])
			.as_standard_layout()
			.into_owned()
			.into_shape((self.out_channels, n * ho * wo))?;

		let k = self.kernel_size;
		let dw = g.dot(&cache.cols.t());
		let dw = dw.into_shape(IxDyn(&[self.out_channels, self.in_channels, k, k]))?;
		self.weight.grad += &dw;
		if let Some(bias) = &mut self.bias {
			bias.grad += &g.sum_axis(Axis(1)).into_dyn();
		}

		let dcols = self.weight_matrix()?.t().dot(&g);
		Ok(self.col2im(&dcols, &cache))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rand::rngs::StdRng;
	use rand::SeedableRng;

	fn conv(k: usize, stride: usize) -> Conv2d {
		Conv2d::new("conv", 1, 1, k, stride, 0.0, &mut StdRng::seed_from_u64(0))
	}

	#[test]
	fn identity_kernel_reproduces_input() {
		let mut layer = conv(3, 1);
		layer.weight.value.fill(0.0);
		layer.weight.value[[0, 0, 1, 1]] = 1.0;
		let x = Array4::from_shape_fn((1, 1, 4, 5), |(_, _, y, x)| (y * 5 + x) as f32);
		let y = layer.forward(&x).unwrap();
		assert_eq!(y, x);
	}

	#[test]
	fn stride_two_halves_resolution() {
		let mut layer = conv(3, 2);
		let y = layer.forward(&Array4::zeros((2, 1, 8, 6))).unwrap();
		assert_eq!(y.dim(), (2, 1, 4, 3));
	}

	#[test]
	fn gradients_match_finite_differences() {
		let mut rng = StdRng::seed_from_u64(3);
		let mut layer = Conv2d::new("conv", 2, 3, 3, 2, 0.0, &mut rng);
		let x = Array4::from_shape_fn((1, 2, 5, 5), |(_, c, y, x)| ((c + 2 * y + 3 * x) % 7) as f32 * 0.1);

		// loss = sum(output); dL/dy = 1
		let y = layer.forward(&x).unwrap();
		let dx = layer.backward(&Array4::ones(y.raw_dim())).unwrap();

		let eps = 1e-2;
		let mut x_plus = x.clone();
		x_plus[[0, 1, 2, 3]] += eps;
		let mut x_minus = x.clone();
		x_minus[[0, 1, 2, 3]] -= eps;
		let numeric = (layer.forward(&x_plus).unwrap().sum() - layer.forward(&x_minus).unwrap().sum()) / (2.0 * eps);
		assert!((numeric - dx[[0, 1, 2, 3]]).abs() < 1e-2);

		let bias_grad = layer.bias.as_ref().unwrap().grad[[0]];
		assert_eq!(bias_grad, (y.shape()[2] * y.shape()[3]) as f32);
	}
}
