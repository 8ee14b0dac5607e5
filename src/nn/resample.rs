use ndarray::{s, Array4, Zip};

use super::{Layer, Module, Param};
use crate::error::{FlowError, Result};

/// Nearest-neighbour upsampling by an integer factor.
#[derive(Debug, Clone)]
pub struct Upsample {
	factor: usize,
}

impl Upsample {
	pub fn new(factor: usize) -> Self {
		Upsample { factor: factor.max(1) }
	}
}

impl Module for Upsample {
	fn params(&self) -> Vec<&Param> {
		Vec::new()
	}

	fn params_mut(&mut self) -> Vec<&mut Param> {
		Vec::new()
	}
}

impl Layer for Upsample {
	fn forward(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
		Ok(upsample_nearest(input, self.factor))
	}

	fn backward(&mut self, grad_output: &Array4<f32>) -> Result<Array4<f32>> {
		sum_pool(grad_output, self.factor)
	}
}

pub fn upsample_nearest(x: &Array4<f32>, factor: usize) -> Array4<f32> {
	if factor == 1 {
		return x.clone();
	}
	let (n, c, h, w) = x.dim();
	Array4::from_shape_fn((n, c, h * factor, w * factor), |(b, ch, y, xx)| {
		x[[b, ch, y / factor, xx / factor]]
	})
}

/// Sums non-overlapping `factor x factor` blocks; the adjoint of [`upsample_nearest`].
pub fn sum_pool(x: &Array4<f32>, factor: usize) -> Result<Array4<f32>> {
	if factor == 1 {
		return Ok(x.clone());
	}
	let (n, c, h, w) = x.dim();
	if h % factor != 0 || w % factor != 0 {
		return Err(FlowError::shape_mismatch(
			format!("spatial size divisible by {}", factor),
			(h, w),
		));
	}
	let mut out = Array4::<f32>::zeros((n, c, h / factor, w / factor));
	Zip::indexed(x).for_each(|(b, ch, y, xx), &v| {
		out[[b, ch, y / factor, xx / factor]] += v;
	});
	Ok(out)
}

pub fn avg_pool(x: &Array4<f32>, factor: usize) -> Result<Array4<f32>> {
	let area = (factor * factor) as f32;
	Ok(sum_pool(x, factor)?.mapv(|v| v / area))
}

/// Integer ratio between a target resolution and a prediction resolution.
pub fn scale_factor(target_hw: (usize, usize), pred_hw: (usize, usize)) -> Result<usize> {
	let (th, tw) = target_hw;
	let (ph, pw) = pred_hw;
	if ph == 0 || pw == 0 || th % ph != 0 || tw % pw != 0 || th / ph != tw / pw {
		return Err(FlowError::shape_mismatch(
			format!("integer multiple of {:?}", pred_hw),
			target_hw,
		));
	}
	Ok(th / ph)
}

/// Upsamples a flow field and rescales its vectors to the new pixel grid.
pub fn upsample_flow(flow: &Array4<f32>, factor: usize) -> Array4<f32> {
	let scale = factor as f32;
	let mut up = upsample_nearest(flow, factor);
	up.mapv_inplace(|v| v * scale);
	up
}

/// Gradient of [`upsample_flow`] with respect to its input.
pub fn upsample_flow_backward(grad: &Array4<f32>, factor: usize) -> Result<Array4<f32>> {
	let scale = factor as f32;
	Ok(sum_pool(grad, factor)?.mapv(|v| v * scale))
}

/// Bilinear resize of a flow field with aligned corners, rescaling u by the
/// width ratio and v by the height ratio. Forward only.
pub fn resize_flow_bilinear(flow: &Array4<f32>, out_h: usize, out_w: usize) -> Array4<f32> {
	let (n, c, h, w) = flow.dim();
	let ry = if out_h > 1 { (h - 1) as f32 / (out_h - 1) as f32 } else { 0.0 };
	let rx = if out_w > 1 { (w - 1) as f32 / (out_w - 1) as f32 } else { 0.0 };
	let mut out = Array4::<f32>::zeros((n, c, out_h, out_w));
	for b in 0..n {
		for ch in 0..c {
			let plane = flow.slice(s![b, ch, .., ..]);
			let gain = if ch == 0 { out_w as f32 / w as f32 } else { out_h as f32 / h as f32 };
			for y in 0..out_h {
				let sy = y as f32 * ry;
				let y0 = sy.floor() as usize;
				let y1 = (y0 + 1).min(h - 1);
				let fy = sy - y0 as f32;
				for x in 0..out_w {
					let sx = x as f32 * rx;
					let x0 = sx.floor() as usize;
					let x1 = (x0 + 1).min(w - 1);
					let fx = sx - x0 as f32;
					let top = plane[[y0, x0]] * (1.0 - fx) + plane[[y0, x1]] * fx;
					let bottom = plane[[y1, x0]] * (1.0 - fx) + plane[[y1, x1]] * fx;
					out[[b, ch, y, x]] = (top * (1.0 - fy) + bottom * fy) * gain;
				}
			}
		}
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn sum_pool_is_adjoint_of_upsample() {
		let x = Array4::from_shape_fn((1, 2, 2, 3), |(_, c, y, x)| (c + y * 3 + x) as f32);
		let g = Array4::from_shape_fn((1, 2, 4, 6), |(_, c, y, x)| (c * 2 + y + x) as f32 * 0.5);
		let lhs = (upsample_nearest(&x, 2) * &g).sum();
		let rhs = (&x * &sum_pool(&g, 2).unwrap()).sum();
		assert!((lhs - rhs).abs() < 1e-4);
	}

	#[test]
	fn upsampled_flow_is_rescaled() {
		let flow = Array4::from_elem((1, 2, 2, 2), 1.5);
		let up = upsample_flow(&flow, 4);
		assert_eq!(up.dim(), (1, 2, 8, 8));
		assert_eq!(up[[0, 1, 7, 7]], 6.0);
	}

	#[test]
	fn bilinear_resize_of_constant_flow_scales_magnitude() {
		let flow = Array4::from_elem((1, 2, 4, 4), 1.0);
		let up = resize_flow_bilinear(&flow, 8, 16);
		assert!((up[[0, 0, 3, 5]] - 4.0).abs() < 1e-5);
		assert!((up[[0, 1, 3, 5]] - 2.0).abs() < 1e-5);
	}

	#[test]
	fn scale_factor_requires_integer_ratio() {
		assert_eq!(scale_factor((16, 24), (4, 6)).unwrap(), 4);
		assert!(scale_factor((16, 24), (5, 6)).is_err());
	}
}
