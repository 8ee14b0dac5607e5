//! Cost volumes between two feature maps.

use ndarray::{s, Array3, Array4, Axis};
use rayon::prelude::*;

use crate::error::{FlowError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CorrelationArgs {
	pub max_displacement: usize,
}

/// Local correlation over a `(2d+1) x (2d+1)` displacement window.
///
/// Output channel `(dy + d) * (2d + 1) + (dx + d)` holds the channel-mean of
/// `f1(y, x) * f2(y + dy, x + dx)`; samples outside `f2` count as zero.
#[derive(Debug, Clone)]
pub struct Correlation {
	max_displacement: usize,
	cache: Option<(Array4<f32>, Array4<f32>)>,
}

impl Correlation {
	pub fn new(max_displacement: usize) -> Self {
		Correlation {
			max_displacement,
			cache: None,
		}
	}

	pub fn from_args(args: CorrelationArgs) -> Self {
		Self::new(args.max_displacement)
	}

	pub fn max_displacement(&self) -> usize {
		self.max_displacement
	}

	pub fn out_channels(&self) -> usize {
		let side = 2 * self.max_displacement + 1;
		side * side
	}

	/// Displacement `(dy, dx)` of every output channel, in channel order.
	pub fn offsets(&self) -> Vec<(isize, isize)> {
		let d = self.max_displacement as isize;
		(-d..=d).flat_map(|dy| (-d..=d).map(move |dx| (dy, dx))).collect()
	}

	pub fn forward(&mut self, f1: &Array4<f32>, f2: &Array4<f32>) -> Result<Array4<f32>> {
		if f1.dim() != f2.dim() {
			return Err(FlowError::shape_mismatch(f1.dim(), f2.dim()));
		}
		let (n, c, h, w) = f1.dim();
		let scale = 1.0 / c.max(1) as f32;
		let mut out = Array4::<f32>::zeros((n, self.out_channels(), h, w));

		let costs: Vec<(usize, Window, Array3<f32>)> = self
			.offsets()
			.into_par_iter()
			.enumerate()
			.filter_map(|(k, (dy, dx))| {
				let win = Window::new(dy, dx, h, w)?;
				let a = f1.slice(s![.., .., win.y0..win.y1, win.x0..win.x1]);
				let b = f2.slice(s![.., .., win.sy0..win.sy1, win.sx0..win.sx1]);
				let cost = (&a * &b).sum_axis(Axis(1)) * scale;
				Some((k, win, cost))
			})
			.collect();
		for (k, win, cost) in costs {
			out.slice_mut(s![.., k, win.y0..win.y1, win.x0..win.x1]).assign(&cost);
		}

		self.cache = Some((f1.clone(), f2.clone()));
		Ok(out)
	}

	/// Returns the gradients with respect to `f1` and `f2`.
	pub fn backward(&mut self, grad_output: &Array4<f32>) -> Result<(Array4<f32>, Array4<f32>)> {
		let (f1, f2) = self
			.cache
			.take()
			.ok_or_else(|| FlowError::InvalidState("correlation backward before forward".into()))?;
		let (n, c, h, w) = f1.dim();
		if grad_output.dim() != (n, self.out_channels(), h, w) {
			return Err(FlowError::shape_mismatch((n, self.out_channels(), h, w), grad_output.dim()));
		}
		let scale = 1.0 / c.max(1) as f32;
		let mut df1 = Array4::<f32>::zeros(f1.raw_dim());
		let mut df2 = Array4::<f32>::zeros(f2.raw_dim());

		for (k, (dy, dx)) in self.offsets().into_iter().enumerate() {
			let Some(win) = Window::new(dy, dx, h, w) else { continue };
			let a = f1.slice(s![.., .., win.y0..win.y1, win.x0..win.x1]);
			let b = f2.slice(s![.., .., win.sy0..win.sy1, win.sx0..win.sx1]);
			let gk = grad_output
				.slice(s![.., k..k + 1, win.y0..win.y1, win.x0..win.x1])
				.to_owned()
				* scale;
			let gk = gk
				.broadcast(a.raw_dim())
				.ok_or_else(|| FlowError::shape_mismatch(a.shape(), gk.shape()))?;

			let mut d1 = df1.slice_mut(s![.., .., win.y0..win.y1, win.x0..win.x1]);
			d1 += &(&b * &gk);
			let mut d2 = df2.slice_mut(s![.., .., win.sy0..win.sy1, win.sx0..win.sx1]);
			d2 += &(&a * &gk);
		}
		Ok((df1, df2))
	}
}

/// Overlap of the frame with itself shifted by `(dy, dx)`.
struct Window {
	y0: usize,
	y1: usize,
	x0: usize,
	x1: usize,
	sy0: usize,
	sy1: usize,
	sx0: usize,
	sx1: usize,
}

impl Window {
	fn new(dy: isize, dx: isize, h: usize, w: usize) -> Option<Self> {
		let (h, w) = (h as isize, w as isize);
		let (y0, y1) = ((-dy).max(0), (h - dy).min(h));
		let (x0, x1) = ((-dx).max(0), (w - dx).min(w));
		if y0 >= y1 || x0 >= x1 {
			return None;
		}
		Some(Window {
			y0: y0 as usize,
			y1: y1 as usize,
			x0: x0 as usize,
			x1: x1 as usize,
			sy0: (y0 + dy) as usize,
			sy1: (y1 + dy) as usize,
			sx0: (x0 + dx) as usize,
			sx1: (x1 + dx) as usize,
		})
	}
}
