//! Per-sample stochastic augmentation of (image1, image2, flow, valid).
//!
//! Images are channels-first `[3, H, W]` in the 0..=255 range, flow is
//! `[2, H, W]` and the optional valid mask is `[H, W]`.

use ndarray::{s, Array2, Array3, Axis, Zip};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::constants::data;
use crate::error::{FlowError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EraserParams {
	pub enabled: bool,
	pub aug_prob: f32,
	/// Side length range of each erased rectangle, in pixels.
	pub bounds: [usize; 2],
}

impl Default for EraserParams {
	fn default() -> Self {
		Self {
			enabled: false,
			aug_prob: 0.5,
			bounds: [50, 100],
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NoiseParams {
	pub enabled: bool,
	pub aug_prob: f32,
	/// Standard deviation range in intensity units.
	pub noise_std_range: [f32; 2],
}

impl Default for NoiseParams {
	fn default() -> Self {
		Self {
			enabled: false,
			aug_prob: 0.5,
			noise_std_range: [0.0, 8.0],
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlipParams {
	pub enabled: bool,
	pub h_flip_prob: f32,
	pub v_flip_prob: f32,
}

impl Default for FlipParams {
	fn default() -> Self {
		Self {
			enabled: true,
			h_flip_prob: 0.5,
			v_flip_prob: 0.1,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ColorParams {
	pub enabled: bool,
	pub aug_prob: f32,
	/// Chance of jittering the two images independently.
	pub asymmetric_color_aug_prob: f32,
	pub brightness: f32,
	pub contrast: f32,
	pub saturation: f32,
	/// Maximum hue rotation as a fraction of a full turn.
	pub hue: f32,
}

impl Default for ColorParams {
	fn default() -> Self {
		Self {
			enabled: true,
			aug_prob: 1.0,
			asymmetric_color_aug_prob: 0.2,
			brightness: 0.4,
			contrast: 0.4,
			saturation: 0.4,
			hue: 0.5 / std::f32::consts::PI,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpatialParams {
	pub enabled: bool,
	pub aug_prob: f32,
	pub stretch_prob: f32,
	/// Log2 of the smallest and largest scale factor.
	pub min_scale: f32,
	pub max_scale: f32,
	/// Log2 of the largest extra per-axis stretch.
	pub max_stretch: f32,
	pub rotate_prob: f32,
	pub max_rotation_deg: f32,
}

impl Default for SpatialParams {
	fn default() -> Self {
		Self {
			enabled: true,
			aug_prob: 0.8,
			stretch_prob: 0.8,
			min_scale: -0.2,
			max_scale: 0.5,
			max_stretch: 0.2,
			rotate_prob: 0.0,
			max_rotation_deg: 10.0,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CropParams {
	pub enabled: bool,
	/// `[height, width]`
	pub crop_size: [usize; 2],
}

impl Default for CropParams {
	fn default() -> Self {
		Self {
			enabled: true,
			crop_size: data::DEFAULT_CROP_SIZE,
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AugmentationParams {
	pub eraser: EraserParams,
	pub noise: NoiseParams,
	pub flip: FlipParams,
	pub color: ColorParams,
	pub spatial: SpatialParams,
	pub crop: CropParams,
}

impl AugmentationParams {
	/// Every transform switched off.
	pub fn disabled() -> Self {
		let mut params = AugmentationParams::default();
		params.eraser.enabled = false;
		params.noise.enabled = false;
		params.flip.enabled = false;
		params.color.enabled = false;
		params.spatial.enabled = false;
		params.crop.enabled = false;
		params
	}
}

/// One training example as seen by the augmentor.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowFrame {
	pub img1: Array3<f32>,
	pub img2: Array3<f32>,
	pub flow: Array3<f32>,
	pub valid: Option<Array2<f32>>,
}

impl FlowFrame {
	fn hw(&self) -> (usize, usize) {
		let (_, h, w) = self.img1.dim();
		(h, w)
	}
}

#[derive(Debug, Clone)]
pub struct FlowAugmentor {
	params: AugmentationParams,
	/// Sparse ground truth is resampled by nearest neighbour and keeps its mask.
	sparse: bool,
}

impl FlowAugmentor {
	pub fn new(params: AugmentationParams, sparse: bool) -> Self {
		FlowAugmentor { params, sparse }
	}

	pub fn params(&self) -> &AugmentationParams {
		&self.params
	}

	pub fn apply<R: Rng + ?Sized>(&self, mut frame: FlowFrame, rng: &mut R) -> Result<FlowFrame> {
		let (h, w) = frame.hw();
		if frame.img2.dim() != frame.img1.dim() || frame.flow.dim() != (2, h, w) {
			return Err(FlowError::shape_mismatch(
				(frame.img1.dim(), (2, h, w)),
				(frame.img2.dim(), frame.flow.dim()),
			));
		}
		let p = &self.params;
		if p.color.enabled && rng.gen::<f32>() < p.color.aug_prob {
			self.color_transform(&mut frame, rng);
		}
		if p.eraser.enabled && rng.gen::<f32>() < p.eraser.aug_prob {
			erase(&mut frame.img2, &p.eraser, rng);
		}
		if p.noise.enabled && rng.gen::<f32>() < p.noise.aug_prob {
			let [lo, hi] = p.noise.noise_std_range;
			let std = if hi > lo { rng.gen_range(lo..hi) } else { lo };
			add_noise(&mut frame.img1, std, rng);
			add_noise(&mut frame.img2, std, rng);
		}
		if p.spatial.enabled {
			frame = self.spatial_transform(frame, rng)?;
		}
		if p.flip.enabled {
			if rng.gen::<f32>() < p.flip.h_flip_prob {
				flip(&mut frame, Axis(2));
			}
			if rng.gen::<f32>() < p.flip.v_flip_prob {
				flip(&mut frame, Axis(1));
			}
		}
		if p.crop.enabled {
			frame = random_crop(frame, p.crop.crop_size, rng)?;
		}
		Ok(frame)
	}

	fn color_transform<R: Rng + ?Sized>(&self, frame: &mut FlowFrame, rng: &mut R) {
		let c = &self.params.color;
		if rng.gen::<f32>() < c.asymmetric_color_aug_prob {
			let jitter = ColorJitter::sample(c, rng);
			jitter.apply(&mut frame.img1);
			let jitter = ColorJitter::sample(c, rng);
			jitter.apply(&mut frame.img2);
		} else {
			let jitter = ColorJitter::sample(c, rng);
			jitter.apply(&mut frame.img1);
			jitter.apply(&mut frame.img2);
		}
	}

	fn spatial_transform<R: Rng + ?Sized>(&self, mut frame: FlowFrame, rng: &mut R) -> Result<FlowFrame> {
		let sp = &self.params.spatial;
		let (h, w) = frame.hw();

		// never scale below what the crop still needs
		let min_factor = if self.params.crop.enabled {
			let [ch, cw] = self.params.crop.crop_size;
			((ch + 8) as f32 / h as f32).max((cw + 8) as f32 / w as f32)
		} else {
			0.0
		};

		let scale = if sp.max_scale > sp.min_scale {
			2f32.powf(rng.gen_range(sp.min_scale..sp.max_scale))
		} else {
			2f32.powf(sp.min_scale)
		};
		let (mut sx, mut sy) = (scale, scale);
		if rng.gen::<f32>() < sp.stretch_prob && sp.max_stretch > 0.0 {
			sx *= 2f32.powf(rng.gen_range(-sp.max_stretch..sp.max_stretch));
			sy *= 2f32.powf(rng.gen_range(-sp.max_stretch..sp.max_stretch));
		}
		let sx = sx.max(min_factor);
		let sy = sy.max(min_factor);

		if rng.gen::<f32>() < sp.aug_prob || min_factor > 1.0 {
			let nh = ((h as f32 * sy).round() as usize).max(1);
			let nw = ((w as f32 * sx).round() as usize).max(1);
			let (fy, fx) = (nh as f32 / h as f32, nw as f32 / w as f32);
			frame.img1 = resize_bilinear(&frame.img1, nh, nw);
			frame.img2 = resize_bilinear(&frame.img2, nh, nw);
			if self.sparse {
				let valid = frame.valid.take().unwrap_or_else(|| Array2::ones((h, w)));
				let (flow, valid) = resize_sparse_flow(&frame.flow, &valid, fx, fy, nh, nw);
				frame.flow = flow;
				frame.valid = Some(valid);
			} else {
				let mut flow = resize_bilinear(&frame.flow, nh, nw);
				flow.index_axis_mut(Axis(0), 0).mapv_inplace(|u| u * fx);
				flow.index_axis_mut(Axis(0), 1).mapv_inplace(|v| v * fy);
				frame.flow = flow;
				frame.valid = frame.valid.map(|v| resize_nearest(&v.insert_axis(Axis(0)), nh, nw).index_axis_move(Axis(0), 0));
			}
		}

		if sp.rotate_prob > 0.0 && rng.gen::<f32>() < sp.rotate_prob {
			let angle = if sp.max_rotation_deg > 0.0 {
				rng.gen_range(-sp.max_rotation_deg..sp.max_rotation_deg)
			} else {
				0.0
			};
			frame = rotate(frame, angle.to_radians(), self.sparse);
		}
		Ok(frame)
	}
}

#[derive(Debug, Clone, Copy)]
struct ColorJitter {
	brightness: f32,
	contrast: f32,
	saturation: f32,
	hue: f32,
}

impl ColorJitter {
	fn sample<R: Rng + ?Sized>(c: &ColorParams, rng: &mut R) -> Self {
		fn factor<R: Rng + ?Sized>(amount: f32, rng: &mut R) -> f32 {
			if amount > 0.0 {
				rng.gen_range((1.0 - amount).max(0.0)..1.0 + amount)
			} else {
				1.0
			}
		}
		ColorJitter {
			brightness: factor(c.brightness, rng),
			contrast: factor(c.contrast, rng),
			saturation: factor(c.saturation, rng),
			hue: if c.hue > 0.0 { rng.gen_range(-c.hue..c.hue) } else { 0.0 },
		}
	}

	fn apply(&self, img: &mut Array3<f32>) {
		img.mapv_inplace(|v| (v * self.brightness).clamp(0.0, 255.0));

		let mean_gray = grayscale(img).mean().unwrap_or(0.0);
		img.mapv_inplace(|v| (mean_gray + (v - mean_gray) * self.contrast).clamp(0.0, 255.0));

		let gray = grayscale(img);
		for mut channel in img.outer_iter_mut() {
			Zip::from(&mut channel)
				.and(&gray)
				.for_each(|v, &g| *v = (g + (*v - g) * self.saturation).clamp(0.0, 255.0));
		}

		if self.hue != 0.0 {
			rotate_hue(img, self.hue * 2.0 * std::f32::consts::PI);
		}
	}
}

fn grayscale(img: &Array3<f32>) -> Array2<f32> {
	let (r, g, b) = (img.index_axis(Axis(0), 0), img.index_axis(Axis(0), 1), img.index_axis(Axis(0), 2));
	let mut gray = Array2::<f32>::zeros(r.raw_dim());
	Zip::from(&mut gray)
		.and(&r)
		.and(&g)
		.and(&b)
		.for_each(|o, &r, &g, &b| *o = 0.299 * r + 0.587 * g + 0.114 * b);
	gray
}

/// Rotates chroma in YIQ space by `angle` radians.
fn rotate_hue(img: &mut Array3<f32>, angle: f32) {
	let (cos, sin) = (angle.cos(), angle.sin());
	let (_, h, w) = img.dim();
	for y in 0..h {
		for x in 0..w {
			let (r, g, b) = (img[[0, y, x]], img[[1, y, x]], img[[2, y, x]]);
			let yy = 0.299 * r + 0.587 * g + 0.114 * b;
			let i = 0.596 * r - 0.274 * g - 0.322 * b;
			let q = 0.211 * r - 0.523 * g + 0.312 * b;
			let (i, q) = (i * cos - q * sin, i * sin + q * cos);
			img[[0, y, x]] = (yy + 0.956 * i + 0.621 * q).clamp(0.0, 255.0);
			img[[1, y, x]] = (yy - 0.272 * i - 0.647 * q).clamp(0.0, 255.0);
			img[[2, y, x]] = (yy - 1.106 * i + 1.703 * q).clamp(0.0, 255.0);
		}
	}
}

/// Fills one to two random rectangles with the image's mean colour.
fn erase<R: Rng + ?Sized>(img: &mut Array3<f32>, params: &EraserParams, rng: &mut R) {
	let (c, h, w) = img.dim();
	let mean: Vec<f32> = (0..c)
		.map(|ch| img.index_axis(Axis(0), ch).mean().unwrap_or(0.0))
		.collect();
	let [lo, hi] = params.bounds;
	for _ in 0..rng.gen_range(1..3) {
		let x0 = rng.gen_range(0..w);
		let y0 = rng.gen_range(0..h);
		let dx = if hi > lo { rng.gen_range(lo..hi) } else { lo };
		let dy = if hi > lo { rng.gen_range(lo..hi) } else { lo };
		let (x1, y1) = ((x0 + dx).min(w), (y0 + dy).min(h));
		for (ch, &m) in mean.iter().enumerate() {
			img.slice_mut(s![ch, y0..y1, x0..x1]).fill(m);
		}
	}
}

fn add_noise<R: Rng + ?Sized>(img: &mut Array3<f32>, std: f32, rng: &mut R) {
	img.mapv_inplace(|v| {
		let z: f32 = StandardNormal.sample(&mut *rng);
		(v + z * std).clamp(0.0, 255.0)
	});
}

fn flip(frame: &mut FlowFrame, axis: Axis) {
	frame.img1.invert_axis(axis);
	frame.img2.invert_axis(axis);
	frame.flow.invert_axis(axis);
	// axis 2 is x, so u changes sign; axis 1 is y, so v does
	let component = if axis == Axis(2) { 0 } else { 1 };
	frame.flow.index_axis_mut(Axis(0), component).mapv_inplace(|v| -v);
	if let Some(valid) = &mut frame.valid {
		valid.invert_axis(Axis(axis.index() - 1));
	}
	frame.img1 = frame.img1.as_standard_layout().into_owned();
	frame.img2 = frame.img2.as_standard_layout().into_owned();
	frame.flow = frame.flow.as_standard_layout().into_owned();
	frame.valid = frame.valid.take().map(|v| v.as_standard_layout().into_owned());
}

fn random_crop<R: Rng + ?Sized>(frame: FlowFrame, size: [usize; 2], rng: &mut R) -> Result<FlowFrame> {
	let (h, w) = frame.hw();
	let [ch, cw] = size;
	if ch > h || cw > w {
		return Err(FlowError::InvalidParameter(format!(
			"crop size {:?} exceeds the {}x{} sample",
			size, h, w
		)));
	}
	let y0 = rng.gen_range(0..=h - ch);
	let x0 = rng.gen_range(0..=w - cw);
	Ok(crop(frame, y0, x0, ch, cw))
}

fn crop(frame: FlowFrame, y0: usize, x0: usize, ch: usize, cw: usize) -> FlowFrame {
	let window = s![.., y0..y0 + ch, x0..x0 + cw];
	FlowFrame {
		img1: frame.img1.slice(window).to_owned(),
		img2: frame.img2.slice(window).to_owned(),
		flow: frame.flow.slice(window).to_owned(),
		valid: frame.valid.map(|v| v.slice(s![y0..y0 + ch, x0..x0 + cw]).to_owned()),
	}
}

/// Bilinear resize with half-pixel centres; samples outside read the border.
fn resize_bilinear(src: &Array3<f32>, out_h: usize, out_w: usize) -> Array3<f32> {
	let (c, h, w) = src.dim();
	let (ry, rx) = (h as f32 / out_h as f32, w as f32 / out_w as f32);
	let mut out = Array3::<f32>::zeros((c, out_h, out_w));
	for y in 0..out_h {
		let sy = ((y as f32 + 0.5) * ry - 0.5).clamp(0.0, (h - 1) as f32);
		let y0 = sy.floor() as usize;
		let y1 = (y0 + 1).min(h - 1);
		let fy = sy - y0 as f32;
		for x in 0..out_w {
			let sx = ((x as f32 + 0.5) * rx - 0.5).clamp(0.0, (w - 1) as f32);
			let x0 = sx.floor() as usize;
			let x1 = (x0 + 1).min(w - 1);
			let fx = sx - x0 as f32;
			for ch in 0..c {
				let top = src[[ch, y0, x0]] * (1.0 - fx) + src[[ch, y0, x1]] * fx;
				let bottom = src[[ch, y1, x0]] * (1.0 - fx) + src[[ch, y1, x1]] * fx;
				out[[ch, y, x]] = top * (1.0 - fy) + bottom * fy;
			}
		}
	}
	out
}

fn resize_nearest(src: &Array3<f32>, out_h: usize, out_w: usize) -> Array3<f32> {
	let (c, h, w) = src.dim();
	Array3::from_shape_fn((c, out_h, out_w), |(ch, y, x)| {
		let sy = ((y * h) / out_h).min(h - 1);
		let sx = ((x * w) / out_w).min(w - 1);
		src[[ch, sy, sx]]
	})
}

/// Scatters every valid flow sample to its scaled position.
fn resize_sparse_flow(
	flow: &Array3<f32>,
	valid: &Array2<f32>,
	fx: f32,
	fy: f32,
	out_h: usize,
	out_w: usize,
) -> (Array3<f32>, Array2<f32>) {
	let (_, h, w) = flow.dim();
	let mut out_flow = Array3::<f32>::zeros((2, out_h, out_w));
	let mut out_valid = Array2::<f32>::zeros((out_h, out_w));
	for y in 0..h {
		for x in 0..w {
			if valid[[y, x]] < 1.0 {
				continue;
			}
			let nx = (x as f32 * fx).round();
			let ny = (y as f32 * fy).round();
			if nx < 0.0 || ny < 0.0 || nx >= out_w as f32 || ny >= out_h as f32 {
				continue;
			}
			let (nx, ny) = (nx as usize, ny as usize);
			out_flow[[0, ny, nx]] = flow[[0, y, x]] * fx;
			out_flow[[1, ny, nx]] = flow[[1, y, x]] * fy;
			out_valid[[ny, nx]] = 1.0;
		}
	}
	(out_flow, out_valid)
}

/// Rotates the frame about its centre. Flow vectors rotate with the image;
/// pixels that come from outside the frame become invalid.
fn rotate(frame: FlowFrame, angle: f32, sparse: bool) -> FlowFrame {
	let (h, w) = frame.hw();
	let (cy, cx) = ((h as f32 - 1.0) / 2.0, (w as f32 - 1.0) / 2.0);
	let (cos, sin) = (angle.cos(), angle.sin());
	// inverse mapping from output pixel to source position
	let source = |y: usize, x: usize| {
		let (dy, dx) = (y as f32 - cy, x as f32 - cx);
		(cy - sin * dx + cos * dy, cx + cos * dx + sin * dy)
	};
	let inside = |sy: f32, sx: f32| sy >= 0.0 && sx >= 0.0 && sy <= (h - 1) as f32 && sx <= (w - 1) as f32;

	let sample = |src: &Array3<f32>, nearest: bool| {
		let (c, _, _) = src.dim();
		let mut out = Array3::<f32>::zeros((c, h, w));
		for y in 0..h {
			for x in 0..w {
				let (sy, sx) = source(y, x);
				if !inside(sy, sx) {
					continue;
				}
				for ch in 0..c {
					out[[ch, y, x]] = if nearest {
						src[[ch, sy.round() as usize, sx.round() as usize]]
					} else {
						bilinear_at(src, ch, sy, sx)
					};
				}
			}
		}
		out
	};

	let img1 = sample(&frame.img1, false);
	let img2 = sample(&frame.img2, false);
	let mut flow = sample(&frame.flow, sparse);
	for y in 0..h {
		for x in 0..w {
			let (u, v) = (flow[[0, y, x]], flow[[1, y, x]]);
			flow[[0, y, x]] = cos * u - sin * v;
			flow[[1, y, x]] = sin * u + cos * v;
		}
	}
	let base_valid = frame.valid.unwrap_or_else(|| Array2::ones((h, w)));
	let valid = sample(&base_valid.insert_axis(Axis(0)), true).index_axis_move(Axis(0), 0);
	FlowFrame {
		img1,
		img2,
		flow,
		valid: Some(valid),
	}
}

fn bilinear_at(src: &Array3<f32>, ch: usize, sy: f32, sx: f32) -> f32 {
	let (_, h, w) = src.dim();
	let (y0, x0) = (sy.floor() as usize, sx.floor() as usize);
	let (y1, x1) = ((y0 + 1).min(h - 1), (x0 + 1).min(w - 1));
	let (fy, fx) = (sy - y0 as f32, sx - x0 as f32);
	let top = src[[ch, y0, x0]] * (1.0 - fx) + src[[ch, y0, x1]] * fx;
	let bottom = src[[ch, y1, x0]] * (1.0 - fx) + src[[ch, y1, x1]] * fx;
	top * (1.0 - fy) + bottom * fy
}
