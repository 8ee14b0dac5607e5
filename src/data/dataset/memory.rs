use ndarray::Array3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::data::{wrap_index, Dataset, Sample, WorkerRng};
use crate::error::{FlowError, Result};
use crate::functional::augment::FlowFrame;
use crate::functional::{AugmentationParams, FlowAugmentor};
use crate::registry::{Configurable, Registries};

/// Samples held in memory, optionally augmented on access.
#[derive(Debug, Clone)]
pub struct InMemoryDataset {
	samples: Vec<Sample>,
	augmentor: Option<FlowAugmentor>,
}

impl InMemoryDataset {
	pub fn new(samples: Vec<Sample>) -> Self {
		InMemoryDataset {
			samples,
			augmentor: None,
		}
	}

	pub fn with_augmentation(mut self, params: AugmentationParams, sparse: bool) -> Self {
		self.augmentor = Some(FlowAugmentor::new(params, sparse));
		self
	}

	pub fn samples(&self) -> &[Sample] {
		&self.samples
	}

	/// Random textures where the second frame is the first moved by `shift`
	/// (wrapping at the borders), so the flow is exactly `shift` everywhere.
	pub fn synthetic_shift(args: &SyntheticShiftArgs) -> Result<Self> {
		if args.height == 0 || args.width == 0 {
			return Err(FlowError::InvalidParameter("synthetic frames need a non-zero size".into()));
		}
		let (h, w) = (args.height, args.width);
		let [u, v] = args.shift;
		let mut rng = StdRng::seed_from_u64(args.seed);
		let samples = (0..args.len)
			.map(|_| {
				let img1 = Array3::from_shape_fn((3, h, w), |_| rng.gen_range(0.0f32..255.0));
				let img2 = Array3::from_shape_fn((3, h, w), |(c, y, x)| {
					let sy = (y as i64 - v).rem_euclid(h as i64) as usize;
					let sx = (x as i64 - u).rem_euclid(w as i64) as usize;
					img1[[c, sy, sx]]
				});
				let mut flow = Array3::<f32>::zeros((2, h, w));
				flow.index_axis_mut(ndarray::Axis(0), 0).fill(u as f32);
				flow.index_axis_mut(ndarray::Axis(0), 1).fill(v as f32);
				Sample {
					img1,
					img2,
					flow: Some(flow),
					valid: args.append_valid_mask.then(|| ndarray::Array2::ones((h, w))),
				}
			})
			.collect();
		Ok(InMemoryDataset::new(samples))
	}
}

impl Dataset for InMemoryDataset {
	fn len(&self) -> usize {
		self.samples.len()
	}

	fn get(&self, index: usize, rng: &mut WorkerRng) -> Result<Sample> {
		let index = wrap_index(index, self.len(), "in-memory dataset")?;
		let sample = self.samples[index].clone();
		match (&self.augmentor, sample.flow) {
			(Some(augmentor), Some(flow)) => {
				let had_valid = sample.valid.is_some();
				let frame = augmentor.apply(
					FlowFrame {
						img1: sample.img1,
						img2: sample.img2,
						flow,
						valid: sample.valid,
					},
					rng,
				)?;
				Ok(Sample {
					img1: frame.img1,
					img2: frame.img2,
					flow: Some(frame.flow),
					valid: if had_valid { frame.valid } else { None },
				})
			}
			(_, flow) => Ok(Sample { flow, ..sample }),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyntheticShiftArgs {
	pub len: usize,
	pub height: usize,
	pub width: usize,
	/// Integer `[u, v]` displacement.
	pub shift: [i64; 2],
	pub seed: u64,
	pub append_valid_mask: bool,
}

impl Default for SyntheticShiftArgs {
	fn default() -> Self {
		Self {
			len: 8,
			height: 32,
			width: 32,
			shift: [2, 1],
			seed: 0,
			append_valid_mask: true,
		}
	}
}

/// Registry face of [`InMemoryDataset::synthetic_shift`].
#[derive(Debug, Clone)]
pub struct SyntheticShift(InMemoryDataset);

impl SyntheticShift {
	pub fn into_inner(self) -> InMemoryDataset {
		self.0
	}
}

impl Configurable for SyntheticShift {
	type Args = SyntheticShiftArgs;

	fn from_args(args: Self::Args, _registries: &Registries) -> Result<Self> {
		InMemoryDataset::synthetic_shift(&args).map(SyntheticShift)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn second_frame_is_first_moved_by_flow() {
		let dataset = InMemoryDataset::synthetic_shift(&SyntheticShiftArgs {
			len: 2,
			height: 6,
			width: 5,
			shift: [2, -1],
			..Default::default()
		})
		.unwrap();
		let sample = dataset.get(1, &mut WorkerRng::new(0, 0)).unwrap();
		// pixel (y, x) of img1 lands at (y - 1, x + 2) in img2
		assert_eq!(sample.img1[[1, 3, 1]], sample.img2[[1, 2, 3]]);
		assert_eq!(sample.img1[[0, 0, 4]], sample.img2[[0, 5, 1]]);
		let flow = sample.flow.unwrap();
		assert_eq!(flow[[0, 4, 4]], 2.0);
		assert_eq!(flow[[1, 0, 0]], -1.0);
	}

	#[test]
	fn disabled_augmentation_returns_stored_sample() {
		let base = InMemoryDataset::synthetic_shift(&SyntheticShiftArgs::default()).unwrap();
		let expected = base.samples()[0].clone();
		let dataset = base.with_augmentation(AugmentationParams::disabled(), false);
		assert_eq!(dataset.get(8, &mut WorkerRng::new(3, 1)).unwrap(), expected);
	}
}
