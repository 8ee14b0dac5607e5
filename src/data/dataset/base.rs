use std::ops::{Add, Mul};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{s, Array3, Axis};
use rand::Rng;

use crate::constants::data;
use crate::data::frame_utils::{dense_valid_mask, read_flow, read_image};
use crate::data::{wrap_index, Dataset, Sample, SharedDataset, WorkerRng};
use crate::error::{FlowError, Result};
use crate::functional::augment::FlowFrame;
use crate::functional::{AugmentationParams, FlowAugmentor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CropType {
	Center,
	Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CropOptions {
	#[serde(rename = "use")]
	pub enabled: bool,
	/// `[height, width]`
	pub size: [usize; 2],
	#[serde(rename = "type")]
	pub crop_type: CropType,
}

impl Default for CropOptions {
	fn default() -> Self {
		Self {
			enabled: false,
			size: data::DEFAULT_CROP_SIZE,
			crop_type: CropType::Center,
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AugmentOptions {
	#[serde(rename = "use")]
	pub enabled: bool,
	pub params: AugmentationParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NormParams {
	#[serde(rename = "use")]
	pub enabled: bool,
	pub mean: [f32; 3],
	pub std: [f32; 3],
}

impl Default for NormParams {
	fn default() -> Self {
		Self {
			enabled: false,
			mean: data::NORM_MEAN,
			std: data::NORM_STD,
		}
	}
}

/// Per-dataset loading behaviour.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatasetOptions {
	/// Load image pairs only.
	pub is_prediction: bool,
	pub append_valid_mask: bool,
	pub crop: CropOptions,
	pub augment: AugmentOptions,
	pub norm_params: NormParams,
	/// Set by datasets whose ground truth only covers some pixels.
	#[serde(skip)]
	pub sparse: bool,
}

/// Image pairs and their ground truth, read from disk on access.
#[derive(Debug, Clone)]
pub struct FlowDataset {
	name: String,
	image_list: Vec<[PathBuf; 2]>,
	flow_list: Vec<PathBuf>,
	options: DatasetOptions,
	augmentor: Option<FlowAugmentor>,
}

impl FlowDataset {
	pub fn new(name: impl Into<String>, options: DatasetOptions) -> Self {
		let augmentor = if options.augment.enabled && !options.is_prediction {
			Some(FlowAugmentor::new(options.augment.params.clone(), options.sparse))
		} else {
			None
		};
		FlowDataset {
			name: name.into(),
			image_list: Vec::new(),
			flow_list: Vec::new(),
			options,
			augmentor,
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn options(&self) -> &DatasetOptions {
		&self.options
	}

	pub fn is_sparse(&self) -> bool {
		self.options.sparse
	}

	pub fn image_list(&self) -> &[[PathBuf; 2]] {
		&self.image_list
	}

	pub fn flow_list(&self) -> &[PathBuf] {
		&self.flow_list
	}

	/// Adds a pair with its ground truth.
	pub fn push(&mut self, img1: impl AsRef<Path>, img2: impl AsRef<Path>, flow: impl AsRef<Path>) -> Result<()> {
		if self.flow_list.len() != self.image_list.len() {
			return Err(FlowError::InvalidParameter(format!(
				"{} already holds pairs without ground truth",
				self.name
			)));
		}
		self.image_list.push([img1.as_ref().to_path_buf(), img2.as_ref().to_path_buf()]);
		self.flow_list.push(flow.as_ref().to_path_buf());
		Ok(())
	}

	/// Adds a pair without ground truth; only valid for prediction datasets.
	pub fn push_images(&mut self, img1: impl AsRef<Path>, img2: impl AsRef<Path>) -> Result<()> {
		if !self.options.is_prediction {
			return Err(FlowError::InvalidParameter(format!(
				"{} is a training dataset and needs ground truth for every pair",
				self.name
			)));
		}
		self.image_list.push([img1.as_ref().to_path_buf(), img2.as_ref().to_path_buf()]);
		Ok(())
	}

	/// Repeats both file lists `times` times.
	pub fn repeat(mut self, times: usize) -> Self {
		let images = self.image_list.clone();
		let flows = self.flow_list.clone();
		self.image_list = (0..times).flat_map(|_| images.iter().cloned()).collect();
		self.flow_list = (0..times).flat_map(|_| flows.iter().cloned()).collect();
		self
	}

	fn crop_window(&self, h: usize, w: usize, rng: &mut WorkerRng) -> Result<Option<(usize, usize, usize, usize)>> {
		let crop = &self.options.crop;
		if !crop.enabled {
			return Ok(None);
		}
		let [ch, cw] = crop.size;
		if ch > h || cw > w {
			return Err(FlowError::InvalidParameter(format!(
				"{}: crop {:?} is larger than the {}x{} sample",
				self.name, crop.size, h, w
			)));
		}
		let (y0, x0) = match crop.crop_type {
			CropType::Center => ((h - ch) / 2, (w - cw) / 2),
			CropType::Random => (rng.gen_range(0..=h - ch), rng.gen_range(0..=w - cw)),
		};
		Ok(Some((y0, x0, ch, cw)))
	}

	fn normalize(&self, img: &mut Array3<f32>) {
		let norm = &self.options.norm_params;
		if !norm.enabled {
			return;
		}
		for (c, mut channel) in img.axis_iter_mut(Axis(0)).enumerate() {
			let (mean, std) = (norm.mean[c % 3], norm.std[c % 3]);
			channel.mapv_inplace(|v| (v / 255.0 - mean) / std);
		}
	}
}

impl Dataset for FlowDataset {
	fn len(&self) -> usize {
		self.image_list.len()
	}

	fn get(&self, index: usize, rng: &mut WorkerRng) -> Result<Sample> {
		let index = wrap_index(index, self.len(), &self.name)?;
		let [path1, path2] = &self.image_list[index];
		let img1 = read_image(path1)?;
		let img2 = read_image(path2)?;
		if img1.dim() != img2.dim() {
			return Err(FlowError::shape_mismatch(img1.dim(), img2.dim()));
		}

		if self.options.is_prediction {
			let (_, h, w) = img1.dim();
			let (mut img1, mut img2) = match self.crop_window(h, w, rng)? {
				Some((y0, x0, ch, cw)) => {
					let window = s![.., y0..y0 + ch, x0..x0 + cw];
					(img1.slice(window).to_owned(), img2.slice(window).to_owned())
				}
				None => (img1, img2),
			};
			self.normalize(&mut img1);
			self.normalize(&mut img2);
			return Ok(Sample {
				img1,
				img2,
				flow: None,
				valid: None,
			});
		}

		let flow_path = self.flow_list.get(index).ok_or_else(|| {
			FlowError::InvalidParameter(format!("{} has no ground truth for pair {}", self.name, index))
		})?;
		let (flow, file_valid) = read_flow(flow_path)?;
		let valid = if self.options.sparse {
			Some(file_valid.unwrap_or_else(|| dense_valid_mask(&flow)))
		} else {
			None
		};

		let mut frame = FlowFrame { img1, img2, flow, valid };
		if let Some(augmentor) = &self.augmentor {
			frame = augmentor.apply(frame, rng)?;
		}
		let (_, h, w) = frame.img1.dim();
		if let Some((y0, x0, ch, cw)) = self.crop_window(h, w, rng)? {
			let window = s![.., y0..y0 + ch, x0..x0 + cw];
			frame = FlowFrame {
				img1: frame.img1.slice(window).to_owned(),
				img2: frame.img2.slice(window).to_owned(),
				flow: frame.flow.slice(window).to_owned(),
				valid: frame.valid.map(|v| v.slice(s![y0..y0 + ch, x0..x0 + cw]).to_owned()),
			};
		}

		let valid = match frame.valid {
			Some(valid) => valid,
			None => dense_valid_mask(&frame.flow),
		};
		self.normalize(&mut frame.img1);
		self.normalize(&mut frame.img2);
		Ok(Sample {
			img1: frame.img1,
			img2: frame.img2,
			flow: Some(frame.flow),
			valid: if self.options.append_valid_mask || self.options.sparse {
				Some(valid)
			} else {
				None
			},
		})
	}
}

/// Several datasets addressed as one; indices run through the parts in order.
#[derive(Debug, Clone, Default)]
pub struct ConcatDataset {
	parts: Vec<SharedDataset>,
	ends: Vec<usize>,
}

impl ConcatDataset {
	pub fn new(parts: Vec<SharedDataset>) -> Self {
		let mut concat = ConcatDataset::default();
		for part in parts {
			concat.push(part);
		}
		concat
	}

	pub fn push(&mut self, part: SharedDataset) {
		let end = self.len() + part.len();
		self.parts.push(part);
		self.ends.push(end);
	}

	pub fn parts(&self) -> &[SharedDataset] {
		&self.parts
	}
}

impl Dataset for ConcatDataset {
	fn len(&self) -> usize {
		self.ends.last().copied().unwrap_or(0)
	}

	fn get(&self, index: usize, rng: &mut WorkerRng) -> Result<Sample> {
		let index = wrap_index(index, self.len(), "concatenated dataset")?;
		let part = self.ends.partition_point(|&end| end <= index);
		let start = if part == 0 { 0 } else { self.ends[part - 1] };
		self.parts[part].get(index - start, rng)
	}
}

impl Add for FlowDataset {
	type Output = ConcatDataset;

	fn add(self, rhs: FlowDataset) -> ConcatDataset {
		let (lhs, rhs): (SharedDataset, SharedDataset) = (Arc::new(self), Arc::new(rhs));
		ConcatDataset::new(vec![lhs, rhs])
	}
}

impl<D: Dataset + 'static> Add<D> for ConcatDataset {
	type Output = ConcatDataset;

	fn add(mut self, rhs: D) -> ConcatDataset {
		self.push(Arc::new(rhs));
		self
	}
}

/// `v * dataset` oversamples the dataset `v` times.
impl Mul<FlowDataset> for usize {
	type Output = FlowDataset;

	fn mul(self, rhs: FlowDataset) -> FlowDataset {
		rhs.repeat(self)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::data::frame_utils::{write_flo, write_image};
	use tempfile::tempdir;

	fn write_pair(dir: &Path, stem: &str, value: f32, size: (usize, usize)) -> [PathBuf; 3] {
		let (h, w) = size;
		let img1 = dir.join(format!("{}_1.png", stem));
		let img2 = dir.join(format!("{}_2.png", stem));
		let flow = dir.join(format!("{}.flo", stem));
		write_image(&img1, &Array3::from_elem((3, h, w), value)).unwrap();
		write_image(&img2, &Array3::from_elem((3, h, w), value + 1.0)).unwrap();
		let mut f = Array3::from_elem((2, h, w), value);
		f[[0, 0, 0]] = 5000.0;
		write_flo(&flow, &f).unwrap();
		[img1, img2, flow]
	}

	#[test]
	fn training_sample_has_flow_and_optional_mask() {
		let dir = tempdir().unwrap();
		let [a, b, f] = write_pair(dir.path(), "a", 10.0, (4, 6));
		let mut options = DatasetOptions::default();
		options.append_valid_mask = true;
		let mut dataset = FlowDataset::new("test", options);
		dataset.push(&a, &b, &f).unwrap();

		let sample = dataset.get(3, &mut WorkerRng::new(0, 0)).unwrap();
		assert_eq!(sample.img1[[0, 0, 0]], 10.0);
		assert_eq!(sample.img2[[2, 3, 5]], 11.0);
		let valid = sample.valid.unwrap();
		assert_eq!(valid[[0, 0]], 0.0);
		assert_eq!(valid[[1, 1]], 1.0);
	}

	#[test]
	fn center_crop_and_prediction_mode() {
		let dir = tempdir().unwrap();
		let [a, b, _] = write_pair(dir.path(), "a", 3.0, (6, 8));
		let mut options = DatasetOptions::default();
		options.is_prediction = true;
		options.crop = CropOptions {
			enabled: true,
			size: [2, 4],
			crop_type: CropType::Center,
		};
		let mut dataset = FlowDataset::new("predict", options);
		dataset.push_images(&a, &b).unwrap();
		let sample = dataset.get(0, &mut WorkerRng::new(0, 0)).unwrap();
		assert_eq!(sample.img1.dim(), (3, 2, 4));
		assert!(sample.flow.is_none());

		let mut training = FlowDataset::new("train", DatasetOptions::default());
		assert!(training.push_images(&a, &b).is_err());
	}

	#[test]
	fn concat_and_repeat_follow_part_order() {
		let dir = tempdir().unwrap();
		let mut first = FlowDataset::new("first", DatasetOptions::default());
		let [a, b, f] = write_pair(dir.path(), "a", 1.0, (2, 2));
		first.push(&a, &b, &f).unwrap();
		let mut second = FlowDataset::new("second", DatasetOptions::default());
		let [a, b, f] = write_pair(dir.path(), "b", 2.0, (2, 2));
		second.push(&a, &b, &f).unwrap();

		let second = 3 * second;
		assert_eq!(second.len(), 3);
		assert_eq!(second.flow_list().len(), 3);

		let concat = first + second;
		assert_eq!(concat.len(), 4);
		let mut rng = WorkerRng::new(0, 0);
		assert_eq!(concat.get(0, &mut rng).unwrap().img1[[0, 0, 0]], 1.0);
		assert_eq!(concat.get(3, &mut rng).unwrap().img1[[0, 0, 0]], 2.0);
		assert_eq!(concat.get(4, &mut rng).unwrap().img1[[0, 0, 0]], 1.0);
	}

	#[test]
	fn empty_dataset_is_an_error() {
		let dataset = FlowDataset::new("empty", DatasetOptions::default());
		assert!(dataset.get(0, &mut WorkerRng::new(0, 0)).is_err());
	}
}
