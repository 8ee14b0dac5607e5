//! The public optical-flow benchmarks, each laid out the way it ships.

use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use crate::data::dataset::{DatasetOptions, FlowDataset};
use crate::error::{FlowError, Result};
use crate::registry::{Configurable, Registries};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
	Training,
	Validation,
	#[serde(alias = "testing")]
	Test,
}

impl Default for Split {
	fn default() -> Self {
		Split::Training
	}
}

fn default_repeat() -> usize {
	1
}

fn sorted_glob(pattern: &Path) -> Result<Vec<PathBuf>> {
	let pattern = pattern
		.to_str()
		.ok_or_else(|| FlowError::InvalidParameter(format!("non UTF-8 path {}", pattern.display())))?;
	let mut paths = glob::glob(pattern)
		.map_err(|e| FlowError::InvalidParameter(format!("bad glob pattern '{}': {}", pattern, e)))?
		.collect::<std::result::Result<Vec<_>, _>>()
		.map_err(|e| FlowError::Io(e.into_error()))?;
	paths.sort();
	Ok(paths)
}

fn unsupported(dataset: &str, split: Split) -> FlowError {
	FlowError::InvalidParameter(format!("{} has no {:?} split", dataset, split))
}

fn finish(dataset: FlowDataset, repeat: usize) -> FlowDataset {
	if dataset.image_list().is_empty() {
		tracing::warn!("{} found no image pairs", dataset.name());
	} else {
		tracing::debug!("{} found {} image pairs", dataset.name(), dataset.image_list().len());
	}
	repeat * dataset
}

macro_rules! benchmark_dataset {
	($name:ident, $args:ident) => {
		#[derive(Debug, Clone)]
		pub struct $name(FlowDataset);

		impl $name {
			pub fn into_inner(self) -> FlowDataset {
				self.0
			}
		}

		impl Deref for $name {
			type Target = FlowDataset;

			fn deref(&self) -> &FlowDataset {
				&self.0
			}
		}

		impl From<$name> for FlowDataset {
			fn from(dataset: $name) -> FlowDataset {
				dataset.0
			}
		}

		impl Configurable for $name {
			type Args = $args;

			fn from_args(args: Self::Args, _registries: &Registries) -> Result<Self> {
				Self::new(args)
			}
		}
	};
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlyingChairsArgs {
	pub root_dir: PathBuf,
	#[serde(default)]
	pub split: Split,
	#[serde(default = "default_repeat")]
	pub repeat: usize,
	#[serde(default)]
	pub options: DatasetOptions,
}

benchmark_dataset!(FlyingChairs, FlyingChairsArgs);

impl FlyingChairs {
	/// `data/*.ppm` pairs with `data/*.flo`; `chairs_split.txt` marks each
	/// pair 1 (training) or 2 (validation).
	pub fn new(args: FlyingChairsArgs) -> Result<Self> {
		let wanted = match args.split {
			Split::Training => 1,
			Split::Validation => 2,
			Split::Test => return Err(unsupported("FlyingChairs", args.split)),
		};
		let images = sorted_glob(&args.root_dir.join("data").join("*.ppm"))?;
		let flows = sorted_glob(&args.root_dir.join("data").join("*.flo"))?;
		if images.len() != 2 * flows.len() {
			return Err(FlowError::invalid_data(
				&args.root_dir,
				format!("{} images for {} flow files", images.len(), flows.len()),
			));
		}

		let split_file = args.root_dir.join("chairs_split.txt");
		let split_list: Option<Vec<u8>> = if split_file.exists() {
			let text = fs::read_to_string(&split_file)?;
			let ids = text
				.split_whitespace()
				.map(|t| t.parse::<u8>())
				.collect::<std::result::Result<Vec<_>, _>>()
				.map_err(|e| FlowError::invalid_data(&split_file, e.to_string()))?;
			Some(ids)
		} else {
			None
		};

		let mut dataset = FlowDataset::new("FlyingChairs", args.options);
		for (i, flow) in flows.iter().enumerate() {
			let id = match &split_list {
				Some(ids) => *ids
					.get(i)
					.ok_or_else(|| FlowError::invalid_data(&split_file, "split list is shorter than the data"))?,
				None => 1,
			};
			if id == wanted {
				dataset.push(&images[2 * i], &images[2 * i + 1], flow)?;
			}
		}
		Ok(FlyingChairs(finish(dataset, args.repeat)))
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlyingThings3DArgs {
	pub root_dir: PathBuf,
	#[serde(default)]
	pub split: Split,
	#[serde(default = "default_things_dstype")]
	pub dstype: String,
	#[serde(default = "default_repeat")]
	pub repeat: usize,
	#[serde(default)]
	pub options: DatasetOptions,
}

fn default_things_dstype() -> String {
	"frames_cleanpass".to_string()
}

benchmark_dataset!(FlyingThings3D, FlyingThings3DArgs);

impl FlyingThings3D {
	/// Left-camera frames in both temporal directions.
	pub fn new(args: FlyingThings3DArgs) -> Result<Self> {
		let subset = match args.split {
			Split::Training => "TRAIN",
			Split::Validation | Split::Test => "TEST",
		};
		let mut dataset = FlowDataset::new("FlyingThings3D", args.options);
		let image_dirs = sorted_glob(&args.root_dir.join(&args.dstype).join(subset).join("*").join("*"))?;
		let flow_dirs = sorted_glob(&args.root_dir.join("optical_flow").join(subset).join("*").join("*"))?;

		for direction in ["into_future", "into_past"] {
			for (image_dir, flow_dir) in image_dirs.iter().zip(&flow_dirs) {
				let images = sorted_glob(&image_dir.join("left").join("*.png"))?;
				let flows = sorted_glob(&flow_dir.join(direction).join("left").join("*.pfm"))?;
				let pairs = flows.len().min(images.len()).saturating_sub(1);
				for i in 0..pairs {
					if direction == "into_future" {
						dataset.push(&images[i], &images[i + 1], &flows[i])?;
					} else {
						dataset.push(&images[i + 1], &images[i], &flows[i + 1])?;
					}
				}
			}
		}
		Ok(FlyingThings3D(finish(dataset, args.repeat)))
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MpiSintelArgs {
	pub root_dir: PathBuf,
	#[serde(default)]
	pub split: Split,
	#[serde(default = "default_sintel_dstype")]
	pub dstype: String,
	#[serde(default = "default_repeat")]
	pub repeat: usize,
	#[serde(default)]
	pub options: DatasetOptions,
}

fn default_sintel_dstype() -> String {
	"clean".to_string()
}

benchmark_dataset!(MpiSintel, MpiSintelArgs);

impl MpiSintel {
	/// `{split}/{dstype}/{scene}/*.png` with `{split}/flow/{scene}/*.flo`.
	/// The test split has no ground truth and loads in prediction mode.
	pub fn new(mut args: MpiSintelArgs) -> Result<Self> {
		let split_dir = match args.split {
			Split::Training => "training",
			Split::Test => "test",
			Split::Validation => return Err(unsupported("MpiSintel", args.split)),
		};
		let with_flow = args.split == Split::Training && !args.options.is_prediction;
		args.options.is_prediction = !with_flow;

		let image_root = args.root_dir.join(split_dir).join(&args.dstype);
		let flow_root = args.root_dir.join(split_dir).join("flow");
		let mut dataset = FlowDataset::new("MpiSintel", args.options);
		for scene in sorted_glob(&image_root.join("*"))? {
			let images = sorted_glob(&scene.join("*.png"))?;
			let flows = match (with_flow, scene.file_name()) {
				(true, Some(name)) => sorted_glob(&flow_root.join(name).join("*.flo"))?,
				_ => Vec::new(),
			};
			for i in 0..images.len().saturating_sub(1) {
				if with_flow {
					let flow = flows.get(i).ok_or_else(|| {
						FlowError::invalid_data(&scene, format!("missing flow file for frame {}", i))
					})?;
					dataset.push(&images[i], &images[i + 1], flow)?;
				} else {
					dataset.push_images(&images[i], &images[i + 1])?;
				}
			}
		}
		Ok(MpiSintel(finish(dataset, args.repeat)))
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KittiArgs {
	pub root_dir: PathBuf,
	#[serde(default)]
	pub split: Split,
	#[serde(default = "default_repeat")]
	pub repeat: usize,
	#[serde(default)]
	pub options: DatasetOptions,
}

benchmark_dataset!(Kitti, KittiArgs);

impl Kitti {
	/// `{split}/image_2/*_10.png` and `*_11.png` with sparse
	/// `{split}/flow_occ/*_10.png` ground truth.
	pub fn new(mut args: KittiArgs) -> Result<Self> {
		let split_dir = match args.split {
			Split::Training => "training",
			Split::Test => "testing",
			Split::Validation => return Err(unsupported("Kitti", args.split)),
		};
		let with_flow = args.split == Split::Training && !args.options.is_prediction;
		args.options.is_prediction = !with_flow;
		args.options.sparse = true;

		let root = args.root_dir.join(split_dir);
		let first = sorted_glob(&root.join("image_2").join("*_10.png"))?;
		let second = sorted_glob(&root.join("image_2").join("*_11.png"))?;
		if first.len() != second.len() {
			return Err(FlowError::invalid_data(
				root.join("image_2"),
				format!("{} first frames for {} second frames", first.len(), second.len()),
			));
		}

		let mut dataset = FlowDataset::new("Kitti", args.options);
		if with_flow {
			let flows = sorted_glob(&root.join("flow_occ").join("*_10.png"))?;
			if flows.len() != first.len() {
				return Err(FlowError::invalid_data(
					root.join("flow_occ"),
					format!("{} flow files for {} image pairs", flows.len(), first.len()),
				));
			}
			for ((img1, img2), flow) in first.iter().zip(&second).zip(&flows) {
				dataset.push(img1, img2, flow)?;
			}
		} else {
			for (img1, img2) in first.iter().zip(&second) {
				dataset.push_images(img1, img2)?;
			}
		}
		Ok(Kitti(finish(dataset, args.repeat)))
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HD1KArgs {
	pub root_dir: PathBuf,
	#[serde(default = "default_repeat")]
	pub repeat: usize,
	#[serde(default)]
	pub options: DatasetOptions,
}

benchmark_dataset!(HD1K, HD1KArgs);

impl HD1K {
	/// Sequences `%06d` of `hd1k_input/image_2` frames with sparse
	/// `hd1k_flow_gt/flow_occ` ground truth, read until a sequence is missing.
	pub fn new(mut args: HD1KArgs) -> Result<Self> {
		args.options.sparse = true;
		let mut dataset = FlowDataset::new("HD1K", args.options);
		for seq_ix in 0.. {
			let pattern = format!("{:06}_*.png", seq_ix);
			let flows = sorted_glob(&args.root_dir.join("hd1k_flow_gt").join("flow_occ").join(&pattern))?;
			if flows.is_empty() {
				break;
			}
			let images = sorted_glob(&args.root_dir.join("hd1k_input").join("image_2").join(&pattern))?;
			if images.len() < flows.len() {
				return Err(FlowError::invalid_data(
					&args.root_dir,
					format!("sequence {} has {} frames for {} flow files", seq_ix, images.len(), flows.len()),
				));
			}
			for i in 0..flows.len() - 1 {
				dataset.push(&images[i], &images[i + 1], &flows[i])?;
			}
		}
		Ok(HD1K(finish(dataset, args.repeat)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::data::frame_utils::{write_flo, write_flow_kitti, write_image};
	use crate::data::{Dataset, WorkerRng};
	use ndarray::{Array2, Array3};
	use std::fs::create_dir_all;
	use tempfile::tempdir;

	fn image(path: &Path) {
		create_dir_all(path.parent().unwrap()).unwrap();
		write_image(path, &Array3::from_elem((3, 4, 4), 7.0)).unwrap();
	}

	#[test]
	fn chairs_respects_split_file() {
		let dir = tempdir().unwrap();
		let data = dir.path().join("data");
		create_dir_all(&data).unwrap();
		for i in 0..3 {
			// ppm is written through the image crate as well
			image(&data.join(format!("{:05}_img1.ppm", i)));
			image(&data.join(format!("{:05}_img2.ppm", i)));
			write_flo(data.join(format!("{:05}_flow.flo", i)), &Array3::zeros((2, 4, 4))).unwrap();
		}
		fs::write(dir.path().join("chairs_split.txt"), "1\n2\n1\n").unwrap();

		let args = |split| FlyingChairsArgs {
			root_dir: dir.path().to_path_buf(),
			split,
			repeat: 1,
			options: DatasetOptions::default(),
		};
		let training = FlyingChairs::new(args(Split::Training)).unwrap();
		assert_eq!(training.len(), 2);
		assert!(training.image_list()[1][0].ends_with("00002_img1.ppm"));
		let validation = FlyingChairs::new(args(Split::Validation)).unwrap();
		assert_eq!(validation.len(), 1);
		assert!(FlyingChairs::new(args(Split::Test)).is_err());
	}

	#[test]
	fn kitti_is_sparse_and_masks_every_sample() {
		let dir = tempdir().unwrap();
		let root = dir.path().join("training");
		image(&root.join("image_2").join("000000_10.png"));
		image(&root.join("image_2").join("000000_11.png"));
		create_dir_all(root.join("flow_occ")).unwrap();
		let mut valid = Array2::ones((4, 4));
		valid[[0, 1]] = 0.0;
		write_flow_kitti(root.join("flow_occ").join("000000_10.png"), &Array3::zeros((2, 4, 4)), &valid).unwrap();

		let kitti = Kitti::new(KittiArgs {
			root_dir: dir.path().to_path_buf(),
			split: Split::Training,
			repeat: 2,
			options: DatasetOptions::default(),
		})
		.unwrap();
		assert!(kitti.is_sparse());
		assert_eq!(kitti.len(), 2);
		let sample = kitti.get(1, &mut WorkerRng::new(0, 0)).unwrap();
		assert_eq!(sample.valid.unwrap(), valid);
	}

	#[test]
	fn hd1k_walks_sequences() {
		let dir = tempdir().unwrap();
		for seq in 0..2 {
			for frame in 0..3 {
				let name = format!("{:06}_{:04}.png", seq, frame);
				image(&dir.path().join("hd1k_input").join("image_2").join(&name));
				let flow_path = dir.path().join("hd1k_flow_gt").join("flow_occ").join(&name);
				create_dir_all(flow_path.parent().unwrap()).unwrap();
				write_flow_kitti(flow_path, &Array3::zeros((2, 4, 4)), &Array2::ones((4, 4))).unwrap();
			}
		}
		let hd1k = HD1K::new(HD1KArgs {
			root_dir: dir.path().to_path_buf(),
			repeat: 1,
			options: DatasetOptions::default(),
		})
		.unwrap();
		assert_eq!(hd1k.len(), 4);
	}

	#[test]
	fn args_require_root_dir() {
		let node = crate::config::CfgNode::parse("split = \"training\"").unwrap();
		assert!(node.deserialize::<FlyingChairsArgs>().is_err());
		let node = crate::config::CfgNode::parse("root_dir = \"/data\"\nsplit = \"testing\"").unwrap();
		assert_eq!(node.deserialize::<KittiArgs>().unwrap().split, Split::Test);
	}
}
