use std::path::PathBuf;
use std::sync::Arc;

use crate::config::CfgNode;
use crate::data::dataset::benchmarks::{FlyingChairsArgs, FlyingThings3DArgs, HD1KArgs, KittiArgs, MpiSintelArgs};
use crate::data::dataset::{ConcatDataset, DatasetOptions, FlyingChairs, FlyingThings3D, Kitti, MpiSintel, Split, HD1K};
use crate::data::loader::{DataLoader, DataLoaderOptions};
use crate::data::{Dataset, SharedDataset};
use crate::error::{FlowError, Result};
use crate::registry::Registries;

/// Collects datasets and turns them into a single [`DataLoader`].
#[derive(Debug, Clone)]
pub struct DataloaderCreator {
	options: DataLoaderOptions,
	datasets: Vec<SharedDataset>,
}

impl DataloaderCreator {
	pub fn new(options: DataLoaderOptions) -> Self {
		DataloaderCreator {
			options,
			datasets: Vec::new(),
		}
	}

	pub fn add(&mut self, dataset: SharedDataset) {
		self.datasets.push(dataset);
	}

	/// Builds a dataset from a `{ name = "...", ... }` node.
	pub fn add_from_config(&mut self, node: &CfgNode, registries: &Registries) -> Result<()> {
		let dataset = registries.datasets.build_node(node, registries)?;
		self.add(dataset);
		Ok(())
	}

	pub fn add_flying_chairs(&mut self, root_dir: impl Into<PathBuf>, split: Split, options: DatasetOptions) -> Result<()> {
		let dataset = FlyingChairs::new(FlyingChairsArgs {
			root_dir: root_dir.into(),
			split,
			repeat: 1,
			options,
		})?;
		self.add(Arc::new(dataset.into_inner()));
		Ok(())
	}

	pub fn add_flying_things3d(
		&mut self,
		root_dir: impl Into<PathBuf>,
		split: Split,
		dstype: &str,
		options: DatasetOptions,
	) -> Result<()> {
		let dataset = FlyingThings3D::new(FlyingThings3DArgs {
			root_dir: root_dir.into(),
			split,
			dstype: dstype.to_string(),
			repeat: 1,
			options,
		})?;
		self.add(Arc::new(dataset.into_inner()));
		Ok(())
	}

	pub fn add_mpi_sintel(
		&mut self,
		root_dir: impl Into<PathBuf>,
		split: Split,
		dstype: &str,
		options: DatasetOptions,
	) -> Result<()> {
		let dataset = MpiSintel::new(MpiSintelArgs {
			root_dir: root_dir.into(),
			split,
			dstype: dstype.to_string(),
			repeat: 1,
			options,
		})?;
		self.add(Arc::new(dataset.into_inner()));
		Ok(())
	}

	pub fn add_kitti(&mut self, root_dir: impl Into<PathBuf>, split: Split, options: DatasetOptions) -> Result<()> {
		let dataset = Kitti::new(KittiArgs {
			root_dir: root_dir.into(),
			split,
			repeat: 1,
			options,
		})?;
		self.add(Arc::new(dataset.into_inner()));
		Ok(())
	}

	pub fn add_hd1k(&mut self, root_dir: impl Into<PathBuf>, options: DatasetOptions) -> Result<()> {
		let dataset = HD1K::new(HD1KArgs {
			root_dir: root_dir.into(),
			repeat: 1,
			options,
		})?;
		self.add(Arc::new(dataset.into_inner()));
		Ok(())
	}

	pub fn num_datasets(&self) -> usize {
		self.datasets.len()
	}

	/// Concatenates everything added so far, in order.
	pub fn get_dataloader(&self) -> Result<DataLoader> {
		let dataset: SharedDataset = match self.datasets.as_slice() {
			[] => return Err(FlowError::InvalidParameter("No datasets were added".into())),
			[single] => Arc::clone(single),
			many => Arc::new(ConcatDataset::new(many.to_vec())),
		};
		tracing::info!("Total image pairs: {}", dataset.len());
		DataLoader::new(dataset, self.options.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::data::dataset::InMemoryDataset;

	#[test]
	fn empty_creator_is_an_error() {
		let creator = DataloaderCreator::new(DataLoaderOptions::default());
		let err = creator.get_dataloader().unwrap_err();
		assert!(err.to_string().contains("No datasets were added"));
	}

	#[test]
	fn datasets_from_config_are_concatenated() {
		let registries = Registries::with_defaults();
		let mut creator = DataloaderCreator::new(DataLoaderOptions {
			batch_size: 2,
			num_workers: 0,
			..Default::default()
		});
		let node = CfgNode::empty()
			.with("name", "SyntheticShift")
			.with("len", 3)
			.with("height", 4)
			.with("width", 4);
		creator.add_from_config(&node, &registries).unwrap();
		creator.add(Arc::new(InMemoryDataset::new(Vec::new())));
		creator.add_from_config(&node, &registries).unwrap();
		let loader = creator.get_dataloader().unwrap();
		assert_eq!(loader.dataset().len(), 6);
		assert_eq!(loader.len(), 3);

		let bad = CfgNode::empty().with("name", "FlyingChairs");
		assert!(creator.add_from_config(&bad, &registries).is_err());
	}
}
