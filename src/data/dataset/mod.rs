mod base;
pub mod benchmarks;
mod memory;

pub use self::base::{AugmentOptions, ConcatDataset, CropOptions, CropType, DatasetOptions, FlowDataset, NormParams};
pub use self::benchmarks::{FlyingChairs, FlyingThings3D, Kitti, MpiSintel, Split, HD1K};
pub use self::memory::{InMemoryDataset, SyntheticShift, SyntheticShiftArgs};

use std::sync::Arc;

use crate::data::SharedDataset;
use crate::error::Result;
use crate::registry::{builder_for, Registry};

pub fn register(registry: &mut Registry<SharedDataset>) -> Result<()> {
	registry.register(
		"FlyingChairs",
		builder_for(|d: FlyingChairs| Arc::new(d.into_inner()) as SharedDataset),
	)?;
	registry.register(
		"FlyingThings3D",
		builder_for(|d: FlyingThings3D| Arc::new(d.into_inner()) as SharedDataset),
	)?;
	registry.register(
		"MpiSintel",
		builder_for(|d: MpiSintel| Arc::new(d.into_inner()) as SharedDataset),
	)?;
	registry.register(
		"Kitti",
		builder_for(|d: Kitti| Arc::new(d.into_inner()) as SharedDataset),
	)?;
	registry.register(
		"HD1K",
		builder_for(|d: HD1K| Arc::new(d.into_inner()) as SharedDataset),
	)?;
	registry.register(
		"SyntheticShift",
		builder_for(|d: SyntheticShift| Arc::new(d.into_inner()) as SharedDataset),
	)?;
	Ok(())
}
