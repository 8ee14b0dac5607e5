//! Datasets, frame I/O and batching.

pub mod creator;
pub mod dataset;
pub mod frame_utils;
pub mod loader;

pub use self::creator::DataloaderCreator;
pub use self::dataset::{ConcatDataset, DatasetOptions, FlowDataset, InMemoryDataset};
pub use self::loader::{Batches, DataLoader, DataLoaderOptions};

use std::fmt;
use std::sync::Arc;

use ndarray::{stack, Array2, Array3, Array4, ArrayView2, ArrayView3, Axis};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use crate::error::{FlowError, Result};
use crate::functional::FlowTarget;

/// One image pair with optional ground truth.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
	/// `[3, H, W]`
	pub img1: Array3<f32>,
	pub img2: Array3<f32>,
	/// `[2, H, W]`, absent in prediction mode.
	pub flow: Option<Array3<f32>>,
	/// `[H, W]`
	pub valid: Option<Array2<f32>>,
}

impl Sample {
	pub fn hw(&self) -> (usize, usize) {
		let (_, h, w) = self.img1.dim();
		(h, w)
	}
}

/// Samples stacked along a new leading batch axis.
#[derive(Debug, Clone)]
pub struct Batch {
	pub img1: Array4<f32>,
	pub img2: Array4<f32>,
	pub flow: Option<Array4<f32>>,
	pub valid: Option<Array3<f32>>,
}

impl Batch {
	pub fn collate(samples: &[Sample]) -> Result<Batch> {
		let first = samples
			.first()
			.ok_or_else(|| FlowError::InvalidParameter("cannot collate an empty batch".into()))?;
		for sample in samples {
			if sample.img1.dim() != first.img1.dim() || sample.img2.dim() != first.img1.dim() {
				return Err(FlowError::shape_mismatch(first.img1.dim(), sample.img1.dim()));
			}
		}

		let img1 = stack3(samples.iter().map(|s| &s.img1))?;
		let img2 = stack3(samples.iter().map(|s| &s.img2))?;

		let flow = match samples.iter().map(|s| s.flow.as_ref()).collect::<Option<Vec<_>>>() {
			Some(flows) => Some(stack3(flows.into_iter())?),
			None if samples.iter().all(|s| s.flow.is_none()) => None,
			None => return Err(FlowError::InvalidParameter("batch mixes samples with and without flow".into())),
		};
		let valid = match samples.iter().map(|s| s.valid.as_ref()).collect::<Option<Vec<_>>>() {
			Some(masks) => Some(stack(
				Axis(0),
				&masks.iter().map(|m| m.view()).collect::<Vec<ArrayView2<f32>>>(),
			)?),
			None if samples.iter().all(|s| s.valid.is_none()) => None,
			None => {
				return Err(FlowError::InvalidParameter(
					"batch mixes samples with and without valid masks".into(),
				))
			}
		};
		Ok(Batch { img1, img2, flow, valid })
	}

	pub fn len(&self) -> usize {
		self.img1.len_of(Axis(0))
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Ground truth divided by `scale_factor`, ready for a criterion.
	pub fn target(&self, scale_factor: f32) -> Result<FlowTarget> {
		let flow = self
			.flow
			.as_ref()
			.ok_or_else(|| FlowError::InvalidParameter("batch has no ground-truth flow".into()))?;
		Ok(FlowTarget::new(flow.mapv(|v| v / scale_factor), self.valid.clone()))
	}
}

fn stack3<'a>(arrays: impl Iterator<Item = &'a Array3<f32>>) -> Result<Array4<f32>> {
	let views: Vec<ArrayView3<f32>> = arrays.map(|a| a.view()).collect();
	Ok(stack(Axis(0), &views)?)
}

/// Indexable source of samples, shared read-only between loader workers.
pub trait Dataset: Send + Sync + fmt::Debug {
	fn len(&self) -> usize;

	/// Indices wrap around the dataset length.
	fn get(&self, index: usize, rng: &mut WorkerRng) -> Result<Sample>;

	fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

pub type SharedDataset = Arc<dyn Dataset>;

pub(crate) fn wrap_index(index: usize, len: usize, what: &str) -> Result<usize> {
	if len == 0 {
		return Err(FlowError::InvalidParameter(format!("{} is empty", what)));
	}
	Ok(index % len)
}

/// Random source owned by one loader worker.
///
/// The generator is seeded from `base_seed + worker_id` the first time it is
/// used and then keeps its state for the worker's lifetime.
pub struct WorkerRng {
	base_seed: u64,
	worker_id: usize,
	rng: Option<StdRng>,
}

impl WorkerRng {
	pub fn new(base_seed: u64, worker_id: usize) -> Self {
		WorkerRng {
			base_seed,
			worker_id,
			rng: None,
		}
	}

	pub fn worker_id(&self) -> usize {
		self.worker_id
	}

	pub fn is_seeded(&self) -> bool {
		self.rng.is_some()
	}

	fn inner(&mut self) -> &mut StdRng {
		let seed = self.base_seed.wrapping_add(self.worker_id as u64);
		self.rng.get_or_insert_with(|| StdRng::seed_from_u64(seed))
	}
}

impl fmt::Debug for WorkerRng {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("WorkerRng")
			.field("base_seed", &self.base_seed)
			.field("worker_id", &self.worker_id)
			.field("seeded", &self.is_seeded())
			.finish()
	}
}

impl RngCore for WorkerRng {
	fn next_u32(&mut self) -> u32 {
		self.inner().next_u32()
	}

	fn next_u64(&mut self) -> u64 {
		self.inner().next_u64()
	}

	fn fill_bytes(&mut self, dest: &mut [u8]) {
		self.inner().fill_bytes(dest)
	}

	fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
		self.inner().try_fill_bytes(dest)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rand::Rng;

	fn sample(value: f32, with_flow: bool) -> Sample {
		Sample {
			img1: Array3::from_elem((3, 2, 2), value),
			img2: Array3::from_elem((3, 2, 2), value + 1.0),
			flow: if with_flow { Some(Array3::from_elem((2, 2, 2), value)) } else { None },
			valid: None,
		}
	}

	#[test]
	fn worker_rng_seeds_lazily_and_once() {
		let mut a = WorkerRng::new(10, 2);
		assert!(!a.is_seeded());
		let first: u64 = a.gen();
		assert!(a.is_seeded());
		let second: u64 = a.gen();
		assert_ne!(first, second);

		let mut b = WorkerRng::new(11, 1);
		assert_eq!(first, b.gen::<u64>());
	}

	#[test]
	fn collate_stacks_samples() {
		let batch = Batch::collate(&[sample(0.0, true), sample(2.0, true)]).unwrap();
		assert_eq!(batch.len(), 2);
		assert_eq!(batch.img2.dim(), (2, 3, 2, 2));
		assert_eq!(batch.flow.as_ref().unwrap()[[1, 0, 0, 0]], 2.0);
		let target = batch.target(2.0).unwrap();
		assert_eq!(target.flow[[1, 0, 0, 0]], 1.0);
	}

	#[test]
	fn collate_rejects_mixed_ground_truth() {
		assert!(Batch::collate(&[sample(0.0, true), sample(1.0, false)]).is_err());
		let batch = Batch::collate(&[sample(0.0, false)]).unwrap();
		assert!(batch.flow.is_none());
		assert!(batch.target(1.0).is_err());
	}
}
