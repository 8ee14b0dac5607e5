//! Batching over a [`Dataset`] with a fixed pool of loader threads.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::constants::{data, training};
use crate::data::{Batch, Dataset, SharedDataset, WorkerRng};
use crate::error::{FlowError, Result};

#[derive(Debug, Clone)]
pub struct DataLoaderOptions {
	pub batch_size: usize,
	pub shuffle: bool,
	pub drop_last: bool,
	/// 0 loads on the calling thread.
	pub num_workers: usize,
	pub seed: u64,
}

impl Default for DataLoaderOptions {
	fn default() -> Self {
		Self {
			batch_size: training::DEFAULT_BATCH_SIZE,
			shuffle: true,
			drop_last: true,
			num_workers: training::DEFAULT_NUM_WORKERS,
			seed: 0,
		}
	}
}

/// Splits a dataset into batches once per epoch.
///
/// Worker `w` loads batches `b` with `b % num_workers == w` and hands them
/// over through a bounded channel in whatever order they finish. Worker RNGs
/// live as long as the loader, so augmentation streams continue across epochs.
#[derive(Debug, Clone)]
pub struct DataLoader {
	dataset: SharedDataset,
	options: DataLoaderOptions,
	/// `(rank, world_size)` when each rank sees only its share.
	shard: Option<(usize, usize)>,
	epoch: usize,
	worker_rngs: Vec<Arc<Mutex<WorkerRng>>>,
}

fn lock(rng: &Mutex<WorkerRng>) -> MutexGuard<'_, WorkerRng> {
	rng.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DataLoader {
	pub fn new(dataset: SharedDataset, options: DataLoaderOptions) -> Result<Self> {
		if options.batch_size == 0 {
			return Err(FlowError::InvalidParameter("Batch size must be greater than 0".into()));
		}
		let worker_rngs = (0..options.num_workers.max(1))
			.map(|w| Arc::new(Mutex::new(WorkerRng::new(options.seed, w))))
			.collect();
		Ok(DataLoader {
			dataset,
			options,
			shard: None,
			epoch: 0,
			worker_rngs,
		})
	}

	/// Restricts this loader to the samples of `rank` out of `world_size`.
	pub fn with_shard(mut self, rank: usize, world_size: usize) -> Result<Self> {
		if world_size == 0 || rank >= world_size {
			return Err(FlowError::InvalidParameter(format!(
				"rank {} is outside a world of size {}",
				rank, world_size
			)));
		}
		self.shard = Some((rank, world_size));
		// ranks draw different augmentations
		let seed = self.options.seed.wrapping_add((rank * self.worker_rngs.len()) as u64);
		self.worker_rngs = (0..self.worker_rngs.len())
			.map(|w| Arc::new(Mutex::new(WorkerRng::new(seed, w))))
			.collect();
		Ok(self)
	}

	pub fn dataset(&self) -> &SharedDataset {
		&self.dataset
	}

	pub fn options(&self) -> &DataLoaderOptions {
		&self.options
	}

	pub fn epoch(&self) -> usize {
		self.epoch
	}

	pub fn set_epoch(&mut self, epoch: usize) {
		self.epoch = epoch;
	}

	/// Samples this loader's rank sees per epoch.
	pub fn num_samples(&self) -> usize {
		let n = self.dataset.len();
		match self.shard {
			Some((_, world)) => (n + world - 1) / world,
			None => n,
		}
	}

	/// Batches per epoch.
	pub fn len(&self) -> usize {
		let n = self.num_samples();
		let b = self.options.batch_size;
		if self.options.drop_last {
			n / b
		} else {
			(n + b - 1) / b
		}
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	fn plan(&self) -> Vec<Vec<usize>> {
		let n = self.dataset.len();
		let mut order: Vec<usize> = (0..n).collect();
		if self.options.shuffle {
			// identical on every rank so the shards stay disjoint
			let mut rng = StdRng::seed_from_u64(self.options.seed.wrapping_add(self.epoch as u64));
			order.shuffle(&mut rng);
		}
		if let Some((rank, world)) = self.shard {
			let total = self.num_samples() * world;
			let padding: Vec<usize> = order.iter().copied().cycle().take(total - n).collect();
			order.extend(padding);
			order = order.into_iter().skip(rank).step_by(world).collect();
		}
		let mut batches: Vec<Vec<usize>> = order.chunks(self.options.batch_size).map(|c| c.to_vec()).collect();
		if self.options.drop_last && batches.last().map_or(false, |b| b.len() < self.options.batch_size) {
			batches.pop();
		}
		batches
	}

	/// Starts the next epoch.
	pub fn batches(&mut self) -> Result<Batches> {
		let plan = self.plan();
		self.epoch += 1;
		let remaining = plan.len();

		if self.options.num_workers == 0 || plan.is_empty() {
			return Ok(Batches {
				inner: Inner::Inline {
					dataset: Arc::clone(&self.dataset),
					plan: plan.into(),
					rng: Arc::clone(&self.worker_rngs[0]),
				},
				remaining,
			});
		}

		let workers = self.options.num_workers.min(plan.len());
		let (tx, rx) = bounded(workers * data::PREFETCH_BATCHES_PER_WORKER);
		let plan = Arc::new(plan);
		let mut handles = Vec::with_capacity(workers);
		for w in 0..workers {
			let tx = tx.clone();
			let plan = Arc::clone(&plan);
			let dataset = Arc::clone(&self.dataset);
			let rng = Arc::clone(&self.worker_rngs[w]);
			let handle = thread::Builder::new()
				.name(format!("loader-{}", w))
				.spawn(move || {
					let mut rng = lock(&rng);
					for indices in plan.iter().skip(w).step_by(workers) {
						let result = load_batch(dataset.as_ref(), indices, &mut rng);
						let failed = result.is_err();
						if tx.send(result).is_err() || failed {
							break;
						}
					}
				})?;
			handles.push(handle);
		}
		tracing::debug!("Started {} loader workers for {} batches", workers, remaining);

		Ok(Batches {
			inner: Inner::Workers {
				rx: Some(rx),
				handles,
			},
			remaining,
		})
	}
}

fn load_batch(dataset: &dyn Dataset, indices: &[usize], rng: &mut WorkerRng) -> Result<Batch> {
	let samples = indices
		.iter()
		.map(|&i| dataset.get(i, rng))
		.collect::<Result<Vec<_>>>()?;
	Batch::collate(&samples)
}

enum Inner {
	Inline {
		dataset: SharedDataset,
		plan: VecDeque<Vec<usize>>,
		rng: Arc<Mutex<WorkerRng>>,
	},
	Workers {
		rx: Option<Receiver<Result<Batch>>>,
		handles: Vec<JoinHandle<()>>,
	},
}

/// One epoch of batches.
pub struct Batches {
	inner: Inner,
	remaining: usize,
}

impl Iterator for Batches {
	type Item = Result<Batch>;

	fn next(&mut self) -> Option<Result<Batch>> {
		if self.remaining == 0 {
			return None;
		}
		let item = match &mut self.inner {
			Inner::Inline { dataset, plan, rng } => {
				let indices = plan.pop_front()?;
				load_batch(dataset.as_ref(), &indices, &mut lock(rng))
			}
			Inner::Workers { rx, .. } => rx.as_ref()?.recv().ok()?,
		};
		self.remaining -= 1;
		Some(item)
	}

	fn size_hint(&self) -> (usize, Option<usize>) {
		(0, Some(self.remaining))
	}
}

impl Drop for Batches {
	fn drop(&mut self) {
		if let Inner::Workers { rx, handles } = &mut self.inner {
			// unblocks workers waiting on a full channel
			drop(rx.take());
			for handle in handles.drain(..) {
				if handle.join().is_err() {
					tracing::error!("A loader worker panicked");
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::data::dataset::{InMemoryDataset, SyntheticShiftArgs};

	fn dataset(len: usize) -> SharedDataset {
		Arc::new(
			InMemoryDataset::synthetic_shift(&SyntheticShiftArgs {
				len,
				height: 4,
				width: 4,
				..Default::default()
			})
			.unwrap(),
		)
	}

	fn options(batch_size: usize, num_workers: usize, drop_last: bool) -> DataLoaderOptions {
		DataLoaderOptions {
			batch_size,
			shuffle: false,
			drop_last,
			num_workers,
			seed: 0,
		}
	}

	#[test]
	fn drop_last_controls_the_partial_batch() {
		let mut loader = DataLoader::new(dataset(5), options(2, 0, true)).unwrap();
		assert_eq!(loader.len(), 2);
		assert_eq!(loader.batches().unwrap().count(), 2);

		let mut loader = DataLoader::new(dataset(5), options(2, 0, false)).unwrap();
		let sizes: Vec<usize> = loader.batches().unwrap().map(|b| b.unwrap().len()).collect();
		assert_eq!(sizes, vec![2, 2, 1]);
	}

	#[test]
	fn workers_deliver_every_batch() {
		let mut loader = DataLoader::new(dataset(12), options(2, 3, true)).unwrap();
		for _ in 0..2 {
			let batches: Vec<Batch> = loader.batches().unwrap().collect::<Result<_>>().unwrap();
			assert_eq!(batches.len(), 6);
		}
		assert_eq!(loader.epoch(), 2);
	}

	#[test]
	fn shards_split_and_pad_the_epoch() {
		let base = DataLoader::new(dataset(5), options(1, 0, false)).unwrap();
		let rank0 = base.clone().with_shard(0, 2).unwrap();
		let rank1 = base.with_shard(1, 2).unwrap();
		assert_eq!(rank0.plan().concat(), vec![0, 2, 4]);
		assert_eq!(rank1.plan().concat(), vec![1, 3, 0]);
		assert_eq!(rank1.len(), 3);
	}

	#[test]
	fn early_drop_stops_workers() {
		let mut loader = DataLoader::new(dataset(40), options(1, 2, true)).unwrap();
		let mut batches = loader.batches().unwrap();
		assert!(batches.next().unwrap().is_ok());
		drop(batches);
	}
}
