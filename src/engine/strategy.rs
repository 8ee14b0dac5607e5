//! How a training run is placed on devices: one device, or one rank per
//! accelerator with gradients averaged across ranks.

use std::fmt;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use ndarray::{ArrayD, ArrayViewD};

use crate::config::{DistributedSection, TrainerConfig};
use crate::engine::device::{Device, DeviceProvider, DeviceSpec, EnvDeviceProvider};
use crate::error::{FlowError, Result};
use crate::nn::Param;

/// Devices chosen for a run, one per rank.
#[derive(Debug)]
pub struct Placement {
	pub devices: Vec<Device>,
	pub mixed_precision: bool,
	coordinator: Option<Coordinator>,
}

impl Placement {
	pub fn single(device: Device, mixed_precision: bool) -> Self {
		Placement {
			devices: vec![device],
			mixed_precision,
			coordinator: None,
		}
	}

	pub fn world_size(&self) -> usize {
		self.devices.len()
	}

	pub fn is_distributed(&self) -> bool {
		self.coordinator.is_some()
	}

	pub fn coordinator(&self) -> Option<&Coordinator> {
		self.coordinator.as_ref()
	}
}

pub trait ExecutionStrategy: fmt::Debug + Send + Sync {
	fn name(&self) -> &'static str;

	/// Resolves the configured devices. Fails before any trainer state changes.
	fn place(&self, config: &TrainerConfig) -> Result<Placement>;
}

/// Picks the strategy the configuration asks for, with devices from the
/// environment.
pub fn from_config(config: &TrainerConfig) -> Box<dyn ExecutionStrategy> {
	let provider = Arc::new(EnvDeviceProvider);
	if config.distributed.enabled {
		Box::new(Distributed::new(provider))
	} else {
		Box::new(SingleDevice::new(provider))
	}
}

#[derive(Debug, Clone)]
pub struct SingleDevice {
	provider: Arc<dyn DeviceProvider>,
}

impl SingleDevice {
	pub fn new(provider: Arc<dyn DeviceProvider>) -> Self {
		SingleDevice { provider }
	}
}

impl ExecutionStrategy for SingleDevice {
	fn name(&self) -> &'static str {
		"single-device"
	}

	fn place(&self, config: &TrainerConfig) -> Result<Placement> {
		let spec: DeviceSpec = config.device.parse()?;
		let id = match spec {
			DeviceSpec::Cpu => {
				tracing::info!("Running on CPU");
				return Ok(Placement::single(Device::Cpu, false));
			}
			DeviceSpec::Ids(ids) if ids.len() == 1 => ids[0],
			_ => {
				return Err(FlowError::Device(
					"Multiple devices are not supported on a single device, use the distributed strategy".into(),
				))
			}
		};
		let available = self.provider.accelerator_count();
		if available == 0 {
			tracing::warn!("No accelerators available. Running on CPU");
			return Ok(Placement::single(Device::Cpu, false));
		}
		DeviceSpec::Ids(vec![id]).select(available)?;
		Ok(Placement::single(Device::Accelerator(id), config.mixed_precision))
	}
}

#[derive(Debug, Clone)]
pub struct Distributed {
	provider: Arc<dyn DeviceProvider>,
}

impl Distributed {
	pub fn new(provider: Arc<dyn DeviceProvider>) -> Self {
		Distributed { provider }
	}
}

impl ExecutionStrategy for Distributed {
	fn name(&self) -> &'static str {
		"distributed"
	}

	fn place(&self, config: &TrainerConfig) -> Result<Placement> {
		let available = self.provider.accelerator_count();
		if available == 0 {
			return Err(FlowError::Device(
				"No accelerators available, use the single device strategy".into(),
			));
		}
		let spec: DeviceSpec = config.device.parse()?;
		if spec == DeviceSpec::Cpu {
			return Err(FlowError::Device("Distributed training needs accelerator devices".into()));
		}
		let ids = spec.select(available)?;
		if let Some(world_size) = config.distributed.world_size {
			if world_size != ids.len() {
				return Err(FlowError::Distributed(format!(
					"world_size ({}) does not match the {} selected devices",
					world_size,
					ids.len()
				)));
			}
		}

		let mut section = config.distributed.clone();
		section.apply_env_overrides()?;
		let coordinator = Coordinator::bind(&section, ids.len())?;

		Ok(Placement {
			devices: ids.into_iter().map(Device::Accelerator).collect(),
			mixed_precision: config.mixed_precision,
			coordinator: Some(coordinator),
		})
	}
}

/// The rendezvous address, held for the duration of a run.
#[derive(Debug)]
pub struct Coordinator {
	listener: TcpListener,
	backend: String,
	world_size: usize,
}

impl Coordinator {
	pub fn bind(section: &DistributedSection, world_size: usize) -> Result<Self> {
		let addr = (section.master_addr.as_str(), section.master_port)
			.to_socket_addrs()
			.map_err(|e| FlowError::Distributed(format!("cannot resolve {}: {}", section.master_addr, e)))?
			.next()
			.ok_or_else(|| FlowError::Distributed(format!("{} resolves to no address", section.master_addr)))?;
		let listener = TcpListener::bind(addr)
			.map_err(|e| FlowError::Distributed(format!("cannot bind coordinator at {}: {}", addr, e)))?;
		tracing::debug!("Coordinator for {} ranks listening on {:?}", world_size, listener.local_addr());
		Ok(Coordinator {
			listener,
			backend: section.backend.clone(),
			world_size,
		})
	}

	pub fn local_addr(&self) -> Result<SocketAddr> {
		Ok(self.listener.local_addr()?)
	}

	pub fn backend(&self) -> &str {
		&self.backend
	}

	pub fn world_size(&self) -> usize {
		self.world_size
	}
}

#[derive(Debug)]
struct GroupState {
	arrived: usize,
	generation: u64,
	aborted: bool,
	sum: Vec<ArrayD<f32>>,
	mean: Arc<Vec<ArrayD<f32>>>,
}

/// Collective operations between the ranks of one run.
#[derive(Debug, Clone)]
pub struct ProcessGroup {
	world_size: usize,
	inner: Arc<(Mutex<GroupState>, Condvar)>,
}

impl ProcessGroup {
	pub fn new(world_size: usize) -> Result<Self> {
		if world_size == 0 {
			return Err(FlowError::Distributed("world size must be at least 1".into()));
		}
		let state = GroupState {
			arrived: 0,
			generation: 0,
			aborted: false,
			sum: Vec::new(),
			mean: Arc::new(Vec::new()),
		};
		Ok(ProcessGroup {
			world_size,
			inner: Arc::new((Mutex::new(state), Condvar::new())),
		})
	}

	pub fn world_size(&self) -> usize {
		self.world_size
	}

	fn lock(&self) -> MutexGuard<'_, GroupState> {
		self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Replaces every trainable gradient with its mean over all ranks.
	/// Blocks until every rank has contributed.
	pub fn all_reduce_mean(&self, params: &mut [&mut Param]) -> Result<()> {
		if self.world_size == 1 {
			return Ok(());
		}
		let grads = params.iter().filter(|p| p.trainable).map(|p| p.grad.view()).collect::<Vec<_>>();
		let mean = self.reduce_mean(&grads)?;
		for (param, g) in params.iter_mut().filter(|p| p.trainable).zip(mean.iter()) {
			param.grad.assign(g);
		}
		Ok(())
	}

	/// Replaces the value of every buffer (non-trainable parameter, e.g.
	/// BatchNorm running statistics) with its mean over all ranks.
	pub fn all_reduce_buffers(&self, params: &mut [&mut Param]) -> Result<()> {
		if self.world_size == 1 {
			return Ok(());
		}
		let values = params.iter().filter(|p| !p.trainable).map(|p| p.value.view()).collect::<Vec<_>>();
		let mean = self.reduce_mean(&values)?;
		for (param, v) in params.iter_mut().filter(|p| !p.trainable).zip(mean.iter()) {
			param.value.assign(v);
		}
		Ok(())
	}

	fn reduce_mean(&self, values: &[ArrayViewD<'_, f32>]) -> Result<Arc<Vec<ArrayD<f32>>>> {
		let mut state = self.lock();
		if state.aborted {
			return Err(FlowError::Distributed("another rank failed".into()));
		}

		if state.arrived == 0 {
			state.sum = values.iter().map(|v| v.to_owned()).collect();
		} else {
			let mismatch = if state.sum.len() != values.len() {
				Some(FlowError::Distributed("ranks disagree on the parameter list".into()))
			} else {
				state
					.sum
					.iter()
					.zip(values)
					.find(|(acc, v)| acc.shape() != v.shape())
					.map(|(acc, v)| FlowError::shape_mismatch(acc.shape(), v.shape()))
			};
			if let Some(err) = mismatch {
				state.aborted = true;
				self.inner.1.notify_all();
				return Err(err);
			}
			for (acc, v) in state.sum.iter_mut().zip(values) {
				*acc += v;
			}
		}
		state.arrived += 1;

		if state.arrived == self.world_size {
			let inv = 1.0 / self.world_size as f32;
			let mut sum = std::mem::take(&mut state.sum);
			for acc in sum.iter_mut() {
				acc.mapv_inplace(|g| g * inv);
			}
			state.mean = Arc::new(sum);
			state.arrived = 0;
			state.generation += 1;
			self.inner.1.notify_all();
		} else {
			let generation = state.generation;
			while state.generation == generation && !state.aborted {
				state = self.inner.1.wait(state).unwrap_or_else(PoisonError::into_inner);
			}
			if state.generation == generation {
				return Err(FlowError::Distributed("another rank failed".into()));
			}
		}
		Ok(Arc::clone(&state.mean))
	}

	/// Releases every rank blocked in a collective with an error.
	pub fn abort(&self) {
		let mut state = self.lock();
		state.aborted = true;
		self.inner.1.notify_all();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::engine::device::FixedDeviceProvider;
	use ndarray::arr1;
	use std::thread;

	fn config(device: &str) -> TrainerConfig {
		let mut config = TrainerConfig::default();
		config.device = device.to_string();
		config.mixed_precision = true;
		config.distributed.master_port = 0;
		config
	}

	#[test]
	fn single_device_falls_back_to_cpu() {
		let strategy = SingleDevice::new(Arc::new(FixedDeviceProvider(0)));
		let placement = strategy.place(&config("0")).unwrap();
		assert_eq!(placement.devices, vec![Device::Cpu]);
		assert!(!placement.mixed_precision);

		let strategy = SingleDevice::new(Arc::new(FixedDeviceProvider(2)));
		let placement = strategy.place(&config("1")).unwrap();
		assert_eq!(placement.devices, vec![Device::Accelerator(1)]);
		assert!(placement.mixed_precision);
		assert!(strategy.place(&config("0,1")).is_err());
	}

	#[test]
	fn distributed_requires_accelerators() {
		let none = Distributed::new(Arc::new(FixedDeviceProvider(0)));
		assert!(matches!(none.place(&config("all")), Err(FlowError::Device(_))));

		let two = Distributed::new(Arc::new(FixedDeviceProvider(2)));
		assert!(two.place(&config("0,1,2")).is_err());
		let placement = two.place(&config("all")).unwrap();
		assert_eq!(placement.world_size(), 2);
		assert!(placement.is_distributed());
	}

	#[test]
	fn all_reduce_averages_gradients() {
		let group = ProcessGroup::new(3).unwrap();
		let handles: Vec<_> = (0..3)
			.map(|rank| {
				let group = group.clone();
				thread::spawn(move || {
					let mut p = Param::new("w", arr1(&[0.0, 0.0]).into_dyn());
					p.grad = arr1(&[rank as f32, 3.0 * rank as f32]).into_dyn();
					for _ in 0..2 {
						group.all_reduce_mean(&mut [&mut p]).unwrap();
					}
					p.grad
				})
			})
			.collect();
		for handle in handles {
			assert_eq!(handle.join().unwrap(), arr1(&[1.0, 3.0]).into_dyn());
		}
	}

	#[test]
	fn buffer_reduce_leaves_gradients_alone() {
		let group = ProcessGroup::new(2).unwrap();
		let handles: Vec<_> = (0..2)
			.map(|rank| {
				let group = group.clone();
				thread::spawn(move || {
					let mut w = Param::new("w", arr1(&[1.0]).into_dyn());
					w.grad = arr1(&[rank as f32]).into_dyn();
					let mut mean = Param::buffer("bn.running_mean", arr1(&[2.0 * rank as f32, 0.0]).into_dyn());
					group.all_reduce_buffers(&mut [&mut w, &mut mean]).unwrap();
					(w.grad, mean.value)
				})
			})
			.collect();
		for (rank, handle) in handles.into_iter().enumerate() {
			let (grad, mean) = handle.join().unwrap();
			assert_eq!(grad, arr1(&[rank as f32]).into_dyn());
			assert_eq!(mean, arr1(&[1.0, 0.0]).into_dyn());
		}
	}

	#[test]
	fn mismatched_shapes_fail_every_rank() {
		let group = ProcessGroup::new(3).unwrap();
		let handles: Vec<_> = (0..3)
			.map(|rank| {
				let group = group.clone();
				thread::spawn(move || {
					let len = if rank == 2 { 3 } else { 2 };
					let mut p = Param::new("w", ArrayD::zeros(vec![len]));
					group.all_reduce_mean(&mut [&mut p])
				})
			})
			.collect();
		for handle in handles {
			assert!(handle.join().unwrap().is_err());
		}
	}

	#[test]
	fn abort_releases_waiting_ranks() {
		let group = ProcessGroup::new(2).unwrap();
		let waiter = {
			let group = group.clone();
			thread::spawn(move || {
				let mut p = Param::new("w", arr1(&[0.0]).into_dyn());
				group.all_reduce_mean(&mut [&mut p])
			})
		};
		group.abort();
		assert!(waiter.join().unwrap().is_err());
	}
}
