//! The training loop.
//!
//! A [`Trainer`] is set up in fixed order: devices, then the model, then the
//! loss/optimizer/scheduler. [`Trainer::train`] runs one control loop per
//! rank. Rank 0 alone validates, writes scalars and saves checkpoints.

use std::fmt;
use std::path::{Path, PathBuf};
use std::thread;

use indicatif::{ProgressBar, ProgressStyle};

use crate::config::{TrainerConfig, ValidateOn};
use crate::data::{Batch, DataLoader};
use crate::engine::checkpoint::{self, TrainingCheckpoint};
use crate::engine::eval::validate_model;
use crate::engine::optim::{clip_grad_norm, Optimizer};
use crate::engine::scaler::GradScaler;
use crate::engine::scheduler::LrScheduler;
use crate::engine::strategy::{ExecutionStrategy, Placement, ProcessGroup};
use crate::error::{FlowError, Result};
use crate::functional::Criterion;
use crate::logging::{AverageMeter, ScalarWriter};
use crate::models::FlowModel;
use crate::nn::{self, StateDict};
use crate::registry::Registries;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
	Uninitialized,
	DeviceBound,
	ModelBound,
	TrainingConfigured,
	EpochLoop,
	StepLoop,
	Terminal,
}

impl fmt::Display for Phase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		fmt::Debug::fmt(self, f)
	}
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
	pub final_weights: StateDict,
	/// Weights at the best validation, if any validation improved.
	pub best_weights: Option<StateDict>,
	pub min_avg_val_loss: f32,
	pub min_avg_val_metric: f32,
	pub epochs_run: usize,
	pub steps_run: usize,
}

struct TrainingSetup {
	criterion: Box<dyn Criterion>,
	optimizer: Box<dyn Optimizer>,
	scheduler: Option<Box<dyn LrScheduler>>,
	scaler: GradScaler,
}

pub struct Trainer {
	config: TrainerConfig,
	registries: Registries,
	strategy: Box<dyn ExecutionStrategy>,
	phase: Phase,
	placement: Option<Placement>,
	model: Option<Box<dyn FlowModel>>,
	model_name: String,
	setup: Option<TrainingSetup>,
	train_loader: DataLoader,
	val_loader: DataLoader,
	/// Epochs (or steps) already done by a resumed checkpoint.
	start: usize,
}

impl fmt::Debug for Trainer {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Trainer")
			.field("phase", &self.phase)
			.field("strategy", &self.strategy.name())
			.field("model", &self.model_name)
			.field("start", &self.start)
			.finish()
	}
}

impl Trainer {
	pub fn new(
		config: TrainerConfig,
		registries: Registries,
		strategy: Box<dyn ExecutionStrategy>,
		train_loader: DataLoader,
		val_loader: DataLoader,
	) -> Result<Self> {
		config.validate()?;
		Ok(Trainer {
			config,
			registries,
			strategy,
			phase: Phase::Uninitialized,
			placement: None,
			model: None,
			model_name: String::new(),
			setup: None,
			train_loader,
			val_loader,
			start: 0,
		})
	}

	pub fn phase(&self) -> Phase {
		self.phase
	}

	pub fn config(&self) -> &TrainerConfig {
		&self.config
	}

	pub fn placement(&self) -> Option<&Placement> {
		self.placement.as_ref()
	}

	pub fn model(&self) -> Option<&dyn FlowModel> {
		self.model.as_deref()
	}

	/// Lowercased model name used in checkpoint file names.
	pub fn model_name(&self) -> &str {
		&self.model_name
	}

	fn expect_phase(&self, expected: Phase, action: &str) -> Result<()> {
		if self.phase != expected {
			return Err(FlowError::InvalidState(format!(
				"cannot {} in phase {}, expected {}",
				action, self.phase, expected
			)));
		}
		Ok(())
	}

	pub fn setup_device(&mut self) -> Result<()> {
		self.expect_phase(Phase::Uninitialized, "bind devices")?;
		let placement = self.strategy.place(&self.config)?;
		if self.config.mixed_precision && !placement.mixed_precision {
			tracing::warn!("Mixed precision disabled on CPU");
		}
		self.config.mixed_precision = placement.mixed_precision;
		tracing::info!(
			"Using {} strategy on {:?}",
			self.strategy.name(),
			placement.devices.iter().map(ToString::to_string).collect::<Vec<_>>()
		);
		self.placement = Some(placement);
		self.phase = Phase::DeviceBound;
		Ok(())
	}

	/// Uses `model`, or builds the configured one.
	pub fn setup_model(&mut self, model: Option<Box<dyn FlowModel>>) -> Result<()> {
		self.expect_phase(Phase::DeviceBound, "bind a model")?;
		let mut model = match model {
			Some(model) => model,
			None => self.registries.models.build_node(&self.config.model, &self.registries)?,
		};
		model.set_training(true);
		self.model_name = model.name().to_lowercase();
		tracing::info!(
			"Model {} with {} parameters",
			model.name(),
			nn::num_parameters(model.as_ref())
		);
		self.model = Some(model);
		self.phase = Phase::ModelBound;
		Ok(())
	}

	/// Uses the given components and builds the missing ones from the
	/// configuration. The scheduler is only built when enabled.
	pub fn setup_training(
		&mut self,
		criterion: Option<Box<dyn Criterion>>,
		optimizer: Option<Box<dyn Optimizer>>,
		scheduler: Option<Box<dyn LrScheduler>>,
	) -> Result<()> {
		self.expect_phase(Phase::ModelBound, "configure training")?;
		let config = &self.config;
		let registries = &self.registries;

		let criterion = match criterion {
			Some(criterion) => criterion,
			None => registries
				.criteria
				.build(&config.criterion.name, &config.criterion.params, registries)?,
		};
		let mut optimizer = match optimizer {
			Some(optimizer) => optimizer,
			None => {
				let params = config.optimizer.params.clone().with("lr", config.optimizer.lr);
				registries.optimizers.build(&config.optimizer.name, &params, registries)?
			}
		};
		let scheduler = match scheduler {
			Some(scheduler) => Some(scheduler),
			None if config.scheduler.enabled => Some(registries.schedulers.build(
				&config.scheduler.name,
				&config.scheduler.params,
				registries,
			)?),
			None => None,
		};
		let scheduler = match scheduler {
			Some(mut scheduler) => {
				scheduler.bind(optimizer.lr(), self.total_steps()?)?;
				optimizer.set_lr(scheduler.lr());
				Some(scheduler)
			}
			None => None,
		};

		self.setup = Some(TrainingSetup {
			criterion,
			optimizer,
			scheduler,
			scaler: GradScaler::enabled(self.config.mixed_precision),
		});
		self.phase = Phase::TrainingConfigured;
		Ok(())
	}

	/// Devices, configured model and configured training components in one go.
	pub fn prepare(&mut self) -> Result<()> {
		self.setup_device()?;
		self.setup_model(None)?;
		self.setup_training(None, None, None)
	}

	fn world_size(&self) -> usize {
		self.placement.as_ref().map_or(1, Placement::world_size)
	}

	fn batches_per_epoch(&self) -> Result<usize> {
		let world = self.world_size();
		if world > 1 {
			Ok(self.train_loader.clone().with_shard(0, world)?.len())
		} else {
			Ok(self.train_loader.len())
		}
	}

	/// Planned optimizer steps for this run.
	fn total_steps(&self) -> Result<usize> {
		match self.config.num_steps {
			Some(steps) => Ok(steps),
			None => Ok(self.config.epochs * self.batches_per_epoch()?),
		}
	}

	/// Restores model, optimizer, scheduler and scaler from a checkpoint;
	/// training then continues from the saved epoch (or step) count.
	pub fn resume_from(&mut self, path: &Path) -> Result<()> {
		self.expect_phase(Phase::TrainingConfigured, "resume")?;
		let checkpoint = checkpoint::load_checkpoint(path)?;
		if checkpoint.step_mode != self.config.num_steps.is_some() {
			return Err(FlowError::invalid_data(
				path,
				"checkpoint was written by a run with a different loop mode",
			));
		}
		let (model, setup) = match (self.model.as_mut(), self.setup.as_mut()) {
			(Some(model), Some(setup)) => (model, setup),
			_ => return Err(FlowError::InvalidState("training components are missing".into())),
		};
		model.load_state_dict(&checkpoint.model)?;
		setup.optimizer.load_state(&checkpoint.optimizer)?;
		if let (Some(scheduler), Some(state)) = (setup.scheduler.as_mut(), checkpoint.scheduler.as_ref()) {
			scheduler.load_state(state)?;
			setup.optimizer.set_lr(scheduler.lr());
		}
		setup.scaler.load_state(&checkpoint.scaler);
		self.start = checkpoint.epochs;
		tracing::info!("Resuming training from {} {}", self.unit(), self.start + 1);
		Ok(())
	}

	fn unit(&self) -> &'static str {
		if self.config.num_steps.is_some() {
			"step"
		} else {
			"epoch"
		}
	}

	/// Runs the configured loop to completion.
	///
	/// Failures before the first rank starts leave the trainer in
	/// `TrainingConfigured` with its components in place.
	pub fn train(&mut self) -> Result<TrainingReport> {
		self.expect_phase(Phase::TrainingConfigured, "train")?;
		let world = self.world_size();
		let distributed = self.placement.as_ref().map_or(false, Placement::is_distributed);
		let group = if distributed { Some(ProcessGroup::new(world)?) } else { None };
		let mut shards = (0..world)
			.map(|rank| {
				if distributed {
					self.train_loader.clone().with_shard(rank, world)
				} else {
					Ok(self.train_loader.clone())
				}
			})
			.collect::<Result<Vec<_>>>()?
			.into_iter();
		let leader_loader = shards
			.next()
			.ok_or_else(|| FlowError::InvalidState("no ranks to train on".into()))?;
		let mut leader = Leader::new(&self.config, &self.model_name, &mut self.val_loader)?;

		let (model, setup) = match (self.model.take(), self.setup.take()) {
			(Some(model), Some(setup)) => (model, setup),
			_ => return Err(FlowError::InvalidState("training components are missing".into())),
		};
		self.phase = if self.config.num_steps.is_some() {
			Phase::StepLoop
		} else {
			Phase::EpochLoop
		};

		let replicas: Vec<Rank> = (1..world)
			.zip(shards)
			.map(|(rank, loader)| Rank {
				rank,
				model: model.clone_box(),
				criterion: setup.criterion.clone(),
				optimizer: setup.optimizer.clone(),
				scheduler: setup.scheduler.clone(),
				scaler: setup.scaler.clone(),
				sync_buffers: self.config.distributed.sync_batch_norm,
				loader,
				group: group.clone(),
			})
			.collect();
		let mut leader_rank = Rank {
			rank: 0,
			model,
			criterion: setup.criterion,
			optimizer: setup.optimizer,
			scheduler: setup.scheduler,
			scaler: setup.scaler,
			sync_buffers: self.config.distributed.sync_batch_norm,
			loader: leader_loader,
			group: group.clone(),
		};

		let plan = LoopPlan {
			config: &self.config,
			start: self.start,
			world,
		};

		let outcome = thread::scope(|scope| -> Result<RunStats> {
			let mut handles = Vec::with_capacity(replicas.len());
			for mut rank in replicas {
				let plan = &plan;
				let spawned = thread::Builder::new()
					.name(format!("rank-{}", rank.rank))
					.spawn_scoped(scope, move || {
						let result = rank.run(plan, None);
						release_on_error(rank.group.as_ref(), result)
					});
				handles.push(release_on_error(group.as_ref(), spawned)?);
			}

			let result = release_on_error(group.as_ref(), leader_rank.run(&plan, Some(&mut leader)));
			let mut first_error = result.as_ref().err().map(|e| e.to_string());
			for handle in handles {
				match handle.join() {
					Ok(Ok(_)) => {}
					Ok(Err(e)) => {
						tracing::error!("Rank failed: {}", e);
						first_error.get_or_insert_with(|| e.to_string());
					}
					Err(_) => {
						first_error.get_or_insert_with(|| "a rank panicked".to_string());
					}
				}
			}
			match (result, first_error) {
				(Ok(stats), None) => Ok(stats),
				(Err(e), _) => Err(e),
				(Ok(_), Some(message)) => Err(FlowError::Distributed(message)),
			}
		});
		let closed = leader.writer.close();

		self.model = Some(leader_rank.model);
		self.setup = Some(TrainingSetup {
			criterion: leader_rank.criterion,
			optimizer: leader_rank.optimizer,
			scheduler: leader_rank.scheduler,
			scaler: leader_rank.scaler,
		});
		self.phase = Phase::Terminal;

		let stats = outcome?;
		closed?;
		let final_weights = self
			.model
			.as_ref()
			.map(|m| m.state_dict())
			.unwrap_or_default();
		Ok(TrainingReport {
			final_weights,
			best_weights: leader.best.weights,
			min_avg_val_loss: leader.best.min_loss,
			min_avg_val_metric: leader.best.min_metric,
			epochs_run: stats.epochs,
			steps_run: stats.steps,
		})
	}
}

/// Passes `result` through, releasing every rank blocked in a collective
/// when it is an error.
fn release_on_error<T, E>(group: Option<&ProcessGroup>, result: std::result::Result<T, E>) -> std::result::Result<T, E> {
	if result.is_err() {
		if let Some(group) = group {
			group.abort();
		}
	}
	result
}

struct LoopPlan<'a> {
	config: &'a TrainerConfig,
	start: usize,
	world: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct RunStats {
	epochs: usize,
	steps: usize,
}

/// Lowest validation loss and metric seen so far, tracked separately.
#[derive(Debug)]
struct BestTracker {
	min_loss: f32,
	min_metric: f32,
	weights: Option<StateDict>,
}

impl BestTracker {
	fn new() -> Self {
		BestTracker {
			min_loss: f32::INFINITY,
			min_metric: f32::INFINITY,
			weights: None,
		}
	}

	/// Records a validation result; true when the `on` value strictly improved.
	fn observe(&mut self, loss: f32, metric: f32, on: ValidateOn) -> bool {
		let loss_improved = loss < self.min_loss;
		if loss_improved {
			self.min_loss = loss;
			tracing::info!("New minimum average validation loss!");
		}
		let metric_improved = metric < self.min_metric;
		if metric_improved {
			self.min_metric = metric;
			tracing::info!("New minimum average validation metric!");
		}
		match on {
			ValidateOn::Loss => loss_improved,
			ValidateOn::Metric => metric_improved,
		}
	}
}

/// Rank 0's extra duties.
struct Leader<'a> {
	config: &'a TrainerConfig,
	model_name: &'a str,
	val_loader: &'a mut DataLoader,
	writer: ScalarWriter,
	best: BestTracker,
}

impl<'a> Leader<'a> {
	fn new(config: &'a TrainerConfig, model_name: &'a str, val_loader: &'a mut DataLoader) -> Result<Self> {
		std::fs::create_dir_all(&config.ckpt_dir)?;
		Ok(Leader {
			config,
			model_name,
			val_loader,
			writer: ScalarWriter::create(&config.log_dir)?,
			best: BestTracker::new(),
		})
	}

	fn log_step(&mut self, iteration: usize, total_iters: usize, meter: &AverageMeter) -> Result<()> {
		if iteration % self.config.log_iterations_interval == 0 {
			self.writer.add_scalar("avg_batch_training_loss", meter.avg, total_iters)?;
			tracing::debug!(
				"Epoch iterations: {}, Total iterations: {}, Average batch training loss: {}",
				iteration,
				total_iters,
				meter.avg
			);
		}
		Ok(())
	}

	fn validate(&mut self, rank: &mut Rank, count: usize, iteration: usize) -> Result<()> {
		let (loss, metric) = validate_model(
			rank.model.as_mut(),
			rank.criterion.as_ref(),
			self.val_loader,
			self.config.data.target_scale_factor,
			iteration,
		)?;
		self.writer.add_scalar("avg_validation_loss", loss, count)?;
		self.writer.add_scalar("avg_validation_metric", metric, count)?;
		tracing::info!("{}: Average validation loss = {}, metric = {}", count, loss, metric);

		if self.best.observe(loss, metric, self.config.validate_on) {
			let weights = rank.model.state_dict();
			let path = checkpoint::best_path(&self.config.ckpt_dir, self.model_name);
			checkpoint::save_weights(&path, self.model_name, &weights)?;
			self.best.weights = Some(weights);
			tracing::info!("Saved new best model to {}", path.display());
		}
		Ok(())
	}

	fn save_checkpoint(&self, rank: &Rank, count: usize) -> Result<PathBuf> {
		let step_mode = self.config.num_steps.is_some();
		let path = checkpoint::checkpoint_path(&self.config.ckpt_dir, self.model_name, count, step_mode);
		checkpoint::save_checkpoint(
			&path,
			&TrainingCheckpoint {
				model_name: self.model_name.to_string(),
				epochs: count,
				step_mode,
				model: rank.model.state_dict(),
				optimizer: rank.optimizer.state(),
				scheduler: rank.scheduler.as_ref().map(|s| s.state()),
				scaler: rank.scaler.state(),
			},
		)?;
		Ok(path)
	}
}

fn progress_bar(len: usize, show: bool) -> ProgressBar {
	if !show {
		return ProgressBar::hidden();
	}
	let pb = ProgressBar::new(len as u64);
	pb.set_style(
		ProgressStyle::default_bar()
			.template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} iters ({eta}) {msg}")
			.unwrap_or_else(|_| ProgressStyle::default_bar())
			.progress_chars("=>-"),
	);
	pb
}

/// One rank's model, optimizer state and data shard.
struct Rank {
	rank: usize,
	model: Box<dyn FlowModel>,
	criterion: Box<dyn Criterion>,
	optimizer: Box<dyn Optimizer>,
	scheduler: Option<Box<dyn LrScheduler>>,
	scaler: GradScaler,
	/// Average buffers (BatchNorm running statistics) after every step.
	sync_buffers: bool,
	loader: DataLoader,
	group: Option<ProcessGroup>,
}

impl Rank {
	fn run(&mut self, plan: &LoopPlan, leader: Option<&mut Leader>) -> Result<RunStats> {
		if let Some(group) = &self.group {
			tracing::info!("{}/{} process initialized", self.rank + 1, group.world_size());
		}
		if self.loader.is_empty() {
			return Err(FlowError::InvalidParameter("training loader yields no batches".into()));
		}
		match plan.config.num_steps {
			Some(steps) => self.step_loop(plan, steps, leader),
			None => self.epoch_loop(plan, leader),
		}
	}

	/// forward, loss, zero grads, scaled backward, all-reduce, unscale,
	/// optional clipping, gated step, scheduler, scaler update.
	fn run_step(&mut self, batch: &Batch, config: &TrainerConfig, iteration: usize) -> Result<f32> {
		let target = batch.target(config.data.target_scale_factor)?;
		let output = self.model.forward(&batch.img1, &batch.img2)?;
		let loss = self.criterion.compute(&output, &target, iteration)?;

		nn::zero_grad(self.model.as_mut());
		let mut grads = loss.grads;
		grads.scale(self.scaler.scale());
		self.model.backward(&grads)?;

		let mut params = self.model.params_mut();
		if let Some(group) = &self.group {
			group.all_reduce_mean(&mut params)?;
			if self.sync_buffers {
				group.all_reduce_buffers(&mut params)?;
			}
		}
		self.scaler.unscale(&mut params);
		if config.grad_clip.enabled {
			clip_grad_norm(&mut params, config.grad_clip.value);
		}
		self.scaler.step(self.optimizer.as_mut(), &mut params)?;
		drop(params);

		if let Some(scheduler) = self.scheduler.as_mut() {
			scheduler.step();
			self.optimizer.set_lr(scheduler.lr());
		}
		self.scaler.update();
		Ok(loss.value)
	}

	fn epoch_loop(&mut self, plan: &LoopPlan, mut leader: Option<&mut Leader>) -> Result<RunStats> {
		let config = plan.config;
		let batches_per_epoch = self.loader.len();
		let last = plan.start + config.epochs;
		let mut meter = AverageMeter::new();
		let mut stats = RunStats::default();

		for epoch in plan.start..last {
			if leader.is_some() {
				tracing::info!("Epoch {} of {}", epoch + 1, last);
			}
			let pb = progress_bar(batches_per_epoch, leader.is_some());
			meter.reset();
			self.loader.set_epoch(epoch);
			for (iteration, batch) in self.loader.batches()?.enumerate() {
				let batch = batch?;
				let total_iters = iteration + epoch * batches_per_epoch;
				let loss = self.run_step(&batch, config, total_iters)?;
				meter.update(loss);
				stats.steps += 1;
				pb.inc(1);
				if let Some(leader) = leader.as_deref_mut() {
					leader.log_step(iteration, total_iters, &meter)?;
				}
			}
			pb.finish_and_clear();
			stats.epochs += 1;

			if let Some(leader) = leader.as_deref_mut() {
				tracing::info!("Epoch {}: Training loss = {}", epoch + 1, meter.sum);
				leader.writer.add_scalar("epochs_training_loss", meter.sum, epoch + 1)?;
				if epoch % config.validate_interval == 0 {
					leader.validate(self, epoch + 1, (epoch + 1) * batches_per_epoch)?;
				}
				if epoch % config.ckpt_interval == 0 {
					let path = leader.save_checkpoint(self, epoch + 1)?;
					tracing::info!("Saved checkpoint {}", path.display());
				}
				leader.writer.flush()?;
			}
		}
		tracing::debug!("Rank {} finished {} epochs on {} ranks", self.rank, stats.epochs, plan.world);
		Ok(stats)
	}

	fn step_loop(&mut self, plan: &LoopPlan, num_steps: usize, mut leader: Option<&mut Leader>) -> Result<RunStats> {
		let config = plan.config;
		let last = plan.start + num_steps;
		let mut step = plan.start;
		let mut meter = AverageMeter::new();
		let mut stats = RunStats::default();
		let pb = progress_bar(num_steps, leader.is_some());

		// a resumed run continues mid-epoch with the same shuffle
		let batches_per_epoch = self.loader.len();
		self.loader.set_epoch(plan.start / batches_per_epoch);
		let mut skip = plan.start % batches_per_epoch;

		while step < last {
			meter.reset();
			for batch in self.loader.batches()?.skip(std::mem::take(&mut skip)) {
				if step >= last {
					break;
				}
				let batch = batch?;
				let loss = self.run_step(&batch, config, step)?;
				meter.update(loss);
				step += 1;
				stats.steps += 1;
				pb.inc(1);

				if let Some(leader) = leader.as_deref_mut() {
					leader.log_step(step - 1, step - 1, &meter)?;
					if step % config.validate_interval == 0 {
						leader.validate(self, step, step)?;
					}
					if step % config.ckpt_interval == 0 {
						let path = leader.save_checkpoint(self, step)?;
						tracing::info!("Saved checkpoint {}", path.display());
					}
				}
			}
			stats.epochs += 1;
			if let Some(leader) = leader.as_deref_mut() {
				leader.writer.add_scalar("epochs_training_loss", meter.sum, step)?;
				leader.writer.flush()?;
			}
		}
		pb.finish_and_clear();
		tracing::debug!("Rank {} finished {} steps on {} ranks", self.rank, stats.steps, plan.world);
		Ok(stats)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::CfgNode;
	use crate::data::dataset::{InMemoryDataset, SyntheticShiftArgs};
	use crate::data::DataLoaderOptions;
	use crate::engine::device::FixedDeviceProvider;
	use crate::engine::strategy::SingleDevice;
	use crate::logging::read_scalars;
	use std::sync::Arc;
	use tempfile::TempDir;

	const SMALL_FLOWNET: &str = r#"
name = "FlowNetC"
corr_channels = [8, 8]
max_displacement = 1
norm = "instance"
seed = 3

[encoder]
name = "BasicConvEncoder"
channels = [4, 8, 8]
norm = "instance"
"#;

	fn loader(len: usize) -> DataLoader {
		let dataset = InMemoryDataset::synthetic_shift(&SyntheticShiftArgs {
			len,
			height: 32,
			width: 32,
			..Default::default()
		})
		.unwrap();
		DataLoader::new(
			Arc::new(dataset),
			DataLoaderOptions {
				batch_size: 2,
				shuffle: false,
				num_workers: 0,
				..Default::default()
			},
		)
		.unwrap()
	}

	fn trainer(dir: &TempDir, configure: impl FnOnce(&mut TrainerConfig)) -> Trainer {
		let mut config = TrainerConfig::builder()
			.epochs(2)
			.learning_rate(1e-3)
			.intervals(1, 1, 1)
			.dirs(dir.path().join("ckpts"), dir.path().join("logs"))
			.criterion("MultiScaleLoss", CfgNode::empty())
			.build();
		config.model = CfgNode::parse(SMALL_FLOWNET).unwrap();
		configure(&mut config);
		Trainer::new(
			config,
			Registries::with_defaults(),
			Box::new(SingleDevice::new(Arc::new(FixedDeviceProvider(0)))),
			loader(4),
			loader(2),
		)
		.unwrap()
	}

	#[test]
	fn setup_out_of_order_is_rejected() {
		let dir = TempDir::new().unwrap();
		let mut trainer = trainer(&dir, |_| {});
		assert!(matches!(trainer.setup_model(None), Err(FlowError::InvalidState(_))));
		assert!(matches!(trainer.train(), Err(FlowError::InvalidState(_))));
		trainer.setup_device().unwrap();
		assert!(matches!(trainer.setup_device(), Err(FlowError::InvalidState(_))));
		assert_eq!(trainer.phase(), Phase::DeviceBound);
	}

	#[test]
	fn epoch_run_writes_checkpoints_and_scalars() {
		let dir = TempDir::new().unwrap();
		let mut trainer = trainer(&dir, |_| {});
		trainer.prepare().unwrap();
		assert_eq!(trainer.model_name(), "flownetc");
		let report = trainer.train().unwrap();
		assert_eq!(trainer.phase(), Phase::Terminal);
		assert_eq!(report.epochs_run, 2);
		assert_eq!(report.steps_run, 4);
		assert!(report.min_avg_val_loss.is_finite());
		assert!(report.best_weights.is_some());

		let ckpts = dir.path().join("ckpts");
		assert!(ckpts.join("flownetc_epochs1.pth").exists());
		assert!(ckpts.join("flownetc_epochs2.pth").exists());
		assert!(ckpts.join("flownetc_best.pth").exists());

		let records = read_scalars(dir.path().join("logs").join("scalars.jsonl")).unwrap();
		let tags: Vec<&str> = records.iter().map(|r| r.tag.as_str()).collect();
		for tag in ["avg_batch_training_loss", "epochs_training_loss", "avg_validation_loss", "avg_validation_metric"] {
			assert!(tags.contains(&tag), "missing {}", tag);
		}
	}

	#[test]
	fn resume_continues_from_saved_epoch() {
		let dir = TempDir::new().unwrap();
		let mut first = trainer(&dir, |c| c.epochs = 1);
		first.prepare().unwrap();
		first.train().unwrap();

		let mut second = trainer(&dir, |c| c.epochs = 1);
		second.prepare().unwrap();
		second
			.resume_from(&dir.path().join("ckpts").join("flownetc_epochs1.pth"))
			.unwrap();
		second.train().unwrap();
		assert!(dir.path().join("ckpts").join("flownetc_epochs2.pth").exists());
	}

	#[test]
	fn step_mode_stops_after_num_steps() {
		let dir = TempDir::new().unwrap();
		let mut trainer = trainer(&dir, |c| {
			c.num_steps = Some(3);
			c.ckpt_interval = 3;
		});
		trainer.prepare().unwrap();
		let report = trainer.train().unwrap();
		assert_eq!(report.steps_run, 3);
		assert!(dir.path().join("ckpts").join("flownetc_steps3.pth").exists());
	}

	#[test]
	fn resumed_step_loop_continues_the_loader_epoch() {
		let dir = TempDir::new().unwrap();
		let mut trainer = trainer(&dir, |c| c.num_steps = Some(3));
		trainer.prepare().unwrap();
		let setup = trainer.setup.take().unwrap();
		let mut rank = Rank {
			rank: 0,
			model: trainer.model.take().unwrap(),
			criterion: setup.criterion,
			optimizer: setup.optimizer,
			scheduler: setup.scheduler,
			scaler: setup.scaler,
			sync_buffers: false,
			loader: loader(4),
			group: None,
		};
		let plan = LoopPlan {
			config: trainer.config(),
			start: 3,
			world: 1,
		};
		// two batches per epoch: step 3 is the second batch of epoch 1
		let stats = rank.step_loop(&plan, 3, None).unwrap();
		assert_eq!(stats.steps, 3);
		assert_eq!(stats.epochs, 2);
		assert_eq!(rank.loader.epoch(), 3);
	}

	#[test]
	fn synced_ranks_share_batch_norm_statistics() {
		let dir = TempDir::new().unwrap();
		let mut trainer = trainer(&dir, |c| {
			c.model = CfgNode::parse(&SMALL_FLOWNET.replace("\"instance\"", "\"batch\"")).unwrap();
		});
		trainer.prepare().unwrap();
		let config = trainer.config().clone();
		let model = trainer.model.take().unwrap();
		let setup = trainer.setup.take().unwrap();
		let group = ProcessGroup::new(2).unwrap();
		let mut ranks: Vec<Rank> = (0..2)
			.map(|rank| Rank {
				rank,
				model: model.clone_box(),
				criterion: setup.criterion.clone(),
				optimizer: setup.optimizer.clone(),
				scheduler: setup.scheduler.clone(),
				scaler: setup.scaler.clone(),
				sync_buffers: true,
				loader: loader(4).with_shard(rank, 2).unwrap(),
				group: Some(group.clone()),
			})
			.collect();

		thread::scope(|scope| {
			for rank in ranks.iter_mut() {
				let config = &config;
				scope.spawn(move || {
					let batch = rank.loader.batches().unwrap().next().unwrap().unwrap();
					rank.run_step(&batch, config, 0).unwrap();
				});
			}
		});

		let buffers = |rank: &Rank| -> Vec<(String, ndarray::ArrayD<f32>)> {
			rank.model
				.params()
				.into_iter()
				.filter(|p| !p.trainable)
				.map(|p| (p.name.clone(), p.value.clone()))
				.collect()
		};
		let (first, second) = (buffers(&ranks[0]), buffers(&ranks[1]));
		assert!(!first.is_empty());
		assert_eq!(first, second);
		let initial: Vec<_> = model.params().into_iter().filter(|p| !p.trainable).map(|p| p.value.clone()).collect();
		assert!(first.iter().zip(&initial).any(|((_, after), before)| after != before));
	}

	#[test]
	fn failed_spawn_releases_waiting_ranks() {
		let group = ProcessGroup::new(2).unwrap();
		let waiter = {
			let group = group.clone();
			thread::spawn(move || {
				let mut p = nn::Param::new("w", ndarray::arr1(&[0.0]).into_dyn());
				group.all_reduce_mean(&mut [&mut p])
			})
		};
		let spawned: std::io::Result<()> = Err(std::io::Error::new(std::io::ErrorKind::Other, "no threads left"));
		assert!(release_on_error(Some(&group), spawned).is_err());
		assert!(waiter.join().unwrap().is_err());
		assert!(release_on_error(Some(&group), Ok::<_, FlowError>(1)).is_ok());
	}

	#[test]
	fn best_tracker_follows_selected_criterion() {
		let mut best = BestTracker::new();
		assert!(best.observe(1.0, 5.0, ValidateOn::Metric));
		assert!(!best.observe(0.5, 6.0, ValidateOn::Metric));
		assert_eq!(best.min_loss, 0.5);
		assert!(best.observe(0.7, 4.0, ValidateOn::Metric));
		assert!(!best.observe(0.5, 3.0, ValidateOn::Loss));
	}
}
