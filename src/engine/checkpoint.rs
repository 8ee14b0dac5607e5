//! Checkpoint files.
//!
//! Records are bincode-encoded, byte-shuffled with a stride of four so the
//! bytes of each `f32` group together, then xz-compressed.

use std::fs;
use std::io::Read;
use std::num::FpCategory;
use std::path::{Path, PathBuf};

use bincode::{DefaultOptions, Options};
use serde::de::DeserializeOwned;
use serde::Serialize;
use xz2::read::{XzDecoder, XzEncoder};

use crate::constants::file;
use crate::engine::optim::OptimizerState;
use crate::engine::scaler::GradScalerState;
use crate::engine::scheduler::SchedulerState;
use crate::error::{FlowError, Result};
use crate::nn::StateDict;

const XZ_LEVEL: u32 = 7;
const SHUFFLE_STRIDE: usize = 4;

/// Everything needed to continue a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingCheckpoint {
	pub model_name: String,
	/// Completed epochs, or completed steps in step mode.
	pub epochs: usize,
	pub step_mode: bool,
	pub model: StateDict,
	pub optimizer: OptimizerState,
	pub scheduler: Option<SchedulerState>,
	pub scaler: GradScalerState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelWeights {
	pub model_name: String,
	pub model: StateDict,
}

#[derive(Debug, Serialize, Deserialize)]
enum Record {
	Weights(ModelWeights),
	Training(Box<TrainingCheckpoint>),
}

/// `{dir}/{model}_epochs{N}.pth`, or `_steps{N}` in step mode.
pub fn checkpoint_path(dir: &Path, model_name: &str, count: usize, step_mode: bool) -> PathBuf {
	let unit = if step_mode { "steps" } else { "epochs" };
	dir.join(format!("{}_{}{}{}", model_name, unit, count, file::CHECKPOINT_EXTENSION))
}

/// `{dir}/{model}_best.pth`
pub fn best_path(dir: &Path, model_name: &str) -> PathBuf {
	dir.join(format!("{}_best{}", model_name, file::CHECKPOINT_EXTENSION))
}

pub fn save_checkpoint(path: &Path, checkpoint: &TrainingCheckpoint) -> Result<()> {
	let mut checkpoint = checkpoint.clone();
	flush_subnormals(&mut checkpoint.model);
	for slots in checkpoint.optimizer.slots.values_mut() {
		for slot in slots.iter_mut() {
			slot.mapv_inplace(flush);
		}
	}
	write_record(path, &Record::Training(Box::new(checkpoint)))
}

pub fn save_weights(path: &Path, model_name: &str, state: &StateDict) -> Result<()> {
	let mut model = state.clone();
	flush_subnormals(&mut model);
	write_record(
		path,
		&Record::Weights(ModelWeights {
			model_name: model_name.to_string(),
			model,
		}),
	)
}

pub fn load_checkpoint(path: &Path) -> Result<TrainingCheckpoint> {
	match read_record(path)? {
		Record::Training(checkpoint) => Ok(*checkpoint),
		Record::Weights(_) => Err(FlowError::invalid_data(
			path,
			"holds model weights only, not a resumable checkpoint",
		)),
	}
}

/// Model weights from either kind of file.
pub fn load_weights(path: &Path) -> Result<ModelWeights> {
	match read_record(path)? {
		Record::Weights(weights) => Ok(weights),
		Record::Training(checkpoint) => Ok(ModelWeights {
			model_name: checkpoint.model_name,
			model: checkpoint.model,
		}),
	}
}

fn write_record(path: &Path, record: &Record) -> Result<()> {
	if let Some(parent) = path.parent() {
		fs::create_dir_all(parent)?;
	}
	fs::write(path, encode(record)?)?;
	tracing::debug!("Wrote {}", path.display());
	Ok(())
}

fn read_record(path: &Path) -> Result<Record> {
	let data = fs::read(path)?;
	decode(&data).map_err(|e| FlowError::invalid_data(path, e.to_string()))
}

fn flush(v: f32) -> f32 {
	match v.classify() {
		FpCategory::Subnormal => 0.0,
		_ => v,
	}
}

fn flush_subnormals(state: &mut StateDict) {
	for value in state.values_mut() {
		value.mapv_inplace(flush);
	}
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
	let serialized = bincode::serialize(value)?;
	let shuffled = shuffle(&serialized, SHUFFLE_STRIDE);
	let compressed = XzEncoder::new(shuffled.as_slice(), XZ_LEVEL)
		.bytes()
		.collect::<std::result::Result<Vec<_>, _>>()?;
	Ok(compressed)
}

pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
	let decompressed = XzDecoder::new(data)
		.bytes()
		.collect::<std::result::Result<Vec<_>, _>>()?;
	let unshuffled = unshuffle(&decompressed, SHUFFLE_STRIDE);
	let options = DefaultOptions::new().with_fixint_encoding().allow_trailing_bytes();
	options
		.deserialize(&unshuffled)
		.or_else(|_| bincode::deserialize(&unshuffled))
		.map_err(FlowError::from)
}

/// Groups byte `k` of every `stride`-byte word together.
fn shuffle(data: &[u8], stride: usize) -> Vec<u8> {
	let mut vec = Vec::with_capacity(data.len());
	for offset in 0..stride {
		vec.extend(data.iter().skip(offset).step_by(stride));
	}
	vec
}

fn unshuffle(data: &[u8], stride: usize) -> Vec<u8> {
	let mut vec = vec![0; data.len()];
	let mut source = data.iter();
	for offset in 0..stride {
		for (dst, src) in vec.iter_mut().skip(offset).step_by(stride).zip(&mut source) {
			*dst = *src;
		}
	}
	vec
}

#[cfg(test)]
mod tests {
	use super::*;
	use indexmap::IndexMap;
	use ndarray::{arr1, ArrayD};
	use tempfile::TempDir;

	fn state() -> StateDict {
		let mut state = StateDict::new();
		state.insert("conv.weight".into(), arr1(&[1.5, -2.0, f32::MIN_POSITIVE / 4.0]).into_dyn());
		state.insert("conv.bias".into(), ArrayD::zeros(vec![2, 3]));
		state
	}

	#[test]
	fn shuffle_is_inverted_by_unshuffle() {
		let data: Vec<u8> = (0..23).collect();
		let shuffled = shuffle(&data, 4);
		assert_eq!(&shuffled[..6], &[0, 4, 8, 12, 16, 20]);
		assert_eq!(unshuffle(&shuffled, 4), data);
	}

	#[test]
	fn names() {
		let dir = Path::new("ckpts");
		assert_eq!(checkpoint_path(dir, "flownetc", 3, false), dir.join("flownetc_epochs3.pth"));
		assert_eq!(checkpoint_path(dir, "flownetc", 50, true), dir.join("flownetc_steps50.pth"));
		assert_eq!(best_path(dir, "flownetc"), dir.join("flownetc_best.pth"));
	}

	#[test]
	fn training_checkpoint_survives_a_file_round_trip() {
		let dir = TempDir::new().unwrap();
		let path = checkpoint_path(dir.path(), "net", 2, false);
		let mut slots = IndexMap::new();
		slots.insert("conv.bias".to_string(), vec![ArrayD::ones(vec![2, 3])]);
		let checkpoint = TrainingCheckpoint {
			model_name: "net".into(),
			epochs: 2,
			step_mode: false,
			model: state(),
			optimizer: OptimizerState { step: 7, lr: 0.01, slots },
			scheduler: None,
			scaler: GradScalerState {
				scale: 1024.0,
				growth_tracker: 3,
			},
		};
		save_checkpoint(&path, &checkpoint).unwrap();

		let loaded = load_checkpoint(&path).unwrap();
		assert_eq!(loaded.epochs, 2);
		assert_eq!(loaded.optimizer.step, 7);
		assert_eq!(loaded.model["conv.weight"], arr1(&[1.5, -2.0, 0.0]).into_dyn());
		assert_eq!(load_weights(&path).unwrap().model.len(), 2);
	}

	#[test]
	fn weights_file_is_not_resumable() {
		let dir = TempDir::new().unwrap();
		let path = best_path(dir.path(), "net");
		save_weights(&path, "net", &state()).unwrap();
		assert_eq!(load_weights(&path).unwrap().model_name, "net");
		assert!(matches!(load_checkpoint(&path), Err(FlowError::InvalidData { .. })));
	}
}
