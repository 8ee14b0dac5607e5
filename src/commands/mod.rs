pub mod eval;
pub mod generate_config;
pub mod train;

pub use self::eval::eval;
pub use self::generate_config::generate_config;
pub use self::train::train;

use clap::ArgMatches;

use crate::config::{CfgNode, TrainerConfig};
use crate::config_file::load_config;
use crate::data::{DataLoader, DataLoaderOptions, DataloaderCreator};
use crate::error::{FlowError, Result};
use crate::registry::Registries;

/// Loads `CONFIG_FILE` and applies the `DEVICE` override shared by the
/// train and eval subcommands.
fn load_with_overrides(app_m: &ArgMatches) -> Result<TrainerConfig> {
	let path = app_m
		.value_of("CONFIG_FILE")
		.ok_or_else(|| FlowError::InvalidParameter("No configuration file specified".into()))?;
	let mut config = load_config(path)?;
	tracing::info!("Loaded configuration from: {}", path);
	if let Some(device) = app_m.value_of("DEVICE") {
		config.device = device.to_string();
	}
	Ok(config)
}

fn build_loader(
	nodes: &[CfgNode],
	options: DataLoaderOptions,
	registries: &Registries,
	what: &str,
) -> Result<DataLoader> {
	if nodes.is_empty() {
		return Err(FlowError::Config(format!("No {} datasets configured", what)));
	}
	let mut creator = DataloaderCreator::new(options);
	for node in nodes {
		creator.add_from_config(node, registries)?;
	}
	creator.get_dataloader()
}

fn train_loader(config: &TrainerConfig, registries: &Registries) -> Result<DataLoader> {
	let options = DataLoaderOptions {
		batch_size: config.data.batch_size,
		shuffle: config.data.shuffle,
		drop_last: config.data.drop_last,
		num_workers: config.data.num_workers,
		seed: config.seed,
	};
	build_loader(&config.data.train_datasets, options, registries, "training")
}

fn val_loader(config: &TrainerConfig, registries: &Registries) -> Result<DataLoader> {
	let options = DataLoaderOptions {
		batch_size: config.data.batch_size,
		shuffle: false,
		drop_last: false,
		num_workers: config.data.num_workers,
		seed: config.seed,
	};
	build_loader(&config.data.val_datasets, options, registries, "validation")
}
