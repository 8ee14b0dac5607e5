use std::path::Path;

use clap::ArgMatches;

use super::{load_with_overrides, train_loader, val_loader};
use crate::engine::{strategy, Trainer};
use crate::error::{FlowError, Result};
use crate::registry::Registries;

pub fn train(app_m: &ArgMatches) -> Result<()> {
	let mut config = load_with_overrides(app_m)?;
	if let Some(epochs) = app_m.value_of("EPOCHS") {
		config.epochs = epochs
			.parse::<usize>()
			.map_err(|_| FlowError::InvalidParameter(format!("EPOCHS must be a positive integer, got '{}'", epochs)))?;
	}

	let registries = Registries::with_defaults();
	let train_loader = train_loader(&config, &registries)?;
	let val_loader = val_loader(&config, &registries)?;
	tracing::info!(
		"Training batches per epoch: {}, validation batches: {}",
		train_loader.len(),
		val_loader.len()
	);

	let strategy = strategy::from_config(&config);
	tracing::info!("Execution strategy: {}", strategy.name());
	let mut trainer = Trainer::new(config, registries, strategy, train_loader, val_loader)?;
	trainer.prepare()?;
	if let Some(resume) = app_m.value_of("RESUME") {
		trainer.resume_from(Path::new(resume))?;
	}

	let report = trainer.train()?;
	tracing::info!(
		epochs = report.epochs_run,
		steps = report.steps_run,
		"Training finished: min validation loss {}, min validation EPE {}",
		report.min_avg_val_loss,
		report.min_avg_val_metric
	);
	tracing::info!("Checkpoints written to: {}", trainer.config().ckpt_dir.display());
	Ok(())
}
