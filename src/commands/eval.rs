use std::path::Path;

use clap::ArgMatches;

use super::{load_with_overrides, val_loader};
use crate::engine::checkpoint::load_weights;
use crate::engine::eval_model;
use crate::error::{FlowError, Result};
use crate::registry::Registries;

pub fn eval(app_m: &ArgMatches) -> Result<()> {
	let config = load_with_overrides(app_m)?;
	let weights_path = app_m
		.value_of("WEIGHTS")
		.ok_or_else(|| FlowError::InvalidParameter("No weights file specified".into()))?;

	let registries = Registries::with_defaults();
	let mut model = registries.models.build_node(&config.model, &registries)?;
	let weights = load_weights(Path::new(weights_path))?;
	if !weights.model_name.eq_ignore_ascii_case(model.name()) {
		tracing::warn!(
			"Weights were saved for '{}' but the configured model is '{}'",
			weights.model_name,
			model.name()
		);
	}
	model.load_state_dict(&weights.model)?;
	tracing::info!("Loaded weights from: {}", weights_path);

	let mut loader = val_loader(&config, &registries)?;
	let report = eval_model(model.as_mut(), &mut loader)?;
	println!(
		"{}: average EPE {:.4} over {} batches ({:?} per batch)",
		weights_path, report.avg_metric, report.num_batches, report.avg_inference_time
	);
	Ok(())
}
