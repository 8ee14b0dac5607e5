use std::fs;
use std::path::Path;

use clap::ArgMatches;

use crate::config_file::{create_example_toml, generate_default, save_config};
use crate::error::{FlowError, Result};

pub fn generate_config(app_m: &ArgMatches) -> Result<()> {
	let format = app_m.value_of("FORMAT").unwrap_or("toml");
	let default_path = format!("flowforge.{}", format);
	let output_path = app_m.value_of("OUTPUT_FILE").unwrap_or(&default_path);

	if Path::new(output_path).exists() && !app_m.is_present("FORCE") {
		return Err(FlowError::InvalidParameter(format!(
			"File {} already exists. Use --force to overwrite",
			output_path
		)));
	}

	if app_m.is_present("EXAMPLE") {
		if format != "toml" {
			return Err(FlowError::InvalidParameter(
				"The annotated example is only available as TOML".into(),
			));
		}
		fs::write(output_path, create_example_toml())?;
		tracing::info!("Generated annotated example configuration: {}", output_path);
	} else {
		let extension = Path::new(output_path).extension().and_then(|e| e.to_str()).unwrap_or("");
		if extension != format {
			return Err(FlowError::InvalidParameter(format!(
				"Output file {} does not end in .{}",
				output_path, format
			)));
		}
		save_config(&generate_default(), output_path)?;
		tracing::info!("Generated {} configuration: {}", format.to_uppercase(), output_path);
	}

	tracing::info!("Edit it, then run: flowforge train --config {}", output_path);
	Ok(())
}
