use std::path::PathBuf;
use std::process;

use anyhow::Context;
use tracing::Level;

use flowforge::logging::{init_logging, LogConfig, LogFormat};
use flowforge::{cli, commands};

fn log_config(app_m: &clap::ArgMatches) -> LogConfig {
	let level = match app_m.value_of("LOG_LEVEL") {
		Some("error") => Level::ERROR,
		Some("warn") => Level::WARN,
		Some("debug") => Level::DEBUG,
		Some("trace") => Level::TRACE,
		_ => Level::INFO,
	};
	let format = match app_m.value_of("LOG_FORMAT") {
		Some("pretty") => LogFormat::Pretty,
		Some("json") => LogFormat::Json,
		_ => LogFormat::Compact,
	};
	let log_directory = app_m.value_of("LOG_DIR").map(PathBuf::from);
	LogConfig {
		level,
		format,
		enable_file_logging: log_directory.is_some(),
		log_directory,
	}
}

fn run(app_m: &clap::ArgMatches) -> anyhow::Result<()> {
	match app_m.subcommand() {
		("train", Some(sub_m)) => commands::train(sub_m).context("training failed"),
		("eval", Some(sub_m)) => commands::eval(sub_m).context("evaluation failed"),
		("generate-config", Some(sub_m)) => commands::generate_config(sub_m).context("could not write configuration"),
		(name, _) => anyhow::bail!("unknown subcommand '{}'", name),
	}
}

fn main() {
	let app_m = cli::build_cli();

	let _guard = match init_logging(log_config(&app_m)) {
		Ok(guard) => guard,
		Err(err) => {
			eprintln!("Failed to initialise logging: {:#}", err);
			process::exit(1);
		}
	};

	if let Err(err) = run(&app_m) {
		tracing::error!("Error: {:#}", err);
		process::exit(1);
	}
}
