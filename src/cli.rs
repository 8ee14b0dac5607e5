use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};

pub fn build_cli() -> ArgMatches<'static> {
	build_app().get_matches()
}

pub fn build_app() -> App<'static, 'static> {
	App::new("flowforge")
		.version(env!("CARGO_PKG_VERSION"))
		.about("Train and evaluate FlowNet-style optical flow networks")
		.settings(&[AppSettings::SubcommandRequiredElseHelp, AppSettings::VersionlessSubcommands])
		.arg(build_log_level_arg())
		.arg(build_log_format_arg())
		.arg(build_log_file_arg())
		.subcommand(build_train_subcommand())
		.subcommand(build_eval_subcommand())
		.subcommand(build_generate_config_subcommand())
}

fn build_log_level_arg() -> Arg<'static, 'static> {
	Arg::with_name("LOG_LEVEL")
		.long("log-level")
		.global(true)
		.value_name("LEVEL")
		.possible_values(&["error", "warn", "info", "debug", "trace"])
		.help("Minimum level of log output. Default: info")
		.empty_values(false)
}

fn build_log_format_arg() -> Arg<'static, 'static> {
	Arg::with_name("LOG_FORMAT")
		.long("log-format")
		.global(true)
		.value_name("FORMAT")
		.possible_values(&["compact", "pretty", "json"])
		.help("Console log format. Default: compact")
		.empty_values(false)
}

fn build_log_file_arg() -> Arg<'static, 'static> {
	Arg::with_name("LOG_DIR")
		.long("log-file-dir")
		.global(true)
		.value_name("DIR")
		.help("Also write JSON logs to a daily rolling file in this directory")
		.empty_values(false)
}

fn build_config_arg() -> Arg<'static, 'static> {
	Arg::with_name("CONFIG_FILE")
		.short("c")
		.long("config")
		.value_name("FILE")
		.required(true)
		.help("Training configuration (.toml or .json)")
		.empty_values(false)
}

fn build_device_arg() -> Arg<'static, 'static> {
	Arg::with_name("DEVICE")
		.short("d")
		.long("device")
		.value_name("DEVICE")
		.allow_hyphen_values(true)
		.help("Overrides the configured device: cpu, -1, an id, a comma separated id list or all")
		.empty_values(false)
}

fn build_train_subcommand() -> App<'static, 'static> {
	SubCommand::with_name("train")
		.about("Train the configured model on the configured datasets")
		.arg(build_config_arg())
		.arg(build_device_arg())
		.arg(
			Arg::with_name("RESUME")
				.short("r")
				.long("resume")
				.value_name("CHECKPOINT")
				.help("Continue from a checkpoint written by a previous run (.pth)")
				.empty_values(false),
		)
		.arg(
			Arg::with_name("EPOCHS")
				.short("e")
				.long("epochs")
				.help("Overrides the configured number of epochs")
				.empty_values(false),
		)
}

fn build_eval_subcommand() -> App<'static, 'static> {
	SubCommand::with_name("eval")
		.about("Report the average end-point error of trained weights on the validation datasets")
		.arg(build_config_arg())
		.arg(build_device_arg())
		.arg(
			Arg::with_name("WEIGHTS")
				.short("w")
				.long("weights")
				.value_name("FILE")
				.required(true)
				.help("Best-model or checkpoint file (.pth)")
				.empty_values(false),
		)
}

fn build_generate_config_subcommand() -> App<'static, 'static> {
	SubCommand::with_name("generate-config")
		.about("Write a configuration file to start from")
		.arg(
			Arg::with_name("OUTPUT_FILE")
				.index(1)
				.help("Where to write the configuration. Default: flowforge.toml"),
		)
		.arg(
			Arg::with_name("FORMAT")
				.short("f")
				.long("format")
				.possible_values(&["toml", "json"])
				.help("Output format. Default: toml")
				.empty_values(false),
		)
		.arg(
			Arg::with_name("EXAMPLE")
				.long("example")
				.help("Write the annotated benchmark template instead of the runnable synthetic setup"),
		)
		.arg(
			Arg::with_name("FORCE")
				.long("force")
				.help("Overwrite an existing file"),
		)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn train_requires_a_config() {
		assert!(build_app().get_matches_from_safe(vec!["flowforge", "train"]).is_err());
		let m = build_app()
			.get_matches_from_safe(vec!["flowforge", "--log-level", "debug", "train", "-c", "run.toml", "-r", "a.pth"])
			.unwrap();
		let sub = m.subcommand_matches("train").unwrap();
		assert_eq!(sub.value_of("CONFIG_FILE"), Some("run.toml"));
		assert_eq!(sub.value_of("RESUME"), Some("a.pth"));
		assert_eq!(m.value_of("LOG_LEVEL"), Some("debug"));
	}

	#[test]
	fn eval_requires_weights() {
		assert!(build_app()
			.get_matches_from_safe(vec!["flowforge", "eval", "-c", "run.toml"])
			.is_err());
	}
}
