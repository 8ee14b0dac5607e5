
use tempfile::TempDir;

use flowforge::cli::build_app;
use flowforge::commands;
use flowforge::config_file::load_config;
use test_helpers::{assert_err, assert_ok};

fn generate(args: &[&str]) -> flowforge::Result<()> {
    let mut argv = vec!["flowforge", "generate-config"];
    argv.extend_from_slice(args);
    let matches = build_app().get_matches_from(argv);
    let sub = matches.subcommand_matches("generate-config").unwrap();
    commands::generate_config(sub)
}

#[test]
fn generated_config_loads_and_is_not_overwritten() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("run.toml");
    let path = path.to_str().unwrap();

    assert_ok(generate(&[path]), "first write");
    let config = assert_ok(load_config(path), "load");
    assert_eq!(config.model.name().unwrap(), "FlowNetC");

    assert_err(generate(&[path]), "existing file");
    assert_ok(generate(&[path, "--force"]), "forced write");
}

#[test]
fn json_and_example_outputs() {
    let dir = TempDir::new().unwrap();
    let json = dir.path().join("run.json");
    assert_ok(generate(&[json.to_str().unwrap(), "--format", "json"]), "json");
    assert_ok(load_config(&json), "load json");

    let mismatched = dir.path().join("run.toml");
    assert_err(generate(&[mismatched.to_str().unwrap(), "--format", "json"]), "extension mismatch");

    let example = dir.path().join("example.toml");
    assert_ok(generate(&[example.to_str().unwrap(), "--example"]), "example");
    let example_json = dir.path().join("example.json");
    assert_err(
        generate(&[example_json.to_str().unwrap(), "--example", "--format", "json"]),
        "example as json",
    );
}
