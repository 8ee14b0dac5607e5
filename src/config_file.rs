use std::fs;
use std::path::Path;

use crate::config::{CfgNode, TrainerConfig};
use crate::error::{FlowError, Result};

/// Load a trainer configuration from a TOML or JSON file (by extension).
/// `MASTER_ADDR` and `MASTER_PORT` override the distributed section.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<TrainerConfig> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;
    let mut config: TrainerConfig = if is_json(path) {
        serde_json::from_str(&contents)
            .map_err(|e| FlowError::Parse(format!("Failed to parse JSON config {}: {}", path.display(), e)))?
    } else {
        toml::from_str(&contents)
            .map_err(|e| FlowError::Parse(format!("Failed to parse TOML config {}: {}", path.display(), e)))?
    };
    config.distributed.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

/// Save a configuration as TOML or JSON (by extension).
pub fn save_config<P: AsRef<Path>>(config: &TrainerConfig, path: P) -> Result<()> {
    let path = path.as_ref();
    let contents = if is_json(path) {
        serde_json::to_string_pretty(config)?
    } else {
        toml::to_string_pretty(config)
            .map_err(|e| FlowError::Serialization(format!("Failed to serialize to TOML: {}", e)))?
    };
    fs::write(path, contents)?;
    Ok(())
}

fn is_json(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("json")
}

/// A configuration that trains a small FlowNetC on synthetic data, so it runs
/// without any benchmark on disk.
pub fn generate_default() -> TrainerConfig {
    let mut config = TrainerConfig::default();
    config.epochs = 2;
    config.data.batch_size = 2;
    config.data.num_workers = 0;
    config.criterion.name = "MultiScaleLoss".to_string();
    config.data.train_datasets = vec![CfgNode::empty()
        .with("name", "SyntheticShift")
        .with("len", 8)
        .with("height", 32)
        .with("width", 32)];
    config.data.val_datasets = vec![CfgNode::empty()
        .with("name", "SyntheticShift")
        .with("len", 4)
        .with("height", 32)
        .with("width", 32)
        .with("seed", 1)];
    config.model = CfgNode::empty()
        .with("name", "FlowNetC")
        .with("corr_channels", vec![16i64, 16])
        .with("max_displacement", 2)
        .with("norm", "instance")
        .with_node(
            "encoder",
            CfgNode::empty()
                .with("name", "BasicConvEncoder")
                .with("channels", vec![8i64, 16, 16])
                .with("norm", "instance"),
        );
    config
}

/// An annotated TOML template covering every section.
pub fn create_example_toml() -> String {
    r#"# flowforge training configuration

# "cpu", "-1", a device id, a comma separated id list ("0,1") or "all"
device = "cpu"
mixed_precision = false
epochs = 10
# Set to train for a fixed number of steps instead of epochs
# num_steps = 100000
seed = 0
validate_interval = 1
ckpt_interval = 1
log_iterations_interval = 100
ckpt_dir = "./ckpts"
log_dir = "./logs"
# "loss" or "metric" (average end-point error)
validate_on = "loss"

[criterion]
name = "SequenceLoss"
params = { gamma = 0.8, max_flow = 400.0 }

[optimizer]
name = "AdamW"
lr = 0.0004
params = { weight_decay = 0.0001, eps = 1e-8 }

[scheduler]
use = true
name = "OneCycleLR"
params = { pct_start = 0.05, anneal_strategy = "linear" }

[grad_clip]
use = true
value = 1.0

[data]
target_scale_factor = 1.0
batch_size = 4
num_workers = 2
shuffle = true
drop_last = true

[[data.train_datasets]]
name = "FlyingChairs"
root_dir = "./data/FlyingChairs_release/data"
split = "training"

[data.train_datasets.options]
crop = { use = true, size = [368, 496], type = "random" }
augment = { use = true }
norm_params = { use = true }

[[data.val_datasets]]
name = "MpiSintel"
root_dir = "./data/MPI_Sintel"
split = "training"
dstype = "clean"

[distributed]
use = false
backend = "threads"
master_addr = "127.0.0.1"
master_port = 12355
sync_batch_norm = false

[model]
name = "FlowNetC"

[model.encoder]
name = "BasicConvEncoder"
channels = [64, 128, 256]
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registries;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_round_trips() {
        let dir = TempDir::new().unwrap();
        for name in ["run.toml", "run.json"] {
            let path = dir.path().join(name);
            save_config(&generate_default(), &path).unwrap();
            let loaded = load_config(&path).unwrap();
            assert_eq!(loaded.epochs, 2);
            assert_eq!(loaded.data.train_datasets.len(), 1);
            assert_eq!(loaded.model.name().unwrap(), "FlowNetC");
        }
    }

    #[test]
    fn test_default_components_build() {
        let registries = Registries::with_defaults();
        let config = generate_default();
        assert!(registries.models.build_node(&config.model, &registries).is_ok());
        assert!(registries.datasets.build_node(&config.data.train_datasets[0], &registries).is_ok());
    }

    #[test]
    fn test_example_toml_parses() {
        let config: TrainerConfig = toml::from_str(&create_example_toml()).unwrap();
        assert!(config.scheduler.enabled);
        assert_eq!(config.optimizer.name, "AdamW");
        assert_eq!(config.data.train_datasets[0].name().unwrap(), "FlyingChairs");
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "epochs = 1\nlearning_rate = 0.1\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
