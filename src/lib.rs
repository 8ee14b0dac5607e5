//! Training and evaluation of FlowNet-style optical flow networks.

#[macro_use]
extern crate serde_derive;

pub mod cli;
pub mod commands;
pub mod config;
pub mod config_file;
pub mod constants;
pub mod data;
pub mod decoder;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod functional;
pub mod logging;
pub mod models;
pub mod nn;
pub mod registry;
pub mod similarity;

pub use crate::config::{CfgNode, TrainerConfig};
pub use crate::error::{FlowError, Result};
pub use crate::registry::Registries;
