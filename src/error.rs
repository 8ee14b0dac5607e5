use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowError {
	#[error("IO error: {0}")]
	Io(#[from] io::Error),

	#[error("Image processing error: {0}")]
	Image(#[from] image::ImageError),

	#[error("Parse error: {0}")]
	Parse(String),

	#[error("Configuration error: {0}")]
	Config(String),

	#[error("{kind} '{name}' is not registered. Available: [{available}]")]
	NotFound {
		kind: String,
		name: String,
		available: String,
	},

	#[error("{kind} '{name}' is already registered with a different builder")]
	DuplicateRegistration { kind: String, name: String },

	#[error("Invalid parameter: {0}")]
	InvalidParameter(String),

	#[error("Invalid data in {path}: {reason}")]
	InvalidData { path: PathBuf, reason: String },

	#[error("Shape mismatch: expected {expected}, got {actual}")]
	ShapeMismatch { expected: String, actual: String },

	#[error("Device error: {0}")]
	Device(String),

	#[error("Invalid trainer state: {0}")]
	InvalidState(String),

	#[error("Serialization error: {0}")]
	Serialization(String),

	#[error("Distributed error: {0}")]
	Distributed(String),
}

impl FlowError {
	pub fn shape_mismatch(expected: impl std::fmt::Debug, actual: impl std::fmt::Debug) -> Self {
		FlowError::ShapeMismatch {
			expected: format!("{:?}", expected),
			actual: format!("{:?}", actual),
		}
	}

	pub fn invalid_data(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
		FlowError::InvalidData {
			path: path.into(),
			reason: reason.into(),
		}
	}
}

impl From<toml::de::Error> for FlowError {
	fn from(err: toml::de::Error) -> Self {
		FlowError::Config(err.to_string())
	}
}

impl From<bincode::Error> for FlowError {
	fn from(err: bincode::Error) -> Self {
		FlowError::Serialization(err.to_string())
	}
}

impl From<serde_json::Error> for FlowError {
	fn from(err: serde_json::Error) -> Self {
		FlowError::Serialization(err.to_string())
	}
}

impl From<ndarray::ShapeError> for FlowError {
	fn from(err: ndarray::ShapeError) -> Self {
		FlowError::ShapeMismatch {
			expected: "compatible layout".into(),
			actual: err.to_string(),
		}
	}
}

pub type Result<T> = std::result::Result<T, FlowError>;
