//! Device selection.
//!
//! Compute runs on the host CPU. Accelerators are numbered compute lanes
//! reported by a [`DeviceProvider`]; each distributed rank owns one.

use std::env;
use std::fmt;
use std::str::FromStr;

use crate::constants::env as env_keys;
use crate::error::{FlowError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
	Cpu,
	Accelerator(usize),
}

impl Device {
	pub fn is_cpu(&self) -> bool {
		matches!(self, Device::Cpu)
	}
}

impl fmt::Display for Device {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Device::Cpu => write!(f, "cpu"),
			Device::Accelerator(id) => write!(f, "accel:{}", id),
		}
	}
}

/// The `device` setting: `"cpu"`, `"-1"`, `"all"` or ids like `"0"` / `"0,1"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSpec {
	Cpu,
	All,
	Ids(Vec<usize>),
}

impl FromStr for DeviceSpec {
	type Err = FlowError;

	fn from_str(s: &str) -> Result<Self> {
		let s = s.trim();
		match s.to_ascii_lowercase().as_str() {
			"cpu" | "-1" => return Ok(DeviceSpec::Cpu),
			"all" => return Ok(DeviceSpec::All),
			_ => {}
		}
		let ids = s
			.split(',')
			.map(|id| {
				id.trim()
					.parse::<usize>()
					.map_err(|_| FlowError::Config(format!("'{}' is not a device id in device '{}'", id.trim(), s)))
			})
			.collect::<Result<Vec<_>>>()?;
		if ids.is_empty() {
			return Err(FlowError::Config("device list is empty".into()));
		}
		Ok(DeviceSpec::Ids(ids))
	}
}

impl DeviceSpec {
	/// Number of devices requested, if known without a provider.
	pub fn requested(&self) -> Option<usize> {
		match self {
			DeviceSpec::Cpu => Some(1),
			DeviceSpec::All => None,
			DeviceSpec::Ids(ids) => Some(ids.len()),
		}
	}

	/// Accelerator ids this spec selects out of `available`.
	pub fn select(&self, available: usize) -> Result<Vec<usize>> {
		match self {
			DeviceSpec::Cpu => Ok(Vec::new()),
			DeviceSpec::All => Ok((0..available).collect()),
			DeviceSpec::Ids(ids) => {
				if ids.len() > available {
					return Err(FlowError::Device(format!(
						"Total devices ({}) cannot be greater than available devices ({})",
						ids.len(),
						available
					)));
				}
				if let Some(id) = ids.iter().find(|&&id| id >= available) {
					return Err(FlowError::Device(format!(
						"Device {} is not available, only {} found",
						id, available
					)));
				}
				Ok(ids.clone())
			}
		}
	}
}

pub trait DeviceProvider: fmt::Debug + Send + Sync {
	fn accelerator_count(&self) -> usize;
}

/// Reads the comma separated id list in `FLOWFORGE_VISIBLE_DEVICES`.
/// Unset or empty means no accelerators.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvDeviceProvider;

impl DeviceProvider for EnvDeviceProvider {
	fn accelerator_count(&self) -> usize {
		match env::var(env_keys::VISIBLE_DEVICES) {
			Ok(value) => value.split(',').filter(|id| !id.trim().is_empty()).count(),
			Err(_) => 0,
		}
	}
}

/// A fixed number of accelerators.
#[derive(Debug, Clone, Copy)]
pub struct FixedDeviceProvider(pub usize);

impl DeviceProvider for FixedDeviceProvider {
	fn accelerator_count(&self) -> usize {
		self.0
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_device_settings() {
		assert_eq!("cpu".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cpu);
		assert_eq!("-1".parse::<DeviceSpec>().unwrap(), DeviceSpec::Cpu);
		assert_eq!("ALL".parse::<DeviceSpec>().unwrap(), DeviceSpec::All);
		assert_eq!("0, 2".parse::<DeviceSpec>().unwrap(), DeviceSpec::Ids(vec![0, 2]));
		assert!("gpu0".parse::<DeviceSpec>().is_err());
	}

	#[test]
	fn selection_respects_available_devices() {
		assert_eq!(DeviceSpec::All.select(3).unwrap(), vec![0, 1, 2]);
		assert_eq!(DeviceSpec::Ids(vec![1]).select(2).unwrap(), vec![1]);
		assert!(DeviceSpec::Ids(vec![0, 1, 2]).select(2).is_err());
		assert!(DeviceSpec::Ids(vec![3]).select(2).is_err());
		assert!(DeviceSpec::Cpu.select(4).unwrap().is_empty());
	}

	#[test]
	fn fixed_provider_reports_its_count() {
		assert_eq!(FixedDeviceProvider(2).accelerator_count(), 2);
		assert_eq!(Device::Accelerator(1).to_string(), "accel:1");
	}
}
