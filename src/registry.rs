//! Name to builder maps for every pluggable component kind.
//!
//! A [`Registries`] value is created explicitly and handed to whatever needs
//! to build components from configuration. There is no global registry.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::de::DeserializeOwned;

use crate::config::CfgNode;
use crate::data::{dataset, SharedDataset};
use crate::decoder::{self, Decoder};
use crate::encoder::{self, Encoder};
use crate::engine::optim::{self, Optimizer};
use crate::engine::scheduler::{self, LrScheduler};
use crate::error::{FlowError, Result};
use crate::functional::{self, Annealer, Criterion};
use crate::models::{self, FlowModel};

type BuildFn<T> = dyn Fn(&CfgNode, &Registries) -> Result<T> + Send + Sync;

/// A shareable constructor. Two builders are the same only if they are
/// clones of one another.
pub struct Builder<T>(Arc<BuildFn<T>>);

impl<T> Builder<T> {
	pub fn new<F>(f: F) -> Self
	where
		F: Fn(&CfgNode, &Registries) -> Result<T> + Send + Sync + 'static,
	{
		Builder(Arc::new(f))
	}

	pub fn same_as(&self, other: &Builder<T>) -> bool {
		Arc::ptr_eq(&self.0, &other.0)
	}

	pub fn build(&self, cfg: &CfgNode, registries: &Registries) -> Result<T> {
		(self.0)(cfg, registries)
	}
}

impl<T> Clone for Builder<T> {
	fn clone(&self) -> Self {
		Builder(Arc::clone(&self.0))
	}
}

impl<T> fmt::Debug for Builder<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Builder({:p})", Arc::as_ptr(&self.0))
	}
}

pub struct Registry<T> {
	kind: &'static str,
	entries: IndexMap<String, Builder<T>>,
}

impl<T> Clone for Registry<T> {
	fn clone(&self) -> Self {
		Registry {
			kind: self.kind,
			entries: self.entries.clone(),
		}
	}
}

impl<T> fmt::Debug for Registry<T> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Registry")
			.field("kind", &self.kind)
			.field("names", &self.names())
			.finish()
	}
}

impl<T> Registry<T> {
	pub fn new(kind: &'static str) -> Self {
		Registry {
			kind,
			entries: IndexMap::new(),
		}
	}

	pub fn kind(&self) -> &'static str {
		self.kind
	}

	/// Binds `name` to `builder`. Registering the very same builder again is
	/// a no-op; binding a different one to a taken name is an error.
	pub fn register(&mut self, name: &str, builder: Builder<T>) -> Result<()> {
		if let Some(existing) = self.entries.get(name) {
			if existing.same_as(&builder) {
				return Ok(());
			}
			return Err(FlowError::DuplicateRegistration {
				kind: self.kind.to_string(),
				name: name.to_string(),
			});
		}
		self.entries.insert(name.to_string(), builder);
		Ok(())
	}

	pub fn get(&self, name: &str) -> Result<&Builder<T>> {
		self.entries.get(name).ok_or_else(|| FlowError::NotFound {
			kind: self.kind.to_string(),
			name: name.to_string(),
			available: self.names().join(", "),
		})
	}

	pub fn contains(&self, name: &str) -> bool {
		self.entries.contains_key(name)
	}

	pub fn names(&self) -> Vec<&str> {
		self.entries.keys().map(String::as_str).collect()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn build(&self, name: &str, cfg: &CfgNode, registries: &Registries) -> Result<T> {
		self.get(name)?.build(cfg, registries)
	}

	/// Builds from a node that names its component: `{ name = "...", ... }`.
	pub fn build_node(&self, node: &CfgNode, registries: &Registries) -> Result<T> {
		self.build(node.name()?, &node.args(), registries)
	}
}

/// Two-step construction shared by every configurable component: map a
/// configuration node onto a typed `Args` value, then build from it.
pub trait Configurable: Sized {
	type Args: DeserializeOwned;

	fn args_from_config(cfg: &CfgNode) -> Result<Self::Args> {
		cfg.deserialize()
	}

	fn from_args(args: Self::Args, registries: &Registries) -> Result<Self>;

	fn from_config(cfg: &CfgNode, registries: &Registries) -> Result<Self> {
		Self::from_args(Self::args_from_config(cfg)?, registries)
	}
}

/// Wraps a [`Configurable`] type as a builder producing `T`.
pub fn builder_for<C, T, W>(wrap: W) -> Builder<T>
where
	C: Configurable + 'static,
	W: Fn(C) -> T + Send + Sync + 'static,
{
	Builder::new(move |cfg, registries| C::from_config(cfg, registries).map(&wrap))
}

#[derive(Debug, Clone)]
pub struct Registries {
	pub encoders: Registry<Box<dyn Encoder>>,
	pub decoders: Registry<Box<dyn Decoder>>,
	pub models: Registry<Box<dyn FlowModel>>,
	pub criteria: Registry<Box<dyn Criterion>>,
	pub annealers: Registry<Box<dyn Annealer>>,
	pub optimizers: Registry<Box<dyn Optimizer>>,
	pub schedulers: Registry<Box<dyn LrScheduler>>,
	pub datasets: Registry<SharedDataset>,
}

impl Default for Registries {
	fn default() -> Self {
		Registries::empty()
	}
}

impl Registries {
	pub fn empty() -> Self {
		Registries {
			encoders: Registry::new("encoder"),
			decoders: Registry::new("decoder"),
			models: Registry::new("model"),
			criteria: Registry::new("criterion"),
			annealers: Registry::new("annealer"),
			optimizers: Registry::new("optimizer"),
			schedulers: Registry::new("scheduler"),
			datasets: Registry::new("dataset"),
		}
	}

	/// A fresh set of registries holding every built-in component.
	pub fn with_defaults() -> Self {
		let mut registries = Registries::empty();
		registries.register_defaults();
		registries
	}

	fn register_defaults(&mut self) {
		// built-in names are distinct so none of these can collide
		let results = [
			encoder::register(&mut self.encoders),
			decoder::register(&mut self.decoders),
			models::register(&mut self.models),
			functional::register_criteria(&mut self.criteria),
			functional::register_annealers(&mut self.annealers),
			optim::register(&mut self.optimizers),
			scheduler::register(&mut self.schedulers),
			dataset::register(&mut self.datasets),
		];
		for result in results {
			if let Err(e) = result {
				tracing::error!("Failed to register built-in component: {}", e);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn constant(value: u32) -> Builder<u32> {
		Builder::new(move |_, _| Ok(value))
	}

	#[test]
	fn duplicate_name_with_other_builder_is_rejected() {
		let mut registry = Registry::new("number");
		let one = constant(1);
		registry.register("one", one.clone()).unwrap();
		registry.register("one", one).unwrap();
		assert_eq!(registry.len(), 1);

		let err = registry.register("one", constant(1)).unwrap_err();
		assert!(matches!(err, FlowError::DuplicateRegistration { .. }));
	}

	#[test]
	fn missing_name_lists_available_entries() {
		let mut registry = Registry::new("number");
		registry.register("one", constant(1)).unwrap();
		registry.register("two", constant(2)).unwrap();
		match registry.get("three") {
			Err(FlowError::NotFound { available, .. }) => assert_eq!(available, "one, two"),
			other => panic!("unexpected result: {:?}", other.map(|_| ())),
		}
		let regs = Registries::empty();
		assert_eq!(registry.build("two", &CfgNode::empty(), &regs).unwrap(), 2);
	}

	#[test]
	fn defaults_cover_every_kind() {
		let regs = Registries::with_defaults();
		assert!(regs.encoders.contains("BasicEncoder"));
		assert!(regs.decoders.contains("SoftArgmaxDecoder"));
		assert!(regs.models.contains("FlowNetC"));
		assert!(regs.criteria.contains("FlowOffsetLoss"));
		assert!(regs.annealers.contains("PolyAnnealer"));
		assert!(regs.optimizers.contains("AdamW"));
		assert!(regs.schedulers.contains("OneCycleLR"));
		assert!(regs.datasets.contains("FlyingChairs"));
	}
}
