//! Host-side neural network building blocks.
//!
//! Every layer caches what it needs during `forward` and consumes that cache
//! in `backward`, which returns dLoss/dInput and accumulates dLoss/dParam into
//! each [`Param::grad`]. Tensors are channels-first `[N, C, H, W]`.

pub mod activation;
pub mod block;
pub mod conv;
pub mod init;
pub mod norm;
pub mod resample;

use indexmap::IndexMap;
use ndarray::{concatenate, s, Array4, ArrayD, Axis, Ix4};

use crate::error::{FlowError, Result};

pub use self::activation::Activation;
pub use self::block::{ConvBlock, ResidualBlock};
pub use self::conv::Conv2d;
pub use self::norm::{Norm2d, NormKind};
pub use self::resample::Upsample;

/// Named parameter or buffer tensors, in registration order.
pub type StateDict = IndexMap<String, ArrayD<f32>>;

#[derive(Debug, Clone)]
pub struct Param {
	pub name: String,
	pub value: ArrayD<f32>,
	pub grad: ArrayD<f32>,
	/// Buffers (running statistics) are saved with the model but never optimised.
	pub trainable: bool,
}

impl Param {
	pub fn new(name: impl Into<String>, value: ArrayD<f32>) -> Self {
		let grad = ArrayD::zeros(value.raw_dim());
		Param {
			name: name.into(),
			value,
			grad,
			trainable: true,
		}
	}

	pub fn buffer(name: impl Into<String>, value: ArrayD<f32>) -> Self {
		Param {
			trainable: false,
			..Param::new(name, value)
		}
	}

	pub fn zero_grad(&mut self) {
		self.grad.fill(0.0);
	}

	pub fn numel(&self) -> usize {
		self.value.len()
	}
}

pub trait Module: Send {
	fn params(&self) -> Vec<&Param>;
	fn params_mut(&mut self) -> Vec<&mut Param>;
	fn set_training(&mut self, _training: bool) {}
}

/// A single-input, single-output differentiable layer.
pub trait Layer: Module {
	fn forward(&mut self, input: &Array4<f32>) -> Result<Array4<f32>>;
	fn backward(&mut self, grad_output: &Array4<f32>) -> Result<Array4<f32>>;
}

pub fn state_dict<M: Module + ?Sized>(module: &M) -> StateDict {
	module
		.params()
		.into_iter()
		.map(|p| (p.name.clone(), p.value.clone()))
		.collect()
}

pub fn trainable_state_dict<M: Module + ?Sized>(module: &M) -> StateDict {
	module
		.params()
		.into_iter()
		.filter(|p| p.trainable)
		.map(|p| (p.name.clone(), p.value.clone()))
		.collect()
}

/// Copies `state` into `module`. Every parameter must be present with a matching shape.
pub fn load_state_dict<M: Module + ?Sized>(module: &mut M, state: &StateDict) -> Result<()> {
	for param in module.params_mut() {
		let value = state
			.get(&param.name)
			.ok_or_else(|| FlowError::Serialization(format!("state dict is missing '{}'", param.name)))?;
		if value.shape() != param.value.shape() {
			return Err(FlowError::shape_mismatch(param.value.shape(), value.shape()));
		}
		param.value.assign(value);
	}
	Ok(())
}

/// Prepends `prefix.` to every parameter name of `module`.
pub fn prefix_names<M: Module + ?Sized>(module: &mut M, prefix: &str) {
	for param in module.params_mut() {
		param.name = format!("{}.{}", prefix, param.name);
	}
}

pub fn zero_grad<M: Module + ?Sized>(module: &mut M) {
	for param in module.params_mut() {
		param.zero_grad();
	}
}

pub fn num_parameters<M: Module + ?Sized>(module: &M) -> usize {
	module.params().iter().filter(|p| p.trainable).map(|p| p.numel()).sum()
}

pub(crate) fn to_4d(array: &ArrayD<f32>) -> Result<ndarray::ArrayView4<'_, f32>> {
	array
		.view()
		.into_dimensionality::<Ix4>()
		.map_err(|_| FlowError::shape_mismatch("4 dimensions", array.shape()))
}

pub fn cat_channels(parts: &[&Array4<f32>]) -> Result<Array4<f32>> {
	let views: Vec<_> = parts.iter().map(|p| p.view()).collect();
	Ok(concatenate(Axis(1), &views)?)
}

/// Splits along the channel axis at each running offset in `sizes`.
pub fn split_channels(x: &Array4<f32>, sizes: &[usize]) -> Result<Vec<Array4<f32>>> {
	let total: usize = sizes.iter().sum();
	if total != x.shape()[1] {
		return Err(FlowError::shape_mismatch(total, x.shape()[1]));
	}
	let mut offset = 0;
	let mut parts = Vec::with_capacity(sizes.len());
	for &size in sizes {
		parts.push(x.slice(s![.., offset..offset + size, .., ..]).to_owned());
		offset += size;
	}
	Ok(parts)
}

pub fn cat_batch(a: &Array4<f32>, b: &Array4<f32>) -> Result<Array4<f32>> {
	Ok(concatenate(Axis(0), &[a.view(), b.view()])?)
}

/// Inverse of [`cat_batch`] for two equal halves.
pub fn split_batch(x: &Array4<f32>) -> Result<(Array4<f32>, Array4<f32>)> {
	let n = x.shape()[0];
	if n % 2 != 0 {
		return Err(FlowError::shape_mismatch("even batch", n));
	}
	let half = n / 2;
	Ok((
		x.slice(s![..half, .., .., ..]).to_owned(),
		x.slice(s![half.., .., .., ..]).to_owned(),
	))
}

#[cfg(test)]
mod tests {
	use super::*;
	use ndarray::IxDyn;

	struct Pair {
		a: Param,
		b: Param,
	}

	impl Module for Pair {
		fn params(&self) -> Vec<&Param> {
			vec![&self.a, &self.b]
		}

		fn params_mut(&mut self) -> Vec<&mut Param> {
			vec![&mut self.a, &mut self.b]
		}
	}

	#[test]
	fn state_dict_round_trip_checks_shapes() {
		let mut pair = Pair {
			a: Param::new("a", ArrayD::from_elem(IxDyn(&[2]), 1.0)),
			b: Param::buffer("b", ArrayD::zeros(IxDyn(&[3]))),
		};
		let mut state = state_dict(&pair);
		assert_eq!(state.keys().collect::<Vec<_>>(), vec!["a", "b"]);
		assert_eq!(trainable_state_dict(&pair).len(), 1);

		state["a"].fill(5.0);
		load_state_dict(&mut pair, &state).unwrap();
		assert_eq!(pair.a.value[[0]], 5.0);

		state.insert("b".into(), ArrayD::zeros(IxDyn(&[4])));
		assert!(load_state_dict(&mut pair, &state).is_err());
	}

	#[test]
	fn split_inverts_cat() {
		let a = Array4::from_elem((1, 2, 2, 2), 1.0);
		let b = Array4::from_elem((1, 3, 2, 2), 2.0);
		let joined = cat_channels(&[&a, &b]).unwrap();
		let parts = split_channels(&joined, &[2, 3]).unwrap();
		assert_eq!(parts[0], a);
		assert_eq!(parts[1], b);

		let (x, y) = split_batch(&cat_batch(&a, &a).unwrap()).unwrap();
		assert_eq!(x, y);
	}
}
