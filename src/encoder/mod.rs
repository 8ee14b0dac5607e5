//! Feature encoders. Each returns a pyramid ordered fine to coarse.

mod conv;
mod residual;

pub use self::conv::{BasicConvEncoder, BasicConvEncoderArgs};
pub use self::residual::{BasicEncoder, BasicEncoderArgs};

use ndarray::Array4;

use crate::error::Result;
use crate::nn::Module;
use crate::registry::{builder_for, Registry};

pub trait Encoder: Module {
	fn forward(&mut self, x: &Array4<f32>) -> Result<Vec<Array4<f32>>>;

	/// Takes one optional gradient per pyramid level and returns the input gradient.
	fn backward(&mut self, grads: Vec<Option<Array4<f32>>>) -> Result<Array4<f32>>;

	/// Channel count of each pyramid level.
	fn out_channels(&self) -> Vec<usize>;

	fn clone_box(&self) -> Box<dyn Encoder>;
}

impl Clone for Box<dyn Encoder> {
	fn clone(&self) -> Self {
		self.clone_box()
	}
}

pub fn register(registry: &mut Registry<Box<dyn Encoder>>) -> Result<()> {
	registry.register(
		"BasicConvEncoder",
		builder_for(|e: BasicConvEncoder| Box::new(e) as Box<dyn Encoder>),
	)?;
	registry.register(
		"BasicEncoder",
		builder_for(|e: BasicEncoder| Box::new(e) as Box<dyn Encoder>),
	)?;
	Ok(())
}

/// Sums two optional gradients.
pub(crate) fn accumulate(acc: Option<Array4<f32>>, grad: Option<Array4<f32>>) -> Option<Array4<f32>> {
	match (acc, grad) {
		(Some(a), Some(g)) => Some(a + &g),
		(a, None) => a,
		(None, g) => g,
	}
}
