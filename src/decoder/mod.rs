//! Flow decoders. Every decoder returns its predictions ordered coarse to fine.

mod conv;
mod soft_argmax;

pub use self::conv::{FlowNetConvDecoder, FlowNetConvDecoderArgs};
pub use self::soft_argmax::{max_displacement_for, SoftArgmaxDecoder, SoftArgmaxDecoderArgs};

use ndarray::Array4;

use crate::error::Result;
use crate::nn::Module;
use crate::registry::{builder_for, Registry};

pub trait Decoder: Module {
	fn forward(&mut self, features: &[Array4<f32>]) -> Result<Vec<Array4<f32>>>;

	/// Takes dLoss/dFlow for every prediction (same order as `forward`'s
	/// output) and returns dLoss/dFeature for every input.
	fn backward(&mut self, flow_grads: &[Array4<f32>]) -> Result<Vec<Array4<f32>>>;

	fn clone_box(&self) -> Box<dyn Decoder>;
}

impl Clone for Box<dyn Decoder> {
	fn clone(&self) -> Self {
		self.clone_box()
	}
}

pub fn register(registry: &mut Registry<Box<dyn Decoder>>) -> Result<()> {
	registry.register(
		"FlowNetConvDecoder",
		builder_for(|d: FlowNetConvDecoder| Box::new(d) as Box<dyn Decoder>),
	)?;
	registry.register(
		"SoftArgmaxDecoder",
		builder_for(|d: SoftArgmaxDecoder| Box::new(d) as Box<dyn Decoder>),
	)?;
	Ok(())
}
