//! Complete optical-flow networks assembled from an encoder, a similarity
//! layer and a decoder.

mod flownet_c;
mod offset_net;

pub use self::flownet_c::{FlowNetC, FlowNetCArgs};
pub use self::offset_net::{OffsetFlowNet, OffsetFlowNetArgs};

use ndarray::Array4;

use crate::config::CfgNode;
use crate::error::{FlowError, Result};
use crate::nn::{self, Module, StateDict};
use crate::registry::{builder_for, Registry};

#[derive(Debug, Clone)]
pub struct FlowOutput {
	/// Flow predictions ordered coarse to fine; the last one is the finest.
	pub flow_preds: Vec<Array4<f32>>,
	/// Offset logits for each matched level, coarse to fine.
	pub flow_logits: Option<Vec<Array4<f32>>>,
	/// Finest prediction resized to the input resolution; eval mode only.
	pub flow_upsampled: Option<Array4<f32>>,
}

impl FlowOutput {
	pub fn finest(&self) -> Result<&Array4<f32>> {
		self.flow_preds
			.last()
			.ok_or_else(|| FlowError::InvalidState("model produced no flow predictions".into()))
	}

	/// Full-resolution flow when present, otherwise the finest prediction.
	pub fn final_flow(&self) -> Result<&Array4<f32>> {
		match &self.flow_upsampled {
			Some(flow) => Ok(flow),
			None => self.finest(),
		}
	}
}

/// dLoss/dOutput, shaped like the [`FlowOutput`] it belongs to.
#[derive(Debug, Clone)]
pub struct FlowGrads {
	pub flow_preds: Vec<Array4<f32>>,
	pub flow_logits: Option<Vec<Array4<f32>>>,
}

impl FlowGrads {
	pub fn zeros_like(output: &FlowOutput) -> Self {
		FlowGrads {
			flow_preds: output.flow_preds.iter().map(|p| Array4::zeros(p.raw_dim())).collect(),
			flow_logits: output
				.flow_logits
				.as_ref()
				.map(|logits| logits.iter().map(|l| Array4::zeros(l.raw_dim())).collect()),
		}
	}

	pub fn add_assign(&mut self, other: &FlowGrads) -> Result<()> {
		if self.flow_preds.len() != other.flow_preds.len() {
			return Err(FlowError::shape_mismatch(self.flow_preds.len(), other.flow_preds.len()));
		}
		for (a, b) in self.flow_preds.iter_mut().zip(&other.flow_preds) {
			*a += b;
		}
		match (&mut self.flow_logits, &other.flow_logits) {
			(Some(a), Some(b)) => {
				for (x, y) in a.iter_mut().zip(b) {
					*x += y;
				}
			}
			(None, Some(b)) => self.flow_logits = Some(b.clone()),
			_ => {}
		}
		Ok(())
	}

	pub fn scale(&mut self, factor: f32) {
		for g in self.flow_preds.iter_mut() {
			g.mapv_inplace(|v| v * factor);
		}
		if let Some(logits) = &mut self.flow_logits {
			for g in logits.iter_mut() {
				g.mapv_inplace(|v| v * factor);
			}
		}
	}
}

pub trait FlowModel: Module {
	fn name(&self) -> &str;

	/// Both images are `[N, C, H, W]` with equal shapes.
	fn forward(&mut self, img1: &Array4<f32>, img2: &Array4<f32>) -> Result<FlowOutput>;

	/// Back-propagates through the last `forward`, accumulating parameter gradients.
	fn backward(&mut self, grads: &FlowGrads) -> Result<()>;

	fn is_training(&self) -> bool;

	fn clone_box(&self) -> Box<dyn FlowModel>;

	fn state_dict(&self) -> StateDict {
		nn::state_dict(self)
	}

	fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
		nn::load_state_dict(self, state)
	}
}

impl Clone for Box<dyn FlowModel> {
	fn clone(&self) -> Self {
		self.clone_box()
	}
}

pub fn register(registry: &mut Registry<Box<dyn FlowModel>>) -> Result<()> {
	registry.register("FlowNetC", builder_for(|m: FlowNetC| Box::new(m) as Box<dyn FlowModel>))?;
	registry.register(
		"OffsetFlowNet",
		builder_for(|m: OffsetFlowNet| Box::new(m) as Box<dyn FlowModel>),
	)?;
	Ok(())
}

/// Sets `seed` on a sub-component node unless the node sets it itself.
pub(crate) fn with_default_seed(node: &CfgNode, seed: u64) -> CfgNode {
	if node.contains("seed") {
		node.clone()
	} else {
		node.clone().with("seed", seed as i64)
	}
}

pub(crate) fn with_in_channels(node: &CfgNode, channels: &[usize]) -> CfgNode {
	let channels: Vec<i64> = channels.iter().map(|&c| c as i64).collect();
	node.clone().with("in_channels", channels)
}

pub(crate) fn check_pair(img1: &Array4<f32>, img2: &Array4<f32>) -> Result<()> {
	if img1.dim() != img2.dim() {
		return Err(FlowError::shape_mismatch(img1.dim(), img2.dim()));
	}
	Ok(())
}
