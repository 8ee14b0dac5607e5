use ndarray::Array4;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::Decoder;
use crate::constants::model;
use crate::error::{FlowError, Result};
use crate::nn::resample::{upsample_flow, upsample_flow_backward};
use crate::nn::{cat_channels, split_channels, Conv2d, ConvBlock, Layer, Module, NormKind, Param, Upsample};
use crate::registry::{Configurable, Registries};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowNetConvDecoderArgs {
	/// Channels of each input feature map, fine to coarse. Filled in by the model.
	pub in_channels: Vec<usize>,
	/// Width of each upsampling stage, fine to coarse. Empty means each stage
	/// matches the width of the skip connection it is joined with.
	pub channels: Vec<usize>,
	pub norm: NormKind,
	pub seed: u64,
}

impl Default for FlowNetConvDecoderArgs {
	fn default() -> Self {
		Self {
			in_channels: Vec::new(),
			channels: Vec::new(),
			norm: NormKind::None,
			seed: 0,
		}
	}
}

#[derive(Debug, Clone)]
struct UpStage {
	upsample: Upsample,
	block: ConvBlock,
}

/// FlowNet refinement: predict flow at the coarsest level, then repeatedly
/// upsample features and flow, join them with the skip features of the next
/// finer level and predict again.
#[derive(Debug, Clone)]
pub struct FlowNetConvDecoder {
	in_channels: Vec<usize>,
	up_channels: Vec<usize>,
	/// `predict[i]` runs at pyramid level `i` (0 is finest).
	predict: Vec<Conv2d>,
	/// `up[i]` lifts level `i + 1` to level `i`.
	up: Vec<UpStage>,
}

impl FlowNetConvDecoder {
	pub fn new(args: FlowNetConvDecoderArgs) -> Result<Self> {
		let levels = args.in_channels.len();
		if levels == 0 {
			return Err(FlowError::InvalidParameter(
				"FlowNetConvDecoder needs the channel count of at least one feature level".into(),
			));
		}
		let up_channels = if args.channels.is_empty() {
			args.in_channels[..levels - 1].to_vec()
		} else {
			args.channels.clone()
		};
		if up_channels.len() != levels - 1 {
			return Err(FlowError::InvalidParameter(format!(
				"FlowNetConvDecoder expects {} stage widths for {} feature levels, got {}",
				levels - 1,
				levels,
				up_channels.len()
			)));
		}

		let mut rng = StdRng::seed_from_u64(args.seed);
		let mut predict = Vec::with_capacity(levels);
		let mut up = Vec::with_capacity(levels - 1);
		// x at level i: the raw coarsest features, or the concatenation built for level i
		let mut x_channels = vec![0; levels];
		x_channels[levels - 1] = args.in_channels[levels - 1];
		for i in (0..levels - 1).rev() {
			x_channels[i] = args.in_channels[i] + up_channels[i] + 2;
		}
		for (i, &channels) in x_channels.iter().enumerate() {
			predict.push(Conv2d::new(
				&format!("predict_flow{}", i),
				channels,
				2,
				3,
				1,
				model::LEAKY_SLOPE,
				&mut rng,
			));
		}
		for i in 0..levels - 1 {
			up.push(UpStage {
				upsample: Upsample::new(2),
				block: ConvBlock::new(
					&format!("deconv{}", i),
					x_channels[i + 1],
					up_channels[i],
					3,
					1,
					args.norm,
					model::LEAKY_SLOPE,
					&mut rng,
				)?,
			});
		}

		Ok(FlowNetConvDecoder {
			in_channels: args.in_channels,
			up_channels,
			predict,
			up,
		})
	}

	fn levels(&self) -> usize {
		self.in_channels.len()
	}
}

impl Configurable for FlowNetConvDecoder {
	type Args = FlowNetConvDecoderArgs;

	fn from_args(args: Self::Args, _registries: &Registries) -> Result<Self> {
		Self::new(args)
	}
}

impl Module for FlowNetConvDecoder {
	fn params(&self) -> Vec<&Param> {
		let mut params: Vec<&Param> = self.predict.iter().flat_map(|p| p.params()).collect();
		params.extend(self.up.iter().flat_map(|u| u.block.params()));
		params
	}

	fn params_mut(&mut self) -> Vec<&mut Param> {
		let mut params: Vec<&mut Param> = self.predict.iter_mut().flat_map(|p| p.params_mut()).collect();
		params.extend(self.up.iter_mut().flat_map(|u| u.block.params_mut()));
		params
	}

	fn set_training(&mut self, training: bool) {
		self.up.iter_mut().for_each(|u| u.block.set_training(training));
	}
}

impl Decoder for FlowNetConvDecoder {
	/// `features` are ordered fine to coarse.
	fn forward(&mut self, features: &[Array4<f32>]) -> Result<Vec<Array4<f32>>> {
		let levels = self.levels();
		if features.len() != levels {
			return Err(FlowError::shape_mismatch(format!("{} feature levels", levels), features.len()));
		}

		let mut x = features[levels - 1].clone();
		let mut flow = self.predict[levels - 1].forward(&x)?;
		let mut flows = Vec::with_capacity(levels);
		flows.push(flow.clone());

		for i in (0..levels - 1).rev() {
			let stage = &mut self.up[i];
			let up = stage.block.forward(&stage.upsample.forward(&x)?)?;
			let flow_up = upsample_flow(&flow, 2);
			let skip = &features[i];
			if skip.shape()[2..] != up.shape()[2..] {
				return Err(FlowError::shape_mismatch(
					format!("level {} at twice the resolution of level {}", i, i + 1),
					(skip.shape()[2..].to_vec(), up.shape()[2..].to_vec()),
				));
			}
			x = cat_channels(&[skip, &up, &flow_up])?;
			flow = self.predict[i].forward(&x)?;
			flows.push(flow.clone());
		}
		Ok(flows)
	}

	fn backward(&mut self, flow_grads: &[Array4<f32>]) -> Result<Vec<Array4<f32>>> {
		let levels = self.levels();
		if flow_grads.len() != levels {
			return Err(FlowError::shape_mismatch(levels, flow_grads.len()));
		}

		let mut feature_grads = Vec::with_capacity(levels);
		let mut gx_from_finer: Option<Array4<f32>> = None;
		let mut gflow_from_finer: Option<Array4<f32>> = None;

		for i in 0..levels {
			let mut gflow = flow_grads[levels - 1 - i].clone();
			if let Some(g) = gflow_from_finer.take() {
				gflow += &g;
			}
			let mut gx = self.predict[i].backward(&gflow)?;
			if let Some(g) = gx_from_finer.take() {
				gx += &g;
			}

			if i == levels - 1 {
				feature_grads.push(gx);
				break;
			}

			let parts = split_channels(&gx, &[self.in_channels[i], self.up_channels[i], 2])?;
			let mut parts = parts.into_iter();
			let (g_skip, g_up, g_flow_up) = match (parts.next(), parts.next(), parts.next()) {
				(Some(a), Some(b), Some(c)) => (a, b, c),
				_ => return Err(FlowError::shape_mismatch(3, 0)),
			};
			feature_grads.push(g_skip);

			let stage = &mut self.up[i];
			gx_from_finer = Some(stage.upsample.backward(&stage.block.backward(&g_up)?)?);
			gflow_from_finer = Some(upsample_flow_backward(&g_flow_up, 2)?);
		}
		Ok(feature_grads)
	}

	fn clone_box(&self) -> Box<dyn Decoder> {
		Box::new(self.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn pyramid() -> Vec<Array4<f32>> {
		vec![
			Array4::from_elem((1, 4, 8, 8), 0.1),
			Array4::from_elem((1, 6, 4, 4), 0.2),
			Array4::from_elem((1, 8, 2, 2), 0.3),
		]
	}

	fn decoder() -> FlowNetConvDecoder {
		FlowNetConvDecoder::new(FlowNetConvDecoderArgs {
			in_channels: vec![4, 6, 8],
			channels: vec![3, 5],
			..Default::default()
		})
		.unwrap()
	}

	#[test]
	fn predictions_run_coarse_to_fine() {
		let flows = decoder().forward(&pyramid()).unwrap();
		let dims: Vec<_> = flows.iter().map(|f| f.dim()).collect();
		assert_eq!(dims, vec![(1, 2, 2, 2), (1, 2, 4, 4), (1, 2, 8, 8)]);
	}

	#[test]
	fn backward_returns_one_gradient_per_feature() {
		let mut decoder = decoder();
		let features = pyramid();
		let flows = decoder.forward(&features).unwrap();
		let grads: Vec<_> = flows.iter().map(|f| Array4::ones(f.raw_dim())).collect();
		let feature_grads = decoder.backward(&grads).unwrap();
		for (g, f) in feature_grads.iter().zip(&features) {
			assert_eq!(g.dim(), f.dim());
		}
	}

	#[test]
	fn stage_widths_must_match_levels() {
		let result = FlowNetConvDecoder::new(FlowNetConvDecoderArgs {
			in_channels: vec![4, 6, 8],
			channels: vec![3],
			..Default::default()
		});
		assert!(result.is_err());
	}
}
