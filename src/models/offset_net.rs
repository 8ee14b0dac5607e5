use ndarray::Array4;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{check_pair, with_default_seed, with_in_channels, FlowGrads, FlowModel, FlowOutput};
use crate::config::CfgNode;
use crate::constants::model;
use crate::decoder::Decoder;
use crate::encoder::Encoder;
use crate::error::{FlowError, Result};
use crate::nn::resample::resize_flow_bilinear;
use crate::nn::{cat_batch, prefix_names, split_batch, Conv2d, Layer, Module, Param};
use crate::registry::{Configurable, Registries};
use crate::similarity::Correlation;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OffsetFlowNetArgs {
	pub encoder: CfgNode,
	/// How many of the coarsest pyramid levels are matched.
	pub matched_levels: usize,
	pub projection_channels: usize,
	pub max_displacement: usize,
	/// Logits are the correlation divided by this.
	pub temperature: f32,
	pub decoder: CfgNode,
	pub seed: u64,
}

impl Default for OffsetFlowNetArgs {
	fn default() -> Self {
		Self {
			encoder: CfgNode::empty()
				.with("name", "BasicEncoder")
				.with("norm", "instance"),
			matched_levels: 2,
			projection_channels: 32,
			max_displacement: model::MAX_DISPLACEMENT,
			temperature: 1.0,
			decoder: CfgNode::empty().with("name", "SoftArgmaxDecoder"),
			seed: 0,
		}
	}
}

#[derive(Debug, Clone)]
struct MatchHead {
	level: usize,
	projection: Conv2d,
	correlation: Correlation,
}

/// Offset-matching flow network.
///
/// Per matched level, features of both images pass a learned 1x1 projection
/// and are correlated over a displacement window. The scaled correlation is
/// returned as offset logits and decoded into flow.
#[derive(Clone)]
pub struct OffsetFlowNet {
	encoder: Box<dyn Encoder>,
	/// Ordered coarse to fine.
	heads: Vec<MatchHead>,
	temperature: f32,
	decoder: Box<dyn Decoder>,
	levels: usize,
	training: bool,
}

impl OffsetFlowNet {
	pub fn new(args: OffsetFlowNetArgs, registries: &Registries) -> Result<Self> {
		if !(args.temperature > 0.0) {
			return Err(FlowError::InvalidParameter(format!(
				"OffsetFlowNet temperature must be positive, got {}",
				args.temperature
			)));
		}
		let mut encoder = registries
			.encoders
			.build_node(&with_default_seed(&args.encoder, args.seed), registries)?;
		prefix_names(encoder.as_mut(), "encoder");
		let enc_channels = encoder.out_channels();
		let levels = enc_channels.len();
		if args.matched_levels == 0 || args.matched_levels > levels {
			return Err(FlowError::InvalidParameter(format!(
				"OffsetFlowNet can match 1..={} levels, got {}",
				levels, args.matched_levels
			)));
		}

		let mut rng = StdRng::seed_from_u64(args.seed.wrapping_add(1));
		let heads: Vec<MatchHead> = (levels - args.matched_levels..levels)
			.rev()
			.map(|level| MatchHead {
				level,
				projection: Conv2d::new(
					&format!("projection{}", level),
					enc_channels[level],
					args.projection_channels,
					1,
					1,
					0.0,
					&mut rng,
				),
				correlation: Correlation::new(args.max_displacement),
			})
			.collect();

		let logit_channels: Vec<usize> = heads.iter().map(|h| h.correlation.out_channels()).collect();
		let decoder_node = with_in_channels(
			&with_default_seed(&args.decoder, args.seed.wrapping_add(2)),
			&logit_channels,
		);
		let mut decoder = registries.decoders.build_node(&decoder_node, registries)?;
		prefix_names(decoder.as_mut(), "decoder");

		Ok(OffsetFlowNet {
			encoder,
			heads,
			temperature: args.temperature,
			decoder,
			levels,
			training: true,
		})
	}
}

impl Configurable for OffsetFlowNet {
	type Args = OffsetFlowNetArgs;

	fn from_args(args: Self::Args, registries: &Registries) -> Result<Self> {
		Self::new(args, registries)
	}
}

impl Module for OffsetFlowNet {
	fn params(&self) -> Vec<&Param> {
		let mut params = self.encoder.params();
		params.extend(self.heads.iter().flat_map(|h| h.projection.params()));
		params.extend(self.decoder.params());
		params
	}

	fn params_mut(&mut self) -> Vec<&mut Param> {
		let mut params = self.encoder.params_mut();
		params.extend(self.heads.iter_mut().flat_map(|h| h.projection.params_mut()));
		params.extend(self.decoder.params_mut());
		params
	}

	fn set_training(&mut self, training: bool) {
		self.training = training;
		self.encoder.set_training(training);
		self.decoder.set_training(training);
	}
}

impl FlowModel for OffsetFlowNet {
	fn name(&self) -> &str {
		"OffsetFlowNet"
	}

	fn forward(&mut self, img1: &Array4<f32>, img2: &Array4<f32>) -> Result<FlowOutput> {
		check_pair(img1, img2)?;
		let (_, _, h, w) = img1.dim();

		let pyramid = self.encoder.forward(&cat_batch(img1, img2)?)?;
		let inv_temperature = 1.0 / self.temperature;
		let mut logits = Vec::with_capacity(self.heads.len());
		for head in self.heads.iter_mut() {
			let projected = head.projection.forward(&pyramid[head.level])?;
			let (a, b) = split_batch(&projected)?;
			let mut z = head.correlation.forward(&a, &b)?;
			z.mapv_inplace(|v| v * inv_temperature);
			logits.push(z);
		}

		let flow_preds = self.decoder.forward(&logits)?;
		let flow_upsampled = if self.training {
			None
		} else {
			flow_preds.last().map(|finest| resize_flow_bilinear(finest, h, w))
		};
		Ok(FlowOutput {
			flow_preds,
			flow_logits: Some(logits),
			flow_upsampled,
		})
	}

	fn backward(&mut self, grads: &FlowGrads) -> Result<()> {
		let mut logit_grads = self.decoder.backward(&grads.flow_preds)?;
		if let Some(direct) = &grads.flow_logits {
			if direct.len() != logit_grads.len() {
				return Err(FlowError::shape_mismatch(logit_grads.len(), direct.len()));
			}
			for (g, d) in logit_grads.iter_mut().zip(direct) {
				*g += d;
			}
		}

		let inv_temperature = 1.0 / self.temperature;
		let mut encoder_grads: Vec<Option<Array4<f32>>> = vec![None; self.levels];
		for (head, mut g) in self.heads.iter_mut().zip(logit_grads) {
			g.mapv_inplace(|v| v * inv_temperature);
			let (ga, gb) = head.correlation.backward(&g)?;
			let gp = head.projection.backward(&cat_batch(&ga, &gb)?)?;
			encoder_grads[head.level] = Some(gp);
		}
		self.encoder.backward(encoder_grads)?;
		Ok(())
	}

	fn is_training(&self) -> bool {
		self.training
	}

	fn clone_box(&self) -> Box<dyn FlowModel> {
		Box::new(self.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn small(registries: &Registries) -> OffsetFlowNet {
		OffsetFlowNet::new(
			OffsetFlowNetArgs {
				encoder: CfgNode::empty()
					.with("name", "BasicConvEncoder")
					.with("channels", vec![8i64, 8, 16])
					.with("norm", "none"),
				projection_channels: 8,
				max_displacement: 2,
				..Default::default()
			},
			registries,
		)
		.unwrap()
	}

	#[test]
	fn logits_and_flow_per_matched_level() {
		let registries = Registries::with_defaults();
		let mut model = small(&registries);
		let img = Array4::from_shape_fn((2, 3, 32, 32), |(b, c, y, x)| ((b + c + y * x) % 7) as f32 * 0.1);
		let out = model.forward(&img, &img).unwrap();
		let logits = out.flow_logits.as_ref().unwrap();
		assert_eq!(logits.len(), 2);
		assert_eq!(logits[0].dim(), (2, 25, 4, 4));
		assert_eq!(logits[1].dim(), (2, 25, 8, 8));
		assert_eq!(out.flow_preds[1].dim(), (2, 2, 8, 8));

		let mut grads = FlowGrads::zeros_like(&out);
		grads.flow_preds.iter_mut().for_each(|g| g.fill(1.0));
		model.backward(&grads).unwrap();
		assert!(model.params().iter().any(|p| p.grad.iter().any(|&v| v != 0.0)));
	}

	#[test]
	fn rejects_matching_more_levels_than_encoded() {
		let registries = Registries::with_defaults();
		let args = OffsetFlowNetArgs {
			matched_levels: 5,
			..Default::default()
		};
		assert!(OffsetFlowNet::new(args, &registries).is_err());
	}
}
