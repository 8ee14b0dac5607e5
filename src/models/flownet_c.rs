use ndarray::Array4;
use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{check_pair, with_default_seed, with_in_channels, FlowGrads, FlowModel, FlowOutput};
use crate::config::CfgNode;
use crate::constants::model;
use crate::decoder::Decoder;
use crate::encoder::{BasicConvEncoder, BasicConvEncoderArgs, Encoder};
use crate::error::{FlowError, Result};
use crate::nn::resample::resize_flow_bilinear;
use crate::nn::{
	cat_batch, cat_channels, prefix_names, split_batch, split_channels, Activation, ConvBlock, Layer, Module, NormKind,
	Param,
};
use crate::registry::{Configurable, Registries};
use crate::similarity::Correlation;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowNetCArgs {
	/// Feature encoder node; its coarsest level feeds the correlation.
	pub encoder: CfgNode,
	/// Stages applied after fusing the correlation with the redirected features.
	pub corr_channels: Vec<usize>,
	pub max_displacement: usize,
	pub norm: NormKind,
	pub decoder: CfgNode,
	pub seed: u64,
}

impl Default for FlowNetCArgs {
	fn default() -> Self {
		Self {
			encoder: CfgNode::empty()
				.with("name", "BasicConvEncoder")
				.with("channels", vec![16i64, 32, 64]),
			corr_channels: vec![64, 96],
			max_displacement: model::MAX_DISPLACEMENT,
			norm: NormKind::Batch,
			decoder: CfgNode::empty().with("name", "FlowNetConvDecoder"),
			seed: 0,
		}
	}
}

#[derive(Debug, Clone)]
struct ForwardState {
	/// Shape of each image's share of every pyramid level.
	level_dims: Vec<(usize, usize, usize, usize)>,
}

/// FlowNet with an explicit correlation layer.
///
/// Both images go through one shared encoder. The coarsest features are
/// correlated, the cost volume is joined with a 1x1 projection of the first
/// image's features, and further conv stages refine the result. The decoder
/// then sees the first image's finer levels plus those stages.
#[derive(Clone)]
pub struct FlowNetC {
	encoder: Box<dyn Encoder>,
	correlation: Correlation,
	corr_activation: Activation,
	redirect: ConvBlock,
	corr_encoder: BasicConvEncoder,
	decoder: Box<dyn Decoder>,
	fine_levels: usize,
	training: bool,
	state: Option<ForwardState>,
}

impl FlowNetC {
	pub fn new(args: FlowNetCArgs, registries: &Registries) -> Result<Self> {
		let mut encoder = registries
			.encoders
			.build_node(&with_default_seed(&args.encoder, args.seed), registries)?;
		prefix_names(encoder.as_mut(), "feature_encoder");
		let enc_channels = encoder.out_channels();
		let top = *enc_channels
			.last()
			.ok_or_else(|| FlowError::InvalidParameter("FlowNetC encoder produced no levels".into()))?;

		let correlation = Correlation::new(args.max_displacement);
		let mut rng = StdRng::seed_from_u64(args.seed.wrapping_add(1));
		let redirect = ConvBlock::new(
			"conv_redirect",
			top,
			model::REDIRECT_CHANNELS,
			1,
			1,
			args.norm,
			model::LEAKY_SLOPE,
			&mut rng,
		)?;
		let mut corr_encoder = BasicConvEncoder::new(BasicConvEncoderArgs {
			in_channels: model::REDIRECT_CHANNELS + correlation.out_channels(),
			channels: args.corr_channels.clone(),
			first_stride: 1,
			norm: args.norm,
			seed: args.seed.wrapping_add(2),
		})?;
		prefix_names(&mut corr_encoder, "corr_encoder");

		let fine_levels = enc_channels.len() - 1;
		let mut decoder_channels = enc_channels[..fine_levels].to_vec();
		decoder_channels.extend(&args.corr_channels);
		let decoder_node = with_in_channels(
			&with_default_seed(&args.decoder, args.seed.wrapping_add(3)),
			&decoder_channels,
		);
		let mut decoder = registries.decoders.build_node(&decoder_node, registries)?;
		prefix_names(decoder.as_mut(), "decoder");

		Ok(FlowNetC {
			encoder,
			correlation,
			corr_activation: Activation::leaky(model::LEAKY_SLOPE),
			redirect,
			corr_encoder,
			decoder,
			fine_levels,
			training: true,
			state: None,
		})
	}
}

impl Configurable for FlowNetC {
	type Args = FlowNetCArgs;

	fn from_args(args: Self::Args, registries: &Registries) -> Result<Self> {
		Self::new(args, registries)
	}
}

impl Module for FlowNetC {
	fn params(&self) -> Vec<&Param> {
		let mut params = self.encoder.params();
		params.extend(self.redirect.params());
		params.extend(self.corr_encoder.params());
		params.extend(self.decoder.params());
		params
	}

	fn params_mut(&mut self) -> Vec<&mut Param> {
		let mut params = self.encoder.params_mut();
		params.extend(self.redirect.params_mut());
		params.extend(self.corr_encoder.params_mut());
		params.extend(self.decoder.params_mut());
		params
	}

	fn set_training(&mut self, training: bool) {
		self.training = training;
		self.encoder.set_training(training);
		self.redirect.set_training(training);
		self.corr_encoder.set_training(training);
		self.decoder.set_training(training);
	}
}

impl FlowModel for FlowNetC {
	fn name(&self) -> &str {
		"FlowNetC"
	}

	fn forward(&mut self, img1: &Array4<f32>, img2: &Array4<f32>) -> Result<FlowOutput> {
		check_pair(img1, img2)?;
		let (_, _, h, w) = img1.dim();

		let pyramid = self.encoder.forward(&cat_batch(img1, img2)?)?;
		let mut first = Vec::with_capacity(pyramid.len());
		let mut second = Vec::with_capacity(pyramid.len());
		for level in &pyramid {
			let (a, b) = split_batch(level)?;
			first.push(a);
			second.push(b);
		}
		let level_dims = first.iter().map(|f| f.dim()).collect();

		let top = self.fine_levels;
		let corr = self.correlation.forward(&first[top], &second[top])?;
		let corr = self.corr_activation.forward(&corr)?;
		let redirected = self.redirect.forward(&first[top])?;
		let fused = cat_channels(&[&redirected, &corr])?;
		let refined = self.corr_encoder.forward(&fused)?;

		let mut features: Vec<Array4<f32>> = first.into_iter().take(top).collect();
		features.extend(refined);
		let flow_preds = self.decoder.forward(&features)?;

		let flow_upsampled = if self.training {
			None
		} else {
			flow_preds.last().map(|finest| resize_flow_bilinear(finest, h, w))
		};

		self.state = Some(ForwardState { level_dims });
		Ok(FlowOutput {
			flow_preds,
			flow_logits: None,
			flow_upsampled,
		})
	}

	fn backward(&mut self, grads: &FlowGrads) -> Result<()> {
		let state = self
			.state
			.take()
			.ok_or_else(|| FlowError::InvalidState("FlowNetC backward before forward".into()))?;
		let top = self.fine_levels;

		let mut feature_grads = self.decoder.backward(&grads.flow_preds)?;
		let refined_grads = feature_grads.split_off(top).into_iter().map(Some).collect();
		let fused_grad = self.corr_encoder.backward(refined_grads)?;

		let parts = split_channels(&fused_grad, &[model::REDIRECT_CHANNELS, self.correlation.out_channels()])?;
		let mut parts = parts.into_iter();
		let (g_redirect, g_corr) = match (parts.next(), parts.next()) {
			(Some(a), Some(b)) => (a, b),
			_ => return Err(FlowError::shape_mismatch(2, 0)),
		};
		let mut g_top1 = self.redirect.backward(&g_redirect)?;
		let g_corr = self.corr_activation.backward(&g_corr)?;
		let (g_corr1, g_top2) = self.correlation.backward(&g_corr)?;
		g_top1 += &g_corr1;

		let mut encoder_grads = Vec::with_capacity(top + 1);
		for (grad, dim) in feature_grads.into_iter().zip(&state.level_dims) {
			encoder_grads.push(Some(cat_batch(&grad, &Array4::zeros(*dim))?));
		}
		encoder_grads.push(Some(cat_batch(&g_top1, &g_top2)?));
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

	fn small(registries: &Registries) -> FlowNetC {
		FlowNetC::new(
			FlowNetCArgs {
				encoder: CfgNode::empty()
					.with("name", "BasicConvEncoder")
					.with("channels", vec![4i64, 8, 8])
					.with("norm", "instance"),
				corr_channels: vec![8, 8],
				max_displacement: 1,
				norm: NormKind::Instance,
				..Default::default()
			},
			registries,
		)
		.unwrap()
	}

	fn images() -> (Array4<f32>, Array4<f32>) {
		let img1 = Array4::from_shape_fn((1, 3, 32, 32), |(_, c, y, x)| ((c * 7 + y * 3 + x) % 13) as f32 / 13.0);
		let img2 = Array4::from_shape_fn((1, 3, 32, 32), |(_, c, y, x)| ((c * 7 + y * 3 + x + 1) % 13) as f32 / 13.0);
		(img1, img2)
	}

	#[test]
	fn predictions_cover_every_decoder_level() {
		let registries = Registries::with_defaults();
		let mut model = small(&registries);
		let (img1, img2) = images();
		let out = model.forward(&img1, &img2).unwrap();
		// two fine encoder levels plus two refinement stages
		let dims: Vec<_> = out.flow_preds.iter().map(|f| f.dim()).collect();
		assert_eq!(dims, vec![(1, 2, 2, 2), (1, 2, 4, 4), (1, 2, 8, 8), (1, 2, 16, 16)]);
		assert!(out.flow_upsampled.is_none());
	}

	#[test]
	fn eval_mode_adds_full_resolution_flow() {
		let registries = Registries::with_defaults();
		let mut model = small(&registries);
		model.set_training(false);
		let (img1, img2) = images();
		let out = model.forward(&img1, &img2).unwrap();
		assert_eq!(out.flow_upsampled.unwrap().dim(), (1, 2, 32, 32));
	}

	#[test]
	fn backward_fills_encoder_gradients() {
		let registries = Registries::with_defaults();
		let mut model = small(&registries);
		let (img1, img2) = images();
		let out = model.forward(&img1, &img2).unwrap();
		let mut grads = FlowGrads::zeros_like(&out);
		grads.flow_preds.iter_mut().for_each(|g| g.fill(1.0));
		model.backward(&grads).unwrap();
		let stem = model.params().into_iter().find(|p| p.name == "feature_encoder.stages.0.conv.weight").unwrap();
		assert!(stem.grad.iter().any(|&v| v != 0.0));
	}
}
