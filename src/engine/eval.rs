use std::iter;
use std::time::{Duration, Instant};

use ndarray::Array4;

use crate::data::DataLoader;
use crate::error::{FlowError, Result};
use crate::functional::{average_epe, Criterion};
use crate::logging::AverageMeter;
use crate::models::FlowModel;

/// Error between a predicted and a ground-truth flow field; lower is better.
pub type Metric = dyn Fn(&Array4<f32>, &Array4<f32>) -> Result<f32>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalReport {
	pub avg_metric: f32,
	pub avg_inference_time: Duration,
	pub num_batches: usize,
}

/// Average end-point error of `model` over one pass of `loader`.
pub fn eval_model(model: &mut dyn FlowModel, loader: &mut DataLoader) -> Result<EvalReport> {
	eval_model_with(model, loader, &|pred, target| average_epe(pred, target))
}

/// Runs one untimed warm-up batch, then times the forward pass of every
/// batch and averages `metric` over them.
pub fn eval_model_with(model: &mut dyn FlowModel, loader: &mut DataLoader, metric: &Metric) -> Result<EvalReport> {
	model.set_training(false);
	let result = run_inference(model, loader, metric);
	model.set_training(true);
	let report = result?;
	tracing::info!(
		"Average inference time: {:?}, average evaluation metric = {}",
		report.avg_inference_time,
		report.avg_metric
	);
	Ok(report)
}

fn run_inference(model: &mut dyn FlowModel, loader: &mut DataLoader, metric: &Metric) -> Result<EvalReport> {
	let mut batches = loader.batches()?;
	let first = batches
		.next()
		.transpose()?
		.ok_or_else(|| FlowError::InvalidParameter("evaluation loader yields no batches".into()))?;
	model.forward(&first.img1, &first.img2)?;

	let mut meter = AverageMeter::new();
	let mut elapsed = Duration::ZERO;
	let mut num_batches = 0;
	for batch in iter::once(Ok(first)).chain(batches) {
		let batch = batch?;
		let target = batch.target(1.0)?;
		let start = Instant::now();
		let output = model.forward(&batch.img1, &batch.img2)?;
		elapsed += start.elapsed();
		meter.update(metric(output.final_flow()?, &target.flow)?);
		num_batches += 1;
	}
	Ok(EvalReport {
		avg_metric: meter.avg,
		avg_inference_time: elapsed.div_f64(num_batches as f64),
		num_batches,
	})
}

/// Average loss and end-point error over a validation pass. Targets are
/// divided by `target_scale_factor` as during training.
pub fn validate_model(
	model: &mut dyn FlowModel,
	criterion: &dyn Criterion,
	loader: &mut DataLoader,
	target_scale_factor: f32,
	iteration: usize,
) -> Result<(f32, f32)> {
	model.set_training(false);
	let result = (|| {
		let mut loss_meter = AverageMeter::new();
		let mut metric_meter = AverageMeter::new();
		for batch in loader.batches()? {
			let batch = batch?;
			let target = batch.target(target_scale_factor)?;
			let output = model.forward(&batch.img1, &batch.img2)?;
			loss_meter.update(criterion.compute(&output, &target, iteration)?.value);
			metric_meter.update(average_epe(output.final_flow()?, &target.flow)?);
		}
		Ok((loss_meter.avg, metric_meter.avg))
	})();
	model.set_training(true);
	result
}
