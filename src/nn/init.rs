use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// Kaiming normal initialisation in fan-out mode.
///
/// `shape` is `[out_channels, in_channels, kh, kw]`; the standard deviation is
/// `gain / sqrt(out_channels * kh * kw)` with the leaky-ReLU gain
/// `sqrt(2 / (1 + negative_slope^2))`.
pub fn kaiming_normal_fan_out<R: Rng + ?Sized>(shape: &[usize], negative_slope: f32, rng: &mut R) -> ArrayD<f32> {
	let fan_out: usize = shape[0] * shape[2..].iter().product::<usize>();
	let gain = (2.0 / (1.0 + negative_slope * negative_slope)).sqrt();
	let std = gain / (fan_out.max(1) as f32).sqrt();
	ArrayD::from_shape_simple_fn(IxDyn(shape), || {
		let z: f32 = StandardNormal.sample(rng);
		z * std
	})
}

pub fn constant(shape: &[usize], value: f32) -> ArrayD<f32> {
	ArrayD::from_elem(IxDyn(shape), value)
}

#[cfg(test)]
mod tests {
	use super::*;
	use rand::rngs::StdRng;
	use rand::SeedableRng;

	#[test]
	fn kaiming_std_follows_fan_out() {
		let mut rng = StdRng::seed_from_u64(7);
		let w = kaiming_normal_fan_out(&[64, 8, 3, 3], 0.0, &mut rng);
		let n = w.len() as f32;
		let mean = w.sum() / n;
		let var = w.mapv(|v| (v - mean) * (v - mean)).sum() / n;
		let expected = 2.0 / (64.0 * 9.0);
		assert!(mean.abs() < 0.01);
		assert!((var - expected).abs() / expected < 0.1);
	}

	#[test]
	fn same_seed_same_weights() {
		let a = kaiming_normal_fan_out(&[4, 2, 3, 3], 0.1, &mut StdRng::seed_from_u64(1));
		let b = kaiming_normal_fan_out(&[4, 2, 3, 3], 0.1, &mut StdRng::seed_from_u64(1));
		assert_eq!(a, b);
	}
}
