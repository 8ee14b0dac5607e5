use ndarray::{Array4, Zip};

use super::{Layer, Module, Param};
use crate::error::{FlowError, Result};

/// ReLU when `negative_slope == 0`, leaky ReLU otherwise.
#[derive(Debug, Clone)]
pub struct Activation {
	negative_slope: f32,
	input: Option<Array4<f32>>,
}

impl Activation {
	pub fn relu() -> Self {
		Self::leaky(0.0)
	}

	pub fn leaky(negative_slope: f32) -> Self {
		Activation {
			negative_slope,
			input: None,
		}
	}

	pub fn negative_slope(&self) -> f32 {
		self.negative_slope
	}
}

impl Module for Activation {
	fn params(&self) -> Vec<&Param> {
		Vec::new()
	}

	fn params_mut(&mut self) -> Vec<&mut Param> {
		Vec::new()
	}
}

impl Layer for Activation {
	fn forward(&mut self, input: &Array4<f32>) -> Result<Array4<f32>> {
		let slope = self.negative_slope;
		let out = input.mapv(|v| if v > 0.0 { v } else { v * slope });
		self.input = Some(input.clone());
		Ok(out)
	}

	fn backward(&mut self, grad_output: &Array4<f32>) -> Result<Array4<f32>> {
		let input = self
			.input
			.take()
			.ok_or_else(|| FlowError::InvalidState("activation backward before forward".into()))?;
		if input.dim() != grad_output.dim() {
			return Err(FlowError::shape_mismatch(input.dim(), grad_output.dim()));
		}
		let slope = self.negative_slope;
		let mut grad = grad_output.clone();
		Zip::from(&mut grad).and(&input).for_each(|g, &x| {
			if x <= 0.0 {
				*g *= slope;
			}
		});
		Ok(grad)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn leaky_scales_negative_side() {
		let mut act = Activation::leaky(0.1);
		let x = Array4::from_shape_vec((1, 1, 1, 2), vec![-2.0, 3.0]).unwrap();
		let y = act.forward(&x).unwrap();
		assert!((y[[0, 0, 0, 0]] + 0.2).abs() < 1e-6);
		assert_eq!(y[[0, 0, 0, 1]], 3.0);

		let g = act.backward(&Array4::ones((1, 1, 1, 2))).unwrap();
		assert!((g[[0, 0, 0, 0]] - 0.1).abs() < 1e-6);
		assert_eq!(g[[0, 0, 0, 1]], 1.0);
	}
}
