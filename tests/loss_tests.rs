
use ndarray::{s, Array3, Array4};
use proptest::prelude::*;

use flowforge::functional::{
    Criterion, FlowTarget, OffsetCrossEntropyLoss, OffsetCrossEntropyLossArgs, SequenceLoss, SequenceLossArgs,
};
use flowforge::models::FlowOutput;
use flowforge::registry::Registries;
use test_helpers::assert_ok;

fn output(flow_preds: Vec<Array4<f32>>, flow_logits: Option<Vec<Array4<f32>>>) -> FlowOutput {
    FlowOutput {
        flow_preds,
        flow_logits,
        flow_upsampled: None,
    }
}

fn sequence_loss(error: f32) -> f32 {
    let criterion = assert_ok(SequenceLoss::new(SequenceLossArgs::default()), "criterion");
    let target = FlowTarget::new(Array4::zeros((1, 2, 4, 4)), Some(Array3::ones((1, 4, 4))));
    let mut pred = Array4::<f32>::zeros((1, 2, 4, 4));
    pred.slice_mut(s![.., 0, .., ..]).fill(error);
    let coarse = Array4::<f32>::from_elem((1, 2, 2, 2), error * 0.5);
    assert_ok(criterion.compute(&output(vec![coarse, pred], None), &target, 0), "loss").value
}

proptest! {
    #[test]
    fn sequence_loss_grows_with_the_error(error in 0.0f32..50.0, extra in 0.01f32..50.0) {
        let low = sequence_loss(error);
        let high = sequence_loss(error + extra);
        prop_assert!(low >= 0.0);
        prop_assert!(high > low, "{} !> {}", high, low);
    }
}

#[test]
fn offset_cross_entropy_ignores_invalid_pixels() {
    let registries = Registries::with_defaults();
    let criterion = assert_ok(
        OffsetCrossEntropyLoss::new(
            OffsetCrossEntropyLossArgs {
                offset_loss_weight: vec![1.0],
                ..Default::default()
            },
            &registries,
        ),
        "criterion",
    );

    // 3x3 displacement grid at stride 2 over a 4x4 target
    let logits = Array4::from_shape_fn((1, 9, 2, 2), |(_, k, y, x)| ((k * 3 + y + x) % 5) as f32 * 0.3);
    let mut valid = Array3::<f32>::ones((1, 4, 4));
    valid[[0, 0, 0]] = 0.0;
    valid[[0, 2, 2]] = 0.4;
    let target = FlowTarget::new(Array4::zeros((1, 2, 4, 4)), Some(valid));

    let out = output(vec![Array4::zeros((1, 2, 2, 2))], Some(vec![logits]));
    let loss = assert_ok(criterion.compute(&out, &target, 0), "loss");
    let grad = &loss.grads.flow_logits.as_ref().unwrap()[0];

    assert!(grad.slice(s![0, .., 0, 0]).iter().all(|&g| g == 0.0));
    assert!(grad.slice(s![0, .., 1, 1]).iter().all(|&g| g == 0.0));
    assert!(grad.slice(s![0, .., 0, 1]).iter().any(|&g| g != 0.0));
    assert!(loss.value > 0.0);
    assert!(loss.grads.flow_preds[0].iter().all(|&g| g == 0.0));
}
