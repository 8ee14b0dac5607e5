
use std::sync::Arc;

use ndarray::{Array2, Array3};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

use flowforge::data::dataset::SyntheticShiftArgs;
use flowforge::data::{ConcatDataset, Dataset, InMemoryDataset, SharedDataset, WorkerRng};
use flowforge::functional::augment::FlowFrame;
use flowforge::functional::{AugmentationParams, FlowAugmentor};
use test_helpers::assert_ok;

fn frame(h: usize, w: usize, with_valid: bool, seed: u64) -> FlowFrame {
    let s = seed as f32;
    FlowFrame {
        img1: Array3::from_shape_fn((3, h, w), |(c, y, x)| ((c * 31 + y * 7 + x) as f32 + s) % 255.0),
        img2: Array3::from_shape_fn((3, h, w), |(c, y, x)| ((c * 17 + y * 3 + x * 5) as f32 + s) % 255.0),
        flow: Array3::from_shape_fn((2, h, w), |(c, y, x)| (c as f32 - 0.5) * (y + x) as f32 * 0.25),
        valid: with_valid.then(|| Array2::from_shape_fn((h, w), |(y, x)| ((y + x) % 2) as f32)),
    }
}

fn synthetic(len: usize, seed: u64) -> SharedDataset {
    Arc::new(assert_ok(
        InMemoryDataset::synthetic_shift(&SyntheticShiftArgs {
            len,
            height: 8,
            width: 8,
            seed,
            ..Default::default()
        }),
        "synthetic dataset",
    ))
}

proptest! {
    #[test]
    fn disabled_augmentation_is_the_identity(
        h in 8usize..24,
        w in 8usize..24,
        sparse in any::<bool>(),
        with_valid in any::<bool>(),
        seed in any::<u64>(),
    ) {
        let input = frame(h, w, with_valid, seed % 97);
        let augmentor = FlowAugmentor::new(AugmentationParams::disabled(), sparse);
        let output = augmentor.apply(input.clone(), &mut StdRng::seed_from_u64(seed)).unwrap();
        prop_assert_eq!(output, input);
    }

    #[test]
    fn concat_preserves_length_and_order(lens in prop::collection::vec(1usize..6, 1..5)) {
        let parts: Vec<SharedDataset> = lens
            .iter()
            .enumerate()
            .map(|(i, &len)| synthetic(len, i as u64))
            .collect();
        let concat = ConcatDataset::new(parts.clone());
        prop_assert_eq!(concat.len(), lens.iter().sum::<usize>());

        let mut rng = WorkerRng::new(0, 0);
        let mut index = 0;
        for part in &parts {
            for local in 0..part.len() {
                let expected = part.get(local, &mut rng).unwrap();
                prop_assert_eq!(concat.get(index, &mut rng).unwrap(), expected.clone());
                prop_assert_eq!(concat.get(index + concat.len(), &mut rng).unwrap(), expected);
                index += 1;
            }
        }
    }
}

#[test]
fn adding_a_dataset_appends_it() {
    let a = assert_ok(
        InMemoryDataset::synthetic_shift(&SyntheticShiftArgs { len: 2, seed: 1, ..Default::default() }),
        "a",
    );
    let b = assert_ok(
        InMemoryDataset::synthetic_shift(&SyntheticShiftArgs { len: 3, seed: 2, ..Default::default() }),
        "b",
    );
    let first_of_b = b.samples()[0].clone();
    let first: SharedDataset = Arc::new(a);
    let concat = ConcatDataset::new(vec![first]) + b;
    assert_eq!(concat.len(), 5);
    assert_eq!(concat.parts().len(), 2);
    assert_eq!(assert_ok(concat.get(2, &mut WorkerRng::new(0, 0)), "get"), first_of_b);
}
