use coupled_util::candle_data_loader::{
    generate_train_instances, validate_attributes, InMemoryInstances, InstanceLoader, RatingTable,
};

use candle_core::Device;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn attrs(rows: usize, cols: usize) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |(i, j)| (i * cols + j) as f32 * 0.1)
}

#[test]
fn one_positive_yields_one_plus_n_instances() -> anyhow::Result<()> {
    let mut table = RatingTable::new(3, 4);
    table.insert(0, 1)?;

    let users = attrs(3, 5);
    let items = attrs(4, 2);
    let mut rng = StdRng::seed_from_u64(42);

    let inst = generate_train_instances(&table, &users, &items, 2, 100, &mut rng)?;

    assert_eq!(inst.len(), 3);
    assert_eq!(inst.num_positives(), 1);

    let positives: Vec<usize> = (0..inst.len()).filter(|&i| inst.label(i) > 0.5).collect();
    assert_eq!(positives.len(), 1);
    assert_eq!(inst.pair(positives[0]), (0, 1));
    Ok(())
}

#[test]
fn instance_counts_scale_with_positives_and_negatives() -> anyhow::Result<()> {
    let num_negatives = 4;
    let mut table = RatingTable::new(10, 50);
    for u in 0..10u32 {
        table.insert(u, u)?;
        table.insert(u, u + 20)?;
    }
    let p = table.len();

    let users = attrs(10, 6);
    let items = attrs(50, 3);
    let mut rng = StdRng::seed_from_u64(1);

    let inst = generate_train_instances(&table, &users, &items, num_negatives, 100, &mut rng)?;

    assert_eq!(inst.len(), p * (num_negatives + 1));
    assert_eq!(inst.num_positives(), p);
    Ok(())
}

#[test]
fn sampled_negatives_never_overlap_observed() -> anyhow::Result<()> {
    let mut table = RatingTable::new(5, 8);
    for u in 0..5u32 {
        for i in 0..4u32 {
            table.insert(u, i)?;
        }
    }

    let users = attrs(5, 4);
    let items = attrs(8, 2);
    let mut rng = StdRng::seed_from_u64(7);

    let inst = generate_train_instances(&table, &users, &items, 3, 100, &mut rng)?;

    for idx in 0..inst.len() {
        let (u, i) = inst.pair(idx);
        if inst.label(idx) < 0.5 {
            assert!(
                !table.contains(u, i),
                "sampled negative ({}, {}) is an observed positive",
                u,
                i
            );
        } else {
            assert!(table.contains(u, i));
        }
    }
    Ok(())
}

#[test]
fn saturated_user_skips_exhausted_slots() -> anyhow::Result<()> {
    // user 0 has rated every item, so no valid negative exists
    let mut table = RatingTable::new(1, 4);
    for i in 0..4u32 {
        table.insert(0, i)?;
    }

    let users = attrs(1, 3);
    let items = attrs(4, 2);
    let mut rng = StdRng::seed_from_u64(3);

    let inst = generate_train_instances(&table, &users, &items, 2, 50, &mut rng)?;

    // all negative slots skipped, positives intact
    assert_eq!(inst.len(), 4);
    assert_eq!(inst.num_positives(), 4);
    Ok(())
}

#[test]
fn out_of_range_ids_are_rejected() {
    let mut table = RatingTable::new(3, 4);
    assert!(table.insert(3, 0).is_err());
    assert!(table.insert(0, 4).is_err());
    assert!(table.insert(2, 3).is_ok());
}

#[test]
fn mismatched_attribute_rows_are_rejected() {
    let table = RatingTable::new(3, 4);
    let users = attrs(2, 5); // 2 rows, 3 declared users
    let items = attrs(4, 2);
    assert!(validate_attributes(&table, &users, &items).is_err());

    let users = attrs(3, 5);
    let items = attrs(5, 2); // 5 rows, 4 declared items
    assert!(validate_attributes(&table, &users, &items).is_err());
}

#[test]
fn minibatches_cover_every_instance_once() -> anyhow::Result<()> {
    let mut table = RatingTable::new(4, 10);
    for u in 0..4u32 {
        table.insert(u, u)?;
    }

    let users = attrs(4, 3);
    let items = attrs(10, 2);
    let mut rng = StdRng::seed_from_u64(11);

    let inst = generate_train_instances(&table, &users, &items, 2, 100, &mut rng)?;
    let total = inst.len();

    let mut loader = InMemoryInstances::new(inst);
    loader.shuffle_minibatch(5, &mut rng)?;

    // 12 instances in chunks of 5 -> 3 minibatches (5, 5, 2)
    assert_eq!(loader.num_minibatch(), total.div_ceil(5));

    let mut seen = 0;
    for b in 0..loader.num_minibatch() {
        let mb = loader.minibatch_shuffled(b, &Device::Cpu)?;
        let labels = mb.labels.to_vec1::<f32>()?;
        let user_attr_dims = mb.user_attr.dims2()?;
        assert_eq!(user_attr_dims.1, 3);
        assert_eq!(user_attr_dims.0, labels.len());
        seen += labels.len();
    }
    assert_eq!(seen, total);
    Ok(())
}
