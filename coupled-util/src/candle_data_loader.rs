use candle_core::{Device, Tensor};
use log::warn;
use ndarray::Array2;
use rand::prelude::*;
use rand::rngs::StdRng;
use std::collections::HashSet;

/// Sparse set of observed (user, item) positive interactions.
pub struct RatingTable {
    num_users: usize,
    num_items: usize,
    observed: HashSet<(u32, u32)>,
}

impl RatingTable {
    pub fn new(num_users: usize, num_items: usize) -> Self {
        Self {
            num_users,
            num_items,
            observed: HashSet::new(),
        }
    }

    /// Record an observed interaction, rejecting out-of-range ids before
    /// they can ever reach an embedding lookup.
    pub fn insert(&mut self, user: u32, item: u32) -> anyhow::Result<()> {
        anyhow::ensure!(
            (user as usize) < self.num_users,
            "user id {} out of range (num_users = {})",
            user,
            self.num_users
        );
        anyhow::ensure!(
            (item as usize) < self.num_items,
            "item id {} out of range (num_items = {})",
            item,
            self.num_items
        );
        self.observed.insert((user, item));
        Ok(())
    }

    pub fn contains(&self, user: u32, item: u32) -> bool {
        self.observed.contains(&(user, item))
    }

    pub fn len(&self) -> usize {
        self.observed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observed.is_empty()
    }

    pub fn num_users(&self) -> usize {
        self.num_users
    }

    pub fn num_items(&self) -> usize {
        self.num_items
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u32, u32)> {
        self.observed.iter()
    }
}

/// Check the attribute matrices against the interaction table before any
/// instance generation or scoring touches them.
pub fn validate_attributes(
    table: &RatingTable,
    users_attr: &Array2<f32>,
    items_attr: &Array2<f32>,
) -> anyhow::Result<()> {
    anyhow::ensure!(
        users_attr.nrows() == table.num_users(),
        "user attribute matrix has {} rows but the table declares {} users",
        users_attr.nrows(),
        table.num_users()
    );
    anyhow::ensure!(
        items_attr.nrows() == table.num_items(),
        "item attribute matrix has {} rows but the table declares {} items",
        items_attr.nrows(),
        table.num_items()
    );
    anyhow::ensure!(
        users_attr.ncols() > 0 && items_attr.ncols() > 0,
        "attribute vectors must be non-empty"
    );
    Ok(())
}

/// One epoch's worth of labelled training instances, stored as flat
/// row-major buffers.
pub struct TrainInstances {
    user_attr: Vec<f32>,
    item_attr: Vec<f32>,
    user_id: Vec<u32>,
    item_id: Vec<u32>,
    labels: Vec<f32>,
    dim_user_attr: usize,
    dim_item_attr: usize,
}

impl TrainInstances {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_positives(&self) -> usize {
        self.labels.iter().filter(|&&y| y > 0.5).count()
    }

    pub fn label(&self, idx: usize) -> f32 {
        self.labels[idx]
    }

    pub fn pair(&self, idx: usize) -> (u32, u32) {
        (self.user_id[idx], self.item_id[idx])
    }
}

/// Generate one epoch of training instances: each observed positive plus
/// `num_negatives` freshly sampled unobserved (user, item) pairs.
///
/// A rejection draw is attempted at most `max_attempts` times per negative
/// slot; an exhausted slot is skipped with a warning so a near-saturated
/// user cannot stall the epoch.
pub fn generate_train_instances(
    table: &RatingTable,
    users_attr: &Array2<f32>,
    items_attr: &Array2<f32>,
    num_negatives: usize,
    max_attempts: usize,
    rng: &mut StdRng,
) -> anyhow::Result<TrainInstances> {
    validate_attributes(table, users_attr, items_attr)?;
    anyhow::ensure!(max_attempts > 0, "max_attempts must be positive");

    let dim_user_attr = users_attr.ncols();
    let dim_item_attr = items_attr.ncols();
    let capacity = table.len() * (num_negatives + 1);

    let mut out = TrainInstances {
        user_attr: Vec::with_capacity(capacity * dim_user_attr),
        item_attr: Vec::with_capacity(capacity * dim_item_attr),
        user_id: Vec::with_capacity(capacity),
        item_id: Vec::with_capacity(capacity),
        labels: Vec::with_capacity(capacity),
        dim_user_attr,
        dim_item_attr,
    };

    let num_items = table.num_items() as u32;
    let push = |user: u32, item: u32, label: f32, out: &mut TrainInstances| {
        out.user_attr
            .extend(users_attr.row(user as usize).iter().copied());
        out.item_attr
            .extend(items_attr.row(item as usize).iter().copied());
        out.user_id.push(user);
        out.item_id.push(item);
        out.labels.push(label);
    };

    let mut skipped = 0usize;
    for &(u, i) in table.iter() {
        push(u, i, 1.0, &mut out);

        for _ in 0..num_negatives {
            let mut found = None;
            for _ in 0..max_attempts {
                let j = rng.random_range(0..num_items);
                if !table.contains(u, j) {
                    found = Some(j);
                    break;
                }
            }
            match found {
                Some(j) => push(u, j, 0.0, &mut out),
                None => skipped += 1,
            }
        }
    }

    if skipped > 0 {
        warn!(
            "negative sampling exhausted after {} attempts; skipped {} slots",
            max_attempts, skipped
        );
    }

    Ok(out)
}

/// One minibatch of training instances, materialised on the target device.
pub struct RecMinibatch {
    pub user_attr: Tensor,
    pub item_attr: Tensor,
    pub user_id: Tensor,
    pub item_id: Tensor,
    pub labels: Tensor,
}

/// Minibatch access over one epoch's instance set.
pub trait InstanceLoader {
    fn minibatch_shuffled(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<RecMinibatch>;

    fn num_minibatch(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize, rng: &mut StdRng) -> anyhow::Result<()>;
}

/// In-memory loader over flat instance buffers; rows are re-chunked into
/// randomly ordered minibatches every epoch.
pub struct InMemoryInstances {
    instances: TrainInstances,
    samples: Vec<usize>,
    chunks: Vec<Vec<usize>>,
}

impl InMemoryInstances {
    pub fn new(instances: TrainInstances) -> Self {
        let samples = (0..instances.len()).collect();
        Self {
            instances,
            samples,
            chunks: vec![],
        }
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl InstanceLoader for InMemoryInstances {
    fn shuffle_minibatch(&mut self, batch_size: usize, rng: &mut StdRng) -> anyhow::Result<()> {
        anyhow::ensure!(batch_size > 0, "batch size must be positive");
        self.samples.shuffle(rng);
        self.chunks = self
            .samples
            .chunks(batch_size)
            .map(|chunk| chunk.to_vec())
            .collect();
        Ok(())
    }

    fn num_minibatch(&self) -> usize {
        self.chunks.len()
    }

    fn minibatch_shuffled(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<RecMinibatch> {
        let chunk = self
            .chunks
            .get(batch_idx)
            .ok_or_else(|| anyhow::anyhow!("minibatch index {} out of range", batch_idx))?;

        let n = chunk.len();
        let (a, b) = (self.instances.dim_user_attr, self.instances.dim_item_attr);

        let mut user_attr = Vec::with_capacity(n * a);
        let mut item_attr = Vec::with_capacity(n * b);
        let mut user_id = Vec::with_capacity(n);
        let mut item_id = Vec::with_capacity(n);
        let mut labels = Vec::with_capacity(n);

        for &row in chunk {
            user_attr.extend_from_slice(&self.instances.user_attr[row * a..(row + 1) * a]);
            item_attr.extend_from_slice(&self.instances.item_attr[row * b..(row + 1) * b]);
            user_id.push(self.instances.user_id[row]);
            item_id.push(self.instances.item_id[row]);
            labels.push(self.instances.labels[row]);
        }

        Ok(RecMinibatch {
            user_attr: Tensor::from_vec(user_attr, (n, a), target_device)?,
            item_attr: Tensor::from_vec(item_attr, (n, b), target_device)?,
            user_id: Tensor::from_vec(user_id, n, target_device)?,
            item_id: Tensor::from_vec(item_id, n, target_device)?,
            labels: Tensor::from_vec(labels, n, target_device)?,
        })
    }
}
