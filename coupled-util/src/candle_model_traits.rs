use candle_core::{Result, Tensor};

/// One minibatch of scoring inputs, all on the same device.
///
/// * `user_attr` - user attribute rows (n x a), f32
/// * `item_attr` - item attribute rows (n x b), f32
/// * `user_id` - user indices (n), u32
/// * `item_id` - item indices (n), u32
pub struct ScoreInputs<'a> {
    pub user_attr: &'a Tensor,
    pub item_attr: &'a Tensor,
    pub user_id: &'a Tensor,
    pub item_id: &'a Tensor,
}

/// A model that scores (user, item) pairs as interaction probabilities.
pub trait ScoringModuleT {
    /// Score a minibatch of (user, item) pairs.
    ///
    /// # Arguments
    /// * `inputs` - attribute vectors and identity indices
    /// * `train` - whether to use batchnorm in training mode
    ///
    /// # Returns `p_n`
    /// * `p_n` - interaction probabilities (n), each in (0, 1)
    fn forward_t(&self, inputs: &ScoreInputs, train: bool) -> Result<Tensor>;

    fn num_users(&self) -> usize;

    fn num_items(&self) -> usize;
}
