use candle_core::Device;

/// Knobs for the training / evaluation loop. All of these arrive from the
/// caller's configuration surface; nothing here is hardcoded downstream.
pub struct TrainConfig {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub num_epochs: usize,
    /// sampled negatives per observed positive, per epoch
    pub num_negatives: usize,
    /// rejection-sampling bound per negative slot
    pub max_sampling_attempts: usize,
    /// ranking cutoff for hit-ratio / NDCG
    pub top_k: usize,
    /// evaluate every this many epochs
    pub eval_every: usize,
    /// rayon workers for per-user evaluation
    pub eval_threads: usize,
    /// minimum hit ratio before any checkpoint is persisted
    pub hit_rate_floor: f32,
    /// fixed seed for sampling and shuffling; fresh entropy when absent
    pub seed: Option<u64>,
    pub device: Device,
    pub verbose: bool,
    pub show_progress: bool,
}

impl TrainConfig {
    /// Fail fast on malformed hyperparameters, before any data or
    /// parameters are touched.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.learning_rate.is_finite() && self.learning_rate > 0.0,
            "learning rate must be positive and finite"
        );
        anyhow::ensure!(self.batch_size > 0, "batch size must be positive");
        anyhow::ensure!(self.num_epochs > 0, "epoch count must be positive");
        anyhow::ensure!(
            self.max_sampling_attempts > 0,
            "max sampling attempts must be positive"
        );
        anyhow::ensure!(self.top_k > 0, "top-k cutoff must be positive");
        anyhow::ensure!(self.eval_every > 0, "evaluation cadence must be positive");
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.hit_rate_floor),
            "hit-ratio floor must lie in [0, 1]"
        );
        Ok(())
    }
}
