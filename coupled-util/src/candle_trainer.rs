use crate::candle_data_loader::{
    generate_train_instances, validate_attributes, InMemoryInstances, InstanceLoader, RatingTable,
};
use crate::candle_eval::{evaluate_ranking, RankingMetrics, TestCase};
use crate::candle_inference::TrainConfig;
use crate::candle_loss_functions::binary_cross_entropy;
use crate::candle_model_traits::{ScoreInputs, ScoringModuleT};

use candle_nn::{AdamW, Optimizer, VarMap};
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Instant;

/// Best metrics seen so far, threaded through the epoch loop as explicit
/// state.
#[derive(Clone, Copy, Debug, Default)]
pub struct BestMetrics {
    pub hit_rate: f32,
    pub ndcg: f32,
}

impl BestMetrics {
    /// Fold one epoch's metrics in. Returns whether this epoch should be
    /// checkpointed: the hit ratio must beat the best seen so far and
    /// clear the absolute floor. Best NDCG is tracked independently and
    /// never triggers a save on its own.
    pub fn update(&mut self, metrics: RankingMetrics, floor: f32) -> bool {
        let mut persist = false;
        if metrics.hit_rate > self.hit_rate {
            self.hit_rate = metrics.hit_rate;
            persist = metrics.hit_rate > floor;
        }
        if metrics.ndcg > self.ndcg {
            self.ndcg = metrics.ndcg;
        }
        persist
    }
}

/// Metrics attached to a persisted parameter snapshot.
pub struct CheckpointReport {
    pub epoch: usize,
    pub num_negatives: usize,
    pub hit_rate: f32,
    pub ndcg: f32,
}

/// Where qualifying parameter snapshots go.
pub trait CheckpointSink {
    fn persist(&mut self, vars: &VarMap, report: &CheckpointReport) -> anyhow::Result<()>;
}

/// Discards every snapshot; useful when only the metrics matter.
pub struct NullCheckpointSink;

impl CheckpointSink for NullCheckpointSink {
    fn persist(&mut self, _vars: &VarMap, _report: &CheckpointReport) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct TrainSummary {
    pub best: BestMetrics,
    pub loss_trace: Vec<f32>,
}

/// Everything the trainer reads: observed positives, attribute matrices,
/// and the static per-user evaluation candidates.
pub struct TrainData<'a> {
    pub table: &'a RatingTable,
    pub users_attr: &'a Array2<f32>,
    pub items_attr: &'a Array2<f32>,
    pub test_cases: &'a [TestCase],
}

/// Epoch-driving trainer for a coupled scoring model.
pub struct CoupledTrainer<'a, M>
where
    M: ScoringModuleT + Sync,
{
    pub model: &'a M,
    pub variable_map: &'a VarMap,
}

impl<'a, M> CoupledTrainer<'a, M>
where
    M: ScoringModuleT + Sync,
{
    pub fn new(model: &'a M, variable_map: &'a VarMap) -> Self {
        Self {
            model,
            variable_map,
        }
    }

    /// Run the full loop: per epoch, regenerate instances with fresh
    /// negatives, fit one shuffled pass, evaluate on cadence, and push
    /// qualifying snapshots into `sink`.
    pub fn train(
        &mut self,
        data: &TrainData,
        sink: &mut dyn CheckpointSink,
        config: &TrainConfig,
    ) -> anyhow::Result<TrainSummary> {
        config.validate()?;
        validate_attributes(data.table, data.users_attr, data.items_attr)?;
        anyhow::ensure!(
            !data.table.is_empty(),
            "no observed interactions to train on"
        );
        anyhow::ensure!(!data.test_cases.is_empty(), "no test users to evaluate");

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let mut adam = AdamW::new_lr(
            self.variable_map.all_vars(),
            config.learning_rate.into(),
        )?;

        let pb = ProgressBar::new(config.num_epochs as u64);
        if !config.show_progress || config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let mut best = BestMetrics::default();
        let mut loss_trace = Vec::with_capacity(config.num_epochs);

        for epoch in 0..config.num_epochs {
            let t_epoch = Instant::now();

            // fresh negatives every epoch; the instance buffers drop at the
            // end of this block, before evaluation allocates anything
            let epoch_loss = {
                let instances = generate_train_instances(
                    data.table,
                    data.users_attr,
                    data.items_attr,
                    config.num_negatives,
                    config.max_sampling_attempts,
                    &mut rng,
                )?;
                let mut loader = InMemoryInstances::new(instances);
                loader.shuffle_minibatch(config.batch_size, &mut rng)?;
                self.fit_one_pass(&loader, &mut adam, config)?
            };
            loss_trace.push(epoch_loss);
            let fit_secs = t_epoch.elapsed().as_secs_f32();

            if epoch % config.eval_every == 0 {
                let t_eval = Instant::now();
                let metrics = evaluate_ranking(
                    self.model,
                    data.users_attr,
                    data.items_attr,
                    data.test_cases,
                    config,
                )?;
                if config.verbose {
                    info!(
                        "[{}] loss: {:.4}, HR@{}: {:.4}, NDCG@{}: {:.4} [fit {:.1}s, eval {:.1}s]",
                        epoch + 1,
                        epoch_loss,
                        config.top_k,
                        metrics.hit_rate,
                        config.top_k,
                        metrics.ndcg,
                        fit_secs,
                        t_eval.elapsed().as_secs_f32()
                    );
                }
                if best.update(metrics, config.hit_rate_floor) {
                    sink.persist(
                        self.variable_map,
                        &CheckpointReport {
                            epoch,
                            num_negatives: config.num_negatives,
                            hit_rate: metrics.hit_rate,
                            ndcg: metrics.ndcg,
                        },
                    )?;
                }
            } else if config.verbose {
                info!("[{}] loss: {:.4} [fit {:.1}s]", epoch + 1, epoch_loss, fit_secs);
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        info!(
            "best HR@{}: {:.4}, best NDCG@{}: {:.4}",
            config.top_k, best.hit_rate, config.top_k, best.ndcg
        );

        Ok(TrainSummary { best, loss_trace })
    }

    /// One gradient pass over the epoch's shuffled instance set; returns
    /// the mean minibatch loss.
    fn fit_one_pass<L>(
        &self,
        loader: &L,
        adam: &mut AdamW,
        config: &TrainConfig,
    ) -> anyhow::Result<f32>
    where
        L: InstanceLoader,
    {
        let device = &config.device;
        let mut loss_tot = 0f32;
        let num_minibatch = loader.num_minibatch();

        for b in 0..num_minibatch {
            let mb = loader.minibatch_shuffled(b, device)?;
            let scores = self.model.forward_t(
                &ScoreInputs {
                    user_attr: &mb.user_attr,
                    item_attr: &mb.item_attr,
                    user_id: &mb.user_id,
                    item_id: &mb.item_id,
                },
                true,
            )?;
            let loss = binary_cross_entropy(&scores, &mb.labels)?;
            adam.backward_step(&loss)?;
            loss_tot += loss.to_scalar::<f32>()?;
        }

        Ok(loss_tot / num_minibatch.max(1) as f32)
    }
}
