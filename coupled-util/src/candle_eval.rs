use crate::candle_inference::TrainConfig;
use crate::candle_model_traits::{ScoreInputs, ScoringModuleT};

use candle_core::Tensor;
use ndarray::Array2;
use rayon::prelude::*;

/// One test user: a single held-out positive item plus that user's fixed,
/// pre-sampled negative candidates.
pub struct TestCase {
    pub user: u32,
    pub positive: u32,
    pub negatives: Vec<u32>,
}

#[derive(Clone, Copy, Debug)]
pub struct RankingMetrics {
    pub hit_rate: f32,
    pub ndcg: f32,
}

/// Discounted gain of a hit at 0-indexed `rank`: 1 / log2(rank + 2).
pub fn ndcg_at_rank(rank: usize) -> f32 {
    (2f32).ln() / ((rank + 2) as f32).ln()
}

/// 0-indexed rank of the held-out item among the candidates.
///
/// Negatives are presented before the held-out item, and equal scores
/// resolve by presentation order, so a negative outranks the positive iff
/// its score is greater than or equal to the positive's.
pub fn rank_of_positive(negative_scores: &[f32], positive_score: f32) -> usize {
    negative_scores
        .iter()
        .filter(|&&s| s >= positive_score)
        .count()
}

/// Score one user's candidate set and reduce it to (hit, ndcg) at `top_k`.
pub fn evaluate_one<M>(
    model: &M,
    users_attr: &Array2<f32>,
    items_attr: &Array2<f32>,
    case: &TestCase,
    config: &TrainConfig,
) -> anyhow::Result<(f32, f32)>
where
    M: ScoringModuleT,
{
    anyhow::ensure!(
        (case.user as usize) < model.num_users(),
        "test user id {} out of range (num_users = {})",
        case.user,
        model.num_users()
    );

    // candidates in presentation order: negatives first, held-out item last
    let mut candidates = case.negatives.clone();
    candidates.push(case.positive);
    for &item in candidates.iter() {
        anyhow::ensure!(
            (item as usize) < model.num_items(),
            "candidate item id {} out of range (num_items = {})",
            item,
            model.num_items()
        );
    }

    let m = candidates.len();
    let (a, b) = (users_attr.ncols(), items_attr.ncols());
    let device = &config.device;

    let user_row: Vec<f32> = users_attr.row(case.user as usize).iter().copied().collect();
    let mut user_attr = Vec::with_capacity(m * a);
    let mut item_attr = Vec::with_capacity(m * b);
    for &item in candidates.iter() {
        user_attr.extend_from_slice(&user_row);
        item_attr.extend(items_attr.row(item as usize).iter().copied());
    }
    let user_id = vec![case.user; m];

    let inputs_user_attr = Tensor::from_vec(user_attr, (m, a), device)?;
    let inputs_item_attr = Tensor::from_vec(item_attr, (m, b), device)?;
    let inputs_user_id = Tensor::from_vec(user_id, m, device)?;
    let inputs_item_id = Tensor::from_vec(candidates, m, device)?;

    let scores = model
        .forward_t(
            &ScoreInputs {
                user_attr: &inputs_user_attr,
                item_attr: &inputs_item_attr,
                user_id: &inputs_user_id,
                item_id: &inputs_item_id,
            },
            false,
        )?
        .to_vec1::<f32>()?;

    let positive_score = scores[m - 1];
    let rank = rank_of_positive(&scores[..m - 1], positive_score);

    if rank < config.top_k {
        Ok((1.0, ndcg_at_rank(rank)))
    } else {
        Ok((0.0, 0.0))
    }
}

/// Rank every test user's candidate set against the current parameter
/// snapshot and average hit-ratio and NDCG at `top_k`.
///
/// Per-user scoring is read-only with respect to the parameters, so the
/// cases fan out across `eval_threads` rayon workers (0 = one per core).
pub fn evaluate_ranking<M>(
    model: &M,
    users_attr: &Array2<f32>,
    items_attr: &Array2<f32>,
    cases: &[TestCase],
    config: &TrainConfig,
) -> anyhow::Result<RankingMetrics>
where
    M: ScoringModuleT + Sync,
{
    anyhow::ensure!(!cases.is_empty(), "no test users to evaluate");
    anyhow::ensure!(
        users_attr.nrows() == model.num_users(),
        "user attribute matrix has {} rows but the model declares {} users",
        users_attr.nrows(),
        model.num_users()
    );
    anyhow::ensure!(
        items_attr.nrows() == model.num_items(),
        "item attribute matrix has {} rows but the model declares {} items",
        items_attr.nrows(),
        model.num_items()
    );

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.eval_threads)
        .build()?;

    let per_user: Vec<(f32, f32)> = pool.install(|| {
        cases
            .par_iter()
            .map(|case| evaluate_one(model, users_attr, items_attr, case, config))
            .collect::<anyhow::Result<Vec<_>>>()
    })?;

    let n = per_user.len() as f32;
    let (hit_sum, ndcg_sum) = per_user
        .iter()
        .fold((0.0f32, 0.0f32), |(h, g), &(hit, ndcg)| (h + hit, g + ndcg));

    Ok(RankingMetrics {
        hit_rate: hit_sum / n,
        ndcg: ndcg_sum / n,
    })
}
