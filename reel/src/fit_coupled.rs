use crate::rec_input::*;

use anyhow::Context;
use clap::{Args, ValueEnum};
use log::info;

use coupled_util::candle_core;
use coupled_util::candle_nn;

use coupled_util::candle_coupled_model::{CoupledCf, CoupledCfConfig, CouplingMode};
use coupled_util::candle_eval::evaluate_ranking;
use coupled_util::candle_inference::TrainConfig;
use coupled_util::candle_trainer::{
    CheckpointReport, CheckpointSink, CoupledTrainer, TrainData,
};

use std::fs;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

#[derive(Args, Debug)]
pub struct DataArgs {
    #[arg(
        long,
        short = 'u',
        required = true,
        help = "User attribute file",
        long_help = "User attribute file (`UserID::Gender::Age::Occupation::Zip`).\n\
		     Encoded to one-hot gender, age bucket, and occupation."
    )]
    pub user_file: Box<str>,

    #[arg(
        long,
        short = 'm',
        required = true,
        help = "Item genre file",
        long_help = "Item genre file (`MovieID::Title::Genre|Genre|...`).\n\
		     Encoded to genre one-hot vectors."
    )]
    pub item_file: Box<str>,

    #[arg(
        long,
        short = 'r',
        required = true,
        help = "Test rating file",
        long_help = "Held-out test interactions, one `user item ...` pair\n\
		     per test user."
    )]
    pub test_rating_file: Box<str>,

    #[arg(
        long,
        short = 'n',
        required = true,
        help = "Test negative file",
        long_help = "Pre-sampled negative candidates, one line per test\n\
		     pair: `(u,i) neg1 neg2 ...`. Static across epochs."
    )]
    pub test_negative_file: Box<str>,
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    #[command(flatten)]
    pub data: DataArgs,

    #[arg(
        long,
        short = 't',
        required = true,
        help = "Training rating file",
        long_help = "Observed training interactions\n\
		     (`user item rating timestamp`, whitespace separated).\n\
		     Ratings above zero count as positives."
    )]
    pub train_rating_file: Box<str>,

    #[arg(
        long,
        short,
        required = true,
        help = "Output header",
        long_help = "Output header for generated files:\n\
		     - {out}.model.txt (topology description)\n\
		     - {out}_{arch}_neg{n}_hr{...}_ndcg{...}.safetensors (checkpoints)"
    )]
    pub out: Box<str>,

    #[arg(
        long,
        short = 'a',
        default_value = "local",
        help = "Coupling architecture",
        long_help = "Coupling architecture for the attribute interaction map.\n\
		     Options: local, global, combined."
    )]
    pub coupling: Box<str>,

    #[arg(
        long,
        default_value_t = 1e-3,
        help = "Learning rate",
        long_help = "Learning rate for optimization.\n\
		     Controls the step size for parameter updates."
    )]
    pub learning_rate: f32,

    #[arg(
        long,
        short = 'i',
        default_value_t = 30,
        help = "Number of training epochs",
        long_help = "Number of training epochs.\n\
		     Each epoch regenerates its negative instances."
    )]
    pub epochs: usize,

    #[arg(
        long,
        default_value_t = 256,
        help = "Minibatch size",
        long_help = "Minibatch size for training.\n\
		     Controls the number of instances per gradient step."
    )]
    pub batch_size: usize,

    #[arg(
        long,
        default_value_t = 4,
        help = "Negatives per positive",
        long_help = "Sampled negatives per observed positive, per epoch."
    )]
    pub num_negatives: usize,

    #[arg(
        long,
        default_value_t = 100,
        help = "Negative sampling attempt bound",
        long_help = "Rejection-sampling attempts per negative slot before\n\
		     the slot is skipped with a warning."
    )]
    pub max_sampling_attempts: usize,

    #[arg(
        long,
        short = 'k',
        default_value_t = 10,
        help = "Ranking cutoff",
        long_help = "Top-k cutoff for hit-ratio and NDCG."
    )]
    pub top_k: usize,

    #[arg(
        long,
        default_value_t = 1,
        help = "Evaluation cadence",
        long_help = "Evaluate every this many epochs."
    )]
    pub eval_every: usize,

    #[arg(
        long,
        default_value_t = num_cpus::get(),
        help = "Evaluation threads",
        long_help = "Worker threads for per-user evaluation."
    )]
    pub eval_threads: usize,

    #[arg(
        long,
        default_value_t = 0.6,
        help = "Checkpoint hit-ratio floor",
        long_help = "Checkpoints are only written when the epoch's hit ratio\n\
		     beats the best so far and exceeds this floor."
    )]
    pub hit_rate_floor: f32,

    #[arg(
        long,
        help = "Random seed",
        long_help = "Fixed seed for negative sampling and shuffling.\n\
		     Fresh entropy when not given."
    )]
    pub seed: Option<u64>,

    #[arg(
        long,
        value_enum,
        default_value = "cpu",
        help = "Candle device",
        long_help = "Candle device to use for computation.\n\
		     Options: cpu, cuda, metal."
    )]
    device: ComputeDevice,

    #[arg(
        long,
        default_value_t = 0,
        help = "A device for cuda",
        long_help = "For cuda or metal, we may want to choose a different device."
    )]
    device_no: usize,

    #[arg(
        long,
        short,
        help = "Verbosity",
        long_help = "Log per-epoch loss and ranking metrics."
    )]
    pub verbose: bool,
}

#[derive(Args, Debug)]
pub struct EvalArgs {
    #[command(flatten)]
    pub data: DataArgs,

    #[arg(
        long,
        short,
        required = true,
        help = "Checkpoint file",
        long_help = "Parameter snapshot (`.safetensors`) written during training."
    )]
    pub checkpoint: Box<str>,

    #[arg(
        long,
        short = 'a',
        default_value = "local",
        help = "Coupling architecture",
        long_help = "Coupling architecture the checkpoint was trained with.\n\
		     Options: local, global, combined."
    )]
    pub coupling: Box<str>,

    #[arg(long, short = 'k', default_value_t = 10, help = "Ranking cutoff")]
    pub top_k: usize,

    #[arg(
        long,
        default_value_t = num_cpus::get(),
        help = "Evaluation threads"
    )]
    pub eval_threads: usize,

    #[arg(long, value_enum, default_value = "cpu", help = "Candle device")]
    device: ComputeDevice,

    #[arg(long, default_value_t = 0, help = "A device for cuda")]
    device_no: usize,
}

/// Tagged safetensors snapshots under a common output header.
pub struct FileCheckpointSink {
    prefix: String,
    variant: &'static str,
}

impl FileCheckpointSink {
    pub fn new(prefix: &str, variant: &'static str) -> Self {
        Self {
            prefix: prefix.to_string(),
            variant,
        }
    }
}

impl CheckpointSink for FileCheckpointSink {
    fn persist(&mut self, vars: &candle_nn::VarMap, report: &CheckpointReport) -> anyhow::Result<()> {
        let path = format!(
            "{}_{}_neg{}_hr{:.4}_ndcg{:.4}.safetensors",
            self.prefix, self.variant, report.num_negatives, report.hit_rate, report.ndcg
        );
        vars.save(&path)
            .with_context(|| format!("failed to write checkpoint `{}`", path))?;
        info!("[{}] checkpoint: {}", report.epoch + 1, path);
        Ok(())
    }
}

fn select_device(device: &ComputeDevice, device_no: usize) -> anyhow::Result<candle_core::Device> {
    Ok(match device {
        ComputeDevice::Metal => candle_core::Device::new_metal(device_no)?,
        ComputeDevice::Cuda => candle_core::Device::new_cuda(device_no)?,
        _ => candle_core::Device::Cpu,
    })
}

struct LoadedData {
    num_users: usize,
    num_items: usize,
    users_attr: ndarray::Array2<f32>,
    items_attr: ndarray::Array2<f32>,
    test_cases: Vec<coupled_util::candle_eval::TestCase>,
}

fn load_common(data: &DataArgs) -> anyhow::Result<LoadedData> {
    let (num_users, users_attr) = load_user_attributes(&data.user_file)?;
    let (num_items, items_attr) = load_item_genres(&data.item_file)?;
    let test_cases = load_test_cases(&data.test_rating_file, &data.test_negative_file)?;

    info!(
        "{} users ({} attrs), {} items ({} genres), {} test users",
        num_users,
        users_attr.ncols(),
        num_items,
        items_attr.ncols(),
        test_cases.len()
    );

    Ok(LoadedData {
        num_users,
        num_items,
        users_attr,
        items_attr,
        test_cases,
    })
}

pub fn fit_coupled(args: &TrainArgs) -> anyhow::Result<()> {
    // reject an unknown architecture before touching any data
    let mode: CouplingMode = args.coupling.parse()?;

    let loaded = load_common(&args.data)?;
    let table = load_rating_table(&args.train_rating_file, loaded.num_users, loaded.num_items)?;
    anyhow::ensure!(
        !table.is_empty(),
        "no observed interactions in `{}`",
        args.train_rating_file
    );
    info!("{} observed interactions", table.len());

    let dev = select_device(&args.device, args.device_no)?;

    let model_config = CoupledCfConfig::new(
        loaded.num_users,
        loaded.num_items,
        loaded.users_attr.ncols(),
        loaded.items_attr.ncols(),
        mode,
    );
    model_config.validate()?;

    let parameters = candle_nn::VarMap::new();
    let param_builder =
        candle_nn::VarBuilder::from_varmap(&parameters, candle_core::DType::F32, &dev);
    let model = CoupledCf::new(model_config, param_builder)?;

    let topology = model.summary();
    info!("{}", topology.trim_end());
    let topology_file = format!("{}.model.txt", args.out);
    fs::write(&topology_file, &topology)
        .with_context(|| format!("failed to write `{}`", topology_file))?;

    let train_config = TrainConfig {
        learning_rate: args.learning_rate,
        batch_size: args.batch_size,
        num_epochs: args.epochs,
        num_negatives: args.num_negatives,
        max_sampling_attempts: args.max_sampling_attempts,
        top_k: args.top_k,
        eval_every: args.eval_every,
        eval_threads: args.eval_threads,
        hit_rate_floor: args.hit_rate_floor,
        seed: args.seed,
        device: dev,
        verbose: args.verbose,
        show_progress: !args.verbose,
    };

    let mut sink = FileCheckpointSink::new(&args.out, mode.name());
    let mut trainer = CoupledTrainer::new(&model, &parameters);
    let summary = trainer.train(
        &TrainData {
            table: &table,
            users_attr: &loaded.users_attr,
            items_attr: &loaded.items_attr,
            test_cases: &loaded.test_cases,
        },
        &mut sink,
        &train_config,
    )?;

    info!(
        "End. best HR@{} = {:.4}, best NDCG@{} = {:.4}",
        args.top_k, summary.best.hit_rate, args.top_k, summary.best.ndcg
    );
    Ok(())
}

pub fn evaluate_coupled(args: &EvalArgs) -> anyhow::Result<()> {
    let mode: CouplingMode = args.coupling.parse()?;

    let loaded = load_common(&args.data)?;
    let dev = select_device(&args.device, args.device_no)?;

    let model_config = CoupledCfConfig::new(
        loaded.num_users,
        loaded.num_items,
        loaded.users_attr.ncols(),
        loaded.items_attr.ncols(),
        mode,
    );
    model_config.validate()?;

    let mut parameters = candle_nn::VarMap::new();
    let param_builder =
        candle_nn::VarBuilder::from_varmap(&parameters, candle_core::DType::F32, &dev);
    let model = CoupledCf::new(model_config, param_builder)?;

    parameters
        .load(args.checkpoint.as_ref())
        .with_context(|| format!("failed to load checkpoint `{}`", args.checkpoint))?;

    let eval_config = TrainConfig {
        learning_rate: 1e-3,
        batch_size: 1,
        num_epochs: 1,
        num_negatives: 0,
        max_sampling_attempts: 1,
        top_k: args.top_k,
        eval_every: 1,
        eval_threads: args.eval_threads,
        hit_rate_floor: 0.0,
        seed: None,
        device: dev,
        verbose: false,
        show_progress: false,
    };

    let metrics = evaluate_ranking(
        &model,
        &loaded.users_attr,
        &loaded.items_attr,
        &loaded.test_cases,
        &eval_config,
    )?;

    info!(
        "HR@{} = {:.4}, NDCG@{} = {:.4}",
        args.top_k, metrics.hit_rate, args.top_k, metrics.ndcg
    );
    println!(
        "HR@{} = {:.4}, NDCG@{} = {:.4}",
        args.top_k, metrics.hit_rate, args.top_k, metrics.ndcg
    );
    Ok(())
}
