mod fit_coupled;
mod rec_input;

use clap::{Parser, Subcommand};
use fit_coupled::*;
use log::info;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "REEL",
    long_about = "Coupled attribute-identity collaborative filtering.\n\
		  Trains a model that fuses learned identity embeddings with\n\
		  explicit user/item attribute interactions, and ranks held-out\n\
		  items against pre-sampled negatives."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Train a coupled recommendation model",
        long_about = "Train one of the coupled architectures in three repeated stages:\n\
		      (1) Regenerate training instances with fresh sampled negatives\n\
		      (2) Fit one shuffled pass with binary cross-entropy\n\
		      (3) Rank held-out items and checkpoint on improved hit ratio.\n"
    )]
    Train(TrainArgs),

    #[command(
        about = "Rank held-out items with a saved checkpoint",
        long_about = "Load a parameter snapshot and report hit-ratio and NDCG\n\
		      over the test users' candidate sets, without training."
    )]
    Evaluate(EvalArgs),
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Train(args) => {
            fit_coupled(args)?;
        }
        Commands::Evaluate(args) => {
            evaluate_coupled(args)?;
        }
    }

    info!("Done");
    Ok(())
}
