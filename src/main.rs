use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lmprep::cli;
use lmprep::data::{DEFAULT_SPLIT_SEED, DEFAULT_VALIDATION_FRACTION};

#[derive(Parser)]
#[command(name = "lmprep")]
#[command(about = "Load language models with quantization and LoRA, and prepare NER datasets", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Count the sentences in tagged files
    Count {
        /// Tagged files (token<TAB>tag per line)
        #[arg(short, long, num_args = 1.., required = true)]
        input: Vec<String>,
    },

    /// Split a tagged file into validation and test files
    Split {
        /// Input tagged file
        #[arg(short, long)]
        input: String,

        /// Output directory
        #[arg(short, long)]
        output_dir: String,

        /// Fraction of sentences sampled into validation
        #[arg(long, default_value_t = DEFAULT_VALIDATION_FRACTION)]
        val_fraction: f64,

        /// Sampling seed
        #[arg(long, default_value_t = DEFAULT_SPLIT_SEED)]
        seed: u64,

        /// Validation file name (without extension)
        #[arg(long, default_value = "val")]
        val_name: String,

        /// Test file name (without extension)
        #[arg(long, default_value = "test_new")]
        test_name: String,

        /// Also write JSONL exports
        #[arg(long)]
        jsonl: bool,
    },

    /// Load a model from JSON load options and print a summary
    Inspect {
        /// Load options file (JSON)
        #[arg(short, long)]
        config: String,

        /// Load for training or for inference
        #[arg(short, long, value_enum, default_value = "inference")]
        mode: cli::LoadMode,
    },

    /// List available compute devices
    Devices,
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lmprep=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Count { input } => {
            cli::count(input)?;
        }

        Commands::Split {
            input,
            output_dir,
            val_fraction,
            seed,
            val_name,
            test_name,
            jsonl,
        } => {
            cli::split(input, output_dir, val_fraction, seed, val_name, test_name, jsonl)?;
        }

        Commands::Inspect { config, mode } => {
            cli::inspect(config, mode)?;
        }

        Commands::Devices => {
            cli::devices()?;
        }
    }

    Ok(())
}
