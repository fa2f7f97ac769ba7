#![recursion_limit = "256"]

use std::path::PathBuf;

use anyhow::{Context, bail};
use burn::{
    backend::{Autodiff, NdArray, Wgpu, ndarray::NdArrayDevice},
    module::Module,
    optim::{AdamConfig, decay::WeightDecayConfig},
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use env_logger::Builder;
use log::LevelFilter;

use preact_resnet::{
    BlockVariant, ResNetConfig, TrainingConfig,
    data::DataSource,
    device::{self, ComputeDevice},
    model::STEM_CHANNELS,
    run,
};

pub static ARTIFACT_DIR: &str = "./tmp/preact-resnet";

#[derive(Parser)]
#[command(author, version, about = "Train pre-activation ResNets on small images")]
struct Cli {
    /// More log output: -v for debug, -vv for trace
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a network and evaluate it after every epoch
    Train(TrainArgs),
    /// Print the group layout and parameter count of a preset
    Inspect {
        #[arg(long, default_value_t = 18)]
        depth: usize,
        #[arg(long, default_value_t = 10)]
        classes: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DatasetKind {
    Synthetic,
    Mnist,
    Folder,
}

#[derive(Clone, Copy, ValueEnum)]
enum BackendKind {
    /// wgpu when an adapter is available, ndarray otherwise
    Auto,
    /// wgpu, falling back to ndarray with a warning
    Wgpu,
    Ndarray,
}

#[derive(Args)]
struct TrainArgs {
    /// ResNet depth: 18, 34, 50, 101 or 152
    #[arg(long, default_value_t = 18)]
    depth: usize,
    #[arg(long, value_enum, default_value_t = DatasetKind::Synthetic)]
    dataset: DatasetKind,
    /// Root with `train/` and `test/` class folders, for `--dataset folder`
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Training config JSON; flags below override its fields
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    learning_rate: Option<f64>,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value = ARTIFACT_DIR)]
    artifact_dir: String,
    #[arg(long, value_enum, default_value_t = BackendKind::Auto)]
    backend: BackendKind,
}

impl TrainArgs {
    fn training_config(&self) -> anyhow::Result<TrainingConfig> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::from_file(path)
                .with_context(|| format!("reading {}", path.display()))?,
            None => TrainingConfig::new(
                ResNetConfig::from_depth(self.depth, 10)?,
                AdamConfig::new().with_weight_decay(Some(WeightDecayConfig::new(5e-5))),
            ),
        };

        if let Some(epochs) = self.epochs {
            config.num_epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(learning_rate) = self.learning_rate {
            config.learning_rate = learning_rate;
        }
        if let Some(workers) = self.workers {
            config.num_workers = workers;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        Ok(config)
    }

    fn source(&self, seed: u64) -> anyhow::Result<DataSource> {
        Ok(match self.dataset {
            DatasetKind::Synthetic => DataSource::Synthetic {
                train: 512,
                test: 128,
                classes: 10,
                seed,
            },
            DatasetKind::Mnist => DataSource::Mnist,
            DatasetKind::Folder => match &self.data_dir {
                Some(root) => DataSource::ImageFolder(root.clone()),
                None => bail!("--dataset folder needs --data-dir"),
            },
        })
    }

    fn run(&self) -> anyhow::Result<()> {
        let config = self.training_config()?;
        let source = self.source(config.seed)?;

        let device = match self.backend {
            BackendKind::Auto => device::accelerator_or_cpu(false),
            BackendKind::Wgpu => device::accelerator_or_cpu(true),
            BackendKind::Ndarray => device::cpu(),
        };

        let history = match device {
            ComputeDevice::Wgpu(device) => {
                run::<Autodiff<Wgpu>>(&self.artifact_dir, config, &source, device)?
            }
            ComputeDevice::Cpu(device) => {
                run::<Autodiff<NdArray>>(&self.artifact_dir, config, &source, device)?
            }
        };

        if let Some(best) = history
            .valid_accuracies()
            .into_iter()
            .max_by(|a, b| a.total_cmp(b))
        {
            println!("best validation accuracy: {:.2}%", best * 100.0);
        }
        Ok(())
    }
}

fn inspect(depth: usize, classes: usize) -> anyhow::Result<()> {
    let config = ResNetConfig::from_depth(depth, classes)?;
    let model = config.init::<NdArray>(&NdArrayDevice::Cpu)?;

    let kind = match config.variant {
        BlockVariant::Standard => "standard",
        BlockVariant::Bottleneck => "bottleneck",
    };
    println!("resnet{depth} ({kind} blocks), stem 3x3 -> {STEM_CHANNELS} channels");
    for (index, group) in config.groups()?.iter().enumerate() {
        println!(
            "  group {}: {} blocks, {} -> {} channels, strides {:?}",
            index + 1,
            group.blocks,
            group.channels,
            group.out_channels(),
            group.stride_pattern(),
        );
    }
    println!("  classifier: {} -> {classes}", config.feature_channels());
    println!("{} parameters", model.num_params());
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match (cli.quiet, cli.verbose) {
        (true, _) => LevelFilter::Warn,
        (false, 0) => LevelFilter::Info,
        (false, 1) => LevelFilter::Debug,
        (false, _) => LevelFilter::Trace,
    };
    Builder::from_default_env()
        .filter(Some("preact_resnet"), level)
        .init();

    match &cli.command {
        Command::Train(args) => args.run(),
        Command::Inspect { depth, classes } => inspect(*depth, *classes),
    }
}
