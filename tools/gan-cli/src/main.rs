// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint};
use serde::Serialize;
use st_gan::{
    discriminator_layout, generator_layout, AttentionSet, BuildReport, GanConfig, GanPair,
    Generator, LayoutDescriptor,
};
use st_nn::GradMode;
use st_tensor::Tensor;
use std::error::Error;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

type DynError = Box<dyn Error>;

type Result<T> = std::result::Result<T, DynError>;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Layout, summary and sampling driver for SpiralTorch GANs"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the stage layout of one network as JSON
    Layout(LayoutArgs),

    /// Build both networks from a config file and summarise them
    Summary(SummaryArgs),

    /// Generate images with the configured generator and write them as JSON
    Sample(SampleArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Network {
    Generator,
    Discriminator,
}

#[derive(Args)]
struct LayoutArgs {
    #[arg(long, value_enum, default_value_t = Network::Generator)]
    network: Network,

    /// Target image resolution (32, 64, 128 or 256)
    #[arg(long, default_value_t = 128)]
    resolution: usize,

    /// Channel width multiplier
    #[arg(long, default_value_t = 64)]
    ch: usize,

    /// Underscore-separated attention resolutions, e.g. 64_128
    #[arg(long, default_value = "64")]
    attention: String,
}

#[derive(Args)]
struct SummaryArgs {
    /// Pair configuration (.toml or .json)
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: PathBuf,
}

#[derive(Args)]
struct SampleArgs {
    /// Pair configuration (.toml or .json); only the generator section is used
    #[arg(long, value_hint = ValueHint::FilePath)]
    config: PathBuf,

    /// Number of images to generate
    #[arg(long, default_value_t = 1)]
    batch: usize,

    /// Seed for the latent draw
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Comma-separated class labels; defaults to 0, 1, 2, ... modulo the class count
    #[arg(long, value_delimiter = ',')]
    labels: Vec<usize>,

    /// Destination for the `{ shape, labels, data }` JSON payload
    #[arg(long, value_hint = ValueHint::FilePath)]
    output: PathBuf,
}

#[derive(Serialize)]
struct NetworkSummary<'a> {
    stages: usize,
    attention_resolutions: &'a [usize],
    param_count: usize,
    init_policy: &'a str,
}

impl<'a> NetworkSummary<'a> {
    fn from_report(report: &'a BuildReport) -> Self {
        Self {
            stages: report.stages,
            attention_resolutions: &report.attention_resolutions,
            param_count: report.param_count(),
            init_policy: &report.init.policy,
        }
    }
}

#[derive(Serialize)]
struct PairSummary<'a> {
    dim_z: usize,
    output_resolution: usize,
    generator: NetworkSummary<'a>,
    discriminator: NetworkSummary<'a>,
}

#[derive(Serialize)]
struct DiskImages {
    shape: Vec<usize>,
    labels: Vec<usize>,
    data: Vec<f32>,
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    // An already installed subscriber stays in place.
    let _ = spiral_config::init_tracing();
    let cli = Cli::parse();
    match &cli.command {
        Command::Layout(args) => print_json(&run_layout(args)?),
        Command::Summary(args) => run_summary(args),
        Command::Sample(args) => run_sample(args),
    }
}

fn run_layout(args: &LayoutArgs) -> Result<LayoutDescriptor> {
    let attention = AttentionSet::parse(&args.attention)?;
    let layout = match args.network {
        Network::Generator => generator_layout(args.ch, &attention, args.resolution)?,
        Network::Discriminator => discriminator_layout(args.ch, &attention, args.resolution)?,
    };
    Ok(layout)
}

fn run_summary(args: &SummaryArgs) -> Result<()> {
    let config = GanConfig::load(&args.config)?;
    let pair = GanPair::from_config(&config)?;
    let (g, d) = (pair.generator(), pair.discriminator());
    let (Some(g_report), Some(d_report)) = (g.report(), d.report()) else {
        return Err(Box::new(io::Error::new(
            ErrorKind::Other,
            "network was built without a report",
        )));
    };
    print_json(&PairSummary {
        dim_z: g.dim_z(),
        output_resolution: g.output_resolution(),
        generator: NetworkSummary::from_report(g_report),
        discriminator: NetworkSummary::from_report(d_report),
    })
}

fn run_sample(args: &SampleArgs) -> Result<()> {
    if args.batch == 0 {
        return Err(Box::new(io::Error::new(
            ErrorKind::InvalidInput,
            "--batch must be greater than zero",
        )));
    }
    let config = GanConfig::load(&args.config)?;
    let n_classes = config.generator.n_classes;
    let labels: Vec<usize> = if args.labels.is_empty() {
        (0..args.batch).map(|i| i % n_classes).collect()
    } else if args.labels.len() == args.batch {
        args.labels.clone()
    } else {
        return Err(Box::new(io::Error::new(
            ErrorKind::InvalidInput,
            format!(
                "--labels has {} entries but --batch is {}",
                args.labels.len(),
                args.batch
            ),
        )));
    };
    let generator = Generator::new(&config.generator)?;
    let z = Tensor::random_normal(&[args.batch, generator.dim_z()], 0.0, 1.0, Some(args.seed))?;
    let y = generator.shared(&labels)?;
    let images = generator.forward(&z, &y, GradMode::Disabled)?;
    let payload = DiskImages {
        shape: images.shape().to_vec(),
        labels,
        data: images.to_vec(),
    };
    write_json(&payload, &args.output)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    ensure_parent_dir(path)?;
    let payload = serde_json::to_string(value)?;
    fs::write(path, payload)?;
    Ok(())
}

fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
