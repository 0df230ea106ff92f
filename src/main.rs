use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use framesynth::augment::SizePolicy;
use framesynth::cancel::CancelFlag;
use framesynth::config::ImageBackend;
use framesynth::models::Dimensions;
use framesynth::report::BatchReport;
use framesynth::{Pipeline, PipelineConfig};

#[derive(Parser)]
#[command(name = "framesynth")]
#[command(about = "Augment video clips through their first and last frames", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
    #[command(flatten)]
    options: Options,
}

#[derive(Subcommand)]
enum Command {
    /// Pull the first and last frame of every clip under SOURCE.
    Extract { source: PathBuf },
    /// Render every extracted frame pair with every catalog prompt.
    Augment,
    /// Re-render augmented frames with the gear-removal prompt.
    Correct,
    /// Join augmented first and last frames and list the pairs.
    Match,
    /// Synthesize a clip for every matched pair.
    Synthesize,
    /// Extract, augment, match and synthesize in one go.
    Run { source: PathBuf },
    /// Render every catalog prompt over a standalone image or image
    /// directory, then correct the variants.
    AugmentImages { source: PathBuf },
}

#[derive(Args)]
struct Options {
    /// Root of the frame namespaces.
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,
    #[arg(long, global = true)]
    clips_dir: Option<PathBuf>,
    #[arg(long, value_enum, global = true)]
    image_backend: Option<ImageBackend>,
    #[arg(long, global = true)]
    image_endpoint: Option<String>,
    #[arg(long, global = true)]
    openai_api_base: Option<String>,
    #[arg(long, global = true)]
    video_endpoint: Option<String>,
    #[arg(long, global = true)]
    image_concurrency: Option<usize>,
    #[arg(long, global = true)]
    video_concurrency: Option<usize>,
    #[arg(long, global = true)]
    image_timeout_secs: Option<u64>,
    #[arg(long, global = true)]
    video_timeout_secs: Option<u64>,
    /// Clips decoded at once during extraction.
    #[arg(short, long, global = true)]
    jobs: Option<usize>,
    #[arg(long, global = true, conflicts_with = "native_size")]
    width: Option<u32>,
    #[arg(long, global = true, conflicts_with = "native_size")]
    height: Option<u32>,
    /// Request each asset at its own frame size.
    #[arg(long, global = true)]
    native_size: bool,
    /// Prompt id recorded on corrected frames.
    #[arg(long, global = true)]
    sentinel: Option<u32>,
    /// Retries for transient service errors.
    #[arg(long, global = true)]
    retries: Option<u32>,
    /// Regenerate outputs that already exist.
    #[arg(long, global = true)]
    force: bool,
    /// Prompt catalog: a JSON array of strings or one prompt per line.
    #[arg(short, long, global = true)]
    prompts: Option<PathBuf>,
    /// Video prompt; repeat for several clips per pair.
    #[arg(long = "video-prompt", global = true)]
    video_prompts: Vec<String>,
    #[arg(long, global = true)]
    seed: Option<u64>,
    #[arg(long, global = true)]
    steps: Option<u32>,
}

impl Options {
    fn apply(self, config: &mut PipelineConfig) {
        if let Some(output) = self.output {
            config.output_dir = output;
        }
        if self.clips_dir.is_some() {
            config.clips_dir = self.clips_dir;
        }
        if let Some(backend) = self.image_backend {
            config.image_backend = backend;
        }
        if let Some(endpoint) = self.image_endpoint {
            config.image_endpoint = endpoint;
        }
        if self.openai_api_base.is_some() {
            config.openai_api_base = self.openai_api_base;
        }
        if let Some(endpoint) = self.video_endpoint {
            config.video_endpoint = endpoint;
        }
        if let Some(n) = self.image_concurrency {
            config.image_concurrency = n;
        }
        if let Some(n) = self.video_concurrency {
            config.video_concurrency = n;
        }
        if let Some(secs) = self.image_timeout_secs {
            config.image_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.video_timeout_secs {
            config.video_timeout = Duration::from_secs(secs);
        }
        if let Some(jobs) = self.jobs {
            config.extract_parallelism = jobs;
        }
        if self.native_size {
            config.size_policy = SizePolicy::Native;
        } else if self.width.is_some() || self.height.is_some() {
            let current = match config.size_policy {
                SizePolicy::Uniform(size) => size,
                SizePolicy::Native => Dimensions::new(1280, 720),
            };
            config.size_policy = SizePolicy::Uniform(Dimensions::new(
                self.width.unwrap_or(current.width),
                self.height.unwrap_or(current.height),
            ));
        }
        if let Some(sentinel) = self.sentinel {
            config.sentinel_prompt_id = sentinel;
        }
        if let Some(retries) = self.retries {
            config.max_retries = retries;
        }
        config.force |= self.force;
        if self.prompts.is_some() {
            config.prompts_file = self.prompts;
        }
        if !self.video_prompts.is_empty() {
            config.video.prompts = self.video_prompts;
        }
        if let Some(seed) = self.seed {
            config.video.seed = seed;
        }
        if let Some(steps) = self.steps {
            config.video.steps = steps;
        }
    }
}

fn init_tracing() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("framesynth=info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(false))
            .with(env_filter)
            .init();
    }
}

fn print_report(report: &BatchReport) {
    report.log_summary();
    print!("{report}");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let mut config = PipelineConfig::from_env()?;
    cli.options.apply(&mut config);
    info!(
        output = %config.output_dir.display(),
        backend = ?config.image_backend,
        "Starting framesynth"
    );

    let cancel = CancelFlag::new();
    cancel.cancel_on_ctrl_c();
    let pipeline = Pipeline::from_config(config, cancel)?;

    match cli.command {
        Command::Extract { source } => print_report(&pipeline.extract(&source).await?),
        Command::Augment => print_report(&pipeline.augment().await?),
        Command::Correct => print_report(&pipeline.correct().await?),
        Command::Match => {
            let matched = pipeline.match_frames().await?;
            for pair in &matched.pairs {
                println!(
                    "{}\t{}\t{}\t{}",
                    pair.asset_id,
                    pair.prompt_id,
                    pair.first_frame.display(),
                    pair.last_frame.display()
                );
            }
            print_report(&matched.to_batch_report());
        }
        Command::Synthesize => print_report(&pipeline.synthesize().await?),
        Command::Run { source } => {
            for report in pipeline.run(&source).await? {
                print_report(&report);
            }
        }
        Command::AugmentImages { source } => {
            for report in pipeline.augment_images(&source).await? {
                print_report(&report);
            }
        }
    }

    Ok(())
}
