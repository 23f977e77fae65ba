//! RetroHD CLI
//!
//! Command-line driver for file upscaling, live upscaling and model management.

use clap::{Parser, Subcommand};
use retrohd::{
    config::Config,
    media::{self, FfmpegBackend},
    models::{ModelName, SCALES},
    CancelToken, Error, FramePipeline, LiveStreamController, ModelRegistry, PipelineConfig,
    Progress, TranscodeController,
};
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "retrohd")]
#[command(about = "AI upscaling and colorization for archival video")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show FFmpeg capabilities and configuration
    Info,

    /// List registered models and whether they are cached
    Models,

    /// Download models into the cache
    Fetch {
        /// Model name (fsrcnn, edsr, lapsrn, espcn); all models if omitted
        model: Option<String>,

        /// Scale factor; every registered scale if omitted
        #[arg(short, long)]
        scale: Option<u32>,

        /// Also fetch the colorization model
        #[arg(long)]
        colorizer: bool,
    },

    /// Upscale a video file, keeping its audio
    Upscale {
        /// Input video
        input: PathBuf,

        /// Output video (container picked from the extension)
        output: PathBuf,

        /// Model name (fsrcnn, edsr, lapsrn, espcn)
        #[arg(short, long)]
        model: Option<String>,

        /// Scale factor (2-4)
        #[arg(short, long)]
        scale: Option<u32>,

        /// Colorize before upscaling
        #[arg(long, overrides_with = "no_colorize")]
        colorize: bool,

        /// Do not colorize, even if the configuration enables it
        #[arg(long, overrides_with = "colorize")]
        no_colorize: bool,
    },

    /// Upscale a live stream and show it on a display device
    Live {
        /// Stream URL or device (rtsp://, udp://, /dev/video0, ...)
        locator: String,

        /// Model name (fsrcnn, edsr, lapsrn, espcn)
        #[arg(short, long)]
        model: Option<String>,

        /// Scale factor (2-4)
        #[arg(short, long)]
        scale: Option<u32>,

        /// Colorize before upscaling
        #[arg(long, overrides_with = "no_colorize")]
        colorize: bool,

        /// Do not colorize, even if the configuration enables it
        #[arg(long, overrides_with = "colorize")]
        no_colorize: bool,

        /// FFmpeg output device (sdl, xv, fbdev, ...)
        #[arg(short, long)]
        device: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("retrohd=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Info => cmd_info(&config),
        Commands::Models => cmd_models(&config),
        Commands::Fetch {
            model,
            scale,
            colorizer,
        } => cmd_fetch(config, model, scale, colorizer).await,
        Commands::Upscale {
            input,
            output,
            model,
            scale,
            colorize,
            no_colorize,
        } => {
            let colorize = colorize_override(colorize, no_colorize);
            let job = job_config(&config, model, scale.unwrap_or(config.pipeline.scale), colorize)?;
            cmd_upscale(config, job, input, output).await
        }
        Commands::Live {
            locator,
            model,
            scale,
            colorize,
            no_colorize,
            device,
        } => {
            let colorize = colorize_override(colorize, no_colorize);
            let job = job_config(&config, model, scale.unwrap_or(config.pipeline.live_scale), colorize)?;
            cmd_live(config, job, locator, device).await
        }
    }
}

/// `--colorize` / `--no-colorize`, `None` when neither was given
fn colorize_override(colorize: bool, no_colorize: bool) -> Option<bool> {
    match (colorize, no_colorize) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

/// Command-line flags layered over the configured defaults
fn job_config(
    config: &Config,
    model: Option<String>,
    scale: u32,
    colorize: Option<bool>,
) -> retrohd::Result<PipelineConfig> {
    let model = model.unwrap_or_else(|| config.pipeline.model.clone());
    PipelineConfig::parse(&model, scale, colorize.unwrap_or(config.pipeline.colorize))
}

fn yes_no(v: bool) -> &'static str {
    if v {
        "Yes"
    } else {
        "No"
    }
}

fn cmd_info(config: &Config) -> anyhow::Result<()> {
    println!("RetroHD {}", retrohd::VERSION);
    println!("============\n");

    println!("=== Encoders ===");
    for name in [&config.encoder.codec, &config.encoder.fallback_codec] {
        println!("  {:<10} {}", name, yes_no(media::encoder_available(name)));
    }

    println!("\n=== Display ===");
    println!(
        "  {:<10} {}",
        config.display.device,
        yes_no(media::output_device_available(&config.display.device))
    );

    println!("\n=== Defaults ===");
    println!("  Model: {} x{}", config.pipeline.model, config.pipeline.scale);
    println!("  Live scale: x{}", config.pipeline.live_scale);
    println!("  Colorize: {}", yes_no(config.pipeline.colorize));
    println!("  Model cache: {}", config.models.cache_dir.display());

    Ok(())
}

fn cmd_models(config: &Config) -> anyhow::Result<()> {
    let registry = ModelRegistry::from_config(&config.models)?;

    println!("Models ({})", registry.cache().root().display());
    println!("======\n");

    for name in ModelName::ALL {
        let scales: Vec<String> = SCALES
            .filter_map(|scale| registry.resolve(name, scale).ok())
            .map(|d| {
                let marker = if registry.cache().is_cached(d) { "*" } else { "" };
                format!("x{}{}", d.scale().unwrap_or_default(), marker)
            })
            .collect();
        println!("  {:<8} {:<30} {}", name, name.display_name(), scales.join(" "));
    }

    if let Ok(colorizer) = registry.colorizer() {
        println!(
            "  {:<8} {:<30} {}",
            "color",
            colorizer.path.display(),
            if registry.cache().is_cached(colorizer) {
                "cached"
            } else if colorizer.url.is_some() {
                "not cached"
            } else {
                "not cached, no URL configured"
            }
        );
    }

    println!("\n* = cached locally");
    Ok(())
}

async fn cmd_fetch(
    config: Config,
    model: Option<String>,
    scale: Option<u32>,
    colorizer: bool,
) -> anyhow::Result<()> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let registry = ModelRegistry::from_config(&config.models)?;

        let name = model
            .map(|m| ModelName::parse(&m, scale.unwrap_or_default()))
            .transpose()?;

        let wanted: Vec<_> = registry
            .descriptors()
            .filter(|d| match d.id {
                retrohd::models::ModelId::SuperResolution { name: n, scale: s } => {
                    name.map_or(true, |name| name == n) && scale.map_or(true, |scale| scale == s)
                }
                retrohd::models::ModelId::Colorization => false,
            })
            .cloned()
            .collect();

        if let (Some(name), Some(scale)) = (name, scale) {
            // Surface UnknownModel rather than silently fetching nothing
            registry.resolve(name, scale)?;
        }

        for descriptor in &wanted {
            let path = registry.ensure_local(descriptor)?;
            println!("  {:<12} {}", descriptor.id.to_string(), path.display());
        }

        if colorizer {
            let descriptor = registry.colorizer()?;
            let path = registry.ensure_local(descriptor)?;
            println!("  {:<12} {}", descriptor.id.to_string(), path.display());
        }

        Ok(())
    })
    .await?
}

/// Cancel the token on Ctrl+C
fn cancel_on_ctrl_c(token: CancelToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nStopping...");
            token.cancel();
        }
    });
}

fn print_progress(progress: Progress) {
    match progress.fraction() {
        Some(f) => eprint!(
            "\r  {}/{} frames ({:.1}%)",
            progress.completed,
            progress.total.unwrap_or_default(),
            f * 100.0
        ),
        None => eprint!("\r  {} frames", progress.completed),
    }
    let _ = std::io::stderr().flush();
}

async fn cmd_upscale(
    config: Config,
    job: PipelineConfig,
    input: PathBuf,
    output: PathBuf,
) -> anyhow::Result<()> {
    println!("Upscaling {} -> {}", input.display(), output.display());
    println!("  Model: {} x{}", job.model.display_name(), job.scale);
    println!("  Colorize: {}\n", yes_no(job.colorize));

    let cancel = CancelToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let (tx, rx) = crossbeam_channel::unbounded::<Progress>();
    let printer = std::thread::spawn(move || {
        for progress in rx {
            print_progress(progress);
        }
        eprintln!();
    });

    let result = tokio::task::spawn_blocking(move || -> retrohd::Result<PathBuf> {
        let registry = ModelRegistry::from_config(&config.models)?;
        let pipeline = FramePipeline::load(job, &registry)?;
        let backend = FfmpegBackend::new(config.encoder, config.display);

        TranscodeController::new(backend, pipeline)
            .with_progress(tx)
            .with_cancel(cancel)
            .run(&input, &output)
    })
    .await?;

    let _ = printer.join();

    match result {
        Ok(path) => {
            println!("Done: {}", path.display());
            Ok(())
        }
        Err(e @ Error::AudioMerge { .. }) => {
            eprintln!("Warning: {}", e);
            if let Some(path) = e.usable_artifact() {
                println!("Silent video: {}", path.display());
            }
            Ok(())
        }
        Err(Error::Cancelled) => {
            println!("Cancelled");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn cmd_live(
    config: Config,
    job: PipelineConfig,
    locator: String,
    device: Option<String>,
) -> anyhow::Result<()> {
    println!("Live upscaling {}", locator);
    println!("  Model: {} x{}", job.model.display_name(), job.scale);
    println!("Press Ctrl+C to stop.\n");

    let cancel = CancelToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let summary = tokio::task::spawn_blocking(move || -> retrohd::Result<_> {
        let registry = ModelRegistry::from_config(&config.models)?;
        let pipeline = FramePipeline::load(job, &registry)?;

        let display = match device {
            Some(device) => config.display.clone().with_device(device, config.display.target.clone()),
            None => config.display.clone(),
        };
        let backend = FfmpegBackend::new(config.encoder, display);

        LiveStreamController::new(backend, pipeline, cancel).run(&locator)
    })
    .await??;

    println!("\nStatistics:");
    println!("  Frames shown: {}", summary.frames);
    println!("  Stopped by: {}", if summary.cancelled { "user" } else { "end of stream" });

    Ok(())
}
