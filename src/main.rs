#![forbid(unsafe_code)]

//! `diffusion-bridge`: headless front end for the generation worker.
//!
//! Loads configuration and persisted settings, then either runs one
//! generation (reporting progress until it finishes) or reads/updates the
//! settings file.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use diffusion_bridge::models::request::GenerationRequest;
use diffusion_bridge::models::session::Outcome;
use diffusion_bridge::orchestrator::coordinator::Coordinator;
use diffusion_bridge::orchestrator::progress_sync::ProgressUpdate;
use diffusion_bridge::settings::SettingsStore;
use diffusion_bridge::{AppError, GlobalConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "diffusion-bridge", about = "Drive an image-generation worker", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one generation and print the resulting image paths.
    Generate(GenerateArgs),
    /// Print the current settings as TOML.
    ShowSettings,
    /// Update and persist default settings.
    SaveSettings(SaveSettingsArgs),
}

#[derive(Debug, Args)]
struct GenerateArgs {
    /// Text prompt.
    #[arg(long)]
    prompt: String,
    /// Image width in pixels.
    #[arg(long)]
    width: Option<u32>,
    /// Image height in pixels.
    #[arg(long)]
    height: Option<u32>,
    /// Denoising step count.
    #[arg(long)]
    steps: Option<u32>,
    /// Guidance scale.
    #[arg(long)]
    guidance: Option<f32>,
    /// Number of images to generate.
    #[arg(long)]
    count: Option<u32>,
    /// Source image for image-to-image.
    #[arg(long)]
    input_image: Option<PathBuf>,
    /// Inpainting mask (requires `--input-image`).
    #[arg(long)]
    mask_image: Option<PathBuf>,
    /// Image-to-image strength.
    #[arg(long)]
    strength: Option<f32>,
}

#[derive(Debug, Args)]
struct SaveSettingsArgs {
    /// Default image width.
    #[arg(long)]
    width: Option<u32>,
    /// Default image height.
    #[arg(long)]
    height: Option<u32>,
    /// Default step count.
    #[arg(long)]
    steps: Option<u32>,
    /// Default guidance scale.
    #[arg(long)]
    guidance: Option<f32>,
    /// Output directory.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Model location.
    #[arg(long)]
    model_path: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = GlobalConfig::load_from_path(&args.config)?;
    let settings = SettingsStore::load(&config.settings_path)?;
    info!(settings = %settings.path().display(), "configuration loaded");

    match args.command {
        Commands::Generate(opts) => generate(&config, &settings, opts).await,
        Commands::ShowSettings => {
            let body = toml::to_string_pretty(&settings.get().await)?;
            print!("{body}");
            Ok(())
        }
        Commands::SaveSettings(opts) => save_settings(&settings, opts).await,
    }
}

async fn generate(config: &GlobalConfig, settings: &SettingsStore, opts: GenerateArgs) -> Result<()> {
    let mut request = GenerationRequest::from_settings(opts.prompt, &settings.get().await);
    if let Some(width) = opts.width {
        request.width = width;
    }
    if let Some(height) = opts.height {
        request.height = height;
    }
    if let Some(steps) = opts.steps {
        request.inference_steps = steps;
    }
    if let Some(guidance) = opts.guidance {
        request.guidance_scale = guidance;
    }
    if let Some(count) = opts.count {
        request.image_count = count;
    }
    request.input_image = opts.input_image;
    request.mask_image = opts.mask_image;
    request.strength = opts.strength;

    let coordinator = Coordinator::from_config(config);
    let mut updates = coordinator.subscribe();
    let session = coordinator.start_generation(request).await?;

    let interrupt = shutdown_signal();
    tokio::pin!(interrupt);
    let mut interrupted = false;

    loop {
        tokio::select! {
            () = &mut interrupt, if !interrupted => {
                interrupted = true;
                info!("interrupt received, cancelling generation");
                if let Err(err) = coordinator.cancel_active().await {
                    warn!(%err, "cancel rejected");
                }
            }

            update = updates.recv() => match update {
                Ok(update) => {
                    log_update(&update);
                    if update.is_terminal() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "progress updates dropped"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    session.wait_terminal().await;
    let report = coordinator.clear_finished().await?;
    coordinator.shutdown().await;

    match report.outcome {
        Outcome::Completed { paths } => {
            for path in paths {
                println!("{}", path.display());
            }
            Ok(())
        }
        Outcome::Cancelled => {
            info!("generation cancelled");
            Ok(())
        }
        Outcome::Failed { error } => Err(AppError::Worker(error)),
    }
}

async fn save_settings(store: &SettingsStore, opts: SaveSettingsArgs) -> Result<()> {
    let mut settings = store.get().await;
    if let Some(width) = opts.width {
        settings.default_width = width;
    }
    if let Some(height) = opts.height {
        settings.default_height = height;
    }
    if let Some(steps) = opts.steps {
        settings.default_inference_steps = steps;
    }
    if let Some(guidance) = opts.guidance {
        settings.default_guidance_scale = guidance;
    }
    if let Some(dir) = opts.output_dir {
        settings.output_dir = dir;
    }
    if let Some(model) = opts.model_path {
        settings.model_path = Some(model);
    }

    store.save(settings).await?;
    println!("settings saved to {}", store.path().display());
    Ok(())
}

fn log_update(update: &ProgressUpdate) {
    info!(
        session_id = %update.session_id,
        phase = ?update.phase,
        step = update.snapshot.current_step,
        total = update.snapshot.total_steps,
        status = %update.snapshot.status,
        eta_secs = update.eta.map(|eta| eta.as_secs()),
        "progress"
    );
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Progress goes to stderr; stdout carries only command output.
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
