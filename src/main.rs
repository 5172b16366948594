use anyhow::{Context, Result};
use clap::Parser;
use flashdeck::api::{self, AppState};
use flashdeck::config::Settings;
use flashdeck::logging::setup_logging;
use std::path::PathBuf;
use tracing::{info, warn};

/// Operator console for flashing LineageOS onto USB-attached Android devices
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Settings file (default: flashdeck.toml in the user config directory)
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. 0.0.0.0:8000
    #[clap(short, long)]
    bind: Option<String>,

    /// Directory downloaded images are cached in
    #[clap(long)]
    cache_dir: Option<PathBuf>,

    /// URL of the OS image to flash
    #[clap(long)]
    image_url: Option<String>,

    /// Verbose logging
    #[clap(short, long)]
    debug: bool,
}

fn load_settings(args: &Args) -> Result<Settings> {
    let mut settings = Settings::load(args.config.as_deref()).context("Failed to load settings")?;
    settings.apply_env();

    if let Some(bind) = &args.bind {
        settings.bind = bind.clone();
    }
    if let Some(cache_dir) = &args.cache_dir {
        settings.cache_dir = cache_dir.clone();
    }
    if let Some(url) = &args.image_url {
        settings.image_url = Some(url.clone());
    }

    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = load_settings(&args)?;
    let _log_guard = setup_logging(&settings.log_dir, args.debug)?;

    info!("Image cache: {}", settings.cache_dir.display());
    match &settings.image_url {
        Some(url) => info!("Image URL: {}", url),
        None => warn!("Lineage OS URL not configured; only cached images can be flashed"),
    }
    if !settings.requires_confirmation {
        warn!("Flashes start without operator confirmation");
    }

    let state = AppState::from_settings(&settings);
    state
        .images
        .clean_partials()
        .context("Failed to clean image cache")?;

    state.registry.rescan().await;
    let _rescan = state.registry.spawn_rescan_loop(settings.scan_interval());

    let addr = settings.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    api::serve(listener, state, shutdown_signal())
        .await
        .context("HTTP server failed")?;
    Ok(())
}
