use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use flashdeck::client::HttpConsoleClient;
use flashdeck::models::{Device, FlashSession, FlashState};
use flashdeck::poller::{PollerEvent, PollerSettings, StatusPoller};
use std::io::{self, BufRead, Write};
use std::time::Duration;
use tracing::{debug, info};

/// Terminal client for a running flashdeck console
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Console base URL
    #[clap(short, long, default_value = "http://127.0.0.1:8000")]
    url: String,

    /// Device list refresh interval in seconds
    #[clap(long, default_value_t = 5)]
    device_interval: u64,

    /// Session status refresh interval in seconds
    #[clap(long, default_value_t = 2)]
    session_interval: u64,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List attached devices
    Devices,
    /// List cached OS images and running downloads
    Images,
    /// Download an OS image into the console's cache
    Download {
        /// Defaults to the configured image
        filename: Option<String>,
    },
    /// Delete a cached OS image
    Delete { filename: String },
    /// Show a device's flash session
    Status { device_id: String },
    /// Dismiss a finished flash session
    Close { device_id: String },
    /// Show archived flash sessions
    History,
    /// Flash a device and follow it to the end
    Flash {
        device_id: String,
        /// Confirm without asking
        #[clap(short, long)]
        yes: bool,
    },
    /// Keep the device list on screen, following active sessions
    Watch,
}

fn print_devices(devices: &[Device]) {
    if devices.is_empty() {
        println!("No devices attached");
        return;
    }
    println!("{:<20} {:<24} {:<13} {}", "ID", "MODEL", "ADB", "FLASH");
    for device in devices {
        let model = device.model.as_deref().unwrap_or(&device.description);
        println!(
            "{:<20} {:<24} {:<13} {}",
            device.id,
            model,
            format!("{:?}", device.adb_status).to_lowercase(),
            device
                .flash_status
                .0
                .map(|s| s.to_string())
                .unwrap_or_else(|| "idle".to_string())
        );
    }
}

fn print_session(session: &FlashSession) {
    let mut line = format!(
        "[{}] {:>3}% {:<22} {}",
        session.device_id, session.progress, session.state, session.message
    );
    if let (Some(done), Some(total)) = (session.downloaded_bytes, session.total_bytes) {
        line.push_str(&format!(" ({} / {} MB)", done / 1_048_576, total / 1_048_576));
    }
    println!("{line}");
    if let Some(trace) = &session.error_trace {
        println!("    {trace}");
    }
}

async fn ask(question: String) -> Result<bool> {
    let answer = tokio::task::spawn_blocking(move || -> io::Result<String> {
        print!("{question} [y/N] ");
        io::stdout().flush()?;
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        Ok(answer)
    })
    .await
    .context("Prompt task failed")?
    .context("Failed to read answer")?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

async fn flash(client: HttpConsoleClient, settings: PollerSettings, device_id: &str, yes: bool) -> Result<()> {
    let session = client.prepare(device_id).await?;
    print_session(&session);

    let (mut poller, mut events) = StatusPoller::new(client, settings);
    let mut confirmed = false;
    let mut latest = session;

    loop {
        if !confirmed && latest.state.is_confirmable() {
            let go = yes || ask(format!("Image ready. Flash {device_id} now?")).await?;
            if !go {
                println!("Not flashing; the session stays open until closed");
                return Ok(());
            }
            latest = poller.api().confirm(device_id).await?;
            print_session(&latest);
            confirmed = true;
        }
        if latest.state.is_terminal() {
            break;
        }
        poller.watch_session(device_id);

        match events.recv().await {
            Some(PollerEvent::SessionUpdated(session)) => {
                if session.state != latest.state || session.progress != latest.progress {
                    print_session(&session);
                }
                latest = session;
            }
            Some(PollerEvent::SessionFinished(session)) => {
                print_session(&session);
                latest = session;
                break;
            }
            Some(PollerEvent::SessionGone(_)) => bail!("Session for {device_id} disappeared"),
            Some(PollerEvent::PollFailed(e)) => debug!("Poll failed: {}", e),
            Some(PollerEvent::DevicesUpdated(_)) => {}
            None => bail!("Poller stopped"),
        }
    }

    poller.unwatch_session(device_id);
    let closed = poller.api().close(device_id).await?;
    info!("Closed session {}", closed.session_id);

    match latest.state {
        FlashState::Completed => {
            println!("{device_id} flashed successfully");
            Ok(())
        }
        _ => Err(anyhow!(
            "Flash of {} failed: {}",
            device_id,
            latest.error_detail.unwrap_or(latest.message)
        )),
    }
}

async fn watch(client: HttpConsoleClient, settings: PollerSettings) -> Result<()> {
    let (mut poller, mut events) = StatusPoller::new(client, settings);
    poller.start();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(PollerEvent::DevicesUpdated(devices)) => {
                    println!();
                    print_devices(&devices);
                    for device in &devices {
                        let busy = device.flash_status.0.is_some_and(|s| !s.is_terminal());
                        if busy {
                            poller.watch_session(&device.id);
                        }
                    }
                }
                Some(PollerEvent::SessionUpdated(session) | PollerEvent::SessionFinished(session)) => {
                    print_session(&session)
                }
                Some(PollerEvent::SessionGone(id)) => println!("[{id}] session closed"),
                Some(PollerEvent::PollFailed(e)) => println!("! {e}"),
                None => break,
            }
        }
    }

    poller.stop();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let client = HttpConsoleClient::new(&args.url)?;
    let settings = PollerSettings {
        device_interval: Duration::from_secs(args.device_interval.max(1)),
        session_interval: Duration::from_secs(args.session_interval.max(1)),
    };

    match args.command {
        Command::Devices => {
            let listing = client.devices().await?;
            print_devices(&listing.devices);
            if let Some(error) = listing.error {
                println!("! {error}");
            }
        }
        Command::Images => {
            let images = client.os_images().await?;
            if images.is_empty() {
                println!("No cached images");
            }
            for image in images {
                println!(
                    "{:<40} {:>8} MB  {}",
                    image.filename,
                    image.size / 1_048_576,
                    image.modified.format("%Y-%m-%d %H:%M")
                );
            }
            for (name, task) in client.download_progress().await? {
                println!("{name}: {:?} {}%", task.status, task.progress);
            }
        }
        Command::Download { filename } => {
            let response = client.start_download(filename.as_deref()).await?;
            if response.already_exists {
                println!("{} is already cached", response.filename);
            } else {
                println!("Downloading {}", response.filename);
            }
        }
        Command::Delete { filename } => {
            println!("{}", client.delete_image(&filename).await?.message);
        }
        Command::Status { device_id } => match client.flash_status(&device_id).await? {
            Some(session) => print_session(&session),
            None => println!("[{device_id}] idle"),
        },
        Command::Close { device_id } => print_session(&client.close(&device_id).await?),
        Command::History => {
            for session in client.history().await? {
                print_session(&session);
            }
        }
        Command::Flash { device_id, yes } => flash(client, settings, &device_id, yes).await?,
        Command::Watch => watch(client, settings).await?,
    }

    Ok(())
}
