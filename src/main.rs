//! alivepaper - live video wallpapers for X11 desktops
//!
//! `alivepaper` (or `alivepaper daemon`) runs the engine: it owns the desktop
//! video surface, the wallpaper history and the control socket. Every other
//! subcommand is a thin client talking to that socket.

mod access;
mod bootstrap;
mod config;
mod db;
mod dbus;
mod error;
mod fallback;
mod ipc;
mod media;
mod service;
mod store;
mod surface;
mod volume;

use alivepaper_ipc::{Request, Response, WallpaperEvent, socket_path};
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use access::PermissionBroker;
use config::{Config, FallbackBackend};
use dbus::portal::PortalBackground;
use fallback::root::RootWindowBackground;
use fallback::{DesktopBackground, StaticFallback};
use ipc::IpcClient;
use media::FfmpegMedia;
use service::WallpaperService;
use store::WallpaperStore;
use surface::x11::X11Surface;

const USAGE: &str = "\
Usage: alivepaper [COMMAND]

Commands:
  daemon                       Run the wallpaper engine (default)
  select <file> [--volume V]   Play a video as wallpaper (V in 0..1)
  apply <file>                 Reapply a wallpaper from history
  volume <V>                   Change the live volume (0..1)
  clear                        Remove the live wallpaper
  status                       Show what is playing
  history                      List previously used wallpapers
  watch                        Print change notifications as they happen
";

/// Parsed command line
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Daemon,
    Select { path: String, volume: Option<f32> },
    Apply { path: String },
    Volume(f32),
    Clear,
    Status,
    History,
    Watch,
    Help,
}

fn parse_volume(value: Option<&String>) -> Result<f32> {
    let value = value.context("missing volume")?;
    let volume: f32 = value
        .parse()
        .with_context(|| format!("invalid volume: {value}"))?;
    if volume.is_nan() {
        anyhow::bail!("invalid volume: {value}");
    }
    Ok(volume)
}

fn parse_args(args: &[String]) -> Result<Command> {
    let Some(command) = args.first() else {
        return Ok(Command::Daemon);
    };
    let rest = &args[1..];

    let command = match command.as_str() {
        "daemon" => Command::Daemon,
        "select" => {
            let mut path = None;
            let mut volume = None;
            let mut iter = rest.iter();
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--volume" | "-v" => volume = Some(parse_volume(iter.next())?),
                    _ if path.is_none() => path = Some(arg.clone()),
                    _ => anyhow::bail!("unexpected argument: {arg}"),
                }
            }
            Command::Select {
                path: path.context("select needs a file")?,
                volume,
            }
        }
        "apply" => Command::Apply {
            path: rest.first().context("apply needs a file")?.clone(),
        },
        "volume" => Command::Volume(parse_volume(rest.first())?),
        "clear" => Command::Clear,
        "status" => Command::Status,
        "history" => Command::History,
        "watch" => Command::Watch,
        "help" | "--help" | "-h" => Command::Help,
        other => anyhow::bail!("unknown command: {other}\n\n{USAGE}"),
    };
    Ok(command)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "alivepaper=info,warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    match parse_args(&args)? {
        Command::Daemon => run_daemon().await,
        Command::Help => {
            print!("{USAGE}");
            Ok(())
        }
        command => run_client(command).await,
    }
}

async fn run_daemon() -> Result<()> {
    info!("Starting alivepaper");

    let config = Config::load()?;
    let db_path = config.database_path()?;

    let store = Arc::new(
        WallpaperStore::open(&db_path).context("Failed to open wallpaper store")?,
    );
    let broker = Arc::new(
        PermissionBroker::open(&db_path).context("Failed to open access token store")?,
    );

    // Claim the socket first so a second daemon never touches the display
    let socket = socket_path();
    let listener = ipc::bind(&socket).await?;

    let media = FfmpegMedia::new(&config.media);
    let backend = X11Surface::connect(config.surface.clone(), media.clone())
        .context("Failed to connect to X11 display")?;
    let (surface, surface_thread) =
        surface::handle::spawn(backend).context("Failed to start surface thread")?;

    let fallback = if config.fallback.enabled {
        let desktop: Arc<dyn DesktopBackground> = match config.fallback.backend {
            FallbackBackend::RootWindow => Arc::new(RootWindowBackground::new()),
            FallbackBackend::Portal => {
                Arc::new(PortalBackground::new(tokio::runtime::Handle::current()))
            }
        };
        Some(Arc::new(StaticFallback::new(
            &config.fallback,
            config.cache_dir()?,
            Arc::new(media),
            desktop,
        )))
    } else {
        info!("Static wallpaper fallback disabled");
        None
    };

    let service = Arc::new(WallpaperService::new(store, broker, surface, fallback));

    if config.session.restore_on_start {
        let outcome = service.restore_last_session().await;
        info!("Session restore: {:?}", outcome);
    }

    let server = ipc::serve(listener, Arc::clone(&service));

    // Handle SIGTERM and SIGINT
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
        }
    }

    server.abort();
    service.shutdown().await;
    if let Err(e) = tokio::task::spawn_blocking(move || surface_thread.join()).await {
        error!("Failed to join surface thread: {}", e);
    }

    if let Err(e) = std::fs::remove_file(&socket) {
        warn!("Failed to remove socket {:?}: {}", socket, e);
    }

    info!("alivepaper stopped");
    Ok(())
}

async fn run_client(command: Command) -> Result<()> {
    let mut client = IpcClient::connect(&socket_path()).await?;

    let request = match command {
        Command::Select { path, volume } => {
            let volume = match volume {
                Some(volume) => volume,
                None => Config::load()?.session.default_volume,
            };
            Request::Select {
                path: absolute(&path)?,
                volume,
            }
        }
        Command::Apply { path } => Request::Apply {
            path: absolute(&path)?,
        },
        Command::Volume(volume) => Request::SetVolume { volume },
        Command::Clear => Request::Clear,
        Command::Status => Request::Status,
        Command::History => Request::History,
        Command::Watch => return watch(client).await,
        Command::Daemon | Command::Help => return Ok(()),
    };

    match client.request(&request).await? {
        Response::Ok => Ok(()),
        Response::Status {
            active,
            path,
            volume,
        } => {
            match (active, path, volume) {
                (true, Some(path), Some(volume)) => {
                    println!("playing {} (volume {:.0}%)", path, volume * 100.0)
                }
                _ => println!("idle"),
            }
            Ok(())
        }
        Response::History { entries } => {
            for entry in entries {
                let when = DateTime::from_timestamp_millis(entry.last_used_at)
                    .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!("{when}  {:>4.0}%  {}", entry.volume * 100.0, entry.path);
            }
            Ok(())
        }
        Response::Error { message } => anyhow::bail!(message),
        Response::Event { .. } => anyhow::bail!("unexpected event from daemon"),
    }
}

/// Print notifications until the daemon goes away
async fn watch(mut client: IpcClient) -> Result<()> {
    match client.request(&Request::Subscribe).await? {
        Response::Ok => {}
        Response::Error { message } => anyhow::bail!(message),
        other => anyhow::bail!("unexpected response: {other:?}"),
    }

    while let Some(response) = client.next_response().await? {
        match response {
            Response::Event {
                event: WallpaperEvent::SelectionChanged { path, volume },
            } => println!("selected {} (volume {:.0}%)", path, volume * 100.0),
            Response::Event {
                event: WallpaperEvent::HistoryChanged,
            } => println!("history changed"),
            other => warn!("Ignoring unexpected frame: {:?}", other),
        }
    }
    Ok(())
}

/// Paths travel to the daemon absolute, resolved against our working directory
fn absolute(path: &str) -> Result<String> {
    let resolved: PathBuf = ipc::absolute_path(path)?;
    resolved
        .into_os_string()
        .into_string()
        .map_err(|raw| anyhow::anyhow!("path is not valid UTF-8: {}", PathBuf::from(raw).display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_no_args_runs_daemon() {
        assert_eq!(parse_args(&[]).unwrap(), Command::Daemon);
        assert_eq!(parse_args(&args(&["daemon"])).unwrap(), Command::Daemon);
    }

    #[test]
    fn test_select_with_volume() {
        assert_eq!(
            parse_args(&args(&["select", "beach.mp4", "--volume", "0.7"])).unwrap(),
            Command::Select {
                path: "beach.mp4".to_string(),
                volume: Some(0.7),
            }
        );
        assert_eq!(
            parse_args(&args(&["select", "-v", "0", "beach.mp4"])).unwrap(),
            Command::Select {
                path: "beach.mp4".to_string(),
                volume: Some(0.0),
            }
        );
    }

    #[test]
    fn test_select_without_volume() {
        assert_eq!(
            parse_args(&args(&["select", "beach.mp4"])).unwrap(),
            Command::Select {
                path: "beach.mp4".to_string(),
                volume: None,
            }
        );
    }

    #[test]
    fn test_bad_arguments() {
        assert!(parse_args(&args(&["select"])).is_err());
        assert!(parse_args(&args(&["select", "a.mp4", "b.mp4"])).is_err());
        assert!(parse_args(&args(&["volume", "loud"])).is_err());
        assert!(parse_args(&args(&["volume", "NaN"])).is_err());
        assert!(parse_args(&args(&["frobnicate"])).is_err());
    }

    #[test]
    fn test_simple_commands() {
        assert_eq!(parse_args(&args(&["volume", "0.25"])).unwrap(), Command::Volume(0.25));
        assert_eq!(parse_args(&args(&["clear"])).unwrap(), Command::Clear);
        assert_eq!(parse_args(&args(&["history"])).unwrap(), Command::History);
        assert_eq!(parse_args(&args(&["watch"])).unwrap(), Command::Watch);
        assert_eq!(
            parse_args(&args(&["apply", "/v/a.mp4"])).unwrap(),
            Command::Apply {
                path: "/v/a.mp4".to_string()
            }
        );
    }
}
