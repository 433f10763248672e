//! Control socket: server side for the daemon, client side for the CLI

use alivepaper_ipc::{
    FramedMessage, HistoryEntry, Request, Response, WallpaperEvent as WireEvent, read_frame,
    write_frame,
};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::service::{WallpaperEvent, WallpaperService};
use crate::store::WallpaperRecord;
use crate::surface::SurfaceStatus;

/// Bind the control socket, refusing when another daemon already answers
pub async fn bind(socket_path: &Path) -> Result<UnixListener> {
    if UnixStream::connect(socket_path).await.is_ok() {
        anyhow::bail!("alivepaper is already running ({})", socket_path.display());
    }

    // Stale socket from a daemon that did not exit cleanly
    if socket_path.exists() {
        std::fs::remove_file(socket_path).context("Failed to remove stale socket")?;
    }

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
    info!("IPC server listening on {:?}", socket_path);
    Ok(listener)
}

/// Accept clients until the task is aborted
pub fn serve(listener: UnixListener, service: Arc<WallpaperService>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    debug!("Client connected");
                    tokio::spawn(handle_client(stream, Arc::clone(&service)));
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    })
}

async fn handle_client(stream: UnixStream, service: Arc<WallpaperService>) {
    let (mut reader, mut writer) = stream.into_split();

    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                warn!("Dropping client: {}", e);
                break;
            }
        };

        let request = match FramedMessage::decode_request(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!("Failed to decode request: {}", e);
                let response = Response::Error {
                    message: format!("malformed request: {e}"),
                };
                if write_frame(&mut writer, &response).await.is_err() {
                    break;
                }
                continue;
            }
        };
        debug!("Received request: {:?}", request);

        if matches!(request, Request::Subscribe) {
            // Subscribe before acknowledging so no event slips in between
            let events = service.subscribe();
            if write_frame(&mut writer, &Response::Ok).await.is_err() {
                break;
            }
            stream_events(events, reader, writer).await;
            return;
        }

        let response = dispatch(&service, request).await;
        if write_frame(&mut writer, &response).await.is_err() {
            break;
        }
    }

    debug!("Client disconnected");
}

/// Forward events until the subscriber hangs up
async fn stream_events(
    mut events: broadcast::Receiver<WallpaperEvent>,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
) {
    loop {
        tokio::select! {
            // Subscribers send nothing more; any read result means hang-up
            _ = read_frame(&mut reader) => break,
            event = events.recv() => match event {
                Ok(event) => {
                    let response = Response::Event { event: wire_event(&event) };
                    if write_frame(&mut writer, &response).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Subscriber lagged {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    debug!("Subscriber disconnected");
}

async fn dispatch(service: &WallpaperService, request: Request) -> Response {
    let result = match request {
        Request::Select { path, volume } => service.select(Path::new(&path), volume).await,
        Request::Apply { path } => service.apply(Path::new(&path)).await,
        Request::SetVolume { volume } => service.set_volume(volume).await,
        Request::Clear => service.clear().await,
        Request::Status => {
            return match service.status().await {
                Ok(status) => status_response(&status),
                Err(e) => Response::Error {
                    message: e.to_string(),
                },
            };
        }
        Request::History => {
            return Response::History {
                entries: service.history().iter().map(history_entry).collect(),
            };
        }
        // Handled by the connection loop
        Request::Subscribe => Ok(()),
    };

    match result {
        Ok(()) => Response::Ok,
        Err(e) => {
            info!("Request failed: {}", e);
            Response::Error {
                message: e.to_string(),
            }
        }
    }
}

fn status_response(status: &SurfaceStatus) -> Response {
    Response::Status {
        active: status.is_active(),
        path: status.path.as_ref().map(|p| p.to_string_lossy().into_owned()),
        volume: status.volume.map(|v| v.get()),
    }
}

fn history_entry(record: &WallpaperRecord) -> HistoryEntry {
    HistoryEntry {
        id: record.id,
        path: record.path.to_string_lossy().into_owned(),
        display_name: record.display_name.clone(),
        last_used_at: record.last_used_at.timestamp_millis(),
        volume: record.volume.get(),
    }
}

fn wire_event(event: &WallpaperEvent) -> WireEvent {
    match event {
        WallpaperEvent::SelectionChanged { path, volume } => WireEvent::SelectionChanged {
            path: path.to_string_lossy().into_owned(),
            volume: volume.get(),
        },
        WallpaperEvent::HistoryChanged => WireEvent::HistoryChanged,
    }
}

/// Connection to a running daemon
pub struct IpcClient {
    stream: UnixStream,
}

impl IpcClient {
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path).await.with_context(|| {
            format!(
                "alivepaper daemon is not running (no socket at {})",
                socket_path.display()
            )
        })?;
        Ok(Self { stream })
    }

    /// Send one request and wait for its response
    pub async fn request(&mut self, request: &Request) -> Result<Response> {
        write_frame(&mut self.stream, request).await?;
        self.next_response()
            .await?
            .context("Daemon closed the connection")
    }

    /// Next frame pushed by the daemon; `None` once it hangs up
    pub async fn next_response(&mut self) -> Result<Option<Response>> {
        match read_frame(&mut self.stream).await? {
            Some(frame) => Ok(Some(FramedMessage::decode_response(&frame)?)),
            None => Ok(None),
        }
    }
}

/// Resolve a user-supplied path against the client's working directory
pub fn absolute_path(path: &str) -> Result<PathBuf> {
    std::fs::canonicalize(path).with_context(|| format!("Cannot resolve {path}"))
}
