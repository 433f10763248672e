//! Controller thread and its async handle
//!
//! The backend talks to X11 and child processes synchronously, so the
//! controller lives on its own OS thread and drains a command channel in
//! order. That ordering is what serializes activate / clear / set_volume.

use std::path::PathBuf;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use super::{SurfaceBackend, SurfaceController, SurfaceStatus};
use crate::error::SurfaceError;
use crate::volume::Volume;

const COMMAND_QUEUE: usize = 32;

enum Command {
    Activate {
        path: PathBuf,
        volume: Volume,
        reply: oneshot::Sender<Result<(), SurfaceError>>,
    },
    Clear {
        reply: oneshot::Sender<()>,
    },
    SetVolume {
        volume: Volume,
        reply: oneshot::Sender<Result<Option<PathBuf>, SurfaceError>>,
    },
    Status {
        reply: oneshot::Sender<SurfaceStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable async access to the controller thread
#[derive(Debug, Clone)]
pub struct SurfaceHandle {
    tx: mpsc::Sender<Command>,
}

/// Owner of the controller thread
#[derive(Debug)]
pub struct SurfaceThread {
    join: JoinHandle<()>,
}

impl SurfaceThread {
    /// Wait for the thread after [`SurfaceHandle::shutdown`]
    pub fn join(self) {
        if self.join.join().is_err() {
            error!("Surface controller thread panicked");
        }
    }
}

/// Move `backend` onto a dedicated thread and return a handle to it
pub fn spawn<B>(backend: B) -> std::io::Result<(SurfaceHandle, SurfaceThread)>
where
    B: SurfaceBackend + Send + 'static,
{
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);

    let join = std::thread::Builder::new()
        .name("surface".to_string())
        .spawn(move || run(SurfaceController::new(backend), rx))?;

    Ok((SurfaceHandle { tx }, SurfaceThread { join }))
}

fn run<B: SurfaceBackend>(mut controller: SurfaceController<B>, mut rx: mpsc::Receiver<Command>) {
    debug!("Surface controller thread started");

    while let Some(command) = rx.blocking_recv() {
        match command {
            Command::Activate {
                path,
                volume,
                reply,
            } => {
                let _ = reply.send(controller.activate(&path, volume));
            }
            Command::Clear { reply } => {
                controller.clear();
                let _ = reply.send(());
            }
            Command::SetVolume { volume, reply } => {
                let _ = reply.send(controller.set_volume(volume));
            }
            Command::Status { reply } => {
                let _ = reply.send(controller.status());
            }
            Command::Shutdown { reply } => {
                controller.clear();
                let _ = reply.send(());
                break;
            }
        }
    }

    // Channel closed without a shutdown request: still leave the desktop clean
    controller.clear();
    info!("Surface controller stopped");
}

impl SurfaceHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SurfaceError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| SurfaceError::ControllerGone)?;
        rx.await.map_err(|_| SurfaceError::ControllerGone)
    }

    pub async fn activate(&self, path: PathBuf, volume: Volume) -> Result<(), SurfaceError> {
        self.request(|reply| Command::Activate {
            path,
            volume,
            reply,
        })
        .await?
    }

    pub async fn clear(&self) -> Result<(), SurfaceError> {
        self.request(|reply| Command::Clear { reply }).await
    }

    pub async fn set_volume(&self, volume: Volume) -> Result<Option<PathBuf>, SurfaceError> {
        self.request(|reply| Command::SetVolume { volume, reply })
            .await?
    }

    pub async fn status(&self) -> Result<SurfaceStatus, SurfaceError> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Tear down and stop the controller thread
    pub async fn shutdown(&self) -> Result<(), SurfaceError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}
