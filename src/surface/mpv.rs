//! mpv embedded into the desktop window
//!
//! mpv renders into the surface via `--wid` and is controlled through its JSON
//! IPC socket.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::{Value, json};
use std::ffi::OsString;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::LoopPlayer;
use crate::config::SurfaceConfig;
use crate::error::SurfaceError;
use crate::volume::Volume;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const IPC_TIMEOUT: Duration = Duration::from_millis(500);

/// Command line for looping `path` into window `wid`
pub fn mpv_args(
    config: &SurfaceConfig,
    wid: u32,
    path: &Path,
    volume: Volume,
    socket: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = [
        format!("--wid={wid}"),
        "--loop-file=inf".to_string(),
        "--keepaspect=yes".to_string(),
        "--panscan=0".to_string(),
        format!("--volume={}", volume.percent()),
        format!("--hwdec={}", config.hwdec),
        "--no-input-default-bindings".to_string(),
        "--input-vo-keyboard=no".to_string(),
        "--no-osc".to_string(),
        "--osd-level=0".to_string(),
        "--no-terminal".to_string(),
        "--really-quiet".to_string(),
        "--force-window=yes".to_string(),
        "--background=color".to_string(),
        "--background-color=#000000".to_string(),
    ]
    .into_iter()
    .map(OsString::from)
    .collect();

    let mut ipc = OsString::from("--input-ipc-server=");
    ipc.push(socket.as_os_str());
    args.push(ipc);

    args.extend(config.extra_args.iter().map(OsString::from));

    // Everything after -- is a file, even names starting with a dash
    args.push(OsString::from("--"));
    args.push(path.as_os_str().to_owned());
    args
}

/// A running mpv loop
#[derive(Debug)]
pub struct MpvLoop {
    child: Child,
    socket: PathBuf,
    stop_timeout: Duration,
    stopped: bool,
}

impl MpvLoop {
    /// Spawn mpv and wait until its IPC socket answers
    pub fn start(
        config: &SurfaceConfig,
        wid: u32,
        path: &Path,
        volume: Volume,
        socket: PathBuf,
    ) -> Result<Self, SurfaceError> {
        // Leftover from a crashed player would satisfy the readiness check
        let _ = std::fs::remove_file(&socket);

        let child = Command::new(&config.player)
            .args(mpv_args(config, wid, path, volume, &socket))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SurfaceError::Player(format!("failed to start {}: {}", config.player, e)))?;

        let mut player = Self {
            child,
            socket,
            stop_timeout: Duration::from_millis(config.stop_timeout_ms),
            stopped: false,
        };

        let deadline = Instant::now() + Duration::from_millis(config.startup_timeout_ms);
        loop {
            match player.child.try_wait() {
                Ok(Some(status)) => {
                    player.stop();
                    return Err(SurfaceError::Decode {
                        path: path.to_path_buf(),
                        reason: format!("player exited with {status}"),
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    player.stop();
                    return Err(SurfaceError::Player(e.to_string()));
                }
            }

            if UnixStream::connect(&player.socket).is_ok() {
                info!("mpv (pid {}) playing {:?}", player.child.id(), path);
                return Ok(player);
            }

            if Instant::now() >= deadline {
                player.stop();
                return Err(SurfaceError::Player(format!(
                    "{} did not become ready within {}ms",
                    config.player, config.startup_timeout_ms
                )));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Send one IPC command and wait for its reply line
    fn command(&self, command: Value) -> Result<(), SurfaceError> {
        let ipc_err = |e: std::io::Error| SurfaceError::Player(format!("mpv IPC: {e}"));

        let mut stream = UnixStream::connect(&self.socket).map_err(ipc_err)?;
        stream.set_read_timeout(Some(IPC_TIMEOUT)).map_err(ipc_err)?;
        stream.set_write_timeout(Some(IPC_TIMEOUT)).map_err(ipc_err)?;

        let mut line = json!({ "command": command, "request_id": 1 }).to_string();
        line.push('\n');
        stream.write_all(line.as_bytes()).map_err(ipc_err)?;

        // mpv may interleave events; the reply is the line carrying our id
        let mut reader = BufReader::new(stream);
        let mut buf = String::new();
        loop {
            buf.clear();
            if reader.read_line(&mut buf).map_err(ipc_err)? == 0 {
                return Err(SurfaceError::Player("mpv closed the IPC socket".to_string()));
            }
            let Ok(reply) = serde_json::from_str::<Value>(&buf) else {
                continue;
            };
            if reply.get("request_id").and_then(Value::as_i64) != Some(1) {
                continue;
            }
            return match reply.get("error").and_then(Value::as_str) {
                Some("success") => Ok(()),
                Some(other) => Err(SurfaceError::Player(format!("mpv: {other}"))),
                None => Err(SurfaceError::Player("malformed mpv reply".to_string())),
            };
        }
    }

    fn wait_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(_)) => return true,
                Ok(None) if Instant::now() < deadline => std::thread::sleep(POLL_INTERVAL),
                Ok(None) => return false,
                Err(e) => {
                    warn!("Failed to poll mpv: {}", e);
                    return false;
                }
            }
        }
    }
}

impl LoopPlayer for MpvLoop {
    fn set_volume(&mut self, volume: Volume) -> Result<(), SurfaceError> {
        self.command(json!(["set_property", "volume", volume.percent()]))
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        let pid = self.child.id();
        if let Err(e) = self.command(json!(["quit"])) {
            debug!("mpv quit over IPC failed: {}", e);
        }

        if !self.wait_exit(self.stop_timeout) {
            debug!("mpv (pid {}) ignored quit, sending SIGTERM", pid);
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

            if !self.wait_exit(self.stop_timeout) {
                warn!("mpv (pid {}) ignored SIGTERM, killing", pid);
                let _ = self.child.kill();
            }
        }
        // Reap
        let _ = self.child.wait();

        if let Err(e) = std::fs::remove_file(&self.socket) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove mpv socket {:?}: {}", self.socket, e);
            }
        }
        debug!("mpv (pid {}) stopped", pid);
    }
}

impl Drop for MpvLoop {
    fn drop(&mut self) {
        self.stop();
    }
}
