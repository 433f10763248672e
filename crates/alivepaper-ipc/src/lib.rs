//! alivepaper IPC Protocol
//!
//! Shared message types for communication between the `alivepaper` daemon
//! (which owns the wallpaper surface) and its clients (CLI, settings UIs).

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest frame either side accepts
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Socket path for IPC communication
pub fn socket_path() -> std::path::PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .unwrap_or_else(|_| format!("/run/user/{}", unsafe { libc::getuid() }));
    std::path::PathBuf::from(runtime_dir).join("alivepaper.sock")
}

// ============================================================================
// Client → Daemon Requests
// ============================================================================

/// Requests sent from a client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// A file the user just picked; volume is normalized 0.0..=1.0
    Select { path: String, volume: f32 },

    /// Reapply an entry from history with its stored volume
    Apply { path: String },

    /// Change the live volume
    SetVolume { volume: f32 },

    /// Tear down the live surface
    Clear,

    /// Query the surface state
    Status,

    /// List accessible history, most recent first
    History,

    /// Acknowledged with `Ok`, then `Event` frames until the connection closes
    Subscribe,
}

// ============================================================================
// Daemon → Client Responses
// ============================================================================

/// Responses sent from the daemon to a client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Ok,

    Status {
        active: bool,
        path: Option<String>,
        volume: Option<f32>,
    },

    History { entries: Vec<HistoryEntry> },

    /// Pushed to subscribers
    Event { event: WallpaperEvent },

    Error { message: String },
}

/// One history row as exposed to UIs (thumbnails, labels)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub path: String,
    pub display_name: String,
    /// Milliseconds since the Unix epoch (UTC)
    pub last_used_at: i64,
    pub volume: f32,
}

/// Change notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WallpaperEvent {
    /// The live wallpaper changed
    SelectionChanged { path: String, volume: f32 },

    /// The stored history changed; reload it
    HistoryChanged,
}

// ============================================================================
// Message Framing
// ============================================================================

/// A framed message with length prefix for reliable socket reads
#[derive(Debug)]
pub struct FramedMessage {
    pub data: Vec<u8>,
}

impl FramedMessage {
    /// Create a new framed message from serializable data
    pub fn new<T: Serialize>(msg: &T) -> anyhow::Result<Self> {
        let data = serde_json::to_vec(msg)?;
        Ok(Self { data })
    }

    /// Encode message with length prefix (4 bytes, big-endian)
    pub fn encode(&self) -> Vec<u8> {
        let len = self.data.len() as u32;
        let mut buf = Vec::with_capacity(4 + self.data.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Decode a request from bytes
    pub fn decode_request(data: &[u8]) -> anyhow::Result<Request> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Decode a response from bytes
    pub fn decode_response(data: &[u8]) -> anyhow::Result<Response> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Read one length-prefixed frame. `Ok(None)` means the peer closed cleanly.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> anyhow::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        anyhow::bail!("Message too large: {} bytes", len);
    }

    let mut msg_buf = vec![0u8; len];
    reader.read_exact(&mut msg_buf).await?;
    Ok(Some(msg_buf))
}

/// Serialize and write one frame
pub async fn write_frame<W: AsyncWrite + Unpin, T: Serialize>(writer: &mut W, msg: &T) -> anyhow::Result<()> {
    let encoded = FramedMessage::new(msg)?.encode();
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_request() {
        let req = Request::Select {
            path: "/videos/beach.mp4".into(),
            volume: 0.7,
        };

        let msg = FramedMessage::new(&req).unwrap();
        let decoded = FramedMessage::decode_request(&msg.data).unwrap();

        match decoded {
            Request::Select { path, volume } => {
                assert_eq!(path, "/videos/beach.mp4");
                assert_eq!(volume, 0.7);
            }
            _ => panic!("Wrong request type"),
        }
    }

    #[test]
    fn test_event_payload_shape() {
        let resp = Response::Event {
            event: WallpaperEvent::HistoryChanged,
        };
        let json: serde_json::Value = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["type"], "Event");
        assert_eq!(json["event"]["type"], "HistoryChanged");
    }

    #[tokio::test]
    async fn test_frames_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        write_frame(&mut client, &Request::Status).await.unwrap();
        write_frame(&mut client, &Request::Clear).await.unwrap();
        drop(client);

        let first = read_frame(&mut server).await.unwrap().unwrap();
        assert!(matches!(FramedMessage::decode_request(&first).unwrap(), Request::Status));
        let second = read_frame(&mut server).await.unwrap().unwrap();
        assert!(matches!(FramedMessage::decode_request(&second).unwrap(), Request::Clear));
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let len = (MAX_FRAME_LEN as u32 + 1).to_be_bytes();
        client.write_all(&len).await.unwrap();

        assert!(read_frame(&mut server).await.is_err());
    }
}
