//! Local voice event server.
//!
//! The AT voice integration connects over a Unix socket (macOS) or a named
//! pipe (Windows), writes a single `<kind>:<payload>` packet and closes the
//! connection. Each packet becomes a [`VoiceEvent`] on a broadcast channel.

#[cfg(windows)]
mod pipe;
#[cfg(unix)]
mod unix;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::platform::Platform;

pub const DEFAULT_SOCKET_PATH: &str = "/usr/local/var/at_driver_generic/driver.socket";
pub const DEFAULT_PIPE_NAME: &str = r"\\?\pipe\my_pipe";

const EVENT_CHANNEL_CAPACITY: usize = 256;
const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VoiceEventKind {
    Lifecycle,
    Speech,
    InternalError,
}

impl VoiceEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            VoiceEventKind::Lifecycle => "lifecycle",
            VoiceEventKind::Speech => "speech",
            VoiceEventKind::InternalError => "internalError",
        }
    }

    fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "lifecycle" => Some(VoiceEventKind::Lifecycle),
            "speech" => Some(VoiceEventKind::Speech),
            "internalError" => Some(VoiceEventKind::InternalError),
            _ => None,
        }
    }
}

impl fmt::Display for VoiceEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "event")]
pub struct VoiceEvent {
    pub name: VoiceEventKind,
    pub data: String,
}

impl VoiceEvent {
    /// Classify a raw packet. Anything that is not `<kind>:<single line>`
    /// is reported as an internal error carrying the raw text.
    pub fn parse(raw: &str) -> Self {
        let parsed = raw.split_once(':').and_then(|(kind, payload)| {
            let kind = VoiceEventKind::from_wire(kind)?;
            (!payload.contains(['\n', '\r', '\u{2028}', '\u{2029}'])).then(|| VoiceEvent {
                name: kind,
                data: payload.to_string(),
            })
        });
        parsed.unwrap_or_else(|| Self::internal_error(raw))
    }

    pub fn internal_error(data: impl Into<String>) -> Self {
        Self {
            name: VoiceEventKind::InternalError,
            data: data.into(),
        }
    }
}

/// Where the voice server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceEndpoint {
    UnixSocket(PathBuf),
    NamedPipe(String),
}

impl VoiceEndpoint {
    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::MacOs => VoiceEndpoint::UnixSocket(PathBuf::from(DEFAULT_SOCKET_PATH)),
            Platform::Windows => VoiceEndpoint::NamedPipe(DEFAULT_PIPE_NAME.to_string()),
        }
    }

    /// Interpret a user-supplied location the way `platform` addresses
    /// local endpoints.
    pub fn from_location(platform: Platform, location: &str) -> Self {
        match platform {
            Platform::MacOs => VoiceEndpoint::UnixSocket(PathBuf::from(location)),
            Platform::Windows => VoiceEndpoint::NamedPipe(location.to_string()),
        }
    }
}

impl fmt::Display for VoiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoiceEndpoint::UnixSocket(path) => write!(f, "unix:{}", path.display()),
            VoiceEndpoint::NamedPipe(name) => write!(f, "pipe:{name}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VoiceOptions {
    /// Longest pause tolerated between two reads of one packet.
    pub read_timeout: Duration,
    pub max_packet_bytes: usize,
}

impl Default for VoiceOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            max_packet_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum VoiceServerError {
    #[error("failed to prepare {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to listen on {endpoint}: {source}")]
    Listen {
        endpoint: VoiceEndpoint,
        #[source]
        source: std::io::Error,
    },
    #[error("endpoint {0} is not supported on this host")]
    UnsupportedEndpoint(VoiceEndpoint),
    #[error("voice server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A running voice server.
pub struct VoiceServer {
    endpoint: VoiceEndpoint,
    events: broadcast::Sender<VoiceEvent>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl VoiceServer {
    /// Start listening. Resolves once the endpoint accepts connections.
    pub async fn listen(
        endpoint: VoiceEndpoint,
        options: VoiceOptions,
    ) -> Result<Self, VoiceServerError> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown, shutdown_rx) = oneshot::channel();

        let task = match &endpoint {
            #[cfg(unix)]
            VoiceEndpoint::UnixSocket(path) => {
                let listener = unix::bind(path).await?;
                tokio::spawn(unix::serve(listener, events.clone(), options, shutdown_rx))
            }
            #[cfg(windows)]
            VoiceEndpoint::NamedPipe(name) => {
                let first = pipe::create_instance(name, true).map_err(|source| {
                    VoiceServerError::Listen {
                        endpoint: endpoint.clone(),
                        source,
                    }
                })?;
                tokio::spawn(pipe::serve(
                    name.clone(),
                    first,
                    events.clone(),
                    options,
                    shutdown_rx,
                ))
            }
            #[allow(unreachable_patterns)]
            other => return Err(VoiceServerError::UnsupportedEndpoint(other.clone())),
        };

        info!(endpoint = %endpoint, "voice server listening");
        Ok(Self {
            endpoint,
            events,
            shutdown,
            task,
        })
    }

    pub fn endpoint(&self) -> &VoiceEndpoint {
        &self.endpoint
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VoiceEvent> {
        self.events.subscribe()
    }

    /// Stop accepting connections and remove the socket file, if any.
    pub async fn shutdown(self) -> Result<(), VoiceServerError> {
        let _ = self.shutdown.send(());
        self.task.await?;
        if let VoiceEndpoint::UnixSocket(path) = &self.endpoint {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!(path = %path.display(), "removed voice socket"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(VoiceServerError::Prepare {
                        path: path.clone(),
                        source,
                    })
                }
            }
        }
        info!(endpoint = %self.endpoint, "voice server stopped");
        Ok(())
    }
}

/// A packet that ended before EOF, with whatever had arrived.
#[derive(Debug)]
pub(crate) struct IncompletePacket {
    pub partial: String,
    pub reason: String,
}

/// Read one packet: everything up to EOF, decoded lossily as UTF-8.
pub(crate) async fn read_packet<R>(
    reader: &mut R,
    options: &VoiceOptions,
) -> Result<String, IncompletePacket>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    let incomplete = |buf: &[u8], reason: String| IncompletePacket {
        partial: String::from_utf8_lossy(buf).into_owned(),
        reason,
    };

    loop {
        let read = match tokio::time::timeout(options.read_timeout, reader.read(&mut chunk)).await
        {
            Ok(Ok(0)) => return Ok(String::from_utf8_lossy(&buf).into_owned()),
            Ok(Ok(read)) => read,
            Ok(Err(err)) => return Err(incomplete(&buf, err.to_string())),
            Err(_) => {
                return Err(incomplete(
                    &buf,
                    format!("no data for {:?}", options.read_timeout),
                ))
            }
        };
        let room = options.max_packet_bytes.saturating_sub(buf.len());
        if read > room {
            buf.extend_from_slice(&chunk[..room]);
            return Err(incomplete(
                &buf,
                format!("packet exceeds {} bytes", options.max_packet_bytes),
            ));
        }
        buf.extend_from_slice(&chunk[..read]);
    }
}

/// Read a packet from one connection and publish the resulting event.
pub(crate) async fn handle_connection<R>(
    reader: &mut R,
    events: &broadcast::Sender<VoiceEvent>,
    options: &VoiceOptions,
) where
    R: AsyncRead + Unpin,
{
    let event = match read_packet(reader, options).await {
        Ok(raw) => VoiceEvent::parse(&raw),
        Err(IncompletePacket { partial, reason }) => {
            warn!(reason = %reason, "voice packet incomplete");
            VoiceEvent::internal_error(partial)
        }
    };
    publish(events, event);
}

fn publish(events: &broadcast::Sender<VoiceEvent>, event: VoiceEvent) {
    counter!("at_driver_voice_events_total", 1, "kind" => event.name.as_str());
    debug!(kind = %event.name, data = %event.data, "voice event received");
    if events.send(event).is_err() {
        debug!("no voice event subscribers");
    }
}
