//! IPC Transport Layer
//!
//! Length-prefixed bincode frames over Unix domain sockets. Every frame is a
//! little-endian `u32` length followed by the serialized message.

use crate::messages::{Event, Request};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::{timeout, Duration};
use tracing::debug;

/// Result type for IPC operations
pub type IpcResult<T> = Result<T, IpcError>;

/// Error type for IPC operations
#[derive(Error, Debug)]
pub enum IpcError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),
}

/// Framing limits shared by both ends of a connection.
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    /// Upper bound for writing a single frame
    pub write_timeout: Duration,
    /// Largest payload accepted when reading
    pub max_frame_bytes: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(5),
            max_frame_bytes: 1024 * 1024,
        }
    }
}

/// Serialize `message` and write it as a single frame.
pub async fn write_frame<W, M>(
    writer: &mut W,
    message: &M,
    options: &TransportOptions,
) -> IpcResult<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let data = bincode::serialize(message)?;
    if data.len() > u32::MAX as usize {
        return Err(IpcError::Protocol(format!(
            "Message too large: {} bytes",
            data.len()
        )));
    }

    let mut frame = Vec::with_capacity(4 + data.len());
    frame.extend_from_slice(&(data.len() as u32).to_le_bytes());
    frame.extend_from_slice(&data);

    match timeout(options.write_timeout, writer.write_all(&frame)).await {
        Ok(result) => result?,
        Err(_) => return Err(IpcError::Timeout("Write operation timed out".to_string())),
    };
    Ok(())
}

/// Read one frame and deserialize it.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly between frames.
pub async fn read_frame<R, M>(reader: &mut R, options: &TransportOptions) -> IpcResult<Option<M>>
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    let read = reader.read(&mut len_buf).await?;
    if read == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut len_buf[read..]).await?;

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > options.max_frame_bytes {
        return Err(IpcError::Protocol(format!(
            "Message too large: {} bytes (limit {})",
            len, options.max_frame_bytes
        )));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;

    Ok(Some(bincode::deserialize(&data)?))
}

/// Client side of the account IPC protocol
#[async_trait]
pub trait IpcTransport: Send + Sync {
    /// Send a request to the account service
    async fn send_request(&mut self, request: &Request) -> IpcResult<()>;

    /// Receive the next event pushed by the account service
    async fn receive_event(&mut self) -> IpcResult<Option<Event>>;

    /// Close the connection
    async fn close(&mut self) -> IpcResult<()>;
}

/// Unix Domain Socket client connected to the account service
pub struct AccountClient {
    stream: UnixStream,
    options: TransportOptions,
    /// Set when a read was abandoned, possibly mid-frame
    poisoned: bool,
}

impl AccountClient {
    /// Connect to the account service listening on `path`
    pub async fn connect<P: AsRef<Path>>(path: P, options: TransportOptions) -> IpcResult<Self> {
        let stream = UnixStream::connect(path.as_ref()).await.map_err(|e| {
            IpcError::Connection(format!(
                "Failed to connect to {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Ok(Self {
            stream,
            options,
            poisoned: false,
        })
    }

    /// Receive the next event, giving up after `wait`.
    ///
    /// A timed-out read may have consumed part of a frame, so the client is
    /// unusable afterwards: every later send or receive fails and the caller
    /// has to reconnect.
    pub async fn receive_event_timeout(&mut self, wait: Duration) -> IpcResult<Option<Event>> {
        match timeout(wait, self.receive_event()).await {
            Ok(result) => result,
            Err(_) => {
                self.poisoned = true;
                Err(IpcError::Timeout(format!(
                    "No event received within {:?}",
                    wait
                )))
            }
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn ensure_usable(&self) -> IpcResult<()> {
        if self.poisoned {
            return Err(IpcError::Connection(
                "Connection abandoned after a timed-out read".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl IpcTransport for AccountClient {
    async fn send_request(&mut self, request: &Request) -> IpcResult<()> {
        self.ensure_usable()?;
        write_frame(&mut self.stream, request, &self.options).await
    }

    async fn receive_event(&mut self) -> IpcResult<Option<Event>> {
        self.ensure_usable()?;
        read_frame(&mut self.stream, &self.options).await
    }

    async fn close(&mut self) -> IpcResult<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

/// Account service Unix Domain Socket listener
pub struct IpcListener {
    listener: UnixListener,
    socket_path: PathBuf,
    options: TransportOptions,
}

impl IpcListener {
    /// Bind a listener at `path`, replacing a stale socket file.
    pub fn bind<P: AsRef<Path>>(path: P, options: TransportOptions) -> IpcResult<Self> {
        let path = path.as_ref();

        if path.exists() {
            std::fs::remove_file(path).map_err(|e| {
                IpcError::Connection(format!("Failed to remove existing socket: {}", e))
            })?;
        }

        let listener = UnixListener::bind(path)
            .map_err(|e| IpcError::Connection(format!("Failed to bind to socket: {}", e)))?;

        // rw-rw----
        {
            use std::os::unix::fs::PermissionsExt;
            let mut permissions = std::fs::metadata(path)?.permissions();
            permissions.set_mode(0o660);
            std::fs::set_permissions(path, permissions).map_err(|e| {
                IpcError::Connection(format!("Failed to set socket permissions: {}", e))
            })?;
        }

        debug!(socket = %path.display(), "IPC listener bound");
        Ok(Self {
            listener,
            socket_path: path.to_path_buf(),
            options,
        })
    }

    /// Accept a new connection
    pub async fn accept(&self) -> IpcResult<IpcConnection> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(|e| IpcError::Connection(format!("Failed to accept connection: {}", e)))?;

        Ok(IpcConnection {
            stream,
            options: self.options,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }
}

impl Drop for IpcListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Server side of an accepted connection
pub struct IpcConnection {
    stream: UnixStream,
    options: TransportOptions,
}

impl IpcConnection {
    /// Split the connection so requests and events can flow independently.
    pub fn into_split(self) -> (RequestReader, EventWriter) {
        let (read, write) = self.stream.into_split();
        (
            RequestReader {
                half: read,
                options: self.options,
            },
            EventWriter {
                half: write,
                options: self.options,
            },
        )
    }
}

/// Reading half of a server connection
pub struct RequestReader {
    half: OwnedReadHalf,
    options: TransportOptions,
}

impl RequestReader {
    /// Next request from the peer, `None` once it disconnected.
    pub async fn next_request(&mut self) -> IpcResult<Option<Request>> {
        read_frame(&mut self.half, &self.options).await
    }
}

/// Writing half of a server connection
pub struct EventWriter {
    half: OwnedWriteHalf,
    options: TransportOptions,
}

impl EventWriter {
    pub async fn send_event(&mut self, event: &Event) -> IpcResult<()> {
        write_frame(&mut self.half, event, &self.options).await
    }

    pub async fn shutdown(&mut self) -> IpcResult<()> {
        self.half.shutdown().await?;
        Ok(())
    }
}
