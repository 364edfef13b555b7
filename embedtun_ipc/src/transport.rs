//! Control Socket Transport
//!
//! This module provides the Unix Domain Socket listener that a live tunnel
//! exposes for control connections, the server-side connection type, and a
//! client used by tools and tests.

use crate::messages::{ConfigLine, ControlRequest, ControlResponse};
use log::{debug, warn};
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::{timeout, Duration};

/// Largest message accepted in either direction
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// I/O timeout applied by [`ControlClient`]
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Result type for IPC operations
pub type IpcResult<T> = Result<T, IpcError>;

/// Error type for IPC operations
#[derive(Error, Debug)]
pub enum IpcError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Interface name cannot be used as a socket file name
    #[error("Invalid interface name: {0:?}")]
    InvalidName(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation line other than get or set
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),
}

/// Path of the control socket for `interface` inside `dir`
pub fn socket_path<P: AsRef<Path>>(dir: P, interface: &str) -> PathBuf {
    dir.as_ref().join(format!("{}.sock", interface))
}

fn validate_interface_name(interface: &str) -> IpcResult<()> {
    if interface.is_empty()
        || interface == "."
        || interface == ".."
        || interface.contains('/')
        || interface.contains('\0')
    {
        return Err(IpcError::InvalidName(interface.to_string()));
    }
    Ok(())
}

/// Read one message: lines up to the terminating empty line.
///
/// Returns `None` when the peer closed the stream before sending anything.
async fn read_message<R>(reader: &mut R) -> IpcResult<Option<Vec<String>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = Vec::new();
    let mut total = 0usize;

    loop {
        let budget = (MAX_MESSAGE_SIZE - total) as u64 + 1;
        let mut line = String::new();
        let read = (&mut *reader).take(budget).read_line(&mut line).await?;

        if read == 0 {
            if lines.is_empty() {
                return Ok(None);
            }
            return Err(IpcError::Protocol(
                "Connection closed in the middle of a message".to_string(),
            ));
        }

        total += read;
        if total > MAX_MESSAGE_SIZE {
            return Err(IpcError::Protocol(format!(
                "Message too large: more than {} bytes",
                MAX_MESSAGE_SIZE
            )));
        }

        let line = line.trim_end_matches('\n').trim_end_matches('\r');
        if line.is_empty() {
            return Ok(Some(lines));
        }
        lines.push(line.to_string());
    }
}

/// Listener for one interface's control socket
pub struct ControlListener {
    listener: UnixListener,
    socket_path: PathBuf,
    interface: String,
    /// (device, inode) of the socket file this listener created
    identity: Option<(u64, u64)>,
}

impl std::fmt::Debug for ControlListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlListener")
            .field("socket_path", &self.socket_path)
            .field("interface", &self.interface)
            .finish()
    }
}

impl ControlListener {
    /// Bind the control socket for `interface` inside `dir`.
    ///
    /// Creates `dir` if needed and replaces a stale socket file left behind by
    /// a previous process.
    pub async fn bind<P: AsRef<Path>>(dir: P, interface: &str) -> IpcResult<Self> {
        validate_interface_name(interface)?;

        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| {
            IpcError::Connection(format!(
                "Failed to create socket directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let path = socket_path(dir, interface);

        // Remove the socket file if it already exists
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| {
                IpcError::Connection(format!("Failed to remove existing socket: {}", e))
            })?;
        }

        let listener = UnixListener::bind(&path)
            .map_err(|e| IpcError::Connection(format!("Failed to bind to socket: {}", e)))?;

        let metadata = std::fs::symlink_metadata(&path).map_err(|e| {
            IpcError::Connection(format!("Failed to get socket metadata: {}", e))
        })?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o600);
        std::fs::set_permissions(&path, permissions).map_err(|e| {
            IpcError::Connection(format!("Failed to set socket permissions: {}", e))
        })?;

        debug!("Control socket for {} bound at {}", interface, path.display());

        Ok(Self {
            listener,
            socket_path: path,
            interface: interface.to_string(),
            identity: Some((metadata.dev(), metadata.ino())),
        })
    }

    /// Accept a new control connection
    pub async fn accept(&self) -> IpcResult<ControlConnection> {
        let (stream, _) = self.listener.accept().await?;

        let peer_uid = stream.peer_cred().ok().map(|cred| cred.uid());
        debug!(
            "Accepted control connection on {} (peer UID={:?})",
            self.interface, peer_uid
        );

        Ok(ControlConnection {
            stream: BufReader::new(stream),
            peer_uid,
        })
    }

    /// Path of the socket file
    pub fn path(&self) -> &Path {
        &self.socket_path
    }

    /// Interface this listener serves
    pub fn interface(&self) -> &str {
        &self.interface
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        // A newer listener for the same interface may have replaced our file
        let still_ours = match (std::fs::symlink_metadata(&self.socket_path), self.identity) {
            (Ok(metadata), Some((dev, ino))) => metadata.dev() == dev && metadata.ino() == ino,
            _ => false,
        };

        if still_ours {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    "Failed to remove control socket {}: {}",
                    self.socket_path.display(),
                    e
                );
            }
        }
    }
}

/// Server side of an accepted control connection
pub struct ControlConnection {
    stream: BufReader<UnixStream>,
    peer_uid: Option<u32>,
}

impl ControlConnection {
    /// UID of the connected process, when the platform reports it
    pub fn peer_uid(&self) -> Option<u32> {
        self.peer_uid
    }

    /// Receive the next request.
    ///
    /// Returns `Ok(None)` when the client closed the connection between
    /// requests.
    pub async fn receive_request(&mut self) -> IpcResult<Option<ControlRequest>> {
        match read_message(&mut self.stream).await? {
            Some(lines) => ControlRequest::from_lines(&lines).map(Some),
            None => Ok(None),
        }
    }

    /// Send a response
    pub async fn send_response(&mut self, response: &ControlResponse) -> IpcResult<()> {
        let encoded = response.encode();
        if encoded.len() > MAX_MESSAGE_SIZE {
            return Err(IpcError::Protocol(format!(
                "Response too large: {} bytes",
                encoded.len()
            )));
        }
        self.stream.write_all(encoded.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Close the connection
    pub async fn close(&mut self) -> IpcResult<()> {
        self.stream.shutdown().await.map_err(IpcError::Io)?;
        Ok(())
    }
}

/// Client for a tunnel's control socket
pub struct ControlClient {
    stream: BufReader<UnixStream>,
}

impl ControlClient {
    /// Connect to the control socket at `path`
    pub async fn connect<P: AsRef<Path>>(path: P) -> IpcResult<Self> {
        let stream = match timeout(CLIENT_TIMEOUT, UnixStream::connect(path.as_ref())).await {
            Ok(result) => result.map_err(|e| {
                IpcError::Connection(format!(
                    "Failed to connect to {}: {}",
                    path.as_ref().display(),
                    e
                ))
            })?,
            Err(_) => return Err(IpcError::Timeout("Connect timed out".to_string())),
        };

        Ok(Self {
            stream: BufReader::new(stream),
        })
    }

    /// Connect to the control socket of `interface` inside `dir`
    pub async fn connect_interface<P: AsRef<Path>>(dir: P, interface: &str) -> IpcResult<Self> {
        validate_interface_name(interface)?;
        Self::connect(socket_path(dir, interface)).await
    }

    /// Send a request and wait for its response
    pub async fn request(&mut self, request: &ControlRequest) -> IpcResult<ControlResponse> {
        let encoded = request.encode();

        match timeout(CLIENT_TIMEOUT, self.stream.write_all(encoded.as_bytes())).await {
            Ok(result) => result.map_err(IpcError::Io)?,
            Err(_) => return Err(IpcError::Timeout("Write operation timed out".to_string())),
        };

        let lines = match timeout(CLIENT_TIMEOUT, read_message(&mut self.stream)).await {
            Ok(result) => result?,
            Err(_) => return Err(IpcError::Timeout("Read operation timed out".to_string())),
        };

        match lines {
            Some(lines) => ControlResponse::from_lines(&lines),
            None => Err(IpcError::Connection(
                "Connection closed before a response arrived".to_string(),
            )),
        }
    }

    /// Fetch the tunnel's configuration
    pub async fn get(&mut self) -> IpcResult<ControlResponse> {
        self.request(&ControlRequest::Get).await
    }

    /// Apply configuration lines
    pub async fn set(&mut self, lines: Vec<ConfigLine>) -> IpcResult<ControlResponse> {
        self.request(&ControlRequest::Set(lines)).await
    }

    /// Close the connection
    pub async fn close(&mut self) -> IpcResult<()> {
        self.stream.shutdown().await.map_err(IpcError::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ERRNO_PROTOCOL;
    use tempfile::tempdir;

    #[tokio::test]
    async fn client_and_listener_exchange_messages() {
        let dir = tempdir().unwrap();
        let listener = ControlListener::bind(dir.path(), "wg0").await.unwrap();
        assert_eq!(listener.path(), socket_path(dir.path(), "wg0"));

        let server = tokio::spawn(async move {
            let mut connection = listener.accept().await.unwrap();
            let request = connection.receive_request().await.unwrap();
            assert_eq!(request, Some(ControlRequest::Get));
            connection
                .send_response(&ControlResponse::ok(vec![ConfigLine::new(
                    "listen_port",
                    "51820",
                )]))
                .await
                .unwrap();

            // Client hangs up between requests
            assert_eq!(connection.receive_request().await.unwrap(), None);
        });

        let mut client = ControlClient::connect_interface(dir.path(), "wg0")
            .await
            .unwrap();
        let response = client.get().await.unwrap();
        assert!(response.is_ok());
        assert_eq!(response.value("listen_port"), Some("51820"));
        client.close().await.unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_operation_surfaces_as_error() {
        let dir = tempdir().unwrap();
        let listener = ControlListener::bind(dir.path(), "wg1").await.unwrap();
        let path = listener.path().to_path_buf();

        let server = tokio::spawn(async move {
            let mut connection = listener.accept().await.unwrap();
            match connection.receive_request().await {
                Err(IpcError::UnknownOperation(_)) => connection
                    .send_response(&ControlResponse::error(ERRNO_PROTOCOL))
                    .await
                    .unwrap(),
                other => panic!("unexpected request: {:?}", other),
            }
        });

        let mut stream = UnixStream::connect(&path).await.unwrap();
        stream.write_all(b"bogus=1\n\n").await.unwrap();
        let mut reader = BufReader::new(stream);
        let lines = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(lines, vec!["errno=-71".to_string()]);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn drop_removes_socket_file() {
        let dir = tempdir().unwrap();
        let listener = ControlListener::bind(dir.path(), "wg2").await.unwrap();
        let path = listener.path().to_path_buf();
        assert!(path.exists());

        drop(listener);
        assert!(!path.exists());
        assert!(ControlClient::connect(&path).await.is_err());
    }

    #[tokio::test]
    async fn stale_listener_does_not_unlink_replacement() {
        let dir = tempdir().unwrap();
        let old = ControlListener::bind(dir.path(), "wg3").await.unwrap();
        let new = ControlListener::bind(dir.path(), "wg3").await.unwrap();

        drop(old);
        assert!(new.path().exists());

        let path = new.path().to_path_buf();
        drop(new);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn rejects_names_that_escape_the_directory() {
        let dir = tempdir().unwrap();
        for name in ["", "..", "a/b"] {
            let result = ControlListener::bind(dir.path(), name).await;
            assert!(matches!(result, Err(IpcError::InvalidName(_))), "{:?}", name);
        }
    }

    #[tokio::test]
    async fn oversized_message_is_rejected() {
        let payload = format!("set=1\nkey={}\n\n", "x".repeat(MAX_MESSAGE_SIZE));
        let mut reader = BufReader::new(payload.as_bytes());
        let result = read_message(&mut reader).await;
        assert!(matches!(result, Err(IpcError::Protocol(_))));
    }
}
