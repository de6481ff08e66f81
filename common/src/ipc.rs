//! Short-lived local socket used to exchange one JSON payload with one
//! invocation of a user program.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use crate::error::Result;
use crate::retry::{retry, Backoff};

/// Environment variable naming the socket a program writes its results to.
pub const RESULT_SOCKET_ENV: &str = "MR_RESULT_SOCKET";
/// Environment variable naming the socket a reduce program reads its group from.
pub const INPUT_SOCKET_ENV: &str = "MR_INPUT_SOCKET";

/// Listening side of the pipe. The socket file is removed when the endpoint
/// is dropped, whichever way the owning task exits.
#[derive(Debug)]
pub struct IpcEndpoint {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcEndpoint {
    /// Binds `path`, replacing a stale socket file left by a crashed run.
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("removed stale socket {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let listener = UnixListener::bind(&path)?;
        debug!("listening on {}", path.display());
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cancel safe: no connection is lost if the returned future is dropped.
    pub async fn accept(&self) -> Result<UnixStream> {
        let (stream, _) = self.listener.accept().await?;
        Ok(stream)
    }

    /// Accepts one connection and decodes everything the peer wrote before
    /// closing it.
    pub async fn accept_payload<T: DeserializeOwned>(&self) -> Result<T> {
        read_payload(self.accept().await?).await
    }
}

pub async fn read_payload<T: DeserializeOwned>(mut stream: UnixStream) -> Result<T> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

impl Drop for IpcEndpoint {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Connects to `path`, writes `payload` and closes the write half.
pub async fn send_payload<T: Serialize + ?Sized>(path: &Path, payload: &T) -> Result<()> {
    let buf = serde_json::to_vec(payload)?;
    let mut stream = UnixStream::connect(path).await?;
    stream.write_all(&buf).await?;
    stream.shutdown().await?;
    Ok(())
}

/// Like [`send_payload`], retrying the connect while the peer is still
/// starting up.
pub async fn send_payload_with_retry<T: Serialize + ?Sized>(
    path: &Path,
    payload: &T,
    backoff: Backoff,
) -> Result<()> {
    let buf = serde_json::to_vec(payload)?;
    let target = path.display().to_string();
    let mut stream = retry(backoff, &target, |_| UnixStream::connect(path)).await?;
    stream.write_all(&buf).await?;
    stream.shutdown().await?;
    Ok(())
}
