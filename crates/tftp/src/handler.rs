//! Server request listeners
//!
//! Once the server has validated a request it asks a [`RequestHandler`]
//! where the bytes come from (GET) or where they go (PUT). [`FsHandler`]
//! serves a directory tree.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::fs::{self, File};
use tokio::io::AsyncWrite;

use crate::error::{Error, ErrorKind, Result};
use crate::negotiate::Direction;
use crate::options::UserExtensions;
use crate::stream::{Sink, Source};

/// A request accepted by the server, as seen by the listener
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    /// Normalized, relative filename
    pub filename: String,
    pub direction: Direction,
    /// Size declared by a PUT through `tsize`
    pub size: Option<u64>,
    /// Opaque options the client sent
    pub user_extensions: UserExtensions,
    pub peer: SocketAddr,
}

pub struct GetResponse {
    pub source: Box<dyn Source>,
    /// Exact number of bytes `source` yields, when known
    pub size: Option<u64>,
    /// User options to acknowledge in the OACK
    pub user_extensions: UserExtensions,
}

impl GetResponse {
    pub fn new(source: Box<dyn Source>, size: Option<u64>) -> Self {
        Self {
            source,
            size,
            user_extensions: UserExtensions::new(),
        }
    }
}

impl fmt::Debug for GetResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GetResponse")
            .field("size", &self.size)
            .field("user_extensions", &self.user_extensions)
            .finish_non_exhaustive()
    }
}

pub struct PutResponse {
    pub sink: Box<dyn Sink>,
    pub user_extensions: UserExtensions,
}

impl PutResponse {
    pub fn new(sink: Box<dyn Sink>) -> Self {
        Self {
            sink,
            user_extensions: UserExtensions::new(),
        }
    }
}

impl fmt::Debug for PutResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PutResponse")
            .field("user_extensions", &self.user_extensions)
            .finish_non_exhaustive()
    }
}

/// Decides what a validated request reads or writes
///
/// An error ends the request: a [`Error::Protocol`] kind is sent to the
/// client as is, anything else as `EIO`.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn open_get(&self, req: &IncomingRequest) -> Result<GetResponse>;

    async fn open_put(&self, req: &IncomingRequest) -> Result<PutResponse>;
}

/// Map a filesystem failure onto the error taxonomy
fn fs_error(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NoEnt.into(),
        io::ErrorKind::PermissionDenied => ErrorKind::Access.into(),
        io::ErrorKind::IsADirectory => ErrorKind::IsDir.into(),
        _ => Error::Io(err),
    }
}

/// Serves files below a root directory
#[derive(Debug, Clone)]
pub struct FsHandler {
    root: PathBuf,
}

impl FsHandler {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve an existing file, refusing anything outside the root
    async fn resolve_existing(&self, filename: &str) -> Result<PathBuf> {
        let root = fs::canonicalize(&self.root).await.map_err(fs_error)?;
        let path = fs::canonicalize(root.join(filename)).await.map_err(fs_error)?;

        // Symlinks can still point outside
        if !path.starts_with(&root) {
            tracing::warn!("Path traversal attempt detected: {}", filename);
            return Err(ErrorKind::Access.into());
        }
        Ok(path)
    }

    /// Resolve the destination of a PUT, which may not exist yet
    async fn resolve_new(&self, filename: &str) -> Result<PathBuf> {
        let root = fs::canonicalize(&self.root).await.map_err(fs_error)?;
        let requested = root.join(filename);
        let name = requested.file_name().ok_or(ErrorKind::BadName)?.to_owned();
        let parent = match requested.parent() {
            Some(parent) => fs::canonicalize(parent).await.map_err(fs_error)?,
            None => root.clone(),
        };

        if !parent.starts_with(&root) {
            tracing::warn!("Path traversal attempt detected: {}", filename);
            return Err(ErrorKind::Access.into());
        }
        Ok(parent.join(name))
    }
}

#[async_trait]
impl RequestHandler for FsHandler {
    async fn open_get(&self, req: &IncomingRequest) -> Result<GetResponse> {
        let path = self.resolve_existing(&req.filename).await?;
        let meta = fs::metadata(&path).await.map_err(fs_error)?;
        if meta.is_dir() {
            return Err(ErrorKind::IsDir.into());
        }

        let file = File::open(&path).await.map_err(fs_error)?;
        tracing::debug!("Serving {} ({} bytes)", path.display(), meta.len());
        Ok(GetResponse::new(Box::new(file), Some(meta.len())))
    }

    async fn open_put(&self, req: &IncomingRequest) -> Result<PutResponse> {
        let path = self.resolve_new(&req.filename).await?;
        if fs::metadata(&path).await.is_ok_and(|m| m.is_dir()) {
            return Err(ErrorKind::IsDir.into());
        }

        let file = File::create(&path).await.map_err(fs_error)?;
        tracing::debug!("Receiving into {}", path.display());
        Ok(PutResponse::new(Box::new(FileSink { file, path })))
    }
}

/// Destination of a PUT; the partial file is removed if the transfer fails
#[derive(Debug)]
struct FileSink {
    file: File,
    path: PathBuf,
}

impl AsyncWrite for FileSink {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().file).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_shutdown(cx)
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn abort(&mut self, err: &Error) {
        tracing::debug!("Removing partial {}: {}", self.path.display(), err);
        if let Err(e) = fs::remove_file(&self.path).await {
            tracing::debug!("Failed to remove {}: {}", self.path.display(), e);
        }
    }
}
