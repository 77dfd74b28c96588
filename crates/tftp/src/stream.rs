//! Local byte sources and sinks
//!
//! A transfer reads from a [`Source`] (PUT, server GET) or writes into a
//! [`Sink`] (GET, server PUT). Both are plain tokio I/O objects with a couple
//! of hooks the transfer calls back into: the sink learns the total size once
//! it is negotiated, and either side is told when the transfer fails so it
//! can discard partial state.

use std::fmt;
use std::io::{self, Cursor};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use async_trait::async_trait;
use md5::Md5;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Error;

/// Bytes flowing out to the peer
#[async_trait]
pub trait Source: AsyncRead + Unpin + Send {
    /// The transfer failed; release whatever the source holds
    async fn abort(&mut self, _err: &Error) {}
}

/// Bytes arriving from the peer
#[async_trait]
pub trait Sink: AsyncWrite + Unpin + Send {
    /// Total size announced by the peer, when known
    fn declare_size(&mut self, _size: Option<u64>) {}

    /// The transfer failed; discard partial content
    async fn abort(&mut self, _err: &Error) {}
}

impl Source for tokio::fs::File {}
impl Source for &[u8] {}
impl<T: AsRef<[u8]> + Unpin + Send> Source for Cursor<T> {}

#[async_trait]
impl<T: Source + ?Sized> Source for Box<T> {
    async fn abort(&mut self, err: &Error) {
        (**self).abort(err).await;
    }
}

impl Sink for tokio::fs::File {}
impl Sink for Vec<u8> {}

#[async_trait]
impl<T: Sink + ?Sized> Sink for Box<T> {
    fn declare_size(&mut self, size: Option<u64>) {
        (**self).declare_size(size);
    }

    async fn abort(&mut self, err: &Error) {
        (**self).abort(err).await;
    }
}

/// Content digest algorithms a GET can be checked against
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checksum {
    Md5(String),
    Sha1(String),
}

impl Checksum {
    /// Name used in error messages
    pub fn label(&self) -> &'static str {
        match self {
            Self::Md5(_) => "md5sum",
            Self::Sha1(_) => "sha1sum",
        }
    }

    pub fn expected(&self) -> &str {
        match self {
            Self::Md5(hex) | Self::Sha1(hex) => hex,
        }
    }

    fn hasher(&self) -> Hasher {
        match self {
            Self::Md5(_) => Hasher::Md5(Md5::new()),
            Self::Sha1(_) => Hasher::Sha1(Sha1::new()),
        }
    }
}

#[derive(Clone)]
enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(h) => h.update(data),
            Self::Sha1(h) => h.update(data),
        }
    }

    fn finalize_hex(&self) -> String {
        match self.clone() {
            Self::Md5(h) => hex::encode(h.finalize()),
            Self::Sha1(h) => hex::encode(h.finalize()),
        }
    }
}

/// Sink adapter that digests everything written through it
pub struct DigestSink<'a> {
    inner: &'a mut (dyn Sink + 'a),
    checksum: Checksum,
    hasher: Hasher,
}

impl fmt::Debug for DigestSink<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestSink").field("checksum", &self.checksum).finish()
    }
}

impl<'a> DigestSink<'a> {
    pub fn new(inner: &'a mut (dyn Sink + 'a), checksum: Checksum) -> Self {
        let hasher = checksum.hasher();
        Self {
            inner,
            checksum,
            hasher,
        }
    }

    /// Compare the digest of everything written with the expected one
    pub fn verify(&self) -> Result<(), Error> {
        let actual = self.hasher.finalize_hex();
        let expected = self.checksum.expected().trim();
        if actual.eq_ignore_ascii_case(expected) {
            return Ok(());
        }
        tracing::debug!("{} mismatch: expected {}, got {}", self.checksum.label(), expected, actual);
        Err(Error::Checksum(self.checksum.label()))
    }
}

impl AsyncWrite for DigestSink<'_> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = ready!(Pin::new(&mut *this.inner).poll_write(cx, buf))?;
        this.hasher.update(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_shutdown(cx)
    }
}

#[async_trait]
impl<'a> Sink for DigestSink<'a> {
    fn declare_size(&mut self, size: Option<u64>) {
        self.inner.declare_size(size);
    }

    async fn abort(&mut self, err: &Error) {
        self.inner.abort(err).await;
    }
}
