//! Input and output collaborators for a decode session.
//!
//! The decoder only ever suspends while pulling packed bytes or pushing
//! unpacked ones. Both go through the traits here, whose methods return
//! futures. The blocking adapters wrap `std::io` types and are always ready,
//! so the same decode loop runs to completion under [`block_on`].

use std::future::Future;
use std::io::{self, Read, Write};
use std::pin::pin;
use std::task::{Context, Poll, Waker};

/// Supplier of packed bytes.
pub trait ByteSource {
    /// Fill as much of `buf` as is available. `Ok(0)` means end of input.
    fn read_into(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>>;
}

/// Consumer of unpacked bytes.
pub trait ByteSink {
    fn write_all_bytes(&mut self, data: &[u8]) -> impl Future<Output = io::Result<()>>;
}

impl<T: ByteSource + ?Sized> ByteSource for &mut T {
    fn read_into(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> {
        (**self).read_into(buf)
    }
}

impl<T: ByteSink + ?Sized> ByteSink for &mut T {
    fn write_all_bytes(&mut self, data: &[u8]) -> impl Future<Output = io::Result<()>> {
        (**self).write_all_bytes(data)
    }
}

impl ByteSink for Vec<u8> {
    async fn write_all_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }
}

impl ByteSource for &[u8] {
    async fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.len());
        let (head, tail) = self.split_at(n);
        buf[..n].copy_from_slice(head);
        *self = tail;
        Ok(n)
    }
}

/// Blocking source over any [`Read`].
pub struct ReadSource<R> {
    inner: R,
}

impl<R: Read> ReadSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> ByteSource for ReadSource<R> {
    async fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }
}

/// Blocking sink over any [`Write`].
pub struct WriteSink<W> {
    inner: W,
}

impl<W: Write> WriteSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> ByteSink for WriteSink<W> {
    async fn write_all_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data)
    }
}

/// Tokio source over any `AsyncRead`.
#[cfg(feature = "async")]
pub struct TokioSource<R> {
    inner: R,
}

#[cfg(feature = "async")]
impl<R: tokio::io::AsyncRead + Unpin> TokioSource<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[cfg(feature = "async")]
impl<R: tokio::io::AsyncRead + Unpin> ByteSource for TokioSource<R> {
    async fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        use tokio::io::AsyncReadExt;
        self.inner.read(buf).await
    }
}

/// Tokio sink over any `AsyncWrite`.
#[cfg(feature = "async")]
pub struct TokioSink<W> {
    inner: W,
}

#[cfg(feature = "async")]
impl<W: tokio::io::AsyncWrite + Unpin> TokioSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[cfg(feature = "async")]
impl<W: tokio::io::AsyncWrite + Unpin> ByteSink for TokioSink<W> {
    async fn write_all_bytes(&mut self, data: &[u8]) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.inner.write_all(data).await
    }
}

/// Drive a future whose I/O is backed by blocking adapters.
///
/// The future must complete on its first poll: [`ReadSource`] and
/// [`WriteSink`] never return `Pending`. Any other source has to go through
/// the async driver, and a pending poll here panics instead of spinning.
pub(crate) fn block_on<F: Future>(fut: F) -> F::Output {
    let mut fut = pin!(fut);
    let mut cx = Context::from_waker(Waker::noop());
    match fut.as_mut().poll(&mut cx) {
        Poll::Ready(out) => out,
        Poll::Pending => unreachable!("blocking decode polled a source or sink that is not ready"),
    }
}
