//! First-byte handshake sniffing
//!
//! Classifies a raw byte stream as TLS or plaintext by observing its first
//! byte without consuming it. The observed bytes are replayed ahead of the
//! inner stream, so whatever parser runs next sees the original sequence.

use crate::error::{Error, Result};
use bytes::{Buf, Bytes};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

/// First byte of a TLS record of type "handshake"
pub const TLS_HANDSHAKE_BYTE: u8 = 22;

/// Classified kind of an incoming stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
  /// The stream opens with a TLS handshake record
  Tls,
  /// Anything else (plain HTTP, WebSocket bytes, ...)
  Plain,
}

/// Classify a stream from its first byte.
///
/// This is a byte-level heuristic, not a TLS preamble parse: it never looks
/// at SNI or negotiates anything.
pub fn classify(first_byte: u8) -> StreamKind {
  if first_byte == TLS_HANDSHAKE_BYTE {
    StreamKind::Tls
  } else {
    StreamKind::Plain
  }
}

/// A byte stream with an owned prefix of already-read bytes.
///
/// Reads drain the prefix before touching the inner stream; writes go
/// straight through. Used to hand sniffed (or over-buffered) bytes back to
/// the next parser.
#[derive(Debug)]
pub struct RewindStream<S> {
  prefix: Bytes,
  inner: S,
}

impl<S> RewindStream<S> {
  /// Wrap a stream with an empty prefix
  pub fn new(inner: S) -> Self {
    Self {
      prefix: Bytes::new(),
      inner,
    }
  }

  /// Wrap a stream, replaying `prefix` before any byte of `inner`
  pub fn with_prefix(prefix: impl Into<Bytes>, inner: S) -> Self {
    Self {
      prefix: prefix.into(),
      inner,
    }
  }

  /// Bytes that will be replayed before the inner stream
  pub fn prefix(&self) -> &[u8] {
    &self.prefix
  }

  /// Consume the adapter, returning the unread prefix and the inner stream
  pub fn into_parts(self) -> (Bytes, S) {
    (self.prefix, self.inner)
  }
}

impl<S: AsyncRead + Unpin> RewindStream<S> {
  /// Observe the first byte of the stream without consuming it.
  ///
  /// Whatever the inner stream delivered alongside that byte stays in the
  /// prefix and is replayed on the next read. A stream that ends before
  /// producing a byte is a connection error.
  pub async fn first_byte(&mut self) -> Result<u8> {
    if let Some(byte) = self.prefix.first() {
      return Ok(*byte);
    }
    let mut buf = [0u8; 1024];
    let n = self.inner.read(&mut buf).await?;
    if n == 0 {
      return Err(Error::Connection(
        "connection closed before first byte".to_string(),
      ));
    }
    self.prefix = Bytes::copy_from_slice(&buf[..n]);
    Ok(self.prefix[0])
  }

  /// Sniff and classify the stream from its first byte
  pub async fn sniff(&mut self) -> Result<StreamKind> {
    let first = self.first_byte().await?;
    Ok(classify(first))
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for RewindStream<S> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    if !self.prefix.is_empty() {
      let n = std::cmp::min(self.prefix.len(), buf.remaining());
      buf.put_slice(&self.prefix[..n]);
      self.prefix.advance(n);
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RewindStream<S> {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncWriteExt;

  #[test]
  fn test_classify_first_byte() {
    assert_eq!(classify(22), StreamKind::Tls);
    assert_eq!(classify(b'G'), StreamKind::Plain);
    assert_eq!(classify(0x05), StreamKind::Plain);
  }

  #[tokio::test]
  async fn test_sniff_does_not_consume() {
    let (client, server) = tokio::io::duplex(1024);
    let mut client = client;
    client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

    let mut stream = RewindStream::new(server);
    assert_eq!(stream.sniff().await.unwrap(), StreamKind::Plain);
    // A second sniff must observe the same byte
    assert_eq!(stream.first_byte().await.unwrap(), b'G');

    drop(client);
    let mut replay = Vec::new();
    stream.read_to_end(&mut replay).await.unwrap();
    assert_eq!(replay, b"GET / HTTP/1.1\r\n\r\n");
  }

  #[tokio::test]
  async fn test_sniff_tls_handshake_byte() {
    let (client, server) = tokio::io::duplex(1024);
    let mut client = client;
    client.write_all(&[22, 3, 1, 0, 0]).await.unwrap();

    let mut stream = RewindStream::new(server);
    assert_eq!(stream.sniff().await.unwrap(), StreamKind::Tls);

    drop(client);
    let mut replay = Vec::new();
    stream.read_to_end(&mut replay).await.unwrap();
    assert_eq!(replay, vec![22, 3, 1, 0, 0]);
  }

  #[tokio::test]
  async fn test_sniff_closed_stream() {
    let (client, server) = tokio::io::duplex(1024);
    drop(client);
    let mut stream = RewindStream::new(server);
    assert!(stream.sniff().await.is_err());
  }

  #[tokio::test]
  async fn test_prefix_replayed_before_inner() {
    let (client, server) = tokio::io::duplex(1024);
    let mut client = client;
    client.write_all(b"world").await.unwrap();
    drop(client);

    let mut stream = RewindStream::with_prefix(&b"hello "[..], server);
    let mut all = Vec::new();
    stream.read_to_end(&mut all).await.unwrap();
    assert_eq!(all, b"hello world");
  }
}
