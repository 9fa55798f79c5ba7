//! Stream compression (XEP-0138) collaborators.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_compression::tokio::bufread::ZlibDecoder;
use async_compression::tokio::write::ZlibEncoder;
use tokio::io::{AsyncRead, AsyncWrite, BufReader, ReadBuf, ReadHalf, WriteHalf};

use super::BoxedStream;

/// Wraps a live transport with one compression method, e.g. `zlib`.
pub trait CompressionHandler: Send + Sync {
    /// Method name as advertised in `<compression><method/></compression>`.
    fn method(&self) -> &str;

    /// Wrap `stream` in place. Called once the server has acknowledged with `<compressed/>`.
    fn wrap(&self, stream: BoxedStream) -> io::Result<BoxedStream>;
}

/// First registered handler whose method the server offered.
pub fn select_handler(
    handlers: &[Arc<dyn CompressionHandler>],
    offered: &[String],
) -> Option<Arc<dyn CompressionHandler>> {
    handlers
        .iter()
        .find(|h| offered.iter().any(|m| m == h.method()))
        .cloned()
}

/// The `zlib` method. Every flush of the writer is a zlib sync flush.
pub struct ZlibCompression;

impl CompressionHandler for ZlibCompression {
    fn method(&self) -> &str {
        "zlib"
    }

    fn wrap(&self, stream: BoxedStream) -> io::Result<BoxedStream> {
        let (read, write) = tokio::io::split(stream);
        Ok(Box::new(ZlibStream {
            reader: ZlibDecoder::new(BufReader::new(read)),
            writer: ZlibEncoder::new(write),
        }))
    }
}

struct ZlibStream {
    reader: ZlibDecoder<BufReader<ReadHalf<BoxedStream>>>,
    writer: ZlibEncoder<WriteHalf<BoxedStream>>,
}

impl AsyncRead for ZlibStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for ZlibStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}
