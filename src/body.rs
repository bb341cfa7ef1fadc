use std::fmt;
use std::fs::File;
use std::io;
use std::path::Path;
use std::pin::Pin;

use futures_lite::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::upgrade::Upgraded;
use crate::BoxFuture;

pub(crate) type ProcFn =
    Box<dyn for<'a> FnOnce(BodySink<'a>) -> BoxFuture<'a, io::Result<()>> + Send + 'static>;
pub(crate) type UpgradeFn = Box<dyn FnOnce(Upgraded) -> BoxFuture<'static, ()> + Send + 'static>;

/// A response body.
///
/// Bodies are bytes held in memory, a stream read to completion, a callback
/// writing to the connection, or an upgrade callback taking the connection
/// over after the head is sent.
pub struct Body {
    pub(crate) kind: Kind,
}

pub(crate) enum Kind {
    Bytes(Vec<u8>),
    Stream {
        reader: Pin<Box<dyn AsyncRead + Send + 'static>>,
        len: Option<u64>,
    },
    Proc(ProcFn),
    Upgrade(UpgradeFn),
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Bytes(bytes) => f.debug_tuple("Body::Bytes").field(&bytes.len()).finish(),
            Kind::Stream { len, .. } => f.debug_struct("Body::Stream").field("len", len).finish(),
            Kind::Proc(_) => f.write_str("Body::Proc"),
            Kind::Upgrade(_) => f.write_str("Body::Upgrade"),
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::empty()
    }
}

impl Body {
    /// An empty body.
    pub fn empty() -> Self {
        Self::from_bytes(Vec::new())
    }

    /// A body held in memory.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: Kind::Bytes(bytes.into()),
        }
    }

    /// A body read from `reader` until EOF, or until `len` bytes were sent.
    pub fn from_reader(reader: impl AsyncRead + Send + 'static, len: Option<u64>) -> Self {
        Self {
            kind: Kind::Stream {
                reader: Box::pin(reader),
                len,
            },
        }
    }

    /// Stream a file. Reads happen on the blocking thread pool.
    pub async fn from_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_owned();
        let (file, len) = blocking::unblock(move || {
            let file = File::open(&path)?;
            let len = file.metadata()?.len();
            io::Result::Ok((file, len))
        })
        .await?;
        Ok(Self::from_reader(blocking::Unblock::new(file), Some(len)))
    }

    /// A body produced by a callback writing into the connection.
    ///
    /// When the response is chunked every write becomes one chunk. Without
    /// chunking the callback's output goes out raw and the response should
    /// carry a `Content-Length`, or the connection is closed afterwards.
    pub fn from_proc<F>(f: F) -> Self
    where
        F: for<'a> FnOnce(BodySink<'a>) -> BoxFuture<'a, io::Result<()>> + Send + 'static,
    {
        Self {
            kind: Kind::Proc(Box::new(f)),
        }
    }

    /// An upgrade body: after the response head is written the callback
    /// owns the raw connection.
    pub fn upgrade<F>(f: F) -> Self
    where
        F: FnOnce(Upgraded) -> BoxFuture<'static, ()> + Send + 'static,
    {
        Self {
            kind: Kind::Upgrade(Box::new(f)),
        }
    }

    /// The length of the body, when known up front.
    pub fn len(&self) -> Option<u64> {
        match &self.kind {
            Kind::Bytes(bytes) => Some(bytes.len() as u64),
            Kind::Stream { len, .. } => *len,
            Kind::Proc(_) | Kind::Upgrade(_) => None,
        }
    }

    /// Whether the body is known to be empty.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Whether this is an upgrade body.
    pub fn is_upgrade(&self) -> bool {
        matches!(self.kind, Kind::Upgrade(_))
    }

    pub(crate) fn take_upgrade(&mut self) -> Option<UpgradeFn> {
        match std::mem::replace(&mut self.kind, Kind::Bytes(Vec::new())) {
            Kind::Upgrade(f) => Some(f),
            other => {
                self.kind = other;
                None
            }
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::from_bytes(bytes)
    }
}

impl From<&[u8]> for Body {
    fn from(bytes: &[u8]) -> Self {
        Body::from_bytes(bytes)
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::from_bytes(s.into_bytes())
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Body::from_bytes(s.as_bytes())
    }
}

/// The writer handed to [`Body::from_proc`] callbacks.
pub struct BodySink<'a> {
    writer: &'a mut (dyn AsyncWrite + Unpin + Send),
    chunked: bool,
    sent: &'a mut u64,
}

impl fmt::Debug for BodySink<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodySink")
            .field("chunked", &self.chunked)
            .field("sent", &self.sent)
            .finish()
    }
}

impl<'a> BodySink<'a> {
    pub(crate) fn new(
        writer: &'a mut (dyn AsyncWrite + Unpin + Send),
        chunked: bool,
        sent: &'a mut u64,
    ) -> Self {
        Self {
            writer,
            chunked,
            sent,
        }
    }

    /// Whether writes are being chunk framed.
    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    /// Write `data` to the client. Only payload bytes count towards
    /// [`Response::sent_size`](crate::Response::sent_size).
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if self.chunked {
            let head = format!("{:X}\r\n", data.len());
            self.writer.write_all(head.as_bytes()).await?;
            self.writer.write_all(data).await?;
            self.writer.write_all(b"\r\n").await?;
        } else {
            self.writer.write_all(data).await?;
        }
        *self.sent += data.len() as u64;
        Ok(())
    }

    /// Write a string to the client.
    pub async fn write_str(&mut self, data: &str) -> io::Result<()> {
        self.write(data.as_bytes()).await
    }

    /// Flush what was written so far.
    pub async fn flush(&mut self) -> io::Result<()> {
        self.writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_std::test]
    async fn sink_frames_writes_when_chunked() -> io::Result<()> {
        let mut out: Vec<u8> = Vec::new();
        let mut sent = 0;
        let mut sink = BodySink::new(&mut out, true, &mut sent);
        sink.write(b"hello").await?;
        sink.write(b"").await?;
        sink.write_str(" world").await?;
        assert_eq!(out, b"5\r\nhello\r\n6\r\n world\r\n".to_vec());
        assert_eq!(sent, 11);
        Ok(())
    }

    #[async_std::test]
    async fn sink_writes_raw_otherwise() -> io::Result<()> {
        let mut out: Vec<u8> = Vec::new();
        let mut sent = 0;
        let mut sink = BodySink::new(&mut out, false, &mut sent);
        sink.write(b"hello").await?;
        assert_eq!(out, b"hello".to_vec());
        assert_eq!(sent, 5);
        Ok(())
    }

    #[test]
    fn lengths() {
        assert_eq!(Body::from("abc").len(), Some(3));
        assert!(Body::empty().is_empty());
        let body = Body::from_proc(|_sink| Box::pin(async { Ok(()) }));
        assert_eq!(body.len(), None);
        assert!(Body::upgrade(|_io| Box::pin(async {})).is_upgrade());
    }
}
