use std::fmt::{self, Debug};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_lite::io::{AsyncRead, Take};
use futures_lite::ready;

use super::ConnReader;
use crate::chunked::ChunkedDecoder;

/// The framing of a request body, wrapping the connection's reader.
pub(crate) enum BodyReader {
    Chunked(ChunkedDecoder<ConnReader>),
    Fixed(Take<ConnReader>),
    None(ConnReader),
}

impl Debug for BodyReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyReader::Chunked(_) => f.write_str("BodyReader::Chunked"),
            BodyReader::Fixed(r) => write!(f, "BodyReader::Fixed({})", r.limit()),
            BodyReader::None(_) => f.write_str("BodyReader::None"),
        }
    }
}

impl BodyReader {
    /// Give the connection reader back, positioned after whatever body bytes
    /// were consumed.
    pub(crate) fn into_inner(self) -> ConnReader {
        match self {
            BodyReader::Chunked(r) => r.into_inner(),
            BodyReader::Fixed(r) => r.into_inner(),
            BodyReader::None(r) => r,
        }
    }

    /// Whether every byte of the body was read.
    pub(crate) fn is_complete(&self) -> bool {
        match self {
            BodyReader::Chunked(r) => r.is_done(),
            BodyReader::Fixed(r) => r.limit() == 0,
            BodyReader::None(_) => true,
        }
    }

    /// Whether the client already sent bytes that nothing frames.
    pub(crate) fn has_unframed_bytes(&self) -> bool {
        match self {
            BodyReader::None(r) => !r.buffer().is_empty(),
            _ => false,
        }
    }
}

impl AsyncRead for BodyReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            BodyReader::Chunked(r) => Pin::new(r).poll_read(cx, buf),
            BodyReader::Fixed(r) => {
                let remaining = r.limit();
                let n = ready!(Pin::new(&mut *r).poll_read(cx, buf))?;
                if n == 0 && remaining > 0 && !buf.is_empty() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "invalid body size",
                    )));
                }
                Poll::Ready(Ok(n))
            }
            BodyReader::None(_) => Poll::Ready(Ok(0)),
        }
    }
}
