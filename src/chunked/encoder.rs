use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_lite::io::AsyncRead;
use futures_lite::ready;
use pin_project::pin_project;

const CRLF: &[u8] = b"\r\n";
const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// An encoder for chunked encoding.
///
/// Reads at most `chunk_size` bytes from the inner reader at a time and
/// yields each read as one chunk, ending with the zero-length chunk.
#[pin_project]
#[derive(Debug)]
pub struct ChunkedEncoder<R> {
    #[pin]
    reader: R,
    scratch: Vec<u8>,
    /// A framed chunk waiting to be read out.
    pending: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<R: AsyncRead> ChunkedEncoder<R> {
    /// Create a new instance.
    pub fn new(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            scratch: vec![0; chunk_size.max(1)],
            pending: Vec::new(),
            pos: 0,
            done: false,
        }
    }
}

impl<R: AsyncRead> AsyncRead for ChunkedEncoder<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let mut this = self.project();
        loop {
            if *this.pos < this.pending.len() {
                let amt = buf.len().min(this.pending.len() - *this.pos);
                buf[..amt].copy_from_slice(&this.pending[*this.pos..*this.pos + amt]);
                *this.pos += amt;
                return Poll::Ready(Ok(amt));
            }
            if *this.done {
                return Poll::Ready(Ok(0));
            }

            let bytes = ready!(this.reader.as_mut().poll_read(cx, this.scratch))?;
            this.pending.clear();
            *this.pos = 0;
            if bytes == 0 {
                *this.done = true;
                this.pending.extend_from_slice(LAST_CHUNK);
            } else {
                this.pending
                    .extend_from_slice(format!("{:X}\r\n", bytes).as_bytes());
                this.pending.extend_from_slice(&this.scratch[..bytes]);
                this.pending.extend_from_slice(CRLF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::io::{AsyncReadExt, Cursor};

    #[test]
    fn frames_each_read() {
        async_std::task::block_on(async move {
            let mut encoder = ChunkedEncoder::new(Cursor::new(vec![b'a'; 20]), 16);
            let mut output = String::new();
            encoder.read_to_string(&mut output).await.unwrap();
            assert_eq!(
                output,
                format!("10\r\n{}\r\n4\r\naaaa\r\n0\r\n\r\n", "a".repeat(16))
            );
        });
    }

    #[test]
    fn empty_body() {
        async_std::task::block_on(async move {
            let mut encoder = ChunkedEncoder::new(Cursor::new(Vec::new()), 16);
            let mut output = Vec::new();
            encoder.read_to_end(&mut output).await.unwrap();
            assert_eq!(output, LAST_CHUNK.to_vec());
        });
    }

    #[test]
    fn small_output_buffers() {
        async_std::task::block_on(async move {
            let mut encoder = ChunkedEncoder::new(Cursor::new(b"hello world".to_vec()), 64);
            let mut output = Vec::new();
            let mut buf = [0; 3];
            loop {
                let n = encoder.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                output.extend_from_slice(&buf[..n]);
            }
            assert_eq!(output, b"B\r\nhello world\r\n0\r\n\r\n".to_vec());
        });
    }
}
