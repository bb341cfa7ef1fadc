use std::fmt::Display;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_lite::io::{AsyncBufRead, AsyncRead};
use futures_lite::ready;
use pin_project::pin_project;

use crate::MAX_HEADER_LENGTH;

/// Decodes a chunked body according to
/// https://tools.ietf.org/html/rfc7230#section-4.1
///
/// Chunk extensions are skipped. Trailer fields are parsed and dropped.
#[pin_project]
#[derive(Debug)]
pub struct ChunkedDecoder<R> {
    /// The underlying stream
    #[pin]
    inner: R,
    /// Current state.
    state: State,
}

impl<R: AsyncBufRead> ChunkedDecoder<R> {
    /// Decode the chunked stream read from `inner`.
    pub fn new(inner: R) -> Self {
        ChunkedDecoder {
            inner,
            state: State::Read(ReadState::BeforeChunk {
                size: 0,
                inner: ChunkSizeState::Start,
            }),
        }
    }
}

impl<R> ChunkedDecoder<R> {
    /// Whether the terminating chunk and trailers were read.
    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// Get back the underlying reader, positioned after whatever was decoded.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

const MAX_CHUNK_SIZE: u64 = 0x0FFF_FFFF_FFFF_FFFF;

fn read_chunk_size(
    buf: &[u8],
    size: &mut u64,
    state: &mut ChunkSizeState,
) -> io::Result<(usize, bool)> {
    for (offset, c) in buf.iter().copied().enumerate() {
        match *state {
            ChunkSizeState::Start | ChunkSizeState::ChunkSize => {
                let digit = match c {
                    b'0'..=b'9' => c - b'0',
                    b'a'..=b'f' => c + 10 - b'a',
                    b'A'..=b'F' => c + 10 - b'A',
                    b';' | b' ' | b'\t' if *state == ChunkSizeState::ChunkSize => {
                        *state = ChunkSizeState::Extension;
                        continue;
                    }
                    b'\r' if *state == ChunkSizeState::ChunkSize => {
                        *state = ChunkSizeState::NewLine;
                        continue;
                    }
                    _ => return Err(other_err(httparse::InvalidChunkSize)),
                };
                if *size > MAX_CHUNK_SIZE >> 4 {
                    return Err(other_err(httparse::InvalidChunkSize));
                }
                *size = (*size << 4) + digit as u64;
                *state = ChunkSizeState::ChunkSize;
            }
            ChunkSizeState::Extension => match c {
                b'\r' => *state = ChunkSizeState::NewLine,
                b'\n' => return Err(other_err(httparse::InvalidChunkSize)),
                _ => {}
            },
            ChunkSizeState::NewLine => match c {
                b'\n' => return Ok((offset + 1, true)),
                _ => return Err(other_err(httparse::InvalidChunkSize)),
            },
        }
    }
    Ok((buf.len(), false))
}

impl<R: AsyncBufRead> AsyncRead for ChunkedDecoder<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let inner_buf = ready!(self.as_mut().poll_fill_buf(cx))?;
        let amt = buf.len().min(inner_buf.len());
        buf[0..amt].copy_from_slice(&inner_buf[0..amt]);
        self.consume(amt);

        Poll::Ready(Ok(amt))
    }
}

impl<R: AsyncBufRead> AsyncBufRead for ChunkedDecoder<R> {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let mut this = self.project();

        let pass_through_state = loop {
            match this.state {
                State::PassThrough(pass_through_state) => {
                    if pass_through_state.offset < pass_through_state.size {
                        break pass_through_state;
                    } else {
                        *this.state = State::Read(ReadState::AfterChunk { new_line: false });
                    }
                }
                State::Read(read_state) => {
                    let inner_buf = ready!(this.inner.as_mut().poll_fill_buf(cx))?;

                    if inner_buf.is_empty() {
                        return Poll::Ready(Err(unexpected_eof()));
                    }

                    let mut read = 0;
                    while read < inner_buf.len() {
                        let (nread, next_state) = read_state.advance(&inner_buf[read..])?;
                        read += nread;
                        if let Some(next_state) = next_state {
                            *this.state = next_state;
                            break;
                        }
                    }
                    this.inner.as_mut().consume(read);
                }
                State::Done => return Poll::Ready(Ok(&[])),
            }
        };

        // The chunk data is borrowed straight from the inner buffer, which
        // can't happen while `this.state` is borrowed by the loop above.
        let inner_buf = ready!(this.inner.poll_fill_buf(cx))?;

        let max_read = pass_through_state.size - pass_through_state.offset;
        let amt = max_read.min(inner_buf.len() as u64) as usize;

        Poll::Ready(if amt == 0 {
            Err(unexpected_eof())
        } else {
            Ok(&inner_buf[0..amt])
        })
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        let this = self.project();
        if amt > 0 {
            if let State::PassThrough(pass_through_state) = this.state {
                let amt = (amt as u64).min(pass_through_state.size - pass_through_state.offset);
                pass_through_state.offset += amt;
                this.inner.consume(amt as usize);
            }
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ChunkSizeState {
    Start,
    ChunkSize,
    Extension,
    NewLine,
}

// Decoder state
#[derive(Debug)]
enum State {
    // We're inside a chunk
    PassThrough(PassThroughState),
    // We're reading the framing around a chunk
    Read(ReadState),
    // We're done
    Done,
}

#[derive(Debug)]
struct PassThroughState {
    // Where we are within the chunk
    offset: u64,
    // How big the chunk is
    size: u64,
}

#[derive(Debug)]
enum ReadState {
    // Reading the framing before a chunk
    BeforeChunk { size: u64, inner: ChunkSizeState },
    // Just finished reading the chunk data
    AfterChunk { new_line: bool },
    // Just read CRLF after chunk data
    MaybeTrailer { new_line: bool },
    // Accumulating trailers into a buffer
    Trailer { buffer: Vec<u8> },
}

impl ReadState {
    fn advance(&mut self, buf: &[u8]) -> io::Result<(usize, Option<State>)> {
        match self {
            ReadState::BeforeChunk { size, inner } => {
                let (amt, done) = read_chunk_size(buf, size, inner)?;
                if done {
                    Ok((
                        amt,
                        if *size > 0 {
                            Some(State::PassThrough(PassThroughState {
                                offset: 0,
                                size: *size,
                            }))
                        } else {
                            *self = ReadState::MaybeTrailer { new_line: false };
                            None
                        },
                    ))
                } else {
                    Ok((amt, None))
                }
            }
            ReadState::AfterChunk { new_line } => match (*new_line, buf[0]) {
                (false, b'\r') => {
                    *new_line = true;
                    Ok((1, None))
                }
                (true, b'\n') => {
                    *self = ReadState::BeforeChunk {
                        size: 0,
                        inner: ChunkSizeState::Start,
                    };
                    Ok((1, None))
                }
                _ => Err(invalid_data_err()),
            },
            ReadState::MaybeTrailer { new_line } => match (*new_line, buf[0]) {
                (false, b'\r') => {
                    *new_line = true;
                    Ok((1, None))
                }
                (true, b'\n') => Ok((1, Some(State::Done))),
                (false, _) => {
                    *self = ReadState::Trailer { buffer: Vec::new() };
                    Ok((0, None))
                }
                (true, _) => Err(invalid_data_err()),
            },
            ReadState::Trailer { buffer } => {
                let previous = buffer.len();
                buffer.extend_from_slice(buf);
                let mut headers = [httparse::EMPTY_HEADER; 32];
                match httparse::parse_headers(buffer.as_slice(), &mut headers) {
                    Ok(httparse::Status::Complete((amt, _))) => {
                        Ok((amt.saturating_sub(previous), Some(State::Done)))
                    }
                    Ok(httparse::Status::Partial) if buffer.len() > MAX_HEADER_LENGTH => {
                        Err(invalid_data_err())
                    }
                    Ok(httparse::Status::Partial) => Ok((buf.len(), None)),
                    Err(err) => Err(other_err(err)),
                }
            }
        }
    }
}

fn other_err<E: Display>(err: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err.to_string())
}

fn invalid_data_err() -> io::Error {
    io::Error::from(io::ErrorKind::InvalidData)
}

fn unexpected_eof() -> io::Error {
    io::Error::from(io::ErrorKind::UnexpectedEof)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::io::{AsyncReadExt, Cursor};

    #[test]
    fn test_chunked_wiki() {
        async_std::task::block_on(async move {
            let input = Cursor::new(
                "4\r\n\
                  Wiki\r\n\
                  5\r\n\
                  pedia\r\n\
                  E\r\n in\r\n\
                  \r\n\
                  chunks.\r\n\
                  0\r\n\
                  \r\n"
                    .as_bytes(),
            );

            let mut decoder = ChunkedDecoder::new(input);

            let mut output = String::new();
            decoder.read_to_string(&mut output).await.unwrap();
            assert_eq!(
                output,
                "Wikipedia in\r\n\
                 \r\n\
                 chunks."
            );
            assert!(decoder.is_done());
        });
    }

    #[test]
    fn test_chunked_big() {
        async_std::task::block_on(async move {
            let mut input: Vec<u8> = b"800\r\n".to_vec();
            input.extend(vec![b'X'; 2048]);
            input.extend(b"\r\n1800\r\n");
            input.extend(vec![b'Y'; 6144]);
            input.extend(b"\r\n800\r\n");
            input.extend(vec![b'Z'; 2048]);
            input.extend(b"\r\n0\r\n\r\n");

            let mut decoder = ChunkedDecoder::new(Cursor::new(input));

            let mut output = String::new();
            decoder.read_to_string(&mut output).await.unwrap();

            let mut expected = vec![b'X'; 2048];
            expected.extend(vec![b'Y'; 6144]);
            expected.extend(vec![b'Z'; 2048]);
            assert_eq!(output.len(), 10240);
            assert_eq!(output.as_bytes(), expected.as_slice());
        });
    }

    #[test]
    fn trailers_are_skipped() {
        async_std::task::block_on(async move {
            let input = Cursor::new(
                "7\r\n\
                 Mozilla\r\n\
                 9\r\n\
                 Developer\r\n\
                 7\r\n\
                 Network\r\n\
                 0\r\n\
                 Expires: Wed, 21 Oct 2015 07:28:00 GMT\r\n\
                 \r\n\
                 GET / HTTP/1.1\r\n"
                    .as_bytes(),
            );
            let mut decoder = ChunkedDecoder::new(input);

            let mut output = String::new();
            decoder.read_to_string(&mut output).await.unwrap();
            assert_eq!(output, "MozillaDeveloperNetwork");

            let mut rest = String::new();
            decoder.into_inner().read_to_string(&mut rest).await.unwrap();
            assert_eq!(rest, "GET / HTTP/1.1\r\n");
        });
    }

    #[test]
    fn extensions_are_ignored() {
        async_std::task::block_on(async move {
            let input = Cursor::new("5;name=value\r\nhello\r\n0;last\r\n\r\n".as_bytes());
            let mut output = String::new();
            ChunkedDecoder::new(input)
                .read_to_string(&mut output)
                .await
                .unwrap();
            assert_eq!(output, "hello");
        });
    }

    #[test]
    fn malformed_framing() {
        async_std::task::block_on(async move {
            for input in &[
                "zz\r\nhello\r\n0\r\n\r\n",
                "\r\nhello\r\n0\r\n\r\n",
                "5\r\nhelloXX0\r\n\r\n",
                "FFFFFFFFFFFFFFFFFF\r\n",
            ] {
                let mut output = Vec::new();
                let err = ChunkedDecoder::new(Cursor::new(input.as_bytes()))
                    .read_to_end(&mut output)
                    .await
                    .unwrap_err();
                assert_eq!(err.kind(), io::ErrorKind::InvalidData, "{:?}", input);
            }
        });
    }

    #[test]
    fn premature_eof() {
        async_std::task::block_on(async move {
            let mut output = Vec::new();
            let err = ChunkedDecoder::new(Cursor::new("5\r\nhel".as_bytes()))
                .read_to_end(&mut output)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        });
    }
}
