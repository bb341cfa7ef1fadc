//! Encode HTTP responses onto the connection.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::SystemTime;

use futures_lite::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use futures_lite::ready;
use http_types::{Method, StatusCode};
use pin_project::pin_project;

use crate::body::{BodySink, Kind};
use crate::chunked::ChunkedEncoder;
use crate::error::HttpError;
use crate::headers::{canonical_name, has_line_break};
use crate::logger::Logger;
use crate::response::Response;
use crate::version::HttpVersion;

const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Finalize the response head: defaults, message length and keep-alive.
pub(crate) fn setup_header(res: &mut Response, logger: &Logger) {
    if !res.headers.contains("server") {
        res.headers.insert("server", res.server_software.clone());
    }
    if !res.headers.contains("date") {
        res.headers
            .insert("date", httpdate::fmt_http_date(SystemTime::now()));
    }

    if let Some(protocol) = res.upgrade.clone() {
        res.headers.insert("connection", "upgrade");
        res.headers.insert("upgrade", protocol);
        res.keep_alive = false;
        res.chunked = false;
        return;
    }

    if res.request_version < HttpVersion::HTTP_1_0 {
        res.version = HttpVersion::HTTP_0_9;
        res.keep_alive = false;
    } else if res.request_version < HttpVersion::HTTP_1_1 && res.chunked {
        res.chunked = false;
        logger.warn(format_args!(
            "chunked is set for an HTTP/{} request (ignored)",
            res.request_version
        ));
    }

    if res.is_bodyless_status() {
        res.headers.remove("content-length");
        res.chunked = false;
        res.body = Default::default();
    } else if res.chunked {
        res.headers.insert("transfer-encoding", "chunked");
        res.headers.remove("content-length");
    } else if res
        .content_type()
        .map(|ct| ct.to_ascii_lowercase().starts_with("multipart/byteranges"))
        .unwrap_or(false)
    {
        res.headers.remove("content-length");
    } else if !res.headers.contains("content-length") {
        match res.body.len() {
            Some(len) => res.set_content_length(len),
            None => res.headers.insert("connection", "close"),
        }
    }

    let close_requested = res
        .headers
        .first("connection")
        .map(|value| value.eq_ignore_ascii_case("close"))
        .unwrap_or(false);
    if close_requested {
        res.keep_alive = false;
    } else if res.keep_alive {
        if res.chunked || res.headers.contains("content-length") || res.is_bodyless_status() {
            res.headers.insert("connection", "Keep-Alive");
        } else {
            logger.warn(format_args!(
                "Could not determine content-length of response body. \
                 Set content-length of the response or set chunked"
            ));
            res.headers.insert("connection", "close");
            res.keep_alive = false;
        }
    } else {
        res.headers.insert("connection", "close");
    }

    let location = match (res.headers.first("location"), &res.request_uri) {
        (Some(location), Some(uri)) => uri.join(location).ok().map(String::from),
        _ => None,
    };
    if let Some(location) = location {
        res.headers.insert("location", location);
    }
}

fn unsafe_head(res: &Response) -> Option<HttpError> {
    if res.reason.as_deref().map_or(false, has_line_break) {
        return Some(HttpError::InvalidReasonPhrase);
    }
    for (name, values) in res.headers.iter() {
        if has_line_break(name) || values.iter().any(|value| has_line_break(value)) {
            return Some(HttpError::InvalidHeader(name.to_owned()));
        }
    }
    if res.cookies.iter().any(|cookie| has_line_break(cookie)) {
        return Some(HttpError::InvalidHeader("set-cookie".to_owned()));
    }
    None
}

fn encode_head(res: &Response) -> Vec<u8> {
    let mut head = res.status_line();
    for (name, values) in res.headers.iter() {
        let name = canonical_name(name);
        for value in values {
            head.push_str(&name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
    }
    for cookie in &res.cookies {
        head.push_str("Set-Cookie: ");
        head.push_str(cookie);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    head.into_bytes()
}

/// Write the response to the client.
///
/// A reason phrase, header or cookie value containing a line break never
/// reaches the wire: the response is replaced by a 500 error page first.
pub(crate) async fn send<W>(
    res: &mut Response,
    writer: &mut W,
    logger: &Logger,
    debug_error_pages: bool,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    setup_header(res, logger);
    if let Some(err) = unsafe_head(res) {
        logger.error(format_args!("{}", err));
        res.headers.clear();
        res.cookies.clear();
        let err = http_types::Error::new(StatusCode::InternalServerError, err);
        res.set_error(&err, debug_error_pages);
        setup_header(res, logger);
        if let Some(err) = unsafe_head(res) {
            return Err(err.into());
        }
    }

    if res.version >= HttpVersion::HTTP_1_0 {
        writer.write_all(&encode_head(res)).await?;
    }
    if res.request_method != Some(Method::Head) {
        send_body(res, writer).await?;
    }
    writer.flush().await
}

async fn send_body<W>(res: &mut Response, writer: &mut W) -> io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    if res.body.is_upgrade() {
        return Ok(());
    }
    let chunked = res.chunked;
    let chunk_size = res.output_buffer_size;
    match std::mem::take(&mut res.body).kind {
        Kind::Bytes(bytes) => {
            if chunked {
                let mut sink = BodySink::new(&mut *writer, true, &mut res.sent_size);
                for chunk in bytes.chunks(chunk_size) {
                    sink.write(chunk).await?;
                }
                writer.write_all(LAST_CHUNK).await?;
            } else {
                writer.write_all(&bytes).await?;
                res.sent_size += bytes.len() as u64;
            }
        }
        Kind::Stream { mut reader, .. } => {
            if chunked {
                let counted = Counted::new(reader, &mut res.sent_size);
                io::copy(ChunkedEncoder::new(counted, chunk_size), &mut *writer).await?;
            } else if let Some((offset, len)) = content_range(res) {
                io::copy((&mut reader).take(offset), io::sink()).await?;
                res.sent_size += io::copy(reader.take(len), &mut *writer).await?;
            } else if let Some(len) = res.content_length() {
                res.sent_size += io::copy(reader.take(len), &mut *writer).await?;
            } else {
                res.sent_size += io::copy(reader, &mut *writer).await?;
            }
        }
        Kind::Proc(f) => {
            f(BodySink::new(&mut *writer, chunked, &mut res.sent_size)).await?;
            if chunked {
                writer.write_all(LAST_CHUNK).await?;
            }
        }
        Kind::Upgrade(_) => {}
    }
    Ok(())
}

/// The `(offset, length)` of a `Content-Range: bytes a-b/n` header.
fn content_range(res: &Response) -> Option<(u64, u64)> {
    let value = res.headers.first("content-range")?;
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, _) = range.split_once('/')?;
    let (first, last) = range.split_once('-')?;
    let first: u64 = first.trim().parse().ok()?;
    let last: u64 = last.trim().parse().ok()?;
    if last < first {
        return None;
    }
    Some((first, last - first + 1))
}

/// Counts the bytes read through it.
#[pin_project]
struct Counted<'a, R> {
    #[pin]
    inner: R,
    count: &'a mut u64,
}

impl<'a, R> Counted<'a, R> {
    fn new(inner: R, count: &'a mut u64) -> Self {
        Self { inner, count }
    }
}

impl<R: AsyncRead> AsyncRead for Counted<'_, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let n = ready!(this.inner.poll_read(cx, buf))?;
        **this.count += n as u64;
        Poll::Ready(Ok(n))
    }
}
