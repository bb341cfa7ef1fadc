use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use chrono::{DateTime, Local};
use futures_lite::io::{self, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use http_types::{Method, StatusCode, Url};
use percent_encoding::percent_decode_str;

use crate::error::HttpError;
use crate::headers::Headers;
use crate::server::{BodyReader, ConnReader};
use crate::version::HttpVersion;

const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// A parsed HTTP request.
///
/// The head is fully parsed when a handler sees the request. The body is
/// still on the wire and is read with [`Request::body`] or
/// [`Request::read_body_chunk`].
pub struct Request {
    pub(crate) method: Method,
    pub(crate) request_line: Option<String>,
    pub(crate) unparsed_uri: String,
    pub(crate) path: String,
    pub(crate) query_string: Option<String>,
    pub(crate) version: HttpVersion,
    pub(crate) headers: Headers,
    pub(crate) url: Option<Url>,
    pub(crate) scheme: String,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) server_name: String,
    pub(crate) peer_addr: Option<SocketAddr>,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) remote_ip: Option<IpAddr>,
    pub(crate) script_name: String,
    pub(crate) path_info: String,
    pub(crate) user: Option<String>,
    pub(crate) keep_alive: bool,
    pub(crate) request_time: DateTime<Local>,
    pub(crate) started: Instant,
    pub(crate) input_buffer_size: usize,
    pub(crate) max_body_size: Option<u64>,
    pub(crate) continue_writer: Option<Box<dyn AsyncWrite + Unpin + Send>>,
    reader: Option<BodyReader>,
    body: BodyState,
    params: Option<Params>,
}

#[derive(Debug)]
enum BodyState {
    Unread,
    Streaming,
    Cached { bytes: Vec<u8>, yielded: bool },
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("unparsed_uri", &self.unparsed_uri)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("body", &self.reader)
            .finish()
    }
}

impl Request {
    /// An empty request context bound to the connection's reader. Until a
    /// request line is parsed the version reads as HTTP/1.0, so errors
    /// answering an unreadable request still carry a status line.
    pub(crate) fn new(reader: ConnReader) -> Self {
        Self {
            method: Method::Get,
            request_line: None,
            unparsed_uri: String::new(),
            path: String::new(),
            query_string: None,
            version: HttpVersion::HTTP_1_0,
            headers: Headers::new(),
            url: None,
            scheme: "http".to_owned(),
            host: String::new(),
            port: 80,
            server_name: String::new(),
            peer_addr: None,
            local_addr: None,
            remote_ip: None,
            script_name: String::new(),
            path_info: String::new(),
            user: None,
            keep_alive: false,
            request_time: Local::now(),
            started: Instant::now(),
            input_buffer_size: 64 * 1024,
            max_body_size: None,
            continue_writer: None,
            reader: Some(BodyReader::None(reader)),
            body: BodyState::Unread,
            params: None,
        }
    }

    pub(crate) fn set_body_reader(&mut self, reader: BodyReader) {
        self.reader = Some(reader);
    }

    pub(crate) fn take_body_reader(&mut self) -> Option<BodyReader> {
        self.reader.take()
    }

    /// Take the connection reader back for the next request.
    pub(crate) fn into_conn_reader(mut self) -> Option<ConnReader> {
        self.reader.take().map(BodyReader::into_inner)
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request line as received, without its line terminator.
    pub fn request_line(&self) -> Option<&str> {
        self.request_line.as_deref()
    }

    /// The request target exactly as sent.
    pub fn unparsed_uri(&self) -> &str {
        &self.unparsed_uri
    }

    /// The decoded and normalized path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The raw query string, without the leading `?`.
    pub fn query_string(&self) -> Option<&str> {
        self.query_string.as_deref()
    }

    /// The protocol version of the request.
    pub fn version(&self) -> HttpVersion {
        self.version
    }

    /// The request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// A request header, repeated fields joined with `", "`.
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers.get(name)
    }

    /// The absolute request URI, rebuilt from the effective scheme, host and port.
    pub fn url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    /// `http` or `https`, as seen by the client.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Whether the client reached the server over TLS, per `X-Forwarded-Proto`.
    pub fn is_ssl(&self) -> bool {
        self.scheme == "https"
    }

    /// The effective host, IPv6 literals in brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The effective port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The server name, `X-Forwarded-Server` aware.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// The socket peer address.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// The socket local address.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub(crate) fn local_port(&self) -> u16 {
        self.local_addr.map(|addr| addr.port()).unwrap_or(self.port)
    }

    /// The client address: `Client-IP`, then the first public
    /// `X-Forwarded-For` entry, then the socket peer.
    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.remote_ip
    }

    /// The mount prefix the request was routed through.
    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    /// The remainder of the path after [`Request::script_name`].
    pub fn path_info(&self) -> &str {
        &self.path_info
    }

    /// The authenticated user, if any.
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Record the authenticated user.
    pub fn set_user(&mut self, user: impl Into<String>) {
        self.user = Some(user.into());
    }

    /// Whether the client asked to keep the connection open.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// The `Content-Length` header, if valid.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .first("content-length")
            .and_then(|len| len.parse().ok())
    }

    /// The `Content-Type` header.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.first("content-type")
    }

    /// When the request line was received.
    pub fn request_time(&self) -> DateTime<Local> {
        self.request_time
    }

    /// Send the interim `100 Continue` response if the client is waiting
    /// for it. Does nothing if it wasn't requested or was already sent.
    pub async fn send_continue(&mut self) -> io::Result<()> {
        if let Some(mut writer) = self.continue_writer.take() {
            self.headers.remove("expect");
            writer.write_all(CONTINUE_RESPONSE).await?;
            writer.flush().await?;
        }
        Ok(())
    }

    /// Whether the request still expects a `100 Continue`.
    pub fn expects_continue(&self) -> bool {
        self.continue_writer.is_some()
    }

    fn check_framing(&self) -> http_types::Result<()> {
        if let Some(reader) = &self.reader {
            ensure_status!(
                !(matches!(self.method, Method::Post | Method::Put) && reader.has_unframed_bytes()),
                StatusCode::LengthRequired,
                "length required"
            );
        }
        Ok(())
    }

    /// Read the whole body into memory.
    ///
    /// The body is read once and cached. Fails with `413` if it's larger than
    /// the configured maximum, and if the body was already streamed with
    /// [`Request::read_body_chunk`].
    pub async fn body(&mut self) -> http_types::Result<&[u8]> {
        if let BodyState::Unread = self.body {
            self.check_framing()?;
            if let (Some(max), Some(len)) = (self.max_body_size, self.content_length()) {
                ensure_status!(len <= max, StatusCode::PayloadTooLarge, "request entity too large");
            }
            self.send_continue().await?;

            let mut bytes = Vec::new();
            if let Some(reader) = self.reader.as_mut() {
                let mut buf = vec![0; self.input_buffer_size.max(1)];
                loop {
                    let n = reader.read(&mut buf).await.map_err(body_error)?;
                    if n == 0 {
                        break;
                    }
                    bytes.extend_from_slice(&buf[..n]);
                    if let Some(max) = self.max_body_size {
                        ensure_status!(
                            bytes.len() as u64 <= max,
                            StatusCode::PayloadTooLarge,
                            "request entity too large"
                        );
                    }
                }
            }
            self.body = BodyState::Cached {
                bytes,
                yielded: false,
            };
        }
        match &self.body {
            BodyState::Cached { bytes, .. } => Ok(bytes.as_slice()),
            _ => Err(http_types::Error::new(
                StatusCode::InternalServerError,
                HttpError::BodyConsumed,
            )),
        }
    }

    /// Read the next slice of the body, at most `InputBufferSize` bytes.
    ///
    /// Returns `None` at the end of the body. If the body was already read
    /// with [`Request::body`], the cached bytes are returned once.
    pub async fn read_body_chunk(&mut self) -> http_types::Result<Option<Vec<u8>>> {
        match &mut self.body {
            BodyState::Cached { bytes, yielded } => {
                if *yielded || bytes.is_empty() {
                    return Ok(None);
                }
                *yielded = true;
                return Ok(Some(bytes.clone()));
            }
            BodyState::Unread => {
                self.check_framing()?;
                self.send_continue().await?;
                self.body = BodyState::Streaming;
            }
            BodyState::Streaming => {}
        }
        let reader = match self.reader.as_mut() {
            Some(reader) => reader,
            None => return Ok(None),
        };
        let mut buf = vec![0; self.input_buffer_size.max(1)];
        let n = reader.read(&mut buf).await.map_err(body_error)?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }

    /// Read and discard what's left of the body so the connection can carry
    /// another request.
    pub(crate) async fn drain_body(&mut self) -> http_types::Result<()> {
        if let BodyState::Cached { .. } = self.body {
            return Ok(());
        }
        self.check_framing()?;
        if let Some(reader) = self.reader.as_mut() {
            if !reader.is_complete() {
                io::copy(reader, io::sink()).await.map_err(body_error)?;
            }
        }
        Ok(())
    }

    /// The query or form parameters.
    ///
    /// `POST` and `PUT` requests with an `application/x-www-form-urlencoded`
    /// body take them from the body, every other request from the query
    /// string.
    pub async fn query(&mut self) -> http_types::Result<&Params> {
        if self.params.is_none() {
            let is_form = matches!(self.method, Method::Post | Method::Put)
                && self
                    .content_type()
                    .map(|ct| {
                        ct.to_ascii_lowercase()
                            .starts_with("application/x-www-form-urlencoded")
                    })
                    .unwrap_or(false);
            let params = if is_form {
                let body = self.body().await?;
                Params::parse(&String::from_utf8_lossy(body))
            } else {
                Params::parse(self.query_string.as_deref().unwrap_or(""))
            };
            self.params = Some(params);
        }
        Ok(self.params.get_or_insert_with(Params::default))
    }
}

fn body_error(err: io::Error) -> http_types::Error {
    match err.kind() {
        io::ErrorKind::UnexpectedEof => {
            format_err_status!(StatusCode::BadRequest, "invalid body size")
        }
        io::ErrorKind::InvalidData => {
            format_err_status!(StatusCode::BadRequest, "bad chunk: {}", err)
        }
        _ => http_types::Error::from(err),
    }
}

/// Decoded query or form parameters.
///
/// Keys keep every value in arrival order; the first one is the primary value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    entries: Vec<(String, Vec<String>)>,
}

impl Params {
    /// Parse `key=value` pairs separated by `&` or `;`.
    pub fn parse(input: &str) -> Self {
        let mut params = Params::default();
        for pair in input.split(|c| c == '&' || c == ';') {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            params.append(unescape_form(key), unescape_form(value));
        }
        params
    }

    fn append(&mut self, key: String, value: String) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((key, vec![value])),
        }
    }

    /// The first value of `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Every value of `key`, in arrival order.
    pub fn get_all(&self, key: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, values)| values.as_slice())
    }

    /// Iterate over keys and their values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(k, values)| (k.as_str(), values.as_slice()))
    }

    /// The number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn unescape_form(s: &str) -> String {
    let s = s.replace('+', " ");
    percent_decode_str(&s).decode_utf8_lossy().into_owned()
}

/// Resolve `.` and `..` segments and collapse repeated slashes. `None` if the
/// path doesn't start with `/` or climbs above the root.
pub(crate) fn normalize_path(path: &str) -> Option<String> {
    if !path.starts_with('/') {
        return None;
    }
    let mut segments: Vec<&str> = Vec::new();
    let mut trailing = false;
    for segment in path[1..].split('/') {
        trailing = false;
        match segment {
            "" => trailing = true,
            "." => trailing = true,
            ".." => {
                segments.pop()?;
                trailing = true;
            }
            s => segments.push(s),
        }
    }
    let mut normalized = String::with_capacity(path.len());
    for segment in &segments {
        normalized.push('/');
        normalized.push_str(segment);
    }
    if trailing || segments.is_empty() {
        normalized.push('/');
    }
    Some(normalized)
}
