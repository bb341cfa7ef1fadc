//! Decode HTTP requests off the connection.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::time::Instant;

use futures_lite::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite};
use http_types::{Method, StatusCode, Url};
use percent_encoding::percent_decode_str;

use super::{BodyReader, ConnInfo, ConnReader};
use crate::chunked::ChunkedDecoder;
use crate::config::ServerConfig;
use crate::future::timeout;
use crate::headers::Headers;
use crate::request::{normalize_path, Request};
use crate::version::HttpVersion;

const CONTINUE_HEADER_VALUE: &str = "100-continue";

/// The outcome of reading one request.
#[derive(Debug)]
pub(crate) enum Decoded {
    /// The client went away, idled out or sent a blank line. Nothing is answered.
    Eof,
    /// A request ready for dispatch.
    Request(Request),
    /// The request could not be parsed. It is answered with the error and
    /// the connection is closed.
    Failed(Request, http_types::Error),
}

enum Line {
    Complete(String),
    Partial(String),
    TooLong,
    Eof,
}

enum Framing {
    Chunked,
    Fixed(u64),
    None,
}

/// Decode a request.
///
/// Every read is bounded by `deadline`. A timeout before the request line is
/// an idle connection, after it a 408.
pub(crate) async fn decode(
    mut reader: ConnReader,
    continue_writer: Box<dyn AsyncWrite + Unpin + Send>,
    conn: &ConnInfo,
    config: &ServerConfig,
    deadline: Instant,
) -> Decoded {
    let line = match timeout(deadline, read_line(&mut reader, config.max_uri_length)).await {
        Ok(Ok(line)) => line,
        Ok(Err(_)) | Err(_) => return Decoded::Eof,
    };

    let mut req = Request::new(reader);
    req.peer_addr = conn.peer;
    req.local_addr = conn.local;
    req.remote_ip = conn.peer.map(|addr| addr.ip());
    req.input_buffer_size = config.input_buffer_size;
    req.max_body_size = config.max_body_size;
    req.server_name = config.server_name.clone();

    let line = match line {
        Line::Eof => return Decoded::Eof,
        Line::Complete(line) if line.trim().is_empty() => return Decoded::Eof,
        Line::Complete(line) => line,
        Line::Partial(line) => {
            req.request_line = Some(line.trim_end().to_owned());
            let err = format_err_status!(StatusCode::BadRequest, "bad Request-Line `{}`", line);
            return Decoded::Failed(req, err);
        }
        Line::TooLong => {
            let err = format_err_status!(StatusCode::UriTooLong, "request-URI too long");
            return Decoded::Failed(req, err);
        }
    };

    let mut reader = match req.take_body_reader() {
        Some(reader) => reader.into_inner(),
        None => return Decoded::Eof,
    };
    let parsed = timeout(
        deadline,
        parse_head(&mut req, &mut reader, &line, conn, config),
    )
    .await
    .unwrap_or_else(|_| Err(format_err_status!(StatusCode::RequestTimeout, "request timeout")));

    match parsed {
        Ok(framing) => {
            req.set_body_reader(match framing {
                Framing::Chunked => BodyReader::Chunked(ChunkedDecoder::new(reader)),
                Framing::Fixed(len) => BodyReader::Fixed(reader.take(len)),
                Framing::None => BodyReader::None(reader),
            });
            if wants_continue(&req, config) {
                req.continue_writer = Some(continue_writer);
            }
            Decoded::Request(req)
        }
        Err(err) => {
            req.set_body_reader(BodyReader::None(reader));
            req.keep_alive = false;
            Decoded::Failed(req, err)
        }
    }
}

async fn read_line(reader: &mut ConnReader, limit: usize) -> std::io::Result<Line> {
    let mut buf = Vec::new();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if buf.is_empty() {
                return Ok(Line::Eof);
            }
            return Ok(Line::Partial(String::from_utf8_lossy(&buf).into_owned()));
        }
        let (done, used) = match available.iter().position(|&b| b == b'\n') {
            Some(idx) => (true, idx + 1),
            None => (false, available.len()),
        };
        let room = limit.saturating_sub(buf.len());
        if used > room {
            buf.extend_from_slice(&available[..room]);
            reader.consume(room);
            return Ok(Line::TooLong);
        }
        buf.extend_from_slice(&available[..used]);
        reader.consume(used);
        if done {
            return Ok(Line::Complete(String::from_utf8_lossy(&buf).into_owned()));
        }
    }
}

fn strip_terminator(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

async fn parse_head(
    req: &mut Request,
    reader: &mut ConnReader,
    line: &str,
    conn: &ConnInfo,
    config: &ServerConfig,
) -> http_types::Result<Framing> {
    let request_line = strip_terminator(line);
    req.request_line = Some(request_line.to_owned());

    let (method, target, version) = parse_request_line(request_line)?;
    req.unparsed_uri = target.to_owned();
    req.version = version;
    req.method = Method::from_str(method).map_err(|_| {
        format_err_status!(StatusCode::NotImplemented, "unsupported method `{}`", method)
    })?;

    if version.major > 0 {
        req.headers = read_headers(reader, config.max_header_size).await?;
    }

    resolve_target(req, target, conn, config)?;

    req.keep_alive = if version.major == 0 {
        false
    } else {
        match connection_option(&req.headers) {
            Some(keep_alive) => keep_alive,
            None => version >= HttpVersion::HTTP_1_1,
        }
    };

    framing(&req.headers)
}

fn parse_request_line(line: &str) -> http_types::Result<(&str, &str, HttpVersion)> {
    let bad = || format_err_status!(StatusCode::BadRequest, "bad Request-Line `{}`", line);
    if line.starts_with(|c: char| c.is_ascii_whitespace()) {
        return Err(bad());
    }
    let mut parts = line.split_ascii_whitespace();
    let method = parts.next().ok_or_else(bad)?;
    let target = parts.next().ok_or_else(bad)?;
    let version = match parts.next() {
        Some(proto) => proto
            .strip_prefix("HTTP/")
            .ok_or_else(bad)?
            .parse::<HttpVersion>()?,
        None => HttpVersion::HTTP_0_9,
    };
    if parts.next().is_some() {
        return Err(bad());
    }
    Ok((method, target, version))
}

fn is_token(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

async fn read_headers(reader: &mut ConnReader, max_size: usize) -> http_types::Result<Headers> {
    let mut headers = Headers::new();
    let mut last: Option<String> = None;
    let mut total = 0;

    loop {
        let line = match read_line(reader, max_size.saturating_sub(total) + 1).await? {
            Line::Complete(line) => line,
            Line::Partial(line) => line,
            Line::Eof => break,
            Line::TooLong => bail_status!(StatusCode::BadRequest, "headers too large"),
        };
        let text = strip_terminator(&line);
        if text.is_empty() {
            break;
        }
        total += line.len();
        ensure_status!(total <= max_size, StatusCode::BadRequest, "headers too large");
        ensure_status!(!text.contains('\0'), StatusCode::BadRequest, "null byte in header");

        if text.starts_with(|c: char| c == ' ' || c == '\t') {
            let name = match &last {
                Some(name) => name,
                None => bail_status!(StatusCode::BadRequest, "bad header `{}`", text),
            };
            if let Some(value) = headers.get_all_mut(name).and_then(|values| values.last_mut()) {
                let continuation = text.trim();
                if !continuation.is_empty() {
                    value.push(' ');
                    value.push_str(continuation);
                }
            }
            continue;
        }

        let (name, value) = text
            .split_once(':')
            .filter(|(name, _)| is_token(name))
            .ok_or_else(|| format_err_status!(StatusCode::BadRequest, "bad header `{}`", text))?;
        headers.append(name, value.trim());
        last = Some(name.to_ascii_lowercase());
    }

    for single in &["content-length", "host"] {
        if let Some(values) = headers.get_all(single) {
            ensure_status!(values.len() == 1, StatusCode::BadRequest, "duplicate {} header", single);
        }
    }
    if let Some(len) = headers.first("content-length") {
        ensure_status!(
            !len.is_empty() && len.bytes().all(|b| b.is_ascii_digit()),
            StatusCode::BadRequest,
            "invalid content-length `{}`",
            len
        );
    }
    Ok(headers)
}

fn framing(headers: &Headers) -> http_types::Result<Framing> {
    if let Some(encoding) = headers.get("transfer-encoding") {
        ensure_status!(
            encoding.trim().eq_ignore_ascii_case("chunked"),
            StatusCode::NotImplemented,
            "unsupported transfer-encoding `{}`",
            encoding
        );
        return Ok(Framing::Chunked);
    }
    match headers.first("content-length") {
        Some(len) => {
            let len = len.parse::<u64>().map_err(|_| {
                format_err_status!(StatusCode::BadRequest, "invalid content-length `{}`", len)
            })?;
            Ok(Framing::Fixed(len))
        }
        None => Ok(Framing::None),
    }
}

fn connection_option(headers: &Headers) -> Option<bool> {
    let value = headers.get("connection")?;
    let mut keep_alive = None;
    for token in value.split(',').map(str::trim) {
        if token.eq_ignore_ascii_case("close") {
            return Some(false);
        }
        if token.eq_ignore_ascii_case("keep-alive") {
            keep_alive = Some(true);
        }
    }
    keep_alive
}

fn wants_continue(req: &Request, config: &ServerConfig) -> bool {
    req.version >= HttpVersion::HTTP_1_1
        && config.http_version >= HttpVersion::HTTP_1_1
        && req
            .headers
            .first("expect")
            .map(|value| value.eq_ignore_ascii_case(CONTINUE_HEADER_VALUE))
            .unwrap_or(false)
}

fn first_element(headers: &Headers, name: &str) -> Option<String> {
    headers
        .get(name)?
        .split(',')
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_owned)
}

fn default_port(scheme: &str) -> u16 {
    if scheme == "https" {
        443
    } else {
        80
    }
}

/// Split `host[:port]`, IPv6 literals in brackets.
fn split_host_port(s: &str) -> Option<(String, Option<u16>)> {
    let s = s.trim();
    let (host, port) = if s.starts_with('[') {
        let end = s.find(']')?;
        let rest = &s[end + 1..];
        let port = match rest.strip_prefix(':') {
            Some(port) => Some(port),
            None if rest.is_empty() => None,
            None => return None,
        };
        (&s[..=end], port)
    } else {
        match s.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (s, None),
        }
    };
    if host.is_empty() || host.contains(|c: char| c.is_whitespace() || c == '/') {
        return None;
    }
    let port = match port {
        Some(port) => Some(port.parse::<u16>().ok()?),
        None => None,
    };
    Some((host.to_owned(), port))
}

fn format_host(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(ip) => ip.to_string(),
        IpAddr::V6(ip) => format!("[{}]", ip),
    }
}

fn is_private_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => is_private_v4(ip),
        IpAddr::V6(ip) => {
            ip == Ipv6Addr::LOCALHOST || ip.to_ipv4_mapped().map(is_private_v4).unwrap_or(false)
        }
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    ip == Ipv4Addr::LOCALHOST || ip.is_private()
}

/// The first public address of `X-Forwarded-For`.
fn forwarded_for(headers: &Headers) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")?
        .split(',')
        .filter_map(|addr| addr.trim().parse::<IpAddr>().ok())
        .find(|ip| !is_private_address(*ip))
}

fn resolve_target(
    req: &mut Request,
    target: &str,
    conn: &ConnInfo,
    config: &ServerConfig,
) -> http_types::Result<()> {
    let bad_uri = || format_err_status!(StatusCode::BadRequest, "bad URI `{}`", target);

    let forwarded_proto = first_element(&req.headers, "x-forwarded-proto")
        .map(|proto| proto.to_ascii_lowercase());
    let scheme = forwarded_proto.unwrap_or_else(|| "http".to_owned());
    if let Some(server) = first_element(&req.headers, "x-forwarded-server") {
        req.server_name = server;
    }
    req.remote_ip = req
        .headers
        .first("client-ip")
        .and_then(|ip| ip.trim().parse().ok())
        .or_else(|| forwarded_for(&req.headers))
        .or(req.remote_ip);

    if target.starts_with("http://") || target.starts_with("https://") {
        let url = Url::parse(target).map_err(|_| bad_uri())?;
        let path = percent_decode_str(url.path())
            .decode_utf8()
            .map_err(|_| bad_uri())?;
        req.path = normalize_path(&path).ok_or_else(bad_uri)?;
        req.query_string = url.query().map(str::to_owned);
        return finish_url(req, url);
    }

    let (raw_path, query) = match target {
        "*" => ("", None),
        _ if target.starts_with('/') => match target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (target, None),
        },
        _ if req.method == Method::Connect => ("", None),
        _ => return Err(bad_uri()),
    };

    let forwarded_host = first_element(&req.headers, "x-forwarded-host")
        .and_then(|host| split_host_port(&host));
    let (host, port) = if req.method == Method::Connect && !target.starts_with('/') {
        let (host, port) = split_host_port(target).ok_or_else(bad_uri)?;
        (host, port.unwrap_or_else(|| default_port(&scheme)))
    } else if let Some((host, port)) = forwarded_host {
        (host, port.unwrap_or_else(|| default_port(&scheme)))
    } else if let Some(host) = req.headers.first("host") {
        let (host, port) = split_host_port(host).ok_or_else(|| {
            format_err_status!(StatusCode::BadRequest, "bad Host header `{}`", host)
        })?;
        (host, port.unwrap_or_else(|| default_port(&scheme)))
    } else if let Some(local) = conn.local {
        (format_host(local.ip()), local.port())
    } else {
        (
            config.server_name.clone(),
            config.port.unwrap_or_else(|| default_port(&scheme)),
        )
    };

    match target {
        "*" => req.path = "*".to_owned(),
        _ if raw_path.is_empty() => req.path = target.to_owned(),
        _ => {
            let path = percent_decode_str(raw_path)
                .decode_utf8()
                .map_err(|_| bad_uri())?;
            req.path = normalize_path(&path).ok_or_else(bad_uri)?;
        }
    }
    req.query_string = query.map(str::to_owned);

    let rest = if raw_path.is_empty() { "/" } else { target };
    let url = Url::parse(&format!("{}://{}:{}{}", scheme, host, port, rest)).map_err(|_| bad_uri())?;
    finish_url(req, url)
}

fn finish_url(req: &mut Request, url: Url) -> http_types::Result<()> {
    req.scheme = url.scheme().to_owned();
    req.host = url.host_str().unwrap_or_default().to_owned();
    req.port = url.port_or_known_default().unwrap_or(80);
    req.script_name = String::new();
    req.path_info = req.path.clone();
    req.url = Some(url);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::io::{AsyncRead, BufReader, Cursor};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn conn_reader(input: &str) -> ConnReader {
        let inner: Box<dyn AsyncRead + Unpin + Send> = Box::new(Cursor::new(input.as_bytes().to_vec()));
        BufReader::new(inner)
    }

    async fn decode_str(input: &str) -> Decoded {
        let config = ServerConfig::default().with_server_name("localhost");
        let deadline = Instant::now() + Duration::from_secs(5);
        decode(
            conn_reader(input),
            Box::new(futures_lite::io::sink()),
            &ConnInfo::default(),
            &config,
            deadline,
        )
        .await
    }

    async fn request(input: &str) -> Request {
        match decode_str(input).await {
            Decoded::Request(req) => req,
            other => panic!("expected a request, got {:?}", other),
        }
    }

    async fn failure(input: &str) -> u16 {
        match decode_str(input).await {
            Decoded::Failed(_, err) => err.status() as u16,
            other => panic!("expected a failure, got {:?}", other),
        }
    }

    #[async_std::test]
    async fn url_for_connect() {
        let req = request("CONNECT server.example.com:443 HTTP/1.1\r\nHost: server.example.com:443\r\n\r\n").await;
        assert_eq!(req.url().unwrap().as_str(), "http://server.example.com:443/");
    }

    #[async_std::test]
    async fn url_for_host_plus_path() {
        let req = request("GET /some/resource HTTP/1.1\r\nHost: server.example.com:443\r\n\r\n").await;
        assert_eq!(
            req.url().unwrap().as_str(),
            "http://server.example.com:443/some/resource"
        );
        assert_eq!(req.host(), "server.example.com");
        assert_eq!(req.port(), 443);
    }

    #[async_std::test]
    async fn url_for_host_plus_absolute_url() {
        let req = request("GET http://domain.com/some/resource HTTP/1.1\r\nHost: server.example.com\r\n\r\n").await;
        assert_eq!(req.url().unwrap().as_str(), "http://domain.com/some/resource");
    }

    #[async_std::test]
    async fn url_for_conflicting_connect() {
        let req = request("CONNECT server.example.com:443 HTTP/1.1\r\nHost: conflicting.host\r\n\r\n").await;
        assert_eq!(req.url().unwrap().as_str(), "http://server.example.com:443/");
    }

    #[async_std::test]
    async fn url_for_malformed_resource_path() {
        assert_eq!(failure("GET not-a-url HTTP/1.1\r\nHost: server.example.com\r\n\r\n").await, 400);
    }

    #[async_std::test]
    async fn blank_line_and_eof_end_the_stream() {
        assert!(matches!(decode_str("").await, Decoded::Eof));
        assert!(matches!(decode_str("\r\n").await, Decoded::Eof));
    }

    #[async_std::test]
    async fn request_line_errors() {
        assert_eq!(failure("GET / HTTP/1.1").await, 400);
        assert_eq!(failure(" GET / HTTP/1.1\r\n\r\n").await, 400);
        assert_eq!(failure("GET / HTTP/1.1 extra\r\n\r\n").await, 400);
        assert_eq!(failure("BREW /pot HTTP/1.1\r\n\r\n").await, 501);
        let long = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(3000));
        assert_eq!(failure(&long).await, 414);
    }

    #[test]
    fn host_port_splitting() {
        assert_eq!(split_host_port("example.com"), Some(("example.com".to_owned(), None)));
        assert_eq!(
            split_host_port("example.com:8080"),
            Some(("example.com".to_owned(), Some(8080)))
        );
        assert_eq!(split_host_port("[::1]:81"), Some(("[::1]".to_owned(), Some(81))));
        assert_eq!(split_host_port("[::1]"), Some(("[::1]".to_owned(), None)));
        assert_eq!(split_host_port("example.com:http"), None);
    }

    #[test]
    fn private_addresses() {
        for addr in &["127.0.0.1", "::1", "10.1.2.3", "172.16.0.1", "172.31.255.255", "192.168.1.1", "::ffff:10.0.0.1"] {
            assert!(is_private_address(addr.parse().unwrap()), "{}", addr);
        }
        for addr in &["123.123.123.123", "172.32.0.1", "127.0.0.2", "2001:db8::1"] {
            assert!(!is_private_address(addr.parse().unwrap()), "{}", addr);
        }
    }
}
