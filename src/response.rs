use std::convert::TryFrom;
use std::fmt;

use http_types::{Method, StatusCode, Url};

use crate::body::Body;
use crate::config::ServerConfig;
use crate::headers::Headers;
use crate::request::Request;
use crate::upgrade::Upgraded;
use crate::version::HttpVersion;
use crate::BoxFuture;

/// An HTTP response under construction.
///
/// Handlers fill in the status, headers and body. The engine finalizes the
/// head (length, keep-alive, defaults) when the response is sent.
pub struct Response {
    pub(crate) status: u16,
    pub(crate) reason: Option<String>,
    pub(crate) version: HttpVersion,
    pub(crate) headers: Headers,
    pub(crate) cookies: Vec<String>,
    pub(crate) body: Body,
    pub(crate) chunked: bool,
    pub(crate) keep_alive: bool,
    pub(crate) upgrade: Option<String>,
    pub(crate) sent_size: u64,
    pub(crate) request_method: Option<Method>,
    pub(crate) request_uri: Option<Url>,
    pub(crate) request_version: HttpVersion,
    pub(crate) server_software: String,
    pub(crate) server_name: String,
    pub(crate) server_port: Option<u16>,
    pub(crate) output_buffer_size: usize,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("cookies", &self.cookies)
            .field("body", &self.body)
            .field("chunked", &self.chunked)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

impl Response {
    pub(crate) fn new(config: &ServerConfig) -> Self {
        Self {
            status: 200,
            reason: None,
            version: config.http_version,
            headers: Headers::new(),
            cookies: Vec::new(),
            body: Body::empty(),
            chunked: false,
            keep_alive: true,
            upgrade: None,
            sent_size: 0,
            request_method: None,
            request_uri: None,
            request_version: config.http_version,
            server_software: config.server_software.clone(),
            server_name: config.server_name.clone(),
            server_port: config.port,
            output_buffer_size: config.output_buffer_size.max(1),
        }
    }

    /// Take over the request context: method, URI, version and the
    /// client's keep-alive wish.
    pub(crate) fn bind_request(&mut self, req: &Request) {
        self.request_method = Some(req.method);
        self.request_uri = req.url.clone();
        self.request_version = req.version;
        self.keep_alive = req.keep_alive;
    }

    /// The status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Set the status code, resetting the reason phrase.
    pub fn set_status(&mut self, status: impl Into<u16>) {
        self.status = status.into();
        self.reason = None;
    }

    /// The reason phrase sent with the status.
    pub fn reason_phrase(&self) -> String {
        match &self.reason {
            Some(reason) => reason.clone(),
            None => canonical_reason(self.status).to_owned(),
        }
    }

    /// Use a custom reason phrase.
    pub fn set_reason_phrase(&mut self, reason: impl Into<String>) {
        self.reason = Some(reason.into());
    }

    /// The protocol version the response is sent with.
    pub fn http_version(&self) -> HttpVersion {
        self.version
    }

    /// The response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// A response header, repeated fields joined with `", "`.
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers.get(name)
    }

    /// Set a header, replacing earlier values.
    ///
    /// Setting `Transfer-Encoding` also sets the chunked flag accordingly.
    pub fn insert_header(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        let name = name.as_ref();
        let value = value.into();
        if name.eq_ignore_ascii_case("transfer-encoding") {
            self.chunked = value.eq_ignore_ascii_case("chunked");
        }
        self.headers.insert(name, value);
    }

    /// Add a header value, keeping earlier ones.
    pub fn append_header(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        self.headers.append(name, value);
    }

    /// Remove a header.
    pub fn remove_header(&mut self, name: &str) -> Option<Vec<String>> {
        self.headers.remove(name)
    }

    /// Cookies sent as `Set-Cookie` fields.
    pub fn cookies(&self) -> &[String] {
        &self.cookies
    }

    /// Add a `Set-Cookie` value.
    pub fn add_cookie(&mut self, cookie: impl Into<String>) {
        self.cookies.push(cookie.into());
    }

    /// The response body.
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Replace the body.
    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    /// The `Content-Length` header, if set and valid.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .first("content-length")
            .and_then(|len| len.trim().parse().ok())
    }

    /// Set the `Content-Length` header.
    pub fn set_content_length(&mut self, len: u64) {
        self.headers.insert("content-length", len.to_string());
    }

    /// The `Content-Type` header.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.first("content-type")
    }

    /// Set the `Content-Type` header.
    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.headers.insert("content-type", content_type);
    }

    /// Whether the body is sent with chunked transfer-coding.
    pub fn chunked(&self) -> bool {
        self.chunked
    }

    /// Send the body with chunked transfer-coding.
    pub fn set_chunked(&mut self, chunked: bool) {
        self.chunked = chunked;
    }

    /// Whether the connection stays open after this response.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Keep the connection open, or close it after this response.
    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    /// Switch protocols: the head is sent with `Connection: upgrade` and
    /// `Upgrade: <protocol>`, then `f` owns the connection.
    pub fn upgrade<F>(&mut self, protocol: impl Into<String>, f: F)
    where
        F: FnOnce(Upgraded) -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.upgrade = Some(protocol.into());
        self.keep_alive = false;
        self.chunked = false;
        if !self.body.is_upgrade() {
            self.body = Body::upgrade(f);
        }
    }

    /// The protocol the response switches to, if any.
    pub fn upgrade_protocol(&self) -> Option<&str> {
        self.upgrade.as_deref()
    }

    /// Body bytes written to the client so far.
    pub fn sent_size(&self) -> u64 {
        self.sent_size
    }

    /// Redirect to `url` with the given status.
    pub fn set_redirect(&mut self, status: StatusCode, url: impl AsRef<str>) {
        let url = url.as_ref();
        let escaped = escape_html(url);
        self.set_status(status as u16);
        self.headers.insert("location", url);
        self.set_body(format!(
            "<HTML><A HREF=\"{}\">{}</A>.</HTML>\n",
            escaped, escaped
        ));
    }

    /// Turn the response into an error page for `err`.
    ///
    /// Error statuses close the connection. With `backtrace` the page
    /// includes the error's debug representation.
    pub fn set_error(&mut self, err: &http_types::Error, backtrace: bool) {
        let status = err.status() as u16;
        if status >= 400 {
            self.keep_alive = false;
        }
        self.set_status(status);
        self.chunked = false;
        self.headers
            .insert("content-type", "text/html; charset=ISO-8859-1");

        let (host, port) = match &self.request_uri {
            Some(uri) => (
                uri.host_str().unwrap_or_default().to_owned(),
                uri.port_or_known_default(),
            ),
            None => (self.server_name.clone(), self.server_port),
        };
        let port = port.map(|p| p.to_string()).unwrap_or_default();
        let reason = escape_html(&self.reason_phrase());

        let mut page = format!(
            "<!DOCTYPE HTML PUBLIC \"-//W3C//DTD HTML 4.0//EN\">\n\
             <HTML>\n  <HEAD><TITLE>{reason}</TITLE></HEAD>\n  <BODY>\n    \
             <H1>{reason}</H1>\n    {message}\n    <HR>\n",
            reason = reason,
            message = escape_html(&err.to_string()),
        );
        if backtrace {
            page.push_str(&format!(
                "    <PRE>{}</PRE><HR>\n",
                escape_html(&format!("{:?}", err))
            ));
        }
        page.push_str(&format!(
            "    <ADDRESS>\n     {} at\n     {}:{}\n    </ADDRESS>\n  </BODY>\n</HTML>\n",
            escape_html(&self.server_software),
            host,
            port
        ));
        self.headers.remove("content-length");
        self.body = Body::from(page);
    }

    pub(crate) fn status_line(&self) -> String {
        let line = format!(
            "HTTP/{} {} {}",
            self.version,
            self.status,
            self.reason_phrase()
        );
        format!("{}\r\n", line.trim_end())
    }

    pub(crate) fn is_bodyless_status(&self) -> bool {
        (100..200).contains(&self.status) || self.status == 204 || self.status == 304
    }
}

fn canonical_reason(status: u16) -> &'static str {
    StatusCode::try_from(status)
        .map(|status| status.canonical_reason())
        .unwrap_or("")
}

pub(crate) fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_follows_status() {
        let mut res = Response::new(&ServerConfig::default());
        assert_eq!(res.status_line(), "HTTP/1.1 200 OK\r\n");
        res.set_status(404u16);
        assert_eq!(res.reason_phrase(), "Not Found");
        res.set_status(599u16);
        assert_eq!(res.status_line(), "HTTP/1.1 599\r\n");
    }

    #[test]
    fn transfer_encoding_header_sets_chunked() {
        let mut res = Response::new(&ServerConfig::default());
        res.insert_header("Transfer-Encoding", "chunked");
        assert!(res.chunked());
        res.insert_header("transfer-encoding", "identity");
        assert!(!res.chunked());
    }

    #[test]
    fn error_page_escapes_message() {
        let mut res = Response::new(&ServerConfig::default());
        let err = http_types::Error::from_str(StatusCode::BadRequest, "bad <uri>");
        res.set_error(&err, false);
        assert_eq!(res.status(), 400);
        assert!(!res.keep_alive());
        assert_eq!(res.content_type(), Some("text/html; charset=ISO-8859-1"));
        match &res.body().kind {
            crate::body::Kind::Bytes(page) => {
                let page = String::from_utf8_lossy(page);
                assert!(page.contains("<TITLE>Bad Request</TITLE>"));
                assert!(page.contains("bad &lt;uri&gt;"));
            }
            _ => panic!("unexpected body {:?}", res.body()),
        }
    }

    #[test]
    fn redirect() {
        let mut res = Response::new(&ServerConfig::default());
        res.set_redirect(StatusCode::Found, "/elsewhere");
        assert_eq!(res.status(), 302);
        assert_eq!(res.header("location").as_deref(), Some("/elsewhere"));
    }
}
