use std::net::IpAddr;
use std::time::Duration;

use crate::logger::AccessLog;
use crate::version::HttpVersion;
use crate::{MAX_HEADER_LENGTH, MAX_URI_LENGTH};

/// Configure the server.
///
/// Every field is resolved once, when the [`Server`](crate::Server) is
/// constructed. Later changes to a config value have no effect on a running
/// server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the initial listener to. `None` binds all interfaces.
    pub bind_address: Option<IpAddr>,
    /// Port to bind the initial listener to. `Some(0)` picks a free port.
    pub port: Option<u16>,
    /// Maximum number of connections handled at once. Defaults to 100.
    pub max_clients: usize,
    /// How long to wait for a request, and for its head to arrive. Defaults to 30s.
    pub request_timeout: Duration,
    /// Size of the slices the request body is streamed in.
    pub input_buffer_size: usize,
    /// Size of the chunks a response body is written in.
    pub output_buffer_size: usize,
    /// Skip binding a listener at construction.
    pub do_not_listen: bool,
    /// Report peers by address only. Always true, no resolver is consulted.
    pub do_not_reverse_lookup: bool,
    /// The highest protocol version this server speaks.
    pub http_version: HttpVersion,
    /// Name used when a request carries no `Host`.
    pub server_name: String,
    /// Other names this server answers to.
    pub server_alias: Vec<String>,
    /// Value of the `Server` response header.
    pub server_software: String,
    /// Access log formats. Every completed request produces one record per format.
    pub access_log: Vec<AccessLog>,
    /// Maximum size of the request head.
    pub max_header_size: usize,
    /// Maximum length of the request line.
    pub max_uri_length: usize,
    /// Maximum size of a materialized request body, unbounded by default.
    pub max_body_size: Option<u64>,
    /// Include error details in error pages.
    pub debug_error_pages: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            port: None,
            max_clients: 100,
            request_timeout: Duration::from_secs(30),
            input_buffer_size: 64 * 1024,
            output_buffer_size: 64 * 1024,
            do_not_listen: false,
            do_not_reverse_lookup: true,
            http_version: HttpVersion::HTTP_1_1,
            server_name: default_server_name(),
            server_alias: Vec::new(),
            server_software: format!(
                "{}/{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ),
            access_log: vec![AccessLog::common(), AccessLog::referer()],
            max_header_size: MAX_HEADER_LENGTH,
            max_uri_length: MAX_URI_LENGTH,
            max_body_size: None,
            debug_error_pages: false,
        }
    }
}

fn default_server_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}

impl ServerConfig {
    /// Set the listening port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Set the listening address.
    pub fn with_bind_address(mut self, addr: IpAddr) -> Self {
        self.bind_address = Some(addr);
        self
    }

    /// Set the connection limit.
    pub fn with_max_clients(mut self, max_clients: usize) -> Self {
        self.max_clients = max_clients;
        self
    }

    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the server name.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    /// Set the protocol version.
    pub fn with_http_version(mut self, version: HttpVersion) -> Self {
        self.http_version = version;
        self
    }

    /// Don't bind a listener at construction.
    pub fn without_listener(mut self) -> Self {
        self.do_not_listen = true;
        self
    }

    /// Replace the access log formats.
    pub fn with_access_log(mut self, formats: Vec<AccessLog>) -> Self {
        self.access_log = formats;
        self
    }

    /// Set the maximum materialized body size.
    pub fn with_max_body_size(mut self, max: u64) -> Self {
        self.max_body_size = Some(max);
        self
    }
}
