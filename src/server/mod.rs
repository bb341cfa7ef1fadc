//! Process HTTP connections on the server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_lite::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use http_types::{Method, StatusCode};

use crate::config::ServerConfig;
use crate::error::{is_transport_error, is_transport_failure};
use crate::future::timeout;
use crate::listener::{ServerStatus, StatusHandle};
use crate::logger::Logger;
use crate::request::Request;
use crate::response::Response;
use crate::router::Router;
use crate::upgrade::Upgraded;
use crate::version::HttpVersion;

mod body_reader;
mod decode;
mod encode;

pub(crate) use body_reader::BodyReader;
use decode::{decode, Decoded};

/// The buffered read half of a connection.
pub(crate) type ConnReader = BufReader<Box<dyn AsyncRead + Unpin + Send>>;

/// How long a single readiness wait lasts before the server status is
/// checked again.
const POLL_SLICE: Duration = Duration::from_millis(500);

/// The endpoints of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnInfo {
    /// The client's address.
    pub peer: Option<SocketAddr>,
    /// The address the client connected to.
    pub local: Option<SocketAddr>,
}

/// Everything a connection worker needs from its server.
#[derive(Debug, Clone)]
pub struct Service {
    config: Arc<ServerConfig>,
    router: Arc<Router>,
    pub(crate) logger: Logger,
    access_logger: Logger,
    pub(crate) status: StatusHandle,
}

impl Service {
    /// A running service routing through `router`.
    pub fn new(config: ServerConfig, router: Arc<Router>) -> Self {
        Self {
            config: Arc::new(config),
            router,
            logger: Logger::default(),
            access_logger: Logger::access(),
            status: StatusHandle::new(ServerStatus::Running),
        }
    }

    /// Log operational messages to `logger`.
    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    /// Write access log records to `logger`.
    pub fn with_access_logger(mut self, logger: Logger) -> Self {
        self.access_logger = logger;
        self
    }

    /// Follow the status of a server. Connections close once it leaves `Running`.
    pub fn with_status(mut self, status: StatusHandle) -> Self {
        self.status = status;
        self
    }

    /// The configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The mount table.
    pub fn router(&self) -> &Router {
        &self.router
    }
}

/// Accept a new incoming HTTP/1.1 connection.
///
/// Requests are read and answered one after the other for as long as both
/// sides keep the connection alive. Failures are logged and answered, never
/// returned: the result is only an error if the connection could not be
/// served at all.
pub async fn accept<RW>(io: RW, conn: ConnInfo, service: &Service) -> http_types::Result<()>
where
    RW: AsyncRead + AsyncWrite + Clone + Send + Sync + Unpin + 'static,
{
    let config = service.config();
    let mut writer = io.clone();
    let inner: Box<dyn AsyncRead + Unpin + Send> = Box::new(io.clone());
    let mut reader: ConnReader = BufReader::with_capacity(config.input_buffer_size.max(1), inner);

    loop {
        if !wait_readable(&mut reader, service).await {
            break;
        }

        let deadline = Instant::now() + config.request_timeout;
        let mut res = Response::new(config);
        let mut req = match decode(reader, Box::new(io.clone()), &conn, config, deadline).await {
            Decoded::Eof => break,
            Decoded::Request(mut req) => {
                res.bind_request(&req);
                if let Err(err) = dispatch(&mut req, &mut res, service).await {
                    handle_error(&err, &mut res, service);
                }
                req
            }
            Decoded::Failed(req, err) => {
                res.bind_request(&req);
                handle_error(&err, &mut res, service);
                req
            }
        };

        if req.keep_alive && res.keep_alive {
            if req.expects_continue() {
                res.keep_alive = false;
            } else {
                let drain_deadline = Instant::now() + config.request_timeout;
                match timeout(drain_deadline, req.drain_body()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        service
                            .logger
                            .error(format_args!("could not read the rest of the request body: {}", err));
                        res.keep_alive = false;
                    }
                    Err(_) => {
                        service
                            .logger
                            .error(format_args!("timed out reading the rest of the request body"));
                        res.keep_alive = false;
                    }
                }
            }
        }

        let sent = encode::send(&mut res, &mut writer, &service.logger, config.debug_error_pages).await;
        if let Err(err) = &sent {
            if is_transport_error(err) {
                service.logger.debug(format_args!("{}", err));
            } else {
                service.logger.error(format_args!("{}", err));
            }
            res.keep_alive = false;
        }

        let elapsed = req.started.elapsed();
        for format in &config.access_log {
            service
                .access_logger
                .info(format_args!("{}", format.format(&req, &res, elapsed)));
        }

        if sent.is_ok() {
            if let Some(upgrade) = res.body.take_upgrade() {
                if let Some(reader) = req.into_conn_reader() {
                    upgrade(Upgraded::new(reader, Box::new(io.clone()))).await;
                }
                return Ok(());
            }
        }

        if config.http_version < HttpVersion::HTTP_1_1 || !req.keep_alive || !res.keep_alive {
            break;
        }
        reader = match req.into_conn_reader() {
            Some(reader) => reader,
            None => break,
        };
    }

    Ok(())
}

/// Wait until the next request starts arriving.
///
/// Gives up when the client closes the connection, the request timeout
/// passes, or the server stops running.
async fn wait_readable(reader: &mut ConnReader, service: &Service) -> bool {
    let deadline = Instant::now() + service.config.request_timeout;
    loop {
        if service.status.get() != ServerStatus::Running {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        match timeout((now + POLL_SLICE).min(deadline), reader.fill_buf()).await {
            Ok(Ok(buf)) => return !buf.is_empty(),
            Ok(Err(_)) => return false,
            Err(_) => continue,
        }
    }
}

async fn dispatch(req: &mut Request, res: &mut Response, service: &Service) -> http_types::Result<()> {
    if req.unparsed_uri == "*" {
        ensure_status!(
            req.method == Method::Options,
            StatusCode::NotFound,
            "`{}` not found.",
            req.unparsed_uri
        );
        res.insert_header("allow", "GET,HEAD,POST,OPTIONS");
        return Ok(());
    }

    let route = service
        .router()
        .lookup(&req.path)
        .ok_or_else(|| format_err_status!(StatusCode::NotFound, "`{}` not found.", req.path))?;
    req.script_name = route.script_name;
    req.path_info = route.path_info;
    route.handler.call(req, res).await
}

fn handle_error(err: &http_types::Error, res: &mut Response, service: &Service) {
    let status = err.status() as u16;
    if is_transport_failure(err) {
        service.logger.debug(format_args!("{}", err));
        res.keep_alive = false;
    } else if status >= 500 {
        service.logger.error(format_args!("{}", err));
    } else if status >= 400 {
        service.logger.info(format_args!("{}", err));
    }

    if status < 400 {
        res.set_status(status);
    } else {
        res.set_error(err, service.config.debug_error_pages && status >= 500);
    }
}
