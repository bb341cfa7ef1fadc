//! The listening server: sockets, the connection slot pool and the accept loop.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::Poll;

use async_channel::{Receiver, Sender};
use async_io::Async;
use futures_lite::future;

use crate::config::ServerConfig;
use crate::error::{is_transport_error, HttpError};
use crate::logger::Logger;
use crate::router::Router;
use crate::server::{self, ConnInfo, Service};

/// The lifecycle state of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    /// Not accepting connections.
    Stopped,
    /// Accepting connections.
    Running,
    /// Asked to stop, the accept loop is winding down.
    ShuttingDown,
}

impl ServerStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ServerStatus::Running,
            2 => ServerStatus::ShuttingDown,
            _ => ServerStatus::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ServerStatus::Stopped => 0,
            ServerStatus::Running => 1,
            ServerStatus::ShuttingDown => 2,
        }
    }
}

/// A shared view of a server's status, observed by connection workers.
#[derive(Clone)]
pub struct StatusHandle(Arc<AtomicU8>);

impl fmt::Debug for StatusHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StatusHandle").field(&self.get()).finish()
    }
}

impl StatusHandle {
    /// A handle starting in `status`.
    pub fn new(status: ServerStatus) -> Self {
        Self(Arc::new(AtomicU8::new(status.as_u8())))
    }

    /// The current status.
    pub fn get(&self) -> ServerStatus {
        ServerStatus::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Force a status.
    pub fn set(&self, status: ServerStatus) {
        self.0.store(status.as_u8(), Ordering::SeqCst);
    }

    fn transition(&self, from: ServerStatus, to: ServerStatus) -> bool {
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Returns a connection slot to the pool when the worker holding it ends.
struct SlotGuard {
    pool: Sender<()>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let _ = self.pool.try_send(());
    }
}

enum Event {
    Readable(usize, io::Result<()>),
    Shutdown,
}

struct Inner {
    service: Service,
    listeners: Mutex<Vec<Arc<Async<TcpListener>>>>,
    slots: (Sender<()>, Receiver<()>),
    shutdown: Mutex<Option<Sender<()>>>,
}

/// An HTTP server.
///
/// Cloning gives another handle to the same server, which is how a running
/// server is stopped from elsewhere.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("status", &self.status())
            .field("local_addrs", &self.local_addrs())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn bind(addr: Option<IpAddr>, port: u16) -> io::Result<Async<TcpListener>> {
    let addr = addr.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    Async::<TcpListener>::bind(SocketAddr::new(addr, port))
}

impl Server {
    /// Create a server logging through the `log` facade.
    ///
    /// Unless `do_not_listen` is set a listener is bound on
    /// `bind_address:port`, and `port` is required. Port 0 resolves to the
    /// port actually bound.
    pub fn new(config: ServerConfig) -> io::Result<Self> {
        Self::with_loggers(config, Logger::default(), Logger::access())
    }

    /// Create a server with injected operational and access loggers.
    pub fn with_loggers(
        mut config: ServerConfig,
        logger: Logger,
        access_logger: Logger,
    ) -> io::Result<Self> {
        let mut listeners = Vec::new();
        if !config.do_not_listen {
            let port = config.port.ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "a port is required to listen")
            })?;
            let listener = bind(config.bind_address, port)?;
            let local = listener.get_ref().local_addr()?;
            logger.info(format_args!("TCPServer.new({}, {})", local.ip(), local.port()));
            config.port = Some(local.port());
            listeners.push(Arc::new(listener));
        }

        let max_clients = config.max_clients.max(1);
        let slots = async_channel::bounded(max_clients);
        for _ in 0..max_clients {
            slots
                .0
                .try_send(())
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;
        }

        let router = Arc::new(Router::with_logger(logger.clone()));
        let service = Service::new(config, router)
            .with_logger(logger)
            .with_access_logger(access_logger)
            .with_status(StatusHandle::new(ServerStatus::Stopped));

        Ok(Self {
            inner: Arc::new(Inner {
                service,
                listeners: Mutex::new(listeners),
                slots,
                shutdown: Mutex::new(None),
            }),
        })
    }

    /// The mount table.
    pub fn router(&self) -> &Router {
        self.inner.service.router()
    }

    /// The resolved configuration.
    pub fn config(&self) -> &ServerConfig {
        self.inner.service.config()
    }

    /// The operational logger.
    pub fn logger(&self) -> &Logger {
        &self.inner.service.logger
    }

    /// The current status.
    pub fn status(&self) -> ServerStatus {
        self.inner.service.status.get()
    }

    /// Connections being handled right now.
    pub fn in_flight(&self) -> usize {
        self.config().max_clients.max(1) - self.inner.slots.1.len()
    }

    /// The addresses of every listener.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        lock(&self.inner.listeners)
            .iter()
            .filter_map(|listener| listener.get_ref().local_addr().ok())
            .collect()
    }

    /// Bind another listener, returning its address.
    pub fn listen(&self, addr: Option<IpAddr>, port: u16) -> io::Result<SocketAddr> {
        let listener = bind(addr, port)?;
        let local = listener.get_ref().local_addr()?;
        self.logger()
            .info(format_args!("TCPServer.new({}, {})", local.ip(), local.port()));
        lock(&self.inner.listeners).push(Arc::new(listener));
        Ok(local)
    }

    /// Run the accept loop until the server is stopped.
    ///
    /// Fails if the server is already running, or if the accept loop hits a
    /// fatal error. Listeners are closed when the loop ends.
    pub async fn start(&self) -> io::Result<()> {
        let status = &self.inner.service.status;
        if !status.transition(ServerStatus::Stopped, ServerStatus::Running) {
            return Err(HttpError::AlreadyStarted.into());
        }
        let (tx, rx) = async_channel::unbounded();
        *lock(&self.inner.shutdown) = Some(tx);

        let config = self.config();
        let mut names = config.server_name.clone();
        for alias in &config.server_alias {
            names.push_str(", ");
            names.push_str(alias);
        }
        self.logger().info(format_args!(
            "{}#start: port={} serving {}",
            config.server_software,
            config.port.map(|p| p.to_string()).unwrap_or_default(),
            names
        ));

        let result = self.accept_loop(&rx).await;
        if let Err(err) = &result {
            self.logger().fatal(format_args!("{}", err));
        }

        self.logger().info(format_args!("going to shutdown ..."));
        lock(&self.inner.shutdown).take();
        for listener in lock(&self.inner.listeners).drain(..) {
            if let Ok(addr) = listener.get_ref().local_addr() {
                self.logger().debug(format_args!("close TCPSocket({}, {})", addr.ip(), addr.port()));
            }
        }
        status.set(ServerStatus::Stopped);
        result
    }

    async fn accept_loop(&self, shutdown: &Receiver<()>) -> io::Result<()> {
        while self.status() == ServerStatus::Running {
            let listeners: Vec<_> = lock(&self.inner.listeners).clone();

            let readable = future::poll_fn(|cx| {
                for (idx, listener) in listeners.iter().enumerate() {
                    if let Poll::Ready(res) = listener.poll_readable(cx) {
                        return Poll::Ready(Event::Readable(idx, res));
                    }
                }
                Poll::Pending
            });
            let stop = async {
                let _ = shutdown.recv().await;
                Event::Shutdown
            };

            let (idx, ready) = match future::or(stop, readable).await {
                Event::Shutdown => continue,
                Event::Readable(idx, ready) => (idx, ready),
            };
            let listener = &listeners[idx];
            if let Err(err) = ready {
                self.logger()
                    .debug(format_args!("dropping listener after readiness error: {}", err));
                lock(&self.inner.listeners).retain(|l| !Arc::ptr_eq(l, listener));
                continue;
            }

            self.inner.slots.1.recv().await.map_err(|_| {
                io::Error::new(io::ErrorKind::Other, "connection slot pool closed")
            })?;
            let slot = SlotGuard {
                pool: self.inner.slots.0.clone(),
            };

            match listener.get_ref().accept() {
                Ok((stream, peer)) => self.spawn_worker(stream, peer, slot),
                Err(err) if is_transient_accept_error(&err) => drop(slot),
                Err(err) => {
                    self.logger().error(format_args!("accept: {}", err));
                    drop(slot);
                }
            }
        }
        Ok(())
    }

    fn spawn_worker(&self, stream: std::net::TcpStream, peer: SocketAddr, slot: SlotGuard) {
        let local = stream.local_addr().ok();
        let stream = match Async::new(stream) {
            Ok(stream) => async_dup::Arc::new(stream),
            Err(err) => {
                self.logger().error(format_args!("accept: {}", err));
                return;
            }
        };
        let service = self.inner.service.clone();
        let conn = ConnInfo {
            peer: Some(peer),
            local,
        };
        async_global_executor::spawn(async move {
            let _slot = slot;
            service.logger.debug(format_args!("accept: {}", peer));
            if let Err(err) = server::accept(stream, conn, &service).await {
                match err.downcast_ref::<io::Error>() {
                    Some(err) if is_transport_error(err) => {
                        service.logger.debug(format_args!("{}: {}", peer, err))
                    }
                    _ => service.logger.error(format_args!("{}: {}", peer, err)),
                }
            }
            service.logger.debug(format_args!("close: {}", peer));
        })
        .detach();
    }

    /// Stop accepting connections. In-flight workers finish on their own.
    pub fn stop(&self) {
        let status = &self.inner.service.status;
        if status.transition(ServerStatus::Running, ServerStatus::ShuttingDown) {
            if let Some(tx) = lock(&self.inner.shutdown).as_ref() {
                let _ = tx.try_send(());
            }
        }
    }

    /// Stop, and close the shutdown channel.
    pub fn shutdown(&self) {
        self.stop();
        if let Some(tx) = lock(&self.inner.shutdown).as_ref() {
            tx.close();
        }
    }
}

fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
    )
}
