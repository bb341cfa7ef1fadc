use std::sync::{Arc, Mutex};

use async_h1d::server::{accept, ConnInfo, Service};
use async_h1d::{Logger, Router, ServerConfig};
use futures_lite::io::AsyncWriteExt;
use log::{Level, Log, Metadata, Record};

use crate::test_utils::TestIO;

/// Keeps every record it is handed.
#[derive(Debug, Default)]
pub struct Capture {
    records: Mutex<Vec<(Level, String)>>,
}

impl Capture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lines(&self) -> Vec<String> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|(_, line)| line.clone())
            .collect()
    }

    #[allow(dead_code)]
    pub fn at(&self, level: Level) -> Vec<String> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, line)| line.clone())
            .collect()
    }

    #[allow(dead_code)]
    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|line| line.contains(needle))
    }
}

impl Log for Capture {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        self.records
            .lock()
            .unwrap()
            .push((record.level(), record.args().to_string()));
    }

    fn flush(&self) {}
}

/// A test harness around [`accept`]: whole request streams go in, the raw
/// response stream comes out.
#[allow(dead_code)]
pub struct Harness {
    pub router: Arc<Router>,
    pub config: ServerConfig,
    pub log: Arc<Capture>,
    pub access: Arc<Capture>,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            router: Arc::new(Router::new()),
            config: config
                .with_server_name("localhost")
                .with_port(8080)
                .without_listener(),
            log: Capture::new(),
            access: Capture::new(),
        }
    }

    pub fn service(&self) -> Service {
        Service::new(self.config.clone(), self.router.clone())
            .with_logger(Logger::new(self.log.clone()))
            .with_access_logger(Logger::new(self.access.clone()))
    }

    pub fn conn() -> ConnInfo {
        ConnInfo {
            peer: Some("127.0.0.1:50000".parse().unwrap()),
            local: Some("127.0.0.1:8080".parse().unwrap()),
        }
    }

    /// Send `input`, close the client's side and collect everything the
    /// server wrote before closing the connection.
    pub async fn exchange(&self, input: impl AsRef<[u8]>) -> String {
        let (mut client, server) = TestIO::new();
        client.write_all(input.as_ref()).await.unwrap();
        client.close();
        accept(server, Self::conn(), &self.service()).await.unwrap();
        client.received()
    }
}

/// Split a raw response stream into `(head, body)` pairs, using
/// `Content-Length` to find where each body ends. A response without one
/// takes the rest of the stream.
#[allow(dead_code)]
pub fn split_responses(mut raw: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    while !raw.is_empty() {
        let end = raw.find("\r\n\r\n").expect("incomplete head") + 4;
        let head = &raw[..end];
        let len = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if name.eq_ignore_ascii_case("content-length") {
                    value.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(raw.len() - end);
        out.push((head.to_owned(), raw[end..end + len].to_owned()));
        raw = &raw[end + len..];
    }
    out
}

/// The value of a header in a raw response head.
#[allow(dead_code)]
pub fn header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().find_map(|line| {
        let (n, value) = line.split_once(':')?;
        if n.eq_ignore_ascii_case(name) {
            Some(value.trim())
        } else {
            None
        }
    })
}
