#![no_main]
use libfuzzer_sys::fuzz_target;

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_h1d::auth::{Authenticator, DigestAuth, Htdigest};
use async_h1d::server::{accept, ConnInfo, Service};
use async_h1d::{Router, ServerConfig};
use futures_lite::io::{AsyncRead, AsyncWrite, Cursor};

#[derive(Clone, Debug)]
struct RwWrapper(Arc<Mutex<Cursor<Vec<u8>>>>);

impl RwWrapper {
    fn new(input: Vec<u8>) -> Self {
        Self(Arc::new(Mutex::new(Cursor::new(input))))
    }
}

impl AsyncRead for RwWrapper {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut *self.0.lock().unwrap()).poll_read(cx, buf)
    }
}

impl AsyncWrite for RwWrapper {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn service() -> Service {
    let router = Router::new();
    router.mount_proc("/", |req, res| {
        Box::pin(async move {
            let body = req.body().await?.to_vec();
            res.set_body(body);
            Ok(())
        })
    });

    let users = Htdigest::in_memory();
    users.set_passwd("fuzz", "user", "password");
    let auth = Arc::new(DigestAuth::new("fuzz", Arc::new(users)));
    router.mount_proc("/auth", move |req, res| {
        let auth = auth.clone();
        Box::pin(async move { auth.authenticate(req, res).await })
    });

    let config = ServerConfig::default()
        .with_server_name("localhost")
        .with_port(80)
        .without_listener()
        .with_access_log(Vec::new());
    Service::new(config, Arc::new(router))
}

fuzz_target!(|request: &[u8]| {
    let stream = RwWrapper::new(request.to_vec());
    let service = service();
    async_std::task::block_on(accept(stream, ConnInfo::default(), &service)).ok();
});
