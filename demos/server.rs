use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use async_h1d::auth::{Authenticator, BasicAuth, Htpasswd, PasswordHash};
use async_h1d::{Server, ServerConfig};

fn main() -> std::io::Result<()> {
    let config = ServerConfig::default()
        .with_bind_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .with_port(8080);
    let server = Server::new(config)?;
    println!("listening on {:?}", server.local_addrs());

    server.router().mount_proc("/", |req, res| {
        Box::pin(async move {
            res.set_body(format!("hello chashu, you asked for {}", req.path()));
            Ok(())
        })
    });

    let users = Htpasswd::in_memory().with_password_hash(PasswordHash::Ssha256);
    users.set_passwd("chashu", "meow")?;
    let auth = Arc::new(BasicAuth::new("cat tower", Arc::new(users)));
    server.router().mount_proc("/private", move |req, res| {
        let auth = auth.clone();
        Box::pin(async move {
            auth.authenticate(req, res).await?;
            res.set_body(format!("welcome back, {}", req.user().unwrap_or_default()));
            Ok(())
        })
    });

    async_global_executor::block_on(server.start())
}
