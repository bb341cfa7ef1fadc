//! Request handlers.

use std::fmt;
use std::sync::Arc;

use crate::body::Body;
use crate::headers::Headers;
use crate::request::Request;
use crate::response::Response;
use crate::router::MountOptions;
use crate::BoxFuture;

/// Handles requests routed to a mount point.
///
/// Returning an error answers the request with an error page carrying the
/// error's status.
pub trait Handler: Send + Sync + 'static {
    /// Handle one request.
    fn call<'a>(
        &'a self,
        req: &'a mut Request,
        res: &'a mut Response,
    ) -> BoxFuture<'a, http_types::Result<()>>;
}

/// A handler backed by a closure.
pub struct Proc<F> {
    f: F,
}

impl<F> Proc<F>
where
    F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, http_types::Result<()>>
        + Send
        + Sync
        + 'static,
{
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> fmt::Debug for Proc<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Proc")
    }
}

impl<F> Handler for Proc<F>
where
    F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, http_types::Result<()>>
        + Send
        + Sync
        + 'static,
{
    fn call<'a>(
        &'a self,
        req: &'a mut Request,
        res: &'a mut Response,
    ) -> BoxFuture<'a, http_types::Result<()>> {
        (self.f)(req, res)
    }
}

/// The `(status, headers, body)` triple an [`App`] returns.
pub type AppResponse = (u16, Headers, Body);

/// A handler in the application-call style: the request goes in, a
/// status/headers/body triple comes out.
///
/// `set-cookie` values become cookies, other repeated headers are joined
/// with `", "`. An upgrade body switches protocols to the `Upgrade` header
/// of the triple, or of the request.
pub struct App<F> {
    f: F,
}

impl<F> App<F>
where
    F: for<'a> Fn(&'a mut Request) -> BoxFuture<'a, http_types::Result<AppResponse>>
        + Send
        + Sync
        + 'static,
{
    /// Wrap an application.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> fmt::Debug for App<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("App")
    }
}

impl<F> Handler for App<F>
where
    F: for<'a> Fn(&'a mut Request) -> BoxFuture<'a, http_types::Result<AppResponse>>
        + Send
        + Sync
        + 'static,
{
    fn call<'a>(
        &'a self,
        req: &'a mut Request,
        res: &'a mut Response,
    ) -> BoxFuture<'a, http_types::Result<()>> {
        Box::pin(async move {
            let (status, headers, mut body) = (self.f)(&mut *req).await?;
            res.set_status(status);
            for (name, values) in headers.iter() {
                if name == "set-cookie" {
                    for cookie in values {
                        res.add_cookie(cookie.clone());
                    }
                } else {
                    res.insert_header(name, values.join(", "));
                }
            }
            match body.take_upgrade() {
                Some(upgrade) => {
                    let protocol = headers
                        .get("upgrade")
                        .or_else(|| req.header("upgrade"))
                        .unwrap_or_default();
                    res.upgrade(protocol, upgrade);
                }
                None => res.set_body(body),
            }
            Ok(())
        })
    }
}

type MakeHandler = dyn Fn(&MountOptions) -> Arc<dyn Handler> + Send + Sync;

/// Builds a handler instance from the options bound at mount time.
#[derive(Clone)]
pub struct HandlerFactory {
    make: Arc<MakeHandler>,
}

impl HandlerFactory {
    /// Wrap a constructor.
    pub fn new<F>(make: F) -> Self
    where
        F: Fn(&MountOptions) -> Arc<dyn Handler> + Send + Sync + 'static,
    {
        Self {
            make: Arc::new(make),
        }
    }

    /// A factory that hands out the same instance every time.
    pub fn shared(handler: Arc<dyn Handler>) -> Self {
        Self::new(move |_| handler.clone())
    }

    /// Build a handler.
    pub fn instance(&self, options: &MountOptions) -> Arc<dyn Handler> {
        (self.make)(options)
    }
}

impl fmt::Debug for HandlerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HandlerFactory")
    }
}
