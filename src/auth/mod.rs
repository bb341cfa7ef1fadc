//! HTTP Basic and Digest access authentication.
//!
//! An [`Authenticator`] is called from a handler. It either records the
//! authenticated user on the request, or fails with a challenge: the
//! `WWW-Authenticate` header is set on the response and the returned error
//! carries `401 Unauthorized`. Wrapping an authenticator in [`Proxy`] speaks
//! the proxy variant of the protocol instead (`Proxy-Authorization`,
//! `Proxy-Authenticate` and `407`).
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_h1d::auth::{Authenticator, BasicAuth, Htpasswd};
//! # fn mount(router: &async_h1d::Router) -> std::io::Result<()> {
//! let users = Htpasswd::open("/etc/app/htpasswd")?;
//! let auth = Arc::new(BasicAuth::new("admin area", Arc::new(users)));
//! router.mount_proc("/admin", move |req, res| {
//!     let auth = auth.clone();
//!     Box::pin(async move {
//!         auth.authenticate(req, res).await?;
//!         res.set_body(format!("hello {}", req.user().unwrap_or_default()));
//!         Ok(())
//!     })
//! });
//! # Ok(())
//! # }
//! ```

use std::fmt;

use http_types::StatusCode;

use crate::logger::{escape, Logger};
use crate::request::Request;
use crate::response::Response;
use crate::BoxFuture;

mod basic;
mod digest;
mod userdb;

pub use basic::BasicAuth;
pub use digest::{DigestAlgorithm, DigestAuth};
pub use userdb::{Htdigest, Htpasswd, PasswordHash, UserDb};

/// The header fields and status one side of the protocol uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthFields {
    /// Carries the client's credentials.
    pub request: &'static str,
    /// Carries the challenge.
    pub response: &'static str,
    /// Carries the server's authentication info after success.
    pub info: &'static str,
    /// The status a challenge is answered with.
    pub status: StatusCode,
}

impl AuthFields {
    /// Authentication with an origin server.
    pub const ORIGIN: AuthFields = AuthFields {
        request: "Authorization",
        response: "WWW-Authenticate",
        info: "Authentication-Info",
        status: StatusCode::Unauthorized,
    };

    /// Authentication with a proxy.
    pub const PROXY: AuthFields = AuthFields {
        request: "Proxy-Authorization",
        response: "Proxy-Authenticate",
        info: "Proxy-Authentication-Info",
        status: StatusCode::ProxyAuthenticationRequired,
    };
}

/// The outcome of checking credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The credentials are valid.
    Accepted,
    /// The credentials are wrong, challenge again.
    Rejected,
    /// The credentials are right but the nonce expired, challenge with
    /// `stale=true`.
    Stale,
}

/// An authentication scheme.
pub trait Authenticator: Send + Sync {
    /// The scheme name, `Basic` or `Digest`.
    fn scheme(&self) -> &'static str;

    /// The protected realm.
    fn realm(&self) -> &str;

    /// Where authentication events are logged.
    fn logger(&self) -> &Logger;

    /// The header fields this authenticator speaks.
    fn fields(&self) -> &AuthFields {
        &AuthFields::ORIGIN
    }

    /// Set a challenge on `res` and return the error to answer it with.
    fn challenge(
        &self,
        fields: &AuthFields,
        req: &Request,
        res: &mut Response,
        stale: bool,
    ) -> http_types::Error;

    /// Check the credentials following the scheme name.
    fn verify<'a>(
        &'a self,
        fields: &'a AuthFields,
        credentials: &'a str,
        req: &'a mut Request,
        res: &'a mut Response,
    ) -> BoxFuture<'a, http_types::Result<Verdict>>;

    /// Authenticate a request.
    ///
    /// On success the user is recorded on the request. Otherwise the
    /// response carries a challenge and the error its status.
    fn authenticate<'a>(
        &'a self,
        req: &'a mut Request,
        res: &'a mut Response,
    ) -> BoxFuture<'a, http_types::Result<()>> {
        Box::pin(async move {
            let fields = self.fields();
            let credentials = match credentials(self, fields, req) {
                Some(credentials) => credentials,
                None => return Err(self.challenge(fields, req, res, false)),
            };
            match self.verify(fields, &credentials, req, res).await? {
                Verdict::Accepted => Ok(()),
                Verdict::Rejected => Err(self.challenge(fields, req, res, false)),
                Verdict::Stale => Err(self.challenge(fields, req, res, true)),
            }
        })
    }
}

/// The credentials after the scheme name, if the request carries any for
/// this scheme.
fn credentials<A: Authenticator + ?Sized>(
    auth: &A,
    fields: &AuthFields,
    req: &Request,
) -> Option<String> {
    let value = match req.header(fields.request) {
        Some(value) => value,
        None => {
            log_error(auth, format_args!("no credentials in the request."));
            return None;
        }
    };
    let scheme = auth.scheme();
    let rest = value
        .get(..scheme.len())
        .filter(|prefix| prefix.eq_ignore_ascii_case(scheme))
        .map(|_| &value[scheme.len()..])
        .filter(|rest| rest.starts_with(|c: char| c.is_ascii_whitespace()));
    match rest {
        Some(rest) => Some(rest.trim_start().to_owned()),
        None => {
            log_error(auth, format_args!("invalid scheme in {}.", escape(&value)));
            None
        }
    }
}

pub(crate) fn log_error<A: Authenticator + ?Sized>(auth: &A, args: fmt::Arguments<'_>) {
    auth.logger()
        .error(format_args!("{} {}: {}", auth.scheme(), auth.realm(), args));
}

pub(crate) fn log_info<A: Authenticator + ?Sized>(auth: &A, args: fmt::Arguments<'_>) {
    auth.logger()
        .info(format_args!("{} {}: {}", auth.scheme(), auth.realm(), args));
}

/// Quote a parameter value, escaping `"` and `\`.
pub(crate) fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Speak the proxy variant of an authenticator's scheme.
#[derive(Debug)]
pub struct Proxy<A> {
    inner: A,
}

impl<A: Authenticator> Proxy<A> {
    /// Wrap an authenticator.
    pub fn new(inner: A) -> Self {
        Self { inner }
    }

    /// The wrapped authenticator.
    pub fn inner(&self) -> &A {
        &self.inner
    }
}

impl<A: Authenticator> Authenticator for Proxy<A> {
    fn scheme(&self) -> &'static str {
        self.inner.scheme()
    }

    fn realm(&self) -> &str {
        self.inner.realm()
    }

    fn logger(&self) -> &Logger {
        self.inner.logger()
    }

    fn fields(&self) -> &AuthFields {
        &AuthFields::PROXY
    }

    fn challenge(
        &self,
        fields: &AuthFields,
        req: &Request,
        res: &mut Response,
        stale: bool,
    ) -> http_types::Error {
        self.inner.challenge(fields, req, res, stale)
    }

    fn verify<'a>(
        &'a self,
        fields: &'a AuthFields,
        credentials: &'a str,
        req: &'a mut Request,
        res: &'a mut Response,
    ) -> BoxFuture<'a, http_types::Result<Verdict>> {
        self.inner.verify(fields, credentials, req, res)
    }
}
