use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use http_types::StatusCode;

use super::userdb::{lookup, verify_ssha256, UserDb, SSHA256_PREFIX};
use super::{log_error, log_info, quote, AuthFields, Authenticator, Verdict};
use crate::logger::{escape, Logger};
use crate::request::Request;
use crate::response::Response;
use crate::BoxFuture;

/// Basic authentication against an [`Htpasswd`](super::Htpasswd) style store.
pub struct BasicAuth {
    realm: String,
    userdb: Arc<dyn UserDb>,
    reload_db: bool,
    logger: Logger,
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("realm", &self.realm)
            .field("reload_db", &self.reload_db)
            .finish()
    }
}

impl BasicAuth {
    /// Protect `realm` with the users in `userdb`.
    pub fn new(realm: impl Into<String>, userdb: Arc<dyn UserDb>) -> Self {
        Self {
            realm: realm.into(),
            userdb,
            reload_db: false,
            logger: Logger::default(),
        }
    }

    /// Pick up changes to the user database file before each lookup.
    pub fn with_reload_db(mut self, reload: bool) -> Self {
        self.reload_db = reload;
        self
    }

    /// Log authentication events to `logger`.
    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }
}

async fn password_matches(password: String, hash: String) -> bool {
    if hash.starts_with("$2a$") || hash.starts_with("$2b$") || hash.starts_with("$2y$") {
        blocking::unblock(move || bcrypt::verify(password, &hash).unwrap_or(false)).await
    } else if hash.starts_with(SSHA256_PREFIX) {
        verify_ssha256(&password, &hash)
    } else {
        false
    }
}

impl Authenticator for BasicAuth {
    fn scheme(&self) -> &'static str {
        "Basic"
    }

    fn realm(&self) -> &str {
        &self.realm
    }

    fn logger(&self) -> &Logger {
        &self.logger
    }

    fn challenge(
        &self,
        fields: &AuthFields,
        _req: &Request,
        res: &mut Response,
        _stale: bool,
    ) -> http_types::Error {
        res.insert_header(fields.response, format!("Basic realm={}", quote(&self.realm)));
        http_types::Error::from_str(fields.status, fields.status.canonical_reason())
    }

    fn verify<'a>(
        &'a self,
        _fields: &'a AuthFields,
        credentials: &'a str,
        req: &'a mut Request,
        _res: &'a mut Response,
    ) -> BoxFuture<'a, http_types::Result<Verdict>> {
        Box::pin(async move {
            let decoded = STANDARD.decode(credentials.trim()).unwrap_or_default();
            let decoded = String::from_utf8_lossy(&decoded);
            let (user, password) = match decoded.split_once(':') {
                Some((user, password)) => (user.to_owned(), password.to_owned()),
                None => (decoded.into_owned(), String::new()),
            };
            if user.is_empty() {
                log_error(self, format_args!("user id was not given."));
                return Ok(Verdict::Rejected);
            }

            let hash = lookup(&self.userdb, &self.realm, &user, self.reload_db)
                .await
                .map_err(|err| http_types::Error::new(StatusCode::InternalServerError, err))?;
            let hash = match hash {
                Some(hash) => hash,
                None => {
                    log_error(self, format_args!("{}: the user is not allowed.", escape(&user)));
                    return Ok(Verdict::Rejected);
                }
            };

            if !password_matches(password, hash).await {
                log_error(self, format_args!("{}: password unmatch.", escape(&user)));
                return Ok(Verdict::Rejected);
            }
            log_info(self, format_args!("{}: authentication succeeded.", escape(&user)));
            req.set_user(user);
            Ok(Verdict::Accepted)
        })
    }
}
