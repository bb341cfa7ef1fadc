use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use http_types::StatusCode;
use rand::distributions::Alphanumeric;
use rand::Rng;

use super::userdb::{lookup, md5_hex, UserDb};
use super::{log_error, log_info, quote, AuthFields, Authenticator, Verdict};
use crate::logger::{escape, Logger};
use crate::request::Request;
use crate::response::Response;
use crate::BoxFuture;

/// Credentials longer than this are refused without being parsed.
const MAX_CREDENTIALS_LENGTH: usize = 4096;

const MUST_PARAMS: &[&str] = &["username", "realm", "nonce", "uri", "response"];
const MUST_PARAMS_WITH_QOP: &[&str] = &["cnonce", "nc"];

/// The digest algorithm a [`DigestAuth`] asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    /// `MD5`: `A1` is the stored hash.
    Md5,
    /// `MD5-sess`: `A1` also covers the nonce and the client nonce.
    Md5Sess,
}

impl DigestAlgorithm {
    /// The name used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Md5Sess => "MD5-sess",
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What was handed out with a challenge.
#[derive(Debug)]
struct Opaque {
    issued: i64,
    /// The highest nonce count seen for each nonce used with this opaque.
    counts: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct Issued {
    opaques: HashMap<String, Opaque>,
    last_pruned: i64,
}

enum NonceState {
    Fresh,
    Expired,
    Invalid,
}

/// Digest authentication against an [`Htdigest`](super::Htdigest) store.
///
/// Nonces carry their issue time and a keyed hash, so they are checked
/// without server state. Opaques are remembered until the nonce expiry
/// period has passed and track the nonce count clients send with them,
/// which rejects replayed credentials.
pub struct DigestAuth {
    realm: String,
    userdb: Arc<dyn UserDb>,
    reload_db: bool,
    logger: Logger,
    algorithm: DigestAlgorithm,
    qop: Vec<String>,
    domain: Vec<String>,
    use_opaque: bool,
    use_auth_info_header: bool,
    internet_explorer_hack: bool,
    nonce_expire_period: Duration,
    nonce_expire_delta: Duration,
    instance_key: String,
    issued: Mutex<Issued>,
}

impl fmt::Debug for DigestAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestAuth")
            .field("realm", &self.realm)
            .field("algorithm", &self.algorithm)
            .field("qop", &self.qop)
            .field("use_opaque", &self.use_opaque)
            .finish()
    }
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn hexdigest(parts: &[&str]) -> String {
    md5_hex(parts.join(":"))
}

impl DigestAuth {
    /// Protect `realm` with the users in `userdb`.
    pub fn new(realm: impl Into<String>, userdb: Arc<dyn UserDb>) -> Self {
        Self {
            realm: realm.into(),
            userdb,
            reload_db: false,
            logger: Logger::default(),
            algorithm: DigestAlgorithm::Md5Sess,
            qop: vec!["auth".to_owned()],
            domain: Vec::new(),
            use_opaque: true,
            use_auth_info_header: true,
            internet_explorer_hack: true,
            nonce_expire_period: Duration::from_secs(30 * 60),
            nonce_expire_delta: Duration::from_secs(60),
            instance_key: random_string(16),
            issued: Mutex::new(Issued::default()),
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

    /// Ask for `algorithm`. Defaults to `MD5-sess`.
    pub fn with_algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// The accepted quality of protection values, `auth` and `auth-int`.
    /// An empty list speaks the RFC 2069 variant without `qop`.
    pub fn with_qop(mut self, qop: Vec<String>) -> Self {
        self.qop = qop;
        self
    }

    /// Announce the protection space in the challenge.
    pub fn with_domain(mut self, domain: Vec<String>) -> Self {
        self.domain = domain;
        self
    }

    /// Whether challenges carry an opaque. Nonce counts are only tracked
    /// through opaques.
    pub fn with_opaque(mut self, use_opaque: bool) -> Self {
        self.use_opaque = use_opaque;
        self
    }

    /// Whether successful responses carry an `Authentication-Info` header.
    pub fn with_auth_info_header(mut self, enabled: bool) -> Self {
        self.use_auth_info_header = enabled;
        self
    }

    /// Accept a `uri` parameter equal to the request path without its query.
    pub fn with_internet_explorer_hack(mut self, enabled: bool) -> Self {
        self.internet_explorer_hack = enabled;
        self
    }

    /// How long a nonce stays valid, and how often stale opaques are pruned.
    pub fn with_nonce_expiry(mut self, period: Duration, delta: Duration) -> Self {
        self.nonce_expire_period = period;
        self.nonce_expire_delta = delta;
        self
    }

    /// The key nonces are signed with. Servers sharing a key accept each
    /// other's nonces.
    pub fn with_instance_key(mut self, key: impl Into<String>) -> Self {
        self.instance_key = key.into();
        self
    }

    fn issued(&self) -> MutexGuard<'_, Issued> {
        self.issued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn generate_nonce(&self, now: i64) -> String {
        let time = format!("{:012}", now);
        let key = hexdigest(&[time.as_str(), self.instance_key.as_str()]);
        STANDARD.encode(format!("{}:{}", time, &key[..32]))
    }

    fn generate_opaque(&self, now: i64) -> String {
        let mut issued = self.issued();
        let period = self.nonce_expire_period.as_secs() as i64;
        if now - issued.last_pruned > self.nonce_expire_delta.as_secs() as i64 {
            issued.opaques.retain(|_, opaque| now - opaque.issued <= period);
            issued.last_pruned = now;
        }
        loop {
            let opaque = random_string(16);
            if !issued.opaques.contains_key(&opaque) {
                issued.opaques.insert(
                    opaque.clone(),
                    Opaque {
                        issued: now,
                        counts: HashMap::new(),
                    },
                );
                return opaque;
            }
        }
    }

    fn check_nonce(&self, user: &str, nonce: &str, now: i64) -> NonceState {
        let decoded = STANDARD
            .decode(nonce)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .unwrap_or_default();
        let (time, key) = match decoded.split_once(':') {
            Some(pair) => pair,
            None => {
                log_error(self, format_args!("{}: empty nonce is given.", user));
                return NonceState::Invalid;
            }
        };
        let expected = hexdigest(&[time, self.instance_key.as_str()]);
        let issued: i64 = match time.parse() {
            Ok(issued) if key == &expected[..32] => issued,
            _ => {
                log_error(
                    self,
                    format_args!("{}: invalid private-key: {} for {}.", user, escape(key), expected),
                );
                return NonceState::Invalid;
            }
        };
        let diff = now - issued;
        if diff < 0 {
            log_error(self, format_args!("{}: difference of time-stamp is negative.", user));
            NonceState::Invalid
        } else if diff > self.nonce_expire_period.as_secs() as i64 {
            log_error(self, format_args!("{}: nonce is expired.", user));
            NonceState::Expired
        } else {
            NonceState::Fresh
        }
    }

    /// Record the nonce count sent with an opaque. `None` if the opaque is
    /// unknown, `Some(false)` if the count was already seen.
    fn check_count(&self, opaque: &str, nonce: &str, nc: Option<u64>) -> Option<bool> {
        let mut issued = self.issued();
        let entry = issued.opaques.get_mut(opaque)?;
        let nc = match nc {
            Some(nc) => nc,
            None => return Some(true),
        };
        let last = entry.counts.entry(nonce.to_owned()).or_insert(0);
        if nc <= *last {
            return Some(false);
        }
        *last = nc;
        Some(true)
    }

    fn uri_matches(&self, uri: &str, req: &Request) -> bool {
        req.url().map_or(false, |url| url.as_str() == uri)
            || req.unparsed_uri() == uri
            || (self.internet_explorer_hack && req.path() == uri)
    }
}

/// Parse `key=token` and `key="quoted string"` pairs separated by commas.
///
/// Keys are lower-cased. Returns `None` on malformed input, including an
/// unterminated quoted string.
fn parse_params(input: &str) -> Option<HashMap<String, String>> {
    let bytes = input.as_bytes();
    let len = bytes.len();
    let mut params = HashMap::new();
    let mut i = 0;
    let skip_ws = |i: &mut usize| {
        while *i < len && (bytes[*i] == b' ' || bytes[*i] == b'\t') {
            *i += 1;
        }
    };

    loop {
        while i < len && (bytes[i] == b',' || bytes[i] == b' ' || bytes[i] == b'\t') {
            i += 1;
        }
        if i == len {
            break;
        }

        let start = i;
        while i < len && bytes[i] != b'=' && bytes[i] != b',' && !bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if start == i {
            return None;
        }
        let key = input[start..i].to_ascii_lowercase();
        skip_ws(&mut i);
        if i == len || bytes[i] != b'=' {
            return None;
        }
        i += 1;
        skip_ws(&mut i);

        let value = if i < len && bytes[i] == b'"' {
            i += 1;
            let mut value = Vec::new();
            loop {
                match bytes.get(i)? {
                    b'\\' => {
                        i += 1;
                        value.push(*bytes.get(i)?);
                    }
                    b'"' => break,
                    b => value.push(*b),
                }
                i += 1;
            }
            i += 1;
            String::from_utf8(value).ok()?
        } else {
            let start = i;
            while i < len && bytes[i] != b',' && !bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            input[start..i].to_owned()
        };
        params.insert(key, value);

        skip_ws(&mut i);
        if i < len && bytes[i] != b',' {
            return None;
        }
    }
    Some(params)
}

impl Authenticator for DigestAuth {
    fn scheme(&self) -> &'static str {
        "Digest"
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
        req: &Request,
        res: &mut Response,
        stale: bool,
    ) -> http_types::Error {
        let now = req.request_time().timestamp();
        let mut params = vec![format!("realm={}", quote(&self.realm))];
        if !self.domain.is_empty() {
            params.push(format!("domain={}", quote(&self.domain.join(" "))));
        }
        params.push(format!("nonce={}", quote(&self.generate_nonce(now))));
        if self.use_opaque {
            params.push(format!("opaque={}", quote(&self.generate_opaque(now))));
        }
        params.push(format!("stale={}", stale));
        params.push(format!("algorithm={}", self.algorithm));
        if !self.qop.is_empty() {
            params.push(format!("qop={}", quote(&self.qop.join(","))));
        }
        res.insert_header(fields.response, format!("Digest {}", params.join(", ")));
        http_types::Error::from_str(fields.status, fields.status.canonical_reason())
    }

    fn verify<'a>(
        &'a self,
        fields: &'a AuthFields,
        credentials: &'a str,
        req: &'a mut Request,
        res: &'a mut Response,
    ) -> BoxFuture<'a, http_types::Result<Verdict>> {
        Box::pin(async move {
            ensure_status!(
                credentials.len() <= MAX_CREDENTIALS_LENGTH,
                StatusCode::BadRequest,
                "digest credentials too long"
            );
            let params = parse_params(credentials).ok_or_else(|| {
                log_error(self, format_args!("malformed digest credentials."));
                format_err_status!(StatusCode::BadRequest, "malformed digest credentials")
            })?;
            let param = |key: &str| params.get(key).map(String::as_str);

            let user = escape(param("username").unwrap_or_default());
            let qop = param("qop");
            let required = MUST_PARAMS
                .iter()
                .chain(qop.map_or(&[][..], |_| MUST_PARAMS_WITH_QOP));
            for key in required {
                if param(*key).is_none() {
                    log_error(self, format_args!("{}: parameter missing. \"{}\"", user, key));
                    bail_status!(StatusCode::BadRequest, "digest parameter missing: {}", key);
                }
            }
            let username = param("username").unwrap_or_default();
            let nonce = param("nonce").unwrap_or_default();
            let uri = param("uri").unwrap_or_default();

            if !self.uri_matches(uri, req) {
                log_error(
                    self,
                    format_args!("{}: uri unmatch. \"{}\" for \"{}\"", user, escape(uri), req.unparsed_uri()),
                );
                bail_status!(StatusCode::BadRequest, "digest uri does not match the request");
            }
            if param("realm") != Some(self.realm.as_str()) {
                log_error(self, format_args!("{}: realm unmatch.", user));
                return Ok(Verdict::Rejected);
            }
            let algorithm = param("algorithm").unwrap_or("MD5");
            if !algorithm.eq_ignore_ascii_case(self.algorithm.as_str()) {
                log_error(
                    self,
                    format_args!("{}: algorithm unmatch. \"{}\" for \"{}\"", user, escape(algorithm), self.algorithm),
                );
                return Ok(Verdict::Rejected);
            }
            let qop_allowed = match qop {
                Some(qop) => self.qop.iter().any(|allowed| allowed == qop),
                None => self.qop.is_empty(),
            };
            if !qop_allowed {
                log_error(self, format_args!("{}: \"{}\" is not allowed as qop.", user, escape(qop.unwrap_or_default())));
                return Ok(Verdict::Rejected);
            }

            let stored = lookup(&self.userdb, &self.realm, username, self.reload_db)
                .await
                .map_err(|err| http_types::Error::new(StatusCode::InternalServerError, err))?;
            let stored = match stored {
                Some(stored) => stored,
                None => {
                    log_error(self, format_args!("{}: the user is not allowed.", user));
                    return Ok(Verdict::Rejected);
                }
            };

            let now = req.request_time().timestamp();
            let nonce_state = self.check_nonce(&user, nonce, now);
            if let NonceState::Invalid = nonce_state {
                return Ok(Verdict::Rejected);
            }

            let cnonce = param("cnonce").unwrap_or_default();
            let nc = param("nc").unwrap_or_default();
            let ha1 = match self.algorithm {
                DigestAlgorithm::Md5 => stored,
                DigestAlgorithm::Md5Sess => hexdigest(&[stored.as_str(), nonce, cnonce]),
            };
            let body_hash = if qop == Some("auth-int") {
                Some(md5_hex(req.body().await?))
            } else {
                None
            };
            let digest_for = |method: &str| {
                let ha2 = match &body_hash {
                    Some(hash) => hexdigest(&[method, uri, hash.as_str()]),
                    None => hexdigest(&[method, uri]),
                };
                match qop {
                    Some(qop) => hexdigest(&[ha1.as_str(), nonce, nc, cnonce, qop, ha2.as_str()]),
                    None => hexdigest(&[ha1.as_str(), nonce, ha2.as_str()]),
                }
            };

            if param("response") != Some(digest_for(&req.method().to_string()).as_str()) {
                log_error(self, format_args!("{}: digest unmatch.", user));
                return Ok(Verdict::Rejected);
            }
            if let NonceState::Expired = nonce_state {
                log_error(self, format_args!("{}: digest is valid, but nonce is not valid.", user));
                return Ok(Verdict::Stale);
            }
            if self.use_opaque {
                let count = match u64::from_str_radix(nc, 16) {
                    Ok(count) => Some(count),
                    Err(_) if qop.is_none() => None,
                    Err(_) => {
                        log_error(self, format_args!("{}: nc is not valid.", user));
                        return Ok(Verdict::Rejected);
                    }
                };
                match self.check_count(param("opaque").unwrap_or_default(), nonce, count) {
                    Some(true) => {}
                    Some(false) => {
                        log_error(self, format_args!("{}: nc is not valid, the request is replayed.", user));
                        return Ok(Verdict::Rejected);
                    }
                    None => {
                        log_error(self, format_args!("{}: digest is valid, but opaque is not valid.", user));
                        return Ok(Verdict::Stale);
                    }
                }
            }

            if self.use_auth_info_header {
                let mut info = vec![
                    format!("nextnonce={}", quote(&self.generate_nonce(now))),
                    format!("rspauth={}", quote(&digest_for(""))),
                ];
                if let Some(qop) = qop {
                    info.push(format!("qop={}", qop));
                    info.push(format!("cnonce={}", quote(cnonce)));
                    info.push(format!("nc={}", nc));
                }
                res.insert_header(fields.info, info.join(", "));
            }
            log_info(self, format_args!("{}: authentication succeeded.", user));
            req.set_user(username);
            Ok(Verdict::Accepted)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn params_are_tokens_or_quoted() {
        let params = parse_params(
            r#"username="ferris", Realm=r, uri="/a\"b", nc=00000001 ,qop=auth"#,
        )
        .unwrap();
        assert_eq!(params["username"], "ferris");
        assert_eq!(params["realm"], "r");
        assert_eq!(params["uri"], "/a\"b");
        assert_eq!(params["nc"], "00000001");
        assert_eq!(params["qop"], "auth");
    }

    #[test]
    fn malformed_params() {
        assert!(parse_params(r#"a="unterminated"#).is_none());
        assert!(parse_params("a").is_none());
        assert!(parse_params("=b").is_none());
        assert!(parse_params("a=b c=d").is_none());
        assert!(parse_params(r#"a="\"#).is_none());
        assert_eq!(parse_params("").unwrap().len(), 0);
    }

    #[test]
    fn unterminated_quote_parses_in_linear_time() {
        let input = format!("a=\"{}", "\\b".repeat(MAX_CREDENTIALS_LENGTH));
        let started = std::time::Instant::now();
        assert!(parse_params(&input).is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn nonces_carry_their_time() {
        let auth = DigestAuth::new("realm", Arc::new(super::super::Htdigest::in_memory()))
            .with_instance_key("key")
            .with_nonce_expiry(Duration::from_secs(60), Duration::from_secs(10));
        let nonce = auth.generate_nonce(1_000);
        let decoded = String::from_utf8(STANDARD.decode(&nonce).unwrap()).unwrap();
        assert!(decoded.starts_with("000000001000:"));
        assert!(matches!(auth.check_nonce("u", &nonce, 1_030), NonceState::Fresh));
        assert!(matches!(auth.check_nonce("u", &nonce, 1_061), NonceState::Expired));
        assert!(matches!(auth.check_nonce("u", &nonce, 999), NonceState::Invalid));
        assert!(matches!(auth.check_nonce("u", "bm9wZQ==", 1_000), NonceState::Invalid));

        let other = DigestAuth::new("realm", Arc::new(super::super::Htdigest::in_memory()))
            .with_instance_key("other");
        assert!(matches!(other.check_nonce("u", &nonce, 1_000), NonceState::Invalid));
    }

    #[test]
    fn opaques_track_nonce_counts() {
        let auth = DigestAuth::new("realm", Arc::new(super::super::Htdigest::in_memory()));
        let opaque = auth.generate_opaque(100);
        assert_eq!(auth.check_count(&opaque, "n1", Some(1)), Some(true));
        assert_eq!(auth.check_count(&opaque, "n1", Some(1)), Some(false));
        assert_eq!(auth.check_count(&opaque, "n1", Some(2)), Some(true));
        assert_eq!(auth.check_count(&opaque, "n2", Some(1)), Some(true));
        assert_eq!(auth.check_count("unknown", "n1", Some(1)), None);
    }

    #[test]
    fn stale_opaques_are_pruned() {
        let auth = DigestAuth::new("realm", Arc::new(super::super::Htdigest::in_memory()))
            .with_nonce_expiry(Duration::from_secs(60), Duration::from_secs(10));
        let old = auth.generate_opaque(100);
        let _ = auth.generate_opaque(200);
        assert_eq!(auth.check_count(&old, "n", Some(1)), None);
    }
}
