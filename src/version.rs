use std::fmt;
use std::str::FromStr;

use http_types::StatusCode;

/// An HTTP protocol version, ordered by major then minor number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HttpVersion {
    /// The major version number.
    pub major: u32,
    /// The minor version number.
    pub minor: u32,
}

impl HttpVersion {
    /// HTTP/0.9, a bare request line without headers.
    pub const HTTP_0_9: HttpVersion = HttpVersion::new(0, 9);
    /// HTTP/1.0.
    pub const HTTP_1_0: HttpVersion = HttpVersion::new(1, 0);
    /// HTTP/1.1.
    pub const HTTP_1_1: HttpVersion = HttpVersion::new(1, 1);

    /// Create a new version.
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl Default for HttpVersion {
    fn default() -> Self {
        HttpVersion::HTTP_1_1
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for HttpVersion {
    type Err = http_types::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| format_err_status!(StatusCode::BadRequest, "bad HTTP version `{}`", s))?;
        let parse = |n: &str| {
            if n.is_empty() || !n.bytes().all(|b| b.is_ascii_digit()) {
                return Err(format_err_status!(StatusCode::BadRequest, "bad HTTP version `{}`", s));
            }
            n.parse::<u32>()
                .map_err(|_| format_err_status!(StatusCode::BadRequest, "bad HTTP version `{}`", s))
        };
        Ok(HttpVersion::new(parse(major)?, parse(minor)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering() {
        assert!(HttpVersion::HTTP_0_9 < HttpVersion::HTTP_1_0);
        assert!(HttpVersion::HTTP_1_0 < HttpVersion::HTTP_1_1);
        assert!(HttpVersion::new(1, 10) > HttpVersion::HTTP_1_1);
        assert!(HttpVersion::new(2, 0) > HttpVersion::new(1, 10));
    }

    #[test]
    fn parse() {
        assert_eq!("1.1".parse::<HttpVersion>().unwrap(), HttpVersion::HTTP_1_1);
        assert_eq!("1.0".parse::<HttpVersion>().unwrap().to_string(), "1.0");
        assert!("1".parse::<HttpVersion>().is_err());
        assert!("1.x".parse::<HttpVersion>().is_err());
        assert!("-1.1".parse::<HttpVersion>().is_err());
    }
}
