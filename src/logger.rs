//! Operational and access logging.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{Level, Log, Metadata, Record};

use crate::request::Request;
use crate::response::Response;

const DEFAULT_TARGET: &str = "async_h1d";
const ACCESS_TARGET: &str = "async_h1d::access";

/// A leveled logging handle.
///
/// By default records go through the global `log` facade. A different sink
/// can be injected with [`Logger::new`], which is how embedders route server
/// output somewhere else and how the tests capture it.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn Log>,
    target: &'static str,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("target", &self.target)
            .finish()
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self {
            sink: Arc::new(Facade),
            target: DEFAULT_TARGET,
        }
    }
}

impl Logger {
    /// Log into `sink` instead of the global logger.
    pub fn new(sink: Arc<dyn Log>) -> Self {
        Self {
            sink,
            target: DEFAULT_TARGET,
        }
    }

    /// The default access logger, using the `async_h1d::access` target.
    pub fn access() -> Self {
        Self::default().with_target(ACCESS_TARGET)
    }

    /// Use a different log target.
    pub fn with_target(mut self, target: &'static str) -> Self {
        self.target = target;
        self
    }

    /// The log target records are tagged with.
    pub fn target(&self) -> &'static str {
        self.target
    }

    /// Whether records at `level` would be kept.
    pub fn enabled(&self, level: Level) -> bool {
        let metadata = Metadata::builder()
            .level(level)
            .target(self.target)
            .build();
        self.sink.enabled(&metadata)
    }

    /// Emit a record.
    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        self.sink.log(
            &Record::builder()
                .args(args)
                .level(level)
                .target(self.target)
                .build(),
        );
    }

    /// A condition the server cannot recover from, logged at error level.
    pub fn fatal(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, format_args!("fatal: {}", args));
    }

    #[allow(missing_docs)]
    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args);
    }

    #[allow(missing_docs)]
    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args);
    }

    #[allow(missing_docs)]
    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args);
    }

    #[allow(missing_docs)]
    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args);
    }

    #[allow(missing_docs)]
    pub fn trace(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Trace, args);
    }
}

/// Forwards to whatever logger is installed globally.
struct Facade;

impl Log for Facade {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level() && log::logger().enabled(metadata)
    }

    fn log(&self, record: &Record<'_>) {
        log::logger().log(record);
    }

    fn flush(&self) {
        log::logger().flush();
    }
}

/// An Apache-style access log format.
///
/// Supported directives:
///
/// | directive | expands to |
/// |---|---|
/// | `%a` | remote IP address |
/// | `%b` | bytes sent, `-` for none |
/// | `%B` | bytes sent |
/// | `%h` | remote host (always the address, no reverse lookup) |
/// | `%H` | request protocol |
/// | `%l` | remote logname, always `-` |
/// | `%m` | request method |
/// | `%p` | local port |
/// | `%q` | query string with leading `?`, or empty |
/// | `%r` | first line of the request |
/// | `%s` | response status |
/// | `%t` | time the request was received |
/// | `%T` | seconds taken to serve the request |
/// | `%u` | authenticated user, or `-` |
/// | `%U` | requested path |
/// | `%{Name}i` | a request header |
/// | `%{Name}o` | a response header |
/// | `%%` | a literal `%` |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLog {
    format: String,
}

impl AccessLog {
    /// Use a custom format.
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
        }
    }

    /// `%h %l %u %t "%r" %s %b`
    pub fn common() -> Self {
        Self::new("%h %l %u %t \"%r\" %s %b")
    }

    /// `%{Referer}i -> %U`
    pub fn referer() -> Self {
        Self::new("%{Referer}i -> %U")
    }

    /// `%{User-Agent}i`
    pub fn agent() -> Self {
        Self::new("%{User-Agent}i")
    }

    /// The common format followed by referer and user agent.
    pub fn combined() -> Self {
        Self::new("%h %l %u %t \"%r\" %s %b \"%{Referer}i\" \"%{User-agent}i\"")
    }

    /// The raw format string.
    pub fn as_str(&self) -> &str {
        &self.format
    }

    /// Render one record for a completed request.
    pub fn format(&self, req: &Request, res: &Response, elapsed: Duration) -> String {
        let mut out = String::with_capacity(self.format.len() * 2);
        let mut chars = self.format.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            let param = if chars.peek() == Some(&'{') {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    out.push_str("%{");
                    out.push_str(&name);
                    break;
                }
                Some(name)
            } else {
                None
            };
            let directive = match chars.next() {
                Some(d) => d,
                None => {
                    out.push('%');
                    break;
                }
            };
            match (directive, param) {
                ('%', None) => out.push('%'),
                ('i', Some(name)) => push_value(&mut out, req.header(&name).as_deref()),
                ('o', Some(name)) => push_value(&mut out, res.header(&name).as_deref()),
                (d, None) => self.expand(&mut out, d, req, res, elapsed),
                (d, Some(name)) => {
                    out.push_str("%{");
                    out.push_str(&name);
                    out.push('}');
                    out.push(d);
                }
            }
        }
        out
    }

    fn expand(&self, out: &mut String, directive: char, req: &Request, res: &Response, elapsed: Duration) {
        match directive {
            'a' | 'h' => push_value(out, req.remote_ip().map(|ip| ip.to_string()).as_deref()),
            'b' => match res.sent_size() {
                0 => out.push('-'),
                n => out.push_str(&n.to_string()),
            },
            'B' => out.push_str(&res.sent_size().to_string()),
            'H' => out.push_str(&format!("HTTP/{}", req.version())),
            'l' => out.push('-'),
            'm' => out.push_str(&req.method().to_string()),
            'p' => out.push_str(&req.local_port().to_string()),
            'q' => {
                if let Some(query) = req.query_string() {
                    out.push('?');
                    out.push_str(&escape(query));
                }
            }
            'r' => push_value(out, req.request_line()),
            's' => out.push_str(&res.status().to_string()),
            't' => out.push_str(&req.request_time().format("[%d/%b/%Y:%H:%M:%S %z]").to_string()),
            'T' => out.push_str(&format!("{:.6}", elapsed.as_secs_f64())),
            'u' => push_value(out, req.user()),
            'U' => out.push_str(&escape(req.path())),
            other => {
                out.push('%');
                out.push(other);
            }
        }
    }
}

fn push_value(out: &mut String, value: Option<&str>) {
    match value {
        Some(v) if !v.is_empty() => out.push_str(&escape(v)),
        _ => out.push('-'),
    }
}

/// Render control characters as `\xNN` so a record stays on one line.
pub(crate) fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c.is_ascii_control() {
            out.push_str(&format!("\\x{:02X}", c as u32));
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Capture(Mutex<Vec<(Level, String)>>);

    impl Log for Capture {
        fn enabled(&self, _: &Metadata<'_>) -> bool {
            true
        }
        fn log(&self, record: &Record<'_>) {
            self.0
                .lock()
                .unwrap()
                .push((record.level(), record.args().to_string()));
        }
        fn flush(&self) {}
    }

    #[test]
    fn injected_sink() {
        let capture = Arc::new(Capture::default());
        let logger = Logger::new(capture.clone());
        logger.info(format_args!("hello {}", 1));
        logger.fatal(format_args!("reactor gone"));
        let records = capture.0.lock().unwrap();
        assert_eq!(records[0], (Level::Info, "hello 1".to_owned()));
        assert_eq!(records[1], (Level::Error, "fatal: reactor gone".to_owned()));
    }

    #[test]
    fn escapes_control_characters() {
        assert_eq!(escape("a\r\nb"), "a\\x0D\\x0Ab");
        assert_eq!(escape("plain"), "plain");
    }
}
