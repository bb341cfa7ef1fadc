//! The mount table.
//!
//! Handlers are mounted on path prefixes. A request is routed to the entry
//! with the longest prefix that matches its path on a segment boundary: the
//! prefix becomes the request's script name and the rest its path info.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use arc_swap::ArcSwap;

use crate::handler::{App, AppResponse, Handler, HandlerFactory, Proc};
use crate::logger::Logger;
use crate::request::Request;
use crate::response::Response;
use crate::BoxFuture;

/// Options bound to a mount point and handed to its factory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions {
    values: BTreeMap<String, String>,
}

impl MountOptions {
    /// No options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an option.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Look an option up.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Iterate over the options.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A mounted handler factory.
#[derive(Debug, Clone)]
pub struct MountEntry {
    prefix: String,
    factory: HandlerFactory,
    options: MountOptions,
}

impl MountEntry {
    /// The normalized prefix, empty for the root.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The options bound at mount time.
    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    /// A handler instance for one request.
    pub fn instance(&self) -> Arc<dyn Handler> {
        self.factory.instance(&self.options)
    }

    fn matches(&self, path: &str) -> bool {
        path.starts_with(&self.prefix)
            && (path.len() == self.prefix.len() || path[self.prefix.len()..].starts_with('/'))
    }
}

/// The result of a successful lookup.
#[derive(Clone)]
pub struct Route {
    /// The handler to invoke.
    pub handler: Arc<dyn Handler>,
    /// The matched prefix.
    pub script_name: String,
    /// The remainder of the path.
    pub path_info: String,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("script_name", &self.script_name)
            .field("path_info", &self.path_info)
            .finish()
    }
}

/// Maps path prefixes to handlers.
///
/// Mutations rebuild the longest-first matcher and swap it in, lookups read
/// a snapshot without locking.
pub struct Router {
    entries: Mutex<BTreeMap<String, MountEntry>>,
    matcher: ArcSwap<Vec<MountEntry>>,
    logger: Logger,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefixes: Vec<String> = self
            .matcher
            .load()
            .iter()
            .map(|entry| entry.prefix.clone())
            .collect();
        f.debug_struct("Router").field("prefixes", &prefixes).finish()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip trailing slashes. The root becomes the empty prefix.
fn normalize(path: &str) -> String {
    path.trim_end_matches('/').to_owned()
}

impl Router {
    /// An empty mount table.
    pub fn new() -> Self {
        Self::with_logger(Logger::default())
    }

    /// An empty mount table logging mount changes to `logger`.
    pub fn with_logger(logger: Logger) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            matcher: ArcSwap::from_pointee(Vec::new()),
            logger,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, MountEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn rebuild(&self, entries: &BTreeMap<String, MountEntry>) {
        let mut matcher: Vec<MountEntry> = entries.values().cloned().collect();
        matcher.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        self.matcher.store(Arc::new(matcher));
    }

    /// Mount a factory with options. Replaces an earlier mount on the same prefix.
    pub fn mount_factory(&self, path: &str, factory: HandlerFactory, options: MountOptions) {
        let prefix = normalize(path);
        self.logger.debug(format_args!(
            "{:?} is mounted on {}.",
            factory,
            if prefix.is_empty() { "/" } else { &prefix }
        ));
        let mut entries = self.lock();
        entries.insert(
            prefix.clone(),
            MountEntry {
                prefix,
                factory,
                options,
            },
        );
        self.rebuild(&entries);
    }

    /// Mount a handler shared by every request.
    pub fn mount(&self, path: &str, handler: impl Handler) {
        self.mount_factory(path, HandlerFactory::shared(Arc::new(handler)), MountOptions::new());
    }

    /// Mount a closure.
    pub fn mount_proc<F>(&self, path: &str, f: F)
    where
        F: for<'a> Fn(&'a mut Request, &'a mut Response) -> BoxFuture<'a, http_types::Result<()>>
            + Send
            + Sync
            + 'static,
    {
        self.mount(path, Proc::new(f));
    }

    /// Mount an application returning `(status, headers, body)`.
    pub fn mount_app<F>(&self, path: &str, f: F)
    where
        F: for<'a> Fn(&'a mut Request) -> BoxFuture<'a, http_types::Result<AppResponse>>
            + Send
            + Sync
            + 'static,
    {
        self.mount(path, App::new(f));
    }

    /// Remove the mount on `path`.
    pub fn unmount(&self, path: &str) -> Option<MountEntry> {
        let prefix = normalize(path);
        self.logger.debug(format_args!(
            "unmount {}.",
            if prefix.is_empty() { "/" } else { &prefix }
        ));
        let mut entries = self.lock();
        let removed = entries.remove(&prefix);
        self.rebuild(&entries);
        removed
    }

    /// Find the handler for `path`.
    pub fn lookup(&self, path: &str) -> Option<Route> {
        let matcher = self.matcher.load();
        matcher
            .iter()
            .find(|entry| entry.matches(path))
            .map(|entry| Route {
                handler: entry.instance(),
                script_name: entry.prefix.clone(),
                path_info: path[entry.prefix.len()..].to_owned(),
            })
    }

    /// The mounted prefixes, longest first.
    pub fn prefixes(&self) -> Vec<String> {
        self.matcher
            .load()
            .iter()
            .map(|entry| entry.prefix.clone())
            .collect()
    }
}
