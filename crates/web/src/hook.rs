//! URL hooks: match patterns over (protocol, host, port, path) bound to
//! handlers, kept in a table ordered by specificity.
//!
//! Dispatch scans the table in its total order and the first matching hook
//! wins; the matched hook's path prefix is stripped off the request path to
//! form the rest path handlers see. The table itself is copy-on-write:
//! readers grab an immutable snapshot, mutations swap in a new sorted vector,
//! so ordering can never change under a dispatch in progress.

use std::cmp::Ordering;
use std::future::Future;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use thiserror::Error;

use moor_http::protocol::{HandlerError, Request, Response, Scheme};

/// A handler mountable in a [`HookTable`].
///
/// Object safety is the point here: the table stores `Arc<dyn HookHandler>`.
#[async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Result<Response, HandlerError>;
}

struct HookFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> HookHandler for HookFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response, HandlerError>> + Send,
{
    async fn handle(&self, request: Request) -> Result<Response, HandlerError> {
        (self.f)(request).await
    }
}

/// Wraps an async function as a mountable [`HookHandler`].
pub fn hook_fn<F, Fut>(f: F) -> Arc<dyn HookHandler>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, HandlerError>> + Send + 'static,
{
    Arc::new(HookFn { f })
}

/// The protocols a hook applies to; never empty.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Protocols {
    http: bool,
    https: bool,
}

impl Protocols {
    pub const HTTP: Protocols = Protocols { http: true, https: false };
    pub const HTTPS: Protocols = Protocols { http: false, https: true };
    pub const BOTH: Protocols = Protocols { http: true, https: true };

    pub fn contains(&self, scheme: Scheme) -> bool {
        match scheme {
            Scheme::Http => self.http,
            Scheme::Https => self.https,
        }
    }

    fn bits(&self) -> u8 {
        u8::from(self.http) + u8::from(self.https)
    }
}

/// Validation failures when building a [`UrlHook`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HookError {
    #[error("specific-domain hooks require a domain")]
    MissingDomain,

    #[error("specific-path hooks require a path")]
    MissingPath,

    #[error("invalid hook domain: {reason}")]
    InvalidDomain { reason: String },

    #[error("invalid hook path: {reason}")]
    InvalidPath { reason: String },

    #[error("hook port must be between 1 and 65535")]
    InvalidPort,

    #[error("an equal hook is already mounted")]
    Duplicate,
}

impl HookError {
    fn invalid_domain<S: ToString>(reason: S) -> Self {
        Self::InvalidDomain { reason: reason.to_string() }
    }

    fn invalid_path<S: ToString>(reason: S) -> Self {
        Self::InvalidPath { reason: reason.to_string() }
    }
}

/// An immutable match pattern over (protocol, host, port, path).
///
/// With `specific_domain` the domain must match exactly; without it,
/// subdomains match too. With `specific_path` the path must match exactly;
/// without it, the path is a prefix matched at segment boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UrlHook {
    protocols: Protocols,
    domain: Option<String>,
    port: Option<u16>,
    path: Option<String>,
    specific_domain: bool,
    specific_path: bool,
}

impl UrlHook {
    /// Starts building a hook matching everything on both protocols.
    pub fn builder() -> UrlHookBuilder {
        UrlHookBuilder {
            protocols: Protocols::BOTH,
            domain: None,
            port: None,
            path: None,
            specific_domain: false,
            specific_path: false,
        }
    }

    /// A catch-all hook for the given path prefix.
    pub fn path(path: &str) -> Result<UrlHook, HookError> {
        Self::builder().path(path).build()
    }

    pub fn protocols(&self) -> Protocols {
        self.protocols
    }

    pub fn domain(&self) -> Option<&str> {
        self.domain.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn path_prefix(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Whether this hook matches the request coordinates.
    pub fn matches(&self, scheme: Scheme, host: &str, port: u16, path: &str) -> bool {
        if !self.protocols.contains(scheme) {
            return false;
        }
        if let Some(hook_port) = self.port {
            if hook_port != port {
                return false;
            }
        }
        if let Some(domain) = &self.domain {
            let host = host.to_ascii_lowercase();
            let exact = host == *domain;
            if self.specific_domain {
                if !exact {
                    return false;
                }
            } else if !exact && !host.ends_with(&format!(".{domain}")) {
                return false;
            }
        }
        if let Some(hook_path) = &self.path {
            let exact = path == hook_path;
            if self.specific_path {
                if !exact {
                    return false;
                }
            } else if !exact && !path.starts_with(&format!("{hook_path}/")) {
                return false;
            }
        }
        true
    }

    /// The request path with this hook's prefix stripped.
    pub fn rest_of<'a>(&self, path: &'a str) -> &'a str {
        match &self.path {
            Some(prefix) => path.strip_prefix(prefix.as_str()).unwrap_or(path),
            None => path,
        }
    }
}

/// The sort key from the dispatch order: more specific hooks come first.
impl Ord for UrlHook {
    fn cmp(&self, other: &Self) -> Ordering {
        some_first(self.port, other.port, |a, b| a.cmp(b))
            .then_with(|| other.specific_domain.cmp(&self.specific_domain))
            .then_with(|| {
                some_first(self.domain.as_deref(), other.domain.as_deref(), longer_then_lexicographic)
            })
            .then_with(|| other.specific_path.cmp(&self.specific_path))
            .then_with(|| {
                some_first(self.path.as_deref(), other.path.as_deref(), longer_then_lexicographic)
            })
            .then_with(|| self.protocols.bits().cmp(&other.protocols.bits()))
            // not part of the dispatch order, only makes the sort deterministic
            // for distinct masks of equal size
            .then_with(|| other.protocols.http.cmp(&self.protocols.http))
    }
}

impl PartialOrd for UrlHook {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// `Some` sorts before `None`; two `Some`s compare by `cmp`.
fn some_first<T, F>(a: Option<T>, b: Option<T>, cmp: F) -> Ordering
where
    F: Fn(&T, &T) -> Ordering,
{
    match (&a, &b) {
        (Some(a), Some(b)) => cmp(a, b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn longer_then_lexicographic(a: &&str, b: &&str) -> Ordering {
    b.len().cmp(&a.len()).then_with(|| a.cmp(b))
}

/// Builder for [`UrlHook`]; validation happens in [`build`](UrlHookBuilder::build).
#[derive(Debug, Clone)]
pub struct UrlHookBuilder {
    protocols: Protocols,
    domain: Option<String>,
    port: Option<u16>,
    path: Option<String>,
    specific_domain: bool,
    specific_path: bool,
}

impl UrlHookBuilder {
    pub fn protocols(mut self, protocols: Protocols) -> Self {
        self.protocols = protocols;
        self
    }

    /// Restricts to a domain; subdomains match unless
    /// [`specific_domain`](Self::specific_domain) is set.
    pub fn domain(mut self, domain: &str) -> Self {
        self.domain = Some(domain.to_ascii_lowercase());
        self
    }

    pub fn specific_domain(mut self) -> Self {
        self.specific_domain = true;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Restricts to a path prefix; only the exact path matches when
    /// [`specific_path`](Self::specific_path) is set.
    pub fn path(mut self, path: &str) -> Self {
        self.path = Some(path.to_owned());
        self
    }

    pub fn specific_path(mut self) -> Self {
        self.specific_path = true;
        self
    }

    pub fn build(self) -> Result<UrlHook, HookError> {
        if self.specific_domain && self.domain.is_none() {
            return Err(HookError::MissingDomain);
        }
        if self.specific_path && self.path.is_none() {
            return Err(HookError::MissingPath);
        }
        if self.protocols.bits() == 0 {
            // unreachable through the constants, kept for completeness
            return Err(HookError::InvalidPort);
        }
        if self.port == Some(0) {
            return Err(HookError::InvalidPort);
        }

        if let Some(domain) = &self.domain {
            if domain.is_empty() {
                return Err(HookError::invalid_domain("empty"));
            }
            if !domain.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'-')
            {
                return Err(HookError::invalid_domain(format!("bad character in {domain:?}")));
            }
            if domain.starts_with('.') || domain.ends_with('.') {
                return Err(HookError::invalid_domain("leading or trailing dot"));
            }
            if domain.contains(".-") || domain.contains("-.") {
                return Err(HookError::invalid_domain("dot adjacent to hyphen"));
            }
        }

        if let Some(path) = &self.path {
            if !path.starts_with('/') {
                return Err(HookError::invalid_path("must start with /"));
            }
            if !path.bytes().all(|b| {
                b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~' | b'/' | b'%')
            }) {
                return Err(HookError::invalid_path(format!("bad character in {path:?}")));
            }
            if !self.specific_path && path.len() > 1 && path.ends_with('/') {
                return Err(HookError::invalid_path("prefix paths must not end in /"));
            }
        }

        Ok(UrlHook {
            protocols: self.protocols,
            domain: self.domain,
            port: self.port,
            path: self.path,
            specific_domain: self.specific_domain,
            specific_path: self.specific_path,
        })
    }
}

struct HookEntry {
    hook: UrlHook,
    handler: Arc<dyn HookHandler>,
}

/// The ordered hook set dispatch runs against.
///
/// Readers load an immutable snapshot; `mount`/`unmount` rebuild and swap the
/// whole vector under a small mutex that is never held across I/O.
pub struct HookTable {
    entries: ArcSwap<Vec<HookEntry>>,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for HookTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookTable").field("len", &self.len()).finish()
    }
}

impl Default for HookTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HookTable {
    pub fn new() -> Self {
        Self { entries: ArcSwap::from_pointee(Vec::new()), write_lock: Mutex::new(()) }
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mounts a handler under a hook. Equal hooks are rejected.
    pub fn mount(&self, hook: UrlHook, handler: Arc<dyn HookHandler>) -> Result<(), HookError> {
        let _guard = self.write_lock.lock().expect("hook table write lock poisoned");
        let current = self.entries.load();
        if current.iter().any(|e| e.hook == hook) {
            return Err(HookError::Duplicate);
        }
        let position = current
            .binary_search_by(|entry| entry.hook.cmp(&hook))
            .unwrap_or_else(|position| position);

        let mut next: Vec<HookEntry> = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().map(|e| HookEntry { hook: e.hook.clone(), handler: Arc::clone(&e.handler) }));
        next.insert(position, HookEntry { hook, handler });
        self.entries.store(Arc::new(next));
        Ok(())
    }

    /// Unmounts the hook equal to `hook`. Returns whether one was present.
    pub fn unmount(&self, hook: &UrlHook) -> bool {
        let _guard = self.write_lock.lock().expect("hook table write lock poisoned");
        let current = self.entries.load();
        if !current.iter().any(|e| e.hook == *hook) {
            return false;
        }
        let next: Vec<HookEntry> = current
            .iter()
            .filter(|e| e.hook != *hook)
            .map(|e| HookEntry { hook: e.hook.clone(), handler: Arc::clone(&e.handler) })
            .collect();
        self.entries.store(Arc::new(next));
        true
    }

    /// Finds the first matching hook in specificity order.
    ///
    /// Returns the handler and the rest path (the request path with the
    /// hook's prefix stripped).
    pub fn resolve(
        &self,
        scheme: Scheme,
        host: &str,
        port: u16,
        path: &str,
    ) -> Option<(Arc<dyn HookHandler>, String)> {
        let snapshot = self.entries.load();
        for entry in snapshot.iter() {
            if entry.hook.matches(scheme, host, port, path) {
                return Some((Arc::clone(&entry.handler), entry.hook.rest_of(path).to_owned()));
            }
        }
        None
    }
}
