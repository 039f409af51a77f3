//! The serving context: registered interceptors and handlers, their URL
//! patterns and init parameters, lifecycle listeners and the settings shared
//! by every exchange.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hyper::StatusCode;
use crate::chain::{ChainMetrics, ChainTimings, FilterChain};
use crate::config::ServerConfig;
use crate::error::{BoxError, LifecycleError, Result};
use crate::recycler::Pooled;
use crate::request::Request;
use crate::response::Response;

/// Initialization parameters handed to `init`.
pub type InitParams = HashMap<String, String>;

/// A step in front of a handler.
///
/// `intercept` continues the exchange by calling [`FilterChain::advance`];
/// returning without doing so ends the exchange here.
pub trait Interceptor: Send + Sync {
    fn init(&self, _params: &InitParams) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    fn intercept(
        &self,
        request: &mut Request,
        response: &mut Response,
        chain: &mut FilterChain,
    ) -> Result<()>;

    fn destroy(&self) {}
}

/// The terminal step of an exchange.
pub trait Handler: Send + Sync {
    fn init(&self, _params: &InitParams) -> std::result::Result<(), BoxError> {
        Ok(())
    }

    fn service(&self, request: &mut Request, response: &mut Response) -> Result<()>;

    fn destroy(&self) {}
}

impl<F> Interceptor for F
where
    F: Fn(&mut Request, &mut Response, &mut FilterChain) -> Result<()> + Send + Sync,
{
    fn intercept(
        &self,
        request: &mut Request,
        response: &mut Response,
        chain: &mut FilterChain,
    ) -> Result<()> {
        self(request, response, chain)
    }
}

impl<F> Handler for F
where
    F: Fn(&mut Request, &mut Response) -> Result<()> + Send + Sync,
{
    fn service(&self, request: &mut Request, response: &mut Response) -> Result<()> {
        self(request, response)
    }
}

/// Notified when the serving context starts and stops.
pub trait ContextListener: Send + Sync {
    fn context_initialized(&self, _context: &ServerContext) {}

    fn context_destroyed(&self, _context: &ServerContext) {}
}

/// Notified around every exchange that enters a filter chain.
pub trait RequestListener: Send + Sync {
    fn request_initialized(&self, _request: &Request) {}

    fn request_destroyed(&self, _request: &Request) {}
}

/// A URL pattern in servlet mapping syntax.
///
/// * `/` is the default mapping
/// * `/prefix/*` matches the prefix and everything under it (`/*` matches all)
/// * `*.ext` matches a last path segment with that extension
/// * anything else is an exact path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlPattern {
    Default,
    Prefix(String),
    Extension(String),
    Exact(String),
}

impl UrlPattern {
    pub fn parse(pattern: &str) -> Self {
        if pattern == "/" {
            UrlPattern::Default
        } else if let Some(prefix) = pattern.strip_suffix("/*") {
            UrlPattern::Prefix(prefix.to_string())
        } else if let Some(ext) = pattern.strip_prefix("*.") {
            UrlPattern::Extension(ext.to_string())
        } else {
            UrlPattern::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            UrlPattern::Default => true,
            UrlPattern::Prefix(prefix) => {
                prefix.is_empty()
                    || path == prefix
                    || (path.starts_with(prefix.as_str())
                        && path.as_bytes().get(prefix.len()) == Some(&b'/'))
            }
            UrlPattern::Extension(ext) => path
                .rsplit('/')
                .next()
                .and_then(|segment| segment.rsplit_once('.'))
                .map(|(_, found)| found == ext)
                .unwrap_or(false),
            UrlPattern::Exact(exact) => exact == path,
        }
    }
}

impl fmt::Display for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UrlPattern::Default => f.write_str("/"),
            UrlPattern::Prefix(prefix) => write!(f, "{}/*", prefix),
            UrlPattern::Extension(ext) => write!(f, "*.{}", ext),
            UrlPattern::Exact(path) => f.write_str(path),
        }
    }
}

/// A named interceptor with its patterns and init parameters.
pub struct InterceptorRegistration {
    name: String,
    interceptor: Box<dyn Interceptor>,
    params: InitParams,
    patterns: Vec<UrlPattern>,
    initialized: AtomicBool,
}

impl InterceptorRegistration {
    pub fn new(name: impl Into<String>, interceptor: impl Interceptor + 'static) -> Self {
        Self {
            name: name.into(),
            interceptor: Box::new(interceptor),
            params: InitParams::new(),
            patterns: Vec::new(),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_pattern(mut self, pattern: &str) -> Self {
        self.patterns.push(UrlPattern::parse(pattern));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &InitParams {
        &self.params
    }

    pub fn patterns(&self) -> &[UrlPattern] {
        &self.patterns
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// An interceptor without patterns applies to every path.
    pub fn matches(&self, path: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.matches(path))
    }

    pub fn interceptor(&self) -> &dyn Interceptor {
        self.interceptor.as_ref()
    }
}

impl fmt::Debug for InterceptorRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptorRegistration")
            .field("name", &self.name)
            .field("patterns", &self.patterns)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// A named handler with its patterns and init parameters.
pub struct HandlerRegistration {
    name: String,
    handler: Box<dyn Handler>,
    params: InitParams,
    patterns: Vec<UrlPattern>,
    initialized: AtomicBool,
}

impl HandlerRegistration {
    pub fn new(name: impl Into<String>, handler: impl Handler + 'static) -> Self {
        Self {
            name: name.into(),
            handler: Box::new(handler),
            params: InitParams::new(),
            patterns: Vec::new(),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_pattern(mut self, pattern: &str) -> Self {
        self.patterns.push(UrlPattern::parse(pattern));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &InitParams {
        &self.params
    }

    pub fn patterns(&self) -> &[UrlPattern] {
        &self.patterns
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn handler(&self) -> &dyn Handler {
        self.handler.as_ref()
    }
}

impl fmt::Debug for HandlerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistration")
            .field("name", &self.name)
            .field("patterns", &self.patterns)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

/// Shared init/destroy bookkeeping of both registration kinds.
trait Managed {
    fn name(&self) -> &str;
    fn flag(&self) -> &AtomicBool;
    fn init_component(&self) -> std::result::Result<(), BoxError>;
    fn destroy_component(&self);
}

impl Managed for InterceptorRegistration {
    fn name(&self) -> &str {
        &self.name
    }

    fn flag(&self) -> &AtomicBool {
        &self.initialized
    }

    fn init_component(&self) -> std::result::Result<(), BoxError> {
        self.interceptor.init(&self.params)
    }

    fn destroy_component(&self) {
        self.interceptor.destroy()
    }
}

impl Managed for HandlerRegistration {
    fn name(&self) -> &str {
        &self.name
    }

    fn flag(&self) -> &AtomicBool {
        &self.initialized
    }

    fn init_component(&self) -> std::result::Result<(), BoxError> {
        self.handler.init(&self.params)
    }

    fn destroy_component(&self) {
        self.handler.destroy()
    }
}

fn initialize_all<R: Managed>(registrations: &[Arc<R>], failed: &mut Vec<String>) {
    for registration in registrations {
        if registration.flag().load(Ordering::Acquire) {
            continue;
        }
        match registration.init_component() {
            Ok(()) => registration.flag().store(true, Ordering::Release),
            Err(err) => {
                log::warn!("failed to initialize {}: {}", registration.name(), err);
                failed.push(registration.name().to_string());
            }
        }
    }
}

fn destroy_all<R: Managed>(registrations: &[Arc<R>]) {
    for registration in registrations {
        if registration.flag().swap(false, Ordering::AcqRel) {
            registration.destroy_component();
        }
    }
}

/// Answers every unmapped path with 404.
struct NotFound;

impl Handler for NotFound {
    fn service(&self, _request: &mut Request, response: &mut Response) -> Result<()> {
        response.send_error(StatusCode::NOT_FOUND, "Not Found")
    }
}

/// Registrations, routing and shared settings for every exchange.
pub struct ServerContext {
    interceptors: Vec<Arc<InterceptorRegistration>>,
    handlers: Vec<Arc<HandlerRegistration>>,
    exact: HashMap<String, usize>,
    mappings: Vec<(UrlPattern, usize)>,
    default_handler: Arc<HandlerRegistration>,
    context_listeners: Vec<Arc<dyn ContextListener>>,
    request_listeners: Vec<Arc<dyn RequestListener>>,
    metrics: Arc<dyn ChainMetrics>,
    response_buffer_size: usize,
    response_character_encoding: String,
}

impl ServerContext {
    pub fn builder() -> ServerContextBuilder {
        ServerContextBuilder::default()
    }

    pub fn interceptors(&self) -> &[Arc<InterceptorRegistration>] {
        &self.interceptors
    }

    pub fn handlers(&self) -> &[Arc<HandlerRegistration>] {
        &self.handlers
    }

    pub fn find_interceptor(&self, name: &str) -> Option<&Arc<InterceptorRegistration>> {
        self.interceptors.iter().find(|r| r.name() == name)
    }

    pub fn find_handler(&self, name: &str) -> Option<&Arc<HandlerRegistration>> {
        self.handlers.iter().find(|r| r.name() == name)
    }

    pub fn request_listeners(&self) -> &[Arc<dyn RequestListener>] {
        &self.request_listeners
    }

    pub fn metrics(&self) -> &Arc<dyn ChainMetrics> {
        &self.metrics
    }

    pub fn response_buffer_size(&self) -> usize {
        self.response_buffer_size
    }

    pub fn response_character_encoding(&self) -> &str {
        &self.response_character_encoding
    }

    /// Notifies context listeners, then initializes every interceptor and
    /// every handler that is not initialized yet.
    ///
    /// A failing `init` does not stop the pass; the registration stays
    /// uninitialized and is reported in [`LifecycleError::InitFailed`].
    pub fn initialize(&self) -> std::result::Result<(), LifecycleError> {
        for listener in &self.context_listeners {
            listener.context_initialized(self);
        }

        let mut failed = Vec::new();
        initialize_all(&self.interceptors, &mut failed);
        initialize_all(&self.handlers, &mut failed);
        initialize_all(std::slice::from_ref(&self.default_handler), &mut failed);

        if failed.is_empty() {
            Ok(())
        } else {
            Err(LifecycleError::InitFailed { failed })
        }
    }

    /// Notifies context listeners, then destroys whatever was initialized.
    pub fn destroy(&self) {
        for listener in &self.context_listeners {
            listener.context_destroyed(self);
        }
        destroy_all(&self.interceptors);
        destroy_all(&self.handlers);
        destroy_all(std::slice::from_ref(&self.default_handler));
    }

    /// Picks the handler for `path`: an exact match, then the longest
    /// prefix, then an extension, then the default mapping.
    pub fn resolve_handler(&self, path: &str) -> Arc<HandlerRegistration> {
        if let Some(idx) = self.exact.get(path) {
            return self.handlers[*idx].clone();
        }

        let prefix = self
            .mappings
            .iter()
            .filter_map(|(pattern, idx)| match pattern {
                UrlPattern::Prefix(prefix) if pattern.matches(path) => Some((prefix.len(), *idx)),
                _ => None,
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, idx)| idx);

        let found = prefix
            .or_else(|| self.first_mapping(path, |p| matches!(p, UrlPattern::Extension(_))))
            .or_else(|| self.first_mapping(path, |p| matches!(p, UrlPattern::Default)));

        match found {
            Some(idx) => self.handlers[idx].clone(),
            None => self.default_handler.clone(),
        }
    }

    fn first_mapping(&self, path: &str, kind: impl Fn(&UrlPattern) -> bool) -> Option<usize> {
        self.mappings
            .iter()
            .find(|(pattern, _)| kind(pattern) && pattern.matches(path))
            .map(|(_, idx)| *idx)
    }

    /// Builds the filter chain for `request`: matching interceptors in
    /// registration order and the resolved handler.
    pub fn build_chain(self: &Arc<Self>, request: &Request) -> Pooled<FilterChain> {
        let path = request.path();
        let handler = self.resolve_handler(path);

        let interceptors = self
            .interceptors
            .iter()
            .filter(|r| r.matches(path))
            .cloned();

        FilterChain::new_instance(self.clone(), interceptors, handler, self.metrics.clone())
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("interceptors", &self.interceptors)
            .field("handlers", &self.handlers)
            .field("response_buffer_size", &self.response_buffer_size)
            .field("response_character_encoding", &self.response_character_encoding)
            .finish()
    }
}

/// Collects registrations and settings for a [`ServerContext`].
pub struct ServerContextBuilder {
    interceptors: Vec<InterceptorRegistration>,
    handlers: Vec<HandlerRegistration>,
    default_handler: Option<HandlerRegistration>,
    context_listeners: Vec<Arc<dyn ContextListener>>,
    request_listeners: Vec<Arc<dyn RequestListener>>,
    metrics: Option<Arc<dyn ChainMetrics>>,
    response_buffer_size: usize,
    response_character_encoding: String,
}

impl Default for ServerContextBuilder {
    fn default() -> Self {
        Self {
            interceptors: Vec::new(),
            handlers: Vec::new(),
            default_handler: None,
            context_listeners: Vec::new(),
            request_listeners: Vec::new(),
            metrics: None,
            response_buffer_size: 8192,
            response_character_encoding: "utf-8".to_string(),
        }
    }
}

impl ServerContextBuilder {
    /// Takes the response settings from `config`.
    pub fn config(mut self, config: &ServerConfig) -> Self {
        self.response_buffer_size = config.response_buffer_size;
        self.response_character_encoding = config.response_character_encoding.clone();
        self
    }

    pub fn interceptor(mut self, registration: InterceptorRegistration) -> Self {
        self.interceptors.push(registration);
        self
    }

    pub fn handler(mut self, registration: HandlerRegistration) -> Self {
        self.handlers.push(registration);
        self
    }

    /// Handler for paths no pattern matches. Defaults to a plain 404.
    pub fn default_handler(mut self, registration: HandlerRegistration) -> Self {
        self.default_handler = Some(registration);
        self
    }

    pub fn context_listener(mut self, listener: impl ContextListener + 'static) -> Self {
        self.context_listeners.push(Arc::new(listener));
        self
    }

    pub fn request_listener(mut self, listener: impl RequestListener + 'static) -> Self {
        self.request_listeners.push(Arc::new(listener));
        self
    }

    /// Sink for chain timings. Defaults to a [`ChainTimings`].
    pub fn metrics(mut self, metrics: Arc<dyn ChainMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn response_buffer_size(mut self, size: usize) -> Self {
        self.response_buffer_size = size;
        self
    }

    pub fn response_character_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.response_character_encoding = encoding.into();
        self
    }

    /// Fails when two handlers map the same pattern.
    pub fn build(self) -> std::result::Result<ServerContext, LifecycleError> {
        let mut exact = HashMap::new();
        let mut mappings: Vec<(UrlPattern, usize)> = Vec::new();

        for (idx, registration) in self.handlers.iter().enumerate() {
            for pattern in registration.patterns() {
                let taken = match pattern {
                    UrlPattern::Exact(path) => exact.insert(path.clone(), idx).is_some(),
                    other => {
                        let taken = mappings.iter().any(|(existing, _)| existing == other);
                        mappings.push((other.clone(), idx));
                        taken
                    }
                };
                if taken {
                    return Err(LifecycleError::DuplicatePattern {
                        pattern: pattern.to_string(),
                    });
                }
            }
        }

        Ok(ServerContext {
            interceptors: self.interceptors.into_iter().map(Arc::new).collect(),
            handlers: self.handlers.into_iter().map(Arc::new).collect(),
            exact,
            mappings,
            default_handler: Arc::new(
                self.default_handler
                    .unwrap_or_else(|| HandlerRegistration::new("not-found", NotFound)),
            ),
            context_listeners: self.context_listeners,
            request_listeners: self.request_listeners,
            metrics: self
                .metrics
                .unwrap_or_else(|| Arc::new(ChainTimings::default())),
            response_buffer_size: self.response_buffer_size,
            response_character_encoding: self.response_character_encoding,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExchangeError;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Counts {
        inits: AtomicUsize,
        destroys: AtomicUsize,
    }

    struct Probe {
        counts: Arc<Counts>,
        fail_init: bool,
    }

    impl Handler for Probe {
        fn init(&self, _params: &InitParams) -> std::result::Result<(), BoxError> {
            self.counts.inits.fetch_add(1, Ordering::SeqCst);
            if self.fail_init {
                return Err("refusing to start".into());
            }
            Ok(())
        }

        fn service(&self, _request: &mut Request, _response: &mut Response) -> Result<()> {
            Ok(())
        }

        fn destroy(&self) {
            self.counts.destroys.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Interceptor for Probe {
        fn init(&self, params: &InitParams) -> std::result::Result<(), BoxError> {
            assert_eq!(params.get("realm").map(String::as_str), Some("admin"));
            self.counts.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn intercept(
            &self,
            request: &mut Request,
            response: &mut Response,
            chain: &mut FilterChain,
        ) -> Result<()> {
            chain.advance(request, response)
        }

        fn destroy(&self) {
            self.counts.destroys.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Events(Mutex<Vec<&'static str>>);

    impl ContextListener for Arc<Events> {
        fn context_initialized(&self, _context: &ServerContext) {
            self.0.lock().unwrap().push("initialized");
        }

        fn context_destroyed(&self, _context: &ServerContext) {
            self.0.lock().unwrap().push("destroyed");
        }
    }

    fn probe(counts: &Arc<Counts>, fail_init: bool) -> Probe {
        Probe {
            counts: counts.clone(),
            fail_init,
        }
    }

    /// Start initializes every registration once; stop destroys only the
    /// ones that initialized.
    #[test]
    fn test_start_stop_with_failing_init() {
        let guard = Arc::new(Counts::default());
        let good = Arc::new(Counts::default());
        let bad = Arc::new(Counts::default());
        let events = Arc::new(Events::default());

        let context = ServerContext::builder()
            .interceptor(
                InterceptorRegistration::new("guard", probe(&guard, false)).with_param("realm", "admin"),
            )
            .handler(HandlerRegistration::new("good", probe(&good, false)).with_pattern("/good"))
            .handler(HandlerRegistration::new("bad", probe(&bad, true)).with_pattern("/bad"))
            .context_listener(events.clone())
            .build()
            .unwrap();

        match context.initialize() {
            Err(LifecycleError::InitFailed { failed }) => assert_eq!(failed, vec!["bad".to_string()]),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(guard.inits.load(Ordering::SeqCst), 1);
        assert_eq!(good.inits.load(Ordering::SeqCst), 1);
        assert_eq!(bad.inits.load(Ordering::SeqCst), 1);
        assert!(context.find_handler("good").unwrap().is_initialized());
        assert!(!context.find_handler("bad").unwrap().is_initialized());

        context.destroy();
        assert_eq!(guard.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(good.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(bad.destroys.load(Ordering::SeqCst), 0);

        // a second stop has nothing left to destroy
        context.destroy();
        assert_eq!(good.destroys.load(Ordering::SeqCst), 1);
        assert_eq!(*events.0.lock().unwrap(), vec!["initialized", "destroyed", "destroyed"]);
    }

    /// A second start only retries registrations that failed before.
    #[test]
    fn test_restart_retries_only_failed() {
        let good = Arc::new(Counts::default());
        let bad = Arc::new(Counts::default());
        let context = ServerContext::builder()
            .handler(HandlerRegistration::new("good", probe(&good, false)))
            .handler(HandlerRegistration::new("bad", probe(&bad, true)))
            .build()
            .unwrap();

        assert!(context.initialize().is_err());
        assert!(context.initialize().is_err());
        assert_eq!(good.inits.load(Ordering::SeqCst), 1);
        assert_eq!(bad.inits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_url_patterns() {
        assert!(UrlPattern::parse("/*").matches("/anything/at/all"));
        assert!(UrlPattern::parse("/api/*").matches("/api"));
        assert!(UrlPattern::parse("/api/*").matches("/api/users"));
        assert!(!UrlPattern::parse("/api/*").matches("/apiary"));
        assert!(UrlPattern::parse("*.css").matches("/static/site.css"));
        assert!(!UrlPattern::parse("*.css").matches("/static.css/site"));
        assert!(UrlPattern::parse("/health").matches("/health"));
        assert!(!UrlPattern::parse("/health").matches("/health/deep"));
        assert_eq!(UrlPattern::parse("/"), UrlPattern::Default);
    }

    /// Exact paths win over prefixes, the longest prefix wins over shorter
    /// ones, then extensions, then the default mapping.
    #[test]
    fn test_handler_resolution_order() {
        let named = |name: &'static str| {
            HandlerRegistration::new(name, |_: &mut Request, response: &mut Response| {
                response.write(b"")
            })
        };
        let context = ServerContext::builder()
            .handler(named("status").with_pattern("/api/status"))
            .handler(named("api").with_pattern("/api/*"))
            .handler(named("api-v2").with_pattern("/api/v2/*"))
            .handler(named("styles").with_pattern("*.css"))
            .build()
            .unwrap();

        assert_eq!(context.resolve_handler("/api/status").name(), "status");
        assert_eq!(context.resolve_handler("/api/v1/users").name(), "api");
        assert_eq!(context.resolve_handler("/api/v2/users").name(), "api-v2");
        assert_eq!(context.resolve_handler("/site/main.css").name(), "styles");
        assert_eq!(context.resolve_handler("/missing").name(), "not-found");
        // no placeholder syntax: a colon segment is literal
        assert_eq!(context.resolve_handler("/users/42").name(), "not-found");
    }

    /// Duplicate patterns are rejected when the context is built.
    #[test]
    fn test_duplicate_pattern_rejected() {
        let handler = |_: &mut Request, _: &mut Response| -> Result<()> {
            Err(ExchangeError::Unsupported("unused"))
        };
        let result = ServerContext::builder()
            .handler(HandlerRegistration::new("a", handler).with_pattern("/same"))
            .handler(HandlerRegistration::new("b", handler).with_pattern("/same"))
            .build();
        assert!(matches!(
            result,
            Err(LifecycleError::DuplicatePattern { pattern }) if pattern == "/same"
        ));

        let result = ServerContext::builder()
            .handler(HandlerRegistration::new("a", handler).with_pattern("/api/*"))
            .handler(HandlerRegistration::new("b", handler).with_pattern("/api/*"))
            .build();
        assert!(matches!(result, Err(LifecycleError::DuplicatePattern { .. })));
    }
}
