//! Interceptor chains and their timing sink.
//!
//! A chain is built per exchange from the interceptors whose patterns match
//! the request path, followed by the resolved handler. It is pooled and
//! resets itself once its handler has run.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::context::{HandlerRegistration, InterceptorRegistration, RequestListener, ServerContext};
use crate::error::{ExchangeError, Result};
use crate::recycler::{Pooled, Recyclable, Recycler};
use crate::request::Request;
use crate::response::Response;

static RECYCLER: Recycler<FilterChain> = Recycler::new();

/// Receives the time spent in each part of a chain.
pub trait ChainMetrics: Send + Sync {
    /// From chain creation until the handler starts.
    fn record_interceptor_time(&self, elapsed: Duration);

    fn record_handler_time(&self, elapsed: Duration);
}

/// Running totals of chain timings.
#[derive(Debug, Default)]
pub struct ChainTimings {
    interceptor_nanos: AtomicU64,
    handler_nanos: AtomicU64,
    exchanges: AtomicU64,
}

impl ChainTimings {
    pub fn interceptor_time(&self) -> Duration {
        Duration::from_nanos(self.interceptor_nanos.load(Ordering::Relaxed))
    }

    pub fn handler_time(&self) -> Duration {
        Duration::from_nanos(self.handler_nanos.load(Ordering::Relaxed))
    }

    /// Number of exchanges that reached their handler.
    pub fn exchanges(&self) -> u64 {
        self.exchanges.load(Ordering::Relaxed)
    }
}

impl ChainMetrics for ChainTimings {
    fn record_interceptor_time(&self, elapsed: Duration) {
        self.interceptor_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    fn record_handler_time(&self, elapsed: Duration) {
        self.handler_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.exchanges.fetch_add(1, Ordering::Relaxed);
    }
}

/// Ordered interceptors in front of one handler.
///
/// The chain is a cursor over its interceptors. Each call to
/// [`FilterChain::advance`] runs the next step: interceptor `pos` while
/// `pos` is below the interceptor count, the handler when it reaches it.
/// Interceptors continue by calling `advance` themselves, so one that
/// returns without doing so ends the exchange early.
///
/// Once the handler has run, the request-destroyed notification fires and
/// the chain resets itself. A chain that never reaches its handler is
/// cleaned up with [`FilterChain::finish`].
#[derive(Default)]
pub struct FilterChain {
    interceptors: Vec<Arc<InterceptorRegistration>>,
    handler: Option<Arc<HandlerRegistration>>,
    context: Option<Arc<ServerContext>>,
    metrics: Option<Arc<dyn ChainMetrics>>,
    pos: usize,
    begin: Option<Instant>,
    notified: bool,
}

impl FilterChain {
    pub fn new_instance(
        context: Arc<ServerContext>,
        interceptors: impl IntoIterator<Item = Arc<InterceptorRegistration>>,
        handler: Arc<HandlerRegistration>,
        metrics: Arc<dyn ChainMetrics>,
    ) -> Pooled<FilterChain> {
        let mut chain = RECYCLER.acquire();
        chain.interceptors.extend(interceptors);
        chain.handler = Some(handler);
        chain.context = Some(context);
        chain.metrics = Some(metrics);
        chain.begin = Some(Instant::now());
        chain
    }

    /// Runs the next step of the chain.
    ///
    /// Errors from interceptors and the handler are returned unchanged; a
    /// panicking handler is reported as [`ExchangeError::Panicked`].
    pub fn advance(&mut self, request: &mut Request, response: &mut Response) -> Result<()> {
        let handler = self
            .handler
            .clone()
            .ok_or(ExchangeError::Recycled("filter chain"))?;

        if self.pos == 0 && !self.notified {
            self.notified = true;
            self.notify(|listener| listener.request_initialized(request));
        }

        if let Some(registration) = self.interceptors.get(self.pos).cloned() {
            self.pos += 1;
            log::trace!("interceptor {} for {}", registration.name(), request.path());
            return registration
                .interceptor()
                .intercept(request, response, self);
        }

        self.pos += 1;
        let started = Instant::now();
        let begin = self.begin.unwrap_or(started);
        self.record(|metrics| metrics.record_interceptor_time(started.duration_since(begin)));

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            handler.handler().service(request, response)
        }))
        .unwrap_or_else(|payload| Err(ExchangeError::Panicked(panic_message(payload.as_ref()))));

        let elapsed = started.elapsed();
        self.record(|metrics| metrics.record_handler_time(elapsed));
        log::trace!(
            "{} {} handled by {} in {:?}",
            request.method(),
            request.path(),
            handler.name(),
            elapsed
        );

        self.cleanup(request);
        result
    }

    /// Cleans up a chain that stopped before its handler, either because an
    /// interceptor ended the exchange or because it failed. Does nothing once
    /// the chain has completed.
    pub fn finish(&mut self, request: &Request) {
        if self.handler.is_some() {
            self.cleanup(request);
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn interceptor_count(&self) -> usize {
        self.interceptors.len()
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    pub fn handler_name(&self) -> Option<&str> {
        self.handler.as_deref().map(HandlerRegistration::name)
    }

    fn cleanup(&mut self, request: &Request) {
        if self.notified {
            self.notify(|listener| listener.request_destroyed(request));
        }
        self.recycle();
    }

    fn notify(&self, f: impl Fn(&dyn RequestListener)) {
        if let Some(context) = &self.context {
            for listener in context.request_listeners() {
                f(listener.as_ref());
            }
        }
    }

    fn record(&self, f: impl FnOnce(&dyn ChainMetrics)) {
        if let Some(metrics) = &self.metrics {
            f(metrics.as_ref());
        }
    }
}

impl Recyclable for FilterChain {
    fn recycle(&mut self) {
        self.interceptors.clear();
        self.handler = None;
        self.context = None;
        self.metrics = None;
        self.pos = 0;
        self.begin = None;
        self.notified = false;
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("interceptors", &self.interceptors.len())
            .field("handler", &self.handler_name())
            .field("pos", &self.pos)
            .finish()
    }
}

/// Text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
