//! Protocol detection and pipeline assembly.
//!
//! A [`ProtocolRegistrar`] looks at the first bytes of a connection, claims it
//! or passes, and builds the [`Pipeline`] that serves it. The [`Multiplexer`]
//! asks its registrars in priority order.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use hyper::server::conn::Http;
use hyper::service::service_fn;
use hyper::Body;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;

use crate::config::{CodecLimits, ServerConfig};
use crate::connection::Connection;
use crate::context::ServerContext;
use crate::dispatch::{self, Dispatcher};
use crate::error::LifecycleError;
use crate::executor::Executor;
use crate::tls::{PemFiles, TlsContextBuilder};

/// Stage names, in pipeline order.
pub const STAGE_SSL: &str = "SSL";
pub const STAGE_CODEC: &str = "HttpCodec";
pub const STAGE_AGGREGATOR: &str = "Aggregator";
pub const STAGE_DISPATCH: &str = "Dispatch";

/// Cheap check of the first request line.
///
/// Finds the first LF. Lines ending before offset 9 are rejected. Two forms
/// are claimed:
///
/// * the bare token: the four bytes right before the LF are `HTTP`
/// * a versioned request line: `HTTP/x.y\r\n`, the form real clients send
///   (`HTTP` at LF-9..LF-6); a bare-LF `HTTP/x.y\n` is accepted as well,
///   since hyper parses it
pub fn sniff_http(bytes: &[u8]) -> bool {
    let end = match bytes.iter().position(|&b| b == b'\n') {
        Some(end) if end >= 9 => end,
        _ => return false,
    };

    if &bytes[end - 4..end] == b"HTTP" {
        return true;
    }

    let line = match bytes[..end].strip_suffix(b"\r") {
        Some(line) => line,
        None => &bytes[..end],
    };
    match line.len().checked_sub(8).map(|start| &line[start..]) {
        Some([b'H', b'T', b'T', b'P', b'/', major, b'.', minor]) => {
            major.is_ascii_digit() && minor.is_ascii_digit()
        }
        _ => false,
    }
}

/// Whether `bytes` start a TLS handshake record.
pub fn is_tls_handshake(bytes: &[u8]) -> bool {
    matches!(bytes, [0x16, 0x03, ..])
}

/// One protocol the server can speak.
pub trait ProtocolRegistrar: Send + Sync {
    fn name(&self) -> &str;

    /// Sniff order; lower values are asked first.
    fn priority(&self) -> i32;

    /// Whether connections built by this registrar are encrypted.
    fn is_secure(&self) -> bool {
        false
    }

    /// Whether the connection that sent `bytes` belongs to this registrar.
    /// Must not consume or allocate.
    fn can_handle(&self, bytes: &[u8]) -> bool;

    fn build_pipeline(&self, connection: Connection) -> Result<Pipeline, LifecycleError>;

    fn on_start(&self) -> Result<(), LifecycleError>;

    fn on_stop(&self);
}

/// HTTP/1 connection settings passed to the codec stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Http1Settings {
    pub keep_alive: bool,
    pub half_close: bool,
    pub title_case_headers: bool,
    pub preserve_header_case: bool,
}

impl Default for Http1Settings {
    fn default() -> Self {
        Self {
            keep_alive: true,
            half_close: false,
            title_case_headers: false,
            preserve_header_case: false,
        }
    }
}

impl Http1Settings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            keep_alive: config.http1_keep_alive,
            half_close: config.http1_half_close,
            title_case_headers: config.http1_title_case_headers,
            preserve_header_case: config.http1_preserve_header_case,
        }
    }
}

/// Registrar for HTTP/1, or HTTPS when given a TLS context builder.
///
/// The TLS acceptor is built from the builder on first use and shared by
/// every later connection.
pub struct HttpRegistrar {
    context: Arc<ServerContext>,
    tls: Option<Box<dyn TlsContextBuilder>>,
    acceptor: Mutex<Option<TlsAcceptor>>,
    limits: CodecLimits,
    settings: Http1Settings,
}

impl HttpRegistrar {
    pub const PRIORITY: i32 = 100;

    pub fn new(context: Arc<ServerContext>) -> Self {
        Self {
            context,
            tls: None,
            acceptor: Mutex::new(None),
            limits: CodecLimits::default(),
            settings: Http1Settings::default(),
        }
    }

    /// Limits and HTTP/1 settings from `config`, plus TLS from the PEM
    /// files when both paths are set.
    pub fn from_config(context: Arc<ServerContext>, config: &ServerConfig) -> Self {
        let registrar = Self::new(context)
            .with_limits(config.codec_limits())
            .with_settings(Http1Settings::from_config(config));

        match (&config.tls_cert_path, &config.tls_key_path) {
            (Some(cert), Some(key)) => registrar.with_tls(PemFiles::new(cert, key)),
            _ => registrar,
        }
    }

    pub fn with_tls(mut self, builder: impl TlsContextBuilder + 'static) -> Self {
        self.tls = Some(Box::new(builder));
        self
    }

    pub fn with_limits(mut self, limits: CodecLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_settings(mut self, settings: Http1Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    pub fn limits(&self) -> CodecLimits {
        self.limits
    }

    fn acceptor(&self, builder: &dyn TlsContextBuilder) -> Result<TlsAcceptor, LifecycleError> {
        let mut acceptor = self.acceptor.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(acceptor) = acceptor.as_ref() {
            return Ok(acceptor.clone());
        }

        let built = TlsAcceptor::from(builder.build()?);
        *acceptor = Some(built.clone());
        log::debug!("tls context built for {}", self.name());
        Ok(built)
    }
}

impl ProtocolRegistrar for HttpRegistrar {
    fn name(&self) -> &str {
        if self.tls.is_some() {
            "https"
        } else {
            "http"
        }
    }

    fn priority(&self) -> i32 {
        Self::PRIORITY
    }

    fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    fn can_handle(&self, bytes: &[u8]) -> bool {
        if self.tls.is_some() {
            is_tls_handshake(bytes)
        } else {
            sniff_http(bytes)
        }
    }

    fn build_pipeline(&self, connection: Connection) -> Result<Pipeline, LifecycleError> {
        let tls = match &self.tls {
            Some(builder) => Some(self.acceptor(builder.as_ref())?),
            None => None,
        };

        let mut stages = Vec::with_capacity(4);
        if tls.is_some() {
            stages.push(STAGE_SSL);
        }
        stages.extend([STAGE_CODEC, STAGE_AGGREGATOR, STAGE_DISPATCH]);
        log::debug!("connection {}: pipeline {:?}", connection.id(), stages);

        Ok(Pipeline {
            stages,
            tls,
            connection,
            dispatcher: Dispatcher::new(self.context.clone()),
            limits: self.limits,
            settings: self.settings,
        })
    }

    fn on_start(&self) -> Result<(), LifecycleError> {
        self.context.initialize()
    }

    fn on_stop(&self) {
        self.context.destroy();
    }
}

impl fmt::Debug for HttpRegistrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRegistrar")
            .field("name", &self.name())
            .field("limits", &self.limits)
            .field("settings", &self.settings)
            .finish()
    }
}

/// The stages serving one connection.
pub struct Pipeline {
    stages: Vec<&'static str>,
    tls: Option<TlsAcceptor>,
    connection: Connection,
    dispatcher: Dispatcher,
    limits: CodecLimits,
    settings: Http1Settings,
}

impl Pipeline {
    pub fn stages(&self) -> &[&'static str] {
        &self.stages
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Serves `io` until the peer goes away or the connection stops being
    /// kept alive. Request tasks run on `executor`.
    pub async fn serve<I>(self, io: I, executor: Executor)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection = self.connection.clone();

        match self.tls.clone() {
            Some(acceptor) => match acceptor.accept(io).await {
                Ok(stream) => self.drive(stream, executor).await,
                Err(err) => log::debug!("connection {}: tls handshake failed: {}", connection.id(), err),
            },
            None => self.drive(io, executor).await,
        }

        connection.close();
    }

    async fn drive<I>(self, io: I, executor: Executor)
    where
        I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Pipeline {
            connection,
            dispatcher,
            limits,
            settings,
            ..
        } = self;
        let id = connection.id();

        let mut http = Http::new().with_executor(executor);
        http.http1_only(true)
            .http1_keep_alive(settings.keep_alive)
            .http1_half_close(settings.half_close)
            .http1_title_case_headers(settings.title_case_headers)
            .http1_preserve_header_case(settings.preserve_header_case)
            .max_buf_size(codec_buffer_size(&limits));

        let service = service_fn(move |request: hyper::Request<Body>| {
            dispatch::serve_request(dispatcher.clone(), connection.clone(), limits, request)
        });

        if let Err(err) = http.serve_connection(io, service).await {
            log::debug!("connection {}: {}", id, err);
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stages)
            .field("connection", &self.connection.id())
            .finish()
    }
}

/// Read buffer for the request head; the codec needs at least 8 KiB.
fn codec_buffer_size(limits: &CodecLimits) -> usize {
    (limits.max_initial_line_length + limits.max_header_size).max(8192)
}

/// Registrars in sniff order.
#[derive(Default)]
pub struct Multiplexer {
    registrars: Vec<Arc<dyn ProtocolRegistrar>>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `registrar`, keeping ascending priority. Registrars with equal
    /// priority are asked in the order they were added.
    pub fn register(&mut self, registrar: impl ProtocolRegistrar + 'static) -> &mut Self {
        let registrar: Arc<dyn ProtocolRegistrar> = Arc::new(registrar);
        let at = self
            .registrars
            .partition_point(|existing| existing.priority() <= registrar.priority());
        self.registrars.insert(at, registrar);
        self
    }

    pub fn registrars(&self) -> &[Arc<dyn ProtocolRegistrar>] {
        &self.registrars
    }

    pub fn is_empty(&self) -> bool {
        self.registrars.is_empty()
    }

    /// The first registrar claiming `bytes`.
    pub fn select(&self, bytes: &[u8]) -> Option<&Arc<dyn ProtocolRegistrar>> {
        self.registrars.iter().find(|registrar| registrar.can_handle(bytes))
    }

    /// Starts every registrar. All are started even when one fails; the
    /// first failure is returned.
    pub fn start_all(&self) -> Result<(), LifecycleError> {
        let mut first = None;
        for registrar in &self.registrars {
            if let Err(err) = registrar.on_start() {
                log::warn!("registrar {} failed to start: {}", registrar.name(), err);
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Stops registrars in reverse start order.
    pub fn stop_all(&self) {
        for registrar in self.registrars.iter().rev() {
            registrar.on_stop();
        }
    }
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.registrars.iter().map(|r| (r.name(), r.priority())))
            .finish()
    }
}
