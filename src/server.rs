//! Accepting connections and handing them to a registrar's pipeline.
//!
//! The acceptor thread blocks on the listener. Each accepted socket becomes
//! a worker task: the first bytes are peeked (without consuming them) until
//! a line ends or the sniff timeout passes, the [`Multiplexer`] picks a
//! registrar, and the socket is registered with the reactor and served by
//! the registrar's pipeline.

use std::io;
use std::net::{self, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::context::ServerContext;
use crate::error::ServerError;
use crate::executor::Executor;
use crate::net::Reactor;
use crate::protocol::{self, HttpRegistrar, Multiplexer, ProtocolRegistrar};

/// Bytes peeked beyond the request-line limit: room for CRLF.
const SNIFF_SLACK: usize = 2;
const SNIFF_POLL: Duration = Duration::from_millis(5);

pub struct Server {
    config: ServerConfig,
    multiplexer: Arc<Multiplexer>,
}

impl Server {
    pub fn new(config: ServerConfig, multiplexer: Multiplexer) -> Self {
        Self {
            config,
            multiplexer: Arc::new(multiplexer),
        }
    }

    /// A server with one [`HttpRegistrar`] for `context`, HTTPS when the
    /// configuration names a certificate and key.
    pub fn http(config: ServerConfig, context: ServerContext) -> Self {
        let mut multiplexer = Multiplexer::new();
        multiplexer.register(HttpRegistrar::from_config(Arc::new(context), &config));
        Self::new(config, multiplexer)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.multiplexer
    }

    /// Binds the listener, starts every registrar and begins accepting.
    ///
    /// Registrations that fail to initialize are logged and left out of
    /// service; they do not stop the server.
    pub fn start(self) -> Result<ServerHandle, ServerError> {
        if self.multiplexer.is_empty() {
            return Err(ServerError::NoRegistrars);
        }

        let listener = TcpListener::bind(self.config.bind_addr()).map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;

        if let Err(err) = self.multiplexer.start_all() {
            log::warn!("starting with failed registrations: {}", err);
        }

        let acceptor = Acceptor {
            multiplexer: self.multiplexer.clone(),
            reactor: Reactor::new()?,
            executor: Executor::from_config(&self.config),
            sniff_timeout: self.config.sniff_timeout(),
            sniff_limit: self.config.max_initial_line_length + SNIFF_SLACK,
        };

        let stopped = Arc::new(AtomicBool::new(false));
        let thread = thread::Builder::new()
            .name("muxlet-acceptor".to_owned())
            .spawn({
                let stopped = stopped.clone();
                move || acceptor.run(listener, &stopped)
            })
            .map_err(ServerError::Acceptor)?;

        log::info!("listening on {}", local_addr);
        Ok(ServerHandle {
            local_addr,
            stopped,
            thread: Some(thread),
            multiplexer: self.multiplexer,
        })
    }

    /// Starts the server and blocks the calling thread on the acceptor.
    pub fn run(self) -> Result<(), ServerError> {
        self.start()?.join();
        Ok(())
    }
}

/// A running server. Dropping the handle stops it.
pub struct ServerHandle {
    local_addr: SocketAddr,
    stopped: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    multiplexer: Arc<Multiplexer>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and runs every registrar's stop hook. Connections
    /// already being served finish on their workers.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("acceptor thread panicked");
            }
        }
        self.multiplexer.stop_all();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.stopped.store(true, Ordering::Release);
        // unblock accept()
        if let Err(err) = net::TcpStream::connect(self.local_addr) {
            log::debug!("failed to wake acceptor: {}", err);
        }
        if thread.join().is_err() {
            log::error!("acceptor thread panicked");
        }
        self.multiplexer.stop_all();
        log::info!("stopped listening on {}", self.local_addr);
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Clone)]
struct Acceptor {
    multiplexer: Arc<Multiplexer>,
    reactor: Reactor,
    executor: Executor,
    sniff_timeout: Duration,
    sniff_limit: usize,
}

impl Acceptor {
    fn run(self, listener: TcpListener, stopped: &AtomicBool) {
        for stream in listener.incoming() {
            if stopped.load(Ordering::Acquire) {
                break;
            }

            let stream = match stream {
                Ok(stream) => stream,
                Err(err) => {
                    log::warn!("accept failed: {}", err);
                    continue;
                }
            };

            let acceptor = self.clone();
            if let Err(err) = self.executor.spawn(async move { acceptor.serve(stream).await }) {
                log::error!("failed to schedule connection: {}", err);
            }
        }
    }

    async fn serve(self, stream: net::TcpStream) {
        let peer = stream.peer_addr().ok();

        let initial = match sniff(&stream, self.sniff_limit, self.sniff_timeout) {
            Ok(initial) => initial,
            Err(err) => {
                log::debug!("dropping {:?} before sniffing: {}", peer, err);
                return;
            }
        };

        let registrar: Arc<dyn ProtocolRegistrar> = match self.multiplexer.select(&initial) {
            Some(registrar) => registrar.clone(),
            None => {
                log::debug!("no registrar claims {:?}", peer);
                return;
            }
        };

        let connection = Connection::with_security(
            stream.local_addr().ok(),
            peer,
            registrar.is_secure(),
        );
        log::debug!(
            "connection {} from {:?} claimed by {}",
            connection.id(),
            peer,
            registrar.name()
        );

        let pipeline = match registrar.build_pipeline(connection) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                log::warn!("{} could not build a pipeline: {}", registrar.name(), err);
                return;
            }
        };

        let stream = match self.reactor.register(stream) {
            Ok(stream) => stream,
            Err(err) => {
                log::error!("failed to register connection: {}", err);
                return;
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            log::debug!("failed to set nodelay: {}", err);
        }

        pipeline.serve(stream, self.executor.clone()).await;
    }
}

/// Peeks at the first bytes of `stream` until the first line ends, a TLS
/// record header shows up, `limit` bytes are buffered or the peer closes.
fn sniff(stream: &net::TcpStream, limit: usize, timeout: Duration) -> io::Result<Vec<u8>> {
    let deadline = Instant::now() + timeout;
    let mut buf = vec![0; limit.max(SNIFF_SLACK)];

    let peeked = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "sniff timed out"));
        }
        stream.set_read_timeout(Some(remaining))?;

        let n = stream.peek(&mut buf)?;
        let seen = &buf[..n];
        if n == 0 || n == buf.len() || seen.contains(&b'\n') || protocol::is_tls_handshake(seen) {
            break n;
        }
        thread::sleep(SNIFF_POLL.min(remaining));
    };

    stream.set_read_timeout(None)?;
    buf.truncate(peeked);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::HandlerRegistration;
    use crate::request::Request;
    use crate::response::Response;
    use std::io::{Read, Write};

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            max_workers: 4,
            sniff_timeout_ms: 200,
            ..ServerConfig::default()
        }
    }

    fn hello_server() -> ServerHandle {
        let context = ServerContext::builder()
            .handler(
                HandlerRegistration::new("hello", |req: &mut Request, resp: &mut Response| -> crate::Result<()> {
                    let greeting = format!("hello {}", req.query().unwrap_or("world"));
                    resp.set_content_type("text/plain")?;
                    resp.writer()?.print(&greeting)
                })
                .with_pattern("/hello"),
            )
            .build()
            .unwrap();
        Server::http(test_config(), context).start().unwrap()
    }

    fn exchange(addr: SocketAddr, request: &[u8]) -> String {
        let mut client = net::TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        client.write_all(request).unwrap();
        let mut out = String::new();
        match client.read_to_string(&mut out) {
            Ok(_) => {}
            // unread request bytes make the server side reset
            Err(err) if err.kind() == io::ErrorKind::ConnectionReset => {}
            Err(err) => panic!("read failed: {}", err),
        }
        out
    }

    /// A plain HTTP/1.1 request is sniffed, dispatched and answered.
    #[test]
    fn test_serves_http() {
        let server = hello_server();
        let response = exchange(
            server.local_addr(),
            b"GET /hello?muxlet HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        );

        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
        assert!(response.contains("content-length: 12\r\n"), "{}", response);
        assert!(response.ends_with("\r\n\r\nhello muxlet"), "{}", response);
        server.shutdown();
    }

    /// Unknown paths get the built-in 404.
    #[test]
    fn test_not_found() {
        let server = hello_server();
        let response = exchange(
            server.local_addr(),
            b"GET /nowhere HTTP/1.0\r\n\r\n",
        );
        assert!(response.contains(" 404 Not Found\r\n"), "{}", response);
        server.shutdown();
    }

    /// Connections no registrar claims are closed without a reply.
    #[test]
    fn test_unclaimed_protocol_closed() {
        let server = hello_server();
        let response = exchange(server.local_addr(), b"SSH-2.0-OpenSSH_9.0\r\n");
        assert!(response.is_empty());
        server.shutdown();
    }

    /// A silent connection is dropped once the sniff timeout passes.
    #[test]
    fn test_silent_connection_dropped() {
        let server = hello_server();
        let started = Instant::now();
        let response = exchange(server.local_addr(), b"");
        assert!(response.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
        server.shutdown();
    }

    #[test]
    fn test_empty_multiplexer_rejected() {
        let server = Server::new(test_config(), Multiplexer::new());
        assert!(matches!(server.start(), Err(ServerError::NoRegistrars)));
    }

    /// Peeking leaves the bytes in the socket for the codec.
    #[test]
    fn test_sniff_does_not_consume() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut accepted, _) = listener.accept().unwrap();

        client.write_all(b"GET / HTTP/1.1\r\n").unwrap();
        let initial = sniff(&accepted, 64, Duration::from_secs(2)).unwrap();
        assert_eq!(initial, b"GET / HTTP/1.1\r\n");

        let mut line = [0u8; 16];
        accepted.read_exact(&mut line).unwrap();
        assert_eq!(&line, b"GET / HTTP/1.1\r\n");
    }

    /// Sniffing stops at the limit even without a line terminator.
    #[test]
    fn test_sniff_limit() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();

        client.write_all(b"0123456789abcdef").unwrap();
        let initial = sniff(&accepted, 8, Duration::from_secs(2)).unwrap();
        assert_eq!(initial, b"01234567");
    }
}
