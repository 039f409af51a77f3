//! Dispatch: the last pipeline stage.
//!
//! An aggregated request becomes an [`Exchange`], runs through its filter
//! chain and is finished. The hyper glue around it collects the request body
//! under the configured limits and streams the response back through a
//! channel-backed [`Outbound`].

use std::convert::Infallible;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::channel::{mpsc, oneshot};
use hyper::body::{Bytes, HttpBody};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Body, StatusCode};

use crate::chain::panic_message;
use crate::config::CodecLimits;
use crate::connection::Connection;
use crate::context::ServerContext;
use crate::error::{ExchangeError, Result};
use crate::exchange::Exchange;
use crate::output::Outbound;
use crate::request::DecodedRequest;

/// Runs decoded requests against a [`ServerContext`].
#[derive(Clone)]
pub struct Dispatcher {
    context: Arc<ServerContext>,
}

impl Dispatcher {
    pub fn new(context: Arc<ServerContext>) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Serves one request, writing the response to `outbound`.
    ///
    /// A failing or panicking chain is answered with an error response when
    /// nothing has been committed yet; otherwise the failure is only logged.
    /// The returned error is the one from finishing the exchange.
    pub fn dispatch(
        &self,
        connection: Connection,
        decoded: DecodedRequest,
        outbound: Box<dyn Outbound>,
    ) -> Result<()> {
        let mut exchange = Exchange::create(connection, self.context.clone(), decoded, outbound);

        if let Err(err) = self.run_chain(&mut exchange) {
            report_failure(&mut exchange, err);
        }

        Exchange::finish(exchange)
    }

    fn run_chain(&self, exchange: &mut Exchange) -> Result<()> {
        let (request, response) = exchange.parts_mut()?;
        let mut chain = self.context.build_chain(request);

        let result = panic::catch_unwind(AssertUnwindSafe(|| chain.advance(request, response)))
            .unwrap_or_else(|payload| Err(ExchangeError::Panicked(panic_message(payload.as_ref()))));

        chain.finish(request);
        result
    }
}

fn report_failure(exchange: &mut Exchange, err: ExchangeError) {
    let path = exchange
        .request()
        .map(|request| request.path().to_string())
        .unwrap_or_default();

    let response = match exchange.response_mut() {
        Ok(response) => response,
        Err(_) => {
            log::error!("{} failed without a response: {}", path, err);
            return;
        }
    };

    if response.is_async_started()
        || response.is_committed()
        || response.output_stream().is_transferred()
    {
        log::warn!("{} failed after the response was committed: {}", path, err);
        return;
    }

    let status = err.status_code();
    log::warn!("{} failed with {}: {}", path, status, err);

    let message = match &err {
        ExchangeError::Status { message, .. } => message.as_str(),
        _ => status.canonical_reason().unwrap_or("error"),
    };
    if let Err(send_err) = response.send_error(status, message) {
        log::error!("could not send error response for {}: {}", path, send_err);
    }
}

/// Response head as handed to hyper.
pub(crate) type Head = (StatusCode, HeaderMap);

/// [`Outbound`] feeding a hyper response: the head goes through a oneshot,
/// body chunks through an unbounded channel that `finish` closes.
pub(crate) struct ChannelOutbound {
    head: Option<oneshot::Sender<Head>>,
    body: Option<mpsc::UnboundedSender<io::Result<Bytes>>>,
}

impl ChannelOutbound {
    pub(crate) fn new() -> (
        Self,
        oneshot::Receiver<Head>,
        mpsc::UnboundedReceiver<io::Result<Bytes>>,
    ) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::unbounded();
        let outbound = Self {
            head: Some(head_tx),
            body: Some(body_tx),
        };
        (outbound, head_rx, body_rx)
    }
}

impl Outbound for ChannelOutbound {
    fn send_head(&mut self, status: StatusCode, headers: HeaderMap) -> io::Result<()> {
        let head = self
            .head
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "response head already sent"))?;
        head.send((status, headers))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection went away"))
    }

    fn send_data(&mut self, chunk: Bytes) -> io::Result<()> {
        let body = self
            .body
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "response body already finished"))?;
        body.unbounded_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "connection went away"))
    }

    fn finish(&mut self) -> io::Result<()> {
        self.head.take();
        self.body.take();
        Ok(())
    }
}

/// Collects the request body, enforcing the request-line and content limits.
///
/// The rejection status is returned before any exchange exists: 414 for an
/// oversized request target, 413 for an oversized body or chunk, 400 for a
/// body that could not be read.
pub(crate) async fn aggregate(
    request: hyper::Request<Body>,
    limits: &CodecLimits,
) -> std::result::Result<DecodedRequest, StatusCode> {
    if request_line_length(&request) > limits.max_initial_line_length {
        log::warn!("request line over {} bytes", limits.max_initial_line_length);
        return Err(StatusCode::URI_TOO_LONG);
    }

    if let Some(length) = declared_length(request.headers()) {
        if length > limits.max_content_length {
            log::warn!(
                "declared content length {} over {} bytes",
                length,
                limits.max_content_length
            );
            return Err(StatusCode::PAYLOAD_TOO_LARGE);
        }
    }

    let (parts, mut body) = request.into_parts();
    let mut content = Vec::new();

    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|e| {
            log::debug!("failed to read request body: {}", e);
            StatusCode::BAD_REQUEST
        })?;

        if chunk.len() > limits.max_chunk_size
            || content.len() + chunk.len() > limits.max_content_length
        {
            log::warn!("request body over {} bytes", limits.max_content_length);
            return Err(StatusCode::PAYLOAD_TOO_LARGE);
        }
        content.extend_from_slice(&chunk);
    }

    Ok(hyper::Request::from_parts(parts, Bytes::from(content)))
}

/// `METHOD SP target SP HTTP/x.y`
fn request_line_length<B>(request: &hyper::Request<B>) -> usize {
    let target = match request.uri().path_and_query() {
        Some(target) if request.uri().scheme().is_none() => target.as_str().len(),
        _ => request.uri().to_string().len(),
    };
    request.method().as_str().len() + 1 + target + 1 + "HTTP/1.1".len()
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Serves one hyper request: aggregate, dispatch, then hand hyper the head
/// once the response commits and the body as it is written.
pub(crate) async fn serve_request(
    dispatcher: Dispatcher,
    connection: Connection,
    limits: CodecLimits,
    request: hyper::Request<Body>,
) -> std::result::Result<hyper::Response<Body>, Infallible> {
    let decoded = match aggregate(request, &limits).await {
        Ok(decoded) => decoded,
        Err(status) => return Ok(status_response(status)),
    };

    let (outbound, head, body) = ChannelOutbound::new();
    if let Err(err) = dispatcher.dispatch(connection, decoded, Box::new(outbound)) {
        log::error!("failed to finish exchange: {}", err);
    }

    match head.await {
        Ok((status, headers)) => {
            let mut response = hyper::Response::new(Body::wrap_stream(body));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            Ok(response)
        }
        Err(_) => {
            log::error!("exchange ended without a response head");
            Ok(status_response(StatusCode::INTERNAL_SERVER_ERROR))
        }
    }
}

fn status_response(status: StatusCode) -> hyper::Response<Body> {
    let reason = status.canonical_reason().unwrap_or("error");
    let mut response = hyper::Response::new(Body::from(reason));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{HandlerRegistration, InterceptorRegistration, RequestListener};
    use crate::output::testing::{Recorded, RecordingOutbound};
    use crate::request::Request;
    use crate::response::Response;
    use crate::AsyncResponse;
    use futures::executor::block_on;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc as std_mpsc, Mutex};

    fn new_dispatcher(builder: crate::context::ServerContextBuilder) -> Dispatcher {
        let context = Arc::new(builder.build().unwrap());
        context.initialize().unwrap();
        Dispatcher::new(context)
    }

    fn get(path: &str) -> DecodedRequest {
        hyper::Request::builder()
            .uri(path)
            .body(Bytes::new())
            .unwrap()
    }

    fn run(dispatcher: &Dispatcher, request: DecodedRequest) -> Arc<Mutex<Recorded>> {
        let outbound = RecordingOutbound::default();
        let recorded = outbound.recorded.clone();
        dispatcher
            .dispatch(Connection::new(None, None), request, Box::new(outbound))
            .unwrap();
        recorded
    }

    /// A handler's output is committed and finished when dispatch returns.
    #[test]
    fn test_dispatch_to_handler() {
        let dispatcher = new_dispatcher(ServerContext::builder().handler(
            HandlerRegistration::new("hello", |_: &mut Request, resp: &mut Response| -> Result<()> {
                resp.set_content_type("text/plain")?;
                resp.write(b"hello")
            })
            .with_pattern("/hello"),
        ));

        let recorded = run(&dispatcher, get("/hello"));
        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.status(), Some(StatusCode::OK));
        assert_eq!(recorded.body_str(), "hello");
        assert_eq!(recorded.header("content-length").as_deref(), Some("5"));
        assert!(recorded.finished);
    }

    /// Unmatched paths reach the built-in not-found handler.
    #[test]
    fn test_dispatch_not_found() {
        let dispatcher = new_dispatcher(ServerContext::builder());
        let recorded = run(&dispatcher, get("/missing"));
        assert_eq!(recorded.lock().unwrap().status(), Some(StatusCode::NOT_FOUND));
    }

    /// Handler errors become an error response while nothing is committed.
    #[test]
    fn test_handler_error_becomes_500() {
        let dispatcher = new_dispatcher(ServerContext::builder().handler(
            HandlerRegistration::new(
                "broken",
                |_: &mut Request, resp: &mut Response| -> Result<()> {
                    resp.write(b"partial")?;
                    Err(ExchangeError::handler("database unavailable"))
                },
            )
            .with_pattern("/*"),
        ));

        let recorded = run(&dispatcher, get("/anything"));
        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert_eq!(recorded.body_str(), "Internal Server Error");
        assert!(recorded.finished);
    }

    /// A status error carries its own status and message.
    #[test]
    fn test_status_error() {
        let dispatcher = new_dispatcher(ServerContext::builder().interceptor(
            InterceptorRegistration::new(
                "auth",
                |_: &mut Request, _: &mut Response, _: &mut crate::FilterChain| -> Result<()> {
                    Err(ExchangeError::status(StatusCode::FORBIDDEN, "no token"))
                },
            ),
        ));

        let recorded = run(&dispatcher, get("/"));
        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.status(), Some(StatusCode::FORBIDDEN));
        assert_eq!(recorded.body_str(), "no token");
    }

    /// A panicking interceptor is caught and answered with 500, and request
    /// listeners still see the end of the exchange.
    #[test]
    fn test_interceptor_panic() {
        #[derive(Default)]
        struct Listener {
            destroyed: AtomicUsize,
        }

        impl RequestListener for Arc<Listener> {
            fn request_destroyed(&self, _request: &Request) {
                self.destroyed.fetch_add(1, Ordering::SeqCst);
            }
        }

        let listener = Arc::new(Listener::default());
        let dispatcher = new_dispatcher(
            ServerContext::builder()
                .request_listener(listener.clone())
                .interceptor(InterceptorRegistration::new(
                    "explodes",
                    |_: &mut Request, _: &mut Response, _: &mut crate::FilterChain| -> Result<()> {
                        panic!("interceptor bug")
                    },
                )),
        );

        let recorded = run(&dispatcher, get("/"));
        assert_eq!(
            recorded.lock().unwrap().status(),
            Some(StatusCode::INTERNAL_SERVER_ERROR)
        );
        assert_eq!(listener.destroyed.load(Ordering::SeqCst), 1);
    }

    /// Once committed, a failure leaves the response as it was.
    #[test]
    fn test_error_after_commit() {
        let dispatcher = new_dispatcher(ServerContext::builder().handler(
            HandlerRegistration::new(
                "late",
                |_: &mut Request, resp: &mut Response| -> Result<()> {
                    resp.write(b"ok")?;
                    resp.flush_buffer()?;
                    Err(ExchangeError::handler("too late"))
                },
            )
            .with_pattern("/late"),
        ));

        let recorded = run(&dispatcher, get("/late"));
        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.status(), Some(StatusCode::OK));
        assert_eq!(recorded.body_str(), "ok");
        assert_eq!(recorded.heads_sent, 1);
    }

    /// An async response outlives dispatch and finishes the output later.
    #[test]
    fn test_async_handoff() {
        let (tx, rx) = std_mpsc::channel::<AsyncResponse>();
        let tx = Mutex::new(tx);
        let dispatcher = new_dispatcher(ServerContext::builder().handler(
            HandlerRegistration::new("async", move |_: &mut Request, resp: &mut Response| -> Result<()> {
                let async_response = resp.start_async()?;
                tx.lock().unwrap().send(async_response).unwrap();
                Ok(())
            })
            .with_pattern("/async"),
        ));

        let recorded = run(&dispatcher, get("/async"));
        assert!(recorded.lock().unwrap().head.is_none());

        let mut async_response = rx.recv().unwrap();
        std::thread::spawn(move || {
            async_response.write(b"later").unwrap();
            async_response.complete().unwrap();
        })
        .join()
        .unwrap();

        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.status(), Some(StatusCode::OK));
        assert_eq!(recorded.body_str(), "later");
        assert!(recorded.finished);
    }

    /// A handler that starts async mode and then fails still yields an error
    /// response, because the abandoned async response answers 500.
    #[test]
    fn test_async_started_then_error() {
        let dispatcher = new_dispatcher(ServerContext::builder().handler(
            HandlerRegistration::new("flaky", |_: &mut Request, resp: &mut Response| -> Result<()> {
                let _pending = resp.start_async()?;
                Err(ExchangeError::handler("backend down"))
            })
            .with_pattern("/flaky"),
        ));

        let recorded = run(&dispatcher, get("/flaky"));
        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert_eq!(recorded.body_str(), "Internal Server Error");
        assert!(recorded.finished);
    }

    /// Values an interceptor attaches to the request reach the handler
    /// mapped under a prefix.
    #[test]
    fn test_interceptor_extension_reaches_handler() {
        #[derive(Clone)]
        struct UserId(String);

        let dispatcher = new_dispatcher(
            ServerContext::builder()
                .interceptor(
                    InterceptorRegistration::new(
                        "user",
                        |req: &mut Request, resp: &mut Response, chain: &mut crate::FilterChain| -> Result<()> {
                            let id = req.path().rsplit('/').next().unwrap_or_default().to_string();
                            req.extensions_mut().insert(UserId(id));
                            chain.advance(req, resp)
                        },
                    )
                    .with_pattern("/users/*"),
                )
                .handler(
                    HandlerRegistration::new("users", |req: &mut Request, resp: &mut Response| -> Result<()> {
                        let id = req
                            .extensions()
                            .get::<UserId>()
                            .map(|id| id.0.clone())
                            .unwrap_or_default();
                        resp.write(id.as_bytes())
                    })
                    .with_pattern("/users/*"),
                ),
        );

        let recorded = run(&dispatcher, get("/users/42"));
        assert_eq!(recorded.lock().unwrap().body_str(), "42");
    }

    /// The channel outbound delivers head and body, then ends the stream.
    #[test]
    fn test_channel_outbound() {
        let (mut outbound, head, mut body) = ChannelOutbound::new();
        outbound.send_head(StatusCode::CREATED, HeaderMap::new()).unwrap();
        outbound.send_data(Bytes::from_static(b"abc")).unwrap();
        outbound.finish().unwrap();

        assert!(outbound.send_head(StatusCode::OK, HeaderMap::new()).is_err());
        assert!(outbound.send_data(Bytes::from_static(b"x")).is_err());

        block_on(async {
            let (status, _) = head.await.unwrap();
            assert_eq!(status, StatusCode::CREATED);
            assert_eq!(body.next().await.unwrap().unwrap(), Bytes::from_static(b"abc"));
            assert!(body.next().await.is_none());
        });
    }

    /// Aggregation enforces the body and request-line limits.
    #[test]
    fn test_aggregate_limits() {
        let limits = CodecLimits {
            max_initial_line_length: 32,
            max_header_size: 8192,
            max_chunk_size: 16,
            max_content_length: 16,
        };

        block_on(async {
            let request = hyper::Request::builder()
                .method("POST")
                .uri("/upload")
                .body(Body::from("small"))
                .unwrap();
            let decoded = aggregate(request, &limits).await.unwrap();
            assert_eq!(decoded.body(), &Bytes::from_static(b"small"));

            let request = hyper::Request::builder()
                .method("POST")
                .uri("/upload")
                .body(Body::from("x".repeat(17)))
                .unwrap();
            assert_eq!(
                aggregate(request, &limits).await.unwrap_err(),
                StatusCode::PAYLOAD_TOO_LARGE
            );

            let request = hyper::Request::builder()
                .method("POST")
                .uri("/upload")
                .header("content-length", "1000")
                .body(Body::empty())
                .unwrap();
            assert_eq!(
                aggregate(request, &limits).await.unwrap_err(),
                StatusCode::PAYLOAD_TOO_LARGE
            );

            let request = hyper::Request::builder()
                .uri(format!("/{}", "a".repeat(40)))
                .body(Body::empty())
                .unwrap();
            assert_eq!(
                aggregate(request, &limits).await.unwrap_err(),
                StatusCode::URI_TOO_LONG
            );
        });
    }

    /// The hyper service answers with the committed head and streamed body.
    #[test]
    fn test_serve_request() {
        let dispatcher = new_dispatcher(ServerContext::builder().handler(
            HandlerRegistration::new("echo", |req: &mut Request, resp: &mut Response| {
                let body = req.body().clone();
                resp.write(&body)
            })
            .with_pattern("/echo"),
        ));

        block_on(async {
            let request = hyper::Request::builder()
                .method("POST")
                .uri("/echo")
                .body(Body::from("ping"))
                .unwrap();
            let response = serve_request(
                dispatcher,
                Connection::new(None, None),
                CodecLimits::default(),
                request,
            )
            .await
            .unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
            assert_eq!(body, Bytes::from_static(b"ping"));
        });
    }
}
