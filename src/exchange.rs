//! The per-request aggregate: a pooled request and response bound to the
//! connection they arrived on, finished synchronously or parked until an
//! async response completes.

use std::sync::Arc;

use crate::connection::{Connection, Session};
use crate::context::ServerContext;
use crate::error::{ExchangeError, Result};
use crate::output::{CloseListener, Outbound, ResponseStream};
use crate::recycler::{Pooled, Recyclable, Recycler};
use crate::request::{self, DecodedRequest, Request};
use crate::response::Response;

static RECYCLER: Recycler<Exchange> = Recycler::new();

/// One request/response cycle on a connection.
///
/// Binds a pooled [`Request`] and [`Response`] to the connection they arrived
/// on. An exchange is completed with [`Exchange::finish`]; simply dropping it
/// recycles every part without flushing the response.
#[derive(Default)]
pub struct Exchange {
    request: Option<Pooled<Request>>,
    response: Option<Pooled<Response>>,
    connection: Option<Connection>,
    context: Option<Arc<ServerContext>>,
    keep_alive: bool,
}

impl Exchange {
    /// Builds an exchange for `decoded`, writing its response to `outbound`.
    pub fn create(
        connection: Connection,
        context: Arc<ServerContext>,
        decoded: DecodedRequest,
        outbound: Box<dyn Outbound>,
    ) -> Pooled<Exchange> {
        let keep_alive = request::is_keep_alive(decoded.version(), decoded.headers());

        let stream =
            ResponseStream::new(outbound, context.response_buffer_size(), keep_alive).into_shared();
        let close_listener: Option<CloseListener> = if keep_alive {
            None
        } else {
            let connection = connection.clone();
            Some(Arc::new(move || connection.close()))
        };

        let mut exchange = RECYCLER.acquire();
        exchange.response = Some(Response::new_instance(
            stream,
            context.response_character_encoding(),
            close_listener,
        ));
        exchange.request = Some(Request::new_instance(decoded, connection.clone()));
        exchange.connection = Some(connection);
        exchange.context = Some(context);
        exchange.keep_alive = keep_alive;
        exchange
    }

    pub fn request(&self) -> Result<&Request> {
        self.request
            .as_deref()
            .ok_or(ExchangeError::Recycled("exchange request"))
    }

    pub fn request_mut(&mut self) -> Result<&mut Request> {
        self.request
            .as_deref_mut()
            .ok_or(ExchangeError::Recycled("exchange request"))
    }

    pub fn response(&self) -> Result<&Response> {
        self.response
            .as_deref()
            .ok_or(ExchangeError::Recycled("exchange response"))
    }

    pub fn response_mut(&mut self) -> Result<&mut Response> {
        self.response
            .as_deref_mut()
            .ok_or(ExchangeError::Recycled("exchange response"))
    }

    /// Both halves at once, for driving a filter chain.
    pub fn parts_mut(&mut self) -> Result<(&mut Request, &mut Response)> {
        match (self.request.as_deref_mut(), self.response.as_deref_mut()) {
            (Some(request), Some(response)) => Ok((request, response)),
            _ => Err(ExchangeError::Recycled("exchange")),
        }
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn context(&self) -> Option<&Arc<ServerContext>> {
        self.context.as_ref()
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// The session bound to the connection, created on demand when `create`
    /// is set. Absent once the connection is inactive.
    pub fn session(&self, create: bool) -> Option<Arc<Session>> {
        self.request.as_ref()?.session(create)
    }

    /// Binds `session` to the connection. Returns `false` when the connection
    /// is gone or inactive.
    pub fn set_session(&self, session: Arc<Session>) -> bool {
        match &self.connection {
            Some(connection) => connection.bind_session(session),
            None => false,
        }
    }

    /// Completes the exchange.
    ///
    /// A synchronous exchange closes its response (commit, flush, end of
    /// body) and is recycled at once. When the response was switched to async
    /// mode the exchange is parked with its [`AsyncContext`] and recycled
    /// when the async response completes.
    ///
    /// [`AsyncContext`]: crate::async_response::AsyncContext
    pub fn finish(mut exchange: Pooled<Exchange>) -> Result<()> {
        let async_context = exchange
            .response
            .as_ref()
            .and_then(|response| response.async_context().cloned());

        match async_context {
            Some(context) => {
                log::debug!("parking exchange {} until async completion", exchange.lease());
                context.adopt(exchange);
                Ok(())
            }
            None => {
                let result = exchange.response_mut().and_then(Response::finish);
                exchange.recycle();
                result
            }
        }
    }
}

impl Recyclable for Exchange {
    /// Response first, then request, then the connection reference.
    fn recycle(&mut self) {
        if let Some(response) = self.response.take() {
            response.recycle();
        }
        if let Some(request) = self.request.take() {
            request.recycle();
        }
        self.connection = None;
        self.context = None;
        self.keep_alive = false;
    }
}
