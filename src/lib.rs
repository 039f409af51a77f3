#![allow(clippy::return_self_not_must_use)]
#![doc = include_str!("../README.md")]

//! ## Architecture
//!
//! - [`Server`] accepts connections and peeks at their first bytes
//! - [`Multiplexer`] asks each [`ProtocolRegistrar`] in priority order whether
//!   it claims the connection; the winner builds a [`Pipeline`]
//! - the pipeline runs the optional TLS stage, the HTTP/1 codec, body
//!   aggregation and dispatch on the worker pool
//! - dispatch builds a pooled [`Exchange`] and drives a pooled
//!   [`FilterChain`] of interceptors into a handler
//! - a handler may call [`Response::start_async`] and finish the response
//!   later from any thread through the returned [`AsyncResponse`]
//!
//! ## Configuration
//! [`ServerConfig::new`] reads a `.env` file, an optional `config` file and
//! `MUXLET_` environment variables.

pub use crate::async_response::{AsyncContext, AsyncResponse};
pub use crate::chain::{ChainMetrics, ChainTimings, FilterChain};
pub use crate::config::{CodecLimits, ServerConfig};
pub use crate::connection::{Connection, Session};
pub use crate::context::{
    ContextListener, Handler, HandlerRegistration, InitParams, Interceptor,
    InterceptorRegistration, RequestListener, ServerContext, ServerContextBuilder,
    UrlPattern,
};
pub use crate::dispatch::Dispatcher;
pub use crate::error::{
    BoxError, ExchangeError, ExecutorError, LifecycleError, ReactorError, Result, ServerError,
};
pub use crate::exchange::Exchange;
pub use crate::executor::{Executor, Parker};
pub use crate::output::{CloseListener, Outbound, OutputGate, ResponseStream, SharedStream};
pub use crate::protocol::{
    is_tls_handshake, sniff_http, Http1Settings, HttpRegistrar, Multiplexer, Pipeline,
    ProtocolRegistrar,
};
pub use crate::recycler::{PoolStats, Pooled, Recyclable, Recycler};
pub use crate::request::{DecodedRequest, Request};
pub use crate::response::Response;
pub use crate::server::{Server, ServerHandle};
pub use crate::tls::{PemBytes, PemFiles, TlsContextBuilder};
pub use crate::writer::{Charset, TextWriter};

mod async_response;
mod chain;
mod config;
mod connection;
mod context;
mod dispatch;
mod error;
mod exchange;
mod executor;
mod net;
mod output;
mod protocol;
mod recycler;
mod request;
mod response;
mod server;
mod tls;
mod writer;

// Re-export common types
pub use hyper;
