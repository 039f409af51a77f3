//! Read-only view of an aggregated request.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Bytes;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::http::Extensions;
use hyper::{Method, Uri, Version};

use crate::connection::{Connection, Session};
use crate::recycler::{Pooled, Recyclable, Recycler};

static RECYCLER: Recycler<Request> = Recycler::new();

/// A fully decoded HTTP request as delivered by the aggregation stage.
pub type DecodedRequest = hyper::Request<Bytes>;

/// Request view handed to interceptors and handlers.
///
/// Instances are pooled; they are filled from a [`DecodedRequest`] when an
/// exchange is created and reset when it is recycled.
#[derive(Debug)]
pub struct Request {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: Bytes,
    extensions: Extensions,
    connection: Option<Connection>,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: Method::GET,
            uri: Uri::default(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            extensions: Extensions::new(),
            connection: None,
        }
    }
}

impl Request {
    /// Takes a pooled request and fills it from `decoded`.
    pub(crate) fn new_instance(decoded: DecodedRequest, connection: Connection) -> Pooled<Request> {
        let (parts, body) = decoded.into_parts();
        let mut request = RECYCLER.acquire();
        request.method = parts.method;
        request.uri = parts.uri;
        request.version = parts.version;
        request.headers = parts.headers;
        request.extensions = parts.extensions;
        request.body = body;
        request.connection = Some(connection);
        request
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of `name`, if it is valid text.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Declared content length, or the aggregated body length.
    pub fn content_length(&self) -> usize {
        self.headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.body.len())
    }

    /// The `charset` parameter of the request's content type.
    pub fn character_encoding(&self) -> Option<&str> {
        self.header(header::CONTENT_TYPE.as_str())?
            .split(';')
            .skip(1)
            .filter_map(|param| param.split_once('='))
            .find(|(key, _)| key.trim().eq_ignore_ascii_case("charset"))
            .map(|(_, value)| value.trim().trim_matches('"'))
    }

    /// Typed values attached by interceptors for later stages.
    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.connection.as_ref()?.remote_addr()
    }

    pub fn is_secure(&self) -> bool {
        self.connection.as_ref().map(Connection::is_secure).unwrap_or(false)
    }

    /// The session bound to this request's connection. With `create`, a new
    /// session is bound when none exists. Always `None` once the connection
    /// is inactive.
    pub fn session(&self, create: bool) -> Option<Arc<Session>> {
        let connection = self.connection.as_ref()?;
        if let Some(session) = connection.session() {
            session.touch();
            return Some(session);
        }
        if !create {
            return None;
        }
        let session = Arc::new(Session::new());
        if connection.bind_session(session.clone()) {
            log::debug!("bound session {} to connection {}", session.id(), connection.id());
            Some(session)
        } else {
            None
        }
    }

    /// Keep-alive as requested by the client: on by default for HTTP/1.1
    /// unless `Connection: close`, off for HTTP/1.0 unless
    /// `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        is_keep_alive(self.version, &self.headers)
    }
}

pub(crate) fn is_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    let has_token = |token: &str| {
        headers
            .get_all(header::CONNECTION)
            .iter()
            .filter_map(|v: &HeaderValue| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|v| v.trim().eq_ignore_ascii_case(token))
    };

    match version {
        Version::HTTP_10 | Version::HTTP_09 => has_token("keep-alive"),
        _ => !has_token("close"),
    }
}

impl Recyclable for Request {
    fn recycle(&mut self) {
        self.method = Method::GET;
        self.uri = Uri::default();
        self.version = Version::HTTP_11;
        self.headers.clear();
        self.body = Bytes::new();
        self.extensions.clear();
        self.connection = None;
    }
}
