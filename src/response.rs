//! The response handed to interceptors and handlers. Every write and head
//! change goes through the response's output gate, which freezes once the
//! output is transferred to an async response.

use std::sync::Arc;

use hyper::header::{self, HeaderName, HeaderValue};
use hyper::StatusCode;

use crate::async_response::{AsyncContext, AsyncResponse};
use crate::error::{ExchangeError, Result};
use crate::output::{CloseListener, OutputGate, SharedStream};
use crate::recycler::{Pooled, Recyclable, Recycler};
use crate::writer::{self, Charset, TextWriter};

static RECYCLER: Recycler<Response> = Recycler::new();

/// Mutable response handed to interceptors and handlers.
///
/// All output goes through the response's [`OutputGate`]. After
/// [`Response::start_async`] the gate is frozen and every mutation fails with
/// [`ExchangeError::OwnershipTransferred`]; the returned [`AsyncResponse`]
/// owns the output from then on.
#[derive(Default)]
pub struct Response {
    gate: OutputGate,
    async_context: Option<Arc<AsyncContext>>,
    default_encoding: String,
    writer_charset: Option<Charset>,
}

impl Response {
    pub(crate) fn new_instance(
        stream: SharedStream,
        default_encoding: &str,
        close_listener: Option<CloseListener>,
    ) -> Pooled<Response> {
        let mut response = RECYCLER.acquire();
        if let Some(listener) = close_listener {
            // the gate is unbound here, so attaching the listener cannot fail
            let _ = response.gate.set_close_listener(listener);
        }
        response.gate.wrap(stream);
        response.default_encoding.push_str(default_encoding);
        response
    }

    pub fn status(&self) -> StatusCode {
        self.gate.inspect(|s| s.status()).unwrap_or(StatusCode::OK)
    }

    pub fn set_status(&mut self, status: StatusCode) -> Result<()> {
        self.gate.stream()?.set_status(status)
    }

    pub fn header(&self, name: &str) -> Option<HeaderValue> {
        self.gate.inspect(|s| s.headers().get(name).cloned()).flatten()
    }

    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) -> Result<()> {
        self.gate.stream()?.set_header(name, value)
    }

    pub fn add_header(&mut self, name: HeaderName, value: HeaderValue) -> Result<()> {
        self.gate.stream()?.add_header(name, value)
    }

    pub fn content_type(&self) -> Option<String> {
        self.gate.inspect(|s| s.content_type().map(str::to_owned)).flatten()
    }

    pub fn set_content_type(&mut self, content_type: &str) -> Result<()> {
        self.gate.stream()?.set_content_type(content_type)
    }

    pub fn character_encoding(&self) -> Option<String> {
        self.gate.inspect(|s| s.character_encoding().map(str::to_owned)).flatten()
    }

    pub fn set_character_encoding(&mut self, encoding: &str) -> Result<()> {
        self.gate.stream()?.set_character_encoding(encoding)
    }

    pub fn is_committed(&self) -> bool {
        self.gate.is_committed()
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_owned()?;
        self.gate.write(bytes)
    }

    /// Commits the head and sends whatever is buffered.
    pub fn flush_buffer(&mut self) -> Result<()> {
        self.check_owned()?;
        self.gate.flush()
    }

    /// Clears buffered body bytes. A no-op while the gate is suspended,
    /// otherwise fails once committed.
    pub fn reset_buffer(&mut self) -> Result<()> {
        self.check_owned()?;
        self.gate.reset_buffer()
    }

    /// Clears status, headers and buffered bytes. Fails once committed.
    pub fn reset(&mut self) -> Result<()> {
        self.gate.stream()?.reset()?;
        self.writer_charset = None;
        Ok(())
    }

    /// Replaces the response with a plain-text error.
    pub fn send_error(&mut self, status: StatusCode, message: &str) -> Result<()> {
        self.reset()?;
        {
            let mut stream = self.gate.stream()?;
            stream.set_status(status)?;
            stream.set_content_type("text/plain; charset=utf-8")?;
            stream.set_header(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"))?;
        }
        self.gate.write(message.as_bytes())
    }

    pub fn output_stream(&mut self) -> &mut OutputGate {
        &mut self.gate
    }

    /// A text writer using the declared encoding, ISO-8859-1 for HTML, or
    /// the server's default response encoding. The choice is made on the
    /// first call and kept.
    ///
    /// Only UTF-8, ISO-8859-1 and US-ASCII are supported; any other encoding
    /// fails with [`ExchangeError::UnsupportedCharset`]. Write pre-encoded
    /// bytes with [`Response::write`] for other charsets.
    pub fn writer(&mut self) -> Result<TextWriter<'_>> {
        self.check_owned()?;
        let charset = match self.writer_charset {
            Some(charset) => charset,
            None => {
                let charset = writer::writer_charset(&mut self.gate, &self.default_encoding)?;
                self.writer_charset = Some(charset);
                charset
            }
        };
        Ok(TextWriter::new(&mut self.gate, charset))
    }

    /// Hands output ownership to an [`AsyncResponse`] that another task can
    /// complete. The exchange is recycled once that response completes.
    pub fn start_async(&mut self) -> Result<AsyncResponse> {
        AsyncResponse::begin(self)
    }

    pub fn is_async_started(&self) -> bool {
        self.async_context.is_some()
    }

    pub fn async_context(&self) -> Option<&Arc<AsyncContext>> {
        self.async_context.as_ref()
    }

    pub(crate) fn gate_mut(&mut self) -> &mut OutputGate {
        &mut self.gate
    }

    pub(crate) fn set_async_context(&mut self, context: Arc<AsyncContext>) {
        self.async_context = Some(context);
    }

    pub(crate) fn default_encoding(&self) -> &str {
        &self.default_encoding
    }

    /// Closes the stream: commit, flush and signal completion.
    pub(crate) fn finish(&mut self) -> Result<()> {
        self.check_owned()?;
        self.gate.close()
    }

    fn check_owned(&self) -> Result<()> {
        if self.gate.is_transferred() {
            return Err(ExchangeError::OwnershipTransferred);
        }
        Ok(())
    }
}

impl Recyclable for Response {
    fn recycle(&mut self) {
        self.gate.recycle();
        self.async_context = None;
        self.default_encoding.clear();
        self.writer_charset = None;
    }
}
