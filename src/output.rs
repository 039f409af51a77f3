//! Response output: the buffered [`ResponseStream`] sink and the
//! [`OutputGate`] that controls access to it.
//!
//! A stream is shared (`Arc<Mutex<_>>`) so that a gate can be rebound to it
//! by an async response while the original gate is frozen. The stream owns
//! the response head too, which is sent exactly once, on commit.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use hyper::body::Bytes;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::StatusCode;

use crate::error::{ExchangeError, Result};
use crate::recycler::Recyclable;

/// Callback fired once, after a response stream is closed.
pub type CloseListener = Arc<dyn Fn() + Send + Sync>;

/// A response stream shared between gates.
pub type SharedStream = Arc<Mutex<ResponseStream>>;

/// Outbound effects toward the byte-stream layer.
///
/// Calls arrive in order: one `send_head`, any number of `send_data`, then
/// one `finish`.
pub trait Outbound: Send {
    fn send_head(&mut self, status: StatusCode, headers: HeaderMap) -> io::Result<()>;

    fn send_data(&mut self, chunk: Bytes) -> io::Result<()>;

    /// The body is complete.
    fn finish(&mut self) -> io::Result<()>;
}

/// Buffered writer for one response.
pub struct ResponseStream {
    status: StatusCode,
    headers: HeaderMap,
    content_type: Option<String>,
    character_encoding: Option<String>,
    keep_alive: bool,
    buffer: Vec<u8>,
    buffer_size: usize,
    committed: bool,
    closed: bool,
    bytes_written: u64,
    outbound: Box<dyn Outbound>,
    close_listener: Option<CloseListener>,
}

impl ResponseStream {
    pub fn new(outbound: Box<dyn Outbound>, buffer_size: usize, keep_alive: bool) -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            content_type: None,
            character_encoding: None,
            keep_alive,
            buffer: Vec::with_capacity(buffer_size),
            buffer_size,
            committed: false,
            closed: false,
            bytes_written: 0,
            outbound,
            close_listener: None,
        }
    }

    pub fn into_shared(self) -> SharedStream {
        Arc::new(Mutex::new(self))
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) -> Result<()> {
        self.check_committed()?;
        self.status = status;
        Ok(())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Replaces every value of `name`.
    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) -> Result<()> {
        self.check_committed()?;
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn add_header(&mut self, name: HeaderName, value: HeaderValue) -> Result<()> {
        self.check_committed()?;
        self.headers.append(name, value);
        Ok(())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Sets the media type. A `charset` parameter also sets the character
    /// encoding.
    pub fn set_content_type(&mut self, content_type: &str) -> Result<()> {
        self.check_committed()?;
        let mut parts = content_type.split(';');
        let media = parts.next().unwrap_or_default().trim();
        for param in parts {
            if let Some((key, value)) = param.split_once('=') {
                if key.trim().eq_ignore_ascii_case("charset") {
                    self.character_encoding = Some(value.trim().trim_matches('"').to_string());
                }
            }
        }
        self.content_type = Some(media.to_string());
        Ok(())
    }

    pub fn character_encoding(&self) -> Option<&str> {
        self.character_encoding.as_deref()
    }

    pub fn set_character_encoding(&mut self, encoding: &str) -> Result<()> {
        self.check_committed()?;
        self.character_encoding = Some(encoding.to_string());
        Ok(())
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bytes waiting in the buffer.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Body bytes handed to the outbound so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn set_close_listener(&mut self, listener: CloseListener) {
        self.close_listener = Some(listener);
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.closed {
            return Err(ExchangeError::StreamClosed);
        }
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() >= self.buffer_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Commits the head if needed and sends buffered bytes.
    pub fn flush(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.commit()?;
        self.drain()
    }

    /// Completes the response. A response that never flushed gets an exact
    /// `Content-Length`.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if !self.committed
            && !self.headers.contains_key(header::CONTENT_LENGTH)
            && !self.headers.contains_key(header::TRANSFER_ENCODING)
        {
            self.headers
                .insert(header::CONTENT_LENGTH, HeaderValue::from(self.buffer.len()));
        }
        self.commit()?;
        self.drain()?;
        self.closed = true;
        self.outbound.finish()?;

        if let Some(listener) = self.close_listener.take() {
            listener();
        }
        Ok(())
    }

    /// Discards buffered body bytes.
    pub fn reset_buffer(&mut self) -> Result<()> {
        self.check_committed()?;
        self.buffer.clear();
        Ok(())
    }

    /// Discards buffered bytes, status and headers.
    pub fn reset(&mut self) -> Result<()> {
        self.check_committed()?;
        self.buffer.clear();
        self.status = StatusCode::OK;
        self.headers.clear();
        self.content_type = None;
        self.character_encoding = None;
        Ok(())
    }

    fn check_committed(&self) -> Result<()> {
        if self.committed {
            return Err(ExchangeError::Committed);
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.committed {
            return Ok(());
        }
        if let Some(value) = self.content_type_value() {
            match HeaderValue::from_str(&value) {
                Ok(value) => {
                    self.headers.insert(header::CONTENT_TYPE, value);
                }
                Err(_) => log::warn!("dropping invalid content type {:?}", value),
            }
        }
        if !self.keep_alive {
            self.headers
                .insert(header::CONNECTION, HeaderValue::from_static("close"));
        }

        self.committed = true;
        self.outbound.send_head(self.status, self.headers.clone())?;
        Ok(())
    }

    fn content_type_value(&self) -> Option<String> {
        let media = self.content_type.as_deref()?;
        Some(match self.character_encoding.as_deref() {
            Some(encoding) => format!("{}; charset={}", media, encoding),
            None => media.to_string(),
        })
    }

    fn drain(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let chunk = Bytes::copy_from_slice(&self.buffer);
        self.buffer.clear();
        self.bytes_written += chunk.len() as u64;
        self.outbound.send_data(chunk)?;
        Ok(())
    }
}

impl fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStream")
            .field("status", &self.status)
            .field("committed", &self.committed)
            .field("closed", &self.closed)
            .field("buffered", &self.buffer.len())
            .finish()
    }
}

/// Controls access to a [`ResponseStream`].
///
/// While suspended, `write`, `flush`, `close` and `reset_buffer` are silent
/// no-ops. Once transferred, every output or head mutation fails with
/// [`ExchangeError::OwnershipTransferred`]. `wrap` rebinds the gate to another
/// stream without changing the gate itself.
#[derive(Default)]
pub struct OutputGate {
    sink: Option<SharedStream>,
    suspended: bool,
    transferred: bool,
    close_listener: Option<CloseListener>,
}

impl OutputGate {
    pub fn new(close_listener: Option<CloseListener>) -> Self {
        Self {
            close_listener,
            ..Self::default()
        }
    }

    pub fn set_suspended(&mut self, suspended: bool) {
        self.suspended = suspended;
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Freezes this gate for good: its stream now belongs to another gate.
    pub(crate) fn transfer(&mut self) {
        self.transferred = true;
    }

    pub fn is_transferred(&self) -> bool {
        self.transferred
    }

    /// Binds the gate to `stream`, re-attaching the close listener, and
    /// returns the previous stream.
    pub fn wrap(&mut self, stream: SharedStream) -> Option<SharedStream> {
        if let Some(listener) = &self.close_listener {
            match stream.lock() {
                Ok(mut inner) => inner.set_close_listener(listener.clone()),
                Err(_) => log::error!("response stream lock poisoned while wrapping"),
            }
        }
        self.sink.replace(stream)
    }

    pub fn unwrap(&self) -> Option<&SharedStream> {
        self.sink.as_ref()
    }

    /// Sets the close listener and attaches it to the current stream.
    pub fn set_close_listener(&mut self, listener: CloseListener) -> Result<()> {
        if let Some(stream) = &self.sink {
            stream
                .lock()
                .map_err(|_| ExchangeError::LockPoisoned)?
                .set_close_listener(listener.clone());
        }
        self.close_listener = Some(listener);
        Ok(())
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.suspended {
            return Ok(());
        }
        self.stream()?.write(bytes)
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.suspended {
            return Ok(());
        }
        self.stream()?.flush()
    }

    pub fn close(&mut self) -> Result<()> {
        if self.suspended {
            return Ok(());
        }
        self.stream()?.close()
    }

    pub fn reset_buffer(&mut self) -> Result<()> {
        if self.suspended {
            return Ok(());
        }
        self.stream()?.reset_buffer()
    }

    /// Whether the stream behind the gate has sent its head. An unbound gate
    /// reports `false`.
    pub fn is_committed(&self) -> bool {
        self.inspect(|stream| stream.is_committed()).unwrap_or(false)
    }

    /// Runs `f` against the bound stream for reading, regardless of transfer.
    pub fn inspect<R>(&self, f: impl FnOnce(&ResponseStream) -> R) -> Option<R> {
        let sink = self.sink.as_ref()?;
        match sink.lock() {
            Ok(stream) => Some(f(&stream)),
            Err(poisoned) => Some(f(&poisoned.into_inner())),
        }
    }

    /// Locks the bound stream for mutation.
    pub(crate) fn stream(&self) -> Result<MutexGuard<'_, ResponseStream>> {
        if self.transferred {
            return Err(ExchangeError::OwnershipTransferred);
        }
        let sink = self
            .sink
            .as_ref()
            .ok_or(ExchangeError::Recycled("output gate"))?;
        sink.lock().map_err(|_| ExchangeError::LockPoisoned)
    }
}

impl Recyclable for OutputGate {
    /// Drops the stream reference without closing it.
    fn recycle(&mut self) {
        self.sink = None;
        self.suspended = false;
        self.transferred = false;
        self.close_listener = None;
    }
}

impl io::Write for OutputGate {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        OutputGate::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        OutputGate::flush(self)?;
        Ok(())
    }
}

impl fmt::Debug for OutputGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputGate")
            .field("bound", &self.sink.is_some())
            .field("suspended", &self.suspended)
            .field("transferred", &self.transferred)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// What a [`RecordingOutbound`] has seen.
    #[derive(Debug, Default)]
    pub struct Recorded {
        pub head: Option<(StatusCode, HeaderMap)>,
        pub heads_sent: usize,
        pub body: Vec<u8>,
        pub chunks: usize,
        pub finished: bool,
    }

    impl Recorded {
        pub fn body_str(&self) -> &str {
            std::str::from_utf8(&self.body).unwrap()
        }

        pub fn status(&self) -> Option<StatusCode> {
            self.head.as_ref().map(|(status, _)| *status)
        }

        pub fn header(&self, name: &str) -> Option<String> {
            let (_, headers) = self.head.as_ref()?;
            headers.get(name).map(|v| v.to_str().unwrap().to_string())
        }
    }

    /// Outbound that records everything into shared state.
    #[derive(Clone, Default)]
    pub struct RecordingOutbound {
        pub recorded: Arc<Mutex<Recorded>>,
    }

    impl Outbound for RecordingOutbound {
        fn send_head(&mut self, status: StatusCode, headers: HeaderMap) -> io::Result<()> {
            let mut recorded = self.recorded.lock().unwrap();
            recorded.heads_sent += 1;
            recorded.head = Some((status, headers));
            Ok(())
        }

        fn send_data(&mut self, chunk: Bytes) -> io::Result<()> {
            let mut recorded = self.recorded.lock().unwrap();
            recorded.chunks += 1;
            recorded.body.extend_from_slice(&chunk);
            Ok(())
        }

        fn finish(&mut self) -> io::Result<()> {
            self.recorded.lock().unwrap().finished = true;
            Ok(())
        }
    }

    pub fn recording_stream(buffer_size: usize) -> (SharedStream, Arc<Mutex<Recorded>>) {
        let outbound = RecordingOutbound::default();
        let recorded = outbound.recorded.clone();
        let stream = ResponseStream::new(Box::new(outbound), buffer_size, true).into_shared();
        (stream, recorded)
    }
}
