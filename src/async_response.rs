//! Completing a response from another task.
//!
//! [`Response::start_async`] hands the response's output to an
//! [`AsyncResponse`]. The original response keeps its head readable but
//! rejects every further mutation with
//! [`ExchangeError::OwnershipTransferred`]. When the dispatching task
//! finishes the exchange it parks it with the shared [`AsyncContext`]; the
//! exchange is recycled once the async response completes, whichever of the
//! two happens last. An async response dropped before it committed anything
//! answers with 500.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use hyper::header::{self, HeaderName, HeaderValue};
use hyper::StatusCode;

use crate::error::{ExchangeError, Result};
use crate::exchange::Exchange;
use crate::output::OutputGate;
use crate::recycler::Pooled;
use crate::response::Response;
use crate::writer::{self, Charset, TextWriter};

/// Completion state shared by an [`AsyncResponse`] and its exchange.
#[derive(Default)]
pub struct AsyncContext {
    state: Mutex<AsyncState>,
}

#[derive(Default)]
struct AsyncState {
    completed: bool,
    parked: Option<Pooled<Exchange>>,
}

impl AsyncContext {
    pub fn is_completed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .completed
    }

    /// Takes custody of the exchange until completion. Recycles it at once
    /// when the async response already completed.
    pub(crate) fn adopt(&self, exchange: Pooled<Exchange>) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.completed {
            drop(state);
            exchange.recycle();
        } else {
            state.parked = Some(exchange);
        }
    }

    /// Marks the context completed and recycles a parked exchange. Returns
    /// `false` if it was already completed.
    pub(crate) fn complete(&self) -> bool {
        let parked = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.completed {
                return false;
            }
            state.completed = true;
            state.parked.take()
        };
        if let Some(exchange) = parked {
            log::debug!("recycling exchange {} after async completion", exchange.lease());
            exchange.recycle();
        }
        true
    }
}

impl fmt::Debug for AsyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("AsyncContext")
            .field("completed", &state.completed)
            .field("parked", &state.parked.is_some())
            .finish()
    }
}

/// A response whose output was handed off by [`Response::start_async`].
///
/// It can be moved to any thread. Call [`AsyncResponse::complete`] when done;
/// dropping it completes it too.
pub struct AsyncResponse {
    gate: OutputGate,
    context: Arc<AsyncContext>,
    default_encoding: String,
    writer_charset: Option<Charset>,
    completed: bool,
}

impl AsyncResponse {
    pub(crate) fn begin(response: &mut Response) -> Result<AsyncResponse> {
        if response.is_async_started() {
            return Err(ExchangeError::AsyncStarted);
        }
        let original = response.gate_mut();
        if original.is_transferred() {
            return Err(ExchangeError::OwnershipTransferred);
        }
        let stream = OutputGate::unwrap(original)
            .cloned()
            .ok_or(ExchangeError::Recycled("response"))?;

        // the stream keeps the close listener it was given, so the new gate needs none
        let mut gate = OutputGate::new(None);
        gate.wrap(stream);
        original.transfer();

        let context = Arc::new(AsyncContext::default());
        response.set_async_context(context.clone());
        log::debug!("response output transferred to async response");

        Ok(AsyncResponse {
            gate,
            context,
            default_encoding: response.default_encoding().to_string(),
            writer_charset: None,
            completed: false,
        })
    }

    pub fn context(&self) -> &Arc<AsyncContext> {
        &self.context
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
        self.gate.write(bytes)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.gate.flush()
    }

    /// Clears buffered body bytes. A no-op while suspended, otherwise fails
    /// once committed.
    pub fn reset_buffer(&mut self) -> Result<()> {
        self.gate.reset_buffer()
    }

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

    /// Parks output: writes, flushes and closes are dropped until resumed.
    pub fn suspend(&mut self) {
        self.gate.set_suspended(true);
    }

    pub fn resume(&mut self) {
        self.gate.set_suspended(false);
    }

    pub fn is_suspended(&self) -> bool {
        self.gate.is_suspended()
    }

    /// Text writer; the charset is chosen on the first call and kept for
    /// the life of this response. Same charset support as
    /// [`Response::writer`].
    pub fn writer(&mut self) -> Result<TextWriter<'_>> {
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

    /// Always fails: an async response stays bound to the response it was
    /// started from.
    pub fn set_response(&mut self, _response: &mut Response) -> Result<()> {
        Err(ExchangeError::Unsupported(
            "an async response cannot be re-pointed at another response",
        ))
    }

    /// Closes the stream (commit, flush, end of body) and releases the
    /// exchange. A suspended gate is resumed first.
    pub fn complete(mut self) -> Result<()> {
        self.finish()
    }

    fn finish(&mut self) -> Result<()> {
        if self.completed {
            return Ok(());
        }
        self.completed = true;
        self.gate.set_suspended(false);
        let result = self.gate.close();
        self.context.complete();
        result
    }
}

impl Drop for AsyncResponse {
    fn drop(&mut self) {
        if !self.completed && !self.is_committed() {
            log::warn!("async response dropped before completion, answering 500");
            self.gate.set_suspended(false);
            let status = StatusCode::INTERNAL_SERVER_ERROR;
            let reason = status.canonical_reason().unwrap_or("error");
            if let Err(err) = self.send_error(status, reason) {
                log::warn!("failed to send error for dropped async response: {}", err);
            }
        }
        if let Err(err) = self.finish() {
            log::warn!("failed to complete dropped async response: {}", err);
        }
    }
}

impl fmt::Debug for AsyncResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncResponse")
            .field("gate", &self.gate)
            .field("completed", &self.completed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::context::ServerContext;
    use crate::output::testing::RecordingOutbound;
    use hyper::body::Bytes;
    use std::fmt::Write as _;

    fn new_exchange() -> (Pooled<Exchange>, RecordingOutbound) {
        let outbound = RecordingOutbound::default();
        let decoded = hyper::Request::builder().uri("/slow").body(Bytes::new()).unwrap();
        let exchange = Exchange::create(
            Connection::new(None, None),
            Arc::new(ServerContext::builder().build().unwrap()),
            decoded,
            Box::new(outbound.clone()),
        );
        (exchange, outbound)
    }

    /// After the handoff the async response writes and the original fails fast.
    #[test]
    fn test_ownership_transfer() {
        let (mut exchange, outbound) = new_exchange();
        let response = exchange.response_mut().unwrap();
        response.set_status(StatusCode::ACCEPTED).unwrap();
        let mut async_response = response.start_async().unwrap();

        assert!(matches!(response.write(b"late"), Err(ExchangeError::OwnershipTransferred)));
        assert!(matches!(
            response.set_status(StatusCode::OK),
            Err(ExchangeError::OwnershipTransferred)
        ));
        assert!(matches!(response.start_async(), Err(ExchangeError::AsyncStarted)));
        // the head stays readable
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        async_response.write(b"from elsewhere").unwrap();
        async_response.complete().unwrap();

        let recorded = outbound.recorded.lock().unwrap();
        assert_eq!(recorded.status(), Some(StatusCode::ACCEPTED));
        assert_eq!(recorded.body_str(), "from elsewhere");
        assert!(recorded.finished);
    }

    /// The exchange is recycled only once both the dispatcher and the async
    /// response are done, in either order.
    #[test]
    fn test_deferred_recycle_either_order() {
        let (mut exchange, outbound) = new_exchange();
        let async_response = exchange.response_mut().unwrap().start_async().unwrap();
        let context = async_response.context().clone();

        Exchange::finish(exchange).unwrap();
        assert!(!context.is_completed());
        assert!(!outbound.recorded.lock().unwrap().finished);

        std::thread::spawn(move || async_response.complete())
            .join()
            .unwrap()
            .unwrap();
        assert!(context.is_completed());
        assert!(outbound.recorded.lock().unwrap().finished);

        let (mut exchange, outbound) = new_exchange();
        let async_response = exchange.response_mut().unwrap().start_async().unwrap();
        let context = async_response.context().clone();
        async_response.complete().unwrap();
        assert!(context.is_completed());
        Exchange::finish(exchange).unwrap();
        assert!(outbound.recorded.lock().unwrap().finished);
    }

    /// Dropping an uncommitted async response completes it with 500.
    #[test]
    fn test_drop_uncommitted_sends_error() {
        let (mut exchange, outbound) = new_exchange();
        let mut async_response = exchange.response_mut().unwrap().start_async().unwrap();
        async_response.write(b"partial").unwrap();
        async_response.suspend();
        let context = async_response.context().clone();
        drop(async_response);

        assert!(context.is_completed());
        let recorded = outbound.recorded.lock().unwrap();
        assert_eq!(recorded.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
        assert_eq!(recorded.body_str(), "Internal Server Error");
        assert!(recorded.finished);
    }

    /// Dropping a committed async response keeps what was sent and finishes it.
    #[test]
    fn test_drop_committed_completes() {
        let (mut exchange, outbound) = new_exchange();
        let mut async_response = exchange.response_mut().unwrap().start_async().unwrap();
        async_response.write(b"partial").unwrap();
        async_response.flush().unwrap();
        let context = async_response.context().clone();
        drop(async_response);

        assert!(context.is_completed());
        let recorded = outbound.recorded.lock().unwrap();
        assert_eq!(recorded.status(), Some(StatusCode::OK));
        assert_eq!(recorded.body_str(), "partial");
        assert!(recorded.finished);
    }

    /// A suspended gate ignores reset_buffer even after commit.
    #[test]
    fn test_suspended_reset_buffer_after_commit() {
        let (mut exchange, _outbound) = new_exchange();
        let mut async_response = exchange.response_mut().unwrap().start_async().unwrap();
        async_response.write(b"x").unwrap();
        async_response.flush().unwrap();
        async_response.suspend();

        assert!(async_response.reset_buffer().is_ok());
        async_response.resume();
        assert!(matches!(async_response.reset_buffer(), Err(ExchangeError::Committed)));
        async_response.complete().unwrap();
    }

    /// Suspension parks output; completion resumes and closes.
    #[test]
    fn test_suspend_then_complete() {
        let (mut exchange, outbound) = new_exchange();
        let mut async_response = exchange.response_mut().unwrap().start_async().unwrap();
        async_response.suspend();
        assert!(async_response.is_suspended());
        async_response.write(b"dropped").unwrap();
        async_response.flush().unwrap();
        assert!(outbound.recorded.lock().unwrap().head.is_none());

        async_response.resume();
        async_response.write(b"kept").unwrap();
        async_response.suspend();
        async_response.complete().unwrap();

        let recorded = outbound.recorded.lock().unwrap();
        assert_eq!(recorded.body_str(), "kept");
        assert!(recorded.finished);
    }

    /// The writer charset is resolved once and kept.
    #[test]
    fn test_writer_charset_is_cached() {
        let (mut exchange, outbound) = new_exchange();
        let mut async_response = exchange.response_mut().unwrap().start_async().unwrap();
        async_response.set_content_type("text/html").unwrap();
        {
            let mut writer = async_response.writer().unwrap();
            assert_eq!(writer.charset(), Charset::Latin1);
            write!(writer, "ü").unwrap();
        }
        async_response.set_character_encoding("utf-8").unwrap();
        assert_eq!(async_response.writer().unwrap().charset(), Charset::Latin1);

        async_response.complete().unwrap();
        assert_eq!(outbound.recorded.lock().unwrap().body, b"\xfc");
    }

    /// Reset is a state error after commit; re-pointing is never allowed.
    #[test]
    fn test_reset_and_set_response_rules() {
        let (mut exchange, _outbound) = new_exchange();
        let mut async_response = exchange.response_mut().unwrap().start_async().unwrap();
        async_response.write(b"x").unwrap();
        async_response.reset_buffer().unwrap();
        async_response.flush().unwrap();

        assert!(matches!(async_response.reset_buffer(), Err(ExchangeError::Committed)));
        assert!(matches!(async_response.reset(), Err(ExchangeError::Committed)));
        let other = exchange.response_mut().unwrap();
        assert!(matches!(
            async_response.set_response(other),
            Err(ExchangeError::Unsupported(_))
        ));
    }
}
