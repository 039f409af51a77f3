//! Readiness reactor for accepted connections.
//!
//! One background thread runs a `mio` poll loop. Registered streams expose
//! tokio's `AsyncRead`/`AsyncWrite`, which is what the codec and encryption
//! stages drive; a waker is stored per direction and woken when `mio`
//! reports the socket ready.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{self as sys, Shutdown, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};

use mio::{Events, Token};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{ReactorError, ReactorResult};

/// Handle to the reactor thread. Cheap to clone.
#[derive(Clone)]
pub struct Reactor {
    shared: Arc<Shared>,
}

struct Shared {
    registry: mio::Registry,
    /// Next token to hand out
    token: AtomicUsize,
    /// Registered sources by token
    sources: Mutex<HashMap<Token, Arc<Source>>>,
}

impl Reactor {
    /// Starts the poll loop on a thread named `muxlet-reactor`.
    pub fn new() -> ReactorResult<Self> {
        let poll = mio::Poll::new().map_err(ReactorError::Init)?;
        let shared = Arc::new(Shared {
            token: AtomicUsize::new(0),
            registry: poll.registry().try_clone().map_err(ReactorError::Init)?,
            sources: Mutex::new(HashMap::with_capacity(64)),
        });

        std::thread::Builder::new()
            .name("muxlet-reactor".to_owned())
            .spawn({
                let shared = shared.clone();
                move || shared.run(poll)
            })
            .map_err(ReactorError::Init)?;

        Ok(Reactor { shared })
    }

    /// Switches `sys` to non-blocking mode and registers it for read and
    /// write readiness.
    pub fn register(&self, sys: sys::TcpStream) -> ReactorResult<TcpStream> {
        sys.set_nonblocking(true).map_err(ReactorError::Registration)?;
        let mut sys = mio::net::TcpStream::from_std(sys);
        let token = Token(self.shared.token.fetch_add(1, Ordering::Relaxed));

        self.shared
            .registry
            .register(
                &mut sys,
                token,
                mio::Interest::READABLE | mio::Interest::WRITABLE,
            )
            .map_err(ReactorError::Registration)?;

        let source = Arc::new(Source {
            token,
            interest: Default::default(),
            triggered: Default::default(),
        });

        self.shared
            .sources
            .lock()
            .map_err(|_| ReactorError::LockPoisoned)?
            .insert(token, source.clone());

        Ok(TcpStream {
            sys,
            source,
            reactor: self.clone(),
        })
    }

    /// Number of streams currently registered.
    pub fn registered(&self) -> usize {
        self.shared
            .sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn poll_ready(
        &self,
        source: &Source,
        direction: usize,
        cx: &Context<'_>,
    ) -> Poll<io::Result<()>> {
        if source.triggered[direction].load(Ordering::Acquire) {
            return Poll::Ready(Ok(()));
        }

        {
            let mut interest = source
                .interest
                .lock()
                .map_err(|_| io::Error::from(ReactorError::LockPoisoned))?;

            match &interest[direction] {
                Some(existing) if existing.will_wake(cx.waker()) => {}
                _ => interest[direction] = Some(cx.waker().clone()),
            }
        }

        // readiness may have arrived while the waker was being stored
        if source.triggered[direction].load(Ordering::Acquire) {
            return Poll::Ready(Ok(()));
        }

        Poll::Pending
    }

    fn clear_trigger(&self, source: &Source, direction: usize) {
        source.triggered[direction].store(false, Ordering::Release);
    }
}

impl Shared {
    fn run(&self, mut poll: mio::Poll) {
        let mut events = Events::with_capacity(64);
        let mut wakers = Vec::new();

        loop {
            if let Err(err) = self.poll(&mut poll, &mut events, &mut wakers) {
                log::warn!("reactor poll failed: {}", err);
            }
            events.clear();
        }
    }

    fn poll(
        &self,
        poll: &mut mio::Poll,
        events: &mut Events,
        wakers: &mut Vec<Waker>,
    ) -> ReactorResult<()> {
        if let Err(err) = poll.poll(events, None) {
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(ReactorError::Polling(err));
            }
            return Ok(());
        }

        for event in events.iter() {
            let source = {
                let sources = self.sources.lock().map_err(|_| ReactorError::LockPoisoned)?;
                match sources.get(&event.token()) {
                    Some(source) => source.clone(),
                    None => continue,
                }
            };

            let mut interest = source.interest.lock().map_err(|_| ReactorError::LockPoisoned)?;

            if event.is_readable() || event.is_read_closed() || event.is_error() {
                if let Some(waker) = interest[direction::READ].take() {
                    wakers.push(waker);
                }
                source.triggered[direction::READ].store(true, Ordering::Release);
            }

            if event.is_writable() || event.is_write_closed() || event.is_error() {
                if let Some(waker) = interest[direction::WRITE].take() {
                    wakers.push(waker);
                }
                source.triggered[direction::WRITE].store(true, Ordering::Release);
            }
        }

        for waker in wakers.drain(..) {
            waker.wake();
        }

        Ok(())
    }
}

mod direction {
    pub const READ: usize = 0;
    pub const WRITE: usize = 1;
}

struct Source {
    /// Wakers waiting for read/write readiness
    interest: Mutex<[Option<Waker>; 2]>,
    /// Readiness seen since the last `WouldBlock`
    triggered: [AtomicBool; 2],
    token: Token,
}

/// A connection registered with the [`Reactor`].
pub struct TcpStream {
    sys: mio::net::TcpStream,
    reactor: Reactor,
    source: Arc<Source>,
}

impl TcpStream {
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.sys.peer_addr().ok()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sys.local_addr().ok()
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        self.sys.set_nodelay(nodelay)
    }

    /// Runs `f` once the socket is ready in `direction`; a `WouldBlock`
    /// clears the readiness and parks the task again.
    fn poll_io<T>(
        &self,
        direction: usize,
        mut f: impl FnMut() -> io::Result<T>,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<T>> {
        loop {
            if self.reactor.poll_ready(&self.source, direction, cx)?.is_pending() {
                return Poll::Pending;
            }

            match f() {
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.reactor.clear_trigger(&self.source, direction);
                }
                val => return Poll::Ready(val),
            }
        }
    }
}

impl AsyncRead for TcpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let unfilled = buf.initialize_unfilled();

        match self.poll_io(direction::READ, || (&self.sys).read(unfilled), cx) {
            Poll::Ready(Ok(n)) => {
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for TcpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_io(direction::WRITE, || (&self.sys).write(buf), cx)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_io(direction::WRITE, || (&self.sys).flush(), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.sys.shutdown(Shutdown::Write) {
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Poll::Ready(Ok(())),
            result => Poll::Ready(result),
        }
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        self.reactor
            .shared
            .sources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.source.token);
        if let Err(err) = self.reactor.shared.registry.deregister(&mut self.sys) {
            log::debug!("failed to deregister connection: {}", err);
        }
    }
}
