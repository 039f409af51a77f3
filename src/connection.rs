//! Connection handles and the session bound to them.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Instant, SystemTime};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a live transport channel.
///
/// Cloning the handle is cheap and every clone observes the same state. The
/// connection owns at most one bound [`Session`]; the binding is only
/// readable or writable while the connection is active, and is dropped when
/// the connection closes.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: u64,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    secure: bool,
    active: AtomicBool,
    session: Mutex<Option<Arc<Session>>>,
}

impl Connection {
    pub fn new(local_addr: Option<SocketAddr>, remote_addr: Option<SocketAddr>) -> Self {
        Self::with_security(local_addr, remote_addr, false)
    }

    /// A connection whose bytes travel through an encryption stage.
    pub fn with_security(
        local_addr: Option<SocketAddr>,
        remote_addr: Option<SocketAddr>,
        secure: bool,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                local_addr,
                remote_addr,
                secure,
                active: AtomicBool::new(true),
                session: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    pub fn is_secure(&self) -> bool {
        self.inner.secure
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Marks the connection closed and detaches its session.
    pub fn close(&self) {
        if self.inner.active.swap(false, Ordering::AcqRel) {
            self.inner
                .session
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            log::debug!("connection {} closed", self.inner.id);
        }
    }

    /// The bound session, or `None` when nothing is bound or the connection
    /// is no longer active.
    pub fn session(&self) -> Option<Arc<Session>> {
        if !self.is_active() {
            return None;
        }
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Binds `session` to this connection. Ignored once the connection is
    /// inactive; returns whether the binding took place.
    pub fn bind_session(&self, session: Arc<Session>) -> bool {
        let mut slot = self
            .inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // checked under the lock so a concurrent close cannot leave a session behind
        if !self.is_active() {
            return false;
        }
        *slot = Some(session);
        true
    }

    /// Removes and returns the bound session.
    pub fn unbind_session(&self) -> Option<Arc<Session>> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote_addr", &self.inner.remote_addr)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Server-side state for one client, bound to a [`Connection`].
pub struct Session {
    id: String,
    created: SystemTime,
    last_accessed: Mutex<Instant>,
    attributes: Mutex<HashMap<String, String>>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created: SystemTime::now(),
            last_accessed: Mutex::new(Instant::now()),
            attributes: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created(&self) -> SystemTime {
        self.created
    }

    pub fn last_accessed(&self) -> Instant {
        *self.last_accessed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn touch(&self) {
        *self.last_accessed.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn attribute(&self, name: &str) -> Option<String> {
        self.attributes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn set_attribute(&self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.attributes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), value.into())
    }

    pub fn remove_attribute(&self, name: &str) -> Option<String> {
        self.attributes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("id", &self.id).finish()
    }
}
