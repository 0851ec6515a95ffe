use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use sccp_collab::{DeviceHandle, SessionHandle};

use crate::error::SendError;
use crate::module::SccpModule;

/// Why a worker stopped; recorded so sweep/teardown logging and the CLI's
/// `State` column can report something more useful than "gone".
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    Alive,
    Failed,
    Timeout,
    Closed,
}

/// Wire protocol flavor a session ends up speaking, decided by the id range
/// of the first dispatched message (it starts out as SCCP by default, §4.3).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Protocol {
    Sccp,
    Spcp,
}

struct Structural {
    device: Option<Arc<dyn DeviceHandle>>,
    designator: String,
}

/// One accepted TCP connection to a phone.
///
/// `device` and `designator` live behind the structural mutex (`inner`);
/// `last_keepalive` and `stop`/`state` are atomics so the listener sweep and
/// the owning worker can read/write them without contending on `inner`, per
/// the locking discipline in §5.
pub struct Session {
    fd: RawFd,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    last_keepalive: AtomicU64,
    stop: AtomicBool,
    closed: AtomicBool,
    state: Mutex<SessionState>,
    protocol: Mutex<Protocol>,
    inner: Mutex<Structural>,
    write_lock: Mutex<()>,
    write_backoff: Duration,
    self_weak: Weak<Session>,
    module: Mutex<Option<Weak<SccpModule>>>,
}

impl Session {
    #[must_use]
    pub fn new(fd: RawFd, peer_addr: SocketAddr, local_addr: SocketAddr, now: u64) -> Arc<Self> {
        Self::with_write_backoff(fd, peer_addr, local_addr, now, Duration::from_micros(500))
    }

    #[must_use]
    pub fn with_write_backoff(
        fd: RawFd,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        now: u64,
        write_backoff: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_weak| Self {
            fd,
            peer_addr,
            local_addr,
            last_keepalive: AtomicU64::new(now),
            stop: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            state: Mutex::new(SessionState::Alive),
            protocol: Mutex::new(Protocol::Sccp),
            inner: Mutex::new(Structural {
                device: None,
                designator: local_addr.to_string(),
            }),
            write_lock: Mutex::new(()),
            write_backoff,
            self_weak: self_weak.clone(),
            module: Mutex::new(None),
        })
    }

    /// Records the owning module so [`SessionHandle::bind_device`] can reach
    /// the registry (for cross-device collision resolution) and the devstate
    /// core (for subscription bookkeeping). Set once by the listener right
    /// after construction, before the session is inserted into the registry.
    pub fn set_module(&self, module: Weak<SccpModule>) {
        *self.module.lock().unwrap() = Some(module);
    }

    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
    }

    #[must_use]
    pub fn protocol(&self) -> Protocol {
        *self.protocol.lock().unwrap()
    }

    pub fn set_protocol(&self, protocol: Protocol) {
        *self.protocol.lock().unwrap() = protocol;
    }

    #[must_use]
    pub fn last_keepalive(&self) -> u64 {
        self.last_keepalive.load(Ordering::Acquire)
    }

    /// Written only by the owning worker, per the invariant in §3.
    pub fn touch_keepalive(&self, now: u64) {
        self.last_keepalive.store(now, Ordering::Release);
    }

    /// Zeroing marks the session dead to the listener sweep without
    /// requiring the worker to have observed `stop` yet.
    pub fn zero_keepalive(&self) {
        self.last_keepalive.store(0, Ordering::Release);
    }

    /// Sets the stop flag and shuts down the read half of the socket, which
    /// wakes a blocked `poll()` with `POLLHUP` (§5 Cancellation). Idempotent.
    pub fn request_stop_internal(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        // SAFETY: `fd` is an open socket for the session's lifetime; shutting
        // down the read half is always valid on a connected TCP socket.
        unsafe {
            libc::shutdown(self.fd, libc::SHUT_RD);
        }
    }

    /// Closes the socket. Idempotent (§4.6 step 5).
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // SAFETY: `fd` is owned by this session and not closed anywhere else.
        unsafe {
            libc::close(self.fd);
        }
    }

    #[must_use]
    pub fn device(&self) -> Option<Arc<dyn DeviceHandle>> {
        self.inner.lock().unwrap().device.clone()
    }

    #[must_use]
    pub fn designator(&self) -> String {
        self.inner.lock().unwrap().designator.clone()
    }

    /// Acquires the structural lock for the duration of `f`; used by the
    /// binding manager (C6) to keep the device/designator update
    /// transactional.
    pub(crate) fn with_structural<R>(&self, f: impl FnOnce(&mut StructuralGuard<'_>) -> R) -> R {
        let mut locked = self.inner.lock().unwrap();
        let mut guard = StructuralGuard { inner: &mut locked };
        f(&mut guard)
    }

    pub(crate) fn write_lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap()
    }

    #[must_use]
    pub(crate) fn write_backoff(&self) -> Duration {
        self.write_backoff
    }

    /// Writes `buf` fully to the socket, retrying on `EINTR` with doubling
    /// backoff (§4.7). Must be called with `write_lock` held by the caller.
    pub(crate) fn write_all_locked(&self, buf: &[u8]) -> Result<usize, SendError> {
        let mut sent = 0usize;
        let mut backoff = self.write_backoff;
        while sent < buf.len() {
            // SAFETY: `fd` is a valid open socket; the slice bounds are checked by Rust.
            let n = unsafe {
                libc::send(
                    self.fd,
                    buf[sent..].as_ptr().cast(),
                    buf.len() - sent,
                    0,
                )
            };
            if n >= 0 {
                sent += n as usize;
                continue;
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                std::thread::sleep(backoff);
                backoff *= 2;
                continue;
            }
            self.set_state(SessionState::Failed);
            return Err(SendError::Io(err));
        }
        if sent < buf.len() {
            self.set_state(SessionState::Failed);
            return Err(SendError::ShortWrite { sent, total: buf.len() });
        }
        Ok(sent)
    }
}

/// A mutable view onto the session's structural fields, handed to the
/// binding manager so it can update both halves of the cross-link in one
/// critical section.
pub struct StructuralGuard<'a> {
    inner: &'a mut Structural,
}

impl StructuralGuard<'_> {
    #[must_use]
    pub fn device(&self) -> Option<Arc<dyn DeviceHandle>> {
        self.inner.device.clone()
    }

    pub fn set_device(&mut self, device: Option<Arc<dyn DeviceHandle>>) {
        self.inner.device = device;
    }

    pub fn set_designator(&mut self, designator: String) {
        self.inner.designator = designator;
    }
}

impl SessionHandle for Session {
    fn session_id(&self) -> u64 {
        self.fd as u64
    }

    fn designator(&self) -> String {
        Session::designator(self)
    }

    fn request_stop(&self) {
        self.request_stop_internal();
    }

    fn send_frame(&self, message_id: u32, payload: &[u8]) -> bool {
        crate::send::send(self, message_id, payload).is_ok()
    }

    fn bind_device(&self, device: Arc<dyn DeviceHandle>) -> bool {
        let Some(this) = self.self_weak.upgrade() else {
            return false;
        };
        let module = self.module.lock().unwrap().clone().and_then(|m| m.upgrade());

        if let Some(module) = &module {
            let others = module.registry().find_all_by_device_id(device.device_id(), Some(&this));
            if !others.is_empty() {
                for other in others {
                    crate::binding::resolve_cross_device_collision(&other);
                    module.registry().remove(&other);
                    other.close();
                }
                // The previous session is gone, but this connection is also
                // told to come back later rather than attach straight away,
                // matching the original's crossdevice cleanup.
                let _ = crate::reject::register_reject(self, "Crossover session not allowed, come back later");
                self.request_stop_internal();
                return false;
            }
        }

        let outcome = crate::binding::attach(&this, device.clone());
        if let Some(module) = &module {
            module.devstate().on_device_registered(&device);
        }
        matches!(outcome, crate::binding::AttachOutcome::NewReference)
    }

    fn unbind_device(&self) {
        let Some(this) = self.self_weak.upgrade() else {
            return;
        };
        let Some(device) = crate::binding::detach(&this) else {
            return;
        };
        if let Some(module) = self.module.lock().unwrap().clone().and_then(|m| m.upgrade()) {
            module.devstate().on_device_unregistered(&device);
        }
    }
}
