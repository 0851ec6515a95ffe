//! Per-connection worker (C5): poll-driven read loop, framing, dispatch,
//! keepalive watchdog, and the single teardown path for a session.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sccp_collab::{DispatchMessage, RegistrationState, ResetKind};
use sccp_wire::HeaderPeek;
use tracing::{info, warn};

use crate::module::SccpModule;
use crate::session::{Session, SessionState};

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn compute_timeout(session: &Session, module: &SccpModule) -> Duration {
    let cfg = module.config();
    let mut pct: u32 = 100 + 10;
    let mut base = cfg.keepalive_secs;
    if let Some(device) = session.device() {
        if let Some(device_keepalive) = device.keepalive_secs() {
            base = device_keepalive;
        }
        if device.keepalive_slack_percent() > 0 {
            pct += cfg.wireless_keepalive_bonus_percent;
        }
    }
    let secs = base.saturating_mul(u64::from(pct)) / 100;
    Duration::from_secs(secs.max(1))
}

/// Runs the worker loop to completion, then tears the session down exactly
/// once regardless of exit cause (§4.4).
pub fn run(module: Arc<SccpModule>, session: Arc<Session>) {
    let mut buf: Vec<u8> = Vec::with_capacity(2 * sccp_wire::MAX_PACKET as usize);
    let exit_state = loop_body(&module, &session, &mut buf);
    session.set_state(exit_state);
    module.destroy_session(&session);
}

fn loop_body(module: &Arc<SccpModule>, session: &Arc<Session>, buf: &mut Vec<u8>) -> SessionState {
    loop {
        if session.is_stopped() {
            return session.state();
        }

        if let Some(device) = session.device() {
            if device.needs_update() && !module.is_reload_in_progress() {
                device.check_update();
            }
        }

        let timeout = compute_timeout(session, module);
        match poll_read(session.fd(), timeout) {
            PollOutcome::Error(err) => {
                warn!(fd = session.fd(), error = %err, "poll error");
                mark_device_state(session, RegistrationState::Failed);
                return SessionState::Failed;
            }
            PollOutcome::Timeout => {
                info!(fd = session.fd(), "worker idle timeout");
                mark_device_state(session, RegistrationState::Timeout);
                return SessionState::Timeout;
            }
            PollOutcome::Readable => {}
        }

        if session.is_stopped() {
            return session.state();
        }

        match recv_into(session.fd(), buf, sccp_wire::MAX_PACKET as usize) {
            Ok(0) | Err(_) => {
                send_restart_reset(session);
                mark_device_state(session, RegistrationState::Failed);
                return SessionState::Failed;
            }
            Ok(_) => {}
        }

        match drain_frames(module, session, buf) {
            Ok(()) => {}
            Err(()) => {
                send_restart_reset(session);
                mark_device_state(session, RegistrationState::Failed);
                return SessionState::Failed;
            }
        }

        session.touch_keepalive(now_secs());
    }
}

enum PollOutcome {
    Readable,
    Timeout,
    Error(std::io::Error),
}

fn poll_read(fd: i32, timeout: Duration) -> PollOutcome {
    let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    loop {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN | libc::POLLPRI,
            revents: 0,
        };
        // SAFETY: `pfd` is a single well-formed pollfd on the stack.
        let rc = unsafe { libc::poll(&raw mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return PollOutcome::Error(err);
        }
        if rc == 0 {
            return PollOutcome::Timeout;
        }
        return PollOutcome::Readable;
    }
}

fn recv_into(fd: i32, buf: &mut Vec<u8>, max_packet: usize) -> std::io::Result<usize> {
    let start = buf.len();
    buf.resize(start + 2 * max_packet, 0);
    // SAFETY: the destination slice is within `buf`'s allocated, initialized
    // bounds (just extended by `resize`).
    let n = unsafe {
        libc::recv(
            fd,
            buf[start..].as_mut_ptr().cast(),
            2 * max_packet,
            0,
        )
    };
    if n < 0 {
        buf.truncate(start);
        return Err(std::io::Error::last_os_error());
    }
    buf.truncate(start + n as usize);
    Ok(n as usize)
}

/// Consumes as many complete frames from `buf` as are available, dispatching
/// each. Returns `Err(())` on a fatal dissect or dispatch failure.
fn drain_frames(module: &Arc<SccpModule>, session: &Arc<Session>, buf: &mut Vec<u8>) -> Result<(), ()> {
    loop {
        let header = match sccp_wire::peek_header(buf) {
            Ok(HeaderPeek::NeedMore) => return Ok(()),
            Ok(HeaderPeek::Frame(h)) => h,
            Err(e) => {
                warn!(fd = session.fd(), error = %e, "frame dissect failed");
                return Err(());
            }
        };
        let full_len = header.full_frame_len();
        if buf.len() < full_len {
            return Ok(());
        }

        if let Some(canonical_size) = header.canonical_size {
            let raw_payload = &buf[sccp_wire::FRAME_HEADER_LEN..full_len];
            let payload = sccp_wire::normalize_payload(raw_payload, canonical_size);
            let msg = DispatchMessage {
                message_id: header.message_id,
                protocol: header.protocol,
                payload,
            };
            let rc = module.handler_table().dispatch(&msg, session.as_ref());
            if rc != 0 {
                buf.drain(..full_len);
                return Err(());
            }
        } else {
            debug_discard(header.message_id);
        }

        buf.drain(..full_len);
    }
}

fn debug_discard(message_id: u32) {
    tracing::trace!(message_id, "discarding unknown in-range message");
}

fn mark_device_state(session: &Arc<Session>, state: RegistrationState) {
    if let Some(device) = session.device() {
        device.set_registration_state(state);
    }
}

fn send_restart_reset(session: &Arc<Session>) {
    if let Some(device) = session.device() {
        device.send_reset(ResetKind::Restart);
    }
}

/// Spawns the worker on a detached OS thread, matching the source's
/// one-thread-per-connection model (§5).
pub fn spawn(module: Arc<SccpModule>, session: Arc<Session>) {
    let fd = session.fd();
    std::thread::spawn(move || {
        run(module, session);
    });
    tracing::debug!(fd, "worker thread spawned");
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use sccp_collab::test_support::{StubDevice, StubEventBus};
    use sccp_collab::{AllowAll, DispatchMessage, MessageHandlerTable, SessionHandle};

    use super::*;
    use crate::config::SessionConfig;
    use crate::module::Collaborators;

    struct NoopHandlerTable;
    impl MessageHandlerTable for NoopHandlerTable {
        fn dispatch(&self, _msg: &DispatchMessage, _session: &dyn SessionHandle) -> i32 {
            0
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn test_module(keepalive_secs: u64) -> Arc<SccpModule> {
        SccpModule::new(
            SessionConfig { keepalive_secs, ..SessionConfig::default() },
            Collaborators {
                acl: Arc::new(AllowAll),
                handler_table: Arc::new(NoopHandlerTable),
                event_bus: Arc::new(StubEventBus::new()),
            },
        )
    }

    #[test]
    fn compute_timeout_uses_global_default_before_a_device_attaches() {
        let module = test_module(60);
        let session = Session::new(3, addr(1), addr(2), 0);
        assert_eq!(compute_timeout(&session, &module), Duration::from_secs(66));
    }

    #[test]
    fn compute_timeout_uses_the_device_keepalive_once_attached() {
        let module = test_module(60);
        let session = Session::new(4, addr(1), addr(2), 0);
        let device = Arc::new(StubDevice::new("SEP001").with_keepalive_secs(30));
        crate::binding::attach(&session, device);
        assert_eq!(compute_timeout(&session, &module), Duration::from_secs(33));
    }
}
