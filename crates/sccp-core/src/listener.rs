//! Listener loop (C4): accepts TCP connections, applies ACL and socket
//! options, de-duplicates by peer address, and spawns a worker per session.

use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::module::SccpModule;
use crate::reject;
use crate::session::Session;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Runs until `module` is signaled to stop. Blocking; intended to be the
/// body of a dedicated listener thread.
pub fn run(module: Arc<SccpModule>) -> std::io::Result<()> {
    let addr = module
        .config()
        .bind_socket_addr()
        .map_err(|e| std::io::Error::other(e.to_string()))?;
    let listener = TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    info!(%addr, "sccp listener bound");

    let sweep_interval = module.config().sweep_interval();

    while !module.is_stopping() {
        let ready = poll_readable(listener.as_raw_fd(), sweep_interval)?;
        if module.is_stopping() {
            break;
        }
        if !ready {
            if !module.is_reload_in_progress() {
                sweep_stalled_sessions(&module);
            }
            continue;
        }
        if module.is_reload_in_progress() {
            // Drop the accept event; the phone will retry.
            let _ = listener.accept();
            continue;
        }
        match listener.accept() {
            Ok((stream, peer_addr)) => handle_accept(&module, stream, peer_addr),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
    Ok(())
}

fn poll_readable(fd: i32, timeout: Duration) -> std::io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    // SAFETY: `pfd` is a single well-formed pollfd on the stack.
    let rc = unsafe { libc::poll(&raw mut pfd, 1, timeout_ms) };
    if rc < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINTR) {
            return Ok(false);
        }
        return Err(err);
    }
    Ok(rc > 0 && pfd.revents & libc::POLLIN != 0)
}

fn sweep_stalled_sessions(module: &Arc<SccpModule>) {
    let threshold = module.config().keepalive_secs * 5;
    let now = now_secs();
    for session in module.registry().snapshot() {
        if session.is_stopped() {
            continue;
        }
        let last = session.last_keepalive();
        let stalled = last == 0 || now.saturating_sub(last) > threshold;
        if stalled {
            info!(fd = session.fd(), "sweep: stopping stalled session");
            session.request_stop_internal();
            session.zero_keepalive();
        }
    }
}

fn handle_accept(module: &Arc<SccpModule>, stream: TcpStream, peer_addr: SocketAddr) {
    if wait_out_peer_collision(module, peer_addr).is_some() {
        warn!(%peer_addr, "peer collision retries exhausted");
        reject_new_connection(module, stream, peer_addr, "Cross Device Session. Come back later");
        return;
    }

    if !module.acl().permits(peer_addr.ip()) {
        warn!(%peer_addr, "peer denied by access list");
        reject_new_connection(module, stream, peer_addr, "Device ip not authorized");
        return;
    }

    if let Err(e) = apply_socket_options(&stream, module) {
        warn!(%peer_addr, error = %e, "failed to apply socket options");
    }

    let local_addr = derive_our_ip(peer_addr).unwrap_or_else(|_| stream.local_addr().unwrap_or(peer_addr));

    // SAFETY: `stream` owns a valid, connected socket fd; `into_raw_fd` hands
    // that ownership to the session, which closes it exactly once on destroy.
    let fd = std::os::unix::io::IntoRawFd::into_raw_fd(stream);
    let session = Session::with_write_backoff(
        fd,
        peer_addr,
        local_addr,
        now_secs(),
        Duration::from_micros(module.config().write_backoff_us),
    );
    session.set_module(Arc::downgrade(module));
    module.registry().insert(session.clone());
    info!(%peer_addr, %local_addr, fd, "session accepted");

    module.spawn_worker(session);
}

fn wait_out_peer_collision(module: &Arc<SccpModule>, peer_addr: SocketAddr) -> Option<Arc<Session>> {
    let retries = module.config().accept_retries;
    let wait = Duration::from_secs(module.config().accept_retry_wait_secs);
    for attempt in 0..retries {
        match module.registry().find_by_peer(peer_addr) {
            Some(existing) => {
                if attempt + 1 == retries {
                    return Some(existing);
                }
                std::thread::sleep(wait);
            }
            None => return None,
        }
    }
    None
}

fn reject_new_connection(module: &Arc<SccpModule>, stream: TcpStream, peer_addr: SocketAddr, reason: &str) {
    let local_addr = stream.local_addr().unwrap_or(peer_addr);
    let fd = std::os::unix::io::IntoRawFd::into_raw_fd(stream);
    let session = Session::with_write_backoff(
        fd,
        peer_addr,
        local_addr,
        now_secs(),
        Duration::from_micros(module.config().write_backoff_us),
    );
    // Preserve the source's "send, then free without ever starting a
    // worker" behavior for a pre-registration rejection (§9 open questions).
    if let Err(e) = reject::register_reject(&session, reason) {
        warn!(%peer_addr, error = %e, "failed to send register reject");
    }
    session.request_stop_internal();
    session.close();
}

fn apply_socket_options(stream: &TcpStream, module: &Arc<SccpModule>) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let fd = stream.as_raw_fd();
    let cfg = module.config();

    set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1);
    set_opt(fd, libc::IPPROTO_IP, libc::IP_TOS, i32::from(cfg.tos));
    set_opt(fd, libc::SOL_SOCKET, libc::SO_PRIORITY, i32::from(cfg.cos));
    set_opt(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, sccp_wire::MAX_PACKET as i32);
    set_opt(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, (sccp_wire::MAX_PACKET * 5) as i32);
    Ok(())
}

fn set_opt(fd: i32, level: i32, name: i32, value: i32) {
    // SAFETY: `value` is a plain `i32` and its address/size are passed
    // consistently to `setsockopt`.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (&raw const value).cast(),
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOTSUP) {
            warn!(fd, level, name, error = %err, "setsockopt failed");
        }
    }
}

/// Opens a transient UDP socket "connected" to `peer` purely to ask the
/// kernel which local address it would route through — the standard trick
/// for discovering the address a peer sees us as, without sending any
/// datagrams.
fn derive_our_ip(peer: SocketAddr) -> std::io::Result<SocketAddr> {
    let probe = UdpSocket::bind(("0.0.0.0", 0))?;
    probe.connect(peer)?;
    probe.local_addr()
}
