use std::sync::Arc;

use sccp_collab::DeviceHandle;
use tracing::warn;

use crate::error::SendError;
use crate::session::Session;

fn resolve_protocol_version(message_id: u32, device: Option<&Arc<dyn DeviceHandle>>) -> u32 {
    use sccp_wire::message_id::{KEEP_ALIVE_ACK, REGISTER_ACK, UNREGISTER_ACK};
    if matches!(message_id, KEEP_ALIVE_ACK | REGISTER_ACK | UNREGISTER_ACK) {
        return 0;
    }
    match device {
        Some(d) if d.inuse_protocol_version() >= 17 => 0x11,
        _ => 0,
    }
}

/// Serializes, patches the protocol-version byte, and writes `payload` under
/// `message_id` to `session`'s socket (§4.7). Returns the number of bytes
/// written (header included).
pub fn send(session: &Session, message_id: u32, payload: &[u8]) -> Result<usize, SendError> {
    if session.is_stopped() {
        return Err(SendError::SessionStopped);
    }
    let device = session.device();
    let version = resolve_protocol_version(message_id, device.as_ref());
    let frame = sccp_wire::encode_frame(version, message_id, payload);

    let _write_guard = session.write_lock();
    let result = session.write_all_locked(&frame);
    if let Err(e) = &result {
        warn!(fd = session.fd(), error = %e, "send failed");
    }
    result
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    use sccp_collab::test_support::StubDevice;

    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn protocol_version_forced_zero_for_ack_messages() {
        let device: Arc<dyn DeviceHandle> = Arc::new(StubDevice::new("SEP001"));
        device.set_inuse_protocol_version(20);
        assert_eq!(
            resolve_protocol_version(sccp_wire::message_id::REGISTER_ACK, Some(&device)),
            0
        );
    }

    #[test]
    fn protocol_version_follows_device_when_high() {
        let device: Arc<dyn DeviceHandle> = Arc::new(StubDevice::new("SEP001"));
        device.set_inuse_protocol_version(20);
        assert_eq!(
            resolve_protocol_version(sccp_wire::message_id::FEATURE_STAT, Some(&device)),
            0x11
        );
    }

    #[test]
    fn send_on_stopped_session_fails_without_touching_socket() {
        let session = Session::new(-1, addr(1), addr(2), 0);
        session.request_stop_internal();
        let result = send(&session, sccp_wire::message_id::KEEP_ALIVE_ACK, &[]);
        assert!(matches!(result, Err(SendError::SessionStopped)));
    }
}
