//! The four fixed-layout frames the session emits without involving the
//! external handler table (§4.9).

use sccp_wire::message_id;

use crate::error::SendError;
use crate::send::send;
use crate::session::Session;

const REASON_FIELD_LEN: usize = 32;

fn reason_field(text: &str) -> [u8; REASON_FIELD_LEN] {
    let mut buf = [0u8; REASON_FIELD_LEN];
    let bytes = text.as_bytes();
    let n = bytes.len().min(REASON_FIELD_LEN - 1);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

/// `RegisterReject(text)` — ACL denial and cross-device collision.
pub fn register_reject(session: &Session, text: &str) -> Result<usize, SendError> {
    let payload = reason_field(text);
    send(session, message_id::REGISTER_REJECT, &payload)
}

/// `RegisterTokenReject(backoff_ms)` — gives the phone a backoff before
/// retrying the token handshake.
pub fn register_token_reject(session: &Session, backoff_ms: u32) -> Result<usize, SendError> {
    send(session, message_id::REGISTER_TOKEN_REJECT, &backoff_ms.to_le_bytes())
}

/// `RegisterTokenAck` — token handshake success.
pub fn register_token_ack(session: &Session) -> Result<usize, SendError> {
    send(session, message_id::REGISTER_TOKEN_ACK, &[])
}

/// `SPCPRegisterTokenAck(features)` — SPCP variant of token success.
pub fn spcp_register_token_ack(session: &Session, features: u32) -> Result<usize, SendError> {
    send(
        session,
        message_id::SPCP_REGISTER_TOKEN_ACK,
        &features.to_le_bytes(),
    )
}

/// `SPCPRegisterTokenReject(features)` — SPCP variant of backoff.
pub fn spcp_register_token_reject(session: &Session, features: u32) -> Result<usize, SendError> {
    send(
        session,
        message_id::SPCP_REGISTER_TOKEN_REJECT,
        &features.to_le_bytes(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_field_truncates_and_nul_terminates() {
        let text = "a".repeat(64);
        let field = reason_field(&text);
        assert_eq!(field.len(), REASON_FIELD_LEN);
        assert_eq!(field[REASON_FIELD_LEN - 1], 0);
    }

    #[test]
    fn reason_field_zero_pads_short_text() {
        let field = reason_field("short");
        assert_eq!(&field[..5], b"short");
        assert!(field[5..].iter().all(|&b| b == 0));
    }
}
