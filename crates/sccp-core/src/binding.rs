use std::sync::Arc;

use sccp_collab::{DeviceHandle, RegistrationState, SessionHandle};
use tracing::debug;

use crate::session::Session;

/// Outcome of [`attach`], mirroring the source's `+1`/`0`/`-1` return
/// convention (§4.5).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AttachOutcome {
    NewReference,
    Unchanged,
}

/// Associates `device` with `session`, detaching any previously-bound
/// device first. Runs entirely under the session's structural lock so the
/// cross-link is never observed half-set.
pub fn attach(session: &Arc<Session>, device: Arc<dyn DeviceHandle>) -> AttachOutcome {
    session.with_structural(|s| {
        if let Some(old) = s.device() {
            if Arc::ptr_eq(&old, &device) {
                return AttachOutcome::Unchanged;
            }
            old.set_registration_state(RegistrationState::None);
            old.set_session(None);
        }
        let designator = format!("{}:{}", device.device_id(), session.fd());
        let handle: Arc<dyn SessionHandle> = session.clone();
        device.set_session(Some(Arc::downgrade(&handle)));
        s.set_device(Some(device));
        s.set_designator(designator);
        debug!(fd = session.fd(), designator = %session.designator(), "device attached");
        AttachOutcome::NewReference
    })
}

/// Clears the cross-link and resets the designator to the session's local
/// address. Returns the previously-bound device, if any, for the caller to
/// run cleanup against.
pub fn detach(session: &Arc<Session>) -> Option<Arc<dyn DeviceHandle>> {
    session.with_structural(|s| {
        let old = s.device();
        if let Some(device) = &old {
            device.set_registration_state(RegistrationState::None);
            device.set_session(None);
        }
        s.set_device(None);
        s.set_designator(session.local_addr().to_string());
        old
    })
}

/// Resolves a cross-device collision: `new_session` is registering a device
/// that is still bound to `previous`. Stops the previous worker and detaches
/// its device so the new session can proceed (§4.5).
pub fn resolve_cross_device_collision(previous: &Arc<Session>) -> Option<Arc<dyn DeviceHandle>> {
    previous.request_stop_internal();
    let device = detach(previous);
    if let Some(device) = &device {
        device.dev_clean(false, 0);
    }
    device
}
