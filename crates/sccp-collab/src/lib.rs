//! Narrow traits describing everything outside the session and devstate
//! cores: the device object's business logic, the message dispatch table,
//! the PBX event bus, and IP access control. None of those are implemented
//! here — this crate only fixes the shape of the boundary so the session
//! core (`sccp-core`) can be built and tested without them.

use std::net::IpAddr;
use std::sync::{Arc, Weak};

#[cfg(feature = "test-support")]
pub mod test_support;

/// Registration lifecycle of a device as seen by the session that owns it.
///
/// Named and ordered to match the handful of states the session core
/// actually drives through; a richer state machine belongs to the device
/// module itself.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegistrationState {
    None,
    TokenSent,
    Registered,
    Failed,
    Timeout,
    Cleaning,
}

/// Kind of reset frame the session can ask a device to send itself.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResetKind {
    Restart,
    Reset,
}

/// A button's declared purpose; only `Feature` buttons participate in
/// devstate subscription.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ButtonType {
    Line,
    Speeddial,
    Feature,
    Empty,
}

/// Feature identifiers carried on a `Feature` button; only `Devstate`
/// matters to this repository.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FeatureId {
    Devstate,
    Other(u16),
}

/// One configured button slot on a device, as traversed during
/// registration/unregistration.
#[derive(Debug, Clone)]
pub struct ButtonConfig {
    pub instance: u16,
    pub button_type: ButtonType,
    pub feature_id: FeatureId,
    /// For a devstate feature button, the subscribed state name.
    pub option: String,
    pub label: String,
}

/// Handle to a session, as seen from the device side of the cross-link.
///
/// Implemented by `sccp_core::session::Session`; kept here as a trait so
/// `DeviceHandle` implementations can hold a `Weak<dyn SessionHandle>`
/// without `sccp-collab` depending on `sccp-core` (which would make the
/// dependency a cycle, since `sccp-core` depends on `sccp-collab` for this
/// very trait).
pub trait SessionHandle: Send + Sync {
    /// Stable identity for logging and equality checks; typically the fd.
    fn session_id(&self) -> u64;

    /// Human-readable designator, e.g. `"SEP001122334455:14"` or an IP.
    fn designator(&self) -> String;

    /// Request that this session's worker stop and the session be torn
    /// down. Used by cross-device collision resolution.
    fn request_stop(&self);

    /// Frames and writes `payload` under `message_id` to this session's
    /// socket. Returns `false` on any failure (the session is responsible
    /// for marking itself failed internally). Used by the devstate core to
    /// push feature-status frames without depending on the concrete
    /// session type.
    fn send_frame(&self, message_id: u32, payload: &[u8]) -> bool;

    /// Binds `device` to this session, resolving any cross-device collision
    /// (another live session already bound to the same device id) first and
    /// registering the device's devstate subscriptions. Returns `true` if
    /// this replaced a different device or established the first binding,
    /// `false` if `device` was already bound here. Called by the message
    /// handler table on successful registration.
    fn bind_device(&self, device: Arc<dyn DeviceHandle>) -> bool;

    /// Clears this session's device binding, if any, and unregisters its
    /// devstate subscriptions. Called by the message handler table on
    /// unregistration.
    fn unbind_device(&self);
}

/// Device business logic, referenced only through this trait.
///
/// A concrete implementation owns channels, lines, and timers; none of that
/// is this repository's concern. `retain`/`release` in the source become
/// ordinary `Clone`/`Drop` here, so the trait itself carries no lifecycle
/// methods for them.
pub trait DeviceHandle: Send + Sync {
    /// Stable device identifier, e.g. the phone's configured name.
    fn device_id(&self) -> &str;

    fn registration_state(&self) -> RegistrationState;
    fn set_registration_state(&self, state: RegistrationState);

    /// The session currently bound to this device, if any.
    fn session(&self) -> Option<Weak<dyn SessionHandle>>;
    fn set_session(&self, session: Option<Weak<dyn SessionHandle>>);

    /// Protocol version the device last reported it is speaking in-use.
    fn inuse_protocol_version(&self) -> u32;

    /// True if `update` or `delete` is pending; drives the worker's
    /// per-iteration `check_update` call.
    fn needs_update(&self) -> bool;
    fn check_update(&self);

    /// Release channels, lines, and timers. `realtime` mirrors the source's
    /// realtime-vs-static device distinction; `cleanup_time` is the grace
    /// period in seconds before hard resources are reclaimed.
    fn dev_clean(&self, realtime: bool, cleanup_time: u64);

    fn send_reset(&self, kind: ResetKind);

    /// Iterate this device's configured buttons.
    fn button_configs(&self) -> Vec<ButtonConfig>;

    /// Per-device-type keepalive slack, expressed as whole percentage
    /// points on top of the base `+10%`. Most device types report 0.
    fn keepalive_slack_percent(&self) -> u32 {
        0
    }

    /// This device's own keepalive interval, if it negotiated one
    /// different from the session core's global default. `None` means
    /// "use the global default" — the common case, and the only option
    /// before a device has attached.
    fn keepalive_secs(&self) -> Option<u64> {
        None
    }
}

/// External PBX/Asterisk device-state values a devstate handler subscribes
/// to. Only the not-in-use/other distinction matters to feature lamps.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceState {
    NotInUse,
    InUse,
    Busy,
    Unavailable,
    Ringing,
    OnHold,
    Other(u32),
}

impl DeviceState {
    /// `NOT_INUSE -> 0`, else `1`, per the fan-out rule.
    #[must_use]
    pub fn feature_status(self) -> u8 {
        u8::from(self != DeviceState::NotInUse)
    }
}

/// Subscription handle returned by [`EventBus::subscribe`]; dropping or
/// passing it to [`EventBus::unsubscribe`] ends the subscription.
pub trait EventSubscription: Send + Sync {}

/// The external event bus devstate handlers subscribe to by state name.
pub trait EventBus: Send + Sync {
    /// Subscribe to a fully-qualified state name (already prefixed, e.g.
    /// `"Custom:alarm"`). `on_event` is invoked from the bus's own callback
    /// thread with the new state.
    fn subscribe(
        &self,
        state_name: &str,
        on_event: Box<dyn Fn(DeviceState) + Send + Sync>,
    ) -> Box<dyn EventSubscription>;

    fn unsubscribe(&self, subscription: Box<dyn EventSubscription>);
}

/// A fully framed, size-normalized inbound message handed to the dispatch
/// table.
#[derive(Debug, Clone)]
pub struct DispatchMessage {
    pub message_id: u32,
    pub protocol: sccp_wire::Protocol,
    pub payload: Vec<u8>,
}

/// The dense message-id-to-handler dispatch table.
///
/// Returning non-zero means "fatal, close the session" (§4.4 step 5).
pub trait MessageHandlerTable: Send + Sync {
    fn dispatch(&self, msg: &DispatchMessage, session: &dyn SessionHandle) -> i32;
}

/// Access-control check applied to newly accepted peers.
pub trait AccessList: Send + Sync {
    /// Returns `true` if `addr` is permitted to register.
    fn permits(&self, addr: IpAddr) -> bool;
}

/// An `AccessList` that permits everyone; the default when no ACL is
/// configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessList for AllowAll {
    fn permits(&self, _addr: IpAddr) -> bool {
        true
    }
}
