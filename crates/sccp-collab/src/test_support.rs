//! Stub collaborator implementations for exercising the session and
//! devstate cores without a real device module, event bus, or ACL.
//! Enabled only behind the `test-support` feature.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, Weak};

use crate::{
    AccessList, ButtonConfig, DeviceHandle, DeviceState, EventBus, EventSubscription,
    RegistrationState, ResetKind, SessionHandle,
};

/// A device with no real call-control state; records what was done to it so
/// tests can assert on it.
pub struct StubDevice {
    id: String,
    state: Mutex<RegistrationState>,
    session: Mutex<Option<Weak<dyn SessionHandle>>>,
    inuse_protocol_version: AtomicU32,
    buttons: Mutex<Vec<ButtonConfig>>,
    clean_calls: AtomicU64,
    reset_calls: Mutex<Vec<ResetKind>>,
    keepalive_secs: Mutex<Option<u64>>,
}

impl StubDevice {
    #[must_use]
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            state: Mutex::new(RegistrationState::None),
            session: Mutex::new(None),
            inuse_protocol_version: AtomicU32::new(0),
            buttons: Mutex::new(Vec::new()),
            clean_calls: AtomicU64::new(0),
            reset_calls: Mutex::new(Vec::new()),
            keepalive_secs: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_devstate_button(self, instance: u16, state_name: &str, label: &str) -> Self {
        self.buttons.lock().unwrap().push(ButtonConfig {
            instance,
            button_type: crate::ButtonType::Feature,
            feature_id: crate::FeatureId::Devstate,
            option: state_name.to_owned(),
            label: label.to_owned(),
        });
        self
    }

    #[must_use]
    pub fn with_keepalive_secs(self, secs: u64) -> Self {
        *self.keepalive_secs.lock().unwrap() = Some(secs);
        self
    }

    pub fn set_inuse_protocol_version(&self, v: u32) {
        self.inuse_protocol_version.store(v, Ordering::Relaxed);
    }

    #[must_use]
    pub fn clean_call_count(&self) -> u64 {
        self.clean_calls.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn reset_calls(&self) -> Vec<ResetKind> {
        self.reset_calls.lock().unwrap().clone()
    }
}

impl DeviceHandle for StubDevice {
    fn device_id(&self) -> &str {
        &self.id
    }

    fn registration_state(&self) -> RegistrationState {
        *self.state.lock().unwrap()
    }

    fn set_registration_state(&self, state: RegistrationState) {
        *self.state.lock().unwrap() = state;
    }

    fn session(&self) -> Option<Weak<dyn SessionHandle>> {
        self.session.lock().unwrap().clone()
    }

    fn set_session(&self, session: Option<Weak<dyn SessionHandle>>) {
        *self.session.lock().unwrap() = session;
    }

    fn inuse_protocol_version(&self) -> u32 {
        self.inuse_protocol_version.load(Ordering::Relaxed)
    }

    fn needs_update(&self) -> bool {
        false
    }

    fn check_update(&self) {}

    fn dev_clean(&self, _realtime: bool, _cleanup_time: u64) {
        self.clean_calls.fetch_add(1, Ordering::Relaxed);
    }

    fn send_reset(&self, kind: ResetKind) {
        self.reset_calls.lock().unwrap().push(kind);
    }

    fn button_configs(&self) -> Vec<ButtonConfig> {
        self.buttons.lock().unwrap().clone()
    }

    fn keepalive_secs(&self) -> Option<u64> {
        *self.keepalive_secs.lock().unwrap()
    }
}

struct StubSubscription;
impl EventSubscription for StubSubscription {}

/// An event bus that fires callbacks synchronously when [`StubEventBus::fire`]
/// is called, rather than from a real external thread.
#[derive(Default)]
pub struct StubEventBus {
    subscribers: Mutex<Vec<(String, Box<dyn Fn(DeviceState) + Send + Sync>)>>,
}

impl StubEventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self, state_name: &str, state: DeviceState) {
        for (name, cb) in self.subscribers.lock().unwrap().iter() {
            if name == state_name {
                cb(state);
            }
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

impl EventBus for StubEventBus {
    fn subscribe(
        &self,
        state_name: &str,
        on_event: Box<dyn Fn(DeviceState) + Send + Sync>,
    ) -> Box<dyn EventSubscription> {
        self.subscribers
            .lock()
            .unwrap()
            .push((state_name.to_owned(), on_event));
        Box::new(StubSubscription)
    }

    fn unsubscribe(&self, _subscription: Box<dyn EventSubscription>) {}
}

/// An ACL that denies everyone, for exercising the deny path.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAll;

impl AccessList for DenyAll {
    fn permits(&self, _addr: IpAddr) -> bool {
        false
    }
}
