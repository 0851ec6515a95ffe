//! Device-state subscription core (C8): maps abstract devstate names to
//! external PBX events and fans out feature-status frames to subscribing
//! phones.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use sccp_collab::{
    ButtonConfig, ButtonType, DeviceHandle, DeviceState, EventBus, EventSubscription, FeatureId,
    SessionHandle,
};
use tracing::{debug, info};

const SKINNY_BUTTONTYPE_FEATURE: u8 = 0x11;
const EXTERNAL_PREFIX: &str = "Custom:";

struct Subscriber {
    device: Arc<dyn DeviceHandle>,
    instance: u16,
    label: String,
}

struct Handler {
    feature_state: Mutex<u8>,
    subscribers: Mutex<Vec<Subscriber>>,
    subscription: Mutex<Option<Box<dyn EventSubscription>>>,
}

/// Process-wide, lazily-populated set of devstate handlers keyed by
/// case-folded state name.
pub struct DevstateCore {
    event_bus: Arc<dyn EventBus>,
    handlers: Mutex<HashMap<String, Arc<Handler>>>,
}

impl DevstateCore {
    #[must_use]
    pub fn new(event_bus: Arc<dyn EventBus>) -> Arc<Self> {
        Arc::new(Self {
            event_bus,
            handlers: Mutex::new(HashMap::new()),
        })
    }

    fn handler_for(self: &Arc<Self>, state_name: &str) -> Arc<Handler> {
        let key = state_name.to_ascii_lowercase();
        let mut handlers = self.handlers.lock().unwrap();
        if let Some(h) = handlers.get(&key) {
            return h.clone();
        }

        let initial_state = 0u8;
        let handler = Arc::new(Handler {
            feature_state: Mutex::new(initial_state),
            subscribers: Mutex::new(Vec::new()),
            subscription: Mutex::new(None),
        });

        let core = Arc::clone(self);
        let key_for_cb = key.clone();
        let subscription = self.event_bus.subscribe(
            &format!("{EXTERNAL_PREFIX}{state_name}"),
            Box::new(move |state| core.on_external_event(&key_for_cb, state)),
        );
        *handler.subscription.lock().unwrap() = Some(subscription);

        handlers.insert(key, handler.clone());
        handler
    }

    /// On device registered (§4.8): subscribe every `FEATURE`/`DEVSTATE`
    /// button and push an initial feature-status frame so the phone's lamp
    /// starts correct.
    pub fn on_device_registered(self: &Arc<Self>, device: &Arc<dyn DeviceHandle>) {
        for button in device.button_configs() {
            if !is_devstate_button(&button) {
                continue;
            }
            let handler = self.handler_for(&button.option);
            let feature_state = *handler.feature_state.lock().unwrap();

            let mut subscribers = handler.subscribers.lock().unwrap();
            subscribers.retain(|s| !Arc::ptr_eq(&s.device, device) || s.instance != button.instance);
            subscribers.insert(
                0,
                Subscriber {
                    device: device.clone(),
                    instance: button.instance,
                    label: button.label.clone(),
                },
            );
            drop(subscribers);

            debug!(device = device.device_id(), state = %button.option, "devstate subscriber added");
            notify_one(device, button.instance, feature_state, &button.label);
        }
    }

    /// On device unregistered (§4.8): drop every subscriber belonging to
    /// `device`.
    pub fn on_device_unregistered(&self, device: &Arc<dyn DeviceHandle>) {
        for handler in self.handlers.lock().unwrap().values() {
            handler
                .subscribers
                .lock()
                .unwrap()
                .retain(|s| !Arc::ptr_eq(&s.device, device));
        }
    }

    fn on_external_event(&self, handler_key: &str, state: DeviceState) {
        let handler = {
            let handlers = self.handlers.lock().unwrap();
            match handlers.get(handler_key) {
                Some(h) => h.clone(),
                None => return,
            }
        };
        let feature_state = state.feature_status();
        *handler.feature_state.lock().unwrap() = feature_state;

        let subscribers = handler.subscribers.lock().unwrap();
        info!(state = handler_key, feature_state, subscribers = subscribers.len(), "devstate changed");
        for sub in subscribers.iter() {
            notify_one(&sub.device, sub.instance, feature_state, &sub.label);
        }
    }

    /// Shutdown (§4.8): unsubscribe every handler's external hook and drop
    /// all subscriber references.
    pub fn shutdown(&self) {
        let mut handlers = self.handlers.lock().unwrap();
        for (_, handler) in handlers.drain() {
            if let Some(sub) = handler.subscription.lock().unwrap().take() {
                self.event_bus.unsubscribe(sub);
            }
            handler.subscribers.lock().unwrap().clear();
        }
    }
}

fn is_devstate_button(button: &ButtonConfig) -> bool {
    matches!(button.button_type, ButtonType::Feature) && matches!(button.feature_id, FeatureId::Devstate)
}

/// Builds and sends a `FeatureStatMessage` to one subscriber.
fn notify_one(device: &Arc<dyn DeviceHandle>, instance: u16, feature_state: u8, label: &str) {
    let Some(session) = device.session().as_ref().and_then(Weak::upgrade) else {
        return;
    };
    let payload = encode_feature_stat(instance, feature_state, label);
    session.send_frame(sccp_wire::message_id::FEATURE_STAT, &payload);
}

fn encode_feature_stat(instance: u16, feature_state: u8, label: &str) -> Vec<u8> {
    const LABEL_FIELD_LEN: usize = 40;
    let mut payload = Vec::with_capacity(4 + 1 + 1 + LABEL_FIELD_LEN);
    payload.extend_from_slice(&u32::from(instance).to_le_bytes());
    payload.push(SKINNY_BUTTONTYPE_FEATURE);
    payload.push(feature_state);
    let mut label_field = [0u8; LABEL_FIELD_LEN];
    let bytes = label.as_bytes();
    let n = bytes.len().min(LABEL_FIELD_LEN);
    label_field[..n].copy_from_slice(&bytes[..n]);
    payload.extend_from_slice(&label_field);
    payload
}

#[cfg(test)]
mod tests {
    use sccp_collab::test_support::{StubDevice, StubEventBus};

    use super::*;

    #[test]
    fn registering_a_devstate_button_creates_exactly_one_external_subscription() {
        let bus = Arc::new(StubEventBus::new());
        let core = DevstateCore::new(bus.clone());

        let device_a: Arc<dyn DeviceHandle> =
            Arc::new(StubDevice::new("SEP001").with_devstate_button(1, "alarm", "Alarm"));
        let device_b: Arc<dyn DeviceHandle> =
            Arc::new(StubDevice::new("SEP002").with_devstate_button(1, "alarm", "Alarm"));

        core.on_device_registered(&device_a);
        core.on_device_registered(&device_b);

        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn external_event_fans_out_to_every_subscriber() {
        let bus = Arc::new(StubEventBus::new());
        let core = DevstateCore::new(bus.clone());

        let device: Arc<dyn DeviceHandle> =
            Arc::new(StubDevice::new("SEP001").with_devstate_button(7, "alarm", "Alarm"));
        core.on_device_registered(&device);

        bus.fire("Custom:alarm", DeviceState::InUse);
        bus.fire("Custom:alarm", DeviceState::NotInUse);
        // Without a live session attached, notify_one is a no-op; this just
        // exercises the handler bookkeeping path without panicking.
        core.on_device_unregistered(&device);
    }

    #[test]
    fn not_in_use_maps_to_zero_otherwise_one() {
        assert_eq!(DeviceState::NotInUse.feature_status(), 0);
        assert_eq!(DeviceState::InUse.feature_status(), 1);
        assert_eq!(DeviceState::Busy.feature_status(), 1);
    }

    #[test]
    fn unregister_removes_only_the_matching_devices_subscriber() {
        let bus = Arc::new(StubEventBus::new());
        let core = DevstateCore::new(bus.clone());

        let device_a: Arc<dyn DeviceHandle> =
            Arc::new(StubDevice::new("SEP001").with_devstate_button(1, "alarm", "Alarm"));
        let device_b: Arc<dyn DeviceHandle> =
            Arc::new(StubDevice::new("SEP002").with_devstate_button(1, "alarm", "Alarm"));
        core.on_device_registered(&device_a);
        core.on_device_registered(&device_b);

        core.on_device_unregistered(&device_a);

        let handlers = core.handlers.lock().unwrap();
        let handler = handlers.get("alarm").unwrap();
        let subs = handler.subscribers.lock().unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].device.device_id(), "SEP002");
    }
}
