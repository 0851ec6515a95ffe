//! Process-wide orchestrator: owns the registry, the devstate core, the
//! external collaborators, and the lifecycle flags §5 calls out as a global
//! configuration RW-lock's worth of state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use sccp_collab::{AccessList, EventBus, MessageHandlerTable};
use tracing::info;

use crate::config::SessionConfig;
use crate::devstate::DevstateCore;
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::{binding, listener, worker};

/// Constructor bundle for the external collaborators a module needs; kept
/// as one struct so call sites don't have to name every trait object twice.
pub struct Collaborators {
    pub acl: Arc<dyn AccessList>,
    pub handler_table: Arc<dyn MessageHandlerTable>,
    pub event_bus: Arc<dyn EventBus>,
}

/// `module_start`/`module_stop` made explicit: no part of the session or
/// devstate cores is reachable through a `static`; everything hangs off
/// this handle (§9 design notes).
pub struct SccpModule {
    config: RwLock<SessionConfig>,
    registry: Arc<SessionRegistry>,
    devstate: Arc<DevstateCore>,
    acl: Arc<dyn AccessList>,
    handler_table: Arc<dyn MessageHandlerTable>,
    stopping: AtomicBool,
    reload_in_progress: AtomicBool,
}

impl SccpModule {
    #[must_use]
    pub fn new(config: SessionConfig, collaborators: Collaborators) -> Arc<Self> {
        Arc::new(Self {
            config: RwLock::new(config),
            registry: Arc::new(SessionRegistry::new()),
            devstate: DevstateCore::new(collaborators.event_bus),
            acl: collaborators.acl,
            handler_table: collaborators.handler_table,
            stopping: AtomicBool::new(false),
            reload_in_progress: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn config(&self) -> SessionConfig {
        self.config.read().unwrap().clone()
    }

    pub fn set_config(&self, config: SessionConfig) {
        *self.config.write().unwrap() = config;
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn devstate(&self) -> &Arc<DevstateCore> {
        &self.devstate
    }

    #[must_use]
    pub fn acl(&self) -> &Arc<dyn AccessList> {
        &self.acl
    }

    #[must_use]
    pub fn handler_table(&self) -> &Arc<dyn MessageHandlerTable> {
        &self.handler_table
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_reload_in_progress(&self) -> bool {
        self.reload_in_progress.load(Ordering::Acquire)
    }

    pub fn set_reload_in_progress(&self, reloading: bool) {
        self.reload_in_progress.store(reloading, Ordering::Release);
    }

    /// Spawns the listener on a dedicated thread and returns its join
    /// handle; the caller decides whether to block on it.
    pub fn start(self: &Arc<Self>) -> std::thread::JoinHandle<std::io::Result<()>> {
        let module = Arc::clone(self);
        std::thread::spawn(move || listener::run(module))
    }

    /// `module_stop`: signals the listener and every worker to stop, then
    /// tears down the devstate core. Does not join any thread.
    pub fn stop(&self) {
        info!("module stop requested");
        self.stopping.store(true, Ordering::Release);
        self.registry.terminate_all();
        self.devstate.shutdown();
    }

    pub(crate) fn spawn_worker(self: &Arc<Self>, session: Arc<Session>) {
        worker::spawn(Arc::clone(self), session);
    }

    /// `destroy(s, cleanup_time)` (§4.6). Idempotent; safe to call more than
    /// once for the same session, and safe to call concurrently with a
    /// cross-device collision resolution that has already detached it.
    pub fn destroy_session(&self, session: &Arc<Session>) {
        let cleanup_time = self.config().session_device_cleanup_secs;
        let device = binding::detach(session);
        if let Some(device) = &device {
            self.devstate.on_device_unregistered(device);
            device.set_registration_state(sccp_collab::RegistrationState::Cleaning);
            device.dev_clean(false, cleanup_time);

            for other in self.registry.find_all_by_device_id(device.device_id(), Some(session)) {
                other.request_stop_internal();
                binding::detach(&other);
                self.registry.remove(&other);
                other.close();
            }
        }

        self.registry.remove(session);
        session.close();
    }
}
