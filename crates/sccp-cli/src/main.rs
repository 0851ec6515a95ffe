//! Standalone demo binary for the session core. Runs the listener with
//! stub device/ACL/event-bus collaborators (real ones are supplied by the
//! embedding PBX, out of scope here) and periodically prints the "list
//! sessions" table to stdout, the one CLI surface the session core names.

mod table;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sccp_collab::test_support::{DenyAll, StubEventBus};
use sccp_core::{Collaborators, SccpModule, SessionConfig};

#[derive(Parser, Debug)]
#[command(name = "sccpd", about = "SCCP/SPCP session-core demo listener")]
struct Args {
    /// Path to a TOML config file; missing file falls back to defaults.
    #[arg(long, default_value = "sccp.toml")]
    config: PathBuf,

    /// Seconds between "list sessions" table prints.
    #[arg(long, default_value_t = 10)]
    list_interval_secs: u64,

    /// Deny every incoming peer instead of allowing all (for smoke-testing
    /// the ACL-denial path).
    #[arg(long, default_value_t = false)]
    deny_all: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = SessionConfig::load(&args.config).expect("failed to load config");
    let keepalive_secs = config.keepalive_secs;

    let acl: Arc<dyn sccp_collab::AccessList> = if args.deny_all {
        Arc::new(DenyAll)
    } else {
        Arc::new(sccp_collab::AllowAll)
    };

    let module = SccpModule::new(
        config,
        Collaborators {
            acl,
            handler_table: Arc::new(NoopHandlerTable),
            event_bus: Arc::new(StubEventBus::new()),
        },
    );

    let stop = Arc::new(AtomicBool::new(false));
    install_signal_handler(&stop);

    let listener_handle = module.start();

    while !stop.load(Ordering::Acquire) {
        std::thread::sleep(Duration::from_secs(args.list_interval_secs));
        println!("{}", table::render_session_table(module.registry(), keepalive_secs));
    }

    module.stop();
    match listener_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "listener exited with error"),
        Err(_) => tracing::warn!("listener thread panicked"),
    }
}

fn install_signal_handler(stop: &Arc<AtomicBool>) {
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(sig, Arc::clone(stop)).expect("failed to register signal handler");
    }
}

struct NoopHandlerTable;

impl sccp_collab::MessageHandlerTable for NoopHandlerTable {
    fn dispatch(&self, _msg: &sccp_collab::DispatchMessage, _session: &dyn sccp_collab::SessionHandle) -> i32 {
        0
    }
}
