//! embedtun host boundary.
//!
//! C ABI entry points a host process loads to bring tunnels up and down.
//! Strings arrive as NUL-terminated UTF-16. Every entry point contains
//! panics: a fault is logged and reported as the failure sentinel, or
//! absorbed where the operation returns nothing.
//!
//! The process holds one [`TunnelManager`], created on the first call that
//! needs it from [`Config::from_env`]. Logging is set up in the same step, so
//! failures are recorded before any handle is returned.

pub mod wide;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::OnceLock;
use tracing::{debug, error, info};
use tracing_appender::non_blocking::WorkerGuard;

use embedtun_core::config::Config;
use embedtun_core::logging::init_logging_from_config;
use embedtun_core::tunnel::{TunnelError, TunnelHandle, TunnelManager, FAILURE_SENTINEL};

/// Returned by [`embedtun_turn_on_empty`]
pub const PROBE_OK: i32 = 1;

struct ProcessState {
    manager: Option<TunnelManager>,
    _log_guard: Option<WorkerGuard>,
}

static STATE: OnceLock<ProcessState> = OnceLock::new();

impl ProcessState {
    fn init() -> Self {
        let config = Config::from_env();
        let log_guard = match &config {
            Ok(config) => init_logging_from_config(config),
            Err(_) => init_logging_from_config(&Config::default()),
        };

        let manager = match config {
            Ok(config) => match TunnelManager::with_system_platform(&config) {
                Ok(manager) => {
                    info!(
                        version = env!("CARGO_PKG_VERSION"),
                        socket_dir = %config.tunnel.socket_dir.display(),
                        "embedtun loaded"
                    );
                    Some(manager)
                }
                Err(e) => {
                    error!(error = %e, "Failed to create tunnel manager");
                    None
                }
            },
            Err(e) => {
                error!(error = %e, "Invalid embedtun configuration");
                None
            }
        };

        ProcessState {
            manager,
            _log_guard: log_guard,
        }
    }
}

fn process_state() -> &'static ProcessState {
    STATE.get_or_init(ProcessState::init)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run `f`, turning a panic into `fallback`.
fn guarded<T>(operation: &str, fallback: T, f: impl FnOnce() -> T) -> T {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(payload) => {
            error!(operation, panic = %panic_message(payload.as_ref()), "Panic at the host boundary");
            fallback
        }
    }
}

/// Decode the arguments and bring a tunnel up on `manager`.
///
/// # Safety
///
/// Both pointers must satisfy [`wide::decode`].
unsafe fn turn_on(
    manager: Option<&TunnelManager>,
    interface_name: *const u16,
    settings: *const u16,
) -> i32 {
    let result = match (manager, wide::decode(interface_name), wide::decode(settings)) {
        (Some(manager), Ok(interface_name), Ok(settings)) => {
            manager.bring_up(&interface_name, &settings)
        }
        (None, _, _) => Err(TunnelError::Runtime("tunnel manager unavailable".to_string())),
        (_, Err(e), _) | (_, _, Err(e)) => Err(e),
    };

    match result {
        Ok(handle) => handle.as_raw(),
        Err(e) => {
            error!(error = %e, "Tunnel bring-up failed");
            FAILURE_SENTINEL
        }
    }
}

fn turn_off(manager: Option<&TunnelManager>, handle: i32) {
    let (Some(manager), Some(handle)) = (manager, TunnelHandle::from_raw(handle)) else {
        debug!(handle, "Ignoring tear down request");
        return;
    };
    manager.tear_down(handle);
}

/// Bring a tunnel up.
///
/// Returns a non-negative handle, or `-1` on any failure.
///
/// # Safety
///
/// `interface_name` and `settings` must each be null or point to a
/// NUL-terminated UTF-16 string valid for the duration of the call.
#[no_mangle]
pub unsafe extern "C" fn embedtun_turn_on(interface_name: *const u16, settings: *const u16) -> i32 {
    guarded("turn_on", FAILURE_SENTINEL, || {
        turn_on(process_state().manager.as_ref(), interface_name, settings)
    })
}

/// Tear a tunnel down. Unknown and already torn-down handles are ignored.
#[no_mangle]
pub extern "C" fn embedtun_turn_off(handle: i32) {
    guarded("turn_off", (), || {
        turn_off(process_state().manager.as_ref(), handle)
    })
}

/// Load probe. No side effects.
#[no_mangle]
pub extern "C" fn embedtun_turn_on_empty() -> i32 {
    PROBE_OK
}

/// Tear every live tunnel down before the host unloads the library.
#[no_mangle]
pub extern "C" fn embedtun_shutdown() {
    guarded("shutdown", (), || {
        // Nothing to do if no call ever created the manager
        if let Some(manager) = STATE.get().and_then(|state| state.manager.as_ref()) {
            manager.shutdown();
        }
    })
}
