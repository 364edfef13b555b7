//! Tunnel lifecycle manager.
//!
//! Owns the handle table and the runtime that device work and acceptor loops
//! run on. `bring_up` and `tear_down` are synchronous: they block the calling
//! thread on the runtime and must not be called from inside an async context.

use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::tunnel::acceptor::{Acceptor, AcceptorHandle};
use crate::tunnel::driver::{DeviceDriver, RunningDevice};
use crate::tunnel::error::{TunnelError, TunnelResult};
use crate::tunnel::platform::{Platform, SystemPlatform, TunnelDevice};
use crate::tunnel::table::HandleTable;
use crate::tunnel::types::{TunnelHandle, TunnelState};

/// How long tear down waits for an acceptor to drop its listener
const LISTENER_RELEASE_TIMEOUT: Duration = Duration::from_secs(1);

/// Everything a live tunnel owns.
struct TunnelRecord {
    interface_name: String,
    device: Arc<dyn TunnelDevice>,
    acceptor: AcceptorHandle,
    state: TunnelState,
}

/// Manager for the tunnels of one process.
pub struct TunnelManager {
    table: HandleTable<TunnelRecord>,
    driver: DeviceDriver,
    shutdown_timeout: Duration,
    runtime: Runtime,
}

impl TunnelManager {
    /// Create a manager that provisions through `platform`.
    pub fn new(config: &Config, platform: Arc<dyn Platform>) -> TunnelResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.tunnel.worker_threads)
            .thread_name("embedtun-worker")
            .enable_all()
            .build()
            .map_err(|e| TunnelError::Runtime(format!("Failed to build runtime: {}", e)))?;

        debug!(
            worker_threads = config.tunnel.worker_threads,
            mtu = config.tunnel.mtu,
            "Tunnel manager created"
        );

        Ok(TunnelManager {
            table: HandleTable::new(),
            driver: DeviceDriver::new(platform, config.tunnel.mtu),
            shutdown_timeout: config.tunnel.shutdown_timeout(),
            runtime,
        })
    }

    /// Create a manager backed by TUN interfaces and the configured socket
    /// directory.
    pub fn with_system_platform(config: &Config) -> TunnelResult<Self> {
        let platform = SystemPlatform::from_defaults(&config.tunnel);
        Self::new(config, Arc::new(platform))
    }

    /// Bring a tunnel up and return its handle.
    ///
    /// No handle is allocated when any step fails, and everything acquired
    /// before the failure has been released by the time this returns.
    pub fn bring_up(&self, interface_name: &str, settings: &str) -> TunnelResult<TunnelHandle> {
        info!(interface = %interface_name, state = ?TunnelState::Starting, "Bringing tunnel up");
        let RunningDevice {
            interface_name,
            device,
            listener,
        } = self
            .runtime
            .block_on(self.driver.bring_up(interface_name, settings))?;

        let acceptor = {
            let _guard = self.runtime.enter();
            Acceptor::spawn(listener, Arc::clone(&device))
        };

        let handle = self.table.insert(TunnelRecord {
            interface_name: interface_name.clone(),
            device,
            acceptor,
            state: TunnelState::Live,
        });

        info!(%handle, interface = %interface_name, "Tunnel live");
        Ok(handle)
    }

    /// Tear the tunnel for `handle` down.
    ///
    /// Returns `true` if this call removed the tunnel and `false` if the
    /// handle was not live. Close failures are logged, never returned.
    pub fn tear_down(&self, handle: TunnelHandle) -> bool {
        let Some(record) = self.table.remove(handle) else {
            debug!(%handle, "Tear down of unknown handle ignored");
            return false;
        };

        self.runtime.block_on(close_record(handle, record));
        true
    }

    /// Actual interface name of a live tunnel
    pub fn interface_name(&self, handle: TunnelHandle) -> Option<String> {
        self.table.with(handle, |record| record.interface_name.clone())
    }

    /// Number of live tunnels
    pub fn live_count(&self) -> usize {
        self.table.len()
    }

    /// Handles of live tunnels, ascending
    pub fn handles(&self) -> Vec<TunnelHandle> {
        self.table.handles()
    }

    /// Tear every live tunnel down and wait, up to the configured shutdown
    /// timeout, for their acceptors to stop. The manager stays usable.
    pub fn shutdown(&self) {
        let records = self.table.drain();
        if records.is_empty() {
            return;
        }
        info!(count = records.len(), "Shutting down live tunnels");

        let timeout = self.shutdown_timeout;
        self.runtime.block_on(async move {
            let mut acceptors = Vec::with_capacity(records.len());
            for (handle, record) in records {
                acceptors.push((handle, close_record(handle, record).await));
            }

            let deadline = Instant::now() + timeout;
            for (handle, acceptor) in acceptors {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if !acceptor.join(remaining).await {
                    warn!(%handle, "Acceptor did not stop before the shutdown timeout");
                }
            }
        });
    }
}

/// Close the listener, then the device. Hands the acceptor back so the
/// caller may wait for the loop itself to exit.
async fn close_record(handle: TunnelHandle, mut record: TunnelRecord) -> AcceptorHandle {
    record.state = TunnelState::TornDown;
    debug!(%handle, interface = %record.interface_name, state = ?record.state, "Tearing tunnel down");

    if !record.acceptor.release(LISTENER_RELEASE_TIMEOUT).await {
        warn!(%handle, interface = %record.interface_name, "Control listener still open when closing device");
    }
    if let Err(e) = record.device.close().await {
        warn!(%handle, interface = %record.interface_name, error = %e, "Failed to close device");
    }

    info!(%handle, interface = %record.interface_name, "Tunnel torn down");
    record.acceptor
}

impl Drop for TunnelManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
