//! Device driver adapter.
//!
//! Brings one tunnel from nothing to a configured, running device with an
//! open control listener. Each step releases what earlier steps acquired
//! before its error is returned.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use embedtun_ipc::ControlListener;

use crate::tunnel::error::TunnelResult;
use crate::tunnel::platform::{Platform, TunnelDevice};

/// A device that completed bring-up, together with its control listener.
pub struct RunningDevice {
    /// Name the platform actually assigned
    pub interface_name: String,
    pub device: Arc<dyn TunnelDevice>,
    pub listener: ControlListener,
}

impl std::fmt::Debug for RunningDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningDevice")
            .field("interface_name", &self.interface_name)
            .field("listener", &self.listener)
            .finish()
    }
}

/// Drives the platform through the bring-up sequence.
#[derive(Clone)]
pub struct DeviceDriver {
    platform: Arc<dyn Platform>,
    mtu: u32,
}

async fn release(device: &Arc<dyn TunnelDevice>, interface: &str) {
    if let Err(e) = device.close().await {
        warn!(interface = %interface, error = %e, "Failed to close device while unwinding");
    }
}

impl DeviceDriver {
    pub fn new(platform: Arc<dyn Platform>, mtu: u32) -> Self {
        DeviceDriver { platform, mtu }
    }

    /// Create, start and configure a device for `requested_name`.
    pub async fn bring_up(
        &self,
        requested_name: &str,
        settings_text: &str,
    ) -> TunnelResult<RunningDevice> {
        debug!(interface = %requested_name, mtu = self.mtu, "Creating interface");
        let interface = self
            .platform
            .create_interface(requested_name, self.mtu)
            .await
            .map_err(|e| {
                error!(interface = %requested_name, error = %e, "Failed to create interface");
                e
            })?;
        let name = interface.name().to_string();

        // Dropping the interface on failure releases it
        let device = self.platform.create_device(interface).map_err(|e| {
            error!(interface = %name, error = %e, "Failed to create device");
            e
        })?;

        if let Err(e) = device.up().await {
            error!(interface = %name, error = %e, "Failed to bring device up");
            release(&device, &name).await;
            return Err(e);
        }

        let config = match self.platform.translate_settings(settings_text, &name) {
            Ok(config) => config,
            Err(e) => {
                error!(interface = %name, error = %e, "Failed to parse tunnel settings");
                release(&device, &name).await;
                return Err(e);
            }
        };

        let listener = match self.platform.listen(&name).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(interface = %name, error = %e, "Failed to open control listener");
                release(&device, &name).await;
                return Err(e);
            }
        };

        if let Err(e) = device.apply_config(&config).await {
            error!(interface = %name, error = %e, "Failed to apply configuration");
            drop(listener);
            release(&device, &name).await;
            return Err(e);
        }

        info!(interface = %name, socket = %listener.path().display(), "Device running");
        Ok(RunningDevice {
            interface_name: name,
            device,
            listener,
        })
    }
}
