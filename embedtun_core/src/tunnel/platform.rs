//! Collaborators the tunnel lifecycle drives.
//!
//! A [`Platform`] provisions virtual interfaces, builds the device bound to
//! an interface, and opens control listeners. [`SystemPlatform`] is the
//! production implementation: a layer-3 TUN interface from the `tun` crate,
//! a [`UserspaceDevice`] on top of it, and control sockets in the configured
//! directory.

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use tun::Device as _;

use embedtun_ipc::{ControlConnection, ControlListener};

use crate::config::TunnelDefaults;
use crate::settings::TunnelSettings;
use crate::tunnel::device::UserspaceDevice;
use crate::tunnel::error::{TunnelError, TunnelResult};

/// A provisioned virtual network interface. Dropping it releases the
/// interface.
pub trait VirtualInterface: Send + Sync + fmt::Debug {
    /// Name actually assigned by the platform
    fn name(&self) -> &str;
}

/// A running tunnel engine instance.
#[async_trait]
pub trait TunnelDevice: Send + Sync {
    /// Start internal processing
    async fn up(&self) -> TunnelResult<()>;

    /// Apply a configuration body (`key=value` lines)
    async fn apply_config(&self, config: &str) -> TunnelResult<()>;

    /// Serve one control connection until the client hangs up
    async fn handle_control(&self, connection: ControlConnection) -> TunnelResult<()>;

    /// Release the engine and its interface. Calling it again is a no-op.
    async fn close(&self) -> TunnelResult<()>;
}

/// Factory for the collaborators of one tunnel.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Request an interface named `requested` with the given MTU
    async fn create_interface(
        &self,
        requested: &str,
        mtu: u32,
    ) -> TunnelResult<Box<dyn VirtualInterface>>;

    /// Construct the device bound to `interface`
    fn create_device(
        &self,
        interface: Box<dyn VirtualInterface>,
    ) -> TunnelResult<Arc<dyn TunnelDevice>>;

    /// Open the control listener scoped to `interface_name`
    async fn listen(&self, interface_name: &str) -> TunnelResult<ControlListener>;

    /// Translate a tunnel document into the device's configuration body
    fn translate_settings(&self, text: &str, interface_name: &str) -> TunnelResult<String> {
        let settings = TunnelSettings::from_wg_quick(text, interface_name)?;
        Ok(settings.to_uapi()?)
    }
}

/// TUN interface created through the `tun` crate.
pub struct TunInterface {
    name: String,
    device: Mutex<tun::platform::Device>,
}

impl fmt::Debug for TunInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunInterface")
            .field("name", &self.name)
            .field("device", &"tun::platform::Device")
            .finish()
    }
}

impl VirtualInterface for TunInterface {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for TunInterface {
    fn drop(&mut self) {
        let device = self.device.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = device.enabled(false) {
            warn!(interface = %self.name, error = %e, "Failed to bring interface down");
        }
        debug!(interface = %self.name, "Releasing TUN interface");
    }
}

/// Production platform.
#[derive(Debug, Clone)]
pub struct SystemPlatform {
    socket_dir: PathBuf,
}

impl SystemPlatform {
    pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
        SystemPlatform {
            socket_dir: socket_dir.into(),
        }
    }

    pub fn from_defaults(defaults: &TunnelDefaults) -> Self {
        Self::new(defaults.socket_dir.clone())
    }
}

#[async_trait]
impl Platform for SystemPlatform {
    async fn create_interface(
        &self,
        requested: &str,
        mtu: u32,
    ) -> TunnelResult<Box<dyn VirtualInterface>> {
        let mtu = i32::try_from(mtu)
            .map_err(|_| TunnelError::Provisioning(format!("MTU {} out of range", mtu)))?;

        let mut config = tun::Configuration::default();
        config.name(requested).layer(tun::Layer::L3).mtu(mtu).up();

        let device = tun::create(&config).map_err(|e| {
            TunnelError::Provisioning(format!("Failed to create TUN device {}: {}", requested, e))
        })?;

        let name = device.name().to_string();
        if name != requested {
            info!(requested = %requested, actual = %name, "Platform renamed interface");
        }
        info!(interface = %name, mtu, "Created TUN interface");

        Ok(Box::new(TunInterface {
            name,
            device: Mutex::new(device),
        }))
    }

    fn create_device(
        &self,
        interface: Box<dyn VirtualInterface>,
    ) -> TunnelResult<Arc<dyn TunnelDevice>> {
        Ok(Arc::new(UserspaceDevice::new(interface)))
    }

    async fn listen(&self, interface_name: &str) -> TunnelResult<ControlListener> {
        ControlListener::bind(&self.socket_dir, interface_name)
            .await
            .map_err(|e| TunnelError::Listener(e.to_string()))
    }
}
