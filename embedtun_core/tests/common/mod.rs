//! In-memory platform for driving the tunnel manager in tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use embedtun_core::config::Config;
use embedtun_core::settings::Key;
use embedtun_core::tunnel::{
    Platform, TunnelDevice, TunnelError, TunnelResult, UserspaceDevice, VirtualInterface,
};
use embedtun_ipc::{socket_path, ControlConnection, ControlListener};

/// Step at which the fake platform fails on purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    CreateInterface,
    CreateDevice,
    Up,
    Listen,
    Apply,
}

#[derive(Debug)]
struct FakeInterface {
    name: String,
    live: Arc<Mutex<HashSet<String>>>,
}

impl VirtualInterface for FakeInterface {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for FakeInterface {
    fn drop(&mut self) {
        self.live.lock().unwrap().remove(&self.name);
    }
}

struct FakeDevice {
    inner: UserspaceDevice,
    close_calls: Arc<AtomicUsize>,
    socket: PathBuf,
    sockets_open_at_close: Arc<AtomicUsize>,
    fail_up: bool,
    fail_apply: bool,
}

#[async_trait]
impl TunnelDevice for FakeDevice {
    async fn up(&self) -> TunnelResult<()> {
        if self.fail_up {
            return Err(TunnelError::Engine("injected up failure".to_string()));
        }
        self.inner.up().await
    }

    async fn apply_config(&self, config: &str) -> TunnelResult<()> {
        if self.fail_apply {
            return Err(TunnelError::Engine("injected apply failure".to_string()));
        }
        self.inner.apply_config(config).await
    }

    async fn handle_control(&self, connection: ControlConnection) -> TunnelResult<()> {
        self.inner.handle_control(connection).await
    }

    async fn close(&self) -> TunnelResult<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.socket.exists() {
            self.sockets_open_at_close.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.close().await
    }
}

/// Platform whose interfaces are names in a set. A name stays taken until
/// its interface is dropped, so a leaked interface blocks reuse.
pub struct FakePlatform {
    socket_dir: TempDir,
    live: Arc<Mutex<HashSet<String>>>,
    close_calls: Arc<AtomicUsize>,
    sockets_open_at_close: Arc<AtomicUsize>,
    devices_created: AtomicUsize,
    fail_at: Mutex<Option<FailAt>>,
    rename_to: Mutex<Option<String>>,
}

impl FakePlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(FakePlatform {
            socket_dir: tempfile::tempdir().unwrap(),
            live: Arc::new(Mutex::new(HashSet::new())),
            close_calls: Arc::new(AtomicUsize::new(0)),
            sockets_open_at_close: Arc::new(AtomicUsize::new(0)),
            devices_created: AtomicUsize::new(0),
            fail_at: Mutex::new(None),
            rename_to: Mutex::new(None),
        })
    }

    pub fn fail_at(&self, step: Option<FailAt>) {
        *self.fail_at.lock().unwrap() = step;
    }

    /// Assign `name` to the next interface regardless of the request
    pub fn rename_next(&self, name: &str) {
        *self.rename_to.lock().unwrap() = Some(name.to_string());
    }

    fn should_fail(&self, step: FailAt) -> bool {
        *self.fail_at.lock().unwrap() == Some(step)
    }

    pub fn socket_dir(&self) -> &Path {
        self.socket_dir.path()
    }

    pub fn is_live(&self, name: &str) -> bool {
        self.live.lock().unwrap().contains(name)
    }

    pub fn live_interfaces(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    /// Total `close` calls across every device
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Device closes that found the control socket still on disk
    pub fn sockets_open_at_close(&self) -> usize {
        self.sockets_open_at_close.load(Ordering::SeqCst)
    }

    pub fn devices_created(&self) -> usize {
        self.devices_created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Platform for FakePlatform {
    async fn create_interface(
        &self,
        requested: &str,
        _mtu: u32,
    ) -> TunnelResult<Box<dyn VirtualInterface>> {
        if self.should_fail(FailAt::CreateInterface) {
            return Err(TunnelError::Provisioning("injected failure".to_string()));
        }

        let name = self
            .rename_to
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| requested.to_string());

        if !self.live.lock().unwrap().insert(name.clone()) {
            return Err(TunnelError::Provisioning(format!("{} already exists", name)));
        }

        Ok(Box::new(FakeInterface {
            name,
            live: Arc::clone(&self.live),
        }))
    }

    fn create_device(
        &self,
        interface: Box<dyn VirtualInterface>,
    ) -> TunnelResult<Arc<dyn TunnelDevice>> {
        if self.should_fail(FailAt::CreateDevice) {
            return Err(TunnelError::Engine("injected failure".to_string()));
        }
        self.devices_created.fetch_add(1, Ordering::SeqCst);

        let socket = socket_path(self.socket_dir.path(), interface.name());
        Ok(Arc::new(FakeDevice {
            inner: UserspaceDevice::new(interface),
            close_calls: Arc::clone(&self.close_calls),
            socket,
            sockets_open_at_close: Arc::clone(&self.sockets_open_at_close),
            fail_up: self.should_fail(FailAt::Up),
            fail_apply: self.should_fail(FailAt::Apply),
        }))
    }

    async fn listen(&self, interface_name: &str) -> TunnelResult<ControlListener> {
        if self.should_fail(FailAt::Listen) {
            return Err(TunnelError::Listener("injected failure".to_string()));
        }
        ControlListener::bind(self.socket_dir.path(), interface_name)
            .await
            .map_err(|e| TunnelError::Listener(e.to_string()))
    }
}

/// Manager configuration suited to tests
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.tunnel.worker_threads = 2;
    config.tunnel.shutdown_timeout_ms = 2_000;
    config
}

/// A tunnel document with one peer and an IP endpoint
pub fn single_peer_settings() -> String {
    format!(
        "[Interface]\nPrivateKey = {}\nListenPort = 51820\nAddress = 10.0.0.2/32\n\n[Peer]\nPublicKey = {}\nEndpoint = 192.0.2.1:51820\nAllowedIPs = 0.0.0.0/0\nPersistentKeepalive = 25\n",
        Key::from_bytes([7; 32]).to_base64(),
        Key::from_bytes([8; 32]).to_base64(),
    )
}

pub const MALFORMED_SETTINGS: &str = "[Interface]\nPrivateKey = not-a-key\n[Peer\n";
