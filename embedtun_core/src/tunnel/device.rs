//! Userspace tunnel device.
//!
//! Holds a tunnel's configuration state and serves it over the control
//! protocol. Packet processing and the handshake live outside this crate; the
//! device only owns the interface and the settings a real engine would run
//! with.

use async_trait::async_trait;
use ipnet::IpNet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

use embedtun_ipc::messages::{ERRNO_IO, ERRNO_INVALID, ERRNO_PROTOCOL};
use embedtun_ipc::{ConfigLine, ControlConnection, ControlRequest, ControlResponse, IpcError};

use crate::settings::Key;
use crate::tunnel::error::{TunnelError, TunnelResult};
use crate::tunnel::platform::{TunnelDevice, VirtualInterface};

#[derive(Debug, Clone)]
struct PeerState {
    public_key: Key,
    preshared_key: Option<Key>,
    endpoint: Option<SocketAddr>,
    persistent_keepalive: u16,
    allowed_ips: Vec<IpNet>,
}

impl PeerState {
    fn new(public_key: Key) -> Self {
        PeerState {
            public_key,
            preshared_key: None,
            endpoint: None,
            persistent_keepalive: 0,
            allowed_ips: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct DeviceState {
    private_key: Option<Key>,
    listen_port: u16,
    fwmark: u32,
    peers: Vec<PeerState>,
}

/// Which peer subsequent peer-level lines of a `set` apply to
#[derive(Clone, Copy)]
enum Cursor {
    Interface,
    Peer(usize),
    /// Lines for a removed or `update_only` peer that does not exist
    Skip,
}

fn parse_bool(key: &str, value: &str) -> Result<bool, String> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(format!("{} expects true or false, got {:?}", key, value)),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("invalid {}: {:?}", key, value))
}

fn parse_key(key: &str, value: &str) -> Result<Key, String> {
    Key::from_hex(value).map_err(|e| format!("invalid {}: {}", key, e))
}

impl DeviceState {
    /// Apply `set` lines. The state is left untouched when any line is
    /// rejected.
    fn apply(&mut self, lines: &[ConfigLine]) -> Result<(), String> {
        let mut staged = self.clone();
        let mut cursor = Cursor::Interface;
        // Peer created by the current public_key line, so update_only can undo it
        let mut created = false;

        for line in lines {
            let (key, value) = (line.key.as_str(), line.value.as_str());

            if key == "public_key" {
                let public_key = parse_key(key, value)?;
                cursor = match staged.peers.iter().position(|p| p.public_key == public_key) {
                    Some(index) => {
                        created = false;
                        Cursor::Peer(index)
                    }
                    None => {
                        staged.peers.push(PeerState::new(public_key));
                        created = true;
                        Cursor::Peer(staged.peers.len() - 1)
                    }
                };
                continue;
            }

            match cursor {
                Cursor::Interface => staged.apply_interface_line(key, value)?,
                Cursor::Skip => {}
                Cursor::Peer(index) => match key {
                    "remove" => {
                        if parse_bool(key, value)? {
                            staged.peers.remove(index);
                            cursor = Cursor::Skip;
                        }
                    }
                    "update_only" => {
                        if parse_bool(key, value)? && created {
                            staged.peers.remove(index);
                            cursor = Cursor::Skip;
                        }
                    }
                    _ => staged.peers[index].apply_line(key, value)?,
                },
            }
        }

        *self = staged;
        Ok(())
    }

    fn apply_interface_line(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "private_key" => {
                let private_key = parse_key(key, value)?;
                self.private_key = (!private_key.is_zero()).then_some(private_key);
            }
            "listen_port" => self.listen_port = parse_number(key, value)?,
            "fwmark" => self.fwmark = parse_number(key, value)?,
            "replace_peers" => {
                if parse_bool(key, value)? {
                    self.peers.clear();
                }
            }
            _ => return Err(format!("unexpected interface key {:?}", key)),
        }
        Ok(())
    }

    fn render(&self) -> Vec<ConfigLine> {
        let mut lines = Vec::new();
        if let Some(private_key) = &self.private_key {
            lines.push(ConfigLine::new("private_key", private_key.to_hex()));
        }
        if self.listen_port != 0 {
            lines.push(ConfigLine::new("listen_port", self.listen_port.to_string()));
        }
        if self.fwmark != 0 {
            lines.push(ConfigLine::new("fwmark", self.fwmark.to_string()));
        }

        for peer in &self.peers {
            lines.push(ConfigLine::new("public_key", peer.public_key.to_hex()));
            if let Some(psk) = &peer.preshared_key {
                lines.push(ConfigLine::new("preshared_key", psk.to_hex()));
            }
            lines.push(ConfigLine::new("protocol_version", "1"));
            if let Some(endpoint) = peer.endpoint {
                lines.push(ConfigLine::new("endpoint", endpoint.to_string()));
            }
            // No handshakes or traffic happen in a control-plane device
            lines.push(ConfigLine::new("last_handshake_time_sec", "0"));
            lines.push(ConfigLine::new("last_handshake_time_nsec", "0"));
            lines.push(ConfigLine::new("tx_bytes", "0"));
            lines.push(ConfigLine::new("rx_bytes", "0"));
            lines.push(ConfigLine::new(
                "persistent_keepalive_interval",
                peer.persistent_keepalive.to_string(),
            ));
            for allowed in &peer.allowed_ips {
                lines.push(ConfigLine::new("allowed_ip", allowed.to_string()));
            }
        }
        lines
    }
}

impl PeerState {
    fn apply_line(&mut self, key: &str, value: &str) -> Result<(), String> {
        match key {
            "preshared_key" => {
                let psk = parse_key(key, value)?;
                self.preshared_key = (!psk.is_zero()).then_some(psk);
            }
            "endpoint" => self.endpoint = Some(parse_number(key, value)?),
            "persistent_keepalive_interval" => {
                self.persistent_keepalive = parse_number(key, value)?
            }
            "replace_allowed_ips" => {
                if parse_bool(key, value)? {
                    self.allowed_ips.clear();
                }
            }
            "allowed_ip" => {
                let net: IpNet = parse_number(key, value)?;
                if !self.allowed_ips.contains(&net) {
                    self.allowed_ips.push(net);
                }
            }
            "protocol_version" => {
                if value != "1" {
                    return Err(format!("unsupported protocol version {:?}", value));
                }
            }
            _ => return Err(format!("unexpected peer key {:?}", key)),
        }
        Ok(())
    }
}

/// Control-plane device bound to one virtual interface.
pub struct UserspaceDevice {
    name: String,
    interface: Mutex<Option<Box<dyn VirtualInterface>>>,
    state: Mutex<DeviceState>,
    up: AtomicBool,
    closed: AtomicBool,
}

impl UserspaceDevice {
    pub fn new(interface: Box<dyn VirtualInterface>) -> Self {
        UserspaceDevice {
            name: interface.name().to_string(),
            interface: Mutex::new(Some(interface)),
            state: Mutex::new(DeviceState::default()),
            up: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Name of the interface this device is bound to
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer one control request.
    pub fn dispatch(&self, request: &ControlRequest) -> ControlResponse {
        if self.is_closed() {
            return ControlResponse::error(ERRNO_IO);
        }

        match request {
            ControlRequest::Get => ControlResponse::ok(self.state().render()),
            ControlRequest::Set(lines) => match self.state().apply(lines) {
                Ok(()) => {
                    debug!(interface = %self.name, lines = lines.len(), "Applied set request");
                    ControlResponse::ok(Vec::new())
                }
                Err(e) => {
                    warn!(interface = %self.name, error = %e, "Rejected set request");
                    ControlResponse::error(ERRNO_INVALID)
                }
            },
        }
    }
}

#[async_trait]
impl TunnelDevice for UserspaceDevice {
    async fn up(&self) -> TunnelResult<()> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }
        self.up.store(true, Ordering::Release);
        info!(interface = %self.name, "Device up");
        Ok(())
    }

    async fn apply_config(&self, config: &str) -> TunnelResult<()> {
        if self.is_closed() {
            return Err(TunnelError::Closed);
        }

        let lines = config
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ConfigLine::parse)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TunnelError::Engine(e.to_string()))?;

        self.state().apply(&lines).map_err(TunnelError::Engine)?;
        info!(interface = %self.name, lines = lines.len(), "Configuration applied");
        Ok(())
    }

    async fn handle_control(&self, mut connection: ControlConnection) -> TunnelResult<()> {
        let peer_uid = connection.peer_uid();
        debug!(interface = %self.name, ?peer_uid, "Serving control connection");

        loop {
            let request = match connection.receive_request().await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(IpcError::UnknownOperation(op)) => {
                    warn!(interface = %self.name, operation = %op, "Unknown control operation");
                    connection
                        .send_response(&ControlResponse::error(ERRNO_PROTOCOL))
                        .await?;
                    break;
                }
                Err(IpcError::Protocol(msg)) => {
                    warn!(interface = %self.name, error = %msg, "Malformed control request");
                    connection
                        .send_response(&ControlResponse::error(ERRNO_PROTOCOL))
                        .await?;
                    break;
                }
                Err(e) => return Err(e.into()),
            };

            let response = self.dispatch(&request);
            connection.send_response(&response).await?;
        }

        if let Err(e) = connection.close().await {
            debug!(interface = %self.name, error = %e, "Control connection already closed");
        }
        Ok(())
    }

    async fn close(&self) -> TunnelResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.up.store(false, Ordering::Release);

        let interface = self
            .interface
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(interface);
        *self.state() = DeviceState::default();

        info!(interface = %self.name, "Device closed");
        Ok(())
    }
}
