//! Tunnel settings.
//!
//! A host hands the manager a tunnel document in the INI-style format used by
//! `wg-quick` (`[Interface]` plus any number of `[Peer]` sections). This
//! module parses it into [`TunnelSettings`] and renders the line-based
//! `key=value` form the device applies.

mod uapi;
mod wg_quick;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use ipnet::IpNet;
use std::fmt;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use thiserror::Error;

/// Errors produced while reading a tunnel document.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    /// Line that is neither a section header nor `key = value`
    #[error("Line {line}: {message}")]
    Syntax { line: usize, message: String },

    /// Key not valid for its section
    #[error("Line {line}: invalid key {key:?} for [{section}] section")]
    UnknownKey {
        line: usize,
        section: String,
        key: String,
    },

    /// Value that does not parse for its key
    #[error("Line {line}: invalid value for {key}: {message}")]
    InvalidValue {
        line: usize,
        key: String,
        message: String,
    },

    /// No `[Interface]` section
    #[error("An [Interface] section is required")]
    MissingInterface,

    /// `[Interface]` without a private key
    #[error("[Interface] section of {0} is missing PrivateKey")]
    MissingPrivateKey(String),

    /// `[Peer]` without a public key
    #[error("Peer #{0} is missing PublicKey")]
    MissingPublicKey(usize),

    /// Two peers with the same public key
    #[error("Duplicate peer public key {0}")]
    DuplicatePeer(String),

    /// Malformed key material
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Endpoint host that does not resolve
    #[error("Cannot resolve endpoint {endpoint}: {message}")]
    Resolve { endpoint: String, message: String },
}

/// A 32-byte Curve25519 key, public, private or preshared.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key([u8; 32]);

impl Key {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Key(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Decode the base64 form used in tunnel documents
    pub fn from_base64(encoded: &str) -> Result<Self, SettingsError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| SettingsError::InvalidKey(format!("bad base64: {}", e)))?;
        Self::from_slice(&bytes)
    }

    /// Decode the lowercase hex form used on the control socket
    pub fn from_hex(encoded: &str) -> Result<Self, SettingsError> {
        let encoded = encoded.trim();
        if encoded.len() != 64 || !encoded.is_ascii() {
            return Err(SettingsError::InvalidKey(format!(
                "expected 64 hex characters, got {}",
                encoded.len()
            )));
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&encoded[i * 2..i * 2 + 2], 16)
                .map_err(|e| SettingsError::InvalidKey(format!("bad hex: {}", e)))?;
        }
        Ok(Key(bytes))
    }

    fn from_slice(bytes: &[u8]) -> Result<Self, SettingsError> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            SettingsError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Key(bytes))
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Private and preshared keys share this type
        f.write_str("Key(..)")
    }
}

/// Peer endpoint as written in the document; hostnames resolve lazily.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parse `host:port` or `[v6-address]:port`
    pub fn parse(raw: &str) -> Result<Self, String> {
        let (host, port) = raw
            .rsplit_once(':')
            .ok_or_else(|| "missing port".to_string())?;
        let (host, bracketed) = match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            Some(inner) => (inner, true),
            None => (host, false),
        };
        if host.is_empty() {
            return Err("missing host".to_string());
        }
        if host.contains(':') && (!bracketed || host.parse::<IpAddr>().is_err()) {
            return Err(format!("IPv6 address must be written as [address]:port, got {:?}", raw));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| format!("invalid port {:?}: {}", port, e))?;
        if port == 0 {
            return Err("port cannot be 0".to_string());
        }
        Ok(Endpoint {
            host: host.to_string(),
            port,
        })
    }

    /// Resolve to a socket address, preferring IPv4 results
    pub fn resolve(&self) -> Result<SocketAddr, SettingsError> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }

        let resolve_err = |message: String| SettingsError::Resolve {
            endpoint: self.to_string(),
            message,
        };
        let addrs: Vec<SocketAddr> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| resolve_err(e.to_string()))?
            .collect();
        addrs
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| resolve_err("no addresses returned".to_string()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// `[Interface]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSettings {
    pub private_key: Key,
    pub listen_port: Option<u16>,
    pub fwmark: Option<u32>,
    pub addresses: Vec<IpNet>,
    pub dns: Vec<IpAddr>,
    pub dns_search: Vec<String>,
    pub mtu: Option<u16>,
    /// Hook commands are kept for the host; they are never executed here
    pub pre_up: Vec<String>,
    pub post_up: Vec<String>,
    pub pre_down: Vec<String>,
    pub post_down: Vec<String>,
}

/// `[Peer]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSettings {
    pub public_key: Key,
    pub preshared_key: Option<Key>,
    pub allowed_ips: Vec<IpNet>,
    pub endpoint: Option<Endpoint>,
    pub persistent_keepalive: Option<u16>,
}

/// A parsed tunnel document bound to an interface name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSettings {
    pub name: String,
    pub interface: InterfaceSettings,
    pub peers: Vec<PeerSettings>,
}

impl TunnelSettings {
    /// Parse a `wg-quick` style document for `interface_name`
    pub fn from_wg_quick(text: &str, interface_name: &str) -> Result<Self, SettingsError> {
        wg_quick::parse(text, interface_name)
    }

    /// Render the device configuration body (one `key=value` per line)
    pub fn to_uapi(&self) -> Result<String, SettingsError> {
        uapi::render(self)
    }
}

/// Parse a CIDR, treating a bare address as a host route
pub(crate) fn parse_cidr(raw: &str) -> Result<IpNet, String> {
    let raw = raw.trim();
    if raw.contains('/') {
        raw.parse::<IpNet>()
            .map_err(|e| format!("invalid CIDR {:?}: {}", raw, e))
    } else {
        raw.parse::<IpAddr>()
            .map(IpNet::from)
            .map_err(|e| format!("invalid address {:?}: {}", raw, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_between_encodings() {
        let key = Key::from_bytes([0xab; 32]);
        let decoded = Key::from_base64(&key.to_base64()).unwrap();
        assert_eq!(decoded, key);
        assert_eq!(key.to_hex(), "ab".repeat(32));
        assert_eq!(Key::from_hex(&"AB".repeat(32)).unwrap(), key);
    }

    #[test]
    fn key_rejects_wrong_lengths() {
        assert!(Key::from_base64("AAAA").is_err());
        assert!(Key::from_hex("abcd").is_err());
        assert!(Key::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn key_debug_does_not_leak_material() {
        let key = Key::from_bytes([7; 32]);
        assert_eq!(format!("{:?}", key), "Key(..)");
    }

    #[test]
    fn endpoint_parsing() {
        let v4 = Endpoint::parse("192.0.2.1:51820").unwrap();
        assert_eq!(v4.resolve().unwrap(), "192.0.2.1:51820".parse().unwrap());

        let v6 = Endpoint::parse("[2001:db8::1]:51820").unwrap();
        assert_eq!(v6.host, "2001:db8::1");
        assert_eq!(v6.to_string(), "[2001:db8::1]:51820");

        let named = Endpoint::parse("vpn.example.com:443").unwrap();
        assert_eq!(named.host, "vpn.example.com");

        assert!(Endpoint::parse("192.0.2.1").is_err());
        assert!(Endpoint::parse(":51820").is_err());
        assert!(Endpoint::parse("192.0.2.1:0").is_err());
        assert!(Endpoint::parse("2001:db8::1:51820").is_err());
    }

    #[test]
    fn cidr_defaults_to_host_prefix() {
        assert_eq!(parse_cidr("10.0.0.1").unwrap().to_string(), "10.0.0.1/32");
        assert_eq!(parse_cidr("fd00::1").unwrap().to_string(), "fd00::1/128");
        assert_eq!(parse_cidr(" 0.0.0.0/0 ").unwrap().to_string(), "0.0.0.0/0");
        assert!(parse_cidr("10.0.0.0/33").is_err());
    }
}
