//! Parser for `wg-quick` style tunnel documents.

use super::{Endpoint, InterfaceSettings, Key, PeerSettings, SettingsError, TunnelSettings};
use ipnet::IpNet;
use std::collections::HashSet;
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Interface,
    Peer,
}

impl Section {
    fn name(self) -> &'static str {
        match self {
            Section::None => "none",
            Section::Interface => "Interface",
            Section::Peer => "Peer",
        }
    }
}

#[derive(Default)]
struct InterfaceDraft {
    private_key: Option<Key>,
    listen_port: Option<u16>,
    fwmark: Option<u32>,
    addresses: Vec<IpNet>,
    dns: Vec<IpAddr>,
    dns_search: Vec<String>,
    mtu: Option<u16>,
    pre_up: Vec<String>,
    post_up: Vec<String>,
    pre_down: Vec<String>,
    post_down: Vec<String>,
}

#[derive(Default)]
struct PeerDraft {
    public_key: Option<Key>,
    preshared_key: Option<Key>,
    allowed_ips: Vec<IpNet>,
    endpoint: Option<Endpoint>,
    persistent_keepalive: Option<u16>,
}

pub(super) fn parse(text: &str, interface_name: &str) -> Result<TunnelSettings, SettingsError> {
    let mut section = Section::None;
    let mut interface: Option<InterfaceDraft> = None;
    let mut peers: Vec<PeerDraft> = Vec::new();

    for (index, raw_line) in text.lines().enumerate() {
        let line_no = index + 1;
        let line = match raw_line.find('#') {
            Some(pos) => &raw_line[..pos],
            None => raw_line,
        }
        .trim();

        if line.is_empty() {
            continue;
        }

        if line.starts_with('[') {
            match line.to_ascii_lowercase().as_str() {
                "[interface]" => {
                    if interface.is_some() {
                        return Err(SettingsError::Syntax {
                            line: line_no,
                            message: "only one [Interface] section is allowed".to_string(),
                        });
                    }
                    interface = Some(InterfaceDraft::default());
                    section = Section::Interface;
                }
                "[peer]" => {
                    peers.push(PeerDraft::default());
                    section = Section::Peer;
                }
                _ => {
                    return Err(SettingsError::Syntax {
                        line: line_no,
                        message: format!("unknown section {}", line),
                    });
                }
            }
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| SettingsError::Syntax {
            line: line_no,
            message: "config key is missing an equals separator".to_string(),
        })?;
        let key = key.trim();
        let value = value.trim();
        if value.is_empty() {
            return Err(SettingsError::InvalidValue {
                line: line_no,
                key: key.to_string(),
                message: "value is empty".to_string(),
            });
        }

        match (section, interface.as_mut(), peers.last_mut()) {
            (Section::Interface, Some(draft), _) => apply_interface_key(draft, line_no, key, value)?,
            (Section::Peer, _, Some(draft)) => apply_peer_key(draft, line_no, key, value)?,
            _ => {
                return Err(SettingsError::Syntax {
                    line: line_no,
                    message: "key appears outside of a section".to_string(),
                });
            }
        }
    }

    let interface = interface.ok_or(SettingsError::MissingInterface)?;
    let private_key = interface
        .private_key
        .ok_or_else(|| SettingsError::MissingPrivateKey(interface_name.to_string()))?;

    let mut seen = HashSet::new();
    let mut finished_peers = Vec::with_capacity(peers.len());
    for (index, peer) in peers.into_iter().enumerate() {
        let public_key = peer
            .public_key
            .ok_or(SettingsError::MissingPublicKey(index + 1))?;
        if !seen.insert(public_key) {
            return Err(SettingsError::DuplicatePeer(public_key.to_base64()));
        }
        finished_peers.push(PeerSettings {
            public_key,
            preshared_key: peer.preshared_key,
            allowed_ips: peer.allowed_ips,
            endpoint: peer.endpoint,
            persistent_keepalive: peer.persistent_keepalive,
        });
    }

    Ok(TunnelSettings {
        name: interface_name.to_string(),
        interface: InterfaceSettings {
            private_key,
            listen_port: interface.listen_port,
            fwmark: interface.fwmark,
            addresses: interface.addresses,
            dns: interface.dns,
            dns_search: interface.dns_search,
            mtu: interface.mtu,
            pre_up: interface.pre_up,
            post_up: interface.post_up,
            pre_down: interface.pre_down,
            post_down: interface.post_down,
        },
        peers: finished_peers,
    })
}

fn invalid(line: usize, key: &str, message: impl Into<String>) -> SettingsError {
    SettingsError::InvalidValue {
        line,
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse_key(line: usize, key: &str, value: &str) -> Result<Key, SettingsError> {
    Key::from_base64(value).map_err(|e| invalid(line, key, e.to_string()))
}

fn parse_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|v| !v.is_empty())
}

fn parse_cidrs(line: usize, key: &str, value: &str) -> Result<Vec<IpNet>, SettingsError> {
    parse_list(value)
        .map(|item| super::parse_cidr(item).map_err(|e| invalid(line, key, e)))
        .collect()
}

fn parse_u16(line: usize, key: &str, value: &str) -> Result<u16, SettingsError> {
    value
        .parse::<u16>()
        .map_err(|e| invalid(line, key, format!("{:?}: {}", value, e)))
}

fn apply_interface_key(
    draft: &mut InterfaceDraft,
    line: usize,
    key: &str,
    value: &str,
) -> Result<(), SettingsError> {
    match key.to_ascii_lowercase().as_str() {
        "privatekey" => draft.private_key = Some(parse_key(line, key, value)?),
        "listenport" => draft.listen_port = Some(parse_u16(line, key, value)?),
        "fwmark" => {
            draft.fwmark = if value.eq_ignore_ascii_case("off") {
                None
            } else {
                let parsed = match value.strip_prefix("0x") {
                    Some(hex) => u32::from_str_radix(hex, 16),
                    None => value.parse::<u32>(),
                };
                Some(parsed.map_err(|e| invalid(line, key, format!("{:?}: {}", value, e)))?)
            };
        }
        "mtu" => {
            let mtu = parse_u16(line, key, value)?;
            if mtu < 576 {
                return Err(invalid(line, key, format!("{} is below 576", mtu)));
            }
            draft.mtu = Some(mtu);
        }
        "address" => draft.addresses.extend(parse_cidrs(line, key, value)?),
        "dns" => {
            for item in parse_list(value) {
                match item.parse::<IpAddr>() {
                    Ok(ip) => draft.dns.push(ip),
                    Err(_) => draft.dns_search.push(item.to_string()),
                }
            }
        }
        "preup" => draft.pre_up.push(value.to_string()),
        "postup" => draft.post_up.push(value.to_string()),
        "predown" => draft.pre_down.push(value.to_string()),
        "postdown" => draft.post_down.push(value.to_string()),
        _ => {
            return Err(SettingsError::UnknownKey {
                line,
                section: Section::Interface.name().to_string(),
                key: key.to_string(),
            });
        }
    }
    Ok(())
}

fn apply_peer_key(
    draft: &mut PeerDraft,
    line: usize,
    key: &str,
    value: &str,
) -> Result<(), SettingsError> {
    match key.to_ascii_lowercase().as_str() {
        "publickey" => draft.public_key = Some(parse_key(line, key, value)?),
        "presharedkey" => draft.preshared_key = Some(parse_key(line, key, value)?),
        "allowedips" => draft.allowed_ips.extend(parse_cidrs(line, key, value)?),
        "endpoint" => {
            draft.endpoint = Some(Endpoint::parse(value).map_err(|e| invalid(line, key, e))?)
        }
        "persistentkeepalive" => {
            draft.persistent_keepalive = if value.eq_ignore_ascii_case("off") {
                Some(0)
            } else {
                Some(parse_u16(line, key, value)?)
            };
        }
        _ => {
            return Err(SettingsError::UnknownKey {
                line,
                section: Section::Peer.name().to_string(),
                key: key.to_string(),
            });
        }
    }
    Ok(())
}
