//! Rendering of [`TunnelSettings`] into device configuration lines.

use super::{SettingsError, TunnelSettings};
use std::fmt::Write as _;

pub(super) fn render(settings: &TunnelSettings) -> Result<String, SettingsError> {
    let mut out = String::new();
    let interface = &settings.interface;

    // Writing to a String cannot fail
    let _ = writeln!(out, "private_key={}", interface.private_key.to_hex());
    if let Some(port) = interface.listen_port {
        let _ = writeln!(out, "listen_port={}", port);
    }
    if let Some(mark) = interface.fwmark {
        let _ = writeln!(out, "fwmark={}", mark);
    }

    out.push_str("replace_peers=true\n");

    for peer in &settings.peers {
        let _ = writeln!(out, "public_key={}", peer.public_key.to_hex());
        if let Some(psk) = &peer.preshared_key {
            let _ = writeln!(out, "preshared_key={}", psk.to_hex());
        }
        if let Some(endpoint) = &peer.endpoint {
            let _ = writeln!(out, "endpoint={}", endpoint.resolve()?);
        }
        if let Some(keepalive) = peer.persistent_keepalive {
            let _ = writeln!(out, "persistent_keepalive_interval={}", keepalive);
        }
        out.push_str("replace_allowed_ips=true\n");
        for allowed in &peer.allowed_ips {
            let _ = writeln!(out, "allowed_ip={}", allowed);
        }
    }

    Ok(out)
}
