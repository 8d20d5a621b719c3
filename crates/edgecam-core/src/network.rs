// ── Network address resolution ──
//
// Devices dial back to the broker and webserver, so they must be given a
// routable address. Loopback-equivalent hosts in the configuration are
// replaced by the address of the outbound interface.

use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs, UdpSocket};

use sysinfo::{Networks, System};
use tracing::debug;

use crate::config::SessionConfig;
use crate::error::CoreError;

/// Interface name prefixes for loopback, container, VM, and VPN links.
const EXCLUDED_IFACE_PREFIXES: &[&str] = &[
    "lo", "docker", "br-", "veth", "virbr", "vmnet", "vbox", "tun", "tap", "ppp", "wg", "zt",
    "utun", "tailscale",
];

/// Probe target for route selection. No packet is sent.
const ROUTE_PROBE: (Ipv4Addr, u16) = (Ipv4Addr::new(8, 8, 8, 8), 80);

fn is_excluded_iface(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    EXCLUDED_IFACE_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Physical interface names, sorted.
pub fn get_network_ifaces() -> Vec<String> {
    let networks = Networks::new_with_refreshed_list();
    let mut names: Vec<String> = networks
        .iter()
        .map(|(name, _)| name.clone())
        .filter(|name| !is_excluded_iface(name))
        .collect();
    names.sort();
    names
}

/// IPv4 address of the interface carrying outbound traffic.
pub fn get_my_ip_by_routing() -> Result<Ipv4Addr, CoreError> {
    match probe_route() {
        Ok(ip) => return Ok(ip),
        Err(e) => debug!(error = %e, "route probe failed, scanning interfaces"),
    }

    let networks = Networks::new_with_refreshed_list();
    let mut candidates: Vec<(&String, Ipv4Addr)> = networks
        .iter()
        .filter(|(name, _)| !is_excluded_iface(name))
        .flat_map(|(name, data)| {
            data.ip_networks().iter().filter_map(move |net| match net.addr {
                IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_link_local() => Some((name, v4)),
                _ => None,
            })
        })
        .collect();
    candidates.sort();

    candidates
        .first()
        .map(|(_, ip)| *ip)
        .ok_or_else(|| CoreError::Network {
            message: "no routable IPv4 address found".into(),
        })
}

fn probe_route() -> std::io::Result<Ipv4Addr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(ROUTE_PROBE)?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() && !ip.is_loopback() => Ok(ip),
        other => Err(std::io::Error::other(format!("unusable source address {other}"))),
    }
}

/// Broker address to hand to the device.
pub fn get_mqtt_ip(config: &SessionConfig) -> Result<String, CoreError> {
    routable_host(&config.mqtt.host)
}

/// Webserver address to hand to the device.
pub fn get_webserver_ip(config: &SessionConfig) -> Result<String, CoreError> {
    routable_host(&config.webserver.host)
}

fn routable_host(host: &str) -> Result<String, CoreError> {
    if is_localhost(host) {
        get_my_ip_by_routing().map(|ip| ip.to_string())
    } else {
        Ok(host.to_string())
    }
}

/// Whether `name` designates this machine through loopback.
///
/// True for `localhost`, loopback literals, the machine's own hostname,
/// and names that resolve to loopback addresses only. Malformed names and
/// lookup failures are `false`.
pub fn is_localhost(name: &str) -> bool {
    let name = name.trim();
    if name.eq_ignore_ascii_case("localhost") {
        return true;
    }
    if let Ok(ip) = name.parse::<IpAddr>() {
        return ip.is_loopback();
    }
    if !is_valid_hostname(name) {
        return false;
    }
    if System::host_name().is_some_and(|host| host.eq_ignore_ascii_case(name)) {
        return true;
    }

    match (name, 0).to_socket_addrs() {
        Ok(addrs) => {
            let addrs: Vec<_> = addrs.collect();
            !addrs.is_empty() && addrs.iter().all(|a| a.ip().is_loopback())
        }
        Err(e) => {
            debug!(name, error = %e, "hostname lookup failed");
            false
        }
    }
}

/// RFC 1123 label rules. All-numeric names that failed to parse as an
/// address are rejected.
fn is_valid_hostname(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    let labels: Vec<&str> = name.split('.').collect();
    let well_formed = labels.iter().all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    });
    let numeric = labels
        .iter()
        .all(|label| label.bytes().all(|b| b.is_ascii_digit()));
    well_formed && !numeric
}
