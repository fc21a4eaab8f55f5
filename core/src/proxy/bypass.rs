//! Proxy exception matching.

use std::net::Ipv4Addr;

/// Splits a `no_proxy` style comma separated list.
pub fn split_no_proxy(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn cidr_contains(network: &str, prefix: &str, host: &str) -> bool {
    let (Ok(network), Ok(prefix), Ok(host)) = (
        network.parse::<Ipv4Addr>(),
        prefix.parse::<u32>(),
        host.parse::<Ipv4Addr>(),
    ) else {
        return false;
    };
    if prefix > 32 {
        return false;
    }
    let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
    (u32::from(network) & mask) == (u32::from(host) & mask)
}

/// POSIX-style exceptions: exact host, subdomain of an entry, or an IPv4
/// network in CIDR notation. A lone `*` matches everything.
pub fn posix_matches(exceptions: &[String], host: &str) -> bool {
    exceptions.iter().any(|entry| {
        let entry = entry.trim();
        if entry == "*" || entry == host {
            return true;
        }
        let domain = entry.trim_start_matches('.');
        if !domain.is_empty() && host.ends_with(&format!(".{domain}")) {
            return true;
        }
        match entry.split_once('/') {
            Some((network, prefix)) => cidr_contains(network, prefix, host),
            None => false,
        }
    })
}

/// Windows `ProxyOverride` list (`;` separated): `<local>` covers loopback,
/// `*.suffix` and `prefix.*` wildcards, otherwise exact match.
pub fn windows_matches(proxy_override: &str, host: &str) -> bool {
    proxy_override.split(';').map(str::trim).any(|entry| {
        if entry == "<local>" && (host == "127.0.0.1" || host == "::1") {
            return true;
        }
        if entry == host {
            return true;
        }
        if let Some(suffix) = entry.strip_prefix('*') {
            if suffix.starts_with('.') && host.ends_with(suffix) {
                return true;
            }
        }
        if let Some(prefix) = entry.strip_suffix('*') {
            if prefix.ends_with('.') && host.starts_with(prefix) {
                return true;
            }
        }
        false
    })
}
