//! Client identity resolution for rate limiting

use axum::http::HeaderMap;
use std::net::{IpAddr, SocketAddr};

/// Identity used when neither headers nor the transport yield an address.
pub const UNKNOWN_CLIENT: &str = "unknown-client";

const CF_CONNECTING_IP: &str = "cf-connecting-ip";
const CF_IPCOUNTRY: &str = "cf-ipcountry";
const X_REAL_IP: &str = "x-real-ip";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Resolve the identity key for a request.
///
/// With `trust_proxy` off the transport address is used unconditionally.
/// Otherwise headers are consulted in order: `CF-Connecting-IP`, then
/// `X-Forwarded-For` when the request came through Cloudflare, then
/// `X-Real-IP`, then the left-most `X-Forwarded-For` entry. Malformed values
/// are skipped.
pub fn resolve(headers: &HeaderMap, remote: Option<SocketAddr>, trust_proxy: bool) -> String {
    if trust_proxy {
        if let Some(ip) = header_ip(headers, CF_CONNECTING_IP) {
            return ip;
        }
        if headers.contains_key(CF_IPCOUNTRY) {
            if let Some(ip) = forwarded_for(headers) {
                return ip;
            }
        }
        if let Some(ip) = header_ip(headers, X_REAL_IP) {
            return ip;
        }
        if let Some(ip) = forwarded_for(headers) {
            return ip;
        }
    }

    match remote {
        Some(addr) => canonical(addr.ip()),
        None => UNKNOWN_CLIENT.to_string(),
    }
}

/// Parse and normalise a textual IP address.
///
/// IPv4-mapped IPv6 addresses collapse to their IPv4 form and IPv6 is printed
/// in its compressed lower-case form, so every spelling of one address yields
/// one key.
pub fn normalize(raw: &str) -> Option<String> {
    let raw = raw.trim();
    // Bracketed IPv6, as some proxies emit it
    let raw = raw
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(raw);
    raw.parse::<IpAddr>().ok().map(canonical)
}

fn canonical(ip: IpAddr) -> String {
    ip.to_canonical().to_string()
}

fn header_ip(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(normalize)
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(normalize)
}
