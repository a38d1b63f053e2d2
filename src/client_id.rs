//! Best-effort client identification from proxy headers.
//!
//! Nothing here is authenticated: the values are only trustworthy when a
//! reverse proxy in front of the service overwrites them. Without one, every
//! direct client lands in the shared `anonymous` bucket.

use axum::http::HeaderMap;

pub const FORWARDED_FOR: &str = "x-forwarded-for";
pub const REAL_IP: &str = "x-real-ip";
pub const ANONYMOUS: &str = "anonymous";

/// Resolve the rate-limit bucket key for a request.
pub fn resolve_client_identifier(headers: &HeaderMap) -> String {
    if let Some(first) = header_str(headers, FORWARDED_FOR)
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return first.to_string();
    }

    if let Some(real_ip) = header_str(headers, REAL_IP)
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        return real_ip.to_string();
    }

    ANONYMOUS.to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
