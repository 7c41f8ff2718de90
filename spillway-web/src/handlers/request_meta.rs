//! Request identity and client address helpers for access logging.

use std::net::IpAddr;

use axum::http::HeaderMap;
use uuid::Uuid;

/// Returns the inbound `X-Request-ID`, or generates a fresh one so every
/// log line of a request can be correlated.
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string())
}

/// Best-effort client IP and a coarse prefix range (/24 for IPv4, /64 for
/// IPv6), taken from `X-Real-IP` or the first `X-Forwarded-For` hop.
pub fn client_ip(headers: &HeaderMap) -> (String, String) {
    let ip = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .or_else(|| {
            headers
                .get("x-forwarded-for")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').next())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        })
        .unwrap_or_default()
        .to_string();
    let range = prefix_range(&ip);
    (ip, range)
}

fn prefix_range(ip: &str) -> String {
    match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            let octets = v4.octets();
            format!("{}.{}.{}.0/24", octets[0], octets[1], octets[2])
        }
        Ok(IpAddr::V6(v6)) => {
            let segments = v6.segments();
            format!(
                "{:x}:{:x}:{:x}:{:x}::/64",
                segments[0], segments[1], segments[2], segments[3]
            )
        }
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_request_id_passes_through_or_generates() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("abc-123"));
        assert_eq!(request_id(&headers), "abc-123");

        let generated = request_id(&HeaderMap::new());
        assert!(!generated.is_empty());
        assert_ne!(generated, request_id(&HeaderMap::new()));
    }

    #[test]
    fn test_client_ip_prefers_real_ip_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("203.0.113.9"));
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("198.51.100.1, 10.0.0.1"),
        );

        let (ip, range) = client_ip(&headers);
        assert_eq!(ip, "203.0.113.9");
        assert_eq!(range, "203.0.113.0/24");
    }

    #[test]
    fn test_client_ip_falls_back_to_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("198.51.100.1, 10.0.0.1"),
        );

        let (ip, range) = client_ip(&headers);
        assert_eq!(ip, "198.51.100.1");
        assert_eq!(range, "198.51.100.0/24");
    }

    #[test]
    fn test_ipv6_gets_a_64_prefix() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-real-ip",
            HeaderValue::from_static("2001:db8:85a3:8d3:1319:8a2e:370:7348"),
        );

        let (_, range) = client_ip(&headers);
        assert_eq!(range, "2001:db8:85a3:8d3::/64");
    }

    #[test]
    fn test_unknown_ip_yields_empty_range() {
        let (ip, range) = client_ip(&HeaderMap::new());
        assert!(ip.is_empty());
        assert!(range.is_empty());
    }
}
