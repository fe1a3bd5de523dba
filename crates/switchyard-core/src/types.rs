//! Shared types used across Switchyard crates.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A normalized route key: `host` or `host/path`, lowercased, without a
/// trailing slash. The host may be a wildcard (`*.example.com`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uri(String);

impl Uri {
    /// Normalize a raw URI string. Returns `None` when nothing routable
    /// remains after trimming.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim().trim_end_matches('/');
        if trimmed.is_empty() || trimmed.starts_with('/') || trimmed.contains(char::is_whitespace) {
            return None;
        }
        Some(Self(trimmed.to_ascii_lowercase()))
    }

    /// Build a key from an already-normalized host and an optional path.
    pub(crate) fn from_parts(host: &str, path: &str) -> Self {
        let path = path.trim_end_matches('/');
        if path.is_empty() {
            Self(host.to_string())
        } else {
            Self(format!("{host}{path}"))
        }
    }

    /// The host portion (everything before the first `/`).
    pub fn host(&self) -> &str {
        self.0.split_once('/').map(|(h, _)| h).unwrap_or(&self.0)
    }

    /// The path portion including its leading `/`, or `""`.
    pub fn path(&self) -> &str {
        self.0.find('/').map(|i| &self.0[i..]).unwrap_or("")
    }

    pub fn is_wildcard(&self) -> bool {
        self.0.starts_with("*.")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Candidate keys for a request, most specific first.
///
/// For `foo.api.example.com` and `/a/b` this yields
/// `foo.api.example.com/a/b`, `foo.api.example.com/a`, `foo.api.example.com`,
/// then the same path ladder for `*.api.example.com`, `*.example.com`
/// and `*.com`.
pub fn lookup_candidates(host: &str, path: &str) -> Vec<Uri> {
    let host = normalize_host(host);
    if host.is_empty() {
        return Vec::new();
    }

    let mut hosts = vec![host.clone()];
    let mut rest = host.as_str();
    while let Some((_, parent)) = rest.split_once('.') {
        if parent.is_empty() {
            break;
        }
        hosts.push(format!("*.{parent}"));
        rest = parent;
    }

    let path = path.split(['?', '#']).next().unwrap_or("").to_ascii_lowercase();
    let mut prefixes = Vec::new();
    let mut current = path.trim_end_matches('/');
    while !current.is_empty() {
        prefixes.push(current.to_string());
        current = match current.rfind('/') {
            Some(i) => &current[..i],
            None => "",
        };
    }
    prefixes.push(String::new());

    hosts
        .iter()
        .flat_map(|h| prefixes.iter().map(move |p| Uri::from_parts(h, p)))
        .collect()
}

/// Lowercase a `Host` header value and strip any port.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = if let Some(rest) = host.strip_prefix('[') {
        // IPv6 literal: [::1]:8080
        rest.split_once(']').map(|(ip, _)| ip).unwrap_or(rest)
    } else {
        match host.rsplit_once(':') {
            Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h,
            _ => host,
        }
    };
    without_port.trim_end_matches('.').to_ascii_lowercase()
}

/// One backend instance registered under a URI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRecord {
    pub address: String,
    pub port: u16,
    /// 0 when the instance offers no TLS port.
    pub tls_port: u16,
    pub instance_id: String,
    /// 0 means "use the configured default".
    pub stale_threshold_secs: u32,
    pub route_service_url: Option<String>,
    pub server_cert_domain_san: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub app_id: Option<String>,
}

impl EndpointRecord {
    pub fn new(address: &str, port: u16, instance_id: &str) -> Self {
        Self {
            address: address.to_string(),
            port,
            instance_id: instance_id.to_string(),
            ..Default::default()
        }
    }

    /// Plaintext `address:port`.
    pub fn canonical_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// `address:tls_port`, when the instance offers TLS.
    pub fn tls_addr(&self) -> Option<String> {
        (self.tls_port != 0).then(|| format!("{}:{}", self.address, self.tls_port))
    }

    /// The per-instance threshold, if the registrant supplied one.
    pub fn stale_threshold(&self) -> Option<Duration> {
        (self.stale_threshold_secs != 0).then(|| Duration::from_secs(u64::from(self.stale_threshold_secs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(host: &str, path: &str) -> Vec<String> {
        lookup_candidates(host, path)
            .into_iter()
            .map(|u| u.to_string())
            .collect()
    }

    #[test]
    fn uri_parse_normalizes() {
        let uri = Uri::parse("  API.Example.com/Foo/ ").unwrap();
        assert_eq!(uri.as_str(), "api.example.com/foo");
        assert_eq!(uri.host(), "api.example.com");
        assert_eq!(uri.path(), "/foo");
    }

    #[test]
    fn uri_parse_rejects_empty_and_pathless() {
        assert!(Uri::parse("").is_none());
        assert!(Uri::parse("   /").is_none());
        assert!(Uri::parse("/just/a/path").is_none());
        assert!(Uri::parse("bad host").is_none());
    }

    #[test]
    fn wildcard_flag() {
        assert!(Uri::parse("*.example.com").unwrap().is_wildcard());
        assert!(!Uri::parse("example.com").unwrap().is_wildcard());
    }

    #[test]
    fn normalize_host_strips_port_and_case() {
        assert_eq!(normalize_host("API.example.com:8080"), "api.example.com");
        assert_eq!(normalize_host("example.com."), "example.com");
        assert_eq!(normalize_host("[::1]:443"), "::1");
        assert_eq!(normalize_host("10.0.0.1"), "10.0.0.1");
    }

    #[test]
    fn candidates_exact_before_wildcard() {
        assert_eq!(
            keys("foo.example.com", "/"),
            vec!["foo.example.com", "*.example.com", "*.com"]
        );
    }

    #[test]
    fn candidates_longest_path_first() {
        assert_eq!(
            keys("a.io", "/x/y?q=1"),
            vec!["a.io/x/y", "a.io/x", "a.io", "*.io/x/y", "*.io/x", "*.io"]
        );
    }

    #[test]
    fn candidates_empty_host() {
        assert!(keys("", "/").is_empty());
    }

    #[test]
    fn record_addresses() {
        let mut record = EndpointRecord::new("10.0.0.1", 8080, "i-1");
        assert_eq!(record.canonical_addr(), "10.0.0.1:8080");
        assert!(record.tls_addr().is_none());

        record.tls_port = 8443;
        assert_eq!(record.tls_addr().as_deref(), Some("10.0.0.1:8443"));
    }

    #[test]
    fn record_stale_threshold_zero_means_default() {
        let mut record = EndpointRecord::new("10.0.0.1", 8080, "i-1");
        assert!(record.stale_threshold().is_none());
        record.stale_threshold_secs = 30;
        assert_eq!(record.stale_threshold(), Some(Duration::from_secs(30)));
    }
}
