//! Header names and forwarding rewrites.

use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::uri::Uri;
use http::Request;

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_CF_ROUTERERROR: HeaderName = HeaderName::from_static("x-cf-routererror");
pub const X_CF_FORWARDED_URL: HeaderName = HeaderName::from_static("x-cf-forwarded-url");
pub const X_CF_PROXY_SIGNATURE: HeaderName = HeaderName::from_static("x-cf-proxy-signature");
pub const X_CF_PROXY_METADATA: HeaderName = HeaderName::from_static("x-cf-proxy-metadata");

/// User agent of load-balancer health checks answered by the proxy itself.
pub const HEALTH_CHECK_USER_AGENT: &str = "HTTP-Monitor/1.1";

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Drop hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
    headers.remove(HeaderName::from_static("proxy-connection"));
}

/// Append the client address to `X-Forwarded-For` and set
/// `X-Forwarded-Proto` unless an upstream proxy already did.
pub fn append_forwarded(headers: &mut HeaderMap, client_ip: &str, scheme: &str) {
    let forwarded_for = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing}, {client_ip}"),
        _ => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if !headers.contains_key(&X_FORWARDED_PROTO) {
        if let Ok(value) = HeaderValue::from_str(scheme) {
            headers.insert(X_FORWARDED_PROTO, value);
        }
    }
}

/// Request host: the `Host` header, else the URI authority.
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
        .filter(|h| !h.trim().is_empty())
}

/// Reduce a request URI to origin form (`/path?query`).
pub fn origin_form(uri: &Uri) -> Uri {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    path.parse().unwrap_or_else(|_| Uri::from_static("/"))
}

/// Full URL the client asked for, as sent to route services.
pub fn absolute_url(scheme: &str, host: &str, uri: &Uri) -> String {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{scheme}://{host}{path}")
}
