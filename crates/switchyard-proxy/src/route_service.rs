//! Route-service signatures.
//!
//! When a route has a route service, the first pass through the router
//! sends the request to that service with three headers:
//!
//! - `X-CF-Forwarded-Url`: the URL the client asked for
//! - `X-CF-Proxy-Metadata`: base64 JSON describing the original request
//! - `X-CF-Proxy-Signature`: `payload.mac`, where `payload` is base64
//!   JSON `{forwarded_url, requested_at, nonce}` and `mac` is
//!   HMAC-SHA256 over `payload.metadata`
//!
//! When the service sends the request back, a valid, unexpired,
//! never-seen signature lets it through to the backend. Every nonce is
//! accepted exactly once, so a request can never loop through the route
//! service twice on the same signature.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::SignatureError;

type HmacSha256 = Hmac<Sha256>;

/// Number of remembered nonces above which expired ones are swept.
const SWEEP_AT: usize = 4096;

/// Client-side facts about the original request, carried through the
/// route service and covered by the MAC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub client_address: String,
    pub original_host: String,
    pub scheme: String,
    pub method: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SignedPayload {
    forwarded_url: String,
    /// Milliseconds since the Unix epoch.
    requested_at: u64,
    nonce: String,
}

/// Header values produced for one indirection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub signature: String,
    pub metadata: String,
}

pub struct RouteServiceSigner {
    secret: Vec<u8>,
    previous: Option<Vec<u8>>,
    timeout: Duration,
    seen: DashMap<String, u64>,
}

impl RouteServiceSigner {
    /// `previous` is accepted when verifying, never used for signing.
    pub fn new(secret: &str, previous: Option<&str>, timeout: Duration) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            previous: previous
                .filter(|p| !p.is_empty())
                .map(|p| p.as_bytes().to_vec()),
            timeout,
            seen: DashMap::new(),
        }
    }

    pub fn sign(
        &self,
        forwarded_url: &str,
        metadata: &RequestMetadata,
    ) -> Result<SignedHeaders, SignatureError> {
        self.sign_at(forwarded_url, metadata, now_millis())
    }

    pub fn sign_at(
        &self,
        forwarded_url: &str,
        metadata: &RequestMetadata,
        now_ms: u64,
    ) -> Result<SignedHeaders, SignatureError> {
        let mut nonce = [0u8; 16];
        getrandom::getrandom(&mut nonce).map_err(|e| SignatureError::Random(e.to_string()))?;

        let payload = SignedPayload {
            forwarded_url: forwarded_url.to_string(),
            requested_at: now_ms,
            nonce: hex::encode(nonce),
        };
        let payload = URL_SAFE_NO_PAD.encode(to_json(&payload)?);
        let metadata = URL_SAFE_NO_PAD.encode(to_json(metadata)?);

        let tag = mac(&self.secret, &payload, &metadata)?.finalize().into_bytes();
        Ok(SignedHeaders {
            signature: format!("{payload}.{}", URL_SAFE_NO_PAD.encode(tag)),
            metadata,
        })
    }

    pub fn verify(
        &self,
        signature: &str,
        metadata: &str,
        forwarded_url: &str,
    ) -> Result<RequestMetadata, SignatureError> {
        self.verify_at(signature, metadata, forwarded_url, now_millis())
    }

    /// Check a returning request's headers. On success the signature's
    /// nonce is consumed.
    pub fn verify_at(
        &self,
        signature: &str,
        metadata: &str,
        forwarded_url: &str,
        now_ms: u64,
    ) -> Result<RequestMetadata, SignatureError> {
        let (payload_b64, tag_b64) = signature.split_once('.').ok_or(SignatureError::Malformed)?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag_b64)
            .map_err(|_| SignatureError::Malformed)?;

        let keys = std::iter::once(&self.secret).chain(self.previous.as_ref());
        let mut authentic = false;
        for key in keys {
            if mac(key, payload_b64, metadata)?.verify_slice(&tag).is_ok() {
                authentic = true;
                break;
            }
        }
        if !authentic {
            return Err(SignatureError::BadSignature);
        }

        let payload: SignedPayload = from_b64_json(payload_b64)?;
        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        if now_ms > payload.requested_at.saturating_add(timeout_ms) {
            return Err(SignatureError::Expired);
        }
        if payload.forwarded_url != forwarded_url {
            return Err(SignatureError::UrlMismatch);
        }
        let metadata: RequestMetadata = from_b64_json(metadata)?;

        if self.seen.len() >= SWEEP_AT {
            self.seen.retain(|_, expires_at| *expires_at >= now_ms);
        }
        match self.seen.entry(payload.nonce) {
            Entry::Occupied(_) => Err(SignatureError::Replayed),
            Entry::Vacant(entry) => {
                entry.insert(payload.requested_at.saturating_add(timeout_ms));
                Ok(metadata)
            }
        }
    }

    /// Nonces currently remembered for replay detection.
    pub fn remembered(&self) -> usize {
        self.seen.len()
    }
}

fn mac(key: &[u8], payload: &str, metadata: &str) -> Result<HmacSha256, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| SignatureError::Malformed)?;
    mac.update(payload.as_bytes());
    mac.update(b".");
    mac.update(metadata.as_bytes());
    Ok(mac)
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, SignatureError> {
    serde_json::to_vec(value).map_err(|_| SignatureError::Malformed)
}

fn from_b64_json<T: for<'de> Deserialize<'de>>(encoded: &str) -> Result<T, SignatureError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| SignatureError::Malformed)?;
    serde_json::from_slice(&bytes).map_err(|_| SignatureError::Malformed)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
