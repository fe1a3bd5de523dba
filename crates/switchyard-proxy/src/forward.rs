//! Backend connections.
//!
//! One request per connection: dial (bounded by `endpoint_dial_timeout`),
//! optionally wrap in TLS, HTTP/1.1 handshake, then wait for the
//! response head (bounded by `endpoint_timeout`). Failures are never
//! retried against another endpoint.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use http::{Request, Response};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use switchyard_core::EndpointRecord;

use crate::body::ProxyBody;
use crate::error::{ProxyError, ProxyResult};

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// `host:port`
    pub addr: String,
    /// Name the server certificate must match; `None` for plaintext.
    pub server_name: Option<String>,
}

impl Target {
    pub fn plain(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            server_name: None,
        }
    }

    pub fn tls(addr: impl Into<String>, server_name: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            server_name: Some(server_name.into()),
        }
    }

    /// TLS target for an absolute `https://` URL. Any other scheme
    /// yields `None`.
    pub fn from_https_url(url: &http::Uri) -> Option<Self> {
        if url.scheme_str() != Some("https") {
            return None;
        }
        let host = url.host()?;
        let port = url.port_u16().unwrap_or(443);
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        let addr = if bare.contains(':') {
            format!("[{bare}]:{port}")
        } else {
            format!("{bare}:{port}")
        };
        Some(Self::tls(addr, bare))
    }
}

pub struct Forwarder {
    connector: TlsConnector,
    backend_tls: bool,
    dial_timeout: Duration,
    response_timeout: Duration,
}

impl Forwarder {
    pub fn new(
        tls: Arc<ClientConfig>,
        backend_tls: bool,
        dial_timeout: Duration,
        response_timeout: Duration,
    ) -> Self {
        Self {
            connector: TlsConnector::from(tls),
            backend_tls,
            dial_timeout,
            response_timeout,
        }
    }

    /// How to reach a registered endpoint. The TLS port is used when
    /// backend TLS is enabled, or when it is the only port advertised.
    pub fn target_for(&self, record: &EndpointRecord) -> Target {
        match record.tls_addr() {
            Some(addr) if self.backend_tls || record.port == 0 => {
                let name = record
                    .server_cert_domain_san
                    .clone()
                    .unwrap_or_else(|| record.address.clone());
                Target::tls(addr, name)
            }
            _ => Target::plain(record.canonical_addr()),
        }
    }

    pub async fn send(
        &self,
        target: &Target,
        req: Request<ProxyBody>,
    ) -> ProxyResult<Response<Incoming>> {
        let addr = target.addr.as_str();
        let tcp = match timeout(self.dial_timeout, TcpStream::connect(addr)).await {
            Err(_) => {
                return Err(ProxyError::BackendTimeout {
                    addr: addr.to_string(),
                    stage: "dial",
                });
            }
            Ok(Err(e)) => return Err(unavailable(addr, e)),
            Ok(Ok(stream)) => stream,
        };
        let _ = tcp.set_nodelay(true);

        let Some(name) = &target.server_name else {
            return self.exchange(tcp, addr, req).await;
        };

        let server_name = ServerName::try_from(name.clone()).map_err(|e| {
            ProxyError::BackendTlsVerificationFailed {
                addr: addr.to_string(),
                reason: format!("invalid server name {name}: {e}"),
            }
        })?;
        let tls = match timeout(self.dial_timeout, self.connector.connect(server_name, tcp)).await {
            Err(_) => {
                return Err(ProxyError::BackendTimeout {
                    addr: addr.to_string(),
                    stage: "dial",
                });
            }
            Ok(Err(e)) => return Err(tls_failure(addr, e)),
            Ok(Ok(stream)) => stream,
        };
        self.exchange(tls, addr, req).await
    }

    async fn exchange<S>(
        &self,
        stream: S,
        addr: &str,
        req: Request<ProxyBody>,
    ) -> ProxyResult<Response<Incoming>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| unavailable(addr, e))?;

        // Drive the connection in the background.
        let peer = addr.to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(addr = %peer, error = %e, "backend connection ended");
            }
        });

        match timeout(self.response_timeout, sender.send_request(req)).await {
            Err(_) => Err(ProxyError::BackendTimeout {
                addr: addr.to_string(),
                stage: "response",
            }),
            Ok(Err(e)) => Err(unavailable(addr, e)),
            Ok(Ok(resp)) => Ok(resp),
        }
    }
}

fn unavailable(addr: &str, err: impl std::fmt::Display) -> ProxyError {
    ProxyError::BackendUnavailable {
        addr: addr.to_string(),
        reason: err.to_string(),
    }
}

/// rustls reports handshake failures as `io::Error`s wrapping a
/// `rustls::Error`; anything else is a plain transport failure.
fn tls_failure(addr: &str, err: io::Error) -> ProxyError {
    match err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
    {
        Some(tls) => ProxyError::BackendTlsVerificationFailed {
            addr: addr.to_string(),
            reason: tls.to_string(),
        },
        None => unavailable(addr, err),
    }
}
