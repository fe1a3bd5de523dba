//! Shared harness for the end-to-end proxy tests: a running proxy on an
//! ephemeral port, hyper stub servers, and a one-shot HTTP client.

#![allow(dead_code)]

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls::ServerConfig;
use rustls::server::WebPkiClientVerifier;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

use switchyard_core::{Lifecycle, RouterConfig, RouterStart};
use switchyard_mbus::RegistryHandler;
use switchyard_proxy::tls::{load_certs, load_key};
use switchyard_proxy::{ConnectionTracker, Proxy, ProxyServer};
use switchyard_registry::RouteTable;

pub type Handler = Arc<
    dyn Fn(Request<Incoming>) -> Pin<Box<dyn Future<Output = Response<Full<Bytes>>> + Send>>
        + Send
        + Sync,
>;

pub struct Harness {
    pub addr: SocketAddr,
    pub table: Arc<RouteTable>,
    pub lifecycle: Lifecycle,
    pub connections: ConnectionTracker,
    pub bus: RegistryHandler,
}

impl Harness {
    /// Apply a `router.register` payload as if it came off the bus.
    pub fn register(&self, payload: serde_json::Value) {
        self.bus
            .handle("router.register", payload.to_string().as_bytes())
            .unwrap();
    }

    pub fn unregister(&self, payload: serde_json::Value) {
        self.bus
            .handle("router.unregister", payload.to_string().as_bytes())
            .unwrap();
    }
}

pub fn test_config() -> RouterConfig {
    RouterConfig {
        endpoint_dial_timeout: Duration::from_secs(2),
        endpoint_timeout: Duration::from_secs(5),
        ..RouterConfig::default()
    }
}

pub async fn start_proxy(config: RouterConfig) -> Harness {
    let table = Arc::new(RouteTable::new(config.droplet_stale_threshold));
    let lifecycle = Lifecycle::new();
    let connections = ConnectionTracker::new();

    let proxy = Arc::new(Proxy::new(&config, Arc::clone(&table), lifecycle.clone()).unwrap());
    let server = ProxyServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        proxy,
        lifecycle.clone(),
        connections.clone(),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.serve());

    let start = RouterStart {
        id: "test-router".to_string(),
        hosts: vec!["127.0.0.1".to_string()],
        minimum_register_interval_secs: 20,
        prune_threshold_secs: 120,
    };
    let bus = RegistryHandler::new(Arc::clone(&table), lifecycle.clone(), &start);

    Harness {
        addr,
        table,
        lifecycle,
        connections,
        bus,
    }
}

/// Serve `handler` on an ephemeral port, with TLS when `tls` is given.
pub async fn spawn_server(handler: Handler, tls: Option<Arc<rustls::ServerConfig>>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = tls.map(TlsAcceptor::from);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = handler.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let svc = service_fn(move |req| {
                    let handler = handler.clone();
                    async move { Ok::<_, Infallible>(handler(req).await) }
                });
                match acceptor {
                    Some(acceptor) => {
                        if let Ok(stream) = acceptor.accept(stream).await {
                            let _ = http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), svc)
                                .await;
                        }
                    }
                    None => {
                        let _ = http1::Builder::new()
                            .serve_connection(TokioIo::new(stream), svc)
                            .await;
                    }
                }
            });
        }
    });

    addr
}

/// Backend that answers `200 <name>` and reports what it saw in
/// `x-seen-*` response headers.
pub fn named(name: &'static str) -> Handler {
    Arc::new(move |req: Request<Incoming>| {
        Box::pin(async move {
            let mut resp = Response::builder().status(200);
            if let Some(xff) = req.headers().get("x-forwarded-for") {
                resp = resp.header("x-seen-forwarded-for", xff);
            }
            if let Some(proto) = req.headers().get("x-forwarded-proto") {
                resp = resp.header("x-seen-proto", proto);
            }
            let signed = req.headers().contains_key("x-cf-proxy-signature");
            resp.header("x-seen-signature", signed.to_string())
                .header("x-seen-path", req.uri().to_string())
                .body(Full::new(Bytes::from(name)))
                .unwrap()
        })
    })
}

pub async fn spawn_backend(name: &'static str) -> SocketAddr {
    spawn_server(named(name), None).await
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

/// Send one request over a fresh connection.
pub async fn send(addr: SocketAddr, req: Request<Empty<Bytes>>) -> Reply {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let resp = sender.send_request(req).await.unwrap();
    let (parts, body) = resp.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    Reply {
        status: parts.status,
        headers: parts.headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    }
}

pub async fn get(addr: SocketAddr, host: &str, path: &str) -> Reply {
    let req = Request::builder()
        .uri(path)
        .header("host", host)
        .body(Empty::new())
        .unwrap();
    send(addr, req).await
}

pub fn registration(host: &str, port: u16, id: &str, uris: &[&str]) -> serde_json::Value {
    serde_json::json!({
        "host": host,
        "port": port,
        "uris": uris,
        "private_instance_id": id,
    })
}

/// Throwaway CA for TLS backends and route services.
pub struct Pki {
    pub ca_pem: String,
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
}

impl Pki {
    pub fn new() -> Self {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, "Switchyard Test CA");
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = params.self_signed(&ca_key).unwrap();
        Self {
            ca_pem: ca_cert.pem(),
            ca_cert,
            ca_key,
        }
    }

    /// Leaf certificate for `san`, signed by this CA: (cert, key) PEM.
    pub fn issue(&self, san: &str) -> (String, String) {
        let params = CertificateParams::new(vec![san.to_string()]).unwrap();
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    /// TLS config for a server presenting a certificate for `san`.
    pub fn server_config(&self, san: &str) -> Arc<ServerConfig> {
        let (cert, key) = self.issue(san);
        let config = ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(load_certs(&cert, "cert").unwrap(), load_key(&key, "key").unwrap())
        .unwrap();
        Arc::new(config)
    }

    /// TLS config for a backend that requires a client certificate
    /// issued by this CA.
    pub fn backend_config(&self, san: &str) -> Arc<ServerConfig> {
        let (cert, key) = self.issue(san);
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = rustls::RootCertStore::empty();
        for ca in load_certs(&self.ca_pem, "ca").unwrap() {
            roots.add(ca).unwrap();
        }
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
            .build()
            .unwrap();

        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_client_cert_verifier(verifier)
            .with_single_cert(load_certs(&cert, "cert").unwrap(), load_key(&key, "key").unwrap())
            .unwrap();
        Arc::new(config)
    }
}
