//! Route-service indirection: the first pass goes to the route service
//! over TLS with signed headers, the signed return trip reaches the
//! backend, and a reused or misdirected signature is rejected.

mod common;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use common::*;
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::{Empty, Full};
use hyper::body::Incoming;
use switchyard_core::RouterConfig;
use switchyard_core::config::RouteServiceFailurePolicy;

const SIGNED: [&str; 3] = ["x-cf-forwarded-url", "x-cf-proxy-signature", "x-cf-proxy-metadata"];

type Seen = Arc<Mutex<Vec<HeaderMap>>>;

/// Route service that records the signed headers and sends the request
/// back through the proxy to the forwarded URL.
fn forwarding_route_service(proxy: SocketAddr, seen: Seen) -> Handler {
    Arc::new(move |req: Request<Incoming>| {
        let seen = Arc::clone(&seen);
        Box::pin(async move {
            seen.lock().unwrap().push(req.headers().clone());

            let forwarded: http::Uri = req.headers()["x-cf-forwarded-url"]
                .to_str()
                .unwrap()
                .parse()
                .unwrap();
            let mut back = Request::builder()
                .uri(forwarded.path_and_query().unwrap().as_str())
                .header("host", forwarded.authority().unwrap().as_str());
            for name in SIGNED {
                back = back.header(name, req.headers()[name].clone());
            }
            let reply = send(proxy, back.body(Empty::new()).unwrap()).await;

            let mut resp = Response::builder()
                .status(reply.status)
                .header("x-route-service", "visited");
            if let Some(signed) = reply.headers.get("x-seen-signature") {
                resp = resp.header("x-seen-signature", signed.clone());
            }
            resp.body(Full::new(Bytes::from(reply.body)))
                .unwrap()
        })
    })
}

/// Route service that records the signed headers and answers itself
/// without calling back into the proxy.
fn recording_route_service(seen: Seen) -> Handler {
    Arc::new(move |req: Request<Incoming>| {
        let seen = Arc::clone(&seen);
        Box::pin(async move {
            seen.lock().unwrap().push(req.headers().clone());
            Response::builder()
                .status(200)
                .body(Full::new(Bytes::from("held")))
                .unwrap()
        })
    })
}

fn rs_config(pki: &Pki) -> RouterConfig {
    let mut config = test_config();
    config.route_services.secret = "super-secret".to_string();
    config.ca_certs = pki.ca_pem.clone();
    config
}

async fn spawn_route_service(pki: &Pki, handler: Handler) -> SocketAddr {
    spawn_server(handler, Some(pki.server_config("127.0.0.1"))).await
}

async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn request_travels_through_route_service() {
    let pki = Pki::new();
    let backend = spawn_backend("app").await;
    let proxy = start_proxy(rs_config(&pki)).await;
    let seen = Seen::default();
    let rs = spawn_route_service(&pki, forwarding_route_service(proxy.addr, Arc::clone(&seen))).await;

    let mut reg = registration("127.0.0.1", backend.port(), "app-0", &["app.example.com"]);
    reg["route_service_url"] = format!("https://127.0.0.1:{}/filter", rs.port()).into();
    proxy.register(reg);

    let reply = get(proxy.addr, "app.example.com", "/orders?id=1").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.headers.get("x-route-service").unwrap(), "visited");
    assert_eq!(reply.body, "app");
    assert_eq!(reply.headers.get("x-seen-signature").unwrap(), "false");

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(
        seen[0].get("x-cf-forwarded-url").unwrap(),
        "http://app.example.com/orders?id=1"
    );
    assert!(seen[0].contains_key("x-cf-proxy-signature"));
    assert!(seen[0].contains_key("x-cf-proxy-metadata"));
}

#[tokio::test]
async fn replayed_signature_is_rejected() {
    let pki = Pki::new();
    let backend = spawn_backend("app").await;
    let proxy = start_proxy(rs_config(&pki)).await;
    let seen = Seen::default();
    let rs = spawn_route_service(&pki, forwarding_route_service(proxy.addr, Arc::clone(&seen))).await;

    let mut reg = registration("127.0.0.1", backend.port(), "app-0", &["app.example.com"]);
    reg["route_service_url"] = format!("https://127.0.0.1:{}", rs.port()).into();
    proxy.register(reg);

    assert_eq!(get(proxy.addr, "app.example.com", "/").await.status, StatusCode::OK);

    let headers = seen.lock().unwrap()[0].clone();
    let mut replay = Request::builder().uri("/").header("host", "app.example.com");
    for name in SIGNED {
        replay = replay.header(name, headers[name].clone());
    }
    let reply = send(proxy.addr, replay.body(Empty::new()).unwrap()).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        reply.headers.get("x-cf-routererror").unwrap(),
        "route_service_request_invalid"
    );
}

#[tokio::test]
async fn signature_for_one_route_does_not_open_another() {
    let pki = Pki::new();
    let backend_a = spawn_backend("a-protected").await;
    let backend_b = spawn_backend("b-protected").await;
    let proxy = start_proxy(rs_config(&pki)).await;

    let seen_a = Seen::default();
    let seen_b = Seen::default();
    let rs_a = spawn_route_service(&pki, recording_route_service(Arc::clone(&seen_a))).await;
    let rs_b = spawn_route_service(&pki, recording_route_service(Arc::clone(&seen_b))).await;

    let mut reg = registration("127.0.0.1", backend_a.port(), "a-0", &["a.example.com"]);
    reg["route_service_url"] = format!("https://127.0.0.1:{}", rs_a.port()).into();
    proxy.register(reg);
    let mut reg = registration("127.0.0.1", backend_b.port(), "b-0", &["b.example.com"]);
    reg["route_service_url"] = format!("https://127.0.0.1:{}", rs_b.port()).into();
    proxy.register(reg);

    let reply = get(proxy.addr, "a.example.com", "/").await;
    assert_eq!(reply.body, "held");

    // A's unused signature, presented to B.
    let headers = seen_a.lock().unwrap()[0].clone();
    let mut misdirected = Request::builder().uri("/").header("host", "b.example.com");
    for name in SIGNED {
        misdirected = misdirected.header(name, headers[name].clone());
    }
    let reply = send(proxy.addr, misdirected.body(Empty::new()).unwrap()).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        reply.headers.get("x-cf-routererror").unwrap(),
        "route_service_request_invalid"
    );
    assert_ne!(reply.body, "b-protected");
    assert!(seen_b.lock().unwrap().is_empty());

    // The same signature is still good for the route it was issued for.
    let mut returning = Request::builder().uri("/").header("host", "a.example.com");
    for name in SIGNED {
        returning = returning.header(name, headers[name].clone());
    }
    let reply = send(proxy.addr, returning.body(Empty::new()).unwrap()).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, "a-protected");
}

#[tokio::test]
async fn plaintext_route_service_is_never_dialed() {
    let pki = Pki::new();
    let backend = spawn_backend("app").await;
    let proxy = start_proxy(rs_config(&pki)).await;
    let seen = Seen::default();
    let rs = spawn_server(recording_route_service(Arc::clone(&seen)), None).await;

    let mut reg = registration("127.0.0.1", backend.port(), "app-0", &["app.example.com"]);
    reg["route_service_url"] = format!("http://127.0.0.1:{}", rs.port()).into();
    proxy.register(reg);

    let reply = get(proxy.addr, "app.example.com", "/").await;
    assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
    assert_eq!(
        reply.headers.get("x-cf-routererror").unwrap(),
        "route_service_unsupported"
    );
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unreachable_route_service_fails_by_default() {
    let pki = Pki::new();
    let backend = spawn_backend("app").await;
    let closed = closed_port().await;
    let proxy = start_proxy(rs_config(&pki)).await;

    let mut reg = registration("127.0.0.1", backend.port(), "app-0", &["app.example.com"]);
    reg["route_service_url"] = format!("https://127.0.0.1:{closed}").into();
    proxy.register(reg);

    let reply = get(proxy.addr, "app.example.com", "/").await;
    assert_eq!(reply.status, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn unreachable_route_service_can_fall_back() {
    let pki = Pki::new();
    let backend = spawn_backend("app").await;
    let closed = closed_port().await;
    let mut config = rs_config(&pki);
    config.route_services.failure_policy = RouteServiceFailurePolicy::FallbackToBackend;
    let proxy = start_proxy(config).await;

    let mut reg = registration("127.0.0.1", backend.port(), "app-0", &["app.example.com"]);
    reg["route_service_url"] = format!("https://127.0.0.1:{closed}").into();
    proxy.register(reg);

    let reply = get(proxy.addr, "app.example.com", "/").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, "app");
}

#[tokio::test]
async fn hairpinned_route_service_is_reached_through_the_table() {
    let pki = Pki::new();
    let backend = spawn_backend("app").await;
    let proxy = start_proxy(rs_config(&pki)).await;
    let seen = Seen::default();
    let rs = spawn_server(forwarding_route_service(proxy.addr, Arc::clone(&seen)), None).await;

    // The route service is itself a registered app; its URL does not
    // resolve anywhere but this router's table.
    proxy.register(registration("127.0.0.1", rs.port(), "rs-0", &["filter.internal.test"]));
    let mut reg = registration("127.0.0.1", backend.port(), "app-0", &["app.example.com"]);
    reg["route_service_url"] = "https://filter.internal.test".into();
    proxy.register(reg);

    let reply = get(proxy.addr, "app.example.com", "/").await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, "app");
    assert_eq!(seen.lock().unwrap().len(), 1);
}
