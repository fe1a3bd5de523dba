//! Per-request routing.
//!
//! `Proxy::handle` is the whole data-plane decision for one request:
//! answer load-balancer health checks, resolve the host against the
//! route table, send through the pool's route service when it has one,
//! otherwise pick an endpoint round-robin and forward.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri, Version};
use http_body::Body;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use tracing::{debug, info, warn};

use switchyard_core::config::RouteServiceFailurePolicy;
use switchyard_core::{Lifecycle, RouterConfig, Uri as RouteUri};
use switchyard_registry::{InFlightGuard, Pool, RouteTable};

use crate::body::{self, BoxError, GuardedBody, ProxyBody};
use crate::error::{ProxyError, ProxyResult, SignatureError, TlsError};
use crate::forward::{Forwarder, Target};
use crate::headers::{self, HEALTH_CHECK_USER_AGENT, X_CF_FORWARDED_URL, X_CF_PROXY_METADATA,
    X_CF_PROXY_SIGNATURE, X_CF_ROUTERERROR};
use crate::route_service::{RequestMetadata, RouteServiceSigner};
use crate::tls;

/// The accepted connection a request arrived on.
#[derive(Debug, Clone, Copy)]
pub struct ClientInfo {
    pub addr: SocketAddr,
    pub tls: bool,
}

impl ClientInfo {
    pub fn scheme(&self) -> &'static str {
        if self.tls { "https" } else { "http" }
    }
}

pub struct Proxy {
    table: Arc<RouteTable>,
    lifecycle: Lifecycle,
    forwarder: Forwarder,
    signer: Option<RouteServiceSigner>,
    hairpinning: bool,
    failure_policy: RouteServiceFailurePolicy,
    max_conns: usize,
}

/// Enough of a bodiless request to send it again after a route-service
/// transport failure.
struct Replay {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
}

impl Replay {
    fn into_request(self) -> Request<ProxyBody> {
        let mut req = Request::new(body::empty());
        *req.method_mut() = self.method;
        *req.uri_mut() = self.uri;
        *req.version_mut() = self.version;
        *req.headers_mut() = self.headers;
        req
    }
}

impl Proxy {
    pub fn new(
        config: &RouterConfig,
        table: Arc<RouteTable>,
        lifecycle: Lifecycle,
    ) -> Result<Self, TlsError> {
        let forwarder = Forwarder::new(
            tls::client_config(config)?,
            config.backends.enable_tls,
            config.endpoint_dial_timeout,
            config.endpoint_timeout,
        );
        let rs = &config.route_services;
        let signer = rs.enabled().then(|| {
            RouteServiceSigner::new(&rs.secret, Some(rs.secret_previous.as_str()), rs.timeout)
        });

        Ok(Self {
            table,
            lifecycle,
            forwarder,
            signer,
            hairpinning: rs.hairpinning,
            failure_policy: rs.failure_policy,
            max_conns: config.backends.max_conns,
        })
    }

    pub async fn handle<B>(&self, req: Request<B>, client: ClientInfo) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        if is_health_check(req.headers()) {
            return self.health_response();
        }

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        match self.route(req.map(body::boxed), client).await {
            Ok(resp) => {
                debug!(%method, %path, status = resp.status().as_u16(), "proxied");
                resp
            }
            Err(err) => {
                if err.status().is_server_error() {
                    warn!(%method, %path, client = %client.addr, error = %err, "request failed");
                } else {
                    debug!(%method, %path, client = %client.addr, error = %err, "request rejected");
                }
                error_response(&err)
            }
        }
    }

    fn health_response(&self) -> Response<ProxyBody> {
        if self.lifecycle.is_healthy() {
            text_response(StatusCode::OK, "ok\n")
        } else {
            text_response(StatusCode::SERVICE_UNAVAILABLE, "draining\n")
        }
    }

    async fn route(
        &self,
        mut req: Request<ProxyBody>,
        client: ClientInfo,
    ) -> ProxyResult<Response<ProxyBody>> {
        let host = headers::request_host(&req).ok_or(ProxyError::MissingHost)?;
        let (route, pool) = self
            .table
            .resolve(&host, req.uri().path())
            .ok_or_else(|| ProxyError::RouteNotFound(host.clone()))?;

        if let Some(rs_url) = pool.route_service_url() {
            let signer = self.signer.as_ref().ok_or(ProxyError::RouteServiceUnsupported)?;
            if req.headers().contains_key(&X_CF_PROXY_SIGNATURE) {
                self.check_signature(signer, &route, req.headers())?;
                req.headers_mut().remove(&X_CF_PROXY_SIGNATURE);
                req.headers_mut().remove(&X_CF_PROXY_METADATA);
            } else {
                let rs_url = rs_url.to_string();
                return self
                    .via_route_service(signer, &rs_url, &host, &pool, req, client)
                    .await;
            }
        }

        self.to_backend(&host, &pool, req, client).await
    }

    async fn to_backend(
        &self,
        host: &str,
        pool: &Pool,
        req: Request<ProxyBody>,
        client: ClientInfo,
    ) -> ProxyResult<Response<ProxyBody>> {
        let endpoint = pool
            .select_within(self.max_conns)
            .ok_or_else(|| ProxyError::NoAvailableEndpoint(host.to_string()))?;
        let guard = endpoint.acquire();
        let target = self.forwarder.target_for(endpoint.record());

        let req = prepare_upstream(req, client);
        let resp = self.forwarder.send(&target, req).await?;
        Ok(downstream(resp, Some(guard)))
    }

    async fn via_route_service(
        &self,
        signer: &RouteServiceSigner,
        rs_url: &str,
        host: &str,
        pool: &Pool,
        req: Request<ProxyBody>,
        client: ClientInfo,
    ) -> ProxyResult<Response<ProxyBody>> {
        let rs_uri: Uri = rs_url
            .parse()
            .map_err(|_| ProxyError::InvalidRouteServiceUrl(rs_url.to_string()))?;
        let rs_host = rs_uri
            .authority()
            .map(|a| a.as_str().to_string())
            .ok_or_else(|| ProxyError::InvalidRouteServiceUrl(rs_url.to_string()))?;

        let forwarded_url = headers::absolute_url(client.scheme(), host, req.uri());
        let metadata = RequestMetadata {
            client_address: client.addr.ip().to_string(),
            original_host: host.to_string(),
            scheme: client.scheme().to_string(),
            method: req.method().to_string(),
        };
        let signed = signer.sign(&forwarded_url, &metadata)?;

        let replay = (self.failure_policy == RouteServiceFailurePolicy::FallbackToBackend
            && req.body().is_end_stream())
        .then(|| Replay {
            method: req.method().clone(),
            uri: req.uri().clone(),
            version: req.version(),
            headers: req.headers().clone(),
        });

        let (mut parts, body) = req.into_parts();
        parts.uri = rs_uri.clone();
        let headers = &mut parts.headers;
        headers.insert(header::HOST, header_value(&rs_host)?);
        headers.insert(X_CF_FORWARDED_URL, header_value(&forwarded_url)?);
        headers.insert(X_CF_PROXY_SIGNATURE, header_value(&signed.signature)?);
        headers.insert(X_CF_PROXY_METADATA, header_value(&signed.metadata)?);
        let rs_req = prepare_upstream(Request::from_parts(parts, body), client);

        let sent = match self.hairpin_target(&rs_uri) {
            Some((target, guard)) => {
                debug!(route_service = %rs_url, addr = %target.addr, "hairpinning to route service");
                self.forwarder
                    .send(&target, rs_req)
                    .await
                    .map(|resp| downstream(resp, Some(guard)))
            }
            None if rs_uri.scheme_str() != Some("https") => {
                Err(ProxyError::InsecureRouteService(rs_url.to_string()))
            }
            None => {
                let target = Target::from_https_url(&rs_uri)
                    .ok_or_else(|| ProxyError::InvalidRouteServiceUrl(rs_url.to_string()))?;
                self.forwarder
                    .send(&target, rs_req)
                    .await
                    .map(|resp| downstream(resp, None))
            }
        };

        match (sent, replay) {
            (Err(err), Some(replay)) if err.is_transport() => {
                info!(route_service = %rs_url, error = %err, "route service unreachable, falling back to backend");
                self.to_backend(host, pool, replay.into_request(), client).await
            }
            (result, _) => result,
        }
    }

    /// A registered endpoint serving the route service's own URL, when
    /// hairpinning is on and that route is not itself behind a route
    /// service.
    fn hairpin_target(&self, rs_uri: &Uri) -> Option<(Target, InFlightGuard)> {
        if !self.hairpinning {
            return None;
        }
        let pool = self.table.lookup_request(rs_uri.authority()?.as_str(), rs_uri.path())?;
        if pool.route_service_url().is_some() {
            return None;
        }
        let endpoint = pool.select_within(self.max_conns)?;
        let guard = endpoint.acquire();
        Some((self.forwarder.target_for(endpoint.record()), guard))
    }

    /// Validate a request returning from a route service. The forwarded
    /// URL must resolve to the same route the request is addressed to,
    /// so a signature issued for one route cannot open another.
    fn check_signature(
        &self,
        signer: &RouteServiceSigner,
        route: &RouteUri,
        headers: &HeaderMap,
    ) -> ProxyResult<()> {
        let get = |name: &'static str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .ok_or(SignatureError::MissingHeader(name))
        };
        let signature = get("x-cf-proxy-signature")?;
        let metadata = get("x-cf-proxy-metadata")?;
        let forwarded_url = get("x-cf-forwarded-url")?;

        let forwarded: Uri = forwarded_url.parse().map_err(|_| SignatureError::Malformed)?;
        let forwarded_host = forwarded.authority().ok_or(SignatureError::Malformed)?;
        let forwarded_route = self
            .table
            .resolve(forwarded_host.as_str(), forwarded.path())
            .map(|(key, _)| key);
        if forwarded_route.as_ref() != Some(route) {
            return Err(SignatureError::RouteMismatch.into());
        }

        signer.verify(signature, metadata, forwarded_url)?;
        Ok(())
    }
}

fn is_health_check(headers: &HeaderMap) -> bool {
    headers
        .get(header::USER_AGENT)
        .is_some_and(|ua| ua.as_bytes() == HEALTH_CHECK_USER_AGENT.as_bytes())
}

fn header_value(value: &str) -> ProxyResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|_| ProxyError::InvalidRouteServiceUrl(value.to_string()))
}

/// Rewrite a client request for the next hop.
fn prepare_upstream(mut req: Request<ProxyBody>, client: ClientInfo) -> Request<ProxyBody> {
    *req.uri_mut() = headers::origin_form(req.uri());
    *req.version_mut() = Version::HTTP_11;
    let headers = req.headers_mut();
    headers::strip_hop_by_hop(headers);
    headers::append_forwarded(headers, &client.addr.ip().to_string(), client.scheme());
    req
}

/// Turn a backend response into the client response.
fn downstream(resp: Response<Incoming>, guard: Option<InFlightGuard>) -> Response<ProxyBody> {
    let (mut parts, incoming) = resp.into_parts();
    headers::strip_hop_by_hop(&mut parts.headers);
    let body = body::boxed(incoming);
    let body = match guard {
        Some(guard) => GuardedBody::new(body, guard).boxed_unsync(),
        None => body,
    };
    Response::from_parts(parts, body)
}

fn error_response(err: &ProxyError) -> Response<ProxyBody> {
    let mut resp = text_response(err.status(), &format!("{err}\n"));
    resp.headers_mut()
        .insert(X_CF_ROUTERERROR, HeaderValue::from_static(err.router_error()));
    resp
}

fn text_response(status: StatusCode, text: &str) -> Response<ProxyBody> {
    let mut resp = Response::new(body::full(text.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}
