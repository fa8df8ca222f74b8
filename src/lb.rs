use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use pingora::http::{RequestHeader, ResponseHeader};
use pingora::prelude::*;

use crate::metric::Metrics;
use crate::registry::DomainRegistry;
use crate::upstream::Upstream;

/// Metrics key for requests whose host matched no domain.
pub const UNROUTED_DOMAIN: &str = "<unrouted>";

/// Per-request routing state.
pub struct RouteCtx {
    domain: Option<String>,
    upstream: Option<Arc<Upstream>>,
    started: Instant,
}

/// Host used for routing: the `Host` header, else the URI authority.
pub fn route_host<'a>(host_header: Option<&'a str>, authority: Option<&'a str>) -> Option<&'a str> {
    let host = host_header.or(authority)?.trim();
    (!host.is_empty()).then_some(host)
}

/// Dispatches requests by host into the matching domain's balancer.
pub struct Ingress {
    registry: Arc<DomainRegistry>,
    metrics: Arc<Metrics>,
}

impl Ingress {
    pub fn new(registry: Arc<DomainRegistry>, metrics: Arc<Metrics>) -> Self {
        Self { registry, metrics }
    }
}

async fn respond(session: &mut Session, status: u16) -> Result<()> {
    let mut header = ResponseHeader::build(status, None)?;
    header.insert_header("Content-Length", "0")?;
    session.set_keepalive(None);
    session
        .write_response_header(Box::new(header), true)
        .await
}

#[async_trait]
impl ProxyHttp for Ingress {
    type CTX = RouteCtx;

    fn new_ctx(&self) -> Self::CTX {
        RouteCtx {
            domain: None,
            upstream: None,
            started: Instant::now(),
        }
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool>
    where
        Self::CTX: Send + Sync,
    {
        let req = session.req_header();
        let host = route_host(
            req.headers.get("host").and_then(|v| v.to_str().ok()),
            req.uri.authority().map(|a| a.as_str()),
        )
        .map(str::to_string);

        let Some(host) = host else {
            respond(session, 404).await?;
            return Ok(true);
        };

        let domain = self.registry.match_host(&host).to_string();
        match self.registry.route(&domain) {
            Ok(upstream) => {
                ctx.domain = Some(domain);
                ctx.upstream = Some(upstream);
                Ok(false)
            }
            Err(e) => {
                log::debug!("request.unrouted host={}: {}", host, e);
                respond(session, e.status()).await?;
                Ok(true)
            }
        }
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let upstream = ctx
            .upstream
            .as_ref()
            .ok_or_else(|| Error::explain(ErrorType::InternalError, "no upstream selected"))?;

        let peer = upstream.peer().await.map_err(|e| {
            Error::explain(
                ErrorType::InternalError,
                format!("cannot resolve upstream {}: {e}", upstream.endpoint),
            )
        })?;
        Ok(Box::new(peer))
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()>
    where
        Self::CTX: Send + Sync,
    {
        let Some(upstream) = ctx.upstream.as_ref() else {
            return Ok(());
        };

        let path_and_query = upstream_request
            .uri
            .path_and_query()
            .map_or("/", |pq| pq.as_str());
        let uri = upstream
            .endpoint
            .join(path_and_query)
            .parse::<http::Uri>()
            .map_err(|e| {
                Error::explain(
                    ErrorType::InternalError,
                    format!("bad upstream uri for {}: {e}", upstream.endpoint),
                )
            })?;
        upstream_request.set_uri(uri);
        Ok(())
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX)
    where
        Self::CTX: Send + Sync,
    {
        let status = session
            .response_written()
            .map(|r| r.status.as_u16())
            .or_else(|| e.map(|_| 502))
            .unwrap_or(0);
        let elapsed = ctx.started.elapsed();
        let domain = ctx.domain.as_deref().unwrap_or(UNROUTED_DOMAIN);

        self.metrics.record(domain, status, elapsed, e.is_some());

        match &ctx.upstream {
            Some(upstream) => log::info!(
                "request.end domain={} upstream={} weight={} endpoint={} method={} status={} elapsed_ms={}",
                domain,
                upstream.id,
                upstream.weight,
                upstream.endpoint,
                session.req_header().method,
                status,
                elapsed.as_millis()
            ),
            None => log::info!(
                "request.end domain={} status={} elapsed_ms={}",
                domain,
                status,
                elapsed.as_millis()
            ),
        }
        if let Some(e) = e {
            log::warn!("request.error domain={}: {}", domain, e);
        }
    }
}
