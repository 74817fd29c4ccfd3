//! Outbound proxy the sandbox is forced to route HTTP/HTTPS through.
//!
//! Enforces a domain allowlist unioning static configuration, a fixed set
//! of package registries, and trust-ledger entries. Content inspection is
//! never attempted — the perimeter is the unit of enforcement.

use arc_swap::ArcSwap;
use axum::{
    body::Bytes,
    extract::State,
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

/// Registries the sandbox may always reach regardless of config, so that
/// package installation inside agent-authored scripts keeps working even
/// on a freshly initialized allowlist.
const FIXED_REGISTRIES: &[&str] = &[
    "pypi.org",
    "files.pythonhosted.org",
    "registry.npmjs.org",
    "crates.io",
    "static.crates.io",
];

/// The union of allowlist sources, swapped atomically whenever the static
/// config reloads or the trust ledger gains an entry.
#[derive(Debug, Clone, Default)]
pub struct AllowlistSnapshot {
    pub static_domains: HashSet<String>,
    pub trust_domains: HashSet<String>,
    pub block_domains: HashSet<String>,
}

impl AllowlistSnapshot {
    pub fn is_allowed(&self, domain: &str) -> bool {
        if self.block_domains.contains(domain) {
            return false;
        }
        self.static_domains.contains(domain)
            || self.trust_domains.contains(domain)
            || FIXED_REGISTRIES.contains(&domain)
    }
}

/// The egress filter: an HTTP proxy listener plus the live allowlist it
/// consults on every request.
#[derive(Clone)]
pub struct EgressFilter {
    allowlist: Arc<ArcSwap<AllowlistSnapshot>>,
    client: reqwest::Client,
}

impl EgressFilter {
    pub fn new(initial: AllowlistSnapshot) -> Self {
        Self {
            allowlist: Arc::new(ArcSwap::from_pointee(initial)),
            client: reqwest::Client::new(),
        }
    }

    /// Replace the live snapshot, e.g. after a trust-ledger update or a
    /// `config.toml` reload.
    pub fn publish(&self, snapshot: AllowlistSnapshot) {
        self.allowlist.store(Arc::new(snapshot));
    }

    /// Add a single domain to the trust portion of the allowlist without
    /// requiring the caller to rebuild the whole snapshot.
    pub fn trust_domain(&self, domain: &str) {
        let mut next = (**self.allowlist.load()).clone();
        next.trust_domains.insert(domain.to_owned());
        self.publish(next);
    }

    pub fn is_allowed(&self, domain: &str) -> bool {
        self.allowlist.load().is_allowed(domain)
    }

    /// Bind and serve the proxy on `addr` until the process exits.
    pub async fn serve(self, addr: SocketAddr) -> std::io::Result<()> {
        let app = Router::new()
            .route("/{*path}", any(proxy_handler))
            .with_state(self);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await
    }
}

async fn proxy_handler(
    State(filter): State<EgressFilter>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let Some(host) = uri.host().map(str::to_owned) else {
        return (StatusCode::BAD_REQUEST, "missing host").into_response();
    };

    if !filter.is_allowed(&host) {
        tracing::info!(event = "outbound_denied", domain = %host, "rejected sandbox egress");
        return (
            StatusCode::FORBIDDEN,
            format!("domain not in allowlist: {host}"),
        )
            .into_response();
    }

    let mut req = filter.client.request(method, uri.to_string());
    if !body.is_empty() {
        req = req.body(body);
    }
    match req.send().await {
        Ok(upstream) => {
            let status = StatusCode::from_u16(upstream.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let text = upstream.bytes().await.unwrap_or_default();
            (status, text).into_response()
        }
        Err(e) => (StatusCode::BAD_GATEWAY, format!("upstream error: {e}")).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_registries_always_allowed() {
        let snap = AllowlistSnapshot::default();
        assert!(snap.is_allowed("pypi.org"));
        assert!(!snap.is_allowed("evil.example"));
    }

    #[test]
    fn block_list_overrides_everything() {
        let mut snap = AllowlistSnapshot {
            static_domains: ["api.example.org".to_owned()].into_iter().collect(),
            ..Default::default()
        };
        snap.block_domains.insert("api.example.org".to_owned());
        assert!(!snap.is_allowed("api.example.org"));
    }

    #[test]
    fn trust_domain_is_recognized() {
        let filter = EgressFilter::new(AllowlistSnapshot::default());
        assert!(!filter.is_allowed("api.example.org"));
        filter.trust_domain("api.example.org");
        assert!(filter.is_allowed("api.example.org"));
    }
}
