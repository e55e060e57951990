//! Endpoint resolution for proxied requests

use http::header::{HeaderName, HOST};
use http::request::Parts;
use http::uri::Authority;
use piko_proto::ENDPOINT_HEADER;
use std::net::IpAddr;
use tracing::trace;

/// Decides which endpoint a request is addressed to
pub trait EndpointResolver: Send + Sync {
    fn resolve(&self, parts: &Parts) -> Option<String>;
}

/// Endpoint id taken verbatim from a request header
#[derive(Debug, Clone)]
pub struct HeaderResolver {
    header: HeaderName,
}

impl HeaderResolver {
    pub fn new(header: HeaderName) -> Self {
        Self { header }
    }
}

impl Default for HeaderResolver {
    fn default() -> Self {
        Self::new(HeaderName::from_static(ENDPOINT_HEADER))
    }
}

impl EndpointResolver for HeaderResolver {
    fn resolve(&self, parts: &Parts) -> Option<String> {
        let value = parts.headers.get(&self.header)?.to_str().ok()?.trim();
        non_empty(value)
    }
}

/// Endpoint id taken from the first DNS label of the host
///
/// `my-endpoint.example.com:8000` resolves to `my-endpoint`. IP literal
/// hosts carry no endpoint.
#[derive(Debug, Clone, Default)]
pub struct HostResolver;

impl EndpointResolver for HostResolver {
    fn resolve(&self, parts: &Parts) -> Option<String> {
        let authority = match parts.headers.get(HOST) {
            Some(value) => value.to_str().ok()?.trim().parse::<Authority>().ok()?,
            None => parts.uri.authority()?.clone(),
        };
        let host = authority.host();
        if host.starts_with('[') || host.parse::<IpAddr>().is_ok() {
            trace!("Host {} is an IP address", host);
            return None;
        }

        let label = host.split('.').next()?;
        trace!("Resolved host {} to label {}", host, label);
        non_empty(label)
    }
}

/// Endpoint id taken from the first path segment
///
/// The path is forwarded unchanged.
#[derive(Debug, Clone, Default)]
pub struct PathPrefixResolver;

impl EndpointResolver for PathPrefixResolver {
    fn resolve(&self, parts: &Parts) -> Option<String> {
        let segment = parts.uri.path().trim_start_matches('/').split('/').next()?;
        non_empty(segment)
    }
}

/// Every request goes to one endpoint
#[derive(Debug, Clone)]
pub struct FixedResolver {
    endpoint_id: String,
}

impl FixedResolver {
    pub fn new(endpoint_id: impl Into<String>) -> Self {
        Self {
            endpoint_id: endpoint_id.into(),
        }
    }
}

impl EndpointResolver for FixedResolver {
    fn resolve(&self, _parts: &Parts) -> Option<String> {
        Some(self.endpoint_id.clone())
    }
}

/// Tries resolvers in order; the first match wins
#[derive(Default)]
pub struct ChainResolver {
    resolvers: Vec<Box<dyn EndpointResolver>>,
}

impl ChainResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, resolver: impl EndpointResolver + 'static) -> Self {
        self.resolvers.push(Box::new(resolver));
        self
    }
}

impl EndpointResolver for ChainResolver {
    fn resolve(&self, parts: &Parts) -> Option<String> {
        self.resolvers
            .iter()
            .find_map(|resolver| resolver.resolve(parts))
    }
}

/// Header first, then host
pub fn default_resolver() -> ChainResolver {
    ChainResolver::new()
        .with(HeaderResolver::default())
        .with(HostResolver)
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn parts(builder: http::request::Builder) -> Parts {
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_header_resolver() {
        let request = parts(Request::get("/").header("x-piko-endpoint", "my-endpoint"));
        assert_eq!(
            HeaderResolver::default().resolve(&request),
            Some("my-endpoint".to_string())
        );

        let request = parts(Request::get("/").header("x-piko-endpoint", "  "));
        assert_eq!(HeaderResolver::default().resolve(&request), None);
    }

    #[test]
    fn test_host_resolver_strips_port() {
        let request = parts(Request::get("/").header("host", "my-endpoint.example.com:8000"));
        assert_eq!(
            HostResolver.resolve(&request),
            Some("my-endpoint".to_string())
        );
    }

    #[test]
    fn test_host_resolver_ignores_ip_hosts() {
        for host in ["127.0.0.1:8000", "127.0.0.1", "[::1]:8000", "[::1]"] {
            let request = parts(Request::get("/").header("host", host));
            assert_eq!(HostResolver.resolve(&request), None, "{}", host);
        }

        let request = parts(Request::get("http://10.0.0.1:8000/foo"));
        assert_eq!(HostResolver.resolve(&request), None);
    }

    #[test]
    fn test_host_resolver_uses_absolute_uri() {
        let request = parts(Request::get("http://my-endpoint.example.com/foo"));
        assert_eq!(
            HostResolver.resolve(&request),
            Some("my-endpoint".to_string())
        );
    }

    #[test]
    fn test_path_prefix_resolver() {
        let request = parts(Request::get("/my-endpoint/foo/bar"));
        assert_eq!(
            PathPrefixResolver.resolve(&request),
            Some("my-endpoint".to_string())
        );

        let request = parts(Request::get("/"));
        assert_eq!(PathPrefixResolver.resolve(&request), None);
    }

    #[test]
    fn test_default_resolver_prefers_header() {
        let resolver = default_resolver();

        let request = parts(
            Request::get("/")
                .header("host", "from-host.example.com")
                .header("x-piko-endpoint", "from-header"),
        );
        assert_eq!(resolver.resolve(&request), Some("from-header".to_string()));

        let request = parts(Request::get("/").header("host", "from-host.example.com"));
        assert_eq!(resolver.resolve(&request), Some("from-host".to_string()));

        let request = parts(Request::get("/"));
        assert_eq!(resolver.resolve(&request), None);
    }

    #[test]
    fn test_fixed_resolver() {
        let request = parts(Request::get("/anything"));
        assert_eq!(
            FixedResolver::new("my-endpoint").resolve(&request),
            Some("my-endpoint".to_string())
        );
    }
}
