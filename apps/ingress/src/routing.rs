//! Hostname decoding.
//!
//! Two schemes are recognized:
//! - `port-<port>-<instance>.<provider suffix>` addresses a port on a provider instance.
//! - `<workspace>-<port>.<workspace suffix>` addresses a port on a workspace's loopback
//!   identity; the last dash separates the port.

use http::header::HOST;
use http::uri::Scheme;
use http::HeaderMap;

use crate::config::Backend;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    Provider { instance: String, port: u16 },
    Workspace { workspace: String, port: u16 },
}

impl Route {
    pub fn port(&self) -> u16 {
        match self {
            Route::Provider { port, .. } | Route::Workspace { port, .. } => *port,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteTarget {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl RouteTarget {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The request host from `x-forwarded-host`, else `Host`, lowercased without its port.
pub fn extract_host(headers: &HeaderMap) -> Option<String> {
    let raw = headers
        .get("x-forwarded-host")
        .and_then(|v| v.to_str().ok())
        .or_else(|| headers.get(HOST).and_then(|v| v.to_str().ok()))?;
    let host = normalize_host(raw);
    (!host.is_empty()).then_some(host)
}

fn normalize_host(value: &str) -> String {
    // A forwarded list keeps the client-facing host first.
    let first = value.split(',').next().unwrap_or_default().trim();
    let mut host = first.to_ascii_lowercase();
    if let Some(idx) = host.rfind(':') {
        if host[idx + 1..].chars().all(|c| c.is_ascii_digit()) {
            host.truncate(idx);
        }
    }
    host
}

fn label_for<'a>(host: &'a str, suffix: Option<&str>) -> Option<&'a str> {
    let suffix = suffix?;
    let label = host.strip_suffix(suffix)?.strip_suffix('.')?;
    (!label.is_empty() && !label.contains('.')).then_some(label)
}

pub fn parse_route(
    host: &str,
    provider_suffix: Option<&str>,
    workspace_suffix: Option<&str>,
) -> Option<Route> {
    if let Some(label) = label_for(host, provider_suffix) {
        if let Some(route) = parse_provider_label(label) {
            return Some(route);
        }
    }
    let label = label_for(host, workspace_suffix)?;
    parse_workspace_label(label)
}

fn parse_provider_label(label: &str) -> Option<Route> {
    let rest = label.strip_prefix("port-")?;
    let (port, instance) = rest.split_once('-')?;
    let port = port.parse::<u16>().ok()?;
    if instance.is_empty() {
        return None;
    }
    Some(Route::Provider {
        instance: instance.to_string(),
        port,
    })
}

fn parse_workspace_label(label: &str) -> Option<Route> {
    let (workspace, port) = label.rsplit_once('-')?;
    if workspace.is_empty() {
        return None;
    }
    let port = port.parse::<u16>().ok()?;
    Some(Route::Workspace {
        workspace: workspace.to_string(),
        port,
    })
}

/// Turn a decoded route into a connectable target.
pub fn resolve(route: &Route, backend: &Backend) -> Option<RouteTarget> {
    let host = match (&backend.host_override, route) {
        (Some(host), _) => host.clone(),
        (None, Route::Provider { instance, .. }) => instance.clone(),
        (None, Route::Workspace { workspace, .. }) => {
            fabric_identity::workspace_ip_from_name(workspace)?.to_string()
        }
    };
    Some(RouteTarget {
        scheme: backend.scheme.clone(),
        host,
        port: route.port(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    const PROVIDER: Option<&str> = Some("sandbox.example.dev");
    const WORKSPACE: Option<&str> = Some("ws.example.dev");

    #[test]
    fn provider_host_decodes_instance_and_port() {
        let route = parse_route("port-4096-abc123.sandbox.example.dev", PROVIDER, WORKSPACE);
        assert_eq!(
            route,
            Some(Route::Provider {
                instance: "abc123".into(),
                port: 4096
            })
        );
        let target = resolve(&route.unwrap(), &Backend::default()).unwrap();
        assert_eq!(
            target,
            RouteTarget {
                scheme: Scheme::HTTP,
                host: "abc123".into(),
                port: 4096
            }
        );
    }

    #[test]
    fn provider_instance_may_contain_dashes() {
        let route = parse_route("port-39378-vm-a1-b2.sandbox.example.dev", PROVIDER, None);
        assert_eq!(
            route,
            Some(Route::Provider {
                instance: "vm-a1-b2".into(),
                port: 39378
            })
        );
    }

    #[test]
    fn workspace_host_uses_last_dash_for_port() {
        let route = parse_route("my-feature-branch-5173.ws.example.dev", None, WORKSPACE).unwrap();
        assert_eq!(
            route,
            Route::Workspace {
                workspace: "my-feature-branch".into(),
                port: 5173
            }
        );

        let target = resolve(
            &Route::Workspace {
                workspace: "workspace-300".into(),
                port: 3000,
            },
            &Backend::default(),
        )
        .unwrap();
        assert_eq!(target.host, "127.18.1.44");
        assert_eq!(target.authority(), "127.18.1.44:3000");
    }

    #[test]
    fn override_replaces_decoded_host() {
        let backend = Backend {
            scheme: Scheme::HTTPS,
            host_override: Some("10.0.0.5".into()),
        };
        for route in [
            Route::Provider {
                instance: "abc".into(),
                port: 80,
            },
            Route::Workspace {
                workspace: "workspace-1".into(),
                port: 80,
            },
        ] {
            let target = resolve(&route, &backend).unwrap();
            assert_eq!(target.host, "10.0.0.5");
            assert_eq!(target.scheme, Scheme::HTTPS);
        }
    }

    #[test]
    fn unknown_and_malformed_hosts_do_not_route() {
        for host in [
            "example.com",
            "sandbox.example.dev",
            "port-abc-x.sandbox.example.dev",
            "port-70000-x.sandbox.example.dev",
            "port-80-.sandbox.example.dev",
            "a.port-80-x.sandbox.example.dev",
            "nodash.ws.example.dev",
            "-80.ws.example.dev",
            "ws-port.ws.example.dev",
            "evilsandbox.example.dev",
        ] {
            assert_eq!(parse_route(host, PROVIDER, WORKSPACE), None, "{host}");
        }
    }

    #[test]
    fn unconfigured_scheme_is_ignored() {
        assert_eq!(
            parse_route("port-80-abc.sandbox.example.dev", None, WORKSPACE),
            None
        );
        assert_eq!(parse_route("ws-80.ws.example.dev", PROVIDER, None), None);
    }

    #[test]
    fn host_extraction_prefers_forwarded_host() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("Proxy.Internal:8080"));
        assert_eq!(extract_host(&headers).as_deref(), Some("proxy.internal"));

        headers.insert(
            "x-forwarded-host",
            HeaderValue::from_static("PORT-80-X.Sandbox.Example.dev:443, other"),
        );
        assert_eq!(
            extract_host(&headers).as_deref(),
            Some("port-80-x.sandbox.example.dev")
        );

        assert_eq!(extract_host(&HeaderMap::new()), None);
    }
}
