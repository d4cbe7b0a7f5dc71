use std::net::SocketAddr;

use http::uri::Scheme;

use crate::error::ProxyError;

/// Where forwarded traffic goes once a route has picked the port.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Backend {
    pub scheme: Scheme,
    /// Replaces the host decoded from the hostname when set.
    pub host_override: Option<String>,
}

impl Backend {
    pub fn normalized(mut self) -> Self {
        self.host_override = self
            .host_override
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty());
        self
    }
}

impl Default for Backend {
    fn default() -> Self {
        Self {
            scheme: Scheme::HTTP,
            host_override: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub bind_addr: SocketAddr,
    pub backend: Backend,
    pub provider_domain_suffix: Option<String>,
    pub workspace_domain_suffix: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            backend: Backend::default(),
            provider_domain_suffix: None,
            workspace_domain_suffix: None,
        }
    }
}

impl ProxyConfig {
    /// Lowercase the suffixes, drop leading dots and empty values, and require at least one.
    pub fn normalized(mut self) -> Result<Self, ProxyError> {
        self.provider_domain_suffix = normalize_suffix(self.provider_domain_suffix);
        self.workspace_domain_suffix = normalize_suffix(self.workspace_domain_suffix);
        if self.provider_domain_suffix.is_none() && self.workspace_domain_suffix.is_none() {
            return Err(ProxyError::Configuration(
                "one of the provider or workspace domain suffixes is required".into(),
            ));
        }
        self.backend = self.backend.normalized();
        Ok(self)
    }
}

fn normalize_suffix(suffix: Option<String>) -> Option<String> {
    suffix
        .map(|s| s.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|s| !s.is_empty())
}

/// Parse `http` or `https` (case-insensitive).
pub fn parse_scheme(value: &str) -> Result<Scheme, ProxyError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "http" => Ok(Scheme::HTTP),
        "https" => Ok(Scheme::HTTPS),
        other => Err(ProxyError::Configuration(format!(
            "unsupported backend scheme: {other}"
        ))),
    }
}
