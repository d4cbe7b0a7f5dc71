use http::StatusCode;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend health check failed: {0}")]
    HealthCheck(String),
    #[error("backend health check returned {0}")]
    UnhealthyBackend(StatusCode),
}
