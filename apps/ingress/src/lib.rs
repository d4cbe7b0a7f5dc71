//! Reverse proxy that decodes a sandbox target from the request hostname.

mod config;
mod error;
mod proxy;
pub mod routing;

pub use config::{parse_scheme, Backend, ProxyConfig};
pub use error::ProxyError;
pub use proxy::{spawn_proxy, ProxyHandle, PORT_HEADER, PROXIED_HEADER, WORKSPACE_HEADER};
pub use routing::{Route, RouteTarget};
