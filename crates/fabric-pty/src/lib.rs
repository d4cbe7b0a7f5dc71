//! Terminal session server.
//!
//! The server is the source of truth for every terminal: clients subscribe to
//! lifecycle events on `/ws` and attach to a session's byte stream on
//! `/sessions/{id}/ws`.

pub mod api;
pub mod errors;
pub mod models;
pub mod screen;
pub mod session;
pub mod state;

pub use api::build_router;
pub use errors::ServerError;
pub use models::{
    ClientMessage, CreateSessionRequest, ServerEvent, SessionInfo, UpdateSessionRequest,
};
pub use session::{PtySession, MAX_SCROLLBACK};
pub use state::{AppState, SignalReport};

pub const DEFAULT_PORT: u16 = 39383;
