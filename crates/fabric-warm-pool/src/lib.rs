pub mod api;
pub mod clock;
pub mod entry;
pub mod errors;
pub mod provisioner;
pub mod reaper;
pub mod store;

pub use api::{build_router, AppState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::{
    ClaimRequest, ClaimedInstance, CleanupReport, FailedUpdate, PrewarmOutcome, PrewarmRequest,
    ReadyUpdate, WarmPoolEntry, WarmPoolStatus,
};
pub use errors::{PoolError, PoolResult};
pub use provisioner::{InstanceLauncher, Provisioner, SandboxLauncher};
pub use reaper::{spawn_reaper, DEFAULT_REAP_INTERVAL};
pub use store::{ReaperPolicy, WarmPool, SUPERSEDED_MESSAGE};

pub const DEFAULT_HTTP_PORT: u16 = 46840;
