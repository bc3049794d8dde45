pub mod broker;
pub mod invite;
pub mod lifecycle;
pub mod notify;
pub mod queue;
pub mod rate_limit;
pub mod sandbox;
pub mod telemetry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use broker::{
    Broker, BrokerError, BrokerHandle, BrokerParts, BrokerSettings, BrokerSnapshot, Connected,
    SweepReport,
};
pub use invite::{InviteRecord, InviteTokenService, IssuedInvite, TokenError};
pub use lifecycle::{LifecycleSettings, SessionStatus, SessionView};
pub use notify::{ClientChannel, EventReceiver};
pub use queue::{ClientState, Placement, QueueEntryView};
pub use rate_limit::RateLimiter;
pub use sandbox::{CommandSandbox, ResourceLimits, SandboxError, SandboxProvider};
pub use telemetry::{Telemetry, TelemetrySnapshot};
