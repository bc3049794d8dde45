//! lobby-core — shared types, configuration, wire protocol, and token crypto.
//! All other Lobby crates depend on this one.

pub mod clock;
pub mod config;
pub mod crypto;
pub mod types;
pub mod wire;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use types::{ClientId, EndReason, ErrorKind, InviteScope, SessionId, TokenId};
pub use wire::{ClientMessage, Envelope, ServerEvent};
