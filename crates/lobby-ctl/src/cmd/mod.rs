//! CLI command modules.

pub mod http;
pub mod invites;
pub mod queue;
pub mod session;
pub mod status;
