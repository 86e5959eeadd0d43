pub mod auth;
mod config;
mod forwards;
mod observers;
mod registry;
mod services;

pub use config::RelayConfig;
pub use forwards::ForwardBindings;
pub use observers::{ConnectionEvent, ConnectionEvents, ConnectionStatus, install_watch_log};
pub use registry::{AgentRecord, AgentRegistry, SessionHandle};
pub use services::Services;
