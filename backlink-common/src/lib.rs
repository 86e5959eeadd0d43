mod eventhub;
pub mod helpers;
pub mod logging;
mod splice;
mod types;

pub use eventhub::EventHub;
pub use splice::splice;
pub use types::AgentId;
