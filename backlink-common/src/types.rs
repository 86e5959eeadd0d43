use uuid::Uuid;

/// Identifier handed out by the agent registry when a controllable
/// connection registers. Unique for the lifetime of the process.
pub type AgentId = Uuid;
