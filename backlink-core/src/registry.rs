use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use backlink_common::AgentId;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Control handle over a live agent connection, owned by the protocol
/// layer. `close` tears the underlying transport down.
pub trait SessionHandle: Send + Sync {
    fn close(&self);
}

#[derive(Clone)]
pub struct AgentRecord {
    pub id: AgentId,
    /// SSH username the agent presented.
    pub username: String,
    pub remote_addr: SocketAddr,
    pub client_version: String,
    /// Principals allowed to drive this agent; empty means anyone.
    pub owners: Vec<String>,
    pub handle: Arc<dyn SessionHandle>,
}

impl AgentRecord {
    /// Whether `username` may see and drive this agent.
    pub fn visible_to(&self, username: &str) -> bool {
        self.owners.is_empty() || self.owners.iter().any(|o| o == username)
    }
}

/// The registry of currently controllable agents. The map entry lives
/// as long as the owning connection; removal is idempotent.
#[derive(Clone, Default)]
pub struct AgentRegistry {
    agents: Arc<Mutex<HashMap<AgentId, AgentRecord>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(
        &self,
        username: String,
        remote_addr: SocketAddr,
        client_version: String,
        owners: Vec<String>,
        handle: Arc<dyn SessionHandle>,
    ) -> AgentId {
        let id = Uuid::new_v4();
        let record = AgentRecord {
            id,
            username,
            remote_addr,
            client_version,
            owners,
            handle,
        };
        self.agents.lock().await.insert(id, record);
        id
    }

    pub async fn remove(&self, id: AgentId) {
        self.agents.lock().await.remove(&id);
    }

    pub async fn get(&self, id: AgentId) -> Option<AgentRecord> {
        self.agents.lock().await.get(&id).cloned()
    }

    pub async fn list(&self) -> Vec<AgentRecord> {
        let mut records = self
            .agents
            .lock()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by(|a, b| a.username.cmp(&b.username).then(a.id.cmp(&b.id)));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandle;

    impl SessionHandle for NullHandle {
        fn close(&self) {}
    }

    fn addr() -> SocketAddr {
        "1.2.3.4:50000".parse().unwrap()
    }

    async fn add(registry: &AgentRegistry, username: &str, owners: &[&str]) -> AgentId {
        registry
            .add(
                username.to_string(),
                addr(),
                "SSH-2.0-test".to_string(),
                owners.iter().map(|s| s.to_string()).collect(),
                Arc::new(NullHandle),
            )
            .await
    }

    #[tokio::test]
    async fn test_get_returns_record_until_removed() {
        let registry = AgentRegistry::new();
        let id = add(&registry, "bob", &[]).await;

        let record = registry.get(id).await.unwrap();
        assert_eq!(record.username, "bob");
        assert_eq!(record.remote_addr, addr());

        registry.remove(id).await;
        assert!(registry.get(id).await.is_none());

        // Removing again is not an error.
        registry.remove(id).await;
    }

    #[tokio::test]
    async fn test_ids_are_unique_under_concurrent_add() {
        let registry = AgentRegistry::new();
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(
                async move { add(&registry, "agent", &[]).await },
            ));
        }

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap());
        }
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 32);
        assert_eq!(registry.list().await.len(), 32);
    }

    #[tokio::test]
    async fn test_owner_visibility() {
        let registry = AgentRegistry::new();
        let open = add(&registry, "open", &[]).await;
        let owned = add(&registry, "owned", &["alice"]).await;

        let open = registry.get(open).await.unwrap();
        let owned = registry.get(owned).await.unwrap();
        assert!(open.visible_to("mallory"));
        assert!(owned.visible_to("alice"));
        assert!(!owned.visible_to("mallory"));
    }
}
