use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Mutex;

/// Routing table for `forwarded-tcpip` channels offered by agents:
/// maps the connected port named in the channel's extra data to a
/// server-local destination. Admins populate it through the console's
/// `bind`/`unbind` commands; opens for unbound ports are rejected.
#[derive(Clone, Default)]
pub struct ForwardBindings {
    bindings: Arc<Mutex<HashMap<u32, SocketAddr>>>,
}

impl ForwardBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn bind(&self, port: u32, target: SocketAddr) {
        self.bindings.lock().await.insert(port, target);
    }

    pub async fn unbind(&self, port: u32) {
        self.bindings.lock().await.remove(&port);
    }

    pub async fn lookup(&self, port: u32) -> Option<SocketAddr> {
        self.bindings.lock().await.get(&port).copied()
    }
}
