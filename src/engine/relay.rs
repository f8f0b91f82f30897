use dashmap::DashMap;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::engine::models::RunEvent;

/// Delivery capability for session events. Returns whether a live channel took the event.
pub trait EventSink: Send + Sync {
    fn send(&self, client_id: &str, event: &RunEvent) -> bool;
}

struct Binding {
    connection_id: Uuid,
    sender: UnboundedSender<RunEvent>,
}

/// Live client channels keyed by client id. At most one binding per client.
#[derive(Default)]
pub struct ConnectionTable {
    bindings: DashMap<String, Binding>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a fresh channel for `client_id`, replacing any previous connection.
    pub fn bind(&self, client_id: &str) -> (Uuid, UnboundedReceiver<RunEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let connection_id = Uuid::new_v4();
        let previous = self.bindings.insert(
            client_id.to_string(),
            Binding {
                connection_id,
                sender,
            },
        );
        if previous.is_some() {
            tracing::info!(client_id, "replaced existing client connection");
        }
        (connection_id, receiver)
    }

    /// Removes the binding only if it still belongs to `connection_id`.
    pub fn unbind(&self, client_id: &str, connection_id: Uuid) -> bool {
        self.bindings
            .remove_if(client_id, |_, binding| binding.connection_id == connection_id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }
}

impl EventSink for ConnectionTable {
    fn send(&self, client_id: &str, event: &RunEvent) -> bool {
        let Some(binding) = self.bindings.get(client_id) else {
            return false;
        };
        binding.sender.send(event.clone()).is_ok()
    }
}
