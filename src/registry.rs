use std::collections::HashMap;

use tokio::sync::{Mutex, mpsc};

use crate::frame::{Frame, Identity};

/// Sending side of a connection's outbound queue. The registry holds one
/// per live connection and clones it out to whoever needs to write; the
/// queue's single consumer is the connection's writer task, so two roles
/// never interleave bytes on the same stream.
pub type OutboundSender = mpsc::UnboundedSender<Frame>;

/// Live-connection table plus the identity allocator.
///
/// Every accessor goes through the one internal mutex: the accept flow
/// registers, each reader unregisters its own connection, and the
/// dispatcher looks up and snapshots. The counter lives under the same
/// lock as the map, so allocation and membership can never disagree.
pub struct Registry {
    inner: Mutex<Inner>,
}

struct Inner {
    /// Most recently issued identity. Starts at 1 and is advanced before
    /// use, so the first issued identity is 2 and no connection is ever
    /// handed 0.
    last_identity: Identity,
    connections: HashMap<Identity, OutboundSender>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                last_identity: 1,
                connections: HashMap::new(),
            }),
        }
    }

    /// Allocates the next identity and inserts the connection's outbound
    /// sender. Identities are unique, strictly increasing, and never
    /// reused for the lifetime of the server.
    pub async fn register(&self, outbound: OutboundSender) -> Identity {
        let mut inner = self.inner.lock().await;
        inner.last_identity += 1;
        let identity = inner.last_identity;
        inner.connections.insert(identity, outbound);
        identity
    }

    /// Removes the connection if still present; a no-op otherwise.
    /// Dropping the outbound sender closes the queue, which stops the
    /// writer task and shuts the socket down exactly once.
    pub async fn unregister(&self, identity: Identity) -> bool {
        self.inner.lock().await.connections.remove(&identity).is_some()
    }

    /// Resolves an identity to its outbound sender, or `None` once the
    /// connection has been unregistered.
    pub async fn lookup(&self, identity: Identity) -> Option<OutboundSender> {
        self.inner.lock().await.connections.get(&identity).cloned()
    }

    /// Point-in-time view of the registered identities, ascending.
    pub async fn snapshot(&self) -> Vec<Identity> {
        let inner = self.inner.lock().await;
        let mut identities: Vec<Identity> = inner.connections.keys().copied().collect();
        identities.sort_unstable();
        identities
    }

    /// Drops every connection, closing each outbound queue.
    pub async fn clear(&self) {
        self.inner.lock().await.connections.clear();
    }
}
