//! Online/offline presence.
//!
//! On every (re)connection the tracker first registers a disconnect hook
//! that flips the user's status to offline with a server timestamp, then
//! marks the user online. The hook is what lets peers see the user go
//! offline when the process dies without saying goodbye.

use std::sync::Arc;

use chatline_shared::models::{PresenceRecord, PresenceStatus};
use chatline_shared::types::{now_millis, UserId};
use chatline_shared::{paths, ChatError};
use chatline_store::{server_timestamp, RemoteChannel, TeardownScope};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, warn};

pub struct PresenceTracker {
    channel: Arc<dyn RemoteChannel>,
    user: UserId,
}

impl PresenceTracker {
    pub fn new(channel: Arc<dyn RemoteChannel>, user: &UserId) -> Self {
        Self {
            channel,
            user: user.clone(),
        }
    }

    /// Follow the connection flag and re-announce on every reconnect.
    pub fn start(self: &Arc<Self>, scope: &TeardownScope) {
        let mut connected = self.channel.subscribe_connected();
        let tracker = Arc::clone(self);
        scope.spawn(async move {
            while let Some(up) = connected.next().await {
                if !up {
                    debug!(user = %tracker.user, "Connection lost");
                    continue;
                }
                if let Err(e) = tracker.go_online().await {
                    warn!(user = %tracker.user, error = %e, "Failed to announce presence");
                }
            }
        });
    }

    pub async fn go_online(&self) -> Result<(), ChatError> {
        let path = paths::presence(&self.user);
        self.channel
            .on_disconnect_do(
                &path,
                json!({ "status": PresenceStatus::Offline, "lastSeen": server_timestamp() }),
            )
            .await?;
        self.channel
            .write(
                &path,
                json!({ "status": PresenceStatus::Online, "lastSeen": server_timestamp() }),
            )
            .await?;
        debug!(user = %self.user, "Online");
        Ok(())
    }

    /// Explicit sign-out.
    pub async fn go_offline(&self) -> Result<(), ChatError> {
        self.channel
            .write(
                &paths::presence(&self.user),
                json!({ "status": PresenceStatus::Offline, "lastSeen": now_millis() }),
            )
            .await?;
        debug!(user = %self.user, "Offline");
        Ok(())
    }

    /// Live presence of `peer`. `None` until the peer has ever announced or
    /// while the node does not decode.
    pub fn watch_peer(&self, peer: &UserId, scope: &TeardownScope) -> watch::Receiver<Option<PresenceRecord>> {
        let mut node = self.channel.subscribe(&paths::presence(peer));
        let (tx, rx) = watch::channel(None);
        scope.spawn(async move {
            while let Some(value) = node.next().await {
                let record = value.and_then(|v| serde_json::from_value::<PresenceRecord>(v).ok());
                tx.send_if_modified(|current| {
                    if *current == record {
                        return false;
                    }
                    *current = record;
                    true
                });
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::WAIT;
    use chatline_store::MemoryHub;

    #[tokio::test]
    async fn disconnect_hook_marks_user_offline() {
        let hub = MemoryHub::new();
        let alice_conn = Arc::new(hub.connect());
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");
        let tracker = Arc::new(PresenceTracker::new(alice_conn.clone(), &alice));
        let scope = TeardownScope::new();
        tracker.start(&scope);

        let observer = PresenceTracker::new(Arc::new(hub.connect()), &bob);
        let mut peer = observer.watch_peer(&alice, &scope);
        tokio::time::timeout(WAIT, peer.wait_for(|r| r.as_ref().is_some_and(PresenceRecord::is_online)))
            .await
            .unwrap()
            .unwrap();

        alice_conn.disconnect();
        let record = tokio::time::timeout(
            WAIT,
            peer.wait_for(|r| r.as_ref().is_some_and(|r| !r.is_online())),
        )
        .await
        .unwrap()
        .unwrap()
        .clone()
        .unwrap();
        assert!(record.last_seen > 0);

        alice_conn.reconnect();
        tokio::time::timeout(WAIT, peer.wait_for(|r| r.as_ref().is_some_and(PresenceRecord::is_online)))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn explicit_offline() {
        let hub = MemoryHub::new();
        let alice = UserId::new("alice");
        let tracker = PresenceTracker::new(Arc::new(hub.connect()), &alice);
        tracker.go_online().await.unwrap();
        tracker.go_offline().await.unwrap();
        let record: PresenceRecord =
            serde_json::from_value(hub.snapshot(&paths::presence(&alice)).unwrap()).unwrap();
        assert_eq!(record.status, PresenceStatus::Offline);
    }
}
