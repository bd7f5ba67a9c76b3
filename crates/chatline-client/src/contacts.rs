use std::sync::Arc;

use chatline_shared::models::UserProfile;
use chatline_shared::types::{ConversationId, UserId};
use chatline_shared::{paths, ChatError};
use chatline_store::RemoteChannel;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::events::{NoticeBus, NoticeKind};

type Result<T> = std::result::Result<T, ChatError>;

pub struct Contacts {
    channel: Arc<dyn RemoteChannel>,
    local: UserId,
    notices: NoticeBus,
}

impl Contacts {
    pub fn new(channel: Arc<dyn RemoteChannel>, local: &UserId, notices: NoticeBus) -> Self {
        Self {
            channel,
            local: local.clone(),
            notices,
        }
    }

    /// Case-insensitive email lookup over the user directory.
    pub async fn find_user_by_email(&self, email: &str) -> Result<(UserId, UserProfile)> {
        let wanted = email.trim().to_lowercase();
        let directory = self.channel.read(&paths::users()).await?;
        let found = match directory {
            Some(Value::Object(users)) => users.into_iter().find_map(|(uid, node)| {
                let profile: UserProfile = match serde_json::from_value(node) {
                    Ok(profile) => profile,
                    Err(e) => {
                        warn!(user = %uid, error = %e, "Skipping malformed profile");
                        return None;
                    }
                };
                let matches = profile
                    .email
                    .as_deref()
                    .is_some_and(|e| e.to_lowercase() == wanted);
                matches.then(|| (UserId::new(uid), profile))
            }),
            _ => None,
        };
        found.ok_or_else(|| {
            self.notices
                .emit(NoticeKind::ContactNotFound, format!("No user with email {email}"));
            ChatError::NotFound(format!("user with email {email}"))
        })
    }

    /// Start a 1:1 conversation with `peer`, listing it for both users.
    pub async fn add_contact(&self, peer: &UserId) -> Result<ConversationId> {
        if *peer == self.local {
            return Err(ChatError::InvalidState("cannot add yourself".to_string()));
        }
        let conversation = ConversationId::direct(&self.local, peer);
        for user in [&self.local, peer] {
            self.channel
                .merge(&paths::user_chats(user), json!({ conversation.as_str(): true }))
                .await?;
        }
        debug!(peer = %peer.short(), conversation = %conversation, "Contact added");
        Ok(conversation)
    }

    /// Conversations in the local user's index, in key order.
    pub async fn active_conversations(&self) -> Result<Vec<ConversationId>> {
        let index = self.channel.read(&paths::user_chats(&self.local)).await?;
        let Some(Value::Object(entries)) = index else {
            return Ok(Vec::new());
        };
        Ok(entries
            .into_iter()
            .filter(|(_, active)| active.as_bool() == Some(true))
            .map(|(cid, _)| ConversationId(cid))
            .collect())
    }

    pub async fn profile(&self, user: &UserId) -> Result<UserProfile> {
        let path = paths::user_profile(user);
        let node = self
            .channel
            .read(&path)
            .await?
            .ok_or_else(|| ChatError::NotFound(path.clone()))?;
        Ok(chatline_shared::models::decode(&path, &node)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatline_store::MemoryHub;

    async fn directory() -> (MemoryHub, Contacts, NoticeBus) {
        let hub = MemoryHub::new();
        let channel: Arc<dyn RemoteChannel> = Arc::new(hub.connect());
        channel
            .write(
                "users",
                json!({
                    "alice": { "name": "Alice", "email": "Alice@Example.com" },
                    "bob": { "name": "Bob", "email": "bob@example.com", "photo": "https://p/b.png" },
                    "broken": { "email": 42 },
                }),
            )
            .await
            .unwrap();
        let notices = NoticeBus::new();
        let contacts = Contacts::new(channel, &UserId::new("alice"), notices.clone());
        (hub, contacts, notices)
    }

    #[tokio::test]
    async fn email_lookup_ignores_case() {
        let (_hub, contacts, _) = directory().await;
        let (uid, profile) = contacts.find_user_by_email("BOB@example.com ").await.unwrap();
        assert_eq!(uid, UserId::new("bob"));
        assert_eq!(profile.photo.as_deref(), Some("https://p/b.png"));
    }

    #[tokio::test]
    async fn unknown_email_is_not_found_and_noticed() {
        let (_hub, contacts, notices) = directory().await;
        let mut rx = notices.subscribe();
        let err = contacts.find_user_by_email("nobody@example.com").await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
        assert_eq!(rx.recv().await.unwrap().kind, NoticeKind::ContactNotFound);
    }

    #[tokio::test]
    async fn adding_contact_indexes_both_sides() {
        let (hub, contacts, _) = directory().await;
        let bob = UserId::new("bob");
        let cid = contacts.add_contact(&bob).await.unwrap();
        assert_eq!(cid.as_str(), "alice_bob");
        assert_eq!(hub.snapshot("userChats/bob/alice_bob"), Some(json!(true)));
        assert_eq!(contacts.active_conversations().await.unwrap(), vec![cid]);

        let err = contacts.add_contact(&UserId::new("alice")).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidState(_)));
    }

    #[tokio::test]
    async fn profile_lookup() {
        let (_hub, contacts, _) = directory().await;
        assert_eq!(contacts.profile(&UserId::new("alice")).await.unwrap().name, "Alice");
        assert!(matches!(
            contacts.profile(&UserId::new("zed")).await,
            Err(ChatError::NotFound(_))
        ));
    }
}
