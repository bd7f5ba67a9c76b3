//! The signed-in user's context.
//!
//! A [`Session`] is created on login and consumed on logout. It owns the
//! long-lived listeners (presence, incoming calls) and hands the
//! collaborators it was built with to every conversation view it opens.

use std::collections::BTreeSet;
use std::sync::Arc;

use chatline_media::{CallSignaler, CallTokenProvider, CallerIdentity, HttpTokenProvider, MediaBridge};
use chatline_shared::models::{Conversation, MessageDraft, UserProfile};
use chatline_shared::types::{ConversationId, MessageId, UserId};
use chatline_shared::{paths, ChatError};
use chatline_store::{RemoteChannel, TeardownScope};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::assembler::{AssemblerDeps, MessageStreamAssembler};
use crate::config::ClientConfig;
use crate::contacts::Contacts;
use crate::events::{Notice, NoticeBus};
use crate::notify::{Notifier, PushClient};
use crate::presence::PresenceTracker;
use crate::typing::{InboxTypingWatcher, TypingCoalescer, TypingWatcher};
use crate::upload::{MediaUploader, UploadClient};

type Result<T> = std::result::Result<T, ChatError>;

/// Everything a session talks to.
#[derive(Clone)]
pub struct SessionDeps {
    pub channel: Arc<dyn RemoteChannel>,
    pub media: Arc<dyn MediaBridge>,
    pub tokens: Arc<dyn CallTokenProvider>,
    pub uploader: Arc<dyn MediaUploader>,
    /// `None` disables push dispatch.
    pub notifier: Option<Arc<dyn Notifier>>,
}

impl SessionDeps {
    /// Production wiring: uploads, push and call tokens go through the
    /// companion server at `config.api_base`.
    pub fn http(channel: Arc<dyn RemoteChannel>, media: Arc<dyn MediaBridge>, config: &ClientConfig) -> Self {
        let client = reqwest::Client::new();
        let notifier = config
            .notifications_enabled
            .then(|| Arc::new(PushClient::new(client.clone(), &config.api_base)) as Arc<dyn Notifier>);
        Self {
            channel,
            media,
            tokens: Arc::new(HttpTokenProvider::new(client.clone(), &config.api_base)),
            uploader: Arc::new(UploadClient::new(client, &config.api_base, config.upload_folder.clone())),
            notifier,
        }
    }
}

pub struct Session {
    user: UserId,
    profile: UserProfile,
    config: ClientConfig,
    deps: SessionDeps,
    notices: NoticeBus,
    presence: Arc<PresenceTracker>,
    calls: Arc<CallSignaler>,
    contacts: Contacts,
    scope: TeardownScope,
}

impl Session {
    /// Publish the profile, go online and start listening for calls.
    pub async fn login(user: &UserId, profile: UserProfile, deps: SessionDeps, config: ClientConfig) -> Result<Self> {
        deps.channel
            .merge(&paths::user_profile(user), serde_json::to_value(&profile)?)
            .await?;

        let scope = TeardownScope::new();
        let notices = NoticeBus::new();

        let presence = Arc::new(PresenceTracker::new(Arc::clone(&deps.channel), user));
        presence.start(&scope);

        let identity = CallerIdentity {
            id: user.clone(),
            name: profile.name.clone(),
            photo: profile.photo.clone(),
        };
        let calls = Arc::new(CallSignaler::new(
            identity,
            Arc::clone(&deps.channel),
            Arc::clone(&deps.media),
            Arc::clone(&deps.tokens),
        ));
        calls.listen(&scope);

        let contacts = Contacts::new(Arc::clone(&deps.channel), user, notices.clone());
        info!(user = %user.short(), "Logged in");
        Ok(Self {
            user: user.clone(),
            profile,
            config,
            deps,
            notices,
            presence,
            calls,
            contacts,
            scope,
        })
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    pub fn calls(&self) -> &Arc<CallSignaler> {
        &self.calls
    }

    pub fn contacts(&self) -> &Contacts {
        &self.contacts
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn open_direct(&self, peer: &UserId) -> ConversationView {
        self.open(Conversation::direct(&self.user, peer))
    }

    pub fn open_group(&self, id: &str, members: Vec<UserId>) -> ConversationView {
        self.open(Conversation::group(id, members))
    }

    /// Typing state across the conversation list. Lives until logout.
    pub fn watch_inbox_typing(&self, conversations: Vec<ConversationId>) -> InboxTypingWatcher {
        InboxTypingWatcher::spawn(&self.deps.channel, conversations, &self.user, &self.scope)
    }

    fn open(&self, conversation: Conversation) -> ConversationView {
        let typing = TypingCoalescer::new(
            Arc::clone(&self.deps.channel),
            &conversation.id,
            &self.user,
            self.config.typing_idle,
        );
        let scope = TeardownScope::new();
        let peer_typing = TypingWatcher::spawn(&self.deps.channel, &conversation.id, &self.user, &scope);
        let deps = AssemblerDeps {
            channel: Arc::clone(&self.deps.channel),
            uploader: Arc::clone(&self.deps.uploader),
            notifier: self.deps.notifier.clone(),
            notices: self.notices.clone(),
        };
        let assembler = MessageStreamAssembler::open(&self.user, &self.profile.name, conversation, deps, &self.config);
        ConversationView {
            assembler,
            typing,
            peer_typing,
            scope,
        }
    }

    /// Hang up, mark the user offline and stop every session listener.
    pub async fn logout(self) -> Result<()> {
        self.calls.shutdown().await;
        let offline = self.presence.go_offline().await;
        self.scope.close();
        info!(user = %self.user.short(), "Logged out");
        offline
    }
}

/// One open conversation: its message stream, the local typing signal
/// and who else is typing.
pub struct ConversationView {
    assembler: MessageStreamAssembler,
    typing: TypingCoalescer,
    peer_typing: TypingWatcher,
    scope: TeardownScope,
}

impl ConversationView {
    pub fn messages(&self) -> &MessageStreamAssembler {
        &self.assembler
    }

    pub fn peer_typing(&self) -> &TypingWatcher {
        &self.peer_typing
    }

    pub fn peers_typing(&self) -> BTreeSet<UserId> {
        self.peer_typing.typers()
    }

    pub async fn keystroke(&self) -> Result<()> {
        self.typing.keystroke().await
    }

    /// Send a draft. The typing signal is withdrawn first.
    pub async fn send(&self, draft: MessageDraft) -> Result<Option<MessageId>> {
        if let Err(e) = self.typing.stop().await {
            warn!(error = %e, "Failed to withdraw typing signal");
        }
        self.assembler.send(draft).await
    }

    /// Leave the view: the typing node is gone and no listener survives
    /// once this returns.
    pub async fn close(self) {
        if let Err(e) = self.typing.teardown().await {
            warn!(error = %e, "Failed to withdraw typing signal");
        }
        self.assembler.close();
        self.scope.close();
    }
}
