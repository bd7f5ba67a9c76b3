//! Live, windowed view of one conversation's messages.
//!
//! The channel owns canonical order. Every windowed emission is decoded,
//! sorted by timestamp and replaces the confirmed list wholesale; local
//! sends appear as optimistic echoes until the channel confirms them. The
//! per-viewer clear threshold is applied on top and never touches the
//! underlying list.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chatline_shared::api::NotifyRequest;
use chatline_shared::models::{
    decode, Attachment, ChatSettings, Conversation, ConversationMeta, Message, MessageDraft, ReplySnapshot,
};
use chatline_shared::types::{now_millis, ConversationId, MessageId, UserId};
use chatline_shared::{paths, ChannelError, ChatError};
use chatline_store::{Entry, RemoteChannel, TeardownScope};
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::events::{NoticeBus, NoticeKind};
use crate::notify::Notifier;
use crate::upload::MediaUploader;

type Result<T> = std::result::Result<T, ChatError>;

/// Collaborators an assembler writes through.
#[derive(Clone)]
pub struct AssemblerDeps {
    pub channel: Arc<dyn RemoteChannel>,
    pub uploader: Arc<dyn MediaUploader>,
    /// `None` disables push dispatch.
    pub notifier: Option<Arc<dyn Notifier>>,
    pub notices: NoticeBus,
}

struct Pending {
    echo: Message,
    /// Channel key once the write has landed.
    landed: Option<MessageId>,
}

#[derive(Default)]
struct View {
    window: usize,
    generation: u64,
    confirmed: Vec<Message>,
    pending: Vec<Pending>,
    settings: ChatSettings,
}

impl View {
    /// Confirmed messages plus echoes the channel has not delivered yet,
    /// ascending by timestamp.
    fn materialized(&self) -> Vec<Message> {
        let mut all = self.confirmed.clone();
        for pending in &self.pending {
            let id = pending.landed.as_ref().unwrap_or(&pending.echo.id);
            if self.confirmed.iter().any(|m| &m.id == id) {
                continue;
            }
            let mut echo = pending.echo.clone();
            echo.id = id.clone();
            all.push(echo);
        }
        all.sort_by_key(|m| m.timestamp);
        all
    }

    fn visible(&self) -> Vec<Message> {
        self.materialized()
            .into_iter()
            .filter(|m| self.settings.is_visible(m))
            .collect()
    }
}

struct Shared {
    view: Mutex<View>,
    visible: watch::Sender<Vec<Message>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, View> {
        self.view.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, view: &View) {
        self.visible.send_replace(view.visible());
    }

    /// Replace the confirmed list with one window emission. Returns the
    /// ids the local user has received but not read, or `None` when the
    /// emission came from a superseded window.
    fn apply_window(&self, generation: u64, local: &UserId, entries: Vec<Entry>) -> Option<Vec<MessageId>> {
        let mut view = self.lock();
        if view.generation != generation {
            return None;
        }
        let mut confirmed: Vec<Message> = entries
            .iter()
            .filter_map(|entry| match Message::decode(&entry.key, &entry.value) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(error = %e, "Dropping malformed message");
                    None
                }
            })
            .collect();
        // stable: equal timestamps keep channel order
        confirmed.sort_by_key(|m| m.timestamp);
        let unread = confirmed
            .iter()
            .filter(|m| m.receiver_id.as_ref() == Some(local) && !m.read)
            .map(|m| m.id.clone())
            .collect();
        view.confirmed = confirmed;
        view.pending.retain(|p| p.landed.is_none());
        self.publish(&view);
        Some(unread)
    }

    fn apply_settings(&self, settings: ChatSettings) {
        let mut view = self.lock();
        if view.settings != settings {
            view.settings = settings;
            self.publish(&view);
        }
    }

    fn add_pending(&self, echo: Message) {
        let mut view = self.lock();
        view.pending.push(Pending { echo, landed: None });
        self.publish(&view);
    }

    fn land_pending(&self, echo: &MessageId, key: &MessageId) {
        let mut view = self.lock();
        if let Some(pending) = view.pending.iter_mut().find(|p| &p.echo.id == echo) {
            pending.landed = Some(key.clone());
        }
        self.publish(&view);
    }

    fn drop_pending(&self, echo: &MessageId) {
        let mut view = self.lock();
        view.pending.retain(|p| &p.echo.id != echo);
        self.publish(&view);
    }
}

pub struct MessageStreamAssembler {
    local: UserId,
    display_name: String,
    conversation: Conversation,
    deps: AssemblerDeps,
    page_increment: usize,
    shared: Arc<Shared>,
    window_task: Mutex<Option<AbortHandle>>,
    scope: TeardownScope,
}

impl MessageStreamAssembler {
    /// Open the view with the configured initial window and start
    /// following the channel. Must be called inside a Tokio runtime.
    pub fn open(
        local: &UserId,
        display_name: &str,
        conversation: Conversation,
        deps: AssemblerDeps,
        config: &ClientConfig,
    ) -> Self {
        let (visible, _) = watch::channel(Vec::new());
        let shared = Arc::new(Shared {
            view: Mutex::new(View {
                window: config.initial_window,
                ..View::default()
            }),
            visible,
        });
        let assembler = Self {
            local: local.clone(),
            display_name: display_name.to_string(),
            conversation,
            deps,
            page_increment: config.page_increment,
            shared,
            window_task: Mutex::new(None),
            scope: TeardownScope::new(),
        };
        assembler.follow_settings();
        assembler.open_window();
        debug!(
            conversation = %assembler.conversation.id,
            window = config.initial_window,
            "Opened message stream"
        );
        assembler
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Every assembled message, including hidden and pending ones.
    pub fn messages(&self) -> Vec<Message> {
        self.shared.lock().materialized()
    }

    /// Quote of a message currently in the view, for a reply draft.
    pub fn reply_to(&self, id: &MessageId) -> Option<ReplySnapshot> {
        self.shared
            .lock()
            .materialized()
            .iter()
            .find(|m| &m.id == id)
            .map(ReplySnapshot::of)
    }

    /// The externally observable sequence: assembled messages newer than
    /// the viewer's clear threshold.
    pub fn visible(&self) -> Vec<Message> {
        self.shared.visible.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<Message>> {
        self.shared.visible.subscribe()
    }

    pub fn window_size(&self) -> usize {
        self.shared.lock().window
    }

    /// Widen the window by one page and re-subscribe. Returns the new size.
    pub fn load_older(&self) -> usize {
        let window = {
            let mut view = self.shared.lock();
            view.window += self.page_increment;
            view.window
        };
        self.open_window();
        debug!(conversation = %self.conversation.id, window, "Loading older messages");
        window
    }

    /// Send a draft. Empty drafts are ignored. Returns the channel key of
    /// the new message.
    pub async fn send(&self, draft: MessageDraft) -> Result<Option<MessageId>> {
        if draft.is_empty() {
            return Ok(None);
        }
        let cid = self.conversation.id.clone();
        let timestamp = now_millis();

        let echo = Message {
            id: MessageId(format!("pending-{}", Uuid::new_v4())),
            sender_id: self.local.clone(),
            receiver_id: self.conversation.receiver(&self.local),
            text: draft.text,
            image: draft.image.as_ref().map(Attachment::preview_uri),
            audio: draft.audio.as_ref().map(Attachment::preview_uri),
            timestamp,
            read: false,
            edited: false,
            reactions: Default::default(),
            reply_to: draft.reply_to,
        };
        self.shared.add_pending(echo.clone());

        let mut message = echo.clone();
        if let Some(image) = &draft.image {
            message.image = Some(self.upload_or_inline(image).await);
        }
        if let Some(audio) = &draft.audio {
            message.audio = Some(self.upload_or_inline(audio).await);
        }

        let key = match self.deps.channel.push(&paths::messages(&cid), message.to_value()).await {
            Ok(key) => MessageId(key),
            Err(e) => {
                self.shared.drop_pending(&echo.id);
                return Err(self.surfaced(NoticeKind::SendFailed, e));
            }
        };
        self.shared.land_pending(&echo.id, &key);
        info!(conversation = %cid, message = %key, "Message sent");

        let preview = message.preview();
        let meta = ConversationMeta {
            participants: self.conversation.participants.clone(),
            last_message: preview.clone(),
            last_message_timestamp: timestamp,
            last_sender_id: Some(self.local.clone()),
        };
        if let Err(e) = self.update_meta(&meta).await {
            warn!(conversation = %cid, error = %e, "Failed to update conversation metadata");
        }

        self.dispatch_notifications(&preview);
        self.heal_indices().await;
        Ok(Some(key))
    }

    async fn update_meta(&self, meta: &ConversationMeta) -> Result<()> {
        let value = serde_json::to_value(meta)?;
        self.deps
            .channel
            .merge(&paths::conversation_meta(&self.conversation.id), value)
            .await?;
        Ok(())
    }

    /// Overwrite the text of one of the local user's messages.
    pub async fn edit(&self, id: &MessageId, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(ChatError::InvalidState("message text cannot be empty".to_string()));
        }
        let path = self.authored(id).await?;
        self.deps
            .channel
            .merge(&path, json!({ "text": text, "edited": true }))
            .await
            .map_err(|e| self.surfaced(NoticeKind::EditFailed, e))?;
        debug!(message = %id, "Message edited");
        Ok(())
    }

    /// Remove one of the local user's messages for everyone.
    pub async fn delete(&self, id: &MessageId) -> Result<()> {
        let path = self.authored(id).await?;
        self.deps
            .channel
            .delete(&path)
            .await
            .map_err(|e| self.surfaced(NoticeKind::DeleteFailed, e))?;
        debug!(message = %id, "Message deleted");
        Ok(())
    }

    /// Toggle the local user's `emoji` reaction. Returns whether the user
    /// is now among its reactors.
    ///
    /// The reactor set is read and written back without a transaction, so
    /// two users toggling the same emoji at once race; the last write of
    /// that emoji key wins.
    pub async fn react(&self, id: &MessageId, emoji: &str) -> Result<bool> {
        if emoji.is_empty() {
            return Err(ChatError::InvalidState("empty reaction".to_string()));
        }
        let cid = &self.conversation.id;
        let path = paths::message(cid, id);
        let value = self
            .deps
            .channel
            .read(&path)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("message {id}")))?;
        let message = Message::decode(id.as_str(), &value)?;

        let mut reactors = message.reactors(emoji).cloned().unwrap_or_default();
        let reacted = if reactors.remove(&self.local) {
            false
        } else {
            reactors.insert(self.local.clone());
            true
        };

        let key = paths::reaction(cid, id, emoji);
        let written = if reactors.is_empty() {
            self.deps.channel.delete(&key).await
        } else {
            match serde_json::to_value(&reactors) {
                Ok(value) => self.deps.channel.write(&key, value).await,
                Err(e) => Err(e.into()),
            }
        };
        written.map_err(|e| self.surfaced(NoticeKind::ReactionFailed, e))?;
        Ok(reacted)
    }

    /// Hide everything sent so far from the local user's view only.
    pub async fn clear_chat(&self) -> Result<()> {
        let path = paths::chat_settings(&self.local, &self.conversation.id);
        self.deps
            .channel
            .merge(&path, json!({ "lastClearedTimestamp": now_millis() }))
            .await
            .map_err(|e| self.surfaced(NoticeKind::SettingsFailed, e))?;
        Ok(())
    }

    /// Undo [`clear_chat`](Self::clear_chat).
    pub async fn restore_cleared(&self) -> Result<()> {
        let path = format!(
            "{}/lastClearedTimestamp",
            paths::chat_settings(&self.local, &self.conversation.id)
        );
        self.deps
            .channel
            .delete(&path)
            .await
            .map_err(|e| self.surfaced(NoticeKind::SettingsFailed, e))?;
        Ok(())
    }

    /// Stop following the channel. Idempotent; also happens on drop.
    pub fn close(&self) {
        self.scope.close();
    }

    fn open_window(&self) {
        let (generation, window) = {
            let mut view = self.shared.lock();
            view.generation += 1;
            (view.generation, view.window)
        };
        let mut window_sub =
            self.deps
                .channel
                .subscribe_windowed(&paths::messages(&self.conversation.id), "timestamp", window);
        let shared = Arc::clone(&self.shared);
        let channel = Arc::clone(&self.deps.channel);
        let local = self.local.clone();
        let cid = self.conversation.id.clone();

        let handle = tokio::spawn(async move {
            while let Some(entries) = window_sub.next().await {
                let Some(unread) = shared.apply_window(generation, &local, entries) else {
                    break;
                };
                for id in unread {
                    mark_read(Arc::clone(&channel), &cid, id);
                }
            }
        });
        let previous = self
            .window_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }
        self.scope.track(handle);
    }

    fn follow_settings(&self) {
        let path = paths::chat_settings(&self.local, &self.conversation.id);
        let mut settings_sub = self.deps.channel.subscribe(&path);
        let shared = Arc::clone(&self.shared);
        self.scope.spawn(async move {
            while let Some(value) = settings_sub.next().await {
                let settings = match value {
                    None => ChatSettings::default(),
                    Some(value) => decode(&path, &value).unwrap_or_else(|e| {
                        warn!(error = %e, "Ignoring malformed chat settings");
                        ChatSettings::default()
                    }),
                };
                shared.apply_settings(settings);
            }
        });
    }

    async fn upload_or_inline(&self, attachment: &Attachment) -> String {
        match self.deps.uploader.upload(attachment).await {
            Ok(url) => url,
            Err(e) => {
                warn!(
                    content_type = %attachment.content_type,
                    error = %e,
                    "Upload failed, embedding local preview"
                );
                attachment.preview_uri()
            }
        }
    }

    fn dispatch_notifications(&self, preview: &str) {
        let Some(notifier) = &self.deps.notifier else {
            return;
        };
        for receiver in self.conversation.others(&self.local) {
            let notifier = Arc::clone(notifier);
            let request = NotifyRequest {
                receiver_id: receiver.clone(),
                title: self.display_name.clone(),
                body: preview.to_string(),
                chat_id: self.conversation.id.clone(),
            };
            tokio::spawn(async move {
                if let Err(e) = notifier.notify(&request).await {
                    warn!(receiver = %request.receiver_id.short(), error = %e, "Push dispatch failed");
                }
            });
        }
    }

    /// Make sure every participant's conversation index lists this
    /// conversation, so a first message is enough to show up everywhere.
    async fn heal_indices(&self) {
        let mut entry = Map::new();
        entry.insert(self.conversation.id.to_string(), Value::Bool(true));
        let entry = Value::Object(entry);
        for participant in &self.conversation.participants {
            if let Err(e) = self
                .deps
                .channel
                .merge(&paths::user_chats(participant), entry.clone())
                .await
            {
                warn!(user = %participant.short(), error = %e, "Failed to update conversation index");
            }
        }
    }

    /// Path of `id` after checking it exists and the local user wrote it.
    async fn authored(&self, id: &MessageId) -> Result<String> {
        let path = paths::message(&self.conversation.id, id);
        let value = self
            .deps
            .channel
            .read(&path)
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("message {id}")))?;
        let message = Message::decode(id.as_str(), &value)?;
        if message.sender_id != self.local {
            return Err(ChatError::NotAuthor);
        }
        Ok(path)
    }

    fn surfaced(&self, kind: NoticeKind, error: ChannelError) -> ChatError {
        self.deps.notices.emit(kind, error.to_string());
        error.into()
    }
}

fn mark_read(channel: Arc<dyn RemoteChannel>, conversation: &ConversationId, id: MessageId) {
    let path = paths::message(conversation, &id);
    tokio::spawn(async move {
        match mark_read_if_present(channel.as_ref(), &path).await {
            Ok(true) => {}
            Ok(false) => debug!(message = %id, "Message gone before it was marked read"),
            Err(e) => warn!(message = %id, error = %e, "Failed to mark message read"),
        }
    });
}

/// A merge would recreate a message deleted since the emission that showed
/// it, leaving an undecodable `{read: true}` stub behind.
async fn mark_read_if_present(channel: &dyn RemoteChannel, path: &str) -> std::result::Result<bool, ChannelError> {
    if channel.read(&format!("{path}/senderId")).await?.is_none() {
        return Ok(false);
    }
    channel.merge(path, json!({ "read": true })).await?;
    Ok(true)
}
