use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chatline_media::CallTokenProvider;
use chatline_shared::api::{NotifyRequest, NotifyResponse};
use chatline_shared::models::Attachment;
use chatline_shared::types::{ConversationId, MessageId, UserId};
use chatline_shared::{paths, ChatError};
use chatline_store::{Entry, MemoryChannel, RemoteChannel, Subscription};
use serde_json::{json, Value};
use tokio::sync::Notify;

use crate::notify::Notifier;
use crate::upload::MediaUploader;

pub const WAIT: Duration = Duration::from_secs(2);

/// Poll `cond` until it holds, panicking after [`WAIT`].
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn seed_message(
    channel: &dyn RemoteChannel,
    conversation: &ConversationId,
    from: &UserId,
    to: Option<&UserId>,
    text: &str,
    timestamp: i64,
) -> MessageId {
    let mut value = json!({
        "senderId": from,
        "text": text,
        "timestamp": timestamp,
        "read": false,
    });
    if let Some(to) = to {
        value["receiverId"] = json!(to);
    }
    MessageId(channel.push(&paths::messages(conversation), value).await.unwrap())
}

/// Channel whose next write, once armed, waits until released.
pub struct GatedChannel {
    inner: MemoryChannel,
    armed: AtomicBool,
    entered: Notify,
    gate: Notify,
}

impl GatedChannel {
    pub fn new(inner: MemoryChannel) -> Self {
        Self {
            inner,
            armed: AtomicBool::new(false),
            entered: Notify::new(),
            gate: Notify::new(),
        }
    }

    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Resolves once the armed write is parked on the gate.
    pub async fn held(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl RemoteChannel for GatedChannel {
    async fn read(&self, path: &str) -> chatline_store::Result<Option<Value>> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, value: Value) -> chatline_store::Result<()> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.gate.notified().await;
        }
        self.inner.write(path, value).await
    }

    async fn push(&self, path: &str, value: Value) -> chatline_store::Result<String> {
        self.inner.push(path, value).await
    }

    async fn merge(&self, path: &str, partial: Value) -> chatline_store::Result<()> {
        self.inner.merge(path, partial).await
    }

    async fn delete(&self, path: &str) -> chatline_store::Result<()> {
        self.inner.delete(path).await
    }

    fn subscribe(&self, path: &str) -> Subscription<Option<Value>> {
        self.inner.subscribe(path)
    }

    fn subscribe_windowed(&self, path: &str, order_field: &str, limit: usize) -> Subscription<Vec<Entry>> {
        self.inner.subscribe_windowed(path, order_field, limit)
    }

    fn subscribe_connected(&self) -> Subscription<bool> {
        self.inner.subscribe_connected()
    }

    async fn on_disconnect_do(&self, path: &str, value: Value) -> chatline_store::Result<()> {
        self.inner.on_disconnect_do(path, value).await
    }
}

pub struct StaticUploader(pub String);

impl Default for StaticUploader {
    fn default() -> Self {
        Self("https://cdn.example.com/upload.bin".to_string())
    }
}

#[async_trait]
impl MediaUploader for StaticUploader {
    async fn upload(&self, _attachment: &Attachment) -> Result<String, ChatError> {
        Ok(self.0.clone())
    }
}

pub struct FailingUploader;

#[async_trait]
impl MediaUploader for FailingUploader {
    async fn upload(&self, _attachment: &Attachment) -> Result<String, ChatError> {
        Err(ChatError::Upload("storage unreachable".to_string()))
    }
}

/// Holds every upload until the gate is opened.
pub struct GatedUploader {
    gate: Arc<Notify>,
    url: String,
}

impl GatedUploader {
    pub fn new(gate: Arc<Notify>, url: &str) -> Self {
        Self {
            gate,
            url: url.to_string(),
        }
    }
}

#[async_trait]
impl MediaUploader for GatedUploader {
    async fn upload(&self, _attachment: &Attachment) -> Result<String, ChatError> {
        self.gate.notified().await;
        Ok(self.url.clone())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<NotifyRequest>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<NotifyRequest> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, request: &NotifyRequest) -> Result<NotifyResponse, ChatError> {
        self.sent.lock().unwrap().push(request.clone());
        Ok(NotifyResponse {
            success: true,
            notification_id: Some("n-1".to_string()),
            error: None,
        })
    }
}

pub struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn notify(&self, _request: &NotifyRequest) -> Result<NotifyResponse, ChatError> {
        Err(ChatError::Http("push provider down".to_string()))
    }
}

pub struct StaticTokens;

#[async_trait]
impl CallTokenProvider for StaticTokens {
    async fn fetch_token(&self, user: &UserId) -> Result<String, ChatError> {
        Ok(format!("token-{user}"))
    }
}
