//! The remote channel contract.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::Result;

/// Sentinel the channel replaces with its own clock when the write is
/// applied. Used for `lastSeen` stamps written by disconnect hooks.
pub fn server_timestamp() -> Value {
    json!({ ".sv": "timestamp" })
}

/// One child of a windowed subscription, in channel order.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub key: String,
    pub value: Value,
}

/// Real-time document store addressed by `/`-separated key paths.
///
/// Subscriptions fire once with the current state as soon as they are
/// opened, then again on every change to the path, its descendants or its
/// ancestors. Delivery is at-least-once: a snapshot identical to the
/// previous one may be delivered again.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Point read. `None` when nothing is stored at `path`.
    async fn read(&self, path: &str) -> Result<Option<Value>>;

    /// Replace the node at `path`. Writing `null` deletes it.
    async fn write(&self, path: &str, value: Value) -> Result<()>;

    /// Append a child under `path` with a fresh, monotonically increasing
    /// key and return that key.
    async fn push(&self, path: &str, value: Value) -> Result<String>;

    /// Merge `partial` (an object) into the node at `path`. Keys may be
    /// relative paths; `null` values delete the child.
    async fn merge(&self, path: &str, partial: Value) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    fn subscribe(&self, path: &str) -> Subscription<Option<Value>>;

    /// Live view of the last `limit` children of `path`, ordered by the
    /// child field `order_field` and then by key.
    fn subscribe_windowed(
        &self,
        path: &str,
        order_field: &str,
        limit: usize,
    ) -> Subscription<Vec<Entry>>;

    /// Connectivity of this session to the channel.
    fn subscribe_connected(&self) -> Subscription<bool>;

    /// Register a write the channel performs on this session's behalf when
    /// the connection drops, including crashes and network loss.
    async fn on_disconnect_do(&self, path: &str, value: Value) -> Result<()>;
}

/// Handle on a live listener. Dropping it (or calling
/// [`Subscription::unsubscribe`]) detaches the listener from the channel.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<T>,
    disposer: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl<T> Subscription<T> {
    pub fn new(rx: mpsc::UnboundedReceiver<T>, disposer: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            rx,
            disposer: Some(Box::new(disposer)),
        }
    }

    /// Subscription fed by a sender the caller keeps, with nothing to detach.
    pub fn detached(rx: mpsc::UnboundedReceiver<T>) -> Self {
        Self { rx, disposer: None }
    }

    /// Wait for the next emission. `None` once the channel side is gone.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Most recent emission already delivered, skipping older queued ones.
    pub fn latest(&mut self) -> Option<T> {
        let mut last = None;
        while let Ok(item) = self.rx.try_recv() {
            last = Some(item);
        }
        last
    }

    pub fn unsubscribe(mut self) {
        self.dispose();
    }

    fn dispose(&mut self) {
        self.rx.close();
        if let Some(disposer) = self.disposer.take() {
            disposer();
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.disposer.is_some())
            .finish()
    }
}
