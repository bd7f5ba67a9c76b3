//! In-process remote channel.
//!
//! [`MemoryHub`] holds one JSON tree shared by every connection made with
//! [`MemoryHub::connect`]. Each [`MemoryChannel`] is one client session with
//! its own connectivity flag and disconnect hooks, so several clients (a
//! caller and a callee, two chat participants) can run against the same
//! hub inside one process.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::channel::{Entry, RemoteChannel, Subscription};
use crate::{ChannelError, Result};

type Path = Vec<String>;

enum Sink {
    Point(mpsc::UnboundedSender<Option<Value>>),
    Window {
        order_field: String,
        limit: usize,
        tx: mpsc::UnboundedSender<Vec<Entry>>,
    },
    Connected {
        connection: u64,
        tx: mpsc::UnboundedSender<bool>,
    },
}

struct Listener {
    path: Path,
    sink: Sink,
}

#[derive(Default)]
struct Connection {
    connected: bool,
    hooks: Vec<(Path, Value)>,
}

struct State {
    root: Value,
    push_seq: u64,
    next_id: u64,
    listeners: HashMap<u64, Listener>,
    connections: HashMap<u64, Connection>,
    faults: Vec<Path>,
}

struct Inner {
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared in-memory store.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<Inner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    root: Value::Object(Map::new()),
                    push_seq: 0,
                    next_id: 0,
                    listeners: HashMap::new(),
                    connections: HashMap::new(),
                    faults: Vec::new(),
                }),
            }),
        }
    }

    /// Open a new client session on the hub.
    pub fn connect(&self) -> MemoryChannel {
        let mut state = self.inner.lock();
        let connection = state.alloc_id();
        state.connections.insert(
            connection,
            Connection {
                connected: true,
                hooks: Vec::new(),
            },
        );
        debug!(connection, "Memory channel connected");
        MemoryChannel {
            inner: self.inner.clone(),
            connection,
        }
    }

    /// Synchronous point read, for inspection.
    pub fn snapshot(&self, path: &str) -> Option<Value> {
        let path = parse_path(path).ok()?;
        get(&self.inner.lock().root, &path).cloned()
    }

    /// Make every mutation at or below `prefix` fail until the faults are
    /// cleared.
    pub fn fail_writes_under(&self, prefix: &str) {
        if let Ok(path) = parse_path(prefix) {
            self.inner.lock().faults.push(path);
        }
    }

    pub fn clear_faults(&self) {
        self.inner.lock().faults.clear();
    }

    /// Number of live listeners across all connections.
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One client session on a [`MemoryHub`].
pub struct MemoryChannel {
    inner: Arc<Inner>,
    connection: u64,
}

impl MemoryChannel {
    /// Simulate the connection dropping: registered disconnect hooks are
    /// applied and connectivity listeners observe `false`.
    pub fn disconnect(&self) {
        let mut state = self.inner.lock();
        let hooks = match state.connections.get_mut(&self.connection) {
            Some(conn) if conn.connected => {
                conn.connected = false;
                std::mem::take(&mut conn.hooks)
            }
            _ => return,
        };
        debug!(
            connection = self.connection,
            hooks = hooks.len(),
            "Memory channel disconnected"
        );
        for (path, value) in hooks {
            state.apply(&path, normalize(value, now_millis()));
        }
        state.notify_connectivity(self.connection, false);
    }

    pub fn reconnect(&self) {
        let mut state = self.inner.lock();
        match state.connections.get_mut(&self.connection) {
            Some(conn) if !conn.connected => conn.connected = true,
            _ => return,
        }
        debug!(connection = self.connection, "Memory channel reconnected");
        state.notify_connectivity(self.connection, true);
    }

    fn mutate(&self, path: &str, op: impl FnOnce(&mut State, &Path) -> Result<()>) -> Result<()> {
        let path = parse_path(path)?;
        let mut state = self.inner.lock();
        state.check_faults(&path)?;
        op(&mut state, &path)?;
        state.notify(&path);
        Ok(())
    }

    /// Emit the current value and attach the listener under one lock, so
    /// no write can land between the two.
    fn register(&self, path: Path, sink: Sink) -> (u64, Weak<Inner>) {
        let mut state = self.inner.lock();
        state.prime(&path, &sink);
        let id = state.alloc_id();
        state.listeners.insert(id, Listener { path, sink });
        (id, Arc::downgrade(&self.inner))
    }
}

fn disposer(id: u64, inner: Weak<Inner>) -> impl FnOnce() + Send + Sync + 'static {
    move || {
        if let Some(inner) = inner.upgrade() {
            inner.lock().listeners.remove(&id);
            trace!(listener = id, "Listener disposed");
        }
    }
}

#[async_trait]
impl RemoteChannel for MemoryChannel {
    async fn read(&self, path: &str) -> Result<Option<Value>> {
        let path = parse_path(path)?;
        Ok(get(&self.inner.lock().root, &path).cloned())
    }

    async fn write(&self, path: &str, value: Value) -> Result<()> {
        self.mutate(path, |state, path| {
            state.apply(path, normalize(value, now_millis()));
            Ok(())
        })
    }

    async fn push(&self, path: &str, value: Value) -> Result<String> {
        let mut key = String::new();
        self.mutate(path, |state, path| {
            state.push_seq += 1;
            key = format!("m{:019}", state.push_seq);
            let mut child = path.clone();
            child.push(key.clone());
            state.apply(&child, normalize(value, now_millis()));
            Ok(())
        })?;
        Ok(key)
    }

    async fn merge(&self, path: &str, partial: Value) -> Result<()> {
        let Value::Object(fields) = partial else {
            return Err(ChannelError::Serialization(
                "merge expects an object".to_string(),
            ));
        };
        let mut children = Vec::with_capacity(fields.len());
        for (key, value) in fields {
            children.push((parse_path(&key)?, value));
        }
        self.mutate(path, |state, path| {
            let now = now_millis();
            for (rel, value) in children {
                let mut child = path.clone();
                child.extend(rel);
                state.apply(&child, normalize(value, now));
            }
            Ok(())
        })
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.mutate(path, |state, path| {
            state.apply(path, None);
            Ok(())
        })
    }

    fn subscribe(&self, path: &str) -> Subscription<Option<Value>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let Ok(path) = parse_path(path) else {
            return Subscription::detached(rx);
        };
        let (id, weak) = self.register(path, Sink::Point(tx));
        Subscription::new(rx, disposer(id, weak))
    }

    fn subscribe_windowed(
        &self,
        path: &str,
        order_field: &str,
        limit: usize,
    ) -> Subscription<Vec<Entry>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let Ok(path) = parse_path(path) else {
            return Subscription::detached(rx);
        };
        let sink = Sink::Window {
            order_field: order_field.to_string(),
            limit,
            tx,
        };
        let (id, weak) = self.register(path, sink);
        Subscription::new(rx, disposer(id, weak))
    }

    fn subscribe_connected(&self) -> Subscription<bool> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Sink::Connected {
            connection: self.connection,
            tx,
        };
        let (id, weak) = self.register(Vec::new(), sink);
        Subscription::new(rx, disposer(id, weak))
    }

    async fn on_disconnect_do(&self, path: &str, value: Value) -> Result<()> {
        let path = parse_path(path)?;
        let mut state = self.inner.lock();
        state.check_faults(&path)?;
        match state.connections.get_mut(&self.connection) {
            Some(conn) => {
                conn.hooks.push((path, value));
                Ok(())
            }
            None => Err(ChannelError::Unavailable {
                path: path.join("/"),
                reason: "connection closed".to_string(),
            }),
        }
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.disconnect();
        let mut state = self.inner.lock();
        state.connections.remove(&self.connection);
        let connection = self.connection;
        state.listeners.retain(|_, l| {
            !matches!(l.sink, Sink::Connected { connection: c, .. } if c == connection)
        });
    }
}

impl State {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn prime(&self, path: &Path, sink: &Sink) {
        let _delivered = match sink {
            Sink::Point(tx) => tx.send(get(&self.root, path).cloned()).is_ok(),
            Sink::Window {
                order_field,
                limit,
                tx,
            } => tx
                .send(window(&self.root, path, order_field, *limit))
                .is_ok(),
            Sink::Connected { connection, tx } => tx
                .send(
                    self.connections
                        .get(connection)
                        .is_some_and(|c| c.connected),
                )
                .is_ok(),
        };
    }

    fn check_faults(&self, path: &Path) -> Result<()> {
        if self.faults.iter().any(|f| path.starts_with(f)) {
            return Err(ChannelError::Unavailable {
                path: path.join("/"),
                reason: "injected fault".to_string(),
            });
        }
        Ok(())
    }

    fn apply(&mut self, path: &Path, value: Option<Value>) {
        match value {
            Some(value) => set(&mut self.root, path, value),
            None => remove(&mut self.root, path),
        }
    }

    /// Fan the change at `changed` out to every listener on a related path.
    fn notify(&mut self, changed: &Path) {
        let root = &self.root;
        let mut dead = Vec::new();
        for (id, listener) in &self.listeners {
            let related =
                listener.path.starts_with(changed) || changed.starts_with(&listener.path);
            let delivered = match &listener.sink {
                Sink::Point(tx) if related => tx.send(get(root, &listener.path).cloned()).is_ok(),
                Sink::Window {
                    order_field,
                    limit,
                    tx,
                } if related => tx
                    .send(window(root, &listener.path, order_field, *limit))
                    .is_ok(),
                _ => true,
            };
            if !delivered {
                dead.push(*id);
            }
        }
        for id in dead {
            self.listeners.remove(&id);
        }
    }

    fn notify_connectivity(&mut self, connection: u64, connected: bool) {
        self.listeners.retain(|_, l| match &l.sink {
            Sink::Connected { connection: c, tx } if *c == connection => tx.send(connected).is_ok(),
            _ => true,
        });
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn parse_path(path: &str) -> Result<Path> {
    let mut segments = Vec::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if segment.contains(['.', '#', '$', '[', ']']) {
            return Err(ChannelError::InvalidPath(path.to_string()));
        }
        segments.push(segment.to_string());
    }
    Ok(segments)
}

fn get<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut node = root;
    for segment in path {
        node = node.as_object()?.get(segment)?;
    }
    Some(node)
}

fn ensure_object(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced with an object"),
    }
}

fn set(root: &mut Value, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *root = value;
        return;
    };
    let mut node = root;
    for segment in parents {
        node = ensure_object(node)
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    ensure_object(node).insert(last.clone(), value);
}

/// Remove the node at `path` and prune ancestors left empty.
fn remove(node: &mut Value, path: &[String]) {
    let Some((head, rest)) = path.split_first() else {
        *node = Value::Object(Map::new());
        return;
    };
    let Some(map) = node.as_object_mut() else {
        return;
    };
    if rest.is_empty() {
        map.remove(head);
        return;
    }
    if let Some(child) = map.get_mut(head) {
        remove(child, rest);
        if is_empty(child) {
            map.remove(head);
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn is_server_timestamp(map: &Map<String, Value>) -> bool {
    map.len() == 1 && map.get(".sv").and_then(Value::as_str) == Some("timestamp")
}

/// Resolve server-value sentinels and drop nulls and empty objects, which
/// the store never holds.
fn normalize(value: Value, now: i64) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) if is_server_timestamp(&map) => Some(Value::from(now)),
        Value::Object(map) => {
            let map: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| normalize(v, now).map(|v| (k, v)))
                .collect();
            (!map.is_empty()).then_some(Value::Object(map))
        }
        other => Some(other),
    }
}

fn window(root: &Value, path: &[String], order_field: &str, limit: usize) -> Vec<Entry> {
    let Some(Value::Object(children)) = get(root, path) else {
        return Vec::new();
    };
    let mut entries: Vec<Entry> = children
        .iter()
        .map(|(key, value)| Entry {
            key: key.clone(),
            value: value.clone(),
        })
        .collect();
    entries.sort_by(|a, b| {
        let order = |e: &Entry| e.value.get(order_field).and_then(Value::as_f64);
        order(a)
            .partial_cmp(&order(b))
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.key.cmp(&b.key))
    });
    let skip = entries.len().saturating_sub(limit);
    entries.split_off(skip)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::server_timestamp;
    use serde_json::json;

    #[tokio::test]
    async fn point_subscription_sees_current_then_changes() {
        let hub = MemoryHub::new();
        let ch = hub.connect();
        ch.write("users/a", json!({ "name": "Alice" })).await.unwrap();

        let mut sub = ch.subscribe("users/a/name");
        assert_eq!(sub.next().await, Some(Some(json!("Alice"))));

        ch.merge("users/a", json!({ "name": "Alicia" })).await.unwrap();
        assert_eq!(sub.next().await, Some(Some(json!("Alicia"))));

        ch.delete("users/a").await.unwrap();
        assert_eq!(sub.next().await, Some(None));
    }

    #[tokio::test]
    async fn unrelated_paths_do_not_fire() {
        let hub = MemoryHub::new();
        let ch = hub.connect();
        let mut sub = ch.subscribe("typing/c1");
        assert_eq!(sub.next().await, Some(None));
        ch.write("typing/c2/a", json!({ "isTyping": true, "timestamp": 1 }))
            .await
            .unwrap();
        assert_eq!(sub.latest(), None);
    }

    #[tokio::test]
    async fn push_keys_are_monotonic() {
        let hub = MemoryHub::new();
        let ch = hub.connect();
        let k1 = ch.push("messages/c", json!({ "t": 1 })).await.unwrap();
        let k2 = ch.push("messages/c", json!({ "t": 2 })).await.unwrap();
        let k3 = ch.push("messages/other", json!({ "t": 3 })).await.unwrap();
        assert!(k1 < k2 && k2 < k3);
    }

    #[tokio::test]
    async fn windowed_subscription_orders_and_limits() {
        let hub = MemoryHub::new();
        let ch = hub.connect();
        for ts in [30, 10, 20, 20, 40] {
            ch.push("messages/c", json!({ "timestamp": ts })).await.unwrap();
        }
        let mut sub = ch.subscribe_windowed("messages/c", "timestamp", 3);
        let entries = sub.next().await.unwrap();
        let ts: Vec<i64> = entries
            .iter()
            .map(|e| e.value["timestamp"].as_i64().unwrap())
            .collect();
        assert_eq!(ts, vec![20, 30, 40]);
        // equal timestamps keep insertion order
        let all = window(&hub.inner.lock().root, &["messages".into(), "c".into()], "timestamp", 10);
        assert!(all[1].key < all[2].key);
    }

    #[tokio::test]
    async fn merge_supports_relative_paths_and_null_deletes() {
        let hub = MemoryHub::new();
        let ch = hub.connect();
        ch.write("m/1", json!({ "text": "a", "reactions": { "x": ["u"] } }))
            .await
            .unwrap();
        ch.merge("m/1", json!({ "reactions/x": null, "edited": true }))
            .await
            .unwrap();
        assert_eq!(hub.snapshot("m/1"), Some(json!({ "text": "a", "edited": true })));
    }

    #[tokio::test]
    async fn deletes_prune_empty_parents() {
        let hub = MemoryHub::new();
        let ch = hub.connect();
        ch.write("typing/c/a", json!({ "isTyping": true, "timestamp": 1 }))
            .await
            .unwrap();
        ch.delete("typing/c/a").await.unwrap();
        assert_eq!(hub.snapshot("typing"), None);
    }

    #[tokio::test]
    async fn disconnect_hooks_fire_with_server_time() {
        let hub = MemoryHub::new();
        let ch = hub.connect();
        let observer = hub.connect();
        let mut connected = ch.subscribe_connected();
        assert_eq!(connected.next().await, Some(true));

        ch.on_disconnect_do("status/a", json!({ "status": "offline", "lastSeen": server_timestamp() }))
            .await
            .unwrap();
        ch.write("status/a", json!({ "status": "online" })).await.unwrap();
        let mut status = observer.subscribe("status/a");
        assert_eq!(status.next().await.unwrap().unwrap()["status"], "online");

        ch.disconnect();
        assert_eq!(connected.next().await, Some(false));
        let record = status.next().await.unwrap().unwrap();
        assert_eq!(record["status"], "offline");
        assert!(record["lastSeen"].as_i64().unwrap() > 0);

        ch.reconnect();
        assert_eq!(connected.next().await, Some(true));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn subscribing_never_misses_a_concurrent_write() {
        let hub = MemoryHub::new();
        let writer = Arc::new(hub.connect());
        let reader = hub.connect();
        for i in 0..2_000 {
            let path = format!("race/{i}");
            let task = {
                let writer = Arc::clone(&writer);
                let path = path.clone();
                tokio::spawn(async move { writer.write(&path, json!(i)).await })
            };
            let mut sub = reader.subscribe(&path);
            task.await.unwrap().unwrap();
            assert_eq!(sub.latest(), Some(Some(json!(i))), "stale subscription at {path}");
        }
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_detached() {
        let hub = MemoryHub::new();
        let ch = hub.connect();
        let sub = ch.subscribe("a");
        let win = ch.subscribe_windowed("b", "timestamp", 5);
        assert_eq!(hub.listener_count(), 2);
        drop(sub);
        win.unsubscribe();
        assert_eq!(hub.listener_count(), 0);
    }

    #[tokio::test]
    async fn injected_faults_fail_mutations_only() {
        let hub = MemoryHub::new();
        let ch = hub.connect();
        hub.fail_writes_under("messages");
        let err = ch.push("messages/c", json!({ "x": 1 })).await.unwrap_err();
        assert!(matches!(err, ChannelError::Unavailable { .. }));
        assert!(ch.read("messages/c").await.unwrap().is_none());
        ch.write("chats/c", json!({ "x": 1 })).await.unwrap();
        hub.clear_faults();
        ch.push("messages/c", json!({ "x": 1 })).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_invalid_paths() {
        let hub = MemoryHub::new();
        let ch = hub.connect();
        assert!(matches!(
            ch.write("users/a.b", json!(1)).await,
            Err(ChannelError::InvalidPath(_))
        ));
    }
}
