//! Typing indicators.
//!
//! [`TypingCoalescer`] turns keystrokes into at most one write per idle
//! window and withdraws the signal after the user stops. A typing node
//! exists only while its owner is typing; the store has no expiry of its
//! own, so every coalescer must be torn down when its view goes away.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chatline_shared::constants::TYPING_FRESHNESS_MS;
use chatline_shared::models::TypingSignal;
use chatline_shared::types::{now_millis, ConversationId, UserId};
use chatline_shared::{paths, ChatError};
use chatline_store::{RemoteChannel, TeardownScope};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Default)]
struct CoalescerState {
    last_publish: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    /// Bumped whenever the signal is withdrawn.
    withdrawals: u64,
    closed: bool,
}

pub struct TypingCoalescer {
    channel: Arc<dyn RemoteChannel>,
    path: String,
    idle: Duration,
    state: Arc<Mutex<CoalescerState>>,
}

fn lock(state: &Mutex<CoalescerState>) -> MutexGuard<'_, CoalescerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TypingCoalescer {
    pub fn new(
        channel: Arc<dyn RemoteChannel>,
        conversation: &ConversationId,
        user: &UserId,
        idle: Duration,
    ) -> Self {
        Self {
            channel,
            path: paths::typing(conversation, user),
            idle,
            state: Arc::new(Mutex::new(CoalescerState::default())),
        }
    }

    /// Record a keystroke. Writes the typing node on the leading edge of
    /// each idle window and restarts the idle timer.
    pub async fn keystroke(&self) -> Result<(), ChatError> {
        let publish = {
            let mut state = lock(&self.state);
            if state.closed {
                return Ok(());
            }
            let now = Instant::now();
            let publish = state
                .last_publish
                .map_or(true, |at| now.duration_since(at) >= self.idle);
            if publish {
                state.last_publish = Some(now);
            }
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.timer = Some(self.spawn_idle_timer());
            publish.then_some(state.withdrawals)
        };
        let Some(withdrawals) = publish else {
            return Ok(());
        };
        self.channel
            .write(&self.path, json!({ "isTyping": true, "timestamp": now_millis() }))
            .await?;

        // a withdrawal that ran while the write was in flight may have
        // deleted the node before it landed
        let orphaned = {
            let state = lock(&self.state);
            state.withdrawals != withdrawals && (state.closed || state.last_publish.is_none())
        };
        if orphaned {
            debug!(path = %self.path, "Withdrawing typing signal that landed late");
            self.channel.delete(&self.path).await?;
        }
        Ok(())
    }

    /// Withdraw the signal now, e.g. after the message was sent.
    pub async fn stop(&self) -> Result<(), ChatError> {
        self.withdraw();
        self.channel.delete(&self.path).await?;
        Ok(())
    }

    /// Cancel the timer and delete the node before returning. Later
    /// keystrokes are ignored.
    pub async fn teardown(&self) -> Result<(), ChatError> {
        lock(&self.state).closed = true;
        self.stop().await?;
        debug!(path = %self.path, "Typing coalescer torn down");
        Ok(())
    }

    fn withdraw(&self) {
        let mut state = lock(&self.state);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.last_publish = None;
        state.withdrawals += 1;
    }

    fn spawn_idle_timer(&self) -> JoinHandle<()> {
        let channel = Arc::clone(&self.channel);
        let state = Arc::clone(&self.state);
        let path = self.path.clone();
        let idle = self.idle;
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            {
                let mut state = lock(&state);
                state.last_publish = None;
                state.timer = None;
                state.withdrawals += 1;
            }
            if let Err(e) = channel.delete(&path).await {
                warn!(path, error = %e, "Failed to withdraw typing signal");
            }
        })
    }
}

impl Drop for TypingCoalescer {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        state.closed = true;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if state.last_publish.take().is_none() {
            return;
        }
        // not torn down: withdraw the signal from whatever runtime is left
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let channel = Arc::clone(&self.channel);
            let path = self.path.clone();
            handle.spawn(async move {
                if let Err(e) = channel.delete(&path).await {
                    warn!(path, error = %e, "Failed to withdraw typing signal");
                }
            });
        }
    }
}

/// Who is typing in one open conversation. Trusts node existence.
pub struct TypingWatcher {
    typers: watch::Receiver<BTreeSet<UserId>>,
}

impl TypingWatcher {
    pub fn spawn(
        channel: &Arc<dyn RemoteChannel>,
        conversation: &ConversationId,
        local: &UserId,
        scope: &TeardownScope,
    ) -> Self {
        let mut nodes = channel.subscribe(&paths::typing_root(conversation));
        let (tx, rx) = watch::channel(BTreeSet::new());
        let local = local.clone();
        scope.spawn(async move {
            while let Some(value) = nodes.next().await {
                let typers: BTreeSet<UserId> = match value {
                    Some(Value::Object(nodes)) => nodes
                        .keys()
                        .filter(|uid| uid.as_str() != local.as_str())
                        .map(|uid| UserId::new(uid.as_str()))
                        .collect(),
                    _ => BTreeSet::new(),
                };
                tx.send_if_modified(|current| replace_if_changed(current, typers));
            }
        });
        Self { typers: rx }
    }

    pub fn typers(&self) -> BTreeSet<UserId> {
        self.typers.borrow().clone()
    }

    pub fn is_anyone_typing(&self) -> bool {
        !self.typers.borrow().is_empty()
    }

    pub fn watch(&self) -> watch::Receiver<BTreeSet<UserId>> {
        self.typers.clone()
    }
}

/// Who is typing across many conversations at once, for the conversation
/// list.
///
/// Deletions may be missed while a list watches many conversations, so a
/// signal only counts while it is fresher than [`TYPING_FRESHNESS_MS`].
/// Freshness is re-evaluated every second even without new emissions.
pub struct InboxTypingWatcher {
    typing: watch::Receiver<BTreeMap<ConversationId, BTreeSet<UserId>>>,
}

impl InboxTypingWatcher {
    pub fn spawn(
        channel: &Arc<dyn RemoteChannel>,
        conversations: Vec<ConversationId>,
        local: &UserId,
        scope: &TeardownScope,
    ) -> Self {
        let streams = conversations.into_iter().map(|cid| {
            channel
                .subscribe(&paths::typing_root(&cid))
                .map(move |value| (cid.clone(), value))
        });
        let mut merged = futures::stream::select_all(streams);
        let (tx, rx) = watch::channel(BTreeMap::new());
        let local = local.clone();

        scope.spawn(async move {
            let mut raw: HashMap<ConversationId, Value> = HashMap::new();
            let mut recheck = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    item = merged.next() => match item {
                        Some((cid, Some(value))) => {
                            raw.insert(cid, value);
                        }
                        Some((cid, None)) => {
                            raw.remove(&cid);
                        }
                        None => break,
                    },
                    _ = recheck.tick() => {}
                }
                let now = now_millis();
                let view: BTreeMap<ConversationId, BTreeSet<UserId>> = raw
                    .iter()
                    .filter_map(|(cid, value)| {
                        let typers = fresh_typers(value, &local, now);
                        (!typers.is_empty()).then(|| (cid.clone(), typers))
                    })
                    .collect();
                tx.send_if_modified(|current| replace_if_changed(current, view));
            }
        });
        Self { typing: rx }
    }

    pub fn typing_in(&self, conversation: &ConversationId) -> BTreeSet<UserId> {
        self.typing
            .borrow()
            .get(conversation)
            .cloned()
            .unwrap_or_default()
    }

    pub fn watch(&self) -> watch::Receiver<BTreeMap<ConversationId, BTreeSet<UserId>>> {
        self.typing.clone()
    }
}

fn fresh_typers(value: &Value, local: &UserId, now: i64) -> BTreeSet<UserId> {
    let Value::Object(nodes) = value else {
        return BTreeSet::new();
    };
    nodes
        .iter()
        .filter(|(uid, _)| uid.as_str() != local.as_str())
        .filter_map(|(uid, node)| {
            let signal: TypingSignal = serde_json::from_value(node.clone()).ok()?;
            signal
                .is_fresh(now, TYPING_FRESHNESS_MS)
                .then(|| UserId::new(uid.as_str()))
        })
        .collect()
}

fn replace_if_changed<T: PartialEq>(current: &mut T, next: T) -> bool {
    if *current == next {
        return false;
    }
    *current = next;
    true
}
