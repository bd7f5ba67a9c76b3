//! Call handshake over the remote channel.
//!
//! The caller rings by writing a [`CallInboxRecord`] into the callee's
//! inbox; the callee answers by writing a [`CallResponseRecord`] into the
//! caller's response slot. Media only starts once both sides are
//! connected. Hangup is local: each side leaves the media room and the
//! peer notices through the engine's stream-removed event.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chatline_shared::models::{decode, CallInboxRecord, CallResponseRecord, CallResponseStatus};
use chatline_shared::types::{now_millis, CallKind, RoomId, UserId};
use chatline_shared::{paths, ChatError};
use chatline_store::{RemoteChannel, TeardownScope};
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::bridge::{LocalStream, MediaBridge, MediaEvent, TrackKind};
use crate::token::CallTokenProvider;

type Result<T> = std::result::Result<T, ChatError>;

/// Who the local user is, as shown on the peer's ringing screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub id: UserId,
    pub name: String,
    pub photo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Outgoing {
        peer: UserId,
        kind: CallKind,
        room: RoomId,
    },
    Incoming(CallInboxRecord),
    Connected {
        peer: UserId,
        kind: CallKind,
        room: RoomId,
    },
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn room(&self) -> Option<&RoomId> {
        match self {
            Self::Idle => None,
            Self::Outgoing { room, .. } | Self::Connected { room, .. } => Some(room),
            Self::Incoming(record) => Some(&record.room_id),
        }
    }

    fn is_outgoing(&self, room: &RoomId) -> bool {
        matches!(self, Self::Outgoing { room: r, .. } if r == room)
    }

    fn is_incoming(&self, room: &RoomId) -> bool {
        matches!(self, Self::Incoming(record) if &record.room_id == room)
    }
}

/// Outcomes the user is told about without having asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotice {
    Declined { peer: UserId },
    Canceled { peer: UserId },
    PeerHungUp { peer: UserId },
    Failed { reason: String },
}

struct ActiveMedia {
    stream: LocalStream,
    room: RoomId,
    mic: bool,
    camera: bool,
}

pub struct CallSignaler {
    me: CallerIdentity,
    channel: Arc<dyn RemoteChannel>,
    media: Arc<dyn MediaBridge>,
    tokens: Arc<dyn CallTokenProvider>,
    state: watch::Sender<CallState>,
    notices: broadcast::Sender<CallNotice>,
    active: Mutex<Option<ActiveMedia>>,
}

impl CallSignaler {
    pub fn new(
        me: CallerIdentity,
        channel: Arc<dyn RemoteChannel>,
        media: Arc<dyn MediaBridge>,
        tokens: Arc<dyn CallTokenProvider>,
    ) -> Self {
        let (state, _) = watch::channel(CallState::Idle);
        let (notices, _) = broadcast::channel(16);
        Self {
            me,
            channel,
            media,
            tokens,
            state,
            notices,
            active: Mutex::new(None),
        }
    }

    pub fn state(&self) -> CallState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<CallNotice> {
        self.notices.subscribe()
    }

    /// Follow the local inbox, the local response slot and the media
    /// engine until `scope` closes.
    pub fn listen(self: &Arc<Self>, scope: &TeardownScope) {
        let mut inbox = self.channel.subscribe(&paths::call_inbox(&self.me.id));
        let mut responses = self.channel.subscribe(&paths::call_response(&self.me.id));
        let mut media = self.media.events();
        let this = Arc::clone(self);
        scope.spawn(async move {
            loop {
                tokio::select! {
                    Some(value) = inbox.next() => this.handle_inbox(value).await,
                    Some(value) = responses.next() => this.handle_response(value).await,
                    Some(event) = media.next() => this.handle_media_event(event).await,
                    else => break,
                }
            }
            debug!("Call listener stopped");
        });
    }

    /// Ring `peer`. Fails with [`ChatError::SignalingConflict`] unless idle,
    /// including while a call to us is ringing.
    pub async fn start_call(&self, peer: &UserId, kind: CallKind) -> Result<RoomId> {
        if peer == &self.me.id {
            return Err(ChatError::InvalidState("cannot call yourself".to_string()));
        }
        let created_at = now_millis();
        let room = RoomId::for_call(&self.me.id, peer, created_at);
        let outgoing = CallState::Outgoing {
            peer: peer.clone(),
            kind,
            room: room.clone(),
        };
        if !self.transition(|s| s.is_idle().then_some(outgoing)) {
            return Err(ChatError::SignalingConflict);
        }

        let record = CallInboxRecord {
            caller_id: self.me.id.clone(),
            caller_name: self.me.name.clone(),
            caller_photo: self.me.photo.clone(),
            kind,
            room_id: room.clone(),
            created_at,
        };
        if let Err(e) = self.ring(peer, &record).await {
            warn!(peer = %peer.short(), error = %e, "Failed to ring peer");
            self.transition(|s| s.is_outgoing(&room).then_some(CallState::Idle));
            return Err(e);
        }
        info!(peer = %peer.short(), room = %room, ?kind, "Ringing");
        Ok(room)
    }

    /// Withdraw an unanswered outgoing call. Races the callee's accept
    /// through [`claim`](Self::claim): only one of the two can win.
    pub async fn cancel_call(&self) -> Result<()> {
        let (peer, room) = match &*self.state.borrow() {
            CallState::Outgoing { peer, room, .. } => (peer.clone(), room.clone()),
            _ => return Err(ChatError::InvalidState("no outgoing call".to_string())),
        };

        if !self.claim(&peer, &room).await? {
            return Err(ChatError::InvalidState(
                "call was already answered or declined".to_string(),
            ));
        }
        self.transition(|s| s.is_outgoing(&room).then_some(CallState::Idle));
        self.channel.delete(&paths::call_inbox(&peer)).await?;
        info!(peer = %peer.short(), room = %room, "Call canceled");
        Ok(())
    }

    pub async fn accept_call(&self) -> Result<()> {
        let record = match &*self.state.borrow() {
            CallState::Incoming(record) => record.clone(),
            _ => return Err(ChatError::InvalidState("no incoming call".to_string())),
        };
        let room = record.room_id.clone();
        let inbox = paths::call_inbox(&self.me.id);

        let still_ringing = self
            .channel
            .read(&inbox)
            .await?
            .and_then(|v| decode::<CallInboxRecord>(&inbox, &v).ok())
            .is_some_and(|r| r.room_id == room);
        if !still_ringing {
            if self.transition(|s| s.is_incoming(&room).then_some(CallState::Idle)) {
                self.notify(CallNotice::Canceled {
                    peer: record.caller_id.clone(),
                });
            }
            return Err(ChatError::InvalidState("call is no longer ringing".to_string()));
        }

        let stream = match self.media.create_local_stream(record.kind).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Cannot acquire devices, declining call");
                self.transition(|s| s.is_incoming(&room).then_some(CallState::Idle));
                if let Err(e) = self.respond(&record, CallResponseStatus::Rejected).await {
                    warn!(error = %e, "Failed to write call rejection");
                }
                if let Err(e) = self.channel.delete(&inbox).await {
                    warn!(error = %e, "Failed to clear call inbox");
                }
                return Err(e.into());
            }
        };

        let won = match self.claim(&self.me.id, &room).await {
            Ok(won) => won,
            Err(e) => {
                self.media.stop_local_stream(&stream);
                return Err(e);
            }
        };
        if !won {
            self.media.stop_local_stream(&stream);
            if self.transition(|s| s.is_incoming(&room).then_some(CallState::Idle)) {
                self.notify(CallNotice::Canceled {
                    peer: record.caller_id.clone(),
                });
            }
            return Err(ChatError::InvalidState("call is no longer ringing".to_string()));
        }

        let connected = CallState::Connected {
            peer: record.caller_id.clone(),
            kind: record.kind,
            room: room.clone(),
        };
        if !self.transition(|s| s.is_incoming(&room).then_some(connected)) {
            // a newer ring replaced this one after we won it
            self.media.stop_local_stream(&stream);
            if let Err(e) = self.respond(&record, CallResponseStatus::Rejected).await {
                warn!(error = %e, "Failed to write call rejection");
            }
            return Err(ChatError::InvalidState("call is no longer ringing".to_string()));
        }
        if let Err(e) = self.respond(&record, CallResponseStatus::Accepted).await {
            self.media.stop_local_stream(&stream);
            self.fail(&room, &e);
            return Err(e);
        }
        if let Err(e) = self.channel.delete(&inbox).await {
            warn!(error = %e, "Failed to clear call inbox");
        }
        if let Err(e) = self.connect_media(&room, stream).await {
            self.fail(&room, &e);
            return Err(e);
        }
        info!(peer = %record.caller_id.short(), room = %room, "Call connected");
        Ok(())
    }

    pub async fn reject_call(&self) -> Result<()> {
        let record = match &*self.state.borrow() {
            CallState::Incoming(record) => record.clone(),
            _ => return Err(ChatError::InvalidState("no incoming call".to_string())),
        };
        self.transition(|s| s.is_incoming(&record.room_id).then_some(CallState::Idle));
        self.respond(&record, CallResponseStatus::Rejected).await?;
        self.channel.delete(&paths::call_inbox(&self.me.id)).await?;
        info!(peer = %record.caller_id.short(), room = %record.room_id, "Call rejected");
        Ok(())
    }

    /// Leave whatever call is in progress. A connected call is torn down
    /// locally without any signaling write; a ringing one is canceled or
    /// rejected.
    pub async fn end_call(&self) -> Result<()> {
        match self.state() {
            CallState::Idle => Ok(()),
            CallState::Outgoing { .. } => self.cancel_call().await,
            CallState::Incoming(_) => self.reject_call().await,
            CallState::Connected { room, .. } => {
                self.transition(|s| (s.room() == Some(&room)).then_some(CallState::Idle));
                self.release_media().await;
                info!(room = %room, "Call ended");
                Ok(())
            }
        }
    }

    /// End any call in progress, logging instead of failing.
    pub async fn shutdown(&self) {
        if let Err(e) = self.end_call().await {
            warn!(error = %e, "Failed to end call during shutdown");
        }
        self.release_media().await;
    }

    /// Flip the local microphone track. Returns whether it is now enabled.
    pub fn toggle_mic(&self) -> Result<bool> {
        let mut active = self.active();
        let Some(active) = active.as_mut() else {
            return Err(ChatError::InvalidState("no active call".to_string()));
        };
        active.mic = !active.mic;
        self.media
            .set_track_enabled(&active.stream, TrackKind::Audio, active.mic);
        Ok(active.mic)
    }

    pub fn toggle_camera(&self) -> Result<bool> {
        let mut active = self.active();
        let Some(active) = active.as_mut() else {
            return Err(ChatError::InvalidState("no active call".to_string()));
        };
        if !active.stream.kind.has_video() {
            return Err(ChatError::InvalidState("audio-only call".to_string()));
        }
        active.camera = !active.camera;
        self.media
            .set_track_enabled(&active.stream, TrackKind::Video, active.camera);
        Ok(active.camera)
    }

    async fn handle_inbox(&self, value: Option<Value>) {
        let inbox = paths::call_inbox(&self.me.id);
        // a late claim can outlive the ring it raced for
        let value = value.filter(|v| v.get("roomId").is_some());
        let Some(value) = value else {
            let mut canceled = None;
            self.transition(|s| match s {
                CallState::Incoming(record) => {
                    canceled = Some(record.caller_id.clone());
                    Some(CallState::Idle)
                }
                _ => None,
            });
            if let Some(peer) = canceled {
                info!(peer = %peer.short(), "Caller canceled");
                self.notify(CallNotice::Canceled { peer });
            }
            return;
        };

        let record: CallInboxRecord = match decode(&inbox, &value) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed call record");
                return;
            }
        };

        // a newer ring replaces a pending one
        let ring = CallState::Incoming(record.clone());
        let rang = self.transition(|s| match s {
            CallState::Idle => Some(ring),
            CallState::Incoming(current) if current.room_id != record.room_id => Some(ring),
            _ => None,
        });
        if rang {
            info!(
                caller = %record.caller_id.short(),
                room = %record.room_id,
                kind = ?record.kind,
                "Incoming call"
            );
            return;
        }

        let busy = match &*self.state.borrow() {
            CallState::Outgoing { room, .. } | CallState::Connected { room, .. } => {
                room != &record.room_id
            }
            _ => false,
        };
        if busy {
            info!(caller = %record.caller_id.short(), "Busy, rejecting incoming call");
            if let Err(e) = self.respond(&record, CallResponseStatus::Rejected).await {
                warn!(error = %e, "Failed to write call rejection");
            }
            if let Err(e) = self.channel.delete(&inbox).await {
                warn!(error = %e, "Failed to clear call inbox");
            }
        }
    }

    async fn handle_response(&self, value: Option<Value>) {
        let Some(value) = value else { return };
        let slot = paths::call_response(&self.me.id);
        let response: Option<CallResponseRecord> = match decode(&slot, &value) {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(error = %e, "Discarding malformed call response");
                None
            }
        };
        let outgoing = match (&*self.state.borrow(), &response) {
            (CallState::Outgoing { peer, kind, room }, Some(r)) if *room == r.room_id => {
                Some((peer.clone(), *kind, room.clone()))
            }
            _ => None,
        };
        if let Err(e) = self.channel.delete(&slot).await {
            warn!(error = %e, "Failed to clear call response");
        }
        let (Some((peer, kind, room)), Some(response)) = (outgoing, response) else {
            debug!("Discarding stale call response");
            return;
        };

        match response.status {
            CallResponseStatus::Rejected => {
                if self.transition(|s| s.is_outgoing(&room).then_some(CallState::Idle)) {
                    info!(peer = %peer.short(), "Call declined");
                    self.notify(CallNotice::Declined { peer });
                }
            }
            CallResponseStatus::Accepted => {
                let joined = match self.media.create_local_stream(kind).await {
                    Ok(stream) => self.connect_media(&room, stream).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = joined {
                    self.fail(&room, &e);
                    return;
                }
                let connected = CallState::Connected {
                    peer: peer.clone(),
                    kind,
                    room: room.clone(),
                };
                if self.transition(|s| s.is_outgoing(&room).then_some(connected)) {
                    info!(peer = %peer.short(), room = %room, "Call connected");
                } else {
                    self.release_media().await;
                }
            }
        }
    }

    async fn handle_media_event(&self, event: MediaEvent) {
        match event {
            MediaEvent::RemoteStreamAdded { stream_id } => {
                debug!(stream_id, "Remote stream added");
            }
            MediaEvent::RemoteStreamRemoved { stream_id } => {
                let mut hung_up = None;
                self.transition(|s| match s {
                    CallState::Connected { peer, room, .. } if room.stream_id(peer) == stream_id => {
                        hung_up = Some(peer.clone());
                        Some(CallState::Idle)
                    }
                    _ => None,
                });
                if let Some(peer) = hung_up {
                    self.release_media().await;
                    info!(peer = %peer.short(), "Peer hung up");
                    self.notify(CallNotice::PeerHungUp { peer });
                }
            }
        }
    }

    /// Race for the ringing call `room` in `callee`'s inbox. Each side
    /// pushes a claim and then reads the inbox back: it wins only if the
    /// ring is still there and its claim carries the smallest key for the
    /// room. Push keys follow commit order, so a concurrent accept and
    /// cancel can never both win. The winner deletes the inbox, claims
    /// included.
    async fn claim(&self, callee: &UserId, room: &RoomId) -> Result<bool> {
        let claims = paths::call_claims(callee);
        let mine = self
            .channel
            .push(&claims, json!({ "by": self.me.id, "roomId": room }))
            .await?;
        let inbox = paths::call_inbox(callee);
        let node = self.channel.read(&inbox).await?;
        let ringing = node
            .as_ref()
            .and_then(|v| decode::<CallInboxRecord>(&inbox, v).ok())
            .is_some_and(|r| &r.room_id == room);
        if !ringing {
            // nobody will clear the inbox for a ring that is gone
            if let Err(e) = self.channel.delete(&format!("{claims}/{mine}")).await {
                warn!(error = %e, "Failed to withdraw call claim");
            }
            debug!(room = %room, "Lost call claim, ring is gone");
            return Ok(false);
        }
        let first = node
            .as_ref()
            .and_then(|v| v.get("claims"))
            .and_then(Value::as_object)
            .and_then(|all| {
                all.iter()
                    .filter(|(_, c)| c.get("roomId").and_then(Value::as_str) == Some(room.as_str()))
                    .map(|(key, _)| key)
                    .min()
            })
            .cloned();
        let won = first.as_deref() == Some(mine.as_str());
        debug!(room = %room, won, "Call claim resolved");
        Ok(won)
    }

    async fn ring(&self, peer: &UserId, record: &CallInboxRecord) -> Result<()> {
        let value = serde_json::to_value(record)?;
        self.channel.write(&paths::call_inbox(peer), value).await?;
        Ok(())
    }

    async fn respond(&self, record: &CallInboxRecord, status: CallResponseStatus) -> Result<()> {
        let response = CallResponseRecord {
            status,
            room_id: record.room_id.clone(),
        };
        let value = serde_json::to_value(&response)?;
        self.channel
            .write(&paths::call_response(&record.caller_id), value)
            .await?;
        Ok(())
    }

    /// Join `room` with a freshly fetched token and publish `stream` under
    /// this user's stream id. On failure the stream is stopped and the room
    /// left.
    async fn connect_media(&self, room: &RoomId, stream: LocalStream) -> Result<()> {
        let joined = async {
            let token = self.tokens.fetch_token(&self.me.id).await?;
            self.media.join_room(room, &self.me.id, &token).await?;
            self.media.publish(&stream, &room.stream_id(&self.me.id)).await?;
            Ok::<_, ChatError>(())
        }
        .await;
        if let Err(e) = joined {
            self.media.stop_local_stream(&stream);
            self.media.leave_room(room).await;
            return Err(e);
        }
        let camera = stream.kind.has_video();
        *self.active() = Some(ActiveMedia {
            stream,
            room: room.clone(),
            mic: true,
            camera,
        });
        Ok(())
    }

    async fn release_media(&self) {
        let active = self.active().take();
        if let Some(active) = active {
            self.media.stop_local_stream(&active.stream);
            self.media.leave_room(&active.room).await;
        }
    }

    fn fail(&self, room: &RoomId, error: &ChatError) {
        warn!(room = %room, error = %error, "Call setup failed");
        self.transition(|s| (s.room() == Some(room)).then_some(CallState::Idle));
        self.notify(CallNotice::Failed {
            reason: error.to_string(),
        });
    }

    /// Apply `next` to the current state atomically. Returns whether the
    /// state changed.
    fn transition(&self, next: impl FnOnce(&CallState) -> Option<CallState>) -> bool {
        self.state.send_if_modified(|state| match next(state) {
            Some(to) => {
                debug!(from = ?state, to = ?to, "Call state transition");
                *state = to;
                true
            }
            None => false,
        })
    }

    fn notify(&self, notice: CallNotice) {
        let _ = self.notices.send(notice);
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveMedia>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::MediaError;
    use crate::loopback::{LoopbackBridge, LoopbackMedia};
    use async_trait::async_trait;
    use chatline_store::MemoryHub;
    use std::time::Duration;
    use tokio::sync::Notify;

    struct StaticTokens;

    #[async_trait]
    impl CallTokenProvider for StaticTokens {
        async fn fetch_token(&self, user: &UserId) -> Result<String> {
            Ok(format!("token-{user}"))
        }
    }

    struct Party {
        id: UserId,
        signaler: Arc<CallSignaler>,
        state: watch::Receiver<CallState>,
        notices: broadcast::Receiver<CallNotice>,
        _scope: Option<TeardownScope>,
    }

    /// Holds device acquisition until the gate opens.
    struct GatedMedia {
        inner: LoopbackBridge,
        entered: Arc<Notify>,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl MediaBridge for GatedMedia {
        async fn create_local_stream(&self, kind: CallKind) -> std::result::Result<LocalStream, MediaError> {
            self.entered.notify_one();
            self.gate.notified().await;
            self.inner.create_local_stream(kind).await
        }

        async fn join_room(&self, room: &RoomId, user: &UserId, token: &str) -> std::result::Result<(), MediaError> {
            self.inner.join_room(room, user, token).await
        }

        async fn publish(&self, stream: &LocalStream, stream_id: &str) -> std::result::Result<(), MediaError> {
            self.inner.publish(stream, stream_id).await
        }

        async fn leave_room(&self, room: &RoomId) {
            self.inner.leave_room(room).await
        }

        fn set_track_enabled(&self, stream: &LocalStream, track: TrackKind, enabled: bool) {
            self.inner.set_track_enabled(stream, track, enabled)
        }

        fn stop_local_stream(&self, stream: &LocalStream) {
            self.inner.stop_local_stream(stream)
        }

        fn events(&self) -> chatline_store::Subscription<MediaEvent> {
            self.inner.events()
        }
    }

    fn party(hub: &MemoryHub, media: &LoopbackMedia, id: &str, name: &str, listen: bool) -> Party {
        let bridge = Arc::new(media.bridge(&UserId::new(id)));
        party_with(hub, bridge, id, name, listen)
    }

    fn party_with(hub: &MemoryHub, bridge: Arc<dyn MediaBridge>, id: &str, name: &str, listen: bool) -> Party {
        let me = CallerIdentity {
            id: UserId::new(id),
            name: name.to_string(),
            photo: None,
        };
        let signaler = Arc::new(CallSignaler::new(
            me.clone(),
            Arc::new(hub.connect()),
            bridge,
            Arc::new(StaticTokens),
        ));
        let scope = listen.then(|| {
            let scope = TeardownScope::new();
            signaler.listen(&scope);
            scope
        });
        Party {
            id: me.id,
            state: signaler.watch_state(),
            notices: signaler.notices(),
            signaler,
            _scope: scope,
        }
    }

    async fn wait_for(party: &mut Party, pred: impl FnMut(&CallState) -> bool) -> CallState {
        let state = tokio::time::timeout(Duration::from_secs(2), party.state.wait_for(pred))
            .await
            .expect("timed out waiting for call state")
            .expect("signaler dropped");
        (*state).clone()
    }

    async fn next_notice(party: &mut Party) -> CallNotice {
        tokio::time::timeout(Duration::from_secs(2), party.notices.recv())
            .await
            .expect("timed out waiting for notice")
            .expect("notice channel closed")
    }

    fn is_incoming(s: &CallState) -> bool {
        matches!(s, CallState::Incoming(_))
    }

    fn is_connected(s: &CallState) -> bool {
        matches!(s, CallState::Connected { .. })
    }

    async fn connected_pair(
        hub: &MemoryHub,
        media: &LoopbackMedia,
        kind: CallKind,
    ) -> (Party, Party, RoomId) {
        let mut a = party(hub, media, "A", "Alice", true);
        let mut b = party(hub, media, "B", "Bob", true);
        let room = a.signaler.start_call(&b.id, kind).await.unwrap();
        wait_for(&mut b, is_incoming).await;
        b.signaler.accept_call().await.unwrap();
        wait_for(&mut a, is_connected).await;
        (a, b, room)
    }

    #[tokio::test]
    async fn caller_and_callee_connect() {
        let hub = MemoryHub::new();
        let media = LoopbackMedia::new();
        let mut a = party(&hub, &media, "A", "Alice", true);
        let mut b = party(&hub, &media, "B", "Bob", true);

        let room = a.signaler.start_call(&b.id, CallKind::Video).await.unwrap();
        assert!(room.as_str().starts_with("call_A_B_"));
        assert!(matches!(a.signaler.state(), CallState::Outgoing { .. }));

        let ring = hub.snapshot("calls/B").unwrap();
        assert_eq!(ring["callerId"], "A");
        assert_eq!(ring["callerName"], "Alice");
        assert_eq!(ring["type"], "video");
        assert_eq!(ring["roomId"], room.as_str());

        match wait_for(&mut b, is_incoming).await {
            CallState::Incoming(record) => {
                assert_eq!(record.caller_id, a.id);
                assert_eq!(record.room_id, room);
                assert_eq!(record.kind, CallKind::Video);
            }
            other => panic!("unexpected state {other:?}"),
        }
        assert!(media.joins().is_empty());

        b.signaler.accept_call().await.unwrap();
        assert!(is_connected(&b.signaler.state()));
        match wait_for(&mut a, is_connected).await {
            CallState::Connected { peer, room: r, .. } => {
                assert_eq!(peer, b.id);
                assert_eq!(r, room);
            }
            other => panic!("unexpected state {other:?}"),
        }

        assert_eq!(hub.snapshot("calls/B"), None);
        assert_eq!(hub.snapshot("callResponses/A"), None);
        let mut published = media.published();
        published.sort();
        assert_eq!(published, vec![room.stream_id(&a.id), room.stream_id(&b.id)]);
        assert_eq!(format!("{}_A", room), room.stream_id(&a.id));
    }

    #[tokio::test]
    async fn rejection_returns_caller_to_idle() {
        let hub = MemoryHub::new();
        let media = LoopbackMedia::new();
        let mut a = party(&hub, &media, "A", "Alice", true);
        let mut b = party(&hub, &media, "B", "Bob", true);

        a.signaler.start_call(&b.id, CallKind::Video).await.unwrap();
        wait_for(&mut b, is_incoming).await;
        b.signaler.reject_call().await.unwrap();
        assert!(b.signaler.state().is_idle());

        wait_for(&mut a, CallState::is_idle).await;
        assert_eq!(next_notice(&mut a).await, CallNotice::Declined { peer: b.id.clone() });
        assert_eq!(hub.snapshot("calls/B"), None);
        assert_eq!(hub.snapshot("callResponses/A"), None);
        assert!(media.joins().is_empty());
        assert!(media.published().is_empty());
    }

    #[tokio::test]
    async fn outbound_call_while_not_idle_conflicts() {
        let hub = MemoryHub::new();
        let media = LoopbackMedia::new();
        let a = party(&hub, &media, "A", "Alice", true);
        let mut b = party(&hub, &media, "B", "Bob", true);

        a.signaler.start_call(&b.id, CallKind::Audio).await.unwrap();
        assert!(matches!(
            a.signaler.start_call(&UserId::new("C"), CallKind::Audio).await,
            Err(ChatError::SignalingConflict)
        ));

        wait_for(&mut b, is_incoming).await;
        assert!(matches!(
            b.signaler.start_call(&UserId::new("C"), CallKind::Audio).await,
            Err(ChatError::SignalingConflict)
        ));
        assert!(is_incoming(&b.signaler.state()));
    }

    #[tokio::test]
    async fn caller_cancel_clears_ring() {
        let hub = MemoryHub::new();
        let media = LoopbackMedia::new();
        let a = party(&hub, &media, "A", "Alice", true);
        let mut b = party(&hub, &media, "B", "Bob", true);

        a.signaler.start_call(&b.id, CallKind::Audio).await.unwrap();
        wait_for(&mut b, is_incoming).await;
        a.signaler.cancel_call().await.unwrap();

        assert!(a.signaler.state().is_idle());
        wait_for(&mut b, CallState::is_idle).await;
        assert_eq!(next_notice(&mut b).await, CallNotice::Canceled { peer: a.id.clone() });
        assert_eq!(hub.snapshot("calls/B"), None);
    }

    #[tokio::test]
    async fn accept_after_cancel_is_refused() {
        let hub = MemoryHub::new();
        let media = LoopbackMedia::new();
        let a = party(&hub, &media, "A", "Alice", false);
        let b = party(&hub, &media, "B", "Bob", false);

        a.signaler.start_call(&b.id, CallKind::Audio).await.unwrap();
        b.signaler.handle_inbox(hub.snapshot("calls/B")).await;
        assert!(is_incoming(&b.signaler.state()));

        // caller withdrew before the callee's listener noticed
        hub.connect().delete("calls/B").await.unwrap();

        assert!(matches!(
            b.signaler.accept_call().await,
            Err(ChatError::InvalidState(_))
        ));
        assert!(b.signaler.state().is_idle());
        assert_eq!(hub.snapshot("callResponses/A"), None);
        assert!(media.joins().is_empty());
    }

    #[tokio::test]
    async fn cancel_after_accept_is_refused() {
        let hub = MemoryHub::new();
        let media = LoopbackMedia::new();
        let a = party(&hub, &media, "A", "Alice", false);
        let b = party(&hub, &media, "B", "Bob", false);

        a.signaler.start_call(&b.id, CallKind::Audio).await.unwrap();
        b.signaler.handle_inbox(hub.snapshot("calls/B")).await;
        b.signaler.accept_call().await.unwrap();

        assert!(matches!(
            a.signaler.cancel_call().await,
            Err(ChatError::InvalidState(_))
        ));
        a.signaler.handle_response(hub.snapshot("callResponses/A")).await;
        assert!(is_connected(&a.signaler.state()));
    }

    #[tokio::test]
    async fn cancel_while_callee_acquires_devices_leaves_both_idle() {
        let hub = MemoryHub::new();
        let media = LoopbackMedia::new();
        let entered = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        let gated = GatedMedia {
            inner: media.bridge(&UserId::new("B")),
            entered: Arc::clone(&entered),
            gate: Arc::clone(&gate),
        };
        let a = party(&hub, &media, "A", "Alice", true);
        let mut b = party_with(&hub, Arc::new(gated), "B", "Bob", true);

        let room = a.signaler.start_call(&b.id, CallKind::Audio).await.unwrap();
        wait_for(&mut b, is_incoming).await;
        let callee = Arc::clone(&b.signaler);
        let accept = tokio::spawn(async move { callee.accept_call().await });
        // the callee passed its ringing check and is waiting on devices
        entered.notified().await;

        a.signaler.cancel_call().await.unwrap();
        gate.notify_one();
        assert!(matches!(accept.await.unwrap(), Err(ChatError::InvalidState(_))));

        assert!(a.signaler.state().is_idle());
        wait_for(&mut b, CallState::is_idle).await;
        assert!(media.members(&room).is_empty());
        assert_eq!(media.live_streams(), 0);
        assert_eq!(hub.snapshot("calls/B"), None);
        assert_eq!(hub.snapshot("callResponses/A"), None);
    }

    #[tokio::test]
    async fn first_claim_on_a_ring_wins() {
        let hub = MemoryHub::new();
        let media = LoopbackMedia::new();
        let a = party(&hub, &media, "A", "Alice", false);
        let b = party(&hub, &media, "B", "Bob", false);
        let room = a.signaler.start_call(&b.id, CallKind::Audio).await.unwrap();

        assert!(b.signaler.claim(&b.id, &room).await.unwrap());
        assert!(!a.signaler.claim(&b.id, &room).await.unwrap());

        // a claim for a ring that is not there loses and is withdrawn
        let stale = RoomId::for_call(&a.id, &b.id, 1);
        assert!(!a.signaler.claim(&b.id, &stale).await.unwrap());
        let claims = hub.snapshot("calls/B/claims").unwrap();
        assert_eq!(claims.as_object().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn denied_devices_decline_and_return_to_idle() {
        let hub = MemoryHub::new();
        let media = LoopbackMedia::new();
        let mut a = party(&hub, &media, "A", "Alice", true);
        let mut b = party(&hub, &media, "B", "Bob", true);
        media.deny_devices(&b.id);

        a.signaler.start_call(&b.id, CallKind::Video).await.unwrap();
        wait_for(&mut b, is_incoming).await;
        assert!(matches!(
            b.signaler.accept_call().await,
            Err(ChatError::PermissionDenied(_))
        ));
        assert!(b.signaler.state().is_idle());

        wait_for(&mut a, CallState::is_idle).await;
        assert_eq!(next_notice(&mut a).await, CallNotice::Declined { peer: b.id.clone() });
        assert!(media.joins().is_empty());
    }

    #[tokio::test]
    async fn hangup_is_detected_through_stream_removal() {
        let hub = MemoryHub::new();
        let media = LoopbackMedia::new();
        let (a, mut b, room) = connected_pair(&hub, &media, CallKind::Audio).await;

        a.signaler.end_call().await.unwrap();
        assert!(a.signaler.state().is_idle());

        wait_for(&mut b, CallState::is_idle).await;
        assert_eq!(next_notice(&mut b).await, CallNotice::PeerHungUp { peer: a.id.clone() });
        assert!(media.members(&room).is_empty());
        assert_eq!(media.live_streams(), 0);
    }

    #[tokio::test]
    async fn busy_callee_rejects_new_ring() {
        let hub = MemoryHub::new();
        let media = LoopbackMedia::new();
        let (_a, b, room) = connected_pair(&hub, &media, CallKind::Audio).await;
        let mut c = party(&hub, &media, "C", "Carol", true);

        c.signaler.start_call(&b.id, CallKind::Audio).await.unwrap();
        wait_for(&mut c, CallState::is_idle).await;
        assert_eq!(next_notice(&mut c).await, CallNotice::Declined { peer: b.id.clone() });
        assert_eq!(b.signaler.state().room(), Some(&room));
        assert!(is_connected(&b.signaler.state()));
    }

    #[tokio::test]
    async fn toggles_flip_local_tracks_only() {
        let hub = MemoryHub::new();
        let media = LoopbackMedia::new();
        let (a, _b, _room) = connected_pair(&hub, &media, CallKind::Video).await;

        assert_eq!(a.signaler.toggle_mic().unwrap(), false);
        assert_eq!(a.signaler.toggle_mic().unwrap(), true);
        assert_eq!(a.signaler.toggle_camera().unwrap(), false);
        assert_eq!(hub.snapshot("calls"), None);
        assert_eq!(hub.snapshot("callResponses"), None);

        a.signaler.end_call().await.unwrap();
        assert!(matches!(a.signaler.toggle_mic(), Err(ChatError::InvalidState(_))));
    }
}
