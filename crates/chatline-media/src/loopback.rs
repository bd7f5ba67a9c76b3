//! In-process media engine.
//!
//! Every [`LoopbackBridge`] created from one [`LoopbackMedia`] shares the
//! same set of rooms, so publishing or leaving on one bridge produces the
//! matching stream events on the others. No audio or video flows; the
//! engine records joins, publications and track state for inspection.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chatline_shared::types::{CallKind, RoomId, UserId};
use chatline_store::Subscription;
use tokio::sync::mpsc;
use tracing::debug;

use crate::bridge::{LocalStream, MediaBridge, MediaError, MediaEvent, TrackKind};

struct Member {
    user: UserId,
    stream_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackState {
    pub audio: bool,
    pub video: bool,
}

#[derive(Default)]
struct Engine {
    next_handle: u64,
    rooms: HashMap<RoomId, Vec<Member>>,
    listeners: HashMap<UserId, Vec<mpsc::UnboundedSender<MediaEvent>>>,
    tracks: HashMap<u64, TrackState>,
    denied: HashSet<UserId>,
    joins: Vec<(RoomId, UserId)>,
    published: Vec<String>,
}

impl Engine {
    fn emit(&mut self, user: &UserId, event: MediaEvent) {
        if let Some(senders) = self.listeners.get_mut(user) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}

#[derive(Clone, Default)]
pub struct LoopbackMedia {
    engine: Arc<Mutex<Engine>>,
}

impl LoopbackMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bridge(&self, user: &UserId) -> LoopbackBridge {
        LoopbackBridge {
            user: user.clone(),
            media: self.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Engine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refuse device access to `user` from now on.
    pub fn deny_devices(&self, user: &UserId) {
        self.lock().denied.insert(user.clone());
    }

    /// Every room join so far, in order.
    pub fn joins(&self) -> Vec<(RoomId, UserId)> {
        self.lock().joins.clone()
    }

    /// Every stream id published so far, in order.
    pub fn published(&self) -> Vec<String> {
        self.lock().published.clone()
    }

    pub fn members(&self, room: &RoomId) -> Vec<UserId> {
        self.lock()
            .rooms
            .get(room)
            .map(|m| m.iter().map(|m| m.user.clone()).collect())
            .unwrap_or_default()
    }

    /// Track state of a live local stream; `None` once stopped.
    pub fn track_state(&self, stream: &LocalStream) -> Option<TrackState> {
        self.lock().tracks.get(&stream.handle).copied()
    }

    pub fn live_streams(&self) -> usize {
        self.lock().tracks.len()
    }
}

pub struct LoopbackBridge {
    user: UserId,
    media: LoopbackMedia,
}

#[async_trait]
impl MediaBridge for LoopbackBridge {
    async fn create_local_stream(&self, kind: CallKind) -> Result<LocalStream, MediaError> {
        let mut engine = self.media.lock();
        if engine.denied.contains(&self.user) {
            let device = if kind.has_video() { "camera" } else { "microphone" };
            return Err(MediaError::PermissionDenied(device.to_string()));
        }
        engine.next_handle += 1;
        let handle = engine.next_handle;
        engine.tracks.insert(
            handle,
            TrackState {
                audio: true,
                video: kind.has_video(),
            },
        );
        Ok(LocalStream { handle, kind })
    }

    async fn join_room(&self, room: &RoomId, user: &UserId, token: &str) -> Result<(), MediaError> {
        if token.is_empty() {
            return Err(MediaError::ConnectionError("missing room token".to_string()));
        }
        let mut engine = self.media.lock();
        engine.joins.push((room.clone(), user.clone()));
        let members = engine.rooms.entry(room.clone()).or_default();
        if !members.iter().any(|m| &m.user == user) {
            members.push(Member {
                user: user.clone(),
                stream_id: None,
            });
        }
        debug!(room = %room, user = %user.short(), "Joined loopback room");
        Ok(())
    }

    async fn publish(&self, stream: &LocalStream, stream_id: &str) -> Result<(), MediaError> {
        let mut engine = self.media.lock();
        let Some(members) = engine.rooms.values_mut().find(|m| m.iter().any(|m| m.user == self.user))
        else {
            return Err(MediaError::NotJoined(stream_id.to_string()));
        };
        let mut existing = Vec::new();
        let mut others = Vec::new();
        for member in members.iter_mut() {
            if member.user == self.user {
                member.stream_id = Some(stream_id.to_string());
            } else {
                others.push(member.user.clone());
                existing.extend(member.stream_id.clone());
            }
        }
        engine.published.push(stream_id.to_string());
        debug!(stream = stream.handle, stream_id, "Published loopback stream");
        for other in others {
            engine.emit(
                &other,
                MediaEvent::RemoteStreamAdded {
                    stream_id: stream_id.to_string(),
                },
            );
        }
        let me = self.user.clone();
        for stream_id in existing {
            engine.emit(&me, MediaEvent::RemoteStreamAdded { stream_id });
        }
        Ok(())
    }

    async fn leave_room(&self, room: &RoomId) {
        let mut engine = self.media.lock();
        let Some(members) = engine.rooms.get_mut(room) else {
            return;
        };
        let Some(pos) = members.iter().position(|m| m.user == self.user) else {
            return;
        };
        let left = members.remove(pos);
        let others: Vec<UserId> = members.iter().map(|m| m.user.clone()).collect();
        if members.is_empty() {
            engine.rooms.remove(room);
        }
        if let Some(stream_id) = left.stream_id {
            for other in others {
                engine.emit(
                    &other,
                    MediaEvent::RemoteStreamRemoved {
                        stream_id: stream_id.clone(),
                    },
                );
            }
        }
        debug!(room = %room, user = %self.user.short(), "Left loopback room");
    }

    fn set_track_enabled(&self, stream: &LocalStream, track: TrackKind, enabled: bool) {
        if let Some(state) = self.media.lock().tracks.get_mut(&stream.handle) {
            match track {
                TrackKind::Audio => state.audio = enabled,
                TrackKind::Video => state.video = enabled,
            }
        }
    }

    fn stop_local_stream(&self, stream: &LocalStream) {
        self.media.lock().tracks.remove(&stream.handle);
    }

    fn events(&self) -> Subscription<MediaEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.media
            .lock()
            .listeners
            .entry(self.user.clone())
            .or_default()
            .push(tx);
        Subscription::detached(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn peers_see_each_others_streams() {
        let media = LoopbackMedia::new();
        let (a, b) = (UserId::new("A"), UserId::new("B"));
        let (bridge_a, bridge_b) = (media.bridge(&a), media.bridge(&b));
        let mut events_a = bridge_a.events();
        let mut events_b = bridge_b.events();
        let room = RoomId::for_call(&a, &b, 1);

        let sa = bridge_a.create_local_stream(CallKind::Audio).await.unwrap();
        bridge_a.join_room(&room, &a, "t").await.unwrap();
        bridge_a.publish(&sa, &room.stream_id(&a)).await.unwrap();

        let sb = bridge_b.create_local_stream(CallKind::Audio).await.unwrap();
        bridge_b.join_room(&room, &b, "t").await.unwrap();
        bridge_b.publish(&sb, &room.stream_id(&b)).await.unwrap();

        assert_eq!(
            events_a.next().await,
            Some(MediaEvent::RemoteStreamAdded { stream_id: room.stream_id(&b) })
        );
        assert_eq!(
            events_b.next().await,
            Some(MediaEvent::RemoteStreamAdded { stream_id: room.stream_id(&a) })
        );

        bridge_a.leave_room(&room).await;
        assert_eq!(
            events_b.next().await,
            Some(MediaEvent::RemoteStreamRemoved { stream_id: room.stream_id(&a) })
        );
        assert_eq!(media.members(&room), vec![b]);
    }

    #[tokio::test]
    async fn denied_devices_and_track_flips() {
        let media = LoopbackMedia::new();
        let user = UserId::new("A");
        let bridge = media.bridge(&user);

        let stream = bridge.create_local_stream(CallKind::Video).await.unwrap();
        bridge.set_track_enabled(&stream, TrackKind::Audio, false);
        assert_eq!(
            media.track_state(&stream),
            Some(TrackState { audio: false, video: true })
        );
        bridge.stop_local_stream(&stream);
        assert_eq!(media.track_state(&stream), None);

        media.deny_devices(&user);
        assert!(matches!(
            bridge.create_local_stream(CallKind::Audio).await,
            Err(MediaError::PermissionDenied(_))
        ));
    }

    #[tokio::test]
    async fn publishing_requires_a_room() {
        let media = LoopbackMedia::new();
        let bridge = media.bridge(&UserId::new("A"));
        let stream = bridge.create_local_stream(CallKind::Audio).await.unwrap();
        assert!(matches!(
            bridge.publish(&stream, "x").await,
            Err(MediaError::NotJoined(_))
        ));
        assert!(bridge
            .join_room(&RoomId("r".into()), &UserId::new("A"), "")
            .await
            .is_err());
    }
}
