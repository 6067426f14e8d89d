use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use matrixon_timeline_core::Transport;
use ruma::{OwnedRoomId, OwnedUserId, RoomId, UserId};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::{utils, Result};

pub struct Service {
    pub typing: RwLock<BTreeMap<OwnedRoomId, BTreeMap<OwnedUserId, u64>>>, // u64 is unix timestamp of timeout
    pub last_typing_update: RwLock<BTreeMap<OwnedRoomId, u64>>, // count of the last change to typing users
    pub typing_update_sender: broadcast::Sender<OwnedRoomId>,

    update_count: AtomicU64,
    timeout: Duration,
    transport: Arc<dyn Transport>,
}

impl Service {
    pub fn build(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self {
            typing: RwLock::new(BTreeMap::new()),
            last_typing_update: RwLock::new(BTreeMap::new()),
            typing_update_sender: broadcast::channel(100).0,
            update_count: AtomicU64::new(0),
            timeout,
            transport,
        }
    }

    fn next_count(&self) -> u64 {
        self.update_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn mark_updated(&self, room_id: &RoomId) {
        self.last_typing_update
            .write()
            .await
            .insert(room_id.to_owned(), self.next_count());
        let _ = self.typing_update_sender.send(room_id.to_owned());
    }

    /// Sets a user as typing until the timeout timestamp is reached or typing_remove is
    /// called.
    pub async fn typing_add(&self, user_id: &UserId, room_id: &RoomId, timeout: u64) {
        self.typing
            .write()
            .await
            .entry(room_id.to_owned())
            .or_default()
            .insert(user_id.to_owned(), timeout);
        self.mark_updated(room_id).await;
    }

    /// Removes a user from typing before the timeout is reached.
    pub async fn typing_remove(&self, user_id: &UserId, room_id: &RoomId) {
        self.typing
            .write()
            .await
            .entry(room_id.to_owned())
            .or_default()
            .remove(user_id);
        self.mark_updated(room_id).await;
    }

    /// Sync delivers the complete typing set of a room; each user expires
    /// after the configured timeout unless a later sync repeats them.
    pub async fn replace_room(&self, room_id: &RoomId, user_ids: &[OwnedUserId]) -> bool {
        let expires = utils::millis_since_unix_epoch() + self.timeout.as_millis() as u64;
        let users: BTreeMap<_, _> = user_ids.iter().map(|user| (user.clone(), expires)).collect();

        let changed = {
            let mut typing = self.typing.write().await;
            let current = typing.entry(room_id.to_owned()).or_default();
            let changed = !current.keys().eq(users.keys());
            *current = users;
            changed
        };
        if changed {
            self.mark_updated(room_id).await;
        }
        changed
    }

    pub async fn wait_for_update(&self, room_id: &RoomId) -> Result<()> {
        let mut receiver = self.typing_update_sender.subscribe();
        while let Ok(next) = receiver.recv().await {
            if next == room_id {
                break;
            }
        }

        Ok(())
    }

    /// Makes sure that typing events with old timestamps get removed.
    async fn typings_maintain(&self, room_id: &RoomId) {
        let current_timestamp = utils::millis_since_unix_epoch();
        let mut removable = Vec::new();
        {
            let typing = self.typing.read().await;
            let Some(room) = typing.get(room_id) else {
                return;
            };
            for (user, timeout) in room {
                if *timeout < current_timestamp {
                    removable.push(user.clone());
                }
            }
        }
        if !removable.is_empty() {
            debug!(%room_id, expired = removable.len(), "Typing notifications expired");
            {
                let typing = &mut self.typing.write().await;
                let room = typing.entry(room_id.to_owned()).or_default();
                for user in removable {
                    room.remove(&user);
                }
            }
            self.mark_updated(room_id).await;
        }
    }

    /// Returns the count of the last typing update in this room.
    pub async fn last_typing_update(&self, room_id: &RoomId) -> u64 {
        self.typings_maintain(room_id).await;
        self.last_typing_update
            .read()
            .await
            .get(room_id)
            .copied()
            .unwrap_or(0)
    }

    /// Users currently typing in the room.
    pub async fn typings_all(&self, room_id: &RoomId) -> Vec<OwnedUserId> {
        self.typings_maintain(room_id).await;
        self.typing
            .read()
            .await
            .get(room_id)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Tells the server whether the own user is typing.
    #[tracing::instrument(skip(self))]
    pub async fn send_typing(&self, room_id: &RoomId, typing: bool) -> Result<()> {
        self.transport.send_typing(room_id, typing, self.timeout).await?;
        Ok(())
    }
}
