// =============================================================================
// Matrixon Timeline - Sync Module
// =============================================================================
//
// Project: Matrixon - Gap-aware room timeline engine
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Applies incremental sync deltas. Each joined room's slice is decrypted,
//   stored, merged into the live end of the chunk graph and turned into one
//   diff, which local echo reconciliation rewrites before it is published.
//   The sync cursor is persisted only once every room has been applied.
//
// =============================================================================

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use matrixon_timeline_core::{
    decrypt_or_mark, Decryptor, DiffOrigin, Direction, Event, JoinedRoomUpdate, SyncResponse,
    TimelineDiff, Token, Transport,
};
use ruma::{OwnedEventId, RoomId};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    edus::typing,
    event_store::{self, PutOutcome},
    gap_resolver::{self, Anchor, Batch},
    local_echo, read_markers, relations, state, tags,
    timeline::{self, DiffBus},
};
use crate::Result;

pub struct Service {
    transport: Arc<dyn Transport>,
    decryptor: Arc<dyn Decryptor>,
    event_store: Arc<event_store::Service>,
    timeline: Arc<timeline::Service>,
    state: Arc<state::Service>,
    relations: Arc<relations::Service>,
    read_markers: Arc<read_markers::Service>,
    tags: Arc<tags::Service>,
    typing: Arc<typing::Service>,
    local_echo: Arc<local_echo::Service>,
    diffs: Arc<DiffBus>,

    /// Deltas are applied one at a time, in arrival order.
    apply_lock: Mutex<()>,
}

impl Service {
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        transport: Arc<dyn Transport>,
        decryptor: Arc<dyn Decryptor>,
        event_store: Arc<event_store::Service>,
        timeline: Arc<timeline::Service>,
        state: Arc<state::Service>,
        relations: Arc<relations::Service>,
        read_markers: Arc<read_markers::Service>,
        tags: Arc<tags::Service>,
        typing: Arc<typing::Service>,
        local_echo: Arc<local_echo::Service>,
        diffs: Arc<DiffBus>,
    ) -> Self {
        Self {
            transport,
            decryptor,
            event_store,
            timeline,
            state,
            relations,
            read_markers,
            tags,
            typing,
            local_echo,
            diffs,
            apply_lock: Mutex::new(()),
        }
    }

    /// Fetches the delta since the stored cursor and applies it.
    #[tracing::instrument(skip(self))]
    pub async fn sync_once(&self) -> Result<Vec<TimelineDiff>> {
        let since = self.timeline.sync_token()?;
        let response = self.transport.fetch_sync_delta(since.as_ref()).await?;
        self.apply_sync(response).await
    }

    /// Applies one delta and returns the non-empty diffs it produced, which
    /// have also been broadcast.
    #[tracing::instrument(skip(self, response), fields(next_batch = %response.next_batch))]
    pub async fn apply_sync(&self, response: SyncResponse) -> Result<Vec<TimelineDiff>> {
        let _guard = self.apply_lock.lock().await;

        let mut diffs = Vec::new();
        for (room_id, update) in response.rooms {
            let mut diff = self.apply_room(&room_id, update, &response.next_batch).await?;
            self.local_echo.reconcile(&mut diff)?;
            if self.diffs.emit(&diff) {
                diffs.push(diff);
            }
            self.local_echo.retire_settled(&room_id).await?;
        }

        self.timeline.set_sync_token(&response.next_batch)?;
        info!(rooms = diffs.len(), "✅ Applied sync delta");
        Ok(diffs)
    }

    async fn apply_room(&self, room_id: &RoomId, update: JoinedRoomUpdate, next_batch: &Token) -> Result<TimelineDiff> {
        let mut diff = TimelineDiff::new(room_id.to_owned(), DiffOrigin::Sync);

        let mut events = Vec::with_capacity(update.timeline.events.len());
        for event in update.timeline.events {
            events.push(decrypt_or_mark(&*self.decryptor, event).await);
        }

        let mut changed = Vec::new();
        let mut counts = Vec::with_capacity(update.state.len() + events.len());
        for event in update.state.iter().chain(events.iter()) {
            if let PutOutcome::Updated { .. } = self.event_store.ingest(event)? {
                changed.push(event.event_id.clone());
            }
            counts.push((event, self.timeline.ensure_count(&event.event_id, false)?));
        }

        let ids: Vec<OwnedEventId> = events.iter().map(|event| event.event_id.clone()).collect();
        let limited = update.timeline.limited;
        let prev_batch = update.timeline.prev_batch;
        let outcome = self
            .timeline
            .mutate(room_id, |timeline| {
                let live = timeline.live_chunk().map(|chunk| (chunk.chunk_id, chunk.next_token.clone()));
                let batch = match live {
                    Some((chunk_id, token)) if !limited => Batch {
                        events: ids,
                        prev_token: token.clone(),
                        next_token: Some(next_batch.clone()),
                        is_last_forward: true,
                        reached_start: false,
                        anchor: Some(Anchor {
                            chunk_id,
                            direction: Direction::Forward,
                            token,
                        }),
                    },
                    _ => Batch {
                        events: ids,
                        prev_token: prev_batch,
                        next_token: Some(next_batch.clone()),
                        is_last_forward: true,
                        reached_start: false,
                        anchor: None,
                    },
                };

                let outcome = gap_resolver::Service.resolve(timeline, batch);
                if timeline.is_empty() {
                    timeline.ensure_anchor_chunk();
                }
                if let Some(live) = timeline.live_chunk_mut() {
                    live.next_token = Some(next_batch.clone());
                }
                outcome
            })
            .await?;
        if limited {
            debug!(%room_id, "Limited sync left a gap before the live chunk");
        }

        let accepted: HashSet<&OwnedEventId> = outcome.accepted.iter().collect();
        let mut updated = HashMap::new();
        self.timeline
            .read(room_id, |timeline| -> Result<()> {
                for (event, count) in &counts {
                    if let Some(change) = self.state.apply(timeline, event, *count)? {
                        diff.state_changes.push(change);
                    }
                }
                for event in events
                    .iter()
                    .filter(|event| accepted.contains(&event.event_id) || changed.contains(&event.event_id))
                {
                    for target in self.relations.apply(timeline, event)? {
                        updated.insert(target.event_id.clone(), target);
                    }
                }
                Ok(())
            })
            .await??;

        for event_id in &outcome.accepted {
            if let Some(event) = self.event_store.get(event_id)? {
                updated.remove(event_id);
                diff.inserted.push(event);
            }
        }
        for event_id in changed {
            if !accepted.contains(&event_id) && !updated.contains_key(&event_id) {
                if let Some(event) = self.event_store.get(&event_id)? {
                    diff.updated.push(event);
                }
            }
        }
        diff.updated.extend(updated.into_values());

        if let Some(user_ids) = &update.ephemeral.typing {
            self.typing.replace_room(room_id, user_ids).await;
        }
        self.read_markers.apply_sync(
            room_id,
            update.account_data.fully_read.as_deref(),
            &update.ephemeral.receipts,
        )?;
        if let Some(tags) = &update.account_data.tags {
            self.tags.replace(room_id, tags)?;
        }

        debug!(
            %room_id,
            inserted = diff.inserted.len(),
            updated = diff.updated.len(),
            state_changes = diff.state_changes.len(),
            "Merged room delta"
        );
        Ok(diff)
    }

    /// Retries decryption of the room's undecryptable events, e.g. after a
    /// key arrived. Recovered events are re-stored and reported as updated.
    #[tracing::instrument(skip(self))]
    pub async fn redecrypt(&self, room_id: &RoomId) -> Result<TimelineDiff> {
        let event_ids: Vec<OwnedEventId> = self
            .timeline
            .read(room_id, |timeline| {
                timeline
                    .chunks()
                    .iter()
                    .flat_map(|chunk| chunk.events().cloned())
                    .collect()
            })
            .await?;

        let mut recovered: Vec<Event> = Vec::new();
        for event_id in event_ids {
            let Some(event) = self.event_store.get(&event_id)? else {
                continue;
            };
            if event.decryption_failure.is_none() {
                continue;
            }
            let decrypted = decrypt_or_mark(&*self.decryptor, event).await;
            if decrypted.decryption_failure.is_none() {
                self.event_store.put(&decrypted)?;
                recovered.push(decrypted);
            }
        }

        let mut diff = TimelineDiff::new(room_id.to_owned(), DiffOrigin::Decryption);
        let mut updated = HashMap::new();
        self.timeline
            .read(room_id, |timeline| -> Result<()> {
                for event in &recovered {
                    for target in self.relations.apply(timeline, event)? {
                        updated.insert(target.event_id.clone(), target);
                    }
                }
                Ok(())
            })
            .await??;
        for event in &recovered {
            if let Some(stored) = self.event_store.get(&event.event_id)? {
                updated.remove(&event.event_id);
                diff.updated.push(stored);
            }
        }
        diff.updated.extend(updated.into_values());

        info!(%room_id, recovered = recovered.len(), "✅ Retried decryption");
        self.diffs.emit(&diff);
        Ok(diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{database::KeyValueDatabase, service::Services, transport::ReplayTransport};
    use matrixon_timeline_core::{
        DecryptionFailure, LocalDraft, TagInfo, TimelineConfig, TimelineSlice,
    };
    use async_trait::async_trait;
    use mockall::mock;
    use ruma::{
        event_id, events::TimelineEventType, room_id, uint, user_id, EventId, MilliSecondsSinceUnixEpoch,
        OwnedRoomId,
    };
    use serde_json::json;
    use std::collections::BTreeMap;
    use test_log::test;

    mock! {
        Decryptor {}
        #[async_trait]
        impl Decryptor for Decryptor {
            async fn decrypt(&self, event: &Event) -> std::result::Result<Event, DecryptionFailure>;
        }
    }

    fn room() -> OwnedRoomId {
        room_id!("!room:example.org").to_owned()
    }

    fn event(n: u32) -> Event {
        Event::new(
            EventId::parse(format!("$e{n}")).unwrap(),
            room(),
            TimelineEventType::RoomMessage,
            user_id!("@alice:example.org").to_owned(),
            MilliSecondsSinceUnixEpoch(uint!(1)),
            json!({ "msgtype": "m.text", "body": format!("message {n}") }),
        )
    }

    fn delta(next: &str, events: Vec<Event>, limited: bool, prev: Option<&str>) -> SyncResponse {
        let update = JoinedRoomUpdate {
            timeline: TimelineSlice {
                events,
                limited,
                prev_batch: prev.map(Token::new),
            },
            ..Default::default()
        };
        SyncResponse {
            next_batch: Token::new(next),
            rooms: BTreeMap::from([(room(), update)]),
        }
    }

    fn services_with(transport: Arc<ReplayTransport>, decryptor: Arc<dyn Decryptor>) -> Services {
        let db = Arc::new(KeyValueDatabase::in_memory().unwrap());
        let config = TimelineConfig::new(user_id!("@me:example.org").to_owned());
        Services::build(db, config, transport, decryptor).unwrap()
    }

    fn services() -> Services {
        services_with(Arc::new(ReplayTransport::new()), Arc::new(matrixon_timeline_core::NoopDecryptor))
    }

    async fn live_events(services: &Services) -> Vec<String> {
        services
            .rooms
            .timeline
            .read(&room(), |t| {
                t.live_chunk()
                    .map(|c| c.events().map(|id| id.as_str().to_owned()).collect())
                    .unwrap_or_default()
            })
            .await
            .unwrap()
    }

    #[test(tokio::test)]
    async fn test_initial_sync_creates_live_chunk() {
        let services = services();
        let diffs = services
            .rooms
            .sync
            .apply_sync(delta("s1", vec![event(1), event(2)], false, Some("p0")))
            .await
            .unwrap();

        assert_eq!(diffs.len(), 1);
        let inserted: Vec<_> = diffs[0].inserted.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(inserted, vec!["$e1", "$e2"]);
        assert_eq!(live_events(&services).await, vec!["$e1", "$e2"]);
        assert_eq!(services.rooms.timeline.sync_token().unwrap(), Some(Token::new("s1")));

        let prev = services
            .rooms
            .timeline
            .read(&room(), |t| t.live_chunk().and_then(|c| c.prev_token.clone()))
            .await
            .unwrap();
        assert_eq!(prev, Some(Token::new("p0")));
    }

    #[test(tokio::test)]
    async fn test_reapplying_a_delta_is_a_no_op() {
        let services = services();
        let response = delta("s1", vec![event(1), event(2)], false, None);
        services.rooms.sync.apply_sync(response.clone()).await.unwrap();
        let version = services.rooms.event_store.version(event_id!("$e1")).unwrap();

        let diffs = services.rooms.sync.apply_sync(response).await.unwrap();
        assert!(diffs.is_empty());
        assert_eq!(live_events(&services).await, vec!["$e1", "$e2"]);
        assert_eq!(services.rooms.event_store.version(event_id!("$e1")).unwrap(), version);
    }

    #[test(tokio::test)]
    async fn test_gapless_sync_extends_live_chunk() {
        let services = services();
        services.rooms.sync.apply_sync(delta("s1", vec![event(1)], false, None)).await.unwrap();
        services.rooms.sync.apply_sync(delta("s2", vec![event(2), event(3)], false, Some("ignored"))).await.unwrap();

        assert_eq!(live_events(&services).await, vec!["$e1", "$e2", "$e3"]);
        let chunks = services.rooms.timeline.read(&room(), |t| t.chunks().len()).await.unwrap();
        assert_eq!(chunks, 1);
    }

    #[test(tokio::test)]
    async fn test_limited_sync_starts_new_live_chunk() {
        let services = services();
        services.rooms.sync.apply_sync(delta("s1", vec![event(1)], false, None)).await.unwrap();
        services
            .rooms
            .sync
            .apply_sync(delta("s2", vec![event(10), event(11)], true, Some("gap")))
            .await
            .unwrap();

        assert_eq!(live_events(&services).await, vec!["$e10", "$e11"]);
        let (chunks, live_prev, live_count) = services
            .rooms
            .timeline
            .read(&room(), |t| {
                let live = t.live_chunk().unwrap();
                (
                    t.chunks().len(),
                    live.prev_token.clone(),
                    t.chunks().iter().filter(|c| c.is_last_forward).count(),
                )
            })
            .await
            .unwrap();
        assert_eq!(chunks, 2);
        assert_eq!(live_prev, Some(Token::new("gap")));
        assert_eq!(live_count, 1);
    }

    #[test(tokio::test)]
    async fn test_empty_sync_for_new_room_creates_empty_live_chunk() {
        let services = services();
        let diffs = services.rooms.sync.apply_sync(delta("s1", Vec::new(), false, None)).await.unwrap();
        assert!(diffs.is_empty());

        let live = services
            .rooms
            .timeline
            .read(&room(), |t| t.live_chunk().map(|c| (c.is_empty(), c.next_token.clone())))
            .await
            .unwrap();
        assert_eq!(live, Some((true, Some(Token::new("s1")))));
    }

    #[test(tokio::test)]
    async fn test_edit_in_sync_updates_target() {
        let services = services();
        services.rooms.sync.apply_sync(delta("s1", vec![event(1)], false, None)).await.unwrap();

        let draft = LocalDraft::edit(event_id!("$e1").to_owned(), "fixed");
        let mut edit = event(2);
        edit.content = draft.content;

        let diffs = services.rooms.sync.apply_sync(delta("s2", vec![edit], false, None)).await.unwrap();
        let updated = &diffs[0].updated;
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].event_id, event_id!("$e1"));
        assert_eq!(updated[0].body(), Some("fixed"));
    }

    #[test(tokio::test)]
    async fn test_state_changes_are_reported_in_server_order() {
        let services = services();
        let topic = |n: u32, text: &str| {
            let mut event = event(n);
            event.kind = TimelineEventType::RoomTopic;
            event.content = json!({ "topic": text });
            event.with_state_key("")
        };

        let diffs = services
            .rooms
            .sync
            .apply_sync(delta("s1", vec![topic(1, "one"), topic(2, "two")], false, None))
            .await
            .unwrap();
        let changes = &diffs[0].state_changes;
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].previous.as_deref(), Some(event_id!("$e1")));

        let current = services
            .rooms
            .state
            .current(&room(), &TimelineEventType::RoomTopic, "")
            .unwrap()
            .unwrap();
        assert_eq!(current.event_id, event_id!("$e2"));
    }

    #[test(tokio::test)]
    async fn test_ephemeral_and_account_data_are_projected() {
        let services = services();
        let mut response = delta("s1", vec![event(1)], false, None);
        let update = response.rooms.get_mut(&room()).unwrap();
        update.ephemeral.typing = Some(vec![user_id!("@bob:example.org").to_owned()]);
        update
            .ephemeral
            .receipts
            .insert(user_id!("@me:example.org").to_owned(), event_id!("$e1").to_owned());
        update.account_data.fully_read = Some(event_id!("$e1").to_owned());
        update.account_data.tags = Some(BTreeMap::from([("m.favourite".to_owned(), TagInfo { order: Some(0.5) })]));

        services.rooms.sync.apply_sync(response).await.unwrap();

        assert_eq!(
            services.rooms.edus.typing.typings_all(&room()).await,
            vec![user_id!("@bob:example.org").to_owned()]
        );
        let markers = services.rooms.read_markers.read_markers(&room()).unwrap();
        assert_eq!(markers.fully_read.as_deref(), Some(event_id!("$e1")));
        assert_eq!(markers.read_receipt.as_deref(), Some(event_id!("$e1")));
        assert!(services.rooms.tags.tags(&room()).unwrap().contains_key("m.favourite"));
    }

    #[test(tokio::test)]
    async fn test_sync_confirms_local_echo() {
        let services = services();
        services.rooms.sync.apply_sync(delta("s1", vec![event(1)], false, None)).await.unwrap();

        let txn = services.rooms.local_echo.send_local(&room(), LocalDraft::text("hello")).await.unwrap();
        let event_id = services.rooms.local_echo.submit(&room(), &txn).await.unwrap();

        let mut remote = event(2);
        remote.event_id = event_id.clone();
        remote.sender = user_id!("@me:example.org").to_owned();
        let remote = remote.with_transaction_id(txn.clone());

        let diffs = services.rooms.sync.apply_sync(delta("s2", vec![remote], false, None)).await.unwrap();
        assert!(diffs[0].inserted.is_empty());
        assert_eq!(diffs[0].superseded.len(), 1);
        assert_eq!(diffs[0].superseded[0].transaction_id, txn);

        // The server event landed right where the echo was shown.
        assert!(services.rooms.local_echo.echoes_in(&room()).unwrap().is_empty());
        let view = services.live_view(&room()).await.unwrap();
        assert_eq!(view[1].event.event_id, event_id);
        assert_eq!(view[1].transaction_id.as_ref(), Some(&txn));
        assert_eq!(view[1].send_state, None);
        assert_eq!(services.rooms.local_echo.submit(&room(), &txn).await.unwrap(), event_id);
    }

    fn own_echo(event_id: &EventId, txn: &ruma::TransactionId, n: u32) -> Event {
        let mut remote = event(n);
        remote.event_id = event_id.to_owned();
        remote.sender = user_id!("@me:example.org").to_owned();
        remote.with_transaction_id(txn.to_owned())
    }

    #[test(tokio::test)]
    async fn test_confirmed_echoes_do_not_accumulate() {
        let services = services();
        services.rooms.sync.apply_sync(delta("s0", vec![event(0)], false, None)).await.unwrap();

        for n in 1..=8 {
            let txn = services.rooms.local_echo.send_local(&room(), LocalDraft::text("hi")).await.unwrap();
            let event_id = services.rooms.local_echo.submit(&room(), &txn).await.unwrap();
            services
                .rooms
                .sync
                .apply_sync(delta(&format!("s{n}"), vec![own_echo(&event_id, &txn, n)], false, None))
                .await
                .unwrap();
            assert!(services.rooms.local_echo.echoes_in(&room()).unwrap().is_empty());
        }
        assert_eq!(services.live_view(&room()).await.unwrap().len(), 9);
    }

    #[test(tokio::test)]
    async fn test_displaced_echo_keeps_its_slot_until_the_gap() {
        let services = services();
        services.rooms.sync.apply_sync(delta("s1", vec![event(1)], false, None)).await.unwrap();

        let txn = services.rooms.local_echo.send_local(&room(), LocalDraft::text("mine")).await.unwrap();
        let event_id = services.rooms.local_echo.submit(&room(), &txn).await.unwrap();

        // Someone else's message is ordered before ours by the server.
        services
            .rooms
            .sync
            .apply_sync(delta("s2", vec![event(2), own_echo(&event_id, &txn, 3)], false, None))
            .await
            .unwrap();
        let view: Vec<_> = services
            .live_view(&room())
            .await
            .unwrap()
            .into_iter()
            .map(|item| item.event.event_id)
            .collect();
        assert_eq!(view, vec![event_id!("$e1").to_owned(), event_id.clone(), event_id!("$e2").to_owned()]);
        assert_eq!(services.rooms.local_echo.echoes_in(&room()).unwrap().len(), 1);

        // A limited sync moves the live chunk away from the echo's anchor.
        services
            .rooms
            .sync
            .apply_sync(delta("s3", vec![event(9)], true, Some("gap")))
            .await
            .unwrap();
        assert!(services.rooms.local_echo.echoes_in(&room()).unwrap().is_empty());
    }

    #[test(tokio::test)]
    async fn test_sync_once_resumes_from_stored_cursor() {
        let transport = Arc::new(ReplayTransport::new());
        transport.push_sync(delta("s1", vec![event(1)], false, None));
        transport.push_sync(delta("s2", vec![event(2)], false, None));
        let services = services_with(transport.clone(), Arc::new(matrixon_timeline_core::NoopDecryptor));

        services.sync_once().await.unwrap();
        services.sync_once().await.unwrap();

        assert_eq!(transport.sync_tokens(), vec![None, Some(Token::new("s1"))]);
        assert_eq!(live_events(&services).await, vec!["$e1", "$e2"]);
    }

    #[test(tokio::test)]
    async fn test_redecrypt_reports_recovered_events() {
        let mut decryptor = MockDecryptor::new();
        let mut attempts = 0;
        decryptor.expect_decrypt().times(2).returning(move |event| {
            attempts += 1;
            if attempts == 1 {
                return Err(DecryptionFailure::new("missing session"));
            }
            let mut plain = event.clone();
            plain.kind = TimelineEventType::RoomMessage;
            plain.content = json!({ "msgtype": "m.text", "body": "secret" });
            Ok(plain)
        });
        let services = services_with(Arc::new(ReplayTransport::new()), Arc::new(decryptor));

        let mut encrypted = event(1);
        encrypted.kind = TimelineEventType::RoomEncrypted;
        encrypted.content = json!({ "algorithm": "m.megolm.v1.aes-sha2", "ciphertext": "..." });
        let diffs = services.rooms.sync.apply_sync(delta("s1", vec![encrypted], false, None)).await.unwrap();
        assert!(diffs[0].inserted[0].decryption_failure.is_some());

        let mut receiver = services.subscribe();
        let diff = services.rooms.sync.redecrypt(&room()).await.unwrap();
        assert_eq!(diff.origin, DiffOrigin::Decryption);
        assert_eq!(diff.updated.len(), 1);
        assert_eq!(diff.updated[0].body(), Some("secret"));
        assert_eq!(services.rooms.event_store.version(event_id!("$e1")).unwrap(), Some(2));
        assert_eq!(receiver.try_recv().unwrap(), diff);
    }
}
