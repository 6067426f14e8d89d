mod data;

use std::{
    cmp::Ordering,
    collections::{BTreeMap, HashSet},
    sync::{Arc, Mutex},
};

pub use data::Data;

use matrixon_timeline_core::{
    utils::generate_transaction_id, Event, LocalDraft, Relation, RelationKind, SendState, TimelineError,
    Transport,
};
use ruma::{EventId, OwnedEventId, OwnedTransactionId, OwnedUserId, RoomId};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{
    event_store::{self, PutOutcome},
    local_echo,
    timeline::{self, RoomTimeline, TimelineCount},
};
use crate::Result;

/// What `update_quick_reaction` did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuickReaction {
    Added(OwnedTransactionId),
    /// The own reaction was redacted by the returned redaction event.
    Removed(OwnedEventId),
    /// A reaction that had not been sent yet was dropped.
    Discarded(OwnedTransactionId),
}

pub struct Service {
    pub db: Arc<dyn Data>,
    user_id: OwnedUserId,
    event_store: Arc<event_store::Service>,
    timeline: Arc<timeline::Service>,
    local_echo: Arc<local_echo::Service>,
    transport: Arc<dyn Transport>,

    /// Own reactions redacted through the transport whose redaction sync has
    /// not delivered yet.
    redacting: Mutex<HashSet<OwnedEventId>>,
}

impl Service {
    pub fn build(
        db: Arc<dyn Data>,
        user_id: OwnedUserId,
        event_store: Arc<event_store::Service>,
        timeline: Arc<timeline::Service>,
        local_echo: Arc<local_echo::Service>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            db,
            user_id,
            event_store,
            timeline,
            local_echo,
            transport,
            redacting: Mutex::new(HashSet::new()),
        }
    }

    fn redacting(&self) -> Result<std::sync::MutexGuard<'_, HashSet<OwnedEventId>>> {
        self.redacting
            .lock()
            .map_err(|_| TimelineError::InvalidState("reaction redaction set poisoned".to_owned()))
    }

    /// Applies what `event` changes about other events, and what already
    /// stored relations change about `event` itself. Returns every event
    /// whose stored content changed. `timeline` is the event's room graph,
    /// with the event already placed.
    #[tracing::instrument(skip(self, timeline, event), fields(event_id = %event.event_id))]
    pub fn apply(&self, timeline: &RoomTimeline, event: &Event) -> Result<Vec<Event>> {
        let mut updated = Vec::new();

        match event.relation() {
            Some(Relation {
                event_id: target,
                kind: RelationKind::Redaction,
            }) => {
                self.redacting()?.remove(&target);
                updated.extend(self.refresh(timeline, &target)?);
            }
            Some(Relation {
                event_id: target,
                kind: RelationKind::Replace,
            }) => updated.extend(self.refresh(timeline, &target)?),
            _ => {}
        }
        updated.extend(self.refresh(timeline, &event.event_id)?);

        Ok(updated)
    }

    /// Recomputes an event's content from its stored redactions and edits.
    fn refresh(&self, timeline: &RoomTimeline, target_id: &EventId) -> Result<Vec<Event>> {
        let Some(mut target) = self.event_store.get(target_id)? else {
            return Ok(Vec::new());
        };
        let relation_before = target.relation();
        let relating = self.event_store.relating_events(target_id)?;

        if let Some(redaction) = relating
            .iter()
            .find(|e| matches!(e.relation(), Some(Relation { kind: RelationKind::Redaction, .. })))
        {
            if target.is_redacted() {
                return Ok(Vec::new());
            }
            debug!(redaction = %redaction.event_id, "Redacting event");
            target.content = json!({});
            target.unsigned.redacted_because = Some(redaction.event_id.clone());
        } else {
            let Some(content) = self.edited_content(timeline, &target, &relating)? else {
                return Ok(Vec::new());
            };
            target.content = content;
        }

        let mut updated = Vec::new();
        if let PutOutcome::Updated { .. } = self.event_store.put(&target)? {
            updated.push(target.clone());
        }

        // A redacted edit no longer applies to the event it edited.
        if target.is_redacted() {
            if let Some(Relation {
                event_id: edited,
                kind: RelationKind::Replace,
            }) = relation_before
            {
                updated.extend(self.refresh(timeline, &edited)?);
            }
        }

        Ok(updated)
    }

    /// Content the target should show given its edits; `None` when the
    /// target was never edited.
    fn edited_content(
        &self,
        timeline: &RoomTimeline,
        target: &Event,
        relating: &[Event],
    ) -> Result<Option<Value>> {
        let mut latest: Option<(&EventId, TimelineCount, &Value)> = None;
        for edit in relating {
            if edit.sender != target.sender || edit.is_redacted() {
                continue;
            }
            if !matches!(edit.relation(), Some(Relation { kind: RelationKind::Replace, .. })) {
                continue;
            }
            let Some(new_content) = edit.content.get("m.new_content").filter(|c| c.is_object()) else {
                continue;
            };
            let count = self.timeline.event_count(&edit.event_id)?.unwrap_or(TimelineCount::min());
            let newer = latest.map_or(true, |(best_id, best, _)| {
                timeline.cmp_recency((&*edit.event_id, count), (best_id, best)) != Ordering::Less
            });
            if newer {
                latest = Some((&*edit.event_id, count, new_content));
            }
        }

        let original = match self.db.original_content(&target.event_id)? {
            Some(original) => original,
            None if latest.is_some() => {
                self.db.set_original_content(&target.event_id, &target.content)?;
                target.content.clone()
            }
            None => return Ok(None),
        };

        let Some((_, _, new_content)) = latest else {
            return Ok(Some(original));
        };
        let mut content = new_content.clone();
        if let (Some(relates_to), Some(object)) = (original.get("m.relates_to"), content.as_object_mut()) {
            object.insert("m.relates_to".to_owned(), relates_to.clone());
        }
        Ok(Some(content))
    }

    /// The target's content before any edit, followed by every edit of its
    /// sender in server order.
    pub async fn edit_history(&self, target_id: &EventId) -> Result<Vec<Event>> {
        let Some(mut original) = self.event_store.get(target_id)? else {
            return Ok(Vec::new());
        };
        if let Some(content) = self.db.original_content(target_id)? {
            original.content = content;
        }

        let mut edits = Vec::new();
        for edit in self.event_store.relating_events(target_id)? {
            if edit.sender == original.sender
                && matches!(edit.relation(), Some(Relation { kind: RelationKind::Replace, .. }))
            {
                let count = self.timeline.event_count(&edit.event_id)?.unwrap_or(TimelineCount::min());
                edits.push((count, edit));
            }
        }
        self.timeline
            .read(&original.room_id, |timeline| {
                edits.sort_by(|(a, edit_a), (b, edit_b)| {
                    timeline.cmp_recency((&*edit_a.event_id, *a), (&*edit_b.event_id, *b))
                })
            })
            .await?;

        Ok(std::iter::once(original)
            .chain(edits.into_iter().map(|(_, edit)| edit))
            .collect())
    }

    /// Live reactions to an event grouped by key.
    pub fn reactions(&self, target_id: &EventId) -> Result<BTreeMap<String, Vec<Event>>> {
        let mut groups: BTreeMap<String, Vec<Event>> = BTreeMap::new();
        for event in self.event_store.relating_events(target_id)? {
            if let Some(Relation {
                kind: RelationKind::Annotation { key },
                ..
            }) = event.relation()
            {
                groups.entry(key).or_default().push(event);
            }
        }
        Ok(groups)
    }

    /// The own, not yet redacted reaction with `key` on the target. A
    /// reaction whose redaction was sent but not yet synced counts as
    /// redacted.
    pub fn find_reaction_for_undo(
        &self,
        room_id: &RoomId,
        target_id: &EventId,
        key: &str,
    ) -> Result<Option<OwnedEventId>> {
        let redacting = self.redacting()?;
        Ok(self
            .reactions(target_id)?
            .remove(key)
            .unwrap_or_default()
            .into_iter()
            .find(|reaction| {
                reaction.sender == self.user_id
                    && reaction.room_id == room_id
                    && !redacting.contains(&reaction.event_id)
            })
            .map(|reaction| reaction.event_id))
    }

    /// Sends a reaction through the local echo pipeline.
    pub async fn send_reaction(
        &self,
        room_id: &RoomId,
        target_id: &EventId,
        key: &str,
    ) -> Result<OwnedTransactionId> {
        let txn_id = self
            .local_echo
            .send_local(room_id, LocalDraft::reaction(target_id.to_owned(), key))
            .await?;
        self.local_echo.submit(room_id, &txn_id).await?;
        Ok(txn_id)
    }

    /// Toggles the own reaction with `key` on the target.
    #[tracing::instrument(skip(self))]
    pub async fn update_quick_reaction(
        &self,
        room_id: &RoomId,
        target_id: &EventId,
        key: &str,
    ) -> Result<QuickReaction> {
        let wanted = Relation::annotation(target_id.to_owned(), key);

        let mut to_redact = self.find_reaction_for_undo(room_id, target_id, key)?;
        let mut sent_echo = None;
        if to_redact.is_none() {
            let mut unsynced = None;
            for echo in self.local_echo.echoes_in(room_id)? {
                if echo.placeholder.relation().as_ref() != Some(&wanted) {
                    continue;
                }
                // Once stored, the reaction is judged by what the store says.
                let stored = match &echo.state {
                    SendState::ServerConfirmed { .. } => true,
                    SendState::SentAwaitingSync { event_id } => self.event_store.exists(event_id)?,
                    SendState::Pending | SendState::Failed { .. } => false,
                };
                if !stored {
                    unsynced = Some(echo);
                    break;
                }
            }

            if let Some(echo) = unsynced {
                match echo.state {
                    SendState::SentAwaitingSync { event_id } => {
                        to_redact = Some(event_id);
                        sent_echo = Some(echo.transaction_id);
                    }
                    _ => {
                        self.local_echo.discard(room_id, &echo.transaction_id)?;
                        return Ok(QuickReaction::Discarded(echo.transaction_id));
                    }
                }
            }
        }

        match to_redact {
            Some(reaction_id) => {
                let redaction = self
                    .transport
                    .redact_event(room_id, &reaction_id, &generate_transaction_id())
                    .await?;
                self.redacting()?.insert(reaction_id.clone());
                if let Some(txn_id) = sent_echo {
                    self.local_echo.discard(room_id, &txn_id)?;
                }
                info!(%reaction_id, %redaction, "Removed reaction");
                Ok(QuickReaction::Removed(redaction))
            }
            None => Ok(QuickReaction::Added(self.send_reaction(room_id, target_id, key).await?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        database::KeyValueDatabase,
        service::{
            rooms::timeline::{DiffBus, TimelineChunk},
            transaction_ids,
        },
        transport::ReplayTransport,
    };
    use ruma::{event_id, events::TimelineEventType, room_id, uint, user_id, MilliSecondsSinceUnixEpoch};
    use test_log::test;

    struct Fixture {
        relations: Service,
        event_store: Arc<event_store::Service>,
        timeline: Arc<timeline::Service>,
        local_echo: Arc<local_echo::Service>,
        transport: Arc<ReplayTransport>,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(KeyValueDatabase::in_memory().unwrap());
        let transport = Arc::new(ReplayTransport::new());
        let event_store = Arc::new(event_store::Service::build(db.clone(), 16));
        let timeline = Arc::new(timeline::Service::build(db.clone()));
        let local_echo = Arc::new(local_echo::Service::build(
            user_id!("@me:example.org").to_owned(),
            transport.clone(),
            Arc::new(transaction_ids::Service { db: db.clone() }),
            event_store.clone(),
            timeline.clone(),
            Arc::new(DiffBus::new(16)),
        ));
        let relations = Service::build(
            db,
            user_id!("@me:example.org").to_owned(),
            event_store.clone(),
            timeline.clone(),
            local_echo.clone(),
            transport.clone(),
        );
        Fixture {
            relations,
            event_store,
            timeline,
            local_echo,
            transport,
        }
    }

    fn event(id: &str, sender: &str, draft: LocalDraft) -> Event {
        Event::new(
            EventId::parse(id).unwrap(),
            room_id!("!room:example.org").to_owned(),
            draft.kind,
            ruma::UserId::parse(sender).unwrap(),
            MilliSecondsSinceUnixEpoch(uint!(1)),
            draft.content,
        )
    }

    fn store(fx: &Fixture, event: &Event) -> Vec<Event> {
        let unplaced = RoomTimeline::new(event.room_id.clone());
        store_placed(fx, &unplaced, event, false)
    }

    fn store_placed(fx: &Fixture, graph: &RoomTimeline, event: &Event, backfilled: bool) -> Vec<Event> {
        fx.event_store.put(event).unwrap();
        fx.timeline.ensure_count(&event.event_id, backfilled).unwrap();
        fx.relations.apply(graph, event).unwrap()
    }

    #[test(tokio::test)]
    async fn test_latest_edit_of_sender_wins() {
        let fx = fixture();
        let target = event("$m", "@alice:example.org", LocalDraft::text("helo"));
        store(&fx, &target);

        let first = event("$edit1", "@alice:example.org", LocalDraft::edit(target.event_id.clone(), "hello"));
        let updated = store(&fx, &first);
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].body(), Some("hello"));

        let foreign = event("$edit_bob", "@bob:example.org", LocalDraft::edit(target.event_id.clone(), "spam"));
        assert!(store(&fx, &foreign).is_empty());

        let second = event("$edit2", "@alice:example.org", LocalDraft::edit(target.event_id.clone(), "hello!"));
        store(&fx, &second);
        let current = fx.event_store.get(event_id!("$m")).unwrap().unwrap();
        assert_eq!(current.body(), Some("hello!"));

        let history = fx.relations.edit_history(event_id!("$m")).await.unwrap();
        let bodies: Vec<_> = history.iter().filter_map(|e| e.content["body"].as_str()).collect();
        assert_eq!(bodies, vec!["helo", "* hello", "* hello!"]);
    }

    #[test]
    fn test_edit_in_live_chunk_beats_edit_from_older_chunk() {
        let fx = fixture();
        let room = room_id!("!room:example.org");
        let mut graph = RoomTimeline::new(room.to_owned());
        for (names, live) in [(&["$m", "$edit_old"][..], false), (&["$edit_new"][..], true)] {
            let mut chunk = TimelineChunk::new(graph.allocate_chunk_id());
            chunk.append(names.iter().map(|n| EventId::parse(*n).unwrap()), None);
            chunk.is_last_forward = live;
            graph.place_chunk(chunk);
        }

        let target = event("$m", "@alice:example.org", LocalDraft::text("helo"));
        store_placed(&fx, &graph, &target, true);
        let old = event("$edit_old", "@alice:example.org", LocalDraft::edit(target.event_id.clone(), "hello"));
        store_placed(&fx, &graph, &old, true);
        // Fetched last, so its backfill stamp reads as the oldest edit.
        let new = event("$edit_new", "@alice:example.org", LocalDraft::edit(target.event_id.clone(), "hello!"));
        let updated = store_placed(&fx, &graph, &new, true);
        assert_eq!(updated.len(), 1);

        let current = fx.event_store.get(event_id!("$m")).unwrap().unwrap();
        assert_eq!(current.body(), Some("hello!"));
    }

    #[test]
    fn test_edit_arriving_before_target_applies_later() {
        let fx = fixture();
        let edit = event("$edit", "@alice:example.org", LocalDraft::edit(event_id!("$m").to_owned(), "fixed"));
        assert!(store(&fx, &edit).is_empty());

        let target = event("$m", "@alice:example.org", LocalDraft::text("fxied"));
        let updated = store(&fx, &target);
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].body(), Some("fixed"));
    }

    #[test]
    fn test_redaction_strips_content() {
        let fx = fixture();
        let target = event("$m", "@alice:example.org", LocalDraft::text("secret"));
        store(&fx, &target);

        let redaction = event(
            "$redaction",
            "@alice:example.org",
            LocalDraft::new(TimelineEventType::RoomRedaction, serde_json::json!({ "redacts": "$m" })),
        );
        let updated = store(&fx, &redaction);
        assert_eq!(updated.len(), 1);
        assert!(updated[0].is_redacted());
        assert_eq!(updated[0].body(), None);
        assert!(store(&fx, &redaction).is_empty());
    }

    #[test]
    fn test_redacted_edit_restores_original() {
        let fx = fixture();
        store(&fx, &event("$m", "@alice:example.org", LocalDraft::text("original")));
        store(&fx, &event("$edit", "@alice:example.org", LocalDraft::edit(event_id!("$m").to_owned(), "edited")));

        let redaction = event(
            "$redaction",
            "@alice:example.org",
            LocalDraft::new(TimelineEventType::RoomRedaction, serde_json::json!({ "redacts": "$edit" })),
        );
        let updated = store(&fx, &redaction);
        assert_eq!(updated.len(), 2);
        assert_eq!(fx.event_store.get(event_id!("$m")).unwrap().unwrap().body(), Some("original"));
    }

    fn own_reaction(event_id: &EventId, txn_id: &OwnedTransactionId) -> Event {
        event(
            event_id.as_str(),
            "@me:example.org",
            LocalDraft::reaction(event_id!("$m").to_owned(), "👍"),
        )
        .with_transaction_id(txn_id.clone())
    }

    fn redaction_of(event_id: &EventId) -> Event {
        event(
            &format!("$redaction_of_{}", &event_id.as_str()[1..]),
            "@me:example.org",
            LocalDraft::new(TimelineEventType::RoomRedaction, serde_json::json!({ "redacts": event_id })),
        )
    }

    #[test(tokio::test)]
    async fn test_quick_reaction_toggles() {
        let fx = fixture();
        let room = room_id!("!room:example.org");
        store(&fx, &event("$m", "@alice:example.org", LocalDraft::text("hi")));

        let added = fx.relations.update_quick_reaction(room, event_id!("$m"), "👍").await.unwrap();
        assert!(matches!(added, QuickReaction::Added(_)));
        assert_eq!(fx.transport.submitted().len(), 1);

        // Sent but not yet synced: toggling redacts the acknowledged event.
        let removed = fx.relations.update_quick_reaction(room, event_id!("$m"), "👍").await.unwrap();
        assert!(matches!(removed, QuickReaction::Removed(_)));
        assert_eq!(fx.transport.redactions().len(), 1);
    }

    #[test(tokio::test)]
    async fn test_quick_reaction_alternates_across_syncs() {
        let fx = fixture();
        let room = room_id!("!room:example.org");
        let target = event_id!("$m");
        store(&fx, &event("$m", "@alice:example.org", LocalDraft::text("hi")));
        let toggle = || fx.relations.update_quick_reaction(room, target, "👍");

        // Added, then removed before sync ever saw it.
        assert!(matches!(toggle().await.unwrap(), QuickReaction::Added(_)));
        let first = fx.transport.submitted()[0].event_id.clone();
        assert!(matches!(toggle().await.unwrap(), QuickReaction::Removed(_)));
        assert!(fx.local_echo.echoes_in(room).unwrap().is_empty());

        // Added again and delivered by sync.
        let QuickReaction::Added(second_txn) = toggle().await.unwrap() else {
            panic!("expected the reaction to be re-added");
        };
        let second = fx.transport.submitted()[1].event_id.clone();
        store(&fx, &own_reaction(&second, &second_txn));
        assert!(matches!(toggle().await.unwrap(), QuickReaction::Removed(_)));

        // The redaction is in flight: the next toggle adds rather than
        // redacting the same reaction twice.
        let QuickReaction::Added(third_txn) = toggle().await.unwrap() else {
            panic!("expected a new reaction while the redaction is unsynced");
        };
        let third = fx.transport.submitted()[2].event_id.clone();
        store(&fx, &redaction_of(&second));
        store(&fx, &own_reaction(&third, &third_txn));
        assert!(matches!(toggle().await.unwrap(), QuickReaction::Removed(_)));

        let redacted: Vec<_> = fx.transport.redactions().into_iter().map(|(_, id)| id).collect();
        assert_eq!(redacted, vec![first, second, third]);
        assert_eq!(fx.transport.submitted().len(), 3);
        assert_eq!(fx.relations.find_reaction_for_undo(room, target, "👍").unwrap(), None);
    }

    #[test(tokio::test)]
    async fn test_find_reaction_for_undo_ignores_others() {
        let fx = fixture();
        let room = room_id!("!room:example.org");
        store(&fx, &event("$m", "@alice:example.org", LocalDraft::text("hi")));
        store(&fx, &event("$r_bob", "@bob:example.org", LocalDraft::reaction(event_id!("$m").to_owned(), "👍")));
        assert_eq!(fx.relations.find_reaction_for_undo(room, event_id!("$m"), "👍").unwrap(), None);

        store(&fx, &event("$r_me", "@me:example.org", LocalDraft::reaction(event_id!("$m").to_owned(), "👍")));
        assert_eq!(
            fx.relations.find_reaction_for_undo(room, event_id!("$m"), "👍").unwrap(),
            Some(event_id!("$r_me").to_owned())
        );
        assert_eq!(fx.relations.reactions(event_id!("$m")).unwrap()["👍"].len(), 2);
    }
}
