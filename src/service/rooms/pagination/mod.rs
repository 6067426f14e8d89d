// =============================================================================
// Matrixon Timeline - Pagination Module
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
//   Backward and forward history requests. One request per room and
//   direction is in flight at a time; callers arriving while it runs share
//   its result. Requests hold no room lock while waiting on the network,
//   and a cancelled or abandoned request always returns its slot to Idle.
//
// =============================================================================

use std::{
    collections::{HashMap, HashSet},
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use futures::{
    future::{self, AbortHandle, BoxFuture, Shared, WeakShared},
    FutureExt,
};
use matrixon_timeline_core::{
    decrypt_or_mark, ChunkId, Decryptor, DiffOrigin, Direction, Event, TimelineConfig,
    TimelineDiff, TimelineError, Token, Transport, TransportError,
};
use ruma::{EventId, OwnedEventId, OwnedRoomId, RoomId};
use tracing::{debug, error, info, warn};

use super::{
    event_store::{self, PutOutcome},
    gap_resolver::{self, Anchor, Batch},
    relations, state,
    timeline::{self, DiffBus},
};
use crate::Result;

/// Per room and direction request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationState {
    Idle,
    Requesting,
    Applying,
    Failed,
}

impl PaginationState {
    fn can_transition_to(self, next: Self) -> bool {
        use PaginationState::*;
        matches!(
            (self, next),
            (Idle, Requesting)
                | (Requesting, Applying)
                | (Requesting, Failed)
                | (Requesting, Idle)
                | (Applying, Idle)
                | (Applying, Failed)
                | (Failed, Idle)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaginationOutcome {
    Applied {
        chunk_id: ChunkId,
        /// Events new to the room, in server order.
        inserted: Vec<OwnedEventId>,
        /// History is exhausted in the requested direction.
        reached_end: bool,
    },
    /// Nothing more to fetch; no request was made.
    ReachedEnd,
}

type PageFuture = BoxFuture<'static, Result<PaginationOutcome>>;

struct InFlight {
    generation: u64,
    target: ChunkId,
    future: WeakShared<PageFuture>,
    abort: AbortHandle,
}

struct Slot {
    state: PaginationState,
    in_flight: Option<InFlight>,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            state: PaginationState::Idle,
            in_flight: None,
        }
    }
}

type SlotKey = (OwnedRoomId, Direction);

pub struct Service {
    config: TimelineConfig,
    transport: Arc<dyn Transport>,
    decryptor: Arc<dyn Decryptor>,
    event_store: Arc<event_store::Service>,
    timeline: Arc<timeline::Service>,
    state: Arc<state::Service>,
    relations: Arc<relations::Service>,
    diffs: Arc<DiffBus>,

    slots: Mutex<HashMap<SlotKey, Slot>>,
    generation: AtomicU64,
}

/// Returns the slot to Idle when the request future goes away, whether it
/// finished, was aborted or lost all its waiters.
struct RequestGuard {
    service: Arc<Service>,
    key: SlotKey,
    generation: u64,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let Ok(mut slots) = self.service.slots.lock() else {
            return;
        };
        let slot = slots.entry(self.key.clone()).or_default();
        let current = slot.in_flight.as_ref().map_or(true, |f| f.generation == self.generation);
        if current {
            slot.in_flight = None;
            slot.state = PaginationState::Idle;
        }
    }
}

impl Service {
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        config: TimelineConfig,
        transport: Arc<dyn Transport>,
        decryptor: Arc<dyn Decryptor>,
        event_store: Arc<event_store::Service>,
        timeline: Arc<timeline::Service>,
        state: Arc<state::Service>,
        relations: Arc<relations::Service>,
        diffs: Arc<DiffBus>,
    ) -> Self {
        Self {
            config,
            transport,
            decryptor,
            event_store,
            timeline,
            state,
            relations,
            diffs,
            slots: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn state(&self, room_id: &RoomId, direction: Direction) -> PaginationState {
        self.slots
            .lock()
            .ok()
            .and_then(|slots| slots.get(&(room_id.to_owned(), direction)).map(|slot| slot.state))
            .unwrap_or(PaginationState::Idle)
    }

    fn transition(&self, key: &SlotKey, generation: u64, next: PaginationState) {
        let Ok(mut slots) = self.slots.lock() else {
            return;
        };
        let slot = slots.entry(key.clone()).or_default();
        if slot.in_flight.as_ref().map(|f| f.generation) != Some(generation) {
            return;
        }
        if slot.state.can_transition_to(next) {
            slot.state = next;
        } else {
            error!(room_id = %key.0, direction = %key.1, from = ?slot.state, to = ?next, "Invalid pagination transition");
            debug_assert!(false, "invalid pagination transition {:?} -> {next:?}", slot.state);
        }
    }

    /// Paginates from the room's live chunk, or from its newest chunk when
    /// it has none. A room nothing is known about gets an empty chunk to
    /// grow from.
    #[tracing::instrument(skip(self))]
    pub async fn request_page(
        self: &Arc<Self>,
        room_id: &RoomId,
        direction: Direction,
        limit: Option<u32>,
    ) -> Result<PaginationOutcome> {
        let newest = self
            .timeline
            .read(room_id, |timeline| timeline.newest_chunk().map(|c| c.chunk_id))
            .await?;
        let chunk_id = match newest {
            Some(chunk_id) => chunk_id,
            None => {
                self.timeline
                    .mutate(room_id, |timeline| timeline.ensure_anchor_chunk())
                    .await?
            }
        };

        self.paginate_chunk(room_id, chunk_id, direction, limit).await
    }

    /// Paginates from a specific chunk, e.g. one created for a permalink.
    /// Joins the request already running for this room and direction when
    /// it targets the same chunk; otherwise waits for it and then issues
    /// its own.
    #[tracing::instrument(skip(self))]
    pub async fn paginate_chunk(
        self: &Arc<Self>,
        room_id: &RoomId,
        chunk_id: ChunkId,
        direction: Direction,
        limit: Option<u32>,
    ) -> Result<PaginationOutcome> {
        let key: SlotKey = (room_id.to_owned(), direction);
        let limit = self.config.bounded_page_limit(limit);

        loop {
            let (shared, joined) = {
                let mut slots = self
                    .slots
                    .lock()
                    .map_err(|_| TimelineError::InvalidState("pagination slots poisoned".to_owned()))?;
                let slot = slots.entry(key.clone()).or_default();

                match slot
                    .in_flight
                    .as_ref()
                    .and_then(|f| f.future.upgrade().map(|shared| (shared, f.target == chunk_id)))
                {
                    Some((shared, same_target)) => (shared, Some(same_target)),
                    None => (self.start(slot, key.clone(), chunk_id, limit), None),
                }
            };

            match joined {
                None => return shared.await,
                Some(true) => {
                    debug!("Joining in-flight pagination request");
                    return shared.await;
                }
                Some(false) => {
                    debug!("Waiting for in-flight pagination of another chunk");
                    let _ = shared.await;
                }
            }
        }
    }

    fn start(self: &Arc<Self>, slot: &mut Slot, key: SlotKey, chunk_id: ChunkId, limit: u32) -> Shared<PageFuture> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = RequestGuard {
            service: Arc::clone(self),
            key: key.clone(),
            generation,
        };

        let this = Arc::clone(self);
        let request = async move {
            let _guard = guard;
            this.run(&key, generation, chunk_id, limit).await
        };
        let (request, abort) = future::abortable(request);
        let shared = request
            .map(|result| result.unwrap_or(Err(TimelineError::Cancelled)))
            .boxed()
            .shared();

        slot.state = PaginationState::Requesting;
        slot.in_flight = shared.downgrade().map(|future| InFlight {
            generation,
            target: chunk_id,
            future,
            abort,
        });
        shared
    }

    /// Aborts the request in flight for this room and direction. Waiters get
    /// `Cancelled`; nothing it fetched is applied.
    pub fn cancel(&self, room_id: &RoomId, direction: Direction) -> bool {
        let Ok(mut slots) = self.slots.lock() else {
            return false;
        };
        let Some(slot) = slots.get_mut(&(room_id.to_owned(), direction)) else {
            return false;
        };
        match slot.in_flight.take() {
            Some(in_flight) => {
                in_flight.abort.abort();
                slot.state = PaginationState::Idle;
                info!(%room_id, %direction, "Cancelled pagination");
                true
            }
            None => false,
        }
    }

    async fn with_timeout<T>(
        &self,
        request: impl Future<Output = std::result::Result<T, TransportError>>,
    ) -> std::result::Result<T, TransportError> {
        match self.config.pagination_timeout() {
            Some(limit) => tokio::time::timeout(limit, request)
                .await
                .unwrap_or(Err(TransportError::Timeout)),
            None => request.await,
        }
    }

    async fn run(&self, key: &SlotKey, generation: u64, chunk_id: ChunkId, limit: u32) -> Result<PaginationOutcome> {
        let result = self.fetch_and_apply(key, generation, chunk_id, limit).await;
        if let Err(error) = &result {
            warn!(room_id = %key.0, direction = %key.1, %error, "Pagination failed");
            self.transition(key, generation, PaginationState::Failed);
        }
        result
    }

    async fn fetch_and_apply(
        &self,
        key: &SlotKey,
        generation: u64,
        chunk_id: ChunkId,
        limit: u32,
    ) -> Result<PaginationOutcome> {
        let (room_id, direction) = (key.0.as_ref(), key.1);

        let frontier = self
            .timeline
            .read(room_id, |timeline| {
                timeline.chunk(chunk_id).map(|chunk| {
                    let boundary = match direction {
                        Direction::Backward => chunk.first(),
                        Direction::Forward => chunk.last(),
                    };
                    (chunk.is_exhausted(direction), chunk.token(direction).cloned(), boundary.cloned())
                })
            })
            .await?;
        let Some((exhausted, token, boundary)) = frontier else {
            return Err(TimelineError::NotFound(format!("{chunk_id} in {room_id}")));
        };
        if exhausted {
            debug!(%chunk_id, "Frontier exhausted");
            return Ok(PaginationOutcome::ReachedEnd);
        }

        let token = match (token, boundary) {
            (Some(token), _) => Some(token),
            (None, None) if direction == Direction::Forward => return Ok(PaginationOutcome::ReachedEnd),
            (None, None) => None,
            (None, Some(boundary)) => match self.fetch_frontier_token(room_id, chunk_id, direction, &boundary).await? {
                Some(token) => Some(token),
                None => return Ok(PaginationOutcome::ReachedEnd),
            },
        };

        let page = match self
            .with_timeout(self.transport.fetch_page(room_id, token.as_ref(), direction, limit))
            .await
        {
            Ok(page) => page,
            Err(TransportError::UnknownToken) => {
                let token = token.unwrap_or_else(|| Token::new(""));
                self.timeline
                    .mutate(room_id, |timeline| {
                        if timeline.chunk(chunk_id).and_then(|c| c.token(direction)) == Some(&token) {
                            timeline.reset_frontier(chunk_id, direction);
                        }
                    })
                    .await?;
                return Err(TimelineError::GapUnrecoverable {
                    room_id: room_id.to_owned(),
                    chunk_id,
                    direction,
                    token,
                });
            }
            Err(error) => return Err(error.into()),
        };

        self.transition(key, generation, PaginationState::Applying);

        let reached_end = page.end.is_none();
        let mut events = Vec::with_capacity(page.events.len());
        for event in page.events {
            events.push(decrypt_or_mark(&*self.decryptor, event).await);
        }
        if direction == Direction::Backward {
            events.reverse();
        }

        let batch = match direction {
            Direction::Backward => Batch {
                events: Vec::new(),
                prev_token: page.end,
                next_token: Some(page.start),
                is_last_forward: false,
                reached_start: reached_end,
                anchor: Some(Anchor {
                    chunk_id,
                    direction,
                    token: token.clone(),
                }),
            },
            Direction::Forward => Batch {
                events: Vec::new(),
                prev_token: Some(page.start),
                next_token: page.end,
                is_last_forward: reached_end,
                reached_start: false,
                anchor: Some(Anchor {
                    chunk_id,
                    direction,
                    token: token.clone(),
                }),
            },
        };

        let (chunk_id, inserted) = self
            .apply(room_id, events, page.state, batch, DiffOrigin::Pagination(direction))
            .await?;
        info!(%room_id, %direction, %chunk_id, inserted = inserted.len(), reached_end, "✅ Applied page");

        Ok(PaginationOutcome::Applied {
            chunk_id,
            inserted,
            reached_end,
        })
    }

    /// Fetches a token for a frontier that has none, using the context of its
    /// boundary event. `None` means history ends there.
    async fn fetch_frontier_token(
        &self,
        room_id: &RoomId,
        chunk_id: ChunkId,
        direction: Direction,
        boundary: &EventId,
    ) -> Result<Option<Token>> {
        debug!(%chunk_id, %boundary, "Fetching a token for a token-less frontier");
        let context = self
            .with_timeout(self.transport.fetch_context(room_id, boundary, 0))
            .await?;
        let token = match direction {
            Direction::Backward => context.start,
            Direction::Forward => context.end,
        };

        self.timeline
            .mutate(room_id, |timeline| {
                let Some(chunk) = timeline.chunk_mut(chunk_id) else {
                    return;
                };
                if chunk.token(direction).is_some() {
                    return;
                }
                match (&token, direction) {
                    (Some(token), _) => chunk.set_token(direction, Some(token.clone())),
                    (None, Direction::Backward) => chunk.is_last_backward = true,
                    // Only the live chunk may claim the head of the room.
                    (None, Direction::Forward) => {}
                }
            })
            .await?;

        Ok(token)
    }

    /// Shows the history around `event_id`. An event already in the graph
    /// is returned as is; otherwise its context is fetched into a chunk of
    /// its own, merged with whatever it touches.
    #[tracing::instrument(skip(self))]
    pub async fn get_context_of_event(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        limit: Option<u32>,
    ) -> Result<PaginationOutcome> {
        let known = self
            .timeline
            .read(room_id, |timeline| timeline.chunk_of(event_id))
            .await?;
        if let Some(chunk_id) = known {
            debug!(%chunk_id, "Event already in the timeline");
            return Ok(PaginationOutcome::Applied {
                chunk_id,
                inserted: Vec::new(),
                reached_end: false,
            });
        }

        let limit = self.config.bounded_page_limit(limit);
        let context = self
            .with_timeout(self.transport.fetch_context(room_id, event_id, limit))
            .await?;

        let mut events = Vec::with_capacity(context.events_before.len() + context.events_after.len() + 1);
        for event in context
            .events_before
            .into_iter()
            .rev()
            .chain(std::iter::once(context.event))
            .chain(context.events_after)
        {
            events.push(decrypt_or_mark(&*self.decryptor, event).await);
        }

        let batch = Batch {
            events: Vec::new(),
            prev_token: context.start,
            next_token: context.end,
            is_last_forward: false,
            reached_start: false,
            anchor: None,
        };
        let (chunk_id, inserted) = self
            .apply(room_id, events, context.state, batch, DiffOrigin::Context)
            .await?;

        Ok(PaginationOutcome::Applied {
            chunk_id,
            inserted,
            reached_end: false,
        })
    }

    /// Stores fetched events, merges them into the graph and publishes the
    /// resulting diff. `events` are in server order.
    async fn apply(
        &self,
        room_id: &RoomId,
        events: Vec<Event>,
        state_events: Vec<Event>,
        mut batch: Batch,
        origin: DiffOrigin,
    ) -> Result<(ChunkId, Vec<OwnedEventId>)> {
        let mut diff = TimelineDiff::new(room_id.to_owned(), origin);
        let mut changed = Vec::new();

        let mut counts = Vec::with_capacity(state_events.len() + events.len());
        for event in state_events.iter().chain(events.iter().rev()) {
            if let PutOutcome::Updated { .. } = self.event_store.ingest(event)? {
                changed.push(event.event_id.clone());
            }
            counts.push((event, self.timeline.ensure_count(&event.event_id, true)?));
        }

        batch.events = events.iter().map(|event| event.event_id.clone()).collect();
        let anchor_chunk = batch.anchor.as_ref().map(|anchor| anchor.chunk_id);
        let resolver = gap_resolver::Service;
        let outcome = self
            .timeline
            .mutate(room_id, |timeline| resolver.resolve(timeline, batch))
            .await?;
        let chunk_id = outcome
            .chunk_id
            .or(anchor_chunk)
            .ok_or_else(|| TimelineError::InvalidState("page placed no chunk".to_owned()))?;

        let accepted: HashSet<&OwnedEventId> = outcome.accepted.iter().collect();
        let mut updated = HashMap::new();
        self.timeline
            .read(room_id, |timeline| -> Result<()> {
                for (event, count) in &counts {
                    if let Some(change) = self.state.apply(timeline, event, *count)? {
                        diff.state_changes.push(change);
                    }
                }
                for event in events.iter().filter(|event| accepted.contains(&event.event_id)) {
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

        self.diffs.emit(&diff);
        Ok((chunk_id, outcome.accepted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        database::KeyValueDatabase,
        service::{rooms::local_echo, transaction_ids},
        transport::ReplayTransport,
    };
    use matrixon_timeline_core::{NoopDecryptor, PageResponse};
    use ruma::{events::TimelineEventType, room_id, uint, user_id, MilliSecondsSinceUnixEpoch};
    use serde_json::json;
    use std::time::Duration;
    use test_log::test;

    fn event(n: u32) -> Event {
        Event::new(
            EventId::parse(format!("$e{n}")).unwrap(),
            room_id!("!room:example.org").to_owned(),
            TimelineEventType::RoomMessage,
            user_id!("@alice:example.org").to_owned(),
            MilliSecondsSinceUnixEpoch(uint!(1)),
            json!({ "msgtype": "m.text", "body": format!("message {n}") }),
        )
    }

    /// Backward page: newest first.
    fn page(start: &str, end: Option<&str>, range: std::ops::Range<u32>) -> PageResponse {
        PageResponse {
            start: Token::new(start),
            end: end.map(Token::new),
            events: range.rev().map(event).collect(),
            state: Vec::new(),
        }
    }

    fn service(transport: Arc<ReplayTransport>, timeout: Option<u64>) -> Arc<Service> {
        let db = Arc::new(KeyValueDatabase::in_memory().unwrap());
        let mut config = TimelineConfig::new(user_id!("@me:example.org").to_owned());
        config.pagination_timeout_ms = timeout;

        let event_store = Arc::new(event_store::Service::build(db.clone(), 64));
        let timeline = Arc::new(timeline::Service::build(db.clone()));
        let state = Arc::new(state::Service::build(db.clone(), transport.clone()));
        let diffs = Arc::new(DiffBus::new(64));
        let local_echo = Arc::new(local_echo::Service::build(
            config.user_id.clone(),
            transport.clone(),
            Arc::new(transaction_ids::Service { db: db.clone() }),
            event_store.clone(),
            timeline.clone(),
            diffs.clone(),
        ));
        let relations = Arc::new(relations::Service::build(
            db,
            config.user_id.clone(),
            event_store.clone(),
            timeline.clone(),
            local_echo,
            transport.clone(),
        ));

        Arc::new(Service::build(
            config,
            transport,
            Arc::new(NoopDecryptor),
            event_store,
            timeline,
            state,
            relations,
            diffs,
        ))
    }

    fn room() -> &'static RoomId {
        room_id!("!room:example.org")
    }

    #[test(tokio::test)]
    async fn test_two_backward_pages_make_one_chunk() {
        let transport = Arc::new(
            ReplayTransport::new()
                .with_page(room(), None, Direction::Backward, Ok(page("t0", Some("t1"), 20..40)))
                .with_page(room(), Some("t1"), Direction::Backward, Ok(page("t1", Some("t2"), 0..20))),
        );
        let pagination = service(transport.clone(), None);

        let first = pagination.request_page(room(), Direction::Backward, Some(20)).await.unwrap();
        let second = pagination.request_page(room(), Direction::Backward, Some(20)).await.unwrap();

        let PaginationOutcome::Applied { chunk_id, inserted, .. } = second else {
            panic!("expected a page");
        };
        assert!(matches!(first, PaginationOutcome::Applied { chunk_id: c, .. } if c == chunk_id));
        assert_eq!(inserted.len(), 20);

        let (chunks, len, prev) = pagination
            .timeline
            .read(room(), |t| {
                let chunk = t.chunk(chunk_id).unwrap();
                (t.chunks().len(), chunk.len(), chunk.prev_token.clone())
            })
            .await
            .unwrap();
        assert_eq!(chunks, 1);
        assert_eq!(len, 40);
        assert_eq!(prev, Some(Token::new("t2")));
        assert_eq!(pagination.state(room(), Direction::Backward), PaginationState::Idle);
    }

    #[test(tokio::test)]
    async fn test_reaching_room_start_stops_requests() {
        let transport = Arc::new(
            ReplayTransport::new().with_page(room(), None, Direction::Backward, Ok(page("t0", None, 0..3))),
        );
        let pagination = service(transport.clone(), None);

        let outcome = pagination.request_page(room(), Direction::Backward, None).await.unwrap();
        assert!(matches!(outcome, PaginationOutcome::Applied { reached_end: true, .. }));

        let again = pagination.request_page(room(), Direction::Backward, None).await.unwrap();
        assert_eq!(again, PaginationOutcome::ReachedEnd);
        assert_eq!(transport.page_calls(), 1);
    }

    #[test(tokio::test)]
    async fn test_concurrent_requests_share_one_fetch() {
        let transport = Arc::new(
            ReplayTransport::new()
                .with_page(room(), None, Direction::Backward, Ok(page("t0", Some("t1"), 0..5)))
                .with_page_latency(Duration::from_millis(50)),
        );
        let pagination = service(transport.clone(), None);

        let (a, b) = tokio::join!(
            pagination.request_page(room(), Direction::Backward, None),
            pagination.request_page(room(), Direction::Backward, None),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(transport.page_calls(), 1);
    }

    #[test(tokio::test)]
    async fn test_timeout_fails_then_allows_fresh_request() {
        let transport = Arc::new(
            ReplayTransport::new()
                .with_page(room(), None, Direction::Backward, Ok(page("t0", Some("t1"), 0..5)))
                .with_page_latency(Duration::from_millis(300)),
        );
        let pagination = service(transport.clone(), Some(50));

        let error = pagination.request_page(room(), Direction::Backward, None).await.unwrap_err();
        assert!(matches!(error, TimelineError::Transport(TransportError::Timeout)));
        assert!(error.is_retryable());
        assert_eq!(pagination.state(room(), Direction::Backward), PaginationState::Idle);

        transport.set_page_latency(Duration::ZERO);
        let outcome = pagination.request_page(room(), Direction::Backward, None).await.unwrap();
        assert!(matches!(outcome, PaginationOutcome::Applied { .. }));
        assert_eq!(transport.page_calls(), 2);
    }

    #[test(tokio::test)]
    async fn test_cancel_returns_to_idle_without_applying() {
        let transport = Arc::new(
            ReplayTransport::new()
                .with_page(room(), None, Direction::Backward, Ok(page("t0", Some("t1"), 0..5)))
                .with_page_latency(Duration::from_millis(200)),
        );
        let pagination = service(transport.clone(), None);

        let request = {
            let pagination = Arc::clone(&pagination);
            tokio::spawn(async move { pagination.request_page(room(), Direction::Backward, None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pagination.state(room(), Direction::Backward), PaginationState::Requesting);

        assert!(pagination.cancel(room(), Direction::Backward));
        let result = request.await.unwrap();
        assert!(matches!(result, Err(TimelineError::Cancelled)));
        assert_eq!(pagination.state(room(), Direction::Backward), PaginationState::Idle);

        let events = pagination.timeline.read(room(), |t| t.event_count()).await.unwrap();
        assert_eq!(events, 0);
    }

    #[test(tokio::test)]
    async fn test_unknown_token_resets_only_that_frontier() {
        let transport = Arc::new(
            ReplayTransport::new()
                .with_page(room(), None, Direction::Backward, Ok(page("t0", Some("t1"), 5..10)))
                .with_page(room(), Some("t1"), Direction::Backward, Err(TransportError::UnknownToken)),
        );
        let pagination = service(transport.clone(), None);
        pagination.request_page(room(), Direction::Backward, None).await.unwrap();

        let error = pagination.request_page(room(), Direction::Backward, None).await.unwrap_err();
        assert!(matches!(error, TimelineError::GapUnrecoverable { ref token, .. } if token.as_str() == "t1"));

        let prev = pagination
            .timeline
            .read(room(), |t| t.live_chunk().map(|c| (c.prev_token.clone(), c.len())))
            .await
            .unwrap();
        assert_eq!(prev, Some((None, 5)));
    }

    #[test(tokio::test)]
    async fn test_tokenless_frontier_fetches_token_first() {
        let transport = Arc::new(
            ReplayTransport::new()
                .with_context(
                    room(),
                    &EventId::parse("$e10").unwrap(),
                    Ok(matrixon_timeline_core::ContextResponse {
                        event: event(10),
                        events_before: Vec::new(),
                        events_after: Vec::new(),
                        start: Some(Token::new("ctx_start")),
                        end: Some(Token::new("ctx_end")),
                        state: Vec::new(),
                    }),
                )
                .with_page(room(), Some("ctx_start"), Direction::Backward, Ok(page("ctx_start", Some("older"), 5..10))),
        );
        let pagination = service(transport.clone(), None);

        // A live chunk known from sync without a backward token.
        pagination.event_store.put(&event(10)).unwrap();
        pagination
            .timeline
            .mutate(room(), |t| {
                gap_resolver::Service.resolve(
                    t,
                    Batch {
                        events: vec![EventId::parse("$e10").unwrap()],
                        is_last_forward: true,
                        ..Default::default()
                    },
                )
            })
            .await
            .unwrap();

        let outcome = pagination.request_page(room(), Direction::Backward, None).await.unwrap();
        assert!(matches!(outcome, PaginationOutcome::Applied { ref inserted, .. } if inserted.len() == 5));
        assert_eq!(transport.context_calls(), 1);
        let len = pagination.timeline.read(room(), |t| t.live_chunk().map(|c| c.len())).await.unwrap();
        assert_eq!(len, Some(6));
    }

    #[test(tokio::test)]
    async fn test_context_of_unknown_event_creates_disconnected_chunk() {
        let target = EventId::parse("$e50").unwrap();
        let transport = Arc::new(ReplayTransport::new().with_context(
            room(),
            &target,
            Ok(matrixon_timeline_core::ContextResponse {
                event: event(50),
                events_before: vec![event(49), event(48)],
                events_after: vec![event(51)],
                start: Some(Token::new("s")),
                end: Some(Token::new("e")),
                state: Vec::new(),
            }),
        ));
        let pagination = service(transport.clone(), None);
        let mut diffs = pagination.diffs.subscribe();

        let outcome = pagination.get_context_of_event(room(), &target, Some(10)).await.unwrap();
        let PaginationOutcome::Applied { chunk_id, inserted, .. } = outcome else {
            panic!("expected a chunk");
        };
        let names: Vec<_> = inserted.iter().map(|id| id.as_str().to_owned()).collect();
        assert_eq!(names, vec!["$e48", "$e49", "$e50", "$e51"]);
        assert_eq!(diffs.try_recv().unwrap().origin, DiffOrigin::Context);

        // Known events are answered locally.
        let again = pagination.get_context_of_event(room(), &target, None).await.unwrap();
        assert!(matches!(again, PaginationOutcome::Applied { chunk_id: c, ref inserted, .. } if c == chunk_id && inserted.is_empty()));
        assert_eq!(transport.context_calls(), 1);
    }
}
