use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    path::Path,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use matrixon_timeline_core::{
    ContextResponse, Direction, PageResponse, SyncResponse, TagInfo, TimelineError, Token,
    Transport, TransportError,
};
use ruma::{
    events::TimelineEventType, EventId, OwnedEventId, OwnedRoomId, OwnedTransactionId, RoomId,
    TransactionId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::Result;

/// Scripted server responses, loadable from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayScript {
    /// Sync deltas, handed out one per `fetch_sync_delta`.
    #[serde(default)]
    pub syncs: Vec<SyncResponse>,
    #[serde(default)]
    pub pages: Vec<ScriptedPage>,
    #[serde(default)]
    pub contexts: Vec<ScriptedContext>,
    #[serde(default)]
    pub page_latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedPage {
    pub room_id: OwnedRoomId,
    #[serde(default)]
    pub from: Option<Token>,
    pub direction: Direction,
    pub response: std::result::Result<PageResponse, TransportError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedContext {
    pub room_id: OwnedRoomId,
    pub event_id: OwnedEventId,
    pub response: std::result::Result<ContextResponse, TransportError>,
}

/// An event accepted by `submit_event`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedEvent {
    pub room_id: OwnedRoomId,
    pub kind: TimelineEventType,
    pub content: Value,
    pub transaction_id: OwnedTransactionId,
    pub event_id: OwnedEventId,
}

type PageKey = (OwnedRoomId, Option<Token>, Direction);

#[derive(Default)]
struct Inner {
    syncs: VecDeque<SyncResponse>,
    sync_tokens: Vec<Option<Token>>,

    pages: HashMap<PageKey, std::result::Result<PageResponse, TransportError>>,
    contexts: HashMap<(OwnedRoomId, OwnedEventId), std::result::Result<ContextResponse, TransportError>>,
    page_latency: Duration,
    page_calls: usize,
    context_calls: usize,

    submit_failures: VecDeque<TransportError>,
    submitted: Vec<SubmittedEvent>,
    txnid_eventid: HashMap<(OwnedRoomId, OwnedTransactionId), OwnedEventId>,
    redactions: Vec<(OwnedRoomId, OwnedEventId)>,
    state_events: usize,
    read_marker_calls: usize,
    typing_calls: usize,
    tags: BTreeMap<(OwnedRoomId, String), TagInfo>,
}

/// In-process `Transport` that answers from a script and records what the
/// engine sent. Unscripted pages from the newest event are empty and end
/// history; unscripted tokens are unknown.
#[derive(Default)]
pub struct ReplayTransport {
    inner: Mutex<Inner>,
}

impl ReplayTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_script(script: ReplayScript) -> Self {
        let mut transport = Self::new().with_page_latency(Duration::from_millis(script.page_latency_ms));
        for sync in script.syncs {
            transport.push_sync(sync);
        }
        for page in script.pages {
            transport = transport.with_page(
                &page.room_id,
                page.from.as_ref().map(Token::as_str),
                page.direction,
                page.response,
            );
        }
        for context in script.contexts {
            transport = transport.with_context(&context.room_id, &context.event_id, context.response);
        }
        transport
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TimelineError::Config(format!("cannot read {}: {e}", path.display())))?;
        let script: ReplayScript = serde_json::from_str(&raw)?;
        info!(
            path = %path.display(),
            syncs = script.syncs.len(),
            pages = script.pages.len(),
            contexts = script.contexts.len(),
            "✅ Loaded replay script"
        );
        Ok(Self::from_script(script))
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_page(
        self,
        room_id: &RoomId,
        from: Option<&str>,
        direction: Direction,
        response: std::result::Result<PageResponse, TransportError>,
    ) -> Self {
        self.inner()
            .pages
            .insert((room_id.to_owned(), from.map(Token::new), direction), response);
        self
    }

    pub fn with_context(
        self,
        room_id: &RoomId,
        event_id: &EventId,
        response: std::result::Result<ContextResponse, TransportError>,
    ) -> Self {
        self.inner()
            .contexts
            .insert((room_id.to_owned(), event_id.to_owned()), response);
        self
    }

    pub fn with_page_latency(self, latency: Duration) -> Self {
        self.set_page_latency(latency);
        self
    }

    pub fn set_page_latency(&self, latency: Duration) {
        self.inner().page_latency = latency;
    }

    pub fn push_sync(&self, response: SyncResponse) {
        self.inner().syncs.push_back(response);
    }

    pub fn pending_syncs(&self) -> usize {
        self.inner().syncs.len()
    }

    /// The next `submit_event` fails with `error`.
    pub fn fail_next_submit(&self, error: TransportError) {
        self.inner().submit_failures.push_back(error);
    }

    /// `since` of every sync request, in order.
    pub fn sync_tokens(&self) -> Vec<Option<Token>> {
        self.inner().sync_tokens.clone()
    }

    pub fn page_calls(&self) -> usize {
        self.inner().page_calls
    }

    pub fn context_calls(&self) -> usize {
        self.inner().context_calls
    }

    pub fn submitted(&self) -> Vec<SubmittedEvent> {
        self.inner().submitted.clone()
    }

    pub fn redactions(&self) -> Vec<(OwnedRoomId, OwnedEventId)> {
        self.inner().redactions.clone()
    }

    pub fn read_marker_calls(&self) -> usize {
        self.inner().read_marker_calls
    }

    pub fn typing_calls(&self) -> usize {
        self.inner().typing_calls
    }

    pub fn tags(&self, room_id: &RoomId) -> BTreeMap<String, TagInfo> {
        self.inner()
            .tags
            .iter()
            .filter(|((room, _), _)| room.as_str() == room_id.as_str())
            .map(|((_, tag), info)| (tag.clone(), info.clone()))
            .collect()
    }
}

fn server_event_id(raw: String) -> std::result::Result<OwnedEventId, TransportError> {
    EventId::parse(raw).map_err(|e| TransportError::network(format!("invalid replay event id: {e}")))
}

#[async_trait]
impl Transport for ReplayTransport {
    async fn fetch_sync_delta(&self, since: Option<&Token>) -> std::result::Result<SyncResponse, TransportError> {
        let mut inner = self.inner();
        inner.sync_tokens.push(since.cloned());
        match inner.syncs.pop_front() {
            Some(response) => Ok(response),
            None => {
                debug!("Replay script has no more sync deltas");
                Ok(SyncResponse {
                    next_batch: since.cloned().unwrap_or_else(|| Token::new("replay_0")),
                    rooms: BTreeMap::new(),
                })
            }
        }
    }

    async fn fetch_page(
        &self,
        room_id: &RoomId,
        from: Option<&Token>,
        direction: Direction,
        limit: u32,
    ) -> std::result::Result<PageResponse, TransportError> {
        let (latency, response) = {
            let mut inner = self.inner();
            inner.page_calls += 1;
            let key = (room_id.to_owned(), from.cloned(), direction);
            (inner.page_latency, inner.pages.get(&key).cloned())
        };
        debug!(%room_id, ?from, %direction, limit, "Replaying page");

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match (response, from) {
            (Some(response), _) => response,
            (None, None) => Ok(PageResponse {
                start: Token::new("replay_start"),
                end: None,
                events: Vec::new(),
                state: Vec::new(),
            }),
            (None, Some(_)) => Err(TransportError::UnknownToken),
        }
    }

    async fn fetch_context(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        limit: u32,
    ) -> std::result::Result<ContextResponse, TransportError> {
        let response = {
            let mut inner = self.inner();
            inner.context_calls += 1;
            inner.contexts.get(&(room_id.to_owned(), event_id.to_owned())).cloned()
        };
        debug!(%room_id, %event_id, limit, "Replaying context");

        response.unwrap_or_else(|| {
            Err(TransportError::Http {
                status: 404,
                message: format!("{event_id} not found"),
            })
        })
    }

    async fn submit_event(
        &self,
        room_id: &RoomId,
        kind: &TimelineEventType,
        content: &Value,
        txn_id: &TransactionId,
    ) -> std::result::Result<OwnedEventId, TransportError> {
        let mut inner = self.inner();
        if let Some(error) = inner.submit_failures.pop_front() {
            return Err(error);
        }

        let key = (room_id.to_owned(), txn_id.to_owned());
        if let Some(event_id) = inner.txnid_eventid.get(&key) {
            return Err(TransportError::Duplicate {
                event_id: event_id.clone(),
            });
        }

        let event_id = server_event_id(format!("${txn_id}"))?;
        inner.txnid_eventid.insert(key, event_id.clone());
        inner.submitted.push(SubmittedEvent {
            room_id: room_id.to_owned(),
            kind: kind.clone(),
            content: content.clone(),
            transaction_id: txn_id.to_owned(),
            event_id: event_id.clone(),
        });
        Ok(event_id)
    }

    async fn redact_event(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        txn_id: &TransactionId,
    ) -> std::result::Result<OwnedEventId, TransportError> {
        let mut inner = self.inner();
        inner.redactions.push((room_id.to_owned(), event_id.to_owned()));
        server_event_id(format!("$redaction_{txn_id}"))
    }

    async fn send_state(
        &self,
        room_id: &RoomId,
        kind: &TimelineEventType,
        state_key: &str,
        _content: &Value,
    ) -> std::result::Result<OwnedEventId, TransportError> {
        let mut inner = self.inner();
        inner.state_events += 1;
        debug!(%room_id, %kind, state_key, "Replaying state event");
        server_event_id(format!("$state_{}", inner.state_events))
    }

    async fn set_read_markers(
        &self,
        _room_id: &RoomId,
        _fully_read: Option<&EventId>,
        _read_receipt: Option<&EventId>,
    ) -> std::result::Result<(), TransportError> {
        self.inner().read_marker_calls += 1;
        Ok(())
    }

    async fn send_typing(
        &self,
        _room_id: &RoomId,
        _typing: bool,
        _timeout: Duration,
    ) -> std::result::Result<(), TransportError> {
        self.inner().typing_calls += 1;
        Ok(())
    }

    async fn add_tag(&self, room_id: &RoomId, tag: &str, info: &TagInfo) -> std::result::Result<(), TransportError> {
        self.inner()
            .tags
            .insert((room_id.to_owned(), tag.to_owned()), info.clone());
        Ok(())
    }

    async fn delete_tag(&self, room_id: &RoomId, tag: &str) -> std::result::Result<(), TransportError> {
        self.inner().tags.remove(&(room_id.to_owned(), tag.to_owned()));
        Ok(())
    }
}
