// =============================================================================
// Matrixon Timeline - Local Echo Module
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
//   Optimistic placeholders for outgoing events. A placeholder is shown at
//   the end of the live timeline the moment it is created, follows its
//   submission through the transport and is superseded in place by the
//   server event once sync delivers it.
//
// =============================================================================

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use matrixon_timeline_core::{
    utils::{generate_transaction_id, local_event_id},
    DiffOrigin, Event, LocalDraft, SendState, Superseded, TimelineDiff, TimelineError, Transport,
    TransportError,
};
use ruma::{
    MilliSecondsSinceUnixEpoch, OwnedEventId, OwnedRoomId, OwnedTransactionId, OwnedUserId,
    RoomId, TransactionId,
};
use tracing::{debug, info, warn};

use super::{
    event_store,
    timeline::{self, DiffBus},
};
use crate::{service::transaction_ids, Result};

/// An outgoing event as tracked until the server confirms it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEcho {
    pub transaction_id: OwnedTransactionId,
    pub room_id: OwnedRoomId,
    pub placeholder: Event,
    /// Newest live event when the echo was created; the echo is shown right
    /// after it. `None` puts the echo at the head of the live view.
    pub anchor: Option<OwnedEventId>,
    pub state: SendState,
    pub confirmed: Option<Event>,
}

/// One row of the live view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineItem {
    pub event: Event,
    /// Set for local echoes, including confirmed ones.
    pub send_state: Option<SendState>,
    pub transaction_id: Option<OwnedTransactionId>,
}

pub struct Service {
    user_id: OwnedUserId,
    transport: Arc<dyn Transport>,
    transaction_ids: Arc<transaction_ids::Service>,
    event_store: Arc<event_store::Service>,
    timeline: Arc<timeline::Service>,
    diffs: Arc<DiffBus>,

    echoes: Mutex<BTreeMap<OwnedRoomId, Vec<LocalEcho>>>,
}

impl Service {
    pub fn build(
        user_id: OwnedUserId,
        transport: Arc<dyn Transport>,
        transaction_ids: Arc<transaction_ids::Service>,
        event_store: Arc<event_store::Service>,
        timeline: Arc<timeline::Service>,
        diffs: Arc<DiffBus>,
    ) -> Self {
        Self {
            user_id,
            transport,
            transaction_ids,
            event_store,
            timeline,
            diffs,
            echoes: Mutex::new(BTreeMap::new()),
        }
    }

    fn echoes(&self) -> Result<MutexGuard<'_, BTreeMap<OwnedRoomId, Vec<LocalEcho>>>> {
        self.echoes
            .lock()
            .map_err(|_| TimelineError::InvalidState("local echo map poisoned".to_owned()))
    }

    fn with_echo<T>(
        &self,
        room_id: &RoomId,
        txn_id: &TransactionId,
        f: impl FnOnce(&mut LocalEcho) -> T,
    ) -> Result<T> {
        let mut echoes = self.echoes()?;
        echoes
            .get_mut(room_id)
            .and_then(|room| room.iter_mut().find(|echo| echo.transaction_id == txn_id))
            .map(f)
            .ok_or_else(|| TimelineError::NotFound(format!("local echo {txn_id} in {room_id}")))
    }

    pub fn echo(&self, room_id: &RoomId, txn_id: &TransactionId) -> Result<LocalEcho> {
        self.with_echo(room_id, txn_id, |echo| echo.clone())
    }

    pub fn echoes_in(&self, room_id: &RoomId) -> Result<Vec<LocalEcho>> {
        Ok(self.echoes()?.get(room_id).cloned().unwrap_or_default())
    }

    fn emit(&self, room_id: &RoomId, f: impl FnOnce(&mut TimelineDiff)) {
        let mut diff = TimelineDiff::new(room_id.to_owned(), DiffOrigin::LocalEcho);
        f(&mut diff);
        self.diffs.emit(&diff);
    }

    /// Creates a pending echo for `draft` and shows it at the end of the live
    /// view. Nothing is sent yet; see `submit`.
    #[tracing::instrument(skip(self, draft), fields(kind = %draft.kind))]
    pub async fn send_local(&self, room_id: &RoomId, draft: LocalDraft) -> Result<OwnedTransactionId> {
        let transaction_id = generate_transaction_id();
        let placeholder = Event::new(
            local_event_id(&transaction_id)?,
            room_id.to_owned(),
            draft.kind,
            self.user_id.clone(),
            MilliSecondsSinceUnixEpoch::now(),
            draft.content,
        )
        .with_transaction_id(transaction_id.clone());

        let anchor = self
            .timeline
            .read(room_id, |timeline| timeline.live_chunk().and_then(|chunk| chunk.last().cloned()))
            .await?;

        self.echoes()?
            .entry(room_id.to_owned())
            .or_default()
            .push(LocalEcho {
                transaction_id: transaction_id.clone(),
                room_id: room_id.to_owned(),
                placeholder: placeholder.clone(),
                anchor,
                state: SendState::Pending,
                confirmed: None,
            });
        debug!(%transaction_id, "Created local echo");

        self.emit(room_id, |diff| diff.inserted.push(placeholder));
        Ok(transaction_id)
    }

    /// Submits a pending echo under its idempotency key.
    #[tracing::instrument(skip(self))]
    pub async fn submit(&self, room_id: &RoomId, txn_id: &TransactionId) -> Result<OwnedEventId> {
        let echo = match self.echo(room_id, txn_id) {
            Ok(echo) => echo,
            // Retired after sync confirmed it; the ledger still knows the answer.
            Err(TimelineError::NotFound(what)) => {
                return self
                    .transaction_ids
                    .existing_txnid(room_id, txn_id)?
                    .ok_or(TimelineError::NotFound(what));
            }
            Err(error) => return Err(error),
        };
        if let SendState::ServerConfirmed { event_id } = &echo.state {
            return Ok(event_id.clone());
        }

        if let Some(event_id) = self.transaction_ids.existing_txnid(room_id, txn_id)? {
            debug!(%event_id, "Transaction already acknowledged");
            self.acknowledge(room_id, txn_id, event_id.clone())?;
            return Ok(event_id);
        }

        let result = self
            .transport
            .submit_event(room_id, &echo.placeholder.kind, &echo.placeholder.content, txn_id)
            .await;

        let event_id = match result {
            Ok(event_id) => event_id,
            Err(TransportError::Duplicate { event_id }) => {
                info!(%event_id, "Server already had this transaction");
                event_id
            }
            Err(error) => {
                warn!(%error, "Local echo failed to send");
                let placeholder = self.with_echo(room_id, txn_id, |echo| {
                    if !echo.state.is_confirmed() {
                        echo.state = SendState::Failed {
                            reason: error.to_string(),
                        };
                    }
                    echo.placeholder.clone()
                })?;
                self.emit(room_id, |diff| diff.updated.push(placeholder));
                return Err(error.into());
            }
        };

        self.transaction_ids.add_txnid(room_id, txn_id, &event_id)?;
        self.acknowledge(room_id, txn_id, event_id.clone())?;
        Ok(event_id)
    }

    fn acknowledge(&self, room_id: &RoomId, txn_id: &TransactionId, event_id: OwnedEventId) -> Result<()> {
        let placeholder = match self.with_echo(room_id, txn_id, |echo| {
            // Sync may have confirmed the echo before the send returned.
            if echo.state.is_confirmed() {
                return None;
            }
            echo.state = SendState::SentAwaitingSync { event_id };
            Some(echo.placeholder.clone())
        }) {
            Ok(placeholder) => placeholder,
            Err(TimelineError::NotFound(_)) => {
                debug!(%txn_id, "Echo already confirmed and retired");
                None
            }
            Err(error) => return Err(error),
        };

        if let Some(placeholder) = placeholder {
            self.emit(room_id, |diff| diff.updated.push(placeholder));
        }
        Ok(())
    }

    /// Sends a failed echo again.
    pub async fn retry(&self, room_id: &RoomId, txn_id: &TransactionId) -> Result<OwnedEventId> {
        let placeholder = self.with_echo(room_id, txn_id, |echo| {
            if !echo.state.is_failed() {
                return Err(TimelineError::InvalidState(format!(
                    "local echo {txn_id} has not failed"
                )));
            }
            echo.state = SendState::Pending;
            Ok(echo.placeholder.clone())
        })??;
        self.emit(room_id, |diff| diff.updated.push(placeholder));

        self.submit(room_id, txn_id).await
    }

    /// Drops an echo that was never confirmed.
    pub fn discard(&self, room_id: &RoomId, txn_id: &TransactionId) -> Result<()> {
        let placeholder_id = {
            let mut echoes = self.echoes()?;
            let room = echoes
                .get_mut(room_id)
                .ok_or_else(|| TimelineError::NotFound(format!("local echo {txn_id} in {room_id}")))?;
            let position = room
                .iter()
                .position(|echo| echo.transaction_id == txn_id)
                .ok_or_else(|| TimelineError::NotFound(format!("local echo {txn_id} in {room_id}")))?;
            if room[position].state.is_confirmed() {
                return Err(TimelineError::InvalidState(format!(
                    "local echo {txn_id} is already confirmed"
                )));
            }
            room.remove(position).placeholder.event_id
        };

        self.emit(room_id, |diff| diff.removed.push(placeholder_id));
        Ok(())
    }

    /// Retires echoes confirmed by the events of a sync diff. Matching events
    /// move from `inserted` to `superseded`: they take the echo's slot
    /// instead of being appended again.
    pub fn reconcile(&self, diff: &mut TimelineDiff) -> Result<()> {
        let mut echoes = self.echoes()?;
        let Some(room) = echoes.get_mut(&diff.room_id) else {
            return Ok(());
        };

        let inserted = std::mem::take(&mut diff.inserted);
        for event in inserted {
            let matching = room.iter_mut().find(|echo| {
                !echo.state.is_confirmed()
                    && (event.transaction_id() == Some(&echo.transaction_id)
                        || matches!(&echo.state, SendState::SentAwaitingSync { event_id } if *event_id == event.event_id))
            });

            match matching {
                Some(echo) => {
                    info!(transaction_id = %echo.transaction_id, event_id = %event.event_id, "✅ Local echo confirmed");
                    echo.state = SendState::ServerConfirmed {
                        event_id: event.event_id.clone(),
                    };
                    echo.confirmed = Some(event.clone());
                    diff.superseded.push(Superseded {
                        transaction_id: echo.transaction_id.clone(),
                        placeholder_id: echo.placeholder.event_id.clone(),
                        event,
                    });
                }
                None => diff.inserted.push(event),
            }
        }

        Ok(())
    }

    /// Forgets confirmed echoes whose server event no longer needs a slot of
    /// its own: it already sits where the echo is shown, or the echo's
    /// anchor has left the live chunk. Echoes still waiting in the same slot
    /// move their anchor past the retired ones. Returns how many were retired.
    pub async fn retire_settled(&self, room_id: &RoomId) -> Result<usize> {
        let positions: HashMap<OwnedEventId, usize> = self
            .timeline
            .read(room_id, |timeline| {
                timeline
                    .live_chunk()
                    .map(|chunk| chunk.events().cloned().enumerate().map(|(i, id)| (id, i)).collect())
                    .unwrap_or_default()
            })
            .await?;

        let mut echoes = self.echoes()?;
        let Some(room) = echoes.get_mut(room_id) else {
            return Ok(0);
        };

        let mut anchors: Vec<Option<OwnedEventId>> = Vec::new();
        for echo in room.iter() {
            if !anchors.contains(&echo.anchor) {
                anchors.push(echo.anchor.clone());
            }
        }

        let mut retired = HashSet::new();
        for anchor in anchors {
            let slot: Vec<usize> = room
                .iter()
                .enumerate()
                .filter(|(_, echo)| echo.anchor == anchor)
                .map(|(i, _)| i)
                .collect();

            let next = match &anchor {
                None => Some(0),
                Some(anchor) => positions.get(anchor).map(|position| position + 1),
            };
            let Some(mut next) = next else {
                retired.extend(slot.into_iter().filter(|i| room[*i].confirmed.is_some()));
                continue;
            };

            let mut settled = 0;
            let mut last = None;
            for &i in &slot {
                let position = room[i]
                    .confirmed
                    .as_ref()
                    .and_then(|event| positions.get(&event.event_id));
                if position != Some(&next) {
                    break;
                }
                retired.insert(i);
                last = room[i].confirmed.as_ref().map(|event| event.event_id.clone());
                next += 1;
                settled += 1;
            }
            if let Some(last) = last {
                for &i in &slot[settled..] {
                    room[i].anchor = Some(last.clone());
                }
            }
        }

        let mut index = 0;
        room.retain(|_| {
            let keep = !retired.contains(&index);
            index += 1;
            keep
        });
        if room.is_empty() {
            echoes.remove(room_id);
        }

        if !retired.is_empty() {
            debug!(%room_id, retired = retired.len(), "Retired settled local echoes");
        }
        Ok(retired.len())
    }

    /// The live chunk as shown to the user: remote events in server order
    /// with echoes at the slot they were created in.
    pub async fn live_view(&self, room_id: &RoomId) -> Result<Vec<TimelineItem>> {
        let live_events = self
            .timeline
            .read(room_id, |timeline| {
                timeline
                    .live_chunk()
                    .map(|chunk| chunk.events().cloned().collect::<Vec<_>>())
                    .unwrap_or_default()
            })
            .await?;
        let echoes = self.echoes_in(room_id)?;

        let in_live: HashSet<&OwnedEventId> = live_events.iter().collect();
        let mut at_head = Vec::new();
        let mut at_tail = Vec::new();
        let mut after: HashMap<&OwnedEventId, Vec<&LocalEcho>> = HashMap::new();
        let mut slotted = HashSet::new();

        for echo in &echoes {
            match &echo.anchor {
                None => at_head.push(echo),
                Some(anchor) if in_live.contains(anchor) => after.entry(anchor).or_default().push(echo),
                // The anchor left the live chunk: confirmed echoes fall back
                // to their real position, the others go to the end.
                Some(_) if echo.confirmed.is_some() => continue,
                Some(_) => at_tail.push(echo),
            }
            if let Some(confirmed) = &echo.confirmed {
                slotted.insert(confirmed.event_id.clone());
            }
        }

        let mut items = Vec::with_capacity(live_events.len() + echoes.len());
        for echo in at_head {
            items.push(self.echo_item(echo)?);
        }
        for event_id in &live_events {
            if !slotted.contains(event_id) {
                match self.event_store.get(event_id)? {
                    Some(event) => items.push(TimelineItem {
                        transaction_id: event.transaction_id().cloned(),
                        event,
                        send_state: None,
                    }),
                    None => warn!(%event_id, "Live chunk event missing from the event store"),
                }
            }
            for echo in after.get(event_id).into_iter().flatten() {
                items.push(self.echo_item(echo)?);
            }
        }
        for echo in at_tail {
            items.push(self.echo_item(echo)?);
        }

        Ok(items)
    }

    fn echo_item(&self, echo: &LocalEcho) -> Result<TimelineItem> {
        let event = match &echo.confirmed {
            Some(confirmed) => self
                .event_store
                .get(&confirmed.event_id)?
                .unwrap_or_else(|| confirmed.clone()),
            None => echo.placeholder.clone(),
        };
        Ok(TimelineItem {
            event,
            send_state: Some(echo.state.clone()),
            transaction_id: Some(echo.transaction_id.clone()),
        })
    }
}
