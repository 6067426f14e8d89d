// =============================================================================
// Matrixon Timeline - Service Module
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
//   Service container. `Services::build` wires every room service to its
//   storage, the transport and the decryptor through constructor
//   injection, and exposes the operations a UI drives directly.
//
// =============================================================================

pub mod rooms;
pub mod transaction_ids;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use futures::stream::BoxStream;
use matrixon_timeline_core::{
    Decryptor, Direction, LocalDraft, TimelineConfig, TimelineDiff, Transport,
};
use ruma::{EventId, OwnedTransactionId, RoomId};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};

use crate::Result;
use rooms::{
    local_echo::TimelineItem,
    pagination::PaginationOutcome,
    timeline::DiffBus,
};

pub struct Services {
    pub config: TimelineConfig,
    pub diffs: Arc<DiffBus>,
    pub rooms: rooms::Service,
    pub transaction_ids: Arc<transaction_ids::Service>,
}

impl Services {
    /// Builds every service on `db`. Services only share state through the
    /// handles passed to them here.
    #[instrument(level = "info", skip_all, fields(user_id = %config.user_id))]
    pub fn build<D: rooms::Data + transaction_ids::Data + 'static>(
        db: Arc<D>,
        config: TimelineConfig,
        transport: Arc<dyn Transport>,
        decryptor: Arc<dyn Decryptor>,
    ) -> Result<Self> {
        let start_time = Instant::now();
        info!("🚀 Initializing timeline services");

        config.validate()?;

        let diffs = Arc::new(DiffBus::new(config.diff_channel_capacity));
        let transaction_ids = Arc::new(transaction_ids::Service { db: db.clone() });

        let event_store = Arc::new(rooms::event_store::Service::build(
            db.clone(),
            config.event_channel_capacity,
        ));
        let timeline = Arc::new(rooms::timeline::Service::build(db.clone()));
        debug!("✅ Event store and chunk graph ready");

        let state = Arc::new(rooms::state::Service::build(db.clone(), transport.clone()));
        let tags = Arc::new(rooms::tags::Service::build(db.clone(), transport.clone()));
        let read_markers = Arc::new(rooms::read_markers::Service::build(
            db.clone(),
            config.user_id.clone(),
            timeline.clone(),
            transport.clone(),
        ));
        let typing = Arc::new(rooms::edus::typing::Service::build(
            transport.clone(),
            config.typing_timeout(),
        ));
        debug!("✅ Room projections ready");

        let local_echo = Arc::new(rooms::local_echo::Service::build(
            config.user_id.clone(),
            transport.clone(),
            transaction_ids.clone(),
            event_store.clone(),
            timeline.clone(),
            diffs.clone(),
        ));
        let relations = Arc::new(rooms::relations::Service::build(
            db,
            config.user_id.clone(),
            event_store.clone(),
            timeline.clone(),
            local_echo.clone(),
            transport.clone(),
        ));
        debug!("✅ Local echo and relations ready");

        let pagination = Arc::new(rooms::pagination::Service::build(
            config.clone(),
            transport.clone(),
            decryptor.clone(),
            event_store.clone(),
            timeline.clone(),
            state.clone(),
            relations.clone(),
            diffs.clone(),
        ));
        let sync = Arc::new(rooms::sync::Service::build(
            transport,
            decryptor,
            event_store.clone(),
            timeline.clone(),
            state.clone(),
            relations.clone(),
            read_markers.clone(),
            tags.clone(),
            typing.clone(),
            local_echo.clone(),
            diffs.clone(),
        ));
        debug!("✅ Pagination and sync ready");

        let services = Self {
            config,
            diffs,
            rooms: rooms::Service {
                edus: rooms::edus::Service { typing },
                event_store,
                gap_resolver: rooms::gap_resolver::Service,
                local_echo,
                pagination,
                read_markers,
                relations,
                state,
                sync,
                tags,
                timeline,
            },
            transaction_ids,
        };

        let elapsed = start_time.elapsed();
        info!("🎉 Timeline services initialized in {:?}", elapsed);
        if elapsed > Duration::from_secs(1) {
            warn!("⚠️ Service initialization took longer than expected: {:?}", elapsed);
        }

        Ok(services)
    }

    /// Every diff of every room, in emission order.
    pub fn subscribe(&self) -> broadcast::Receiver<TimelineDiff> {
        self.diffs.subscribe()
    }

    pub fn room_diffs(&self, room_id: &RoomId) -> BoxStream<'static, TimelineDiff> {
        self.diffs.room_stream(room_id)
    }

    pub async fn request_page(
        &self,
        room_id: &RoomId,
        direction: Direction,
        limit: Option<u32>,
    ) -> Result<PaginationOutcome> {
        self.rooms.pagination.request_page(room_id, direction, limit).await
    }

    pub async fn get_context_of_event(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        limit: Option<u32>,
    ) -> Result<PaginationOutcome> {
        self.rooms
            .pagination
            .get_context_of_event(room_id, event_id, limit)
            .await
    }

    /// Shows `draft` immediately and submits it. A failed submission keeps
    /// the echo visible as failed; the error is logged, not returned.
    pub async fn send_local(&self, room_id: &RoomId, draft: LocalDraft) -> Result<OwnedTransactionId> {
        let txn_id = self.rooms.local_echo.send_local(room_id, draft).await?;
        if let Err(error) = self.rooms.local_echo.submit(room_id, &txn_id).await {
            warn!(%room_id, transaction_id = %txn_id, %error, "Local echo submission failed");
        }
        Ok(txn_id)
    }

    pub async fn live_view(&self, room_id: &RoomId) -> Result<Vec<TimelineItem>> {
        self.rooms.local_echo.live_view(room_id).await
    }

    pub async fn sync_once(&self) -> Result<Vec<TimelineDiff>> {
        self.rooms.sync.sync_once().await
    }

    pub async fn apply_sync(&self, response: matrixon_timeline_core::SyncResponse) -> Result<Vec<TimelineDiff>> {
        self.rooms.sync.apply_sync(response).await
    }
}
