pub mod edus;
pub mod event_store;
pub mod gap_resolver;
pub mod local_echo;
pub mod pagination;
pub mod read_markers;
pub mod relations;
pub mod state;
pub mod sync;
pub mod tags;
pub mod timeline;

use std::sync::Arc;

pub trait Data:
    event_store::Data
    + read_markers::Data
    + relations::Data
    + state::Data
    + tags::Data
    + timeline::Data
{
}

pub struct Service {
    pub edus: edus::Service,
    pub event_store: Arc<event_store::Service>,
    pub gap_resolver: gap_resolver::Service,
    pub local_echo: Arc<local_echo::Service>,
    pub pagination: Arc<pagination::Service>,
    pub read_markers: Arc<read_markers::Service>,
    pub relations: Arc<relations::Service>,
    pub state: Arc<state::Service>,
    pub sync: Arc<sync::Service>,
    pub tags: Arc<tags::Service>,
    pub timeline: Arc<timeline::Service>,
}
