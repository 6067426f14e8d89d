mod event_store;
mod read_markers;
mod relations;
mod state;
mod tags;
mod timeline;

use crate::{database::KeyValueDatabase, service};

impl service::rooms::Data for KeyValueDatabase {}
