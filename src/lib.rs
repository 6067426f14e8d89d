// =============================================================================
// Matrixon Timeline - Library Crate
// =============================================================================
//
// Project: Matrixon - Gap-aware room timeline engine
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Room timeline engine for a Matrix client. Keeps each room's history as
//   a graph of contiguous chunks separated by gaps, fills gaps through
//   pagination, merges sync deltas into the live end and tracks local
//   echoes until the server confirms them.
//
// =============================================================================

pub mod config;
pub mod database;
pub mod service;
pub mod transport;
pub mod utils;

pub use matrixon_timeline_core as core;
pub use matrixon_timeline_core::{Result, TimelineError};
pub use service::Services;
