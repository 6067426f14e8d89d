// =============================================================================
// Matrixon Timeline - Storage Abstraction Module
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
//   Byte-oriented key/value tree abstraction the timeline engine persists
//   through. Engines hand out named trees; every typed store is built on
//   top of `KvTree`.
//
// =============================================================================

use std::sync::Arc;

use matrixon_timeline_core::TimelineConfig;

use crate::Result;

pub mod memory;

pub trait KeyValueDatabaseEngine: Send + Sync {
    /// Opens the engine for the given configuration
    fn open(config: &TimelineConfig) -> Result<Self>
    where
        Self: Sized;

    /// Opens (or creates) the tree with the given name
    fn open_tree(&self, name: &'static str) -> Result<Arc<dyn KvTree>>;

    /// Flushes all pending changes to durable storage
    fn flush(&self) -> Result<()>;

    fn memory_usage(&self) -> Result<String> {
        Ok("Current database engine does not support memory usage reporting.".to_owned())
    }
}

pub trait KvTree: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn insert_batch(&self, iter: &mut dyn Iterator<Item = (Vec<u8>, Vec<u8>)>) -> Result<()>;

    fn remove(&self, key: &[u8]) -> Result<()>;

    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>;

    /// Iterates from `from` (inclusive) in key order, or in reverse key
    /// order when `backwards` is set.
    fn iter_from<'a>(
        &'a self,
        from: &[u8],
        backwards: bool,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>;

    /// Atomically increments the big-endian `u64` stored at `key` and returns
    /// the new value's bytes.
    fn increment(&self, key: &[u8]) -> Result<Vec<u8>>;

    fn scan_prefix<'a>(
        &'a self,
        prefix: Vec<u8>,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a>;

    fn clear(&self) -> Result<()> {
        for (key, _) in self.iter() {
            self.remove(&key)?;
        }

        Ok(())
    }
}
