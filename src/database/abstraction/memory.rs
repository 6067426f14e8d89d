use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use matrixon_timeline_core::{TimelineConfig, TimelineError};

use super::{KeyValueDatabaseEngine, KvTree};
use crate::Result;

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

/// In-process engine backed by ordered maps. Nothing survives the process.
#[derive(Default)]
pub struct Engine {
    trees: RwLock<HashMap<&'static str, Arc<MemoryTree>>>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueDatabaseEngine for Engine {
    fn open(_config: &TimelineConfig) -> Result<Self> {
        Ok(Self::new())
    }

    fn open_tree(&self, name: &'static str) -> Result<Arc<dyn KvTree>> {
        let mut trees = self
            .trees
            .write()
            .map_err(|_| TimelineError::Storage("memory engine lock poisoned".to_owned()))?;
        let tree: Arc<dyn KvTree> = trees.entry(name).or_default().clone();
        Ok(tree)
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn memory_usage(&self) -> Result<String> {
        let trees = self
            .trees
            .read()
            .map_err(|_| TimelineError::Storage("memory engine lock poisoned".to_owned()))?;
        let mut response = String::new();
        for (name, tree) in trees.iter() {
            let (entries, bytes) = tree.footprint();
            response += &format!("{name}: {entries} entries, {bytes} bytes\n");
        }
        Ok(response)
    }
}

#[derive(Default)]
pub struct MemoryTree {
    map: RwLock<Map>,
}

impl MemoryTree {
    fn read(&self) -> Result<RwLockReadGuard<'_, Map>> {
        self.map
            .read()
            .map_err(|_| TimelineError::Storage("memory tree lock poisoned".to_owned()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Map>> {
        self.map
            .write()
            .map_err(|_| TimelineError::Storage("memory tree lock poisoned".to_owned()))
    }

    fn footprint(&self) -> (usize, usize) {
        self.read()
            .map(|map| {
                let bytes = map.iter().map(|(k, v)| k.len() + v.len()).sum();
                (map.len(), bytes)
            })
            .unwrap_or_default()
    }

    /// Iterators hand out a copy so no lock is held while callers consume them.
    fn collect(&self, range: (Bound<Vec<u8>>, Bound<Vec<u8>>), backwards: bool) -> Vec<(Vec<u8>, Vec<u8>)> {
        let Ok(map) = self.read() else {
            return Vec::new();
        };
        let entries = map.range(range).map(|(k, v)| (k.clone(), v.clone()));
        if backwards {
            entries.rev().collect()
        } else {
            entries.collect()
        }
    }
}

impl KvTree for MemoryTree {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.read()?.get(key).cloned())
    }

    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write()?.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn insert_batch(&self, iter: &mut dyn Iterator<Item = (Vec<u8>, Vec<u8>)>) -> Result<()> {
        let mut map = self.write()?;
        for (key, value) in iter {
            map.insert(key, value);
        }
        Ok(())
    }

    fn remove(&self, key: &[u8]) -> Result<()> {
        self.write()?.remove(key);
        Ok(())
    }

    fn iter<'a>(&'a self) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        Box::new(self.collect((Bound::Unbounded, Bound::Unbounded), false).into_iter())
    }

    fn iter_from<'a>(
        &'a self,
        from: &[u8],
        backwards: bool,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        let range = if backwards {
            (Bound::Unbounded, Bound::Included(from.to_vec()))
        } else {
            (Bound::Included(from.to_vec()), Bound::Unbounded)
        };
        Box::new(self.collect(range, backwards).into_iter())
    }

    fn increment(&self, key: &[u8]) -> Result<Vec<u8>> {
        let mut map = self.write()?;
        let old = map
            .get(key)
            .map(|bytes| {
                bytes
                    .as_slice()
                    .try_into()
                    .map(u64::from_be_bytes)
                    .map_err(|_| TimelineError::bad_database("Counter is not a u64."))
            })
            .transpose()?
            .unwrap_or(0);
        let new = (old + 1).to_be_bytes().to_vec();
        map.insert(key.to_vec(), new.clone());
        Ok(new)
    }

    fn scan_prefix<'a>(
        &'a self,
        prefix: Vec<u8>,
    ) -> Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + 'a> {
        let entries = self.collect((Bound::Included(prefix.clone()), Bound::Unbounded), false);
        Box::new(
            entries
                .into_iter()
                .take_while(move |(key, _)| key.starts_with(&prefix)),
        )
    }
}
