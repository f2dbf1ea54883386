//! Process-wide table of live domain indices.
//!
//! Each domain owns one slot guarded by an async read/write lock. Retrieval takes the read side,
//! so reads of a domain run concurrently; ingestion, document removal, and domain removal take
//! the write side for their whole duration, so writers to the same domain are serialized while
//! other domains are unaffected. Slots load lazily from disk on first access and stay resident
//! until their domain is deleted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{
    OwnedRwLockMappedWriteGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock,
};

use super::store::DomainIndex;
use crate::domains::{DomainError, DomainName};
use crate::storage::StorageLayout;
use crate::workers::WorkerPool;

/// Lifecycle of a cached slot.
#[derive(Debug)]
pub enum SlotState {
    /// Known name whose index has not been read from disk yet.
    Unloaded,
    /// Index resident in memory.
    Loaded(DomainIndex),
    /// Domain deleted; the slot only lingers until its lock is released.
    Retired,
}

impl SlotState {
    fn loaded(&self) -> Option<&DomainIndex> {
        match self {
            Self::Loaded(index) => Some(index),
            _ => None,
        }
    }

    fn loaded_mut(&mut self) -> Option<&mut DomainIndex> {
        match self {
            Self::Loaded(index) => Some(index),
            _ => None,
        }
    }
}

type Slot = Arc<RwLock<SlotState>>;

/// Shared read access to a loaded index.
pub type IndexReadGuard = OwnedRwLockReadGuard<SlotState, DomainIndex>;
/// Exclusive write access to a loaded index.
pub type IndexWriteGuard = OwnedRwLockMappedWriteGuard<SlotState, DomainIndex>;

/// Exclusive hold on a domain slot regardless of whether its index is loaded.
pub struct DomainLock {
    slot: Slot,
    guard: OwnedRwLockWriteGuard<SlotState>,
}

impl DomainLock {
    /// Whether the held slot currently has an index in memory.
    pub fn is_loaded(&self) -> bool {
        matches!(*self.guard, SlotState::Loaded(_))
    }
}

/// Lazily-populated map from domain name to its index slot.
pub struct IndexCache {
    layout: StorageLayout,
    workers: WorkerPool,
    slots: Mutex<HashMap<String, Slot>>,
}

impl IndexCache {
    /// Create an empty cache reading persisted indices through `layout`.
    pub fn new(layout: StorageLayout, workers: WorkerPool) -> Self {
        Self {
            layout,
            workers,
            slots: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.lock_table().len()
    }

    #[cfg(test)]
    fn is_resident(&self, name: &DomainName) -> bool {
        let slot = self.lock_table().get(name.as_str()).cloned();
        slot.and_then(|slot| {
            slot.try_read()
                .ok()
                .map(|state| matches!(*state, SlotState::Loaded(_)))
        })
        .unwrap_or(false)
    }

    /// Shared access to the index of `name`, loading it from disk on a miss.
    pub async fn read(&self, name: &DomainName) -> Result<IndexReadGuard, DomainError> {
        let slot = self.slot(name);
        let guard = slot.clone().read_owned().await;
        let guard = match OwnedRwLockReadGuard::try_map(guard, SlotState::loaded) {
            Ok(index) => return Ok(index),
            Err(guard) => guard,
        };
        let retired = matches!(*guard, SlotState::Retired);
        drop(guard);
        if retired {
            return Err(DomainError::NotFound(name.to_string()));
        }

        let mut write = slot.write_owned().await;
        self.ensure_loaded(name, &mut write).await?;
        OwnedRwLockReadGuard::try_map(write.downgrade(), SlotState::loaded)
            .map_err(|_| DomainError::NotFound(name.to_string()))
    }

    /// Exclusive access to the index of `name`, loading it from disk on a miss.
    ///
    /// The returned guard is the per-domain writer lock; hold it for the whole mutation.
    pub async fn write(&self, name: &DomainName) -> Result<IndexWriteGuard, DomainError> {
        let mut guard = self.slot(name).write_owned().await;
        self.ensure_loaded(name, &mut guard).await?;
        OwnedRwLockWriteGuard::try_map(guard, SlotState::loaded_mut)
            .map_err(|_| DomainError::NotFound(name.to_string()))
    }

    /// Take the writer lock of `name` without loading its index.
    ///
    /// Used by domain creation and deletion, which must serialize with other writers even when
    /// no index is resident.
    pub async fn lock(&self, name: &DomainName) -> DomainLock {
        loop {
            let slot = self.slot(name);
            let guard = slot.clone().write_owned().await;
            // A retired slot has already left the table; retry against the fresh one.
            if !matches!(*guard, SlotState::Retired) {
                return DomainLock { slot, guard };
            }
        }
    }

    /// Make `index` the resident index of the held domain.
    pub fn install(&self, held: &mut DomainLock, index: DomainIndex) {
        *held.guard = SlotState::Loaded(index);
    }

    /// Drop the resident index of the held domain and refuse all future access through the slot.
    ///
    /// Persisted storage is untouched; callers delete it afterwards while still holding the lock
    /// and finish with [`IndexCache::forget`].
    pub fn evict(&self, held: &mut DomainLock) {
        *held.guard = SlotState::Retired;
    }

    /// Remove a retired slot from the table and release its lock.
    pub fn forget(&self, name: &DomainName, held: DomainLock) {
        let mut table = self.lock_table();
        if table
            .get(name.as_str())
            .is_some_and(|current| Arc::ptr_eq(current, &held.slot))
        {
            table.remove(name.as_str());
        }
        drop(table);
        drop(held.guard);
    }

    async fn ensure_loaded(
        &self,
        name: &DomainName,
        state: &mut SlotState,
    ) -> Result<(), DomainError> {
        match state {
            SlotState::Loaded(_) => Ok(()),
            SlotState::Retired => Err(DomainError::NotFound(name.to_string())),
            SlotState::Unloaded => {
                let index_dir = self.layout.index_dir(name);
                let loaded = self
                    .workers
                    .run(move || -> Result<Option<DomainIndex>, DomainError> {
                        if !DomainIndex::is_persisted(&index_dir) {
                            return Ok(None);
                        }
                        let path = DomainIndex::file_path(&index_dir);
                        let bytes = std::fs::read(&path)
                            .map_err(DomainError::storage(format!("reading {}", path.display())))?;
                        Ok(Some(DomainIndex::from_bytes(&bytes)?))
                    })
                    .await??;

                let Some(index) = loaded else {
                    return Err(DomainError::NotFound(name.to_string()));
                };
                tracing::info!(
                    domain = %name,
                    chunks = index.len(),
                    model = index.embedding_model(),
                    "Loaded domain index"
                );
                *state = SlotState::Loaded(index);
                Ok(())
            }
        }
    }

    fn slot(&self, name: &DomainName) -> Slot {
        self.lock_table()
            .entry(name.as_str().to_string())
            .or_insert_with(|| Arc::new(RwLock::new(SlotState::Unloaded)))
            .clone()
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
