//! In-memory cache of compiled operators and their executors.
//!
//! Two lock levels are used. The map lock is reentrant and is held for the whole of every
//! structural operation, so a factory passed to [OpModelCache::create_cached_executor] may call
//! back into the cache. Each entry also owns a plain mutex, handed out by
//! [OpModelCache::get_cache_mutex], which callers hold while executing that operator; the map
//! lock is only needed briefly to fetch it.

mod executor;

pub use executor::{ModelExecutor, StreamExecutor};

use crate::common::{OpModelId, StreamId};

use auto_impl::auto_impl;
use log::{debug, error};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

/// Identifies a compiled operator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpModelDef {
    pub op_model_id: OpModelId,
    pub op_type: String,
    pub is_dynamic: bool,
}

/// A compiled operator: its binary and, once loaded under the graph executor, its executors.
#[derive(Debug, Clone, Default)]
pub struct OpModel {
    pub op_model_id: OpModelId,
    pub name: String,
    pub binary: Option<Arc<[u8]>>,
    pub executor: Option<Arc<StreamExecutor>>,
}

#[derive(thiserror::Error, Debug)]
#[error("{0}")]
pub struct UnloadError(pub String);

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("ACL inner error: op model {0} is already cached")]
    Duplicate(OpModelId),
    #[error("Op model {0} is not cached")]
    NotFound(OpModelId),
    #[error("Failed to unload op model {op_model_id}: {source}")]
    Unload {
        op_model_id: OpModelId,
        #[source]
        source: UnloadError,
    },
    #[error("Failed to create executor for op model {op_model_id} on {stream}: {reason}")]
    ExecutorCreation {
        op_model_id: OpModelId,
        stream: StreamId,
        reason: String,
    },
}

/// Releases device-side resources of an operator removed from the cache.
#[auto_impl(&, Box, Arc)]
pub trait ModelUnloader: Send + Sync {
    fn unload_single_op(&self, op_model_id: OpModelId) -> Result<(), UnloadError>;
    fn unload_dynamic_single_op(&self, op_model_id: OpModelId) -> Result<(), UnloadError>;
}

struct CacheEntry {
    model: OpModel,
    mutex: Arc<Mutex<()>>,
}

pub struct OpModelCache<U: ModelUnloader> {
    map: ReentrantMutex<RefCell<HashMap<OpModelId, CacheEntry>>>,
    unloader: U,
}

impl PartialEq for OpModel {
    fn eq(&self, other: &Self) -> bool {
        let same_executor = match (&self.executor, &other.executor) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        self.op_model_id == other.op_model_id
            && self.name == other.name
            && self.binary == other.binary
            && same_executor
    }
}

impl OpModel {
    pub fn new(name: impl Into<String>, binary: impl Into<Arc<[u8]>>) -> Self {
        OpModel {
            name: name.into(),
            binary: Some(binary.into()),
            ..Default::default()
        }
    }
}

impl<U: ModelUnloader> OpModelCache<U> {
    pub fn new(unloader: U) -> Self {
        OpModelCache {
            map: ReentrantMutex::new(RefCell::new(HashMap::new())),
            unloader,
        }
    }

    /// Caches `model` under `op_id`. Adding an id twice is a caller bug and leaves the first
    /// entry untouched.
    pub fn add(&self, op_id: OpModelId, mut model: OpModel) -> Result<(), CacheError> {
        let guard = self.map.lock();
        let mut map = guard.borrow_mut();
        match map.entry(op_id) {
            Entry::Occupied(_) => {
                error!("ACL inner error: op model {op_id} is already cached");
                Err(CacheError::Duplicate(op_id))
            }
            Entry::Vacant(vacant) => {
                model.op_model_id = op_id;
                debug!("Caching op model {op_id} ({})", model.name);
                vacant.insert(CacheEntry {
                    model,
                    mutex: Arc::default(),
                });
                Ok(())
            }
        }
    }

    pub fn get_op_model(&self, def: &OpModelDef) -> Result<OpModel, CacheError> {
        let guard = self.map.lock();
        let map = guard.borrow();
        map.get(&def.op_model_id)
            .map(|entry| entry.model.clone())
            .ok_or(CacheError::NotFound(def.op_model_id))
    }

    /// Returns the cached model for `def`, compiling and caching it on a miss.
    ///
    /// The map lock is held while `compile` runs, so concurrent misses on the same id compile
    /// once.
    pub fn get_or_add<F>(&self, def: &OpModelDef, compile: F) -> Result<OpModel, CacheError>
    where
        F: FnOnce(&OpModelDef) -> Result<OpModel, CacheError>,
    {
        let _guard = self.map.lock();
        match self.get_op_model(def) {
            Ok(model) => return Ok(model),
            Err(CacheError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        debug!("Op model {} not cached; compiling", def.op_model_id);
        self.add(def.op_model_id, compile(def)?)?;
        self.get_op_model(def)
    }

    /// Removes `def` from the cache and unloads it through the dynamic or static path. Deleting
    /// an absent id succeeds without unloading anything.
    ///
    /// The entry is removed before unloading. If the unload fails the operator stays out of the
    /// cache, and deleting it again succeeds without another unload attempt.
    pub fn delete(&self, def: &OpModelDef, is_dynamic: bool) -> Result<(), CacheError> {
        let guard = self.map.lock();
        let removed = guard.borrow_mut().remove(&def.op_model_id);
        if removed.is_none() {
            debug!("Op model {} not cached; nothing to delete", def.op_model_id);
            return Ok(());
        }
        let id = def.op_model_id;
        let unloaded = if is_dynamic {
            self.unloader.unload_dynamic_single_op(id)
        } else {
            self.unloader.unload_single_op(id)
        };
        unloaded.map_err(|source| {
            error!("Failed to unload op model {id}: {source}");
            CacheError::Unload {
                op_model_id: id,
                source,
            }
        })
    }

    /// Deletes `def` through the unload path its `is_dynamic` flag selects.
    pub fn remove(&self, def: &OpModelDef) -> Result<(), CacheError> {
        self.delete(def, def.is_dynamic)
    }

    /// The per-entry execution mutex of `id`. The same mutex is returned for as long as the
    /// entry is cached.
    pub fn get_cache_mutex(&self, id: OpModelId) -> Option<Arc<Mutex<()>>> {
        let guard = self.map.lock();
        let map = guard.borrow();
        map.get(&id).map(|entry| Arc::clone(&entry.mutex))
    }

    /// Returns the executor of `id` bound to `stream`, creating the entry's [StreamExecutor] and
    /// calling `create` as needed.
    ///
    /// `create` runs with the map lock held and may call back into this cache.
    pub fn create_cached_executor<F>(
        &self,
        id: OpModelId,
        stream: StreamId,
        create: F,
    ) -> Result<Arc<dyn ModelExecutor>, CacheError>
    where
        F: FnOnce(&OpModel, StreamId) -> Result<Arc<dyn ModelExecutor>, CacheError>,
    {
        let guard = self.map.lock();
        let (model, stream_executor) = {
            let mut map = guard.borrow_mut();
            let entry = map.get_mut(&id).ok_or(CacheError::NotFound(id))?;
            let stream_executor = Arc::clone(entry.model.executor.get_or_insert_with(Default::default));
            (entry.model.clone(), stream_executor)
        };
        stream_executor.get_or_create(stream, || {
            debug!("Creating executor for op model {id} on {stream}");
            create(&model, stream)
        })
    }

    pub fn get_rt2_executor(&self, id: OpModelId) -> Option<Arc<StreamExecutor>> {
        let guard = self.map.lock();
        let map = guard.borrow();
        map.get(&id).and_then(|entry| entry.model.executor.clone())
    }

    pub fn update_cached_executor(
        &self,
        id: OpModelId,
        executor: Arc<StreamExecutor>,
    ) -> Result<(), CacheError> {
        let guard = self.map.lock();
        let mut map = guard.borrow_mut();
        let entry = map.get_mut(&id).ok_or(CacheError::NotFound(id))?;
        entry.model.executor = Some(executor);
        Ok(())
    }

    /// Unbinds `stream` from every cached operator. Returns how many executors were dropped.
    pub fn clean_cached_executor(&self, stream: StreamId) -> usize {
        let guard = self.map.lock();
        let map = guard.borrow();
        let dropped = map
            .values()
            .filter_map(|entry| entry.model.executor.as_ref())
            .filter(|se| se.erase(stream))
            .count();
        debug!("Dropped {dropped} executors bound to {stream}");
        dropped
    }

    /// Drops the binary of `id`, keeping the entry and its executors.
    pub fn unload_cached_model_data(&self, id: OpModelId) -> Result<(), CacheError> {
        let guard = self.map.lock();
        let mut map = guard.borrow_mut();
        let entry = map.get_mut(&id).ok_or(CacheError::NotFound(id))?;
        entry.model.binary = None;
        Ok(())
    }

    /// Empties the cache without unloading anything. For teardown only.
    pub fn clean_cached_models(&mut self) {
        self.map.get_mut().get_mut().clear();
    }

    pub fn contains(&self, id: OpModelId) -> bool {
        let guard = self.map.lock();
        let map = guard.borrow();
        map.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        let guard = self.map.lock();
        let map = guard.borrow();
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
