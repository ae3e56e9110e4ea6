//! Cluster data synchronization
//!
//! Handlers are keyed by name and typed over a serde value. The registry
//! turns all of them into one blob for `sync_cluster_data`:
//! ```text
//! bool force | (string key | byte-array bincode value)*
//! ```
//! and applies incoming blobs entry by entry. An entry that differs from the
//! local value is only overwritten when forced; otherwise the configured
//! [`SyncConflictPolicy`] decides.

use std::{collections::BTreeMap, fmt, sync::Arc};

use bytes::{Buf, Bytes, BytesMut};
use cloudnet_events::ModuleToken;
use cloudnet_protocol::{DataBufReader, DataBufWriter};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use crate::{config::SyncConflictPolicy, error::ClusterResult, snapshot::WireValue};

type NameFn<T> = Box<dyn Fn(&T) -> String + Send + Sync>;
type CurrentFn<T> = Box<dyn Fn(&T) -> Option<T> + Send + Sync>;
type WriteFn<T> = Box<dyn Fn(T) + Send + Sync>;
type DataFn<T> = Box<dyn Fn() -> Vec<T> + Send + Sync>;

/// Synchronizes one kind of value across the cluster.
pub struct DataSyncHandler<T> {
    key: String,
    always_force_apply: bool,
    name: NameFn<T>,
    current: CurrentFn<T>,
    writer: WriteFn<T>,
    data: DataFn<T>,
}

impl<T> DataSyncHandler<T>
where
    T: Serialize + DeserializeOwned + PartialEq + fmt::Debug + Send + Sync + 'static,
{
    /// - `data`: every local value to send
    /// - `current`: the local counterpart of an incoming value, if any
    /// - `writer`: store an incoming value locally
    pub fn new<D, C, W>(key: impl Into<String>, data: D, current: C, writer: W) -> Self
    where
        D: Fn() -> Vec<T> + Send + Sync + 'static,
        C: Fn(&T) -> Option<T> + Send + Sync + 'static,
        W: Fn(T) + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            always_force_apply: false,
            name: Box::new(|value| format!("{:?}", value)),
            current: Box::new(current),
            writer: Box::new(writer),
            data: Box::new(data),
        }
    }

    /// Human readable name of a value, used in conflict logs.
    pub fn with_name<N>(mut self, name: N) -> Self
    where
        N: Fn(&T) -> String + Send + Sync + 'static,
    {
        self.name = Box::new(name);
        self
    }

    /// Apply incoming values even when they conflict with local ones.
    pub fn always_force_apply(mut self, always: bool) -> Self {
        self.always_force_apply = always;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Type-erased view of a [`DataSyncHandler`].
trait ErasedSyncHandler: Send + Sync {
    fn collect(&self) -> Vec<Bytes>;

    /// Apply one entry. Returns the local value when it should be sent back.
    fn apply(&self, data: &[u8], force: bool, policy: SyncConflictPolicy)
        -> ClusterResult<Option<Bytes>>;
}

impl<T> ErasedSyncHandler for DataSyncHandler<T>
where
    T: Serialize + DeserializeOwned + PartialEq + fmt::Debug + Send + Sync + 'static,
{
    fn collect(&self) -> Vec<Bytes> {
        (self.data)().iter().map(|value| value.to_bytes()).collect()
    }

    fn apply(
        &self,
        data: &[u8],
        force: bool,
        policy: SyncConflictPolicy,
    ) -> ClusterResult<Option<Bytes>> {
        let incoming = T::from_bytes(data)?;
        let current = match (self.current)(&incoming) {
            Some(current) if !force && !self.always_force_apply && current != incoming => current,
            _ => {
                (self.writer)(incoming);
                return Ok(None);
            }
        };

        let name = (self.name)(&current);
        match policy {
            SyncConflictPolicy::AcceptTheirs => {
                info!(key = %self.key, %name, "Sync conflict, accepting incoming value");
                (self.writer)(incoming);
                Ok(None)
            }
            SyncConflictPolicy::KeepLocal => {
                info!(key = %self.key, %name, "Sync conflict, keeping local value");
                Ok(Some(current.to_bytes()))
            }
            SyncConflictPolicy::Skip => {
                info!(key = %self.key, %name, "Sync conflict, skipping entry");
                Ok(None)
            }
        }
    }
}

struct RegisteredSyncHandler {
    handler: Arc<dyn ErasedSyncHandler>,
    owner: Option<ModuleToken>,
}

pub struct DataSyncRegistry {
    handlers: RwLock<BTreeMap<String, RegisteredSyncHandler>>,
    policy: SyncConflictPolicy,
}

impl DataSyncRegistry {
    pub fn new(policy: SyncConflictPolicy) -> Self {
        Self {
            handlers: RwLock::new(BTreeMap::new()),
            policy,
        }
    }

    pub fn policy(&self) -> SyncConflictPolicy {
        self.policy
    }

    /// Register `handler` unless its key is taken. Returns whether it was
    /// registered.
    pub fn register_handler<T>(
        &self,
        handler: DataSyncHandler<T>,
        owner: Option<&ModuleToken>,
    ) -> bool
    where
        T: Serialize + DeserializeOwned + PartialEq + fmt::Debug + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(handler.key()) {
            return false;
        }
        debug!(key = %handler.key(), "Registered data sync handler");
        handlers.insert(
            handler.key().to_string(),
            RegisteredSyncHandler {
                handler: Arc::new(handler),
                owner: owner.cloned(),
            },
        );
        true
    }

    pub fn unregister_handler(&self, key: &str) -> bool {
        self.handlers.write().remove(key).is_some()
    }

    /// Remove every handler registered by `owner`.
    pub fn unregister_handlers(&self, owner: &ModuleToken) -> usize {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|_, entry| entry.owner.as_ref() != Some(owner));
        before - handlers.len()
    }

    pub fn has_handler(&self, key: &str) -> bool {
        self.handlers.read().contains_key(key)
    }

    /// Serialize the data of the selected handlers (all of them when
    /// `selected` is empty).
    pub fn prepare_cluster_data(&self, force: bool, selected: &[&str]) -> Bytes {
        let handlers: Vec<(String, Arc<dyn ErasedSyncHandler>)> = self
            .handlers
            .read()
            .iter()
            .filter(|(key, _)| selected.is_empty() || selected.contains(&key.as_str()))
            .map(|(key, entry)| (key.clone(), entry.handler.clone()))
            .collect();

        let mut buf = BytesMut::new();
        buf.write_bool(force);
        for (key, handler) in handlers {
            for value in handler.collect() {
                buf.write_string(&key);
                buf.write_bytes(&value);
            }
        }
        buf.freeze()
    }

    /// Apply an incoming sync blob.
    ///
    /// Returns a blob of local values that won a conflict under
    /// [`SyncConflictPolicy::KeepLocal`], to be sent back to the origin.
    /// The returned blob is marked forced.
    pub fn handle(&self, mut input: Bytes) -> ClusterResult<Option<Bytes>> {
        let force = input.read_bool()?;
        let mut result: Option<BytesMut> = None;

        while input.has_remaining() {
            let key = input.read_string()?;
            let data = input.read_bytes()?;

            let handler = self
                .handlers
                .read()
                .get(&key)
                .map(|entry| entry.handler.clone());
            let Some(handler) = handler else {
                debug!(%key, "No handler for synced data");
                continue;
            };

            match handler.apply(&data, force, self.policy) {
                Ok(Some(local)) => {
                    let result = result.get_or_insert_with(|| {
                        let mut buf = BytesMut::new();
                        buf.write_bool(true);
                        buf
                    });
                    result.write_string(&key);
                    result.write_bytes(&local);
                }
                Ok(None) => {}
                Err(e) => warn!(%key, "Failed to apply synced data: {}", e),
            }
        }
        Ok(result.map(BytesMut::freeze))
    }
}

impl fmt::Debug for DataSyncRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataSyncRegistry")
            .field("handlers", &self.handlers.read().keys().collect::<Vec<_>>())
            .field("policy", &self.policy)
            .finish()
    }
}
