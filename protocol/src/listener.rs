//! Packet listener registry
//!
//! Maps protocol channel ids to ordered listener lists. Dispatch walks the
//! parent registry first, then the local listeners in registration order.
//! Registration is rare compared to dispatch, so the table sits behind a
//! read-mostly lock and dispatch works on a cloned snapshot of the list.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use cloudnet_events::ModuleToken;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::{
    channel::NetworkChannel,
    error::{ProtocolError, ProtocolResult},
    packet::Packet,
};

/// Handles packets of one protocol channel.
pub trait PacketListener: Send + Sync {
    fn handle(&self, channel: &Arc<NetworkChannel>, packet: &Packet) -> anyhow::Result<()>;
}

impl<F> PacketListener for F
where
    F: Fn(&Arc<NetworkChannel>, &Packet) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, channel: &Arc<NetworkChannel>, packet: &Packet) -> anyhow::Result<()> {
        self(channel, packet)
    }
}

/// Opaque handle returned at registration, used to revoke one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle {
    channel: i32,
    id: u64,
}

impl ListenerHandle {
    pub fn channel(&self) -> i32 {
        self.channel
    }
}

#[derive(Clone)]
struct RegisteredListener {
    id: u64,
    listener: Arc<dyn PacketListener>,
    owner: Option<ModuleToken>,
}

pub struct PacketListenerRegistry {
    parent: Option<Arc<PacketListenerRegistry>>,
    listeners: RwLock<HashMap<i32, Vec<RegisteredListener>>>,
    next_id: AtomicU64,
}

impl PacketListenerRegistry {
    pub fn new() -> Self {
        Self {
            parent: None,
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// A registry whose dispatch consults `parent` before its own listeners.
    pub fn with_parent(parent: Arc<PacketListenerRegistry>) -> Self {
        Self {
            parent: Some(parent),
            ..Self::new()
        }
    }

    pub fn parent(&self) -> Option<&Arc<PacketListenerRegistry>> {
        self.parent.as_ref()
    }

    pub fn add_listener(
        &self,
        channel: i32,
        listener: Arc<dyn PacketListener>,
        owner: Option<&ModuleToken>,
    ) -> ListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .entry(channel)
            .or_default()
            .push(RegisteredListener {
                id,
                listener,
                owner: owner.cloned(),
            });
        debug!(channel, listener_id = id, "Registered packet listener");
        ListenerHandle { channel, id }
    }

    /// Returns true if the handle was still registered.
    pub fn remove_listener(&self, handle: ListenerHandle) -> bool {
        let mut listeners = self.listeners.write();
        let Some(entries) = listeners.get_mut(&handle.channel) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != handle.id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(&handle.channel);
        }
        removed
    }

    /// Remove every registration made on behalf of `owner`, across all
    /// channels. Returns the number of removed registrations.
    pub fn remove_listeners(&self, owner: &ModuleToken) -> usize {
        let removed = self.remove_listeners_where(|_, entry_owner| entry_owner == Some(owner));
        if removed > 0 {
            debug!(module = %owner, removed, "Removed packet listeners of module");
        }
        removed
    }

    /// Remove every registration the predicate selects. The predicate sees
    /// the channel id and the owning module of each registration.
    pub fn remove_listeners_where<P>(&self, mut predicate: P) -> usize
    where
        P: FnMut(i32, Option<&ModuleToken>) -> bool,
    {
        let mut listeners = self.listeners.write();
        let mut removed = 0;
        listeners.retain(|channel, entries| {
            let before = entries.len();
            entries.retain(|entry| !predicate(*channel, entry.owner.as_ref()));
            removed += before - entries.len();
            !entries.is_empty()
        });
        removed
    }

    /// Drop all listeners of one channel.
    pub fn remove_channel(&self, channel: i32) -> usize {
        self.listeners
            .write()
            .remove(&channel)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    /// Whether this registry (not its parent) has listeners for `channel`.
    pub fn has_listeners(&self, channel: i32) -> bool {
        self.listeners.read().contains_key(&channel)
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().values().map(Vec::len).sum()
    }

    /// Dispatch `packet` to the parent chain, then to the local listeners of
    /// its channel, first-registered first-called.
    ///
    /// Returns whether any listener was invoked. A failing listener does not
    /// stop the remaining ones; all failures are logged and reported as one
    /// [`ProtocolError::ListenerFailures`].
    pub fn handle_packet(
        &self,
        channel: &Arc<NetworkChannel>,
        packet: &Packet,
    ) -> ProtocolResult<bool> {
        let mut failures = 0;
        let handled = self.dispatch(channel, packet, &mut failures);
        if failures > 0 {
            return Err(ProtocolError::ListenerFailures {
                channel: packet.channel(),
                count: failures,
            });
        }
        Ok(handled)
    }

    fn dispatch(
        &self,
        channel: &Arc<NetworkChannel>,
        packet: &Packet,
        failures: &mut usize,
    ) -> bool {
        let mut handled = match &self.parent {
            Some(parent) => parent.dispatch(channel, packet, failures),
            None => false,
        };

        // clone the list so listeners may (un)register while being called
        let entries = match self.listeners.read().get(&packet.channel()) {
            Some(entries) => entries.clone(),
            None => return handled,
        };

        for entry in entries {
            handled = true;
            if let Err(e) = entry.listener.handle(channel, packet) {
                *failures += 1;
                warn!(
                    channel = packet.channel(),
                    listener_id = entry.id,
                    network_channel = channel.id(),
                    "Packet listener failed: {:#}",
                    e
                );
            }
        }
        handled
    }
}

impl Default for PacketListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PacketListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketListenerRegistry")
            .field("listeners", &self.listener_count())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}
