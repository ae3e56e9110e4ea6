//! Event manager
//!
//! Listeners are stored per event type in a table that is "baked" on
//! registration: the new entry is appended and the list is re-sorted by tier
//! under the write lock. Dispatch only takes the read lock long enough to clone
//! the matching entries, then invokes them on the calling thread.

use std::{
    any::{type_name, Any, TypeId},
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::{ReentrantMutex, RwLock};
use tracing::{debug, warn};

use crate::{
    error::{EventError, EventResult, ListenerFailure},
    module::ModuleToken,
};

/// Channel wildcard. A listener on `*` receives events published on any
/// channel, and an event published on `*` reaches listeners of every channel.
pub const ANY_CHANNEL: &str = "*";

/// Invocation tier of a listener. Lower tiers run earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum EventPriority {
    First,
    High,
    #[default]
    Normal,
    Low,
    Last,
    /// Observes the final state; should not mutate the event.
    Monitor,
}

type ErasedHandler = dyn Fn(&mut dyn Any) -> anyhow::Result<()> + Send + Sync;

#[derive(Clone)]
struct RegisteredEventListener {
    id: u64,
    channel: String,
    priority: EventPriority,
    owner: Option<ModuleToken>,
    handler: Arc<ErasedHandler>,
    // held while the handler runs so one listener is never entered by two
    // threads at once (re-entry from the same thread is fine)
    invocation: Arc<ReentrantMutex<()>>,
}

impl RegisteredEventListener {
    fn matches(&self, channel: &str) -> bool {
        self.channel == ANY_CHANNEL || channel == ANY_CHANNEL || self.channel == channel
    }
}

impl fmt::Debug for RegisteredEventListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredEventListener")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("priority", &self.priority)
            .field("owner", &self.owner)
            .finish()
    }
}

/// Handle returned by a registration; revokes exactly that registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventListenerHandle {
    id: u64,
    event: TypeId,
}

impl EventListenerHandle {
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Registration options: channel filter, tier and owning module.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    channel: String,
    priority: EventPriority,
    owner: Option<ModuleToken>,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            channel: ANY_CHANNEL.to_string(),
            priority: EventPriority::Normal,
            owner: None,
        }
    }
}

impl ListenerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn owner(mut self, owner: &ModuleToken) -> Self {
        self.owner = Some(owner.clone());
        self
    }
}

/// Synchronous, in-process event bus.
#[derive(Debug, Default)]
pub struct EventManager {
    listeners: RwLock<HashMap<TypeId, Vec<RegisteredEventListener>>>,
    next_id: AtomicU64,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener on every channel at [`EventPriority::Normal`].
    pub fn register_listener<E, F>(&self, handler: F) -> EventListenerHandle
    where
        E: Any,
        F: Fn(&mut E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register_listener_with(ListenerOptions::default(), handler)
    }

    pub fn register_listener_with<E, F>(
        &self,
        options: ListenerOptions,
        handler: F,
    ) -> EventListenerHandle
    where
        E: Any,
        F: Fn(&mut E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let event = TypeId::of::<E>();
        let erased: Arc<ErasedHandler> =
            Arc::new(move |event: &mut dyn Any| match event.downcast_mut::<E>() {
                Some(event) => handler(event),
                None => Ok(()),
            });

        let entry = RegisteredEventListener {
            id,
            channel: options.channel,
            priority: options.priority,
            owner: options.owner,
            handler: erased,
            invocation: Arc::new(ReentrantMutex::new(())),
        };
        debug!(
            listener = id,
            event = type_name::<E>(),
            channel = %entry.channel,
            priority = ?entry.priority,
            "Registering event listener"
        );

        let mut listeners = self.listeners.write();
        let list = listeners.entry(event).or_default();
        list.push(entry);
        // stable: equal tiers keep registration order
        list.sort_by_key(|listener| listener.priority);

        EventListenerHandle { id, event }
    }

    /// Remove a single registration. Returns false if it was already gone.
    pub fn unregister_listener(&self, handle: EventListenerHandle) -> bool {
        let mut listeners = self.listeners.write();
        let Some(list) = listeners.get_mut(&handle.event) else {
            return false;
        };
        let before = list.len();
        list.retain(|listener| listener.id != handle.id);
        let removed = list.len() != before;
        if list.is_empty() {
            listeners.remove(&handle.event);
        }
        removed
    }

    /// Remove every registration owned by `owner`, across all event types.
    pub fn unregister_listeners(&self, owner: &ModuleToken) -> usize {
        let mut removed = 0;
        let mut listeners = self.listeners.write();
        listeners.retain(|_, list| {
            let before = list.len();
            list.retain(|listener| listener.owner.as_ref() != Some(owner));
            removed += before - list.len();
            !list.is_empty()
        });
        if removed > 0 {
            debug!(module = %owner, removed, "Unregistered event listeners of module");
        }
        removed
    }

    /// Remove every registration for the event type `E`.
    pub fn unregister_listeners_of<E: Any>(&self) -> usize {
        self.listeners
            .write()
            .remove(&TypeId::of::<E>())
            .map(|list| list.len())
            .unwrap_or(0)
    }

    pub fn listener_count<E: Any>(&self) -> usize {
        self.listeners
            .read()
            .get(&TypeId::of::<E>())
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn has_listeners<E: Any>(&self) -> bool {
        self.listener_count::<E>() > 0
    }

    /// Publish `event` on the wildcard channel.
    pub fn call_event<E: Any>(&self, event: &mut E) -> EventResult<()> {
        self.call_event_on(ANY_CHANNEL, event)
    }

    /// Publish `event` on `channel`.
    ///
    /// Every matching listener runs in tier order on the calling thread. A
    /// failing listener does not stop the ones after it; all failures are
    /// returned together once dispatch finished.
    pub fn call_event_on<E: Any>(&self, channel: &str, event: &mut E) -> EventResult<()> {
        let targets: Vec<RegisteredEventListener> = {
            let listeners = self.listeners.read();
            match listeners.get(&TypeId::of::<E>()) {
                Some(list) => list
                    .iter()
                    .filter(|listener| listener.matches(channel))
                    .cloned()
                    .collect(),
                None => return Ok(()),
            }
        };

        let mut failures = Vec::new();
        for listener in targets {
            let result = {
                let _invocation = listener.invocation.lock();
                (listener.handler)(event as &mut dyn Any)
            };
            if let Err(error) = result {
                warn!(
                    listener = listener.id,
                    event = type_name::<E>(),
                    channel,
                    "Event listener failed: {:#}",
                    error
                );
                failures.push(ListenerFailure {
                    listener_id: listener.id,
                    channel: listener.channel.clone(),
                    priority: listener.priority,
                    error,
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(EventError::ListenerFailures {
                event: type_name::<E>(),
                failures,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{atomic::AtomicUsize, Mutex},
        thread,
        time::Duration,
    };

    use super::*;

    #[derive(Debug, Default)]
    struct Ping {
        trail: Vec<&'static str>,
    }

    struct Other;

    #[test]
    fn test_lower_tiers_run_first() {
        let manager = EventManager::new();
        manager.register_listener_with(
            ListenerOptions::new().priority(EventPriority::Monitor),
            |event: &mut Ping| {
                event.trail.push("monitor");
                Ok(())
            },
        );
        manager.register_listener_with(
            ListenerOptions::new().priority(EventPriority::First),
            |event: &mut Ping| {
                event.trail.push("first");
                Ok(())
            },
        );
        manager.register_listener(|event: &mut Ping| {
            event.trail.push("normal");
            Ok(())
        });

        let mut event = Ping::default();
        manager.call_event(&mut event).unwrap();
        assert_eq!(event.trail, vec!["first", "normal", "monitor"]);
    }

    #[test]
    fn test_same_tier_keeps_registration_order() {
        let manager = EventManager::new();
        for name in ["a", "b", "c"] {
            manager.register_listener(move |event: &mut Ping| {
                event.trail.push(name);
                Ok(())
            });
        }
        let mut event = Ping::default();
        manager.call_event(&mut event).unwrap();
        assert_eq!(event.trail, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_channel_filtering() {
        let manager = EventManager::new();
        manager.register_listener_with(ListenerOptions::new().channel("nodes"), |e: &mut Ping| {
            e.trail.push("nodes");
            Ok(())
        });
        manager.register_listener_with(
            ListenerOptions::new().channel("services"),
            |e: &mut Ping| {
                e.trail.push("services");
                Ok(())
            },
        );
        manager.register_listener(|e: &mut Ping| {
            e.trail.push("any");
            Ok(())
        });

        let mut event = Ping::default();
        manager.call_event_on("nodes", &mut event).unwrap();
        assert_eq!(event.trail, vec!["nodes", "any"]);

        let mut event = Ping::default();
        manager.call_event(&mut event).unwrap();
        assert_eq!(event.trail.len(), 3);
    }

    #[test]
    fn test_failures_are_aggregated_and_dispatch_continues() {
        let manager = EventManager::new();
        manager.register_listener(|_: &mut Ping| Err(anyhow::anyhow!("first broke")));
        manager.register_listener(|e: &mut Ping| {
            e.trail.push("still ran");
            Ok(())
        });
        manager.register_listener_with(
            ListenerOptions::new().priority(EventPriority::Last),
            |_: &mut Ping| Err(anyhow::anyhow!("last broke")),
        );

        let mut event = Ping::default();
        let err = manager.call_event(&mut event).unwrap_err();
        assert_eq!(event.trail, vec!["still ran"]);
        assert_eq!(err.failures().len(), 2);
        assert_eq!(err.failures()[0].priority, EventPriority::Normal);
        assert_eq!(err.failures()[1].priority, EventPriority::Last);
        assert!(err.to_string().contains("2 listener(s) failed"));
    }

    #[test]
    fn test_event_types_are_isolated() {
        let manager = EventManager::new();
        let hits = Arc::new(Mutex::new(0));
        let counter = hits.clone();
        manager.register_listener(move |_: &mut Other| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        manager.call_event(&mut Ping::default()).unwrap();
        assert_eq!(*hits.lock().unwrap(), 0);
        manager.call_event(&mut Other).unwrap();
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn test_unregister_by_handle_and_owner() {
        let manager = EventManager::new();
        let module = ModuleToken::new("signs");
        let handle = manager.register_listener(|_: &mut Ping| Ok(()));
        manager.register_listener_with(ListenerOptions::new().owner(&module), |_: &mut Ping| Ok(()));
        manager.register_listener_with(ListenerOptions::new().owner(&module), |_: &mut Other| Ok(()));
        assert_eq!(manager.listener_count::<Ping>(), 2);

        assert!(manager.unregister_listener(handle));
        assert!(!manager.unregister_listener(handle));
        assert_eq!(manager.unregister_listeners(&module), 2);
        assert!(!manager.has_listeners::<Ping>());
        assert!(!manager.has_listeners::<Other>());
    }

    #[test]
    fn test_reentrant_dispatch_does_not_deadlock() {
        let manager = Arc::new(EventManager::new());
        let inner = manager.clone();
        manager.register_listener(move |event: &mut Ping| {
            event.trail.push("outer");
            if event.trail.len() == 1 {
                inner.call_event(event)?;
            }
            Ok(())
        });

        let mut event = Ping::default();
        manager.call_event(&mut event).unwrap();
        assert_eq!(event.trail, vec!["outer", "outer"]);
    }

    #[test]
    fn test_listener_never_runs_concurrently_with_itself() {
        let manager = EventManager::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let (in_flight, max_in_flight, calls) =
                (in_flight.clone(), max_in_flight.clone(), calls.clone());
            manager.register_listener(move |_: &mut Ping| {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_flight.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
                calls.fetch_add(1, Ordering::SeqCst);
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            });
        }

        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        manager.call_event(&mut Ping::default()).unwrap();
                    }
                });
            }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 100);
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }
}
