//! Change notification for record tables and the outbox.
//!
//! Delivery is at-least-once and never coalesced on purpose: a burst of
//! writes may produce one event per write. Observers should re-read the
//! current state instead of trusting the event contents.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use hashbrown::HashMap;
use tokio::sync::broadcast;
use tracing::trace;

/// Pseudo table name notified whenever the pending outbox changes.
pub const OUTBOX_TABLE: &str = "outbox";

const EVENT_CAPACITY: usize = 1024;

/// Where a committed change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A direct local write.
    Local,
    /// Data applied from the remote side.
    Remote,
    /// Outbox rows removed after an acknowledged upload.
    Upload,
}

/// One committed change affecting one or more tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Affected tables, deduplicated, in first-seen order.
    pub tables: Vec<String>,
    /// Source of the change.
    pub origin: ChangeOrigin,
}

impl ChangeEvent {
    /// True if `table` is among the affected tables.
    pub fn touches(&self, table: &str) -> bool {
        self.tables.iter().any(|t| t == table)
    }
}

/// Table selection for [`ChangeNotifier::on_tables`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableFilter {
    /// Every table, including [`OUTBOX_TABLE`].
    All,
    /// Only the listed tables.
    Tables(Vec<String>),
}

impl TableFilter {
    /// Filter for the given table names.
    pub fn tables<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Tables(tables.into_iter().map(Into::into).collect())
    }

    /// True if `table` passes the filter.
    pub fn matches(&self, table: &str) -> bool {
        match self {
            Self::All => true,
            Self::Tables(tables) => tables.iter().any(|t| t == table),
        }
    }
}

type Predicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;
type Callback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

struct Listener {
    predicate: Predicate,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: HashMap<u64, Listener>,
}

/// Fan-out of committed changes to callbacks and broadcast receivers.
#[derive(Clone)]
pub struct ChangeNotifier {
    registry: Arc<Mutex<Registry>>,
    events_tx: broadcast::Sender<ChangeEvent>,
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier {
    /// Creates a notifier with no listeners.
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            events_tx,
        }
    }

    /// Registers `callback` for changes where `predicate` accepts any affected table.
    ///
    /// The callback runs on the thread that committed the change. Dropping
    /// the returned [`Subscription`] unsubscribes.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<P, F>(&self, predicate: P, callback: F) -> Subscription
    where
        P: Fn(&str) -> bool + Send + Sync + 'static,
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.insert(
            id,
            Listener {
                predicate: Arc::new(predicate),
                callback: Arc::new(callback),
            },
        );
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Registers `callback` for changes touching any table in `filter`.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn on_tables<F>(&self, filter: TableFilter, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.subscribe(move |table| filter.matches(table), callback)
    }

    /// Broadcast stream of every change event.
    pub fn events(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events_tx.subscribe()
    }

    /// Publishes one committed change.
    pub fn notify<I, S>(&self, origin: ChangeOrigin, tables: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for table in tables {
            let table = table.into();
            if !unique.contains(&table) {
                unique.push(table);
            }
        }
        if unique.is_empty() {
            return;
        }

        let event = ChangeEvent {
            tables: unique,
            origin,
        };

        // Callbacks run outside the lock so they may subscribe or unsubscribe.
        let matching: Vec<Callback> = {
            let registry = lock(&self.registry);
            registry
                .listeners
                .values()
                .filter(|l| event.tables.iter().any(|t| (l.predicate)(t)))
                .map(|l| Arc::clone(&l.callback))
                .collect()
        };

        trace!(tables = ?event.tables, origin = ?event.origin, listeners = matching.len(), "change notified");
        for callback in matching {
            callback(&event);
        }
        let _ = self.events_tx.send(event);
    }

    /// Number of live callback subscriptions.
    pub fn listener_count(&self) -> usize {
        lock(&self.registry).listeners.len()
    }
}

/// Handle returned by [`ChangeNotifier::subscribe`]; unsubscribes on drop.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Removes the listener now.
    pub fn unsubscribe(self) {}

    /// Keeps the listener for the notifier's whole lifetime.
    pub fn detach(mut self) {
        self.registry = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).listeners.remove(&self.id);
        }
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn filter_and_unsubscribe() {
        let notifier = ChangeNotifier::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let sub = notifier.on_tables(TableFilter::tables(["customers"]), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        notifier.notify(ChangeOrigin::Local, ["orders"]);
        notifier.notify(ChangeOrigin::Local, ["customers", OUTBOX_TABLE]);
        notifier.notify(ChangeOrigin::Remote, ["customers"]);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        sub.unsubscribe();
        assert_eq!(notifier.listener_count(), 0);
        notifier.notify(ChangeOrigin::Local, ["customers"]);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn callback_can_reenter_notifier() {
        let notifier = ChangeNotifier::new();
        let inner = notifier.clone();
        let sub = notifier.subscribe(|_| true, move |_| {
            let _ = inner.listener_count();
        });
        notifier.notify(ChangeOrigin::Local, ["a", "a", "b"]);
        sub.detach();
        assert_eq!(notifier.listener_count(), 1);
    }
}
