use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

use crate::model::Id;

/// Notifications published by the core for UI and back-end observers.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    ContainerAdded(Id),
    ContainerRemoved(Id),
    ContainerMetadataChanged(Id),
    /// The composition of a stack changed (a slot was replaced).
    ContainersChanged(Id),
    PropertyChanged {
        key: String,
        property: String,
    },
    GlobalContainerChanged,
    ActiveMaterialChanged,
    ActiveVariantChanged,
    ActiveQualityChanged,
    ActiveIntentChanged,
    ExtrudersChanged(Id),
}

/// Channel names for filtered subscriptions; one per event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    ContainerAdded,
    ContainerRemoved,
    ContainerMetadataChanged,
    ContainersChanged,
    PropertyChanged,
    GlobalContainerChanged,
    ActiveMaterialChanged,
    ActiveVariantChanged,
    ActiveQualityChanged,
    ActiveIntentChanged,
    ExtrudersChanged,
}

impl Event {
    pub fn channel(&self) -> Channel {
        match self {
            Event::ContainerAdded(_) => Channel::ContainerAdded,
            Event::ContainerRemoved(_) => Channel::ContainerRemoved,
            Event::ContainerMetadataChanged(_) => Channel::ContainerMetadataChanged,
            Event::ContainersChanged(_) => Channel::ContainersChanged,
            Event::PropertyChanged { .. } => Channel::PropertyChanged,
            Event::GlobalContainerChanged => Channel::GlobalContainerChanged,
            Event::ActiveMaterialChanged => Channel::ActiveMaterialChanged,
            Event::ActiveVariantChanged => Channel::ActiveVariantChanged,
            Event::ActiveQualityChanged => Channel::ActiveQualityChanged,
            Event::ActiveIntentChanged => Channel::ActiveIntentChanged,
            Event::ExtrudersChanged(_) => Channel::ExtrudersChanged,
        }
    }
}

type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct PendingState {
    batch_depth: u32,
    queue: Vec<Event>,
}

/// Publish/subscribe bus with scoped batch compression.
///
/// Outside a batch, events are delivered synchronously in emission order.
/// Inside a batch, duplicate events collapse to one and delivery is
/// deferred until the outermost batch guard drops, so a transaction that
/// touches N slots produces one `ContainersChanged` per stack rather
/// than N.
#[derive(Default)]
pub struct SignalBus {
    subscribers: RwLock<Vec<(Option<Channel>, Subscriber)>>,
    pending: Mutex<PendingState>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribers.write().push((None, Arc::new(callback)));
    }

    pub fn subscribe_channel<F>(&self, channel: Channel, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .push((Some(channel), Arc::new(callback)));
    }

    pub fn emit(&self, event: Event) {
        {
            let mut pending = self.pending.lock();
            if pending.batch_depth > 0 {
                if !pending.queue.contains(&event) {
                    pending.queue.push(event);
                }
                return;
            }
        }
        self.deliver(&[event]);
    }

    /// Start a compression batch; ended when the guard drops. Batches nest.
    pub fn batch(&self) -> BatchGuard<'_> {
        self.pending.lock().batch_depth += 1;
        BatchGuard { bus: self }
    }

    fn end_batch(&self) {
        let flushed = {
            let mut pending = self.pending.lock();
            pending.batch_depth = pending.batch_depth.saturating_sub(1);
            if pending.batch_depth == 0 {
                std::mem::take(&mut pending.queue)
            } else {
                Vec::new()
            }
        };
        if !flushed.is_empty() {
            self.deliver(&flushed);
        }
    }

    fn deliver(&self, events: &[Event]) {
        // Snapshot so subscribers may emit or subscribe re-entrantly.
        let subscribers: Vec<(Option<Channel>, Subscriber)> =
            self.subscribers.read().clone();
        for event in events {
            for (channel, subscriber) in &subscribers {
                if channel.map_or(true, |c| c == event.channel()) {
                    subscriber(event);
                }
            }
        }
    }
}

/// RAII handle for a compression batch; guarantees the batch ends on all
/// exit paths.
pub struct BatchGuard<'a> {
    bus: &'a SignalBus,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        self.bus.end_batch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn events_deliver_synchronously_outside_batches() {
        let bus = SignalBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        bus.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(Event::GlobalContainerChanged);
        bus.emit(Event::ActiveMaterialChanged);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn batches_compress_duplicates() {
        let bus = SignalBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        bus.subscribe_channel(Channel::ContainersChanged, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        {
            let _guard = bus.batch();
            for _ in 0..5 {
                bus.emit(Event::ContainersChanged("stack_1".to_string()));
            }
            assert_eq!(count.load(Ordering::SeqCst), 0, "deferred until batch end");
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn nested_batches_flush_once_at_outermost_exit() {
        let bus = SignalBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        bus.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        {
            let _outer = bus.batch();
            {
                let _inner = bus.batch();
                bus.emit(Event::ActiveQualityChanged);
            }
            assert_eq!(count.load(Ordering::SeqCst), 0);
            bus.emit(Event::ActiveQualityChanged);
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn channel_filter_only_sees_matching_events() {
        let bus = SignalBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        bus.subscribe_channel(Channel::ActiveMaterialChanged, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        bus.emit(Event::ActiveQualityChanged);
        bus.emit(Event::ActiveMaterialChanged);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
