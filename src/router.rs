use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;

/// What a shell session reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Ready,
    Output(String),
    Error(String),
    Exit {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

/// An event tagged with the session generation it originated from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    pub generation: u64,
    pub kind: EventKind,
}

impl OutputEvent {
    pub fn new(generation: u64, kind: EventKind) -> Self {
        Self { generation, kind }
    }
}

/// Receives events from the router. Errors are logged, never propagated to the publisher.
pub trait Subscriber: Send + Sync {
    fn on_event(&self, event: &OutputEvent) -> Result<()>;
}

impl<F> Subscriber for F
where
    F: Fn(&OutputEvent) -> Result<()> + Send + Sync,
{
    fn on_event(&self, event: &OutputEvent) -> Result<()> {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Slot {
    id: SubscriptionId,
    // None once unsubscribed; delivery holds this lock for the duration of the callback
    listener: Mutex<Option<Arc<dyn Subscriber>>>,
}

/// Broadcasts session events to every registered subscriber.
///
/// Publishing is serialized, so all subscribers see the same order. Subscribers must
/// not block, and must not unsubscribe themselves from inside `on_event`.
pub struct OutputRouter {
    next_id: AtomicU64,
    slots: Mutex<Vec<Arc<Slot>>>,
    publish_lock: Mutex<()>,
}

impl Default for OutputRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputRouter {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            slots: Mutex::new(Vec::new()),
            publish_lock: Mutex::new(()),
        }
    }

    pub fn subscribe(&self, listener: impl Subscriber + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let listener: Arc<dyn Subscriber> = Arc::new(listener);
        let slot = Arc::new(Slot {
            id,
            listener: Mutex::new(Some(listener)),
        });
        lock(&self.slots).push(slot);
        id
    }

    /// Once this returns, the listener receives nothing more. A delivery already
    /// running for this listener is waited out.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let slot = {
            let mut slots = lock(&self.slots);
            let Some(pos) = slots.iter().position(|s| s.id == id) else {
                return false;
            };
            slots.remove(pos)
        };
        let removed = lock(&slot.listener).take().is_some();
        removed
    }

    pub fn publish(&self, event: OutputEvent) {
        let _order = lock(&self.publish_lock);
        let snapshot: Vec<Arc<Slot>> = lock(&self.slots).clone();

        for slot in snapshot {
            let guard = lock(&slot.listener);
            let Some(listener) = guard.as_ref() else {
                continue;
            };
            match panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(subscriber = slot.id.0, "Subscriber failed: {:#}", e);
                }
                Err(_) => {
                    tracing::error!(subscriber = slot.id.0, "Subscriber panicked during delivery");
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Tracks the newest generation seen and rejects events from older ones
#[derive(Debug, Default)]
pub struct GenerationFilter {
    latest: u64,
}

impl GenerationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false for events from a superseded generation
    pub fn admit(&mut self, event: &OutputEvent) -> bool {
        if event.generation < self.latest {
            tracing::debug!(
                generation = event.generation,
                latest = self.latest,
                "Discarding stale event"
            );
            return false;
        }
        self.latest = event.generation;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn recorder() -> (Arc<Mutex<Vec<OutputEvent>>>, impl Subscriber + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let listener = move |event: &OutputEvent| -> Result<()> {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        };
        (seen, listener)
    }

    fn output(generation: u64, text: &str) -> OutputEvent {
        OutputEvent::new(generation, EventKind::Output(text.to_string()))
    }

    #[test]
    fn test_publish_preserves_order_for_every_subscriber() {
        let router = OutputRouter::new();
        let (first, l1) = recorder();
        let (second, l2) = recorder();
        router.subscribe(l1);
        router.subscribe(l2);

        let events = vec![
            OutputEvent::new(1, EventKind::Ready),
            output(1, "a"),
            OutputEvent::new(1, EventKind::Error("b".into())),
            output(1, "c"),
        ];
        for event in events.clone() {
            router.publish(event);
        }

        assert_eq!(*first.lock().unwrap(), events);
        assert_eq!(*second.lock().unwrap(), events);
    }

    #[test]
    fn test_failing_subscribers_do_not_block_others() {
        let router = OutputRouter::new();
        router.subscribe(|_: &OutputEvent| -> Result<()> { anyhow::bail!("display went away") });
        router.subscribe(|_: &OutputEvent| -> Result<()> { panic!("listener bug") });
        let (seen, listener) = recorder();
        router.subscribe(listener);

        router.publish(output(1, "one"));
        router.publish(output(1, "two"));

        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let router = OutputRouter::new();
        let (seen, listener) = recorder();
        let id = router.subscribe(listener);

        router.publish(output(1, "before"));
        assert!(router.unsubscribe(id));
        assert!(!router.unsubscribe(id));
        router.publish(output(1, "after"));

        assert_eq!(*seen.lock().unwrap(), vec![output(1, "before")]);
    }

    #[test]
    fn test_unsubscribe_during_concurrent_publish() {
        let router = Arc::new(OutputRouter::new());
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let id = router.subscribe(move |_: &OutputEvent| -> Result<()> {
            thread::sleep(Duration::from_millis(1));
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let publisher = {
            let router = router.clone();
            thread::spawn(move || {
                for i in 0..200 {
                    router.publish(output(1, &i.to_string()));
                }
            })
        };

        thread::sleep(Duration::from_millis(20));
        router.unsubscribe(id);
        let at_unsubscribe = count.load(Ordering::SeqCst);
        publisher.join().unwrap();

        assert_eq!(count.load(Ordering::SeqCst), at_unsubscribe);
    }

    #[test]
    fn test_generation_filter_drops_stale_output() {
        let mut filter = GenerationFilter::new();
        let stream = [
            OutputEvent::new(1, EventKind::Ready),
            output(1, "old"),
            OutputEvent::new(2, EventKind::Ready),
            output(1, "stale"),
            output(2, "fresh"),
        ];

        let admitted: Vec<_> = stream.iter().filter(|e| filter.admit(e)).cloned().collect();

        assert_eq!(
            admitted,
            vec![
                OutputEvent::new(1, EventKind::Ready),
                output(1, "old"),
                OutputEvent::new(2, EventKind::Ready),
                output(2, "fresh"),
            ]
        );
    }
}
