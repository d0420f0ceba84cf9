use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, ThreadId};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Registry<T> {
    next_id: u64,
    entries: Vec<(u64, Listener<T>)>,
}

/// Ordered set of listeners. Fan-out iterates over a snapshot, so a listener
/// may unsubscribe itself (or another) mid-notification.
pub(crate) struct ListenerSet<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> ListenerSet<T> {
    pub(crate) fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    pub(crate) fn add(&self, listener: Listener<T>) -> Subscription {
        let id = {
            let mut registry = lock(&self.registry);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.entries.push((id, listener));
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    lock(&registry).entries.retain(|(entry_id, _)| *entry_id != id);
                }
            })),
        }
    }

    pub(crate) fn notify(&self, value: &T) {
        let snapshot: Vec<Listener<T>> = lock(&self.registry)
            .entries
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in snapshot {
            listener(value);
        }
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.registry).entries.len()
    }
}

/// Handle returned by `subscribe`. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

struct State<T> {
    current: T,
    /// Values published but not yet fanned out, in publish order.
    backlog: VecDeque<T>,
}

/// Marks the calling thread as the one fanning out until dropped.
struct Delivering<'a>(&'a Mutex<Option<ThreadId>>);

impl<'a> Delivering<'a> {
    fn claim(owner: &'a Mutex<Option<ThreadId>>) -> Self {
        *lock(owner) = Some(thread::current().id());
        Self(owner)
    }
}

impl Drop for Delivering<'_> {
    fn drop(&mut self) {
        *lock(self.0) = None;
    }
}

/// Observable value with synchronous fan-out.
///
/// New subscribers get the current value immediately; every later change is
/// delivered to all subscribers in registration order, and every subscriber
/// sees the same sequence. A listener may publish to the broadcaster that is
/// calling it: the new value is delivered once the current round finishes.
pub struct Broadcaster<T> {
    state: Mutex<State<T>>,
    listeners: ListenerSet<T>,
    fanout: Mutex<()>,
    delivering: Mutex<Option<ThreadId>>,
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    pub fn new(initial: T) -> Self {
        Self {
            state: Mutex::new(State {
                current: initial,
                backlog: VecDeque::new(),
            }),
            listeners: ListenerSet::new(),
            fanout: Mutex::new(()),
            delivering: Mutex::new(None),
        }
    }

    pub fn current(&self) -> T {
        lock(&self.state).current.clone()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let listener: Listener<T> = Arc::new(listener);
        if self.delivering_here() {
            listener(&self.current());
            return self.listeners.add(listener);
        }

        let _fanout = lock(&self.fanout);
        let _delivering = Delivering::claim(&self.delivering);
        self.flush();
        listener(&self.current());
        let subscription = self.listeners.add(listener);
        self.flush();
        subscription
    }

    pub fn publish(&self, value: T) {
        self.update(|current| *current = value);
    }

    /// Mutate the value in place and fan the result out. Returns the new value.
    pub fn update<F>(&self, mutate: F) -> T
    where
        F: FnOnce(&mut T),
    {
        let value = {
            let mut state = lock(&self.state);
            mutate(&mut state.current);
            let value = state.current.clone();
            state.backlog.push_back(value.clone());
            value
        };
        if self.delivering_here() {
            return value;
        }

        let _fanout = lock(&self.fanout);
        let _delivering = Delivering::claim(&self.delivering);
        self.flush();
        value
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners.len()
    }

    fn delivering_here(&self) -> bool {
        *lock(&self.delivering) == Some(thread::current().id())
    }

    fn flush(&self) {
        loop {
            let next = lock(&self.state).backlog.pop_front();
            let Some(value) = next else {
                return;
            };
            self.listeners.notify(&value);
        }
    }
}

impl<T: Clone + Send + Default + 'static> Default for Broadcaster<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_delivers_current_value_first() {
        let b = Broadcaster::new(7u32);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = b.subscribe(move |v| sink.lock().unwrap().push(*v));
        b.publish(8);
        assert_eq!(*seen.lock().unwrap(), vec![7, 8]);
    }

    #[test]
    fn fanout_follows_registration_order() {
        let b = Broadcaster::new(0u32);
        let log = Arc::new(Mutex::new(Vec::new()));
        let subs: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|name| {
                let log = Arc::clone(&log);
                b.subscribe(move |v| log.lock().unwrap().push(format!("{name}{v}")))
            })
            .collect();
        log.lock().unwrap().clear();

        b.publish(1);
        assert_eq!(*log.lock().unwrap(), vec!["a1", "b1", "c1"]);
        drop(subs);
    }

    #[test]
    fn dropping_subscription_stops_delivery() {
        let b = Broadcaster::new(0u32);
        let count = Arc::new(Mutex::new(0));
        let c = Arc::clone(&count);
        let sub = b.subscribe(move |_| *c.lock().unwrap() += 1);
        b.publish(1);
        sub.unsubscribe();
        b.publish(2);
        assert_eq!(*count.lock().unwrap(), 2);
        assert_eq!(b.subscriber_count(), 0);
    }

    #[test]
    fn unsubscribing_during_fanout_does_not_skip_others() {
        let b = Broadcaster::new(0u32);
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let slot_in = Arc::clone(&slot);
        let first = b.subscribe(move |v| {
            if *v == 1 {
                slot_in.lock().unwrap().take();
            }
        });
        let hits = Arc::new(Mutex::new(Vec::new()));
        let h = Arc::clone(&hits);
        let second = b.subscribe(move |v| h.lock().unwrap().push(*v));
        *slot.lock().unwrap() = Some(second);

        b.publish(1);
        assert_eq!(*hits.lock().unwrap(), vec![0, 1]);
        b.publish(2);
        assert_eq!(*hits.lock().unwrap(), vec![0, 1]);
        drop(first);
    }

    #[test]
    fn listener_may_publish_to_its_own_broadcaster() {
        let b = Arc::new(Broadcaster::new(0u32));
        let weak = Arc::downgrade(&b);
        let first = b.subscribe(move |v| {
            if *v == 1 {
                if let Some(b) = weak.upgrade() {
                    assert_eq!(b.update(|v| *v += 1), 2);
                }
            }
        });
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let second = b.subscribe(move |v| sink.lock().unwrap().push(*v));

        b.publish(1);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(b.current(), 2);
        drop((first, second));
    }

    #[test]
    fn concurrent_publishers_deliver_every_value_once() {
        let b = Arc::new(Broadcaster::new(0u32));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = b.subscribe(move |v| sink.lock().unwrap().push(*v));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let b = Arc::clone(&b);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        b.update(|v| *v += 1);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..=200).collect::<Vec<u32>>());
    }

    #[test]
    fn update_returns_new_value() {
        let b = Broadcaster::new(vec![1u8]);
        let v = b.update(|v| v.push(2));
        assert_eq!(v, vec![1, 2]);
        assert_eq!(b.current(), vec![1, 2]);
    }
}
