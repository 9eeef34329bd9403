use std::{
    collections::{hash_map::Entry, HashMap},
    hash::Hash,
    sync::{
        mpsc::{channel, Sender},
        Mutex,
    },
};

/// Collapses concurrent operations for the same key into a single execution.
///
/// The first caller for a key becomes the performer and runs the operation
/// with no lock held; callers arriving while it is in flight park a channel
/// sender and receive the performer's result. The table lock is never held
/// across the operation or while results are delivered.
pub(crate) struct SingleFlight<K, V> {
    inflight: Mutex<HashMap<K, Vec<Sender<V>>>>,
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> SingleFlight<K, V> {
        SingleFlight {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `operation` for `key`, or joins an execution already in flight
    /// and returns its result. Operations for distinct keys proceed
    /// independently.
    pub fn run<F>(&self, key: &K, operation: F) -> V
    where
        F: Fn() -> V,
    {
        loop {
            let waiter = {
                let mut inflight = self.inflight.lock().unwrap();
                match inflight.entry(key.clone()) {
                    Entry::Occupied(mut entry) => {
                        let (sender, receiver) = channel();
                        entry.get_mut().push(sender);
                        Some(receiver)
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(Vec::new());
                        None
                    }
                }
            };

            match waiter {
                Some(receiver) => match receiver.recv() {
                    Ok(value) => return value,
                    // The performer unwound without delivering a result;
                    // start over, possibly becoming the performer ourselves.
                    Err(_) => continue,
                },
                None => {
                    let mut guard = EntryGuard {
                        flight: self,
                        key,
                        armed: true,
                    };
                    let value = operation();
                    guard.armed = false;
                    drop(guard);

                    let waiters = {
                        let mut inflight = self.inflight.lock().unwrap();
                        inflight.remove(key).unwrap_or_default()
                    };
                    for waiter in waiters {
                        // A waiter that dropped its receiver abandoned the
                        // lookup; that is not an error.
                        let _ = waiter.send(value.clone());
                    }
                    return value;
                }
            }
        }
    }
}

/// Removes the in-flight entry if the performer unwinds, so parked waiters
/// observe a closed channel instead of blocking forever.
struct EntryGuard<'a, K: Eq + Hash, V> {
    flight: &'a SingleFlight<K, V>,
    key: &'a K,
    armed: bool,
}

impl<K: Eq + Hash, V> Drop for EntryGuard<'_, K, V> {
    fn drop(&mut self) {
        if self.armed {
            if let Ok(mut inflight) = self.flight.inflight.lock() {
                inflight.remove(self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Barrier,
        },
        thread,
        time::Duration,
    };

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn concurrent_callers_share_one_execution() {
        const CALLERS: usize = 16;

        let flight: SingleFlight<String, usize> = SingleFlight::new();
        let key = "key".to_string();
        let executions = AtomicUsize::new(0);
        let barrier = Barrier::new(CALLERS);

        thread::scope(|scope| {
            let handles: Vec<_> = (0..CALLERS)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        flight.run(&key, || {
                            let execution = executions.fetch_add(1, Ordering::SeqCst);
                            // Hold the slot until every other caller has
                            // parked, so all of them join this execution.
                            while flight
                                .inflight
                                .lock()
                                .unwrap()
                                .get(&key)
                                .map_or(0, Vec::len)
                                < CALLERS - 1
                            {
                                thread::yield_now();
                            }
                            execution
                        })
                    })
                })
                .collect();

            let results: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert!(results.iter().all(|&r| r == results[0]));
        });

        assert_eq!(executions.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sequential_calls_execute_again() {
        let flight: SingleFlight<String, usize> = SingleFlight::new();
        let executions = AtomicUsize::new(0);

        flight.run(&"key".to_string(), || {
            executions.fetch_add(1, Ordering::SeqCst)
        });
        flight.run(&"key".to_string(), || {
            executions.fetch_add(1, Ordering::SeqCst)
        });
        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn distinct_keys_do_not_coalesce() {
        let flight: SingleFlight<String, usize> = SingleFlight::new();
        let executions = AtomicUsize::new(0);
        let barrier = Barrier::new(2);

        thread::scope(|scope| {
            for key in ["one", "two"] {
                let flight = &flight;
                let executions = &executions;
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    flight.run(&key.to_string(), || {
                        thread::sleep(Duration::from_millis(20));
                        executions.fetch_add(1, Ordering::SeqCst)
                    });
                });
            }
        });

        assert_eq!(executions.load(Ordering::SeqCst), 2);
    }
}
