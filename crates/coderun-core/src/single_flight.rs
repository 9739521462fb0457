//! Per-fingerprint request coalescing
//!
//! The first caller to [`SingleFlight::join`] a key becomes the leader and
//! receives a [`FlightGuard`]; callers arriving while the flight is open
//! become followers and wait for whatever the leader publishes. The entry is
//! removed when the guard is dropped, published or not, so a leader that
//! disappears releases its followers with `None`.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;

type Slot<T> = Arc<watch::Sender<Option<T>>>;

pub struct SingleFlight<K, T> {
    flights: Arc<DashMap<K, Slot<T>>>,
}

impl<K, T> Clone for SingleFlight<K, T> {
    fn clone(&self) -> Self {
        Self {
            flights: Arc::clone(&self.flights),
        }
    }
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

pub enum Flight<K: Eq + Hash + Clone, T: Clone> {
    Leader(FlightGuard<K, T>),
    Follower(FlightWaiter<T>),
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    pub fn new() -> Self {
        Self {
            flights: Arc::new(DashMap::new()),
        }
    }

    pub fn join(&self, key: K) -> Flight<K, T> {
        match self.flights.entry(key.clone()) {
            Entry::Occupied(entry) => Flight::Follower(FlightWaiter {
                rx: entry.get().subscribe(),
            }),
            Entry::Vacant(entry) => {
                let (tx, _) = watch::channel(None);
                let slot = Arc::new(tx);
                entry.insert(Arc::clone(&slot));
                Flight::Leader(FlightGuard {
                    flights: Arc::clone(&self.flights),
                    key,
                    slot,
                })
            }
        }
    }

    /// Number of open flights
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }
}

/// Held by the leader for the lifetime of its flight
pub struct FlightGuard<K: Eq + Hash + Clone, T: Clone> {
    flights: Arc<DashMap<K, Slot<T>>>,
    key: K,
    slot: Slot<T>,
}

impl<K: Eq + Hash + Clone, T: Clone> FlightGuard<K, T> {
    /// Hand `value` to every follower and close the flight
    pub fn complete(self, value: T) {
        self.slot.send_replace(Some(value));
    }
}

impl<K: Eq + Hash + Clone, T: Clone> Drop for FlightGuard<K, T> {
    fn drop(&mut self) {
        let slot = &self.slot;
        self.flights
            .remove_if(&self.key, |_, current| Arc::ptr_eq(current, slot));
    }
}

pub struct FlightWaiter<T> {
    rx: watch::Receiver<Option<T>>,
}

impl<T: Clone> FlightWaiter<T> {
    /// The leader's value, or `None` if it went away without publishing
    pub async fn wait(mut self) -> Option<T> {
        let published = match self.rx.wait_for(|value| value.is_some()).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        published
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn leader<T: Clone>(flight: Flight<u32, T>) -> FlightGuard<u32, T> {
        match flight {
            Flight::Leader(guard) => guard,
            Flight::Follower(_) => panic!("expected leader"),
        }
    }

    fn follower<T: Clone>(flight: Flight<u32, T>) -> FlightWaiter<T> {
        match flight {
            Flight::Follower(waiter) => waiter,
            Flight::Leader(_) => panic!("expected follower"),
        }
    }

    #[tokio::test]
    async fn test_followers_receive_leader_value() {
        let flights: SingleFlight<u32, String> = SingleFlight::new();
        let guard = leader(flights.join(7));
        let a = follower(flights.join(7));
        let b = follower(flights.join(7));
        assert_eq!(flights.in_flight(), 1);

        let waiting = tokio::spawn(async move { (a.wait().await, b.wait().await) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        guard.complete("done".into());

        let (a, b) = waiting.await.unwrap();
        assert_eq!(a.as_deref(), Some("done"));
        assert_eq!(b.as_deref(), Some("done"));
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_abandoned_flight_releases_followers() {
        let flights: SingleFlight<u32, u32> = SingleFlight::new();
        let guard = leader(flights.join(1));
        let waiter = follower(flights.join(1));
        drop(guard);
        assert_eq!(waiter.wait().await, None);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_late_subscriber_still_sees_value() {
        let flights: SingleFlight<u32, u32> = SingleFlight::new();
        let guard = leader(flights.join(1));
        let waiter = follower(flights.join(1));
        guard.complete(42);
        assert_eq!(waiter.wait().await, Some(42));
    }

    #[test]
    fn test_keys_are_independent() {
        let flights: SingleFlight<u32, u32> = SingleFlight::new();
        let _a = leader(flights.join(1));
        let _b = leader(flights.join(2));
        assert_eq!(flights.in_flight(), 2);
    }

    #[test]
    fn test_new_leader_after_completion() {
        let flights: SingleFlight<u32, u32> = SingleFlight::new();
        leader(flights.join(1)).complete(1);
        let _again = leader(flights.join(1));
        assert_eq!(flights.in_flight(), 1);
    }
}
