use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::include::FetchError;

pub(crate) type FlightResult = Result<Bytes, FetchError>;

/// Table of per-key in-flight fetches.
///
/// The first caller to reach a key becomes the leader and runs the fetch;
/// every later caller arriving before the leader completes becomes a waiter
/// and observes the leader's result. A record exists in the table only
/// while its fetch is in flight.
#[derive(Default)]
pub(crate) struct FlightTable {
    flights: Mutex<HashMap<String, Arc<Flight>>>,
}

/// Shared record for one in-flight key. Waiters block on `done`; the result
/// slot is written exactly once, before the latch fires.
pub(crate) struct Flight {
    done: watch::Receiver<bool>,
    result: Mutex<Option<FlightResult>>,
}

impl Flight {
    /// Block until the leader completes, then return its stored result.
    /// A leader that vanished without completing counts as an abandoned
    /// fetch.
    pub(crate) async fn wait(&self) -> FlightResult {
        let mut done = self.done.clone();
        loop {
            if *done.borrow_and_update() {
                break;
            }
            if done.changed().await.is_err() {
                // Leader dropped its sender without completing.
                break;
            }
        }
        self.result
            .lock()
            .clone()
            .unwrap_or(Err(FetchError::Abandoned))
    }
}

/// Outcome of trying to install an in-flight record for a key.
pub(crate) enum Role<'a> {
    /// This caller installed the record and must run the fetch.
    Leader(LeaderGuard<'a>),
    /// Another caller holds the record; wait on it.
    Waiter(Arc<Flight>),
}

/// Held by the winning caller. Dropping the guard removes the record from
/// the table, so an abandoned leader cannot strand later callers.
pub(crate) struct LeaderGuard<'a> {
    table: &'a FlightTable,
    key: String,
    flight: Arc<Flight>,
    latch: watch::Sender<bool>,
}

impl LeaderGuard<'_> {
    /// Publish the result to all waiters and release the latch. The record
    /// is removed from the table after the latch fires (on drop), so a late
    /// arriver that misses the record falls through to the cache.
    pub(crate) fn complete(self, result: FlightResult) {
        *self.flight.result.lock() = Some(result);
        let _ = self.latch.send(true);
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        self.table.flights.lock().remove(&self.key);
    }
}

impl FlightTable {
    /// Atomically join the in-flight record for `key`, or install a new one
    /// and become its leader.
    pub(crate) fn join_or_lead(&self, key: &str) -> Role<'_> {
        let mut flights = self.flights.lock();
        if let Some(flight) = flights.get(key) {
            return Role::Waiter(Arc::clone(flight));
        }

        let (latch, done) = watch::channel(false);
        let flight = Arc::new(Flight {
            done,
            result: Mutex::new(None),
        });
        flights.insert(key.to_string(), Arc::clone(&flight));

        Role::Leader(LeaderGuard {
            table: self,
            key: key.to_string(),
            flight,
            latch,
        })
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.flights.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn second_caller_becomes_waiter() {
        let table = FlightTable::default();

        let Role::Leader(leader) = table.join_or_lead("k") else {
            panic!("first caller must lead");
        };
        assert!(matches!(table.join_or_lead("k"), Role::Waiter(_)));

        leader.complete(Ok(Bytes::from_static(b"x")));
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn waiters_observe_leader_result() {
        let table = Arc::new(FlightTable::default());
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let table = Arc::clone(&table);
            let fetches = Arc::clone(&fetches);
            handles.push(tokio::spawn(async move {
                match table.join_or_lead("k") {
                    Role::Leader(leader) => {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        leader.complete(Ok(Bytes::from_static(b"body")));
                        Bytes::from_static(b"body")
                    }
                    Role::Waiter(flight) => flight.wait().await.unwrap(),
                }
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Bytes::from_static(b"body"));
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn distinct_keys_lead_independently() {
        let table = FlightTable::default();
        let a = table.join_or_lead("a");
        let b = table.join_or_lead("b");
        assert!(matches!(a, Role::Leader(_)));
        assert!(matches!(b, Role::Leader(_)));
    }

    #[tokio::test]
    async fn abandoned_leader_unblocks_waiters() {
        let table = FlightTable::default();

        let Role::Leader(leader) = table.join_or_lead("k") else {
            panic!("first caller must lead");
        };
        let Role::Waiter(flight) = table.join_or_lead("k") else {
            panic!("second caller must wait");
        };

        drop(leader);
        assert!(matches!(flight.wait().await, Err(FetchError::Abandoned)));
        // Record was cleaned up, so the key can be led again.
        assert!(matches!(table.join_or_lead("k"), Role::Leader(_)));
    }
}
