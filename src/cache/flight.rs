//! Per-key single-flight coordination.
//!
//! The first caller to miss on a key becomes the leader and runs the
//! computation; callers arriving while it runs subscribe to the leader's
//! result cell and wait. The registration is removed before the result is
//! published, so anyone arriving after release either finds the new entry in
//! the store or starts a fresh flight.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use tokio::sync::watch;

use super::error::CacheError;
use super::key::KeyId;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::flight";

type Cell<T> = watch::Receiver<Option<Result<T, CacheError>>>;

fn abandoned() -> CacheError {
    CacheError::Downstream("leader abandoned".into())
}

/// Deduplicates concurrent computations per [`KeyId`].
pub struct SingleFlight<T> {
    flights: Mutex<HashMap<KeyId, Cell<T>>>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }
}

enum Role<T> {
    Leader(watch::Sender<Option<Result<T, CacheError>>>),
    Follower(Cell<T>),
}

// Clears the registration if the leader's future is dropped mid-flight.
struct Registration<'a, T> {
    flights: &'a SingleFlight<T>,
    key: KeyId,
    armed: bool,
}

impl<T> Registration<'_, T> {
    fn release(&mut self) {
        if self.armed {
            mutex_lock(&self.flights.flights, SOURCE, "release").remove(&self.key);
            self.armed = false;
        }
    }
}

impl<T> Drop for Registration<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(cache = "output", key = %self.key, "single-flight leader abandoned");
        }
        self.release();
    }
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `compute` for `key` unless a computation for it is already in
    /// flight, in which case this waits for and returns that one's result.
    ///
    /// # Errors
    ///
    /// Whatever the leader's computation returned, or
    /// [`CacheError::Downstream`] if the leader was cancelled before finishing.
    pub async fn execute<F, Fut>(&self, key: KeyId, compute: F) -> Result<T, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        let role = {
            let mut flights = mutex_lock(&self.flights, SOURCE, "execute");
            match flights.get(&key) {
                Some(cell) => Role::Follower(cell.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    flights.insert(key, rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Leader(tx) => {
                let mut registration = Registration {
                    flights: self,
                    key,
                    armed: true,
                };
                let result = compute().await;
                registration.release();
                tx.send_replace(Some(result.clone()));
                result
            }
            Role::Follower(mut rx) => match rx.wait_for(Option::is_some).await {
                Ok(published) => match &*published {
                    Some(result) => result.clone(),
                    None => Err(abandoned()),
                },
                Err(_) => Err(abandoned()),
            },
        }
    }

    /// Number of keys with a computation currently running.
    pub fn in_flight(&self) -> usize {
        mutex_lock(&self.flights, SOURCE, "in_flight").len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    const KEY: KeyId = KeyId::from_bytes([9; 16]);

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_computation() {
        let flights = Arc::new(SingleFlight::<usize>::new());
        let computations = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let flights = Arc::clone(&flights);
                let computations = Arc::clone(&computations);
                tokio::spawn(async move {
                    flights
                        .execute(KEY, || async {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(computations.fetch_add(1, Ordering::SeqCst) + 1)
                        })
                        .await
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(1));
        }
        assert_eq!(computations.load(Ordering::SeqCst), 1);
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_reaches_every_waiter() {
        let flights = Arc::new(SingleFlight::<usize>::new());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let flights = Arc::clone(&flights);
                tokio::spawn(async move {
                    flights
                        .execute(KEY, || async {
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Err(CacheError::Downstream("boom".into()))
                        })
                        .await
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(
                handle.await.unwrap(),
                Err(CacheError::Downstream("boom".into()))
            );
        }
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_leader_releases_waiters() {
        let flights = Arc::new(SingleFlight::<usize>::new());

        let leader = {
            let flights = Arc::clone(&flights);
            tokio::spawn(async move {
                flights
                    .execute(KEY, || async {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(flights.in_flight(), 1);

        let waiter = {
            let flights = Arc::clone(&flights);
            tokio::spawn(async move { flights.execute(KEY, || async { Ok(2) }).await })
        };
        tokio::task::yield_now().await;

        leader.abort();
        assert_eq!(waiter.await.unwrap(), Err(abandoned()));
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test]
    async fn completed_flight_does_not_linger() {
        let flights = SingleFlight::<&'static str>::new();
        assert_eq!(flights.execute(KEY, || async { Ok("first") }).await, Ok("first"));
        assert_eq!(flights.execute(KEY, || async { Ok("second") }).await, Ok("second"));
        assert_eq!(flights.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_do_not_wait_on_each_other() {
        let flights = Arc::new(SingleFlight::<u8>::new());
        let slow = {
            let flights = Arc::clone(&flights);
            tokio::spawn(async move {
                flights
                    .execute(KEY, || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let other = KeyId::from_bytes([1; 16]);
        assert_eq!(flights.execute(other, || async { Ok(2) }).await, Ok(2));
        assert_eq!(flights.in_flight(), 1);
        assert_eq!(slow.await.unwrap(), Ok(1));
    }
}
