//! Operation deduplication: concurrent callers for the same key attach to a
//! single in-flight execution and all observe its result.

use std::collections::HashMap;
use std::hash::Hash;

use tokio::sync::{broadcast, Mutex};

enum Role<T> {
    Leader(broadcast::Sender<T>),
    Waiter(broadcast::Receiver<T>),
}

pub struct SingleFlight<K, T> {
    inflight: Mutex<HashMap<K, broadcast::Sender<T>>>,
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `op` for `key`, collapsing concurrent callers onto one execution.
    ///
    /// The leader runs `op` and publishes its result to every waiter. A
    /// result is never retained past the execution, so a failed operation is
    /// re-run by the next caller.
    pub async fn run<F, Fut>(&self, key: K, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let role = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(&key) {
                Some(tx) => Role::Waiter(tx.subscribe()),
                None => {
                    let (tx, _rx) = broadcast::channel(1);
                    inflight.insert(key.clone(), tx.clone());
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Leader(tx) => {
                let value = op().await;
                self.inflight.lock().await.remove(&key);
                let _ = tx.send(value.clone());
                value
            }
            Role::Waiter(mut rx) => match rx.recv().await {
                Ok(value) => value,
                // The leader went away without publishing; run ourselves.
                Err(_) => op().await,
            },
        }
    }
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
