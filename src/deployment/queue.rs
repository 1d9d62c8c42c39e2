//! Background build tasks and per-schema serialization

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

/// Tracks spawned build tasks so they can be awaited on shutdown.
///
/// Dropping the queue detaches running builds; they are never cancelled.
#[derive(Debug, Default)]
pub struct BuildQueue {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BuildQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn a build on the current runtime
    pub fn spawn<F>(&self, build: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(build);
        let mut tasks = self.tasks();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    /// Number of builds not yet finished
    pub fn pending(&self) -> usize {
        self.tasks().iter().filter(|task| !task.is_finished()).count()
    }

    /// Wait until every spawned build has finished
    pub async fn drain(&self) {
        loop {
            let handles = std::mem::take(&mut *self.tasks());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::error!(error = %e, "Build task terminated abnormally");
                }
            }
        }
    }
}

/// In-process async locks keyed by schema name.
///
/// Entries nobody holds or waits on are dropped on the next `acquire`, so
/// the map only tracks schemas with builds in flight.
#[derive(Debug, Default)]
pub struct SchemaLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SchemaLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `schema_name`
    pub async fn acquire(&self, schema_name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks();
            // The map's own reference is the only one left on idle entries
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(schema_name.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Number of schemas currently tracked
    pub fn tracked(&self) -> usize {
        self.locks().len()
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
