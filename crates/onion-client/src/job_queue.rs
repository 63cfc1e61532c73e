//! Keyed de-duplicating job runner
//!
//! At most one job per id is in flight. Adding work under an id that is
//! already running returns the running job's result and drops the new
//! work unpolled. The id is deregistered before any caller observes the
//! result, so `has(id)` is false once the result is in hand.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::error::JobError;

pub type JobHandle<T> = Shared<BoxFuture<'static, Result<T, JobError>>>;

type Registry<K, T> = Arc<Mutex<HashMap<K, JobHandle<T>>>>;

pub struct JobQueue<K, T> {
    jobs: Registry<K, T>,
}

impl<K, T> Default for JobQueue<K, T> {
    fn default() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Removes the id when the job finishes, panics included
struct Deregister<K: Eq + Hash, T> {
    jobs: Registry<K, T>,
    id: K,
}

impl<K: Eq + Hash, T> Drop for Deregister<K, T> {
    fn drop(&mut self) {
        self.jobs.lock().remove(&self.id);
    }
}

impl<K, T> JobQueue<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` under `id`, or join the job already running under it
    pub fn add_with_id<F>(&self, id: K, work: F) -> JobHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let mut jobs = self.jobs.lock();
        if let Some(existing) = jobs.get(&id) {
            return existing.clone();
        }

        let guard = Deregister {
            jobs: Arc::clone(&self.jobs),
            id: id.clone(),
        };
        let task = tokio::spawn(async move {
            let out = work.await;
            drop(guard);
            out
        });
        let handle = async move {
            task.await.map_err(|e| {
                if e.is_panic() {
                    JobError::Panicked
                } else {
                    JobError::Cancelled
                }
            })
        }
        .boxed()
        .shared();

        jobs.insert(id, handle.clone());
        handle
    }

    pub fn has(&self, id: &K) -> bool {
        self.jobs.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}
