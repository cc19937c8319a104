// src/supervisor/pool.rs

//! Bounded worker pool for adapter calls.
//!
//! At most `workers` adapter calls run at once across all services, and
//! calls for the same service are serialised behind a per-service lock. The
//! service lock is taken before the global permit so a service queueing
//! behind its own in-flight call never occupies a worker slot.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::types::ServiceId;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    locks: Arc<Mutex<HashMap<ServiceId, Arc<tokio::sync::Mutex<()>>>>>,
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            locks: Arc::new(Mutex::new(HashMap::new())),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Calls that could start right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    fn service_lock(&self, service: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Run `fut` holding the service's lock and one worker permit.
    pub async fn run<F, T>(&self, service: &str, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let lock = self.service_lock(service);
        let _service_guard = lock.lock_owned().await;
        // The semaphore is never closed.
        let _permit = self.permits.clone().acquire_owned().await.ok();
        fut.await
    }

    /// Like [`WorkerPool::run`], on a background task.
    pub fn spawn<F, T>(&self, service: &str, fut: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.clone();
        let service = service.to_string();
        tokio::spawn(async move { pool.run(&service, fut).await })
    }
}
