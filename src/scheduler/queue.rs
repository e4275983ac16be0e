//! Deduplicating work queue.
//!
//! A key is queued at most once. A key added while it is being reconciled is
//! marked dirty and queued again when its reconcile finishes, so one key never
//! has two reconciles in flight.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;

use super::ObjectKey;

#[derive(Debug, Default)]
struct Inner {
    ready: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    in_flight: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    shutdown: bool,
}

impl Inner {
    fn push(&mut self, key: ObjectKey) -> bool {
        if self.queued.insert(key.clone()) {
            self.ready.push_back(key);
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue `key` unless it is already queued.
    pub fn add(&self, key: ObjectKey) {
        let mut inner = self.lock();
        if inner.shutdown {
            return;
        }
        if inner.in_flight.contains(&key) {
            inner.dirty.insert(key);
            return;
        }
        if inner.push(key) {
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Queue `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Wait for the next key. Returns `None` after shutdown.
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if inner.shutdown {
                    return None;
                }
                if let Some(key) = inner.ready.pop_front() {
                    inner.queued.remove(&key);
                    inner.in_flight.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark the reconcile of `key` finished, requeueing it if it went dirty.
    pub fn done(&self, key: &ObjectKey) {
        let mut inner = self.lock();
        inner.in_flight.remove(key);
        if inner.dirty.remove(key) && !inner.shutdown && inner.push(key.clone()) {
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Keys waiting to be picked up.
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_in_flight(&self, key: &ObjectKey) -> bool {
        self.lock().in_flight.contains(key)
    }

    /// Stop handing out keys and wake every waiting worker.
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }
}
