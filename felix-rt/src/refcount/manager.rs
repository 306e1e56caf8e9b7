//! Generic incref/decref lifecycle manager (§4.2).
//!
//! State machine per id:
//!
//! ```text
//! absent --incref--> starting --spawn ok--> running --decref to 0--> stopping --task exits--> absent
//!                        |                     ^  |
//!                        `-- more increfs ------'  `-- more increfs queue, do NOT revive;
//!                                                      they get a fresh instance once stopping completes
//! ```
//!
//! A resource in `stopping` never goes back to `running`: a caller that
//! increfs while the old instance is on its way out waits for that
//! instance to fully exit and then causes a brand new one to be created,
//! rather than racing to resurrect the one that is already tearing down.

// Layer 1: Standard library imports
use std::collections::HashMap;
use std::sync::Arc;

// Layer 2: Third-party crate imports
use parking_lot::Mutex;
use tokio::sync::oneshot;

// Layer 3: Internal module imports
use super::error::RefCountError;
use super::traits::RefCountedResource;

enum Entry<R: RefCountedResource> {
    Starting {
        waiters: Vec<oneshot::Sender<Result<R::Handle, RefCountError<R::Error>>>>,
    },
    Running {
        handle: R::Handle,
        count: usize,
    },
    Stopping {
        /// Woken once the outgoing instance's task has exited. Any incref
        /// arriving during this state parks here instead of touching the
        /// outgoing instance.
        waiters: Vec<oneshot::Sender<()>>,
    },
}

/// Reference-counted lifecycle manager for resources of type `R`.
///
/// Cloning a `RefCountManager` shares the same table of entries (cheap,
/// `Arc`-backed), matching the clone semantics of
/// [`crate::broker::InMemoryMessageBroker`].
pub struct RefCountManager<R: RefCountedResource> {
    resource: Arc<R>,
    entries: Arc<Mutex<HashMap<R::Id, Entry<R>>>>,
}

impl<R: RefCountedResource> Clone for RefCountManager<R> {
    fn clone(&self) -> Self {
        Self {
            resource: Arc::clone(&self.resource),
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<R: RefCountedResource> RefCountManager<R> {
    /// Create a new manager backed by `resource`.
    pub fn new(resource: R) -> Self {
        Self {
            resource: Arc::new(resource),
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Increment the reference count for `id`, creating it if absent.
    ///
    /// Resolves once the instance is `running` and returns a live handle.
    /// If `id` is currently `stopping`, this call parks until the
    /// outgoing instance has fully exited and then creates a fresh one —
    /// it never hands back a handle to the instance that is tearing down.
    pub async fn incref(&self, id: &R::Id) -> Result<R::Handle, RefCountError<R::Error>> {
        loop {
            enum Action {
                Ready(R::Handle),
                WaitStarting(oneshot::Receiver<Result<R::Handle, RefCountError<R::Error>>>),
                WaitStopping(oneshot::Receiver<()>),
                Create,
            }

            let action = {
                let mut entries = self.entries.lock();
                match entries.get_mut(id) {
                    None => {
                        entries.insert(id.clone(), Entry::Starting { waiters: Vec::new() });
                        Action::Create
                    }
                    Some(Entry::Starting { waiters }) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Action::WaitStarting(rx)
                    }
                    Some(Entry::Running { handle, count }) => {
                        *count += 1;
                        Action::Ready(handle.clone())
                    }
                    Some(Entry::Stopping { waiters }) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Action::WaitStopping(rx)
                    }
                }
            };

            match action {
                Action::Ready(handle) => return Ok(handle),
                Action::WaitStarting(rx) => {
                    return rx.await.unwrap_or(Err(RefCountError::TaskLost));
                }
                Action::WaitStopping(rx) => {
                    let _ = rx.await;
                    // Fall through and retry: the entry is now absent.
                    continue;
                }
                Action::Create => {
                    let outcome = self.resource.spawn(id).await;
                    let mut entries = self.entries.lock();
                    let waiters = match entries.remove(id) {
                        Some(Entry::Starting { waiters }) => waiters,
                        _ => Vec::new(),
                    };
                    match outcome {
                        Ok((handle, join)) => {
                            entries.insert(
                                id.clone(),
                                Entry::Running {
                                    handle: handle.clone(),
                                    count: 1 + waiters.len(),
                                },
                            );
                            drop(entries);
                            for waiter in waiters {
                                let _ = waiter.send(Ok(handle.clone()));
                            }
                            self.watch_for_exit(id.clone(), join);
                            return Ok(handle);
                        }
                        Err(error) => {
                            drop(entries);
                            let error = RefCountError::Create(error);
                            for waiter in waiters {
                                let _ = waiter.send(Err(RefCountError::TaskLost));
                            }
                            return Err(error);
                        }
                    }
                }
            }
        }
    }

    /// Decrement the reference count for `id`.
    ///
    /// Once the count reaches zero, asks the resource to stop and, once
    /// its task actually exits, removes the entry entirely. Decref'ing
    /// an id with no entry (or already stopping) is a no-op: callers are
    /// expected to pair every `incref` with exactly one `decref`, but a
    /// manager restart or a racing cleanup makes a stray decref benign
    /// rather than a logic error worth panicking over.
    pub fn decref(&self, id: &R::Id) {
        let to_stop = {
            let mut entries = self.entries.lock();
            match entries.get_mut(id) {
                Some(Entry::Running { count, .. }) if *count > 1 => {
                    *count -= 1;
                    None
                }
                Some(Entry::Running { .. }) => {
                    match entries.remove(id) {
                        Some(Entry::Running { handle, .. }) => {
                            entries.insert(id.clone(), Entry::Stopping { waiters: Vec::new() });
                            Some(handle)
                        }
                        _ => unreachable!("matched Running above"),
                    }
                }
                _ => None,
            }
        };

        if let Some(handle) = to_stop {
            let resource = Arc::clone(&self.resource);
            let entries = Arc::clone(&self.entries);
            let id = id.clone();
            tokio::spawn(async move {
                resource.request_stop(&handle).await;
            });
            // The join-handle watcher installed in `incref` is responsible
            // for clearing the `Stopping` entry once the task actually
            // exits; nothing further to do here.
            let _ = (entries, id);
        }
    }

    /// Current reference count for `id`, or `None` if no entry exists.
    pub fn ref_count(&self, id: &R::Id) -> Option<usize> {
        match self.entries.lock().get(id) {
            Some(Entry::Running { count, .. }) => Some(*count),
            _ => None,
        }
    }

    fn watch_for_exit(&self, id: R::Id, join: tokio::task::JoinHandle<()>) {
        let entries = Arc::clone(&self.entries);
        tokio::spawn(async move {
            let _ = join.await;
            let mut entries = entries.lock();
            if let Some(Entry::Stopping { waiters }) = entries.remove(&id) {
                for waiter in waiters {
                    let _ = waiter.send(());
                }
            }
            // If the entry wasn't `Stopping` (e.g. it's `Running` again
            // because nothing ever decref'd it to zero before the task
            // exited on its own), there's nothing to clean up; the
            // actor's own error handling is responsible for that case.
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tokio::time::Duration;

    #[derive(Debug)]
    struct NeverError;
    impl std::fmt::Display for NeverError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "never")
        }
    }
    impl std::error::Error for NeverError {}

    struct CountingResource {
        spawns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RefCountedResource for CountingResource {
        type Id = String;
        type Handle = mpsc::UnboundedSender<()>;
        type Error = NeverError;

        async fn spawn(
            &self,
            _id: &Self::Id,
        ) -> Result<(Self::Handle, tokio::task::JoinHandle<()>), Self::Error> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            let (tx, mut rx) = mpsc::unbounded_channel::<()>();
            let join = tokio::spawn(async move {
                // Exits once the handle (and the stop signal below) are dropped.
                while rx.recv().await.is_some() {}
            });
            Ok((tx, join))
        }

        async fn request_stop(&self, handle: &Self::Handle) {
            // Closing the handle is enough for the fake backing task to exit.
            let _ = handle.send(());
            drop(handle.clone());
        }
    }

    #[tokio::test]
    async fn first_incref_creates_exactly_once() {
        let spawns = Arc::new(AtomicUsize::new(0));
        let manager = RefCountManager::new(CountingResource {
            spawns: Arc::clone(&spawns),
        });

        let _h1 = manager.incref(&"tag-a".to_string()).await.unwrap();
        let _h2 = manager.incref(&"tag-a".to_string()).await.unwrap();

        assert_eq!(spawns.load(Ordering::SeqCst), 1);
        assert_eq!(manager.ref_count(&"tag-a".to_string()), Some(2));
    }

    #[tokio::test]
    async fn decref_to_zero_then_incref_creates_a_fresh_instance() {
        let spawns = Arc::new(AtomicUsize::new(0));
        let manager = RefCountManager::new(CountingResource {
            spawns: Arc::clone(&spawns),
        });
        let id = "tag-a".to_string();

        let _h1 = manager.incref(&id).await.unwrap();
        manager.decref(&id);

        // Give the background stop/watch tasks a chance to run.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _h2 = manager.incref(&id).await.unwrap();
        assert_eq!(spawns.load(Ordering::SeqCst), 2);
    }
}
