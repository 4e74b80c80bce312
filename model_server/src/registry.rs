//! Registry mapping session ids to their worker actors.
//!
//! Every entry is a `OnceCell` inserted under the map lock, so the first
//! caller for a session builds the worker while concurrent callers for the
//! same session wait on that cell. The map lock is never held while a backend
//! loads, so sessions register in parallel.

use crate::{
    backend::BackendFactory,
    error::{BackendError, RegistryError},
    fetch::ImageFetcher,
    session::SessionId,
    worker::{WorkerActor, WorkerHandle},
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::OnceCell;
use tracing::{info, warn};

type Slot = Arc<OnceCell<WorkerHandle>>;

pub struct SessionRegistry<F: BackendFactory> {
    workers: Mutex<HashMap<SessionId, Slot>>,
    factory: Arc<F>,
    fetcher: Arc<dyn ImageFetcher>,
    mailbox_capacity: usize,
}

impl<F: BackendFactory> SessionRegistry<F> {
    pub fn new(factory: F, fetcher: Arc<dyn ImageFetcher>, mailbox_capacity: usize) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            factory: Arc::new(factory),
            fetcher,
            mailbox_capacity,
        }
    }

    /// Returns the session's worker, creating it if this is the first time the id is seen.
    pub async fn ensure(&self, session_id: &SessionId) -> Result<WorkerHandle, RegistryError> {
        let slot = self
            .workers
            .lock()
            .entry(session_id.clone())
            .or_default()
            .clone();

        // Runs on success, failure and cancellation of this call alike
        let guard = SlotGuard {
            registry: self,
            session_id,
            slot,
        };

        let handle = guard
            .slot
            .get_or_try_init(|| self.spawn_worker(session_id.clone()))
            .await
            .cloned();
        handle
    }

    pub fn lookup(&self, session_id: &SessionId) -> Result<WorkerHandle, RegistryError> {
        self.workers
            .lock()
            .get(session_id)
            .and_then(|slot| slot.get().cloned())
            .ok_or_else(|| RegistryError::UnknownSession(session_id.clone()))
    }

    /// Removes the session and waits for its worker to finish queued commands.
    /// Returns whether a live worker was removed.
    pub async fn terminate(&self, session_id: &SessionId) -> bool {
        let slot = self.workers.lock().remove(session_id);

        match slot.as_ref().and_then(|slot| slot.get()) {
            Some(handle) => {
                handle.shutdown().await;
                info!("Deleted worker for session {}", session_id);
                true
            }
            None if slot.is_some() => {
                // The pending ensure still hands its caller a handle, but the
                // worker is no longer reachable here and stops once that handle drops.
                warn!(
                    "Session {} was terminated while its worker was still being created, \
                     the pending worker will be dropped",
                    session_id
                );
                false
            }
            None => {
                info!(
                    "Attempted to delete worker for session {} but none exists",
                    session_id
                );
                false
            }
        }
    }

    /// Terminates every worker. Returns how many were disposed.
    pub async fn shutdown_all(&self) -> usize {
        let slots: Vec<Slot> = self.workers.lock().drain().map(|(_, slot)| slot).collect();
        let handles: Vec<WorkerHandle> = slots.iter().filter_map(|slot| slot.get().cloned()).collect();

        futures::future::join_all(handles.iter().map(|handle| handle.shutdown())).await;
        handles.len()
    }

    /// Number of sessions with a live worker.
    pub fn len(&self) -> usize {
        self.workers
            .lock()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn spawn_worker(&self, session_id: SessionId) -> Result<WorkerHandle, RegistryError> {
        let factory = self.factory.clone();
        let id = session_id.clone();
        let backend = tokio::task::spawn_blocking(move || factory.create(&id))
            .await
            .map_err(|e| BackendError::Load(format!("backend initialization aborted: {}", e)))
            .and_then(|created| created)
            .map_err(|source| {
                warn!("Failed to create worker for session {}: {}", session_id, source);
                RegistryError::CreationFailure {
                    session: session_id.clone(),
                    source,
                }
            })?;

        let (handle, actor) = WorkerActor::create(
            session_id,
            backend,
            self.fetcher.clone(),
            self.mailbox_capacity,
        );
        tokio::spawn(actor.run());

        Ok(handle)
    }

    /// Drops a slot left empty by a failed or cancelled creation, unless another
    /// caller is already waiting on it.
    fn discard_empty_slot(&self, session_id: &SessionId, slot: &Slot) {
        let mut workers = self.workers.lock();
        let is_same_idle_slot = workers.get(session_id).is_some_and(|current| {
            Arc::ptr_eq(current, slot) && !current.initialized() && Arc::strong_count(current) == 2
        });
        if is_same_idle_slot {
            workers.remove(session_id);
        }
    }
}

struct SlotGuard<'a, F: BackendFactory> {
    registry: &'a SessionRegistry<F>,
    session_id: &'a SessionId,
    slot: Slot,
}

impl<F: BackendFactory> Drop for SlotGuard<'_, F> {
    fn drop(&mut self) {
        if !self.slot.initialized() {
            self.registry.discard_empty_slot(self.session_id, &self.slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StubFactory, StubFetcher};
    use std::{
        sync::atomic::Ordering,
        time::Duration,
    };

    fn id(s: &str) -> SessionId {
        SessionId::try_from(s).unwrap()
    }

    fn registry(factory: &StubFactory) -> SessionRegistry<StubFactory> {
        SessionRegistry::new(factory.clone(), Arc::new(StubFetcher), 8)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ensure_creates_one_worker() {
        let factory = StubFactory {
            create_delay: Duration::from_millis(50),
            ..Default::default()
        };
        let registry = Arc::new(registry(&factory));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.ensure(&id("s1")).await })
            })
            .collect();

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap());
        }

        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert!(handles.iter().all(|h| h.same_worker(&handles[0])));
        assert!(registry.lookup(&id("s1")).unwrap().same_worker(&handles[0]));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_distinct_sessions_get_distinct_workers() {
        let factory = StubFactory::default();
        let registry = registry(&factory);

        let a = registry.ensure(&id("a")).await.unwrap();
        let b = registry.ensure(&id("b")).await.unwrap();
        let a_again = registry.ensure(&id("a")).await.unwrap();

        assert!(!a.same_worker(&b));
        assert!(a.same_worker(&a_again));
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_lookup_unknown_session() {
        let registry = registry(&StubFactory::default());

        assert!(matches!(
            registry.lookup(&id("ghost")),
            Err(RegistryError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_lookup_after_terminate_is_unknown() {
        let factory = StubFactory::default();
        let registry = registry(&factory);

        registry.ensure(&id("s1")).await.unwrap();
        assert!(registry.terminate(&id("s1")).await);

        assert!(matches!(
            registry.lookup(&id("s1")),
            Err(RegistryError::UnknownSession(_))
        ));
        assert_eq!(factory.recorder.dropped.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_terminate_unknown_session_returns_false() {
        let registry = registry(&StubFactory::default());

        assert!(!registry.terminate(&id("never-registered")).await);
    }

    #[tokio::test]
    async fn test_creation_failure_registers_nothing() {
        let factory = StubFactory::default();
        factory.fail.store(true, Ordering::SeqCst);
        let registry = registry(&factory);

        let result = registry.ensure(&id("s1")).await;
        assert!(matches!(result, Err(RegistryError::CreationFailure { .. })));
        assert!(registry.lookup(&id("s1")).is_err());
        assert!(registry.workers.lock().is_empty());

        factory.fail.store(false, Ordering::SeqCst);
        assert!(registry.ensure(&id("s1")).await.is_ok());
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancelled_ensure_leaves_no_slot() {
        let factory = StubFactory {
            create_delay: Duration::from_millis(100),
            ..Default::default()
        };
        let registry = registry(&factory);

        for i in 0..5 {
            let session = id(&format!("s{}", i));
            let result = tokio::time::timeout(Duration::from_millis(10), registry.ensure(&session)).await;
            assert!(result.is_err());
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(registry.workers.lock().is_empty());
        assert!(registry.lookup(&id("s0")).is_err());
        assert!(registry.ensure(&id("s0")).await.is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_terminate_during_creation_leaves_worker_unregistered() {
        let factory = StubFactory {
            create_delay: Duration::from_millis(100),
            ..Default::default()
        };
        let registry = Arc::new(registry(&factory));

        let pending = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.ensure(&id("s1")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!registry.terminate(&id("s1")).await);

        let handle = pending.await.unwrap().unwrap();
        assert!(handle.probe().await.is_ok());
        assert!(matches!(
            registry.lookup(&id("s1")),
            Err(RegistryError::UnknownSession(_))
        ));
        assert!(registry.workers.lock().is_empty());

        drop(handle);
        for _ in 0..50 {
            if factory.recorder.dropped.load(Ordering::SeqCst) == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("unregistered worker was not dropped");
    }

    #[tokio::test]
    async fn test_ensure_after_terminate_creates_fresh_worker() {
        let factory = StubFactory::default();
        let registry = registry(&factory);

        let first = registry.ensure(&id("s1")).await.unwrap();
        registry.terminate(&id("s1")).await;
        let second = registry.ensure(&id("s1")).await.unwrap();

        assert!(!first.same_worker(&second));
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_all_disposes_every_worker() {
        let factory = StubFactory::default();
        let registry = registry(&factory);
        for s in ["a", "b", "c"] {
            registry.ensure(&id(s)).await.unwrap();
        }

        assert_eq!(registry.shutdown_all().await, 3);
        assert_eq!(factory.recorder.dropped.load(Ordering::SeqCst), 3);
        assert!(registry.is_empty());
    }
}
