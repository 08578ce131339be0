//! Per-resource-type tracked lists for doorbell-drop recovery.
//!
//! Every CQ, user context, QP and SRQ that issues doorbells registers here so
//! the recovery coordinator can tell it about a new epoch. Each type has its
//! own list behind its own lock; the locks are leaf locks and are never held
//! across a hardware register access or a blocking wait.

use std::sync::{Arc, Mutex};

/// Resource types tracked for drop recovery.
///
/// The ordinal values and the walk order (CQ, user context, QP, SRQ) are part
/// of the recovery notification protocol; external tooling depends on them.
/// Do not reorder.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResType {
    Cq = 0,
    Uctx = 1,
    Qp = 2,
    Srq = 3,
}

/// Number of tracked resource types.
pub const RES_TYPE_MAX: usize = 4;

impl ResType {
    /// All types in recovery notification order.
    pub const ALL: [ResType; RES_TYPE_MAX] =
        [ResType::Cq, ResType::Uctx, ResType::Qp, ResType::Srq];
}

/// A resource that participates in doorbell-drop recovery.
///
/// Implemented by the verbs-level resource objects. `begin_resync` is called
/// from the recovery coordinator's task with the registry lock held, so it
/// must not block and must not call back into the registry.
pub trait RecoveryTarget: Send + Sync {
    /// Tell the resource to resynchronize its doorbell state to `epoch`.
    fn begin_resync(&self, epoch: u32);

    /// The epoch this resource last finished resynchronizing to.
    fn synced_epoch(&self) -> u32;
}

/// Per-type resource lists with independent locking.
pub struct ResourceRegistry {
    lists: [Mutex<Vec<Arc<dyn RecoveryTarget>>>; RES_TYPE_MAX],
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self {
            lists: std::array::from_fn(|_| Mutex::new(Vec::new())),
        }
    }

    /// Append `handle` to the list for `ty`.
    ///
    /// A handle must be registered at most once per lifetime; the caller
    /// (resource creation) guarantees this.
    pub fn register(&self, ty: ResType, handle: Arc<dyn RecoveryTarget>) {
        self.lists[ty as usize].lock().unwrap().push(handle);
    }

    /// Remove `handle` from the list for `ty`. A no-op when the handle is
    /// absent; callers may race with teardown.
    pub fn deregister(&self, ty: ResType, handle: &Arc<dyn RecoveryTarget>) {
        self.lists[ty as usize]
            .lock()
            .unwrap()
            .retain(|h| !Arc::ptr_eq(h, handle));
    }

    /// Enumerate the live list for `ty` under its lock.
    ///
    /// `f` must not register or deregister into the same type's list; that
    /// would deadlock. Mutations discovered during a walk are deferred to a
    /// follow-up pass.
    pub fn for_each<F>(&self, ty: ResType, mut f: F)
    where
        F: FnMut(&Arc<dyn RecoveryTarget>),
    {
        for handle in self.lists[ty as usize].lock().unwrap().iter() {
            f(handle);
        }
    }

    /// Number of live handles of type `ty`.
    pub fn len(&self, ty: ResType) -> usize {
        self.lists[ty as usize].lock().unwrap().len()
    }

    /// True when no handles of type `ty` are registered.
    pub fn is_empty(&self, ty: ResType) -> bool {
        self.len(ty) == 0
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Dummy {
        epoch: AtomicU32,
    }

    impl Dummy {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                epoch: AtomicU32::new(0),
            })
        }
    }

    impl RecoveryTarget for Dummy {
        fn begin_resync(&self, epoch: u32) {
            self.epoch.store(epoch, Ordering::Release);
        }

        fn synced_epoch(&self) -> u32 {
            self.epoch.load(Ordering::Acquire)
        }
    }

    #[test]
    fn test_register_deregister_not_observed_again() {
        let registry = ResourceRegistry::new();
        let handle: Arc<dyn RecoveryTarget> = Dummy::new();

        registry.register(ResType::Qp, handle.clone());
        assert_eq!(registry.len(ResType::Qp), 1);

        registry.deregister(ResType::Qp, &handle);
        let mut seen = 0;
        registry.for_each(ResType::Qp, |_| seen += 1);
        assert_eq!(seen, 0);
    }

    #[test]
    fn test_deregister_absent_is_noop() {
        let registry = ResourceRegistry::new();
        let handle: Arc<dyn RecoveryTarget> = Dummy::new();
        registry.deregister(ResType::Cq, &handle);
        assert!(registry.is_empty(ResType::Cq));
    }

    #[test]
    fn test_lists_are_independent() {
        let registry = ResourceRegistry::new();
        let cq: Arc<dyn RecoveryTarget> = Dummy::new();
        let qp: Arc<dyn RecoveryTarget> = Dummy::new();

        registry.register(ResType::Cq, cq.clone());
        registry.register(ResType::Qp, qp);
        registry.deregister(ResType::Qp, &cq);

        assert_eq!(registry.len(ResType::Cq), 1);
        assert_eq!(registry.len(ResType::Qp), 1);
    }

    #[test]
    fn test_concurrent_register_deregister_membership() {
        use std::thread;

        let registry = Arc::new(ResourceRegistry::new());
        let keep: Vec<Arc<dyn RecoveryTarget>> =
            (0..16).map(|_| Dummy::new() as _).collect();
        let churn: Vec<Arc<dyn RecoveryTarget>> =
            (0..16).map(|_| Dummy::new() as _).collect();

        let mut workers = Vec::new();
        for chunk in [keep.clone(), churn.clone()] {
            let registry = registry.clone();
            workers.push(thread::spawn(move || {
                for h in &chunk {
                    registry.register(ResType::Uctx, h.clone());
                }
            }));
        }
        for w in workers {
            w.join().unwrap();
        }
        {
            let registry = registry.clone();
            let churn = churn.clone();
            thread::spawn(move || {
                for h in &churn {
                    registry.deregister(ResType::Uctx, h);
                }
            })
            .join()
            .unwrap();
        }

        // Final membership is exactly the handles with an unmatched register.
        assert_eq!(registry.len(ResType::Uctx), keep.len());
        registry.for_each(ResType::Uctx, |h| {
            assert!(keep.iter().any(|k| Arc::ptr_eq(k, h)));
        });
    }

    #[test]
    fn test_walk_order_is_fixed() {
        assert_eq!(ResType::ALL.map(|t| t as usize), [0, 1, 2, 3]);
    }
}
