//! Listener subscriptions
//!
//! Three ways to subscribe:
//! - direct: the set keeps the listener alive until it is removed
//! - weak: the set never keeps the listener alive; dead entries disappear
//! - soft: the set keeps the listener alive, but [`ListenerSet::sweep`]
//!   releases it once the set holds the only reference

use parking_lot::RwLock;
use std::sync::{Arc, Weak};

enum Subscription<L: ?Sized> {
    Direct(Arc<L>),
    Weak(Weak<L>),
    Soft(Arc<L>),
}

impl<L: ?Sized> Subscription<L> {
    fn upgrade(&self) -> Option<Arc<L>> {
        match self {
            Subscription::Direct(l) | Subscription::Soft(l) => Some(l.clone()),
            Subscription::Weak(w) => w.upgrade(),
        }
    }

    fn points_to(&self, listener: &Arc<L>) -> bool {
        let target = Arc::as_ptr(listener) as *const ();
        match self {
            Subscription::Direct(l) | Subscription::Soft(l) => Arc::as_ptr(l) as *const () == target,
            Subscription::Weak(w) => w.as_ptr() as *const () == target,
        }
    }
}

/// A set of listeners of type `L`
pub struct ListenerSet<L: ?Sized> {
    entries: RwLock<Vec<Subscription<L>>>,
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_direct(&self, listener: Arc<L>) {
        self.entries.write().push(Subscription::Direct(listener));
    }

    pub fn add_weak(&self, listener: &Arc<L>) {
        self.entries
            .write()
            .push(Subscription::Weak(Arc::downgrade(listener)));
    }

    pub fn add_soft(&self, listener: Arc<L>) {
        self.entries.write().push(Subscription::Soft(listener));
    }

    /// Remove every subscription of `listener`; returns whether one was found
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|s| !s.points_to(listener));
        entries.len() != before
    }

    /// Release dead weak entries and soft entries nobody else references.
    /// Returns the number of entries released.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|s| match s {
            Subscription::Direct(_) => true,
            Subscription::Weak(w) => w.strong_count() > 0,
            Subscription::Soft(l) => Arc::strong_count(l) > 1,
        });
        before - entries.len()
    }

    /// Currently reachable listeners
    pub fn live(&self) -> Vec<Arc<L>> {
        self.entries
            .read()
            .iter()
            .filter_map(Subscription::upgrade)
            .collect()
    }

    /// Call `f` for each reachable listener; returns false if there was none
    pub fn fire(&self, mut f: impl FnMut(&L)) -> bool {
        let live = self.live();
        for listener in &live {
            f(listener);
        }
        !live.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    trait Counter: Send + Sync {
        fn hit(&self);
    }

    #[derive(Default)]
    struct Hits(AtomicUsize);

    impl Counter for Hits {
        fn hit(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_direct_listener_is_kept_alive() {
        let set: ListenerSet<dyn Counter> = ListenerSet::new();
        let hits = Arc::new(Hits::default());
        set.add_direct(hits.clone());
        assert!(set.fire(|l| l.hit()));
        assert_eq!(set.sweep(), 0);
        assert_eq!(hits.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_weak_listener_disappears_when_dropped() {
        let set: ListenerSet<dyn Counter> = ListenerSet::new();
        let hits: Arc<dyn Counter> = Arc::new(Hits::default());
        set.add_weak(&hits);
        assert_eq!(set.live().len(), 1);

        drop(hits);
        assert!(!set.fire(|l| l.hit()));
        assert_eq!(set.sweep(), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_soft_listener_released_by_sweep() {
        let set: ListenerSet<dyn Counter> = ListenerSet::new();
        let hits: Arc<dyn Counter> = Arc::new(Hits::default());
        set.add_soft(hits.clone());

        // still referenced by the test
        assert_eq!(set.sweep(), 0);
        drop(hits);
        assert_eq!(set.live().len(), 1);
        assert_eq!(set.sweep(), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_remove() {
        let set: ListenerSet<dyn Counter> = ListenerSet::new();
        let a: Arc<dyn Counter> = Arc::new(Hits::default());
        let b: Arc<dyn Counter> = Arc::new(Hits::default());
        set.add_direct(a.clone());
        set.add_weak(&b);
        assert!(set.remove(&a));
        assert!(!set.remove(&a));
        assert_eq!(set.len(), 1);
    }
}
