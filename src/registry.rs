//! Identity registry separating internally created signals from external ones

use parking_lot::Mutex;
use std::collections::HashSet;
use std::hash::Hash;

/// Where a signal came from, resolved once per identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Created through the pipeline's own API; the caller handles persistence
    Internal,
    /// Created by other code through the shared provider; needs adapting and forwarding
    External,
}

#[derive(Debug)]
struct Identities<K> {
    pending: HashSet<K>,
    internal: HashSet<K>,
}

/// Append-only registry of internal signal identities.
///
/// Spans are keyed on their full `SpanContext`, logs on their id. An identity
/// is reserved as `pending` before the provider is called and promoted to
/// `internal` right after, so a hook firing in between always sees it in one
/// of the two sets.
#[derive(Debug)]
pub struct IdentityRegistry<K> {
    inner: Mutex<Identities<K>>,
}

impl<K: Eq + Hash + Clone> Default for IdentityRegistry<K> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Identities {
                pending: HashSet::new(),
                internal: HashSet::new(),
            }),
        }
    }
}

impl<K: Eq + Hash + Clone> IdentityRegistry<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an identity as being created internally
    pub fn reserve(&self, id: &K) {
        self.inner.lock().pending.insert(id.clone());
    }

    /// Move a reserved identity into the internal set in one step
    pub fn promote(&self, id: &K) {
        let mut identities = self.inner.lock();
        identities.pending.remove(id);
        identities.internal.insert(id.clone());
    }

    /// Reserve `id`, run `create`, then promote. The lock is not held while
    /// `create` runs so hooks it triggers can classify the identity.
    pub fn register_internal<T>(&self, id: &K, create: impl FnOnce() -> T) -> T {
        self.reserve(id);
        let result = create();
        self.promote(id);
        result
    }

    pub fn classify(&self, id: &K) -> Origin {
        let identities = self.inner.lock();
        if identities.pending.contains(id) || identities.internal.contains(id) {
            Origin::Internal
        } else {
            Origin::External
        }
    }

    pub fn is_internal(&self, id: &K) -> bool {
        self.classify(id) == Origin::Internal
    }

    /// Number of known internal identities, pending included
    pub fn len(&self) -> usize {
        let identities = self.inner.lock();
        identities.pending.len() + identities.internal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every identity. Only used when the pipeline shuts down.
    pub fn clear(&self) {
        let mut identities = self.inner.lock();
        identities.pending.clear();
        identities.internal.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::SpanContext;
    use std::sync::Arc;

    fn id(raw: &str) -> String {
        raw.to_string()
    }

    #[test]
    fn test_unknown_identity_is_external() {
        let registry = IdentityRegistry::new();
        assert_eq!(registry.classify(&id("abc")), Origin::External);
    }

    #[test]
    fn test_pending_identity_is_internal() {
        let registry = IdentityRegistry::new();
        registry.reserve(&id("abc"));
        assert_eq!(registry.classify(&id("abc")), Origin::Internal);
        registry.promote(&id("abc"));
        assert_eq!(registry.classify(&id("abc")), Origin::Internal);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_identity_is_internal_while_creating() {
        let registry = IdentityRegistry::new();
        let key = id("abc");
        let seen = registry.register_internal(&key, || registry.classify(&key));
        assert_eq!(seen, Origin::Internal);
        assert!(registry.is_internal(&key));
    }

    #[test]
    fn test_span_identity_needs_matching_trace() {
        let registry = IdentityRegistry::new();
        let internal = SpanContext::generate();
        let same_span_other_trace = SpanContext::new(internal.span_id.clone(), "0".repeat(32));

        registry.register_internal(&internal, || ());
        assert!(registry.is_internal(&internal));
        assert_eq!(registry.classify(&same_span_other_trace), Origin::External);
    }

    #[test]
    fn test_clear_forgets_everything() {
        let registry = IdentityRegistry::new();
        registry.register_internal(&id("a"), || ());
        registry.reserve(&id("b"));
        registry.clear();
        assert!(registry.is_empty());
        assert!(!registry.is_internal(&id("a")));
    }

    #[test]
    fn test_concurrent_registration() {
        let registry = Arc::new(IdentityRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let key = format!("{}-{}", worker, i);
                        let origin = registry.register_internal(&key, || registry.classify(&key));
                        assert_eq!(origin, Origin::Internal);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.len(), 800);
    }
}
