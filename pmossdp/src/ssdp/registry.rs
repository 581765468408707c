//! Table des handlers inscrits par clé (ST ou NT)

use std::collections::HashMap;
use std::sync::Arc;

/// Associe une clé à un ensemble de handlers comparés par identité.
///
/// Une clé n'existe que tant qu'au moins un handler y est inscrit.
pub(crate) struct HandlerRegistry<H: ?Sized> {
    entries: HashMap<String, Vec<Arc<H>>>,
}

fn same_handler<H: ?Sized>(a: &Arc<H>, b: &Arc<H>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl<H: ?Sized> HandlerRegistry<H> {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Inscrit `handler` sous `key` ; `false` s'il y était déjà
    pub(crate) fn insert(&mut self, key: &str, handler: Arc<H>) -> bool {
        let handlers = self.entries.entry(key.to_string()).or_default();
        if handlers.iter().any(|h| same_handler(h, &handler)) {
            return false;
        }
        handlers.push(handler);
        true
    }

    pub(crate) fn remove(&mut self, key: &str, handler: &Arc<H>) -> bool {
        let Some(handlers) = self.entries.get_mut(key) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|h| !same_handler(h, handler));
        let removed = handlers.len() != before;
        if handlers.is_empty() {
            self.entries.remove(key);
        }
        removed
    }

    /// Copie des handlers de `key`, pour les appeler sans garder d'emprunt
    pub(crate) fn handlers(&self, key: &str) -> Vec<Arc<H>> {
        self.entries.get(key).cloned().unwrap_or_default()
    }

    /// Nombre de clés ayant au moins un handler
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Named: Send + Sync {
        fn name(&self) -> &str;
    }

    struct Handler(&'static str);

    impl Named for Handler {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn test_identity_based_membership() {
        let mut registry: HandlerRegistry<dyn Named> = HandlerRegistry::new();
        let a: Arc<dyn Named> = Arc::new(Handler("a"));
        let twin: Arc<dyn Named> = Arc::new(Handler("a"));

        assert!(registry.insert("st", a.clone()));
        assert!(!registry.insert("st", a.clone()));
        assert!(registry.insert("st", twin.clone()));
        assert_eq!(registry.handlers("st").len(), 2);
        assert_eq!(registry.handlers("st")[0].name(), "a");
    }

    #[test]
    fn test_key_removed_with_last_handler() {
        let mut registry: HandlerRegistry<dyn Named> = HandlerRegistry::new();
        let a: Arc<dyn Named> = Arc::new(Handler("a"));
        let b: Arc<dyn Named> = Arc::new(Handler("b"));
        registry.insert("st", a.clone());
        registry.insert("st", b.clone());
        registry.insert("other", a.clone());
        assert_eq!(registry.len(), 2);

        assert!(registry.remove("st", &a));
        assert_eq!(registry.len(), 2);
        assert!(registry.remove("st", &b));
        assert_eq!(registry.len(), 1);
        assert!(!registry.remove("st", &b));
        assert!(registry.handlers("st").is_empty());
    }

    #[test]
    fn test_clear() {
        let mut registry: HandlerRegistry<dyn Named> = HandlerRegistry::new();
        registry.insert("st", Arc::new(Handler("a")));
        registry.clear();

        assert_eq!(registry.len(), 0);
    }
}
