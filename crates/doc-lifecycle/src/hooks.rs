//! Extension points around document creation.

use crate::content::DocContent;
use crate::record::DocumentMetadataRecord;
use crate::service::CreateDocOptions;

use std::sync::{Arc, RwLock};

/// Observes and adjusts document creation.
///
/// Both methods default to doing nothing, so a hook only implements the
/// half it cares about.
pub trait CreateHook: Send + Sync {
    /// Runs before the id is allocated and the record inserted.
    fn before_create(&self, _options: &mut CreateDocOptions) {}

    /// Runs after the record exists and the content was initialized.
    fn after_create(&self, _record: &DocumentMetadataRecord, _content: &dyn DocContent) {}
}

/// Hooks invoked in registration order.
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Vec<Arc<dyn CreateHook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hook: Arc<dyn CreateHook>) {
        self.hooks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Snapshot so hooks may register further hooks
    fn snapshot(&self) -> Vec<Arc<dyn CreateHook>> {
        self.hooks.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn before_create(&self, options: &mut CreateDocOptions) {
        for hook in self.snapshot() {
            hook.before_create(options);
        }
    }

    pub fn after_create(&self, record: &DocumentMetadataRecord, content: &dyn DocContent) {
        for hook in self.snapshot() {
            hook.after_create(record, content);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Tagger {
        tag: &'static str,
        order: Arc<Mutex<Vec<&'static str>>>,
    }

    impl CreateHook for Tagger {
        fn before_create(&self, options: &mut CreateDocOptions) {
            self.order.lock().unwrap().push(self.tag);
            options.tags.insert(self.tag.to_string());
        }
    }

    #[test]
    fn test_hooks_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let registry = HookRegistry::new();
        for tag in ["first", "second", "third"] {
            registry.register(Arc::new(Tagger {
                tag,
                order: Arc::clone(&order),
            }));
        }

        let mut options = CreateDocOptions::default();
        registry.before_create(&mut options);

        assert_eq!(*order.lock().unwrap(), ["first", "second", "third"]);
        assert_eq!(options.tags.len(), 3);
        assert_eq!(registry.len(), 3);
    }
}
