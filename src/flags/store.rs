//! A thread-safe in-memory store for the currently cached flag
//! definitions. Provides concurrent access for readers (flag evaluation)
//! and the single writer (the definitions poller).

use std::sync::{Arc, RwLock};

use super::models::FlagDefinitions;

/// `FlagDefinitionStore` holds the definitions behind an `RwLock`. The
/// cached value is immutable and only ever replaced as a whole, so readers
/// never observe a partial update.
#[derive(Default)]
pub(crate) struct FlagDefinitionStore {
    definitions: RwLock<Option<Arc<FlagDefinitions>>>,
}

impl FlagDefinitionStore {
    pub fn new() -> Self {
        FlagDefinitionStore::default()
    }

    /// `None` until the first successful fetch.
    pub fn get(&self) -> Option<Arc<FlagDefinitions>> {
        let definitions = self
            .definitions
            .read()
            .expect("thread holding definitions lock should not panic");
        definitions.clone()
    }

    pub fn loaded(&self) -> bool {
        self.get().is_some()
    }

    /// Replace the cached definitions atomically.
    pub fn set(&self, definitions: FlagDefinitions) {
        let mut slot = self
            .definitions
            .write()
            .expect("thread holding definitions lock should not panic");
        *slot = Some(Arc::new(definitions));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::flags::models::FlagDefinition;

    fn definitions_with_flag(key: &str) -> FlagDefinitions {
        let mut definitions = FlagDefinitions::default();
        definitions.flags_by_key.insert(
            key.to_owned(),
            FlagDefinition {
                key: key.to_owned(),
                id: None,
                version: None,
                active: true,
                ensure_experience_continuity: None,
                filters: Default::default(),
            },
        );
        definitions
    }

    #[test]
    fn starts_empty() {
        let store = FlagDefinitionStore::new();
        assert!(!store.loaded());
        assert!(store.get().is_none());
    }

    #[test]
    fn can_set_definitions_from_another_thread() {
        let store = Arc::new(FlagDefinitionStore::new());

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                store.set(definitions_with_flag("beta"));
            })
            .join();
        }

        let definitions = store.get().unwrap();
        assert!(definitions.flags_by_key.contains_key("beta"));
    }

    #[test]
    fn replacement_is_whole_value() {
        let store = FlagDefinitionStore::new();
        store.set(definitions_with_flag("first"));
        let before = store.get().unwrap();

        store.set(definitions_with_flag("second"));
        let after = store.get().unwrap();

        // The old snapshot is untouched; readers holding it keep a
        // consistent view.
        assert!(before.flags_by_key.contains_key("first"));
        assert!(!after.flags_by_key.contains_key("first"));
        assert!(after.flags_by_key.contains_key("second"));
    }
}
