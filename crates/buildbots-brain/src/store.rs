//! Classifier persistence on top of a byte store.

use std::sync::Arc;

use buildbots_core::{ByteStore, decode_properties, encode_properties};
use tracing::{debug, info};

use crate::perceptron::{ModelError, PlacementModel};

/// Record name the classifier is saved under.
pub const MODEL_RECORD: &str = "placement-model";

/// Saves and restores the placement model as a flat property record.
#[derive(Clone)]
pub struct ModelStore {
    store: Arc<dyn ByteStore>,
}

impl std::fmt::Debug for ModelStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelStore").field("record", &MODEL_RECORD).finish()
    }
}

impl ModelStore {
    #[must_use]
    pub fn new(store: Arc<dyn ByteStore>) -> Self {
        Self { store }
    }

    /// Load the saved model, or defaults when nothing was saved yet.
    pub fn load(&self) -> Result<PlacementModel, ModelError> {
        let Some(bytes) = self.store.read(MODEL_RECORD)? else {
            debug!("no saved placement model; using defaults");
            return Ok(PlacementModel::default());
        };
        let text = String::from_utf8(bytes).map_err(|_| ModelError::NotUtf8)?;
        let model = PlacementModel::from_properties(&decode_properties(&text))?;
        info!(updates = model.updates(), "placement model restored");
        Ok(model)
    }

    pub fn save(&self, model: &PlacementModel) -> Result<(), ModelError> {
        let text = encode_properties(&model.to_properties());
        self.store.write_atomic(MODEL_RECORD, text.as_bytes())?;
        debug!(updates = model.updates(), "placement model saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildbots_core::StoreError;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MapStore(Mutex<HashMap<String, Vec<u8>>>);

    impl ByteStore for MapStore {
        fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(self.0.lock().map_err(|_| StoreError::Poisoned)?.get(name).cloned())
        }

        fn write_atomic(&self, name: &str, bytes: &[u8]) -> Result<(), StoreError> {
            self.0
                .lock()
                .map_err(|_| StoreError::Poisoned)?
                .insert(name.to_owned(), bytes.to_vec());
            Ok(())
        }
    }

    #[test]
    fn missing_record_yields_defaults() {
        let store = ModelStore::new(Arc::new(MapStore::default()));
        assert_eq!(store.load().expect("load"), PlacementModel::default());
    }

    #[test]
    fn saved_model_is_restored() {
        let backend = Arc::new(MapStore::default());
        let store = ModelStore::new(backend.clone());
        let mut model = PlacementModel::default();
        model.configure(0.3, 0.07).expect("configure");
        store.save(&model).expect("save");
        assert_eq!(store.load().expect("load"), model);

        backend
            .write_atomic(MODEL_RECORD, &[0xff, 0xfe])
            .expect("overwrite");
        assert!(matches!(store.load(), Err(ModelError::NotUtf8)));
    }
}
