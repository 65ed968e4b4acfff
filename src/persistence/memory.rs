use std::collections::HashMap;

use parking_lot::RwLock;

use super::{Repository, StorageObject};
use crate::utils::error::Result;

#[derive(Debug)]
pub struct InMemoryRepository<T> {
    items: RwLock<HashMap<String, T>>,
}

impl<T> InMemoryRepository<T> {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> Default for InMemoryRepository<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: StorageObject> Repository<T> for InMemoryRepository<T> {
    fn create(&self, item: T) -> Result<()> {
        self.items.write().insert(item.id(), item);
        Ok(())
    }

    fn read(&self, id: &str) -> Result<Option<T>> {
        Ok(self.items.read().get(id).cloned())
    }

    fn update(&self, item: T) -> Result<()> {
        self.create(item)
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.items.write().remove(id);
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<T>> {
        Ok(self.items.read().values().cloned().collect())
    }
}
