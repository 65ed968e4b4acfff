use std::marker::PhantomData;

use sled::{Db, Tree};
use tracing::warn;

use super::{Repository, StorageObject};
use crate::utils::error::Result;

/// Stores values as JSON in a sled tree named after their collection.
#[derive(Clone)]
pub struct SledRepository<T> {
    tree: Tree,
    _marker: PhantomData<fn() -> T>,
}

impl<T: StorageObject> SledRepository<T> {
    pub fn open(db: &Db) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree(T::COLLECTION)?,
            _marker: PhantomData,
        })
    }

    fn write(&self, item: &T) -> Result<()> {
        let serialized = serde_json::to_vec(item)?;
        self.tree.insert(item.id().as_bytes(), serialized)?;
        self.tree.flush()?;
        Ok(())
    }
}

impl<T> std::fmt::Debug for SledRepository<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledRepository")
            .field("tree", &"sled::Tree")
            .finish()
    }
}

impl<T: StorageObject> Repository<T> for SledRepository<T> {
    fn create(&self, item: T) -> Result<()> {
        self.write(&item)
    }

    fn read(&self, id: &str) -> Result<Option<T>> {
        match self.tree.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn update(&self, item: T) -> Result<()> {
        self.write(&item)
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.tree.remove(id.as_bytes())?;
        Ok(())
    }

    fn read_all(&self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        for entry in self.tree.iter() {
            let (key, value) = entry?;
            match serde_json::from_slice(&value) {
                Ok(item) => items.push(item),
                Err(e) => warn!(
                    "skipping unreadable {} entry {:?}: {e}",
                    T::COLLECTION,
                    String::from_utf8_lossy(&key)
                ),
            }
        }
        Ok(items)
    }
}
