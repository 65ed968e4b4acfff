//! The `persistence` module provides the keyed stores behind sessions,
//! retained messages and wills.
//!
//! Flows only see the [`Repository`] trait. Stores are either kept in memory
//! or written to an embedded `sled` database so that persistent sessions
//! survive a broker restart.

mod memory;
pub mod sled_store;

use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::StorageSettings;
use crate::session::{ClientSession, ConnectionWill, RetainedMessage, SessionRepository};
use crate::utils::error::Result;

pub use memory::InMemoryRepository;
pub use sled_store::SledRepository;

/// A value that can be stored under a string key.
pub trait StorageObject: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name of the collection values of this type live in.
    const COLLECTION: &'static str;

    fn id(&self) -> String;
}

/// Keyed store for one entity type.
///
/// Single operations are atomic per key and the last write wins. There are no
/// guarantees across keys.
pub trait Repository<T: StorageObject>: Send + Sync {
    /// Stores `item`, replacing any value with the same id.
    fn create(&self, item: T) -> Result<()>;

    fn read(&self, id: &str) -> Result<Option<T>>;

    fn update(&self, item: T) -> Result<()>;

    fn delete(&self, id: &str) -> Result<()>;

    fn read_all(&self) -> Result<Vec<T>>;
}

/// The stores a broker or client works with.
#[derive(Clone)]
pub struct RepositoryProvider {
    pub sessions: SessionRepository,
    pub retained: Arc<dyn Repository<RetainedMessage>>,
    pub wills: Arc<dyn Repository<ConnectionWill>>,
}

impl std::fmt::Debug for RepositoryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryProvider").finish_non_exhaustive()
    }
}

impl RepositoryProvider {
    pub fn in_memory() -> Self {
        Self {
            sessions: SessionRepository::new(Arc::new(InMemoryRepository::<ClientSession>::new())),
            retained: Arc::new(InMemoryRepository::new()),
            wills: Arc::new(InMemoryRepository::new()),
        }
    }

    /// Every store in one sled database at `path`.
    pub fn sled(path: &str) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self {
            sessions: SessionRepository::new(Arc::new(SledRepository::<ClientSession>::open(
                &db,
            )?)),
            retained: Arc::new(SledRepository::open(&db)?),
            wills: Arc::new(SledRepository::open(&db)?),
        })
    }

    pub fn from_settings(settings: &StorageSettings) -> Result<Self> {
        match &settings.path {
            Some(path) => Self::sled(path),
            None => Ok(Self::in_memory()),
        }
    }
}
