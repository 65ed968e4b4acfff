use std::sync::Arc;

use parking_lot::Mutex;

use crate::persistence::Repository;
use crate::session::ClientSession;
use crate::utils::error::{MqttError, Result};

/// Session access for the flows.
///
/// Every change is a read-modify-write against the underlying repository, so
/// swapping the store never hides state in a cache. The write lock only
/// serializes those read-modify-write cycles; the repository still decides
/// what a single read or write means.
#[derive(Clone)]
pub struct SessionRepository {
    store: Arc<dyn Repository<ClientSession>>,
    writes: Arc<Mutex<()>>,
}

impl std::fmt::Debug for SessionRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRepository").finish_non_exhaustive()
    }
}

impl SessionRepository {
    pub fn new(store: Arc<dyn Repository<ClientSession>>) -> Self {
        Self {
            store,
            writes: Arc::new(Mutex::new(())),
        }
    }

    pub fn read(&self, client_id: &str) -> Result<Option<ClientSession>> {
        self.store.read(client_id)
    }

    /// Like [`SessionRepository::read`] but a missing session is an error.
    pub fn get(&self, client_id: &str) -> Result<ClientSession> {
        self.read(client_id)?
            .ok_or_else(|| MqttError::SessionNotFound(client_id.to_string()))
    }

    pub fn read_all(&self) -> Result<Vec<ClientSession>> {
        self.store.read_all()
    }

    pub fn create(&self, session: ClientSession) -> Result<()> {
        let _guard = self.writes.lock();
        self.store.create(session)
    }

    pub fn delete(&self, client_id: &str) -> Result<()> {
        let _guard = self.writes.lock();
        self.store.delete(client_id)
    }

    /// Applies `change` to the stored session of `client_id` and writes it back.
    pub fn modify<R>(
        &self,
        client_id: &str,
        change: impl FnOnce(&mut ClientSession) -> R,
    ) -> Result<R> {
        let _guard = self.writes.lock();
        let mut session = self.get(client_id)?;
        let result = change(&mut session);
        self.store.update(session)?;
        Ok(result)
    }
}
