//! Session pool: opaque id → live database session.
//!
//! The lock guards only the map; it is never held while a session is used.
//! Every subscriber-scoped task holds its id through a [`PooledSession`],
//! which removes the entry when the task ends, however it ends.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use uuid::Uuid;

use crate::error::StoreError;

#[derive(Debug)]
pub struct ConnectionPool<S> {
    sessions: RwLock<HashMap<Uuid, S>>,
}

impl<S> Default for ConnectionPool<S> {
    fn default() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl<S: Clone> ConnectionPool<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under a fresh random id.
    pub fn create(&self, session: S) -> Uuid {
        let id = Uuid::new_v4();
        self.write().insert(id, session);
        id
    }

    pub fn get(&self, id: Uuid) -> Result<S, StoreError> {
        self.read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::SessionNotFound(id))
    }

    /// Remove a session. The session is returned so the caller can close it.
    pub fn destroy(&self, id: Uuid) -> Option<S> {
        self.write().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Uuid, S>> {
        match self.sessions.read() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("connection pool read lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, S>> {
        match self.sessions.write() {
            Ok(g) => g,
            Err(poisoned) => {
                tracing::warn!("connection pool write lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

/// Scoped ownership of one pool entry; destroyed on drop.
#[derive(Debug)]
pub struct PooledSession<S: Clone> {
    id: Uuid,
    pool: Arc<ConnectionPool<S>>,
}

impl<S: Clone> PooledSession<S> {
    pub fn acquire(pool: &Arc<ConnectionPool<S>>, session: S) -> Self {
        let id = pool.create(session);
        tracing::debug!(session = %id, "session opened");
        Self {
            id,
            pool: Arc::clone(pool),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Look the session up in the pool.
    pub fn session(&self) -> Result<S, StoreError> {
        self.pool.get(self.id)
    }
}

impl<S: Clone> Drop for PooledSession<S> {
    fn drop(&mut self) {
        if self.pool.destroy(self.id).is_some() {
            tracing::debug!(session = %self.id, "session closed");
        }
    }
}
