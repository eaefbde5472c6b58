use crate::error::Result;
use crate::DynDatabase;
use std::time::Duration;

/// A named TTL lock in the store, owned by this handle.
///
/// The lock expires on its own unless [`Lock::refresh`] is called before
/// `ttl` elapses, so a crashed owner never blocks others for long.
pub struct Lock {
    db: DynDatabase,
    name: String,
    owner: String,
    ttl: Duration,
    held: bool,
}

impl Lock {
    pub fn new(db: DynDatabase, name: impl Into<String>, ttl: Duration) -> Self {
        Self {
            db,
            name: name.into(),
            owner: moira_common::id::next_id(),
            ttl,
            held: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Tries once to take the lock.
    pub async fn try_acquire(&mut self) -> Result<bool> {
        self.held = self.db.acquire_lock(&self.name, &self.owner, self.ttl).await?;
        Ok(self.held)
    }

    /// Extends the expiry. Returns `false` and marks the lock lost when
    /// another owner took it meanwhile.
    pub async fn refresh(&mut self) -> Result<bool> {
        if !self.held {
            return Ok(false);
        }
        self.held = self.db.extend_lock(&self.name, &self.owner, self.ttl).await?;
        if !self.held {
            tracing::warn!(lock = %self.name, "Lock lost before refresh");
        }
        Ok(self.held)
    }

    pub async fn release(&mut self) -> Result<()> {
        if self.held {
            self.held = false;
            self.db.release_lock(&self.name, &self.owner).await?;
        }
        Ok(())
    }
}
