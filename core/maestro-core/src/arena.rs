//! The session arena: the pool, the shared session state and the registry,
//! owned together by the master.
//!
//! Slaves never touch the arena directly. They receive a [`Welcome`] when
//! they register and read everything else through coordinator requests.

use maestro_protocol::{ParticipantId, SessionSnapshot, Welcome};
use tracing::{info, warn};

use crate::error::{MaestroError, Result};
use crate::pool::MemoryPool;
use crate::registry::{AppRecord, AppRegistry};

pub const ARENA_NAME: &str = "maestro";

/// Session-wide values every shell process reads.
#[derive(Debug)]
pub struct SessionState {
    status_bar_height: u32,
    osk_text: String,
    osk_text_capacity: usize,
}

impl SessionState {
    /// Builds the session state, reserving the OSK text buffer from `pool`.
    pub fn new(pool: &mut MemoryPool, status_bar_height: u32, osk_text_capacity: usize) -> Result<Self> {
        pool.reserve(osk_text_capacity)?;
        Ok(Self {
            status_bar_height,
            osk_text: String::new(),
            osk_text_capacity,
        })
    }

    pub fn status_bar_height(&self) -> u32 {
        self.status_bar_height
    }

    pub fn set_status_bar_height(&mut self, height: u32) {
        self.status_bar_height = height;
    }

    pub fn osk_text(&self) -> &str {
        &self.osk_text
    }

    pub fn osk_text_capacity(&self) -> usize {
        self.osk_text_capacity
    }

    pub fn set_osk_text(&mut self, text: &str) -> Result<()> {
        if text.len() > self.osk_text_capacity {
            return Err(MaestroError::OskTextTooLong {
                len: text.len(),
                capacity: self.osk_text_capacity,
            });
        }
        self.osk_text.clear();
        self.osk_text.push_str(text);
        Ok(())
    }
}

#[derive(Debug)]
pub struct Arena {
    name: String,
    world_index: u32,
    pool: MemoryPool,
    session: SessionState,
    registry: AppRegistry,
}

impl Arena {
    /// Creates the arena. `init` runs exactly once, against the fresh pool,
    /// to build the session state.
    pub fn create<F>(
        name: &str,
        world_index: u32,
        mut pool: MemoryPool,
        registry_capacity: usize,
        init: F,
    ) -> Result<Arena>
    where
        F: FnOnce(&mut MemoryPool) -> Result<SessionState>,
    {
        let session = init(&mut pool)?;
        info!(
            arena = name,
            world = world_index,
            pool_bytes = pool.capacity(),
            registry_capacity,
            "Created session arena"
        );
        Ok(Arena {
            name: name.to_string(),
            world_index,
            pool,
            session,
            registry: AppRegistry::with_capacity(registry_capacity),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn world_index(&self) -> u32 {
        self.world_index
    }

    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut SessionState {
        &mut self.session
    }

    pub fn registry(&self) -> &AppRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut AppRegistry {
        &mut self.registry
    }

    /// Charges the record's footprint and adds it to the registry.
    pub fn admit(&mut self, record: AppRecord) -> Result<usize> {
        if self.registry.is_full() {
            return Err(MaestroError::RegistryFull {
                capacity: self.registry.capacity(),
            });
        }
        self.pool.reserve(record.footprint())?;
        let footprint = record.footprint();
        self.registry.add(record).inspect_err(|_| self.pool.release(footprint))
    }

    /// Removes a record and refunds its footprint.
    pub fn evict(&mut self, id: ParticipantId) -> Option<AppRecord> {
        let record = self.registry.remove(id)?;
        self.pool.release(record.footprint());
        Some(record)
    }

    pub fn retitle(&mut self, id: ParticipantId, title: &str) -> Result<()> {
        let record = self
            .registry
            .get_mut(id)
            .ok_or(MaestroError::NotRegistered(id))?;
        let old = record.footprint();
        let new = old - record.title.len() + title.len();
        self.pool.recharge(old, new)?;
        record.title = title.to_string();
        Ok(())
    }

    pub fn welcome(&self, participant_id: ParticipantId) -> Welcome {
        Welcome {
            participant_id,
            role: participant_id.role(),
            world_index: self.world_index,
            arena: self.name.clone(),
            status_bar_height: self.session.status_bar_height,
            osk_text_capacity: self.session.osk_text_capacity,
        }
    }

    pub fn snapshot(&self, foreground: Option<ParticipantId>) -> SessionSnapshot {
        SessionSnapshot {
            arena: self.name.clone(),
            world_index: self.world_index,
            status_bar_height: self.session.status_bar_height,
            osk_text: self.session.osk_text.clone(),
            osk_text_capacity: self.session.osk_text_capacity,
            foreground,
        }
    }

    /// Tears the arena down. An emergency leave skips the leftover-record
    /// audit; records may legitimately remain after a crash.
    pub fn leave(self, emergency: bool) {
        if !emergency && !self.registry.is_empty() {
            let leftover: Vec<_> = self
                .registry
                .iter()
                .map(|record| record.participant_id.0)
                .collect();
            warn!(arena = %self.name, ?leftover, "Arena torn down with registered apps");
        }
        info!(
            arena = %self.name,
            emergency,
            pool_used = self.pool.used(),
            "Left session arena"
        );
    }
}
