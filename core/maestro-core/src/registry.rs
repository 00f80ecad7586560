//! The session's table of running apps.
//!
//! Records are kept in registration order; the position of a record is its
//! `index` in snapshots and shifts down when earlier records are removed.
//! Every mutation publishes the new population to a [`PopulationWatch`] so
//! the supervisor can block on "N apps have registered" without polling.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use maestro_protocol::{AppMode, AppRecordSnapshot, ParticipantId, Role};

use crate::error::{MaestroError, Result};
use crate::pool::RECORD_OVERHEAD_BYTES;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppRecord {
    pub participant_id: ParticipantId,
    pub role: Role,
    pub pid: u32,
    /// Process start time, used to tell a live pid from a recycled one.
    pub proc_started: Option<u64>,
    pub title: String,
    pub process_path: String,
    pub mode: AppMode,
    pub registered_at: DateTime<Utc>,
}

impl AppRecord {
    pub fn new(
        participant_id: ParticipantId,
        pid: u32,
        title: impl Into<String>,
        process_path: impl Into<String>,
    ) -> Self {
        Self {
            participant_id,
            role: participant_id.role(),
            pid,
            proc_started: None,
            title: title.into(),
            process_path: process_path.into(),
            mode: AppMode::None,
            registered_at: Utc::now(),
        }
    }

    /// Bytes this record charges against the memory pool.
    pub fn footprint(&self) -> usize {
        RECORD_OVERHEAD_BYTES + self.title.len() + self.process_path.len()
    }

    pub fn snapshot(&self, index: usize) -> AppRecordSnapshot {
        AppRecordSnapshot {
            index,
            participant_id: self.participant_id,
            role: self.role,
            pid: self.pid,
            title: self.title.clone(),
            process_path: self.process_path.clone(),
            mode: self.mode,
            registered_at: self.registered_at,
        }
    }
}

#[derive(Debug)]
pub struct AppRegistry {
    capacity: usize,
    records: Vec<AppRecord>,
    population: PopulationWatch,
}

impl AppRegistry {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            records: Vec::with_capacity(capacity),
            population: PopulationWatch::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    /// Appends a record and returns its index.
    pub fn add(&mut self, record: AppRecord) -> Result<usize> {
        if self.is_full() {
            return Err(MaestroError::RegistryFull {
                capacity: self.capacity,
            });
        }
        self.records.push(record);
        self.population.publish(self.records.len());
        Ok(self.records.len() - 1)
    }

    pub fn remove(&mut self, id: ParticipantId) -> Option<AppRecord> {
        let index = self.index_of(id)?;
        let record = self.records.remove(index);
        self.population.publish(self.records.len());
        Some(record)
    }

    pub fn index_of(&self, id: ParticipantId) -> Option<usize> {
        self.records
            .iter()
            .position(|record| record.participant_id == id)
    }

    pub fn at(&self, index: usize) -> Option<&AppRecord> {
        self.records.get(index)
    }

    pub fn get(&self, id: ParticipantId) -> Option<&AppRecord> {
        self.records.iter().find(|record| record.participant_id == id)
    }

    pub fn get_mut(&mut self, id: ParticipantId) -> Option<&mut AppRecord> {
        self.records
            .iter_mut()
            .find(|record| record.participant_id == id)
    }

    pub fn contains(&self, id: ParticipantId) -> bool {
        self.get(id).is_some()
    }

    pub fn find<P>(&self, mut predicate: P) -> Option<&AppRecord>
    where
        P: FnMut(&AppRecord) -> bool,
    {
        self.records.iter().find(|record| predicate(record))
    }

    pub fn find_by_path(&self, path: &str) -> Option<&AppRecord> {
        self.find(|record| record.process_path == path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AppRecord> {
        self.records.iter()
    }

    pub fn snapshot(&self) -> Vec<AppRecordSnapshot> {
        self.records
            .iter()
            .enumerate()
            .map(|(index, record)| record.snapshot(index))
            .collect()
    }

    pub fn population(&self) -> PopulationWatch {
        self.population.clone()
    }
}

/// Shared view of the registry's record count.
#[derive(Debug, Clone, Default)]
pub struct PopulationWatch {
    inner: Arc<(Mutex<usize>, Condvar)>,
}

impl PopulationWatch {
    pub fn current(&self) -> usize {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, population: usize) {
        let (lock, condvar) = &*self.inner;
        *lock.lock().unwrap_or_else(PoisonError::into_inner) = population;
        condvar.notify_all();
    }

    /// Blocks until `predicate` holds for the population or `timeout`
    /// elapses. Returns the last observed population either way.
    pub fn wait_until<P>(&self, timeout: Duration, predicate: P) -> std::result::Result<usize, usize>
    where
        P: Fn(usize) -> bool,
    {
        let (lock, condvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = condvar
            .wait_timeout_while(guard, timeout, |population| !predicate(*population))
            .unwrap_or_else(PoisonError::into_inner);
        if predicate(*guard) {
            Ok(*guard)
        } else {
            Err(*guard)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn record(id: u32, path: &str) -> AppRecord {
        AppRecord::new(ParticipantId(id), 100 + id, format!("app {}", id), path)
    }

    #[test]
    fn records_keep_registration_order() {
        let mut registry = AppRegistry::with_capacity(4);
        assert_eq!(registry.add(record(2, "/bin/bar")).expect("add"), 0);
        assert_eq!(registry.add(record(3, "/bin/osk")).expect("add"), 1);
        assert_eq!(registry.add(record(4, "/bin/home")).expect("add"), 2);

        registry.remove(ParticipantId(3)).expect("remove");
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[1].participant_id, ParticipantId(4));
        assert_eq!(snapshot[1].index, 1);
        assert_eq!(snapshot[1].role, Role::Launcher);
    }

    #[test]
    fn add_fails_when_full() {
        let mut registry = AppRegistry::with_capacity(1);
        registry.add(record(2, "/bin/bar")).expect("add");
        let err = registry.add(record(3, "/bin/osk")).expect_err("full");
        assert!(matches!(err, MaestroError::RegistryFull { capacity: 1 }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookups_by_id_and_path() {
        let mut registry = AppRegistry::with_capacity(4);
        registry.add(record(2, "/bin/bar")).expect("add");
        registry.add(record(5, "/opt/app")).expect("add");

        assert_eq!(
            registry.find_by_path("/opt/app").map(|r| r.participant_id),
            Some(ParticipantId(5))
        );
        assert!(registry.find_by_path("/missing").is_none());
        assert_eq!(registry.index_of(ParticipantId(5)), Some(1));
        assert!(registry.remove(ParticipantId(9)).is_none());
    }

    #[test]
    fn footprint_counts_strings() {
        let record = AppRecord::new(ParticipantId(5), 1, "abc", "/x");
        assert_eq!(record.footprint(), RECORD_OVERHEAD_BYTES + 5);
    }

    #[test]
    fn population_watch_wakes_waiters() {
        let mut registry = AppRegistry::with_capacity(4);
        let watch = registry.population();
        let waiter = thread::spawn(move || watch.wait_until(Duration::from_secs(5), |n| n >= 2));

        registry.add(record(2, "/bin/bar")).expect("add");
        registry.add(record(3, "/bin/osk")).expect("add");
        assert_eq!(waiter.join().expect("join"), Ok(2));
    }

    #[test]
    fn population_watch_times_out() {
        let registry = AppRegistry::with_capacity(4);
        let watch = registry.population();
        assert_eq!(
            watch.wait_until(Duration::from_millis(20), |n| n > 0),
            Err(0)
        );
    }
}
