// src/workqueue/manifest.rs

//! In-memory registry seeded from the `[unit.<id>]` manifest.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::dag::UnitSpec;
use crate::types::{UnitId, UnitStatus};

use super::{
    incomplete_among, ready_entries, RegistryEntry, RegistryError, RegistryFuture, UnitRef,
    WorkQueueClient,
};

/// Registry that lives inside the process.
///
/// Used for `--once` runs driven purely by the config file, and by tests. It
/// can be switched offline to exercise the orchestrator's degraded mode.
#[derive(Debug, Default)]
pub struct ManifestRegistry {
    entries: Mutex<Vec<RegistryEntry>>,
    offline: AtomicBool,
}

impl ManifestRegistry {
    pub fn new<'a, I>(units: I) -> Self
    where
        I: IntoIterator<Item = &'a UnitSpec>,
    {
        let entries = units
            .into_iter()
            .map(|spec| RegistryEntry {
                unit: UnitRef::from(spec),
                status: UnitStatus::Pending,
                detail: None,
            })
            .collect();

        Self {
            entries: Mutex::new(entries),
            offline: AtomicBool::new(false),
        }
    }

    /// Simulate an outage: every call fails with `Unavailable` while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Current status of a unit, if the registry knows it.
    pub fn status_of(&self, unit: &str) -> Option<UnitStatus> {
        self.entries()
            .iter()
            .find(|e| e.unit.id == unit)
            .map(|e| e.status)
    }

    /// Mark a unit completed out of band, as another builder would.
    pub fn mark_completed(&self, unit: &str) {
        let mut entries = self.entries();
        match entries.iter_mut().find(|e| e.unit.id == unit) {
            Some(entry) => entry.status = UnitStatus::Completed,
            None => entries.push(RegistryEntry {
                unit: UnitRef::from(&UnitSpec::new(unit)),
                status: UnitStatus::Completed,
                detail: None,
            }),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<RegistryEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_online(&self) -> Result<(), RegistryError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(RegistryError::Unavailable(
                "manifest registry is offline".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

impl WorkQueueClient for ManifestRegistry {
    fn fetch_ready(&self) -> RegistryFuture<'_, Vec<UnitRef>> {
        Box::pin(async move {
            self.check_online()?;
            Ok(ready_entries(&self.entries()))
        })
    }

    fn report_status(
        &self,
        unit: UnitId,
        status: UnitStatus,
        detail: Option<String>,
    ) -> RegistryFuture<'_, ()> {
        Box::pin(async move {
            self.check_online()?;
            let mut entries = self.entries();
            match entries.iter_mut().find(|e| e.unit.id == unit) {
                Some(entry) => {
                    entry.status = status;
                    entry.detail = detail;
                }
                None => {
                    debug!(unit = %unit, %status, "status for unit unknown to manifest; recording");
                    entries.push(RegistryEntry {
                        unit: UnitRef::from(&UnitSpec::new(unit)),
                        status,
                        detail,
                    });
                }
            }
            Ok(())
        })
    }

    fn incomplete_dependencies(&self, deps: Vec<UnitId>) -> RegistryFuture<'_, Vec<UnitId>> {
        Box::pin(async move {
            self.check_online()?;
            Ok(incomplete_among(&self.entries(), &deps))
        })
    }
}
