//! Surface lock.
//!
//! Freezes a platform so the scanner sees a stable graph: in-flight
//! deliveries are forced to land, freezable entities are deactivated after
//! their prior active flag is recorded, and the platform is hidden and
//! paused. [`LockTable::unlock`] reverses all of it from the stored
//! [`LockRecord`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::fixed::Ticks;
use crate::id::StableId;
use crate::model::Schedule;
use crate::scanner::stable_id;
use crate::world::{World, WorldError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// How many times to ask the world to land pending deliveries before
    /// giving up.
    pub delivery_flush_attempts: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            delivery_flush_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("platform '{0}' is already locked")]
    AlreadyLocked(String),
    #[error("platform '{platform}' still has {pending} deliveries in flight")]
    PendingDeliveries { platform: String, pending: u32 },
    #[error("platform '{0}' not found")]
    PlatformNotFound(String),
    #[error("platform '{0}' is not locked")]
    NotLocked(String),
    #[error("cannot freeze platform '{platform}': {source}")]
    World { platform: String, source: WorldError },
}

/// Everything needed to undo a lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub platform: String,
    /// Active flag of each freezable entity before it was frozen.
    pub frozen_states: BTreeMap<StableId, bool>,
    pub was_hidden: bool,
    pub original_schedule: Option<Schedule>,
    pub was_paused: bool,
    pub locked_at: Ticks,
}

/// Result of an unlock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlockOutcome {
    /// Entities whose active flag was written back.
    pub restored: usize,
    /// Whether the platform still existed.
    pub platform_present: bool,
}

/// Process-wide table of held locks, keyed by platform name.
#[derive(Debug, Default)]
pub struct LockTable {
    records: BTreeMap<String, LockRecord>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock a platform. Fails without touching the world if the platform is
    /// already locked or missing; fails after flushing (but before freezing
    /// anything) if deliveries remain airborne or the world rejects a
    /// platform flag write.
    pub fn lock(
        &mut self,
        world: &mut dyn World,
        platform: &str,
        config: &LockConfig,
    ) -> Result<&LockRecord, LockError> {
        if self.records.contains_key(platform) {
            return Err(LockError::AlreadyLocked(platform.to_string()));
        }
        let info = world
            .platform(platform)
            .ok_or_else(|| LockError::PlatformNotFound(platform.to_string()))?;

        let mut pending = 0;
        for _ in 0..config.delivery_flush_attempts.max(1) {
            pending = world.flush_deliveries(platform).pending;
            if pending == 0 {
                break;
            }
        }
        if pending > 0 {
            tracing::warn!(platform, pending, "lock_pending_deliveries");
            return Err(LockError::PendingDeliveries {
                platform: platform.to_string(),
                pending,
            });
        }

        // Platform flags go first so a rejected write leaves every entity
        // as it was.
        let flags = world
            .set_platform_hidden(platform, true)
            .and_then(|()| world.set_platform_schedule(platform, None))
            .and_then(|()| world.set_platform_paused(platform, true));
        if let Err(source) = flags {
            restore_platform(world, platform, info.hidden, info.schedule.clone(), info.paused);
            tracing::warn!(platform, error = %source, "lock_platform_write_failed");
            return Err(LockError::World {
                platform: platform.to_string(),
                source,
            });
        }

        // Record before deactivating: an entity already switched off by a
        // circuit condition must come back switched off.
        let mut frozen_states = BTreeMap::new();
        for entity in world.entities(info.surface) {
            let Some(view) = world.entity(entity) else {
                continue;
            };
            if !view.category.is_freezable() {
                continue;
            }
            frozen_states.insert(stable_id(&view), view.active);
            world.set_active(entity, false);
        }

        let record = LockRecord {
            platform: platform.to_string(),
            frozen_states,
            was_hidden: info.hidden,
            original_schedule: info.schedule,
            was_paused: info.paused,
            locked_at: world.current_tick(),
        };
        tracing::info!(platform, frozen = record.frozen_states.len(), "platform_locked");
        Ok(self.records.entry(platform.to_string()).or_insert(record))
    }

    /// Undo a lock and delete its record. Safe when the platform itself is
    /// gone: the record is simply dropped.
    pub fn unlock(
        &mut self,
        world: &mut dyn World,
        platform: &str,
    ) -> Result<UnlockOutcome, LockError> {
        let record = self
            .records
            .remove(platform)
            .ok_or_else(|| LockError::NotLocked(platform.to_string()))?;

        let Some(info) = world.platform(platform) else {
            tracing::info!(platform, "unlock_platform_missing");
            return Ok(UnlockOutcome {
                restored: 0,
                platform_present: false,
            });
        };

        let mut restored = 0;
        for entity in world.entities(info.surface) {
            let Some(view) = world.entity(entity) else {
                continue;
            };
            if let Some(&active) = record.frozen_states.get(&stable_id(&view)) {
                if world.set_active(entity, active) {
                    restored += 1;
                }
            }
        }
        restore_platform(
            world,
            platform,
            record.was_hidden,
            record.original_schedule,
            record.was_paused,
        );

        tracing::info!(platform, restored, "platform_unlocked");
        Ok(UnlockOutcome {
            restored,
            platform_present: true,
        })
    }

    pub fn is_locked(&self, platform: &str) -> bool {
        self.records.contains_key(platform)
    }

    pub fn get(&self, platform: &str) -> Option<&LockRecord> {
        self.records.get(platform)
    }

    /// Drop a record without touching the world (the platform was deleted).
    pub fn discard(&mut self, platform: &str) -> Option<LockRecord> {
        self.records.remove(platform)
    }

    /// Names of all locked platforms, sorted.
    pub fn platforms(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }
}

/// Write back a platform's visibility, schedule and pause flag, logging
/// any write the world rejects.
fn restore_platform(
    world: &mut dyn World,
    platform: &str,
    hidden: bool,
    schedule: Option<Schedule>,
    paused: bool,
) {
    if let Err(err) = world.set_platform_hidden(platform, hidden) {
        tracing::warn!(platform, error = %err, "platform_visibility_restore_failed");
    }
    if let Err(err) = world.set_platform_schedule(platform, schedule) {
        tracing::warn!(platform, error = %err, "platform_schedule_restore_failed");
    }
    if let Err(err) = world.set_platform_paused(platform, paused) {
        tracing::warn!(platform, error = %err, "platform_pause_restore_failed");
    }
}
