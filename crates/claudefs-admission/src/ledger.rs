//! Per-zone free-block counters.
//!
//! Each zone's counter sits behind its own lock so unrelated zones never
//! serialize on each other. The device-wide total lives in the limiter state
//! and is updated after the zone lock is dropped; every zone update carries a
//! generation number so the controller can ignore snapshots that reach the
//! aggregate lock out of order.

use parking_lot::Mutex;
use tracing::error;

use crate::error::{AdmissionError, AdmissionResult};

/// Free-block counter of a single zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneFreeCount {
    /// Free erase blocks in the zone.
    pub free: u64,
    /// Number of updates applied since attach.
    pub generation: u64,
}

/// A zone's count as observed right after an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneSnapshot {
    /// Zone index.
    pub zone: u32,
    /// Free erase blocks after the update.
    pub free: u64,
    /// Generation of the update.
    pub generation: u64,
}

/// Per-zone free-block ledger.
pub struct ZoneLedger {
    blocks_per_zone: u64,
    zones: Vec<Mutex<ZoneFreeCount>>,
}

impl ZoneLedger {
    /// Builds the ledger from the allocator's live per-zone free counts.
    pub fn new(blocks_per_zone: u64, zone_free: &[u64]) -> AdmissionResult<Self> {
        if let Some((zone, free)) = zone_free
            .iter()
            .enumerate()
            .find(|(_, free)| **free > blocks_per_zone)
        {
            return Err(AdmissionError::InvalidGeometry {
                reason: format!(
                    "zone {} reports {} free blocks but holds only {}",
                    zone, free, blocks_per_zone
                ),
            });
        }

        let zones = zone_free
            .iter()
            .map(|&free| {
                Mutex::new(ZoneFreeCount {
                    free,
                    generation: 0,
                })
            })
            .collect();

        Ok(Self {
            blocks_per_zone,
            zones,
        })
    }

    /// Number of zones tracked.
    pub fn nr_zones(&self) -> u32 {
        self.zones.len() as u32
    }

    fn zone(&self, zone: u32) -> AdmissionResult<&Mutex<ZoneFreeCount>> {
        self.zones
            .get(zone as usize)
            .ok_or(AdmissionError::UnknownZone {
                zone,
                nr_zones: self.nr_zones(),
            })
    }

    /// Records an erase completion in `zone`.
    pub fn increment(&self, zone: u32) -> AdmissionResult<ZoneSnapshot> {
        let mut count = self.zone(zone)?.lock();
        if count.free >= self.blocks_per_zone {
            error!(
                zone,
                free = count.free,
                blocks_per_zone = self.blocks_per_zone,
                "free block count would exceed zone size"
            );
            return Err(AdmissionError::InvariantViolation(format!(
                "zone {} free count overflow ({} of {})",
                zone, count.free, self.blocks_per_zone
            )));
        }
        count.free += 1;
        count.generation += 1;
        Ok(ZoneSnapshot {
            zone,
            free: count.free,
            generation: count.generation,
        })
    }

    /// Records a block allocation from `zone`.
    pub fn decrement(&self, zone: u32) -> AdmissionResult<ZoneSnapshot> {
        let mut count = self.zone(zone)?.lock();
        if count.free == 0 {
            error!(zone, "free block count underflow");
            return Err(AdmissionError::InvariantViolation(format!(
                "zone {} free count underflow",
                zone
            )));
        }
        count.free -= 1;
        count.generation += 1;
        Ok(ZoneSnapshot {
            zone,
            free: count.free,
            generation: count.generation,
        })
    }

    /// Current free count of `zone`.
    pub fn free_blocks(&self, zone: u32) -> AdmissionResult<u64> {
        Ok(self.zone(zone)?.lock().free)
    }

    /// Current free counts of every zone, each read under its own lock.
    pub fn free_counts(&self) -> Vec<u64> {
        self.zones.iter().map(|z| z.lock().free).collect()
    }
}
