//! Minimal zoned erase-block pool.
//!
//! Stands in for the allocator side of the contract: it owns per-zone free
//! and used lists and reports every allocation and erase completion to the
//! rate limiter's ledger. A zone's pool lock is held across the matching
//! ledger update and is always taken before any limiter lock.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::config::DeviceGeometry;
use crate::error::{AdmissionError, AdmissionResult};
use crate::limiter::RateLimiter;

/// Address of an erase block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockAddr {
    /// Zone index.
    pub zone: u32,
    /// Block index within the zone.
    pub block: u64,
}

#[derive(Debug, Default)]
struct ZoneBlocks {
    free: VecDeque<u64>,
    /// Allocated blocks, oldest first.
    used: VecDeque<u64>,
}

/// Per-zone free/used erase-block lists.
pub struct ZonedBlockPool {
    zones: Vec<Mutex<ZoneBlocks>>,
}

impl ZonedBlockPool {
    /// Builds a pool where the first `used_per_zone[i]` blocks of zone `i`
    /// are already allocated.
    pub fn new(geometry: &DeviceGeometry, used_per_zone: &[u64]) -> AdmissionResult<Self> {
        geometry.validate()?;
        if used_per_zone.len() != geometry.nr_zones as usize {
            return Err(AdmissionError::InvalidGeometry {
                reason: format!(
                    "{} used counts for {} zones",
                    used_per_zone.len(),
                    geometry.nr_zones
                ),
            });
        }

        let mut zones = Vec::with_capacity(used_per_zone.len());
        for (zone, &used) in used_per_zone.iter().enumerate() {
            if used > geometry.blocks_per_zone {
                return Err(AdmissionError::InvalidGeometry {
                    reason: format!(
                        "zone {} has {} used blocks but holds only {}",
                        zone, used, geometry.blocks_per_zone
                    ),
                });
            }
            zones.push(Mutex::new(ZoneBlocks {
                used: (0..used).collect(),
                free: (used..geometry.blocks_per_zone).collect(),
            }));
        }

        Ok(Self { zones })
    }

    fn zone(&self, zone: u32) -> AdmissionResult<&Mutex<ZoneBlocks>> {
        self.zones
            .get(zone as usize)
            .ok_or(AdmissionError::UnknownZone {
                zone,
                nr_zones: self.zones.len() as u32,
            })
    }

    /// Free blocks in `zone`.
    pub fn free_block_count(&self, zone: u32) -> AdmissionResult<u64> {
        Ok(self.zone(zone)?.lock().free.len() as u64)
    }

    /// Free blocks of every zone, in the form the limiter attaches from.
    pub fn free_block_counts(&self) -> Vec<u64> {
        self.zones
            .iter()
            .map(|z| z.lock().free.len() as u64)
            .collect()
    }

    /// Takes a free block from `zone`, or `None` if the zone is exhausted.
    pub fn allocate(&self, zone: u32, limiter: &RateLimiter) -> AdmissionResult<Option<BlockAddr>> {
        let mut blocks = self.zone(zone)?.lock();
        let block = match blocks.free.pop_front() {
            Some(block) => block,
            None => return Ok(None),
        };
        if let Err(e) = limiter.decrement_free(zone) {
            blocks.free.push_front(block);
            return Err(e);
        }
        blocks.used.push_back(block);
        debug!(zone, block, "erase block allocated");
        Ok(Some(BlockAddr { zone, block }))
    }

    /// Oldest allocated block of `zone`, the reclaimer's next victim.
    pub fn oldest_used(&self, zone: u32) -> AdmissionResult<Option<BlockAddr>> {
        Ok(self
            .zone(zone)?
            .lock()
            .used
            .front()
            .map(|&block| BlockAddr { zone, block }))
    }

    /// Erase completion: returns `addr` to its zone's free list.
    pub fn erase(&self, addr: BlockAddr, limiter: &RateLimiter) -> AdmissionResult<()> {
        let mut blocks = self.zone(addr.zone)?.lock();
        let pos = blocks
            .used
            .iter()
            .position(|b| *b == addr.block)
            .ok_or_else(|| {
                error!(zone = addr.zone, block = addr.block, "erase of unallocated block");
                AdmissionError::InvariantViolation(format!(
                    "erase of block {:?} that is not allocated",
                    addr
                ))
            })?;
        limiter.increment_free(addr.zone)?;
        blocks.used.remove(pos);
        blocks.free.push_back(addr.block);
        debug!(zone = addr.zone, block = addr.block, "erase block reclaimed");
        Ok(())
    }
}
