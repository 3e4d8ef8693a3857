//! Hysteresis controller.
//!
//! Owns the lock-protected limiter record and recomputes the admission
//! ceiling and the GC decision from it. Everything here runs with the
//! aggregate lock held.
//!
//! Device-wide bands (free blocks `f`, thresholds `2^low_pow < 2^high_pow`):
//!
//! | Band | Ceiling | Aggregate GC vote |
//! |------|---------|-------------------|
//! | `f >= 2^high_pow` | full buffer | stop |
//! | `2^low_pow < f < 2^high_pow` | `(f >> shift) << addrs_pow` | start |
//! | `f <= 2^low_pow` | 0 | start |
//!
//! A zone is flagged starved once its free count falls below
//! `per_zone_low` and stays flagged until it climbs back to `per_zone_high`.
//! GC runs while the aggregate votes start or any zone is starved.

use std::collections::VecDeque;

use tracing::debug;

use crate::ledger::ZoneSnapshot;
use crate::stats::AdmissionCounters;
use crate::thresholds::Thresholds;
use crate::trigger::GcSignal;

/// Result of one recomputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Recompute {
    /// The ceiling grew, parked reservations must re-check.
    pub ceiling_raised: bool,
    /// Signal to deliver, present only on a change of decision.
    pub signal: Option<GcSignal>,
}

/// The shared limiter record.
#[derive(Debug)]
pub(crate) struct RateLimiterState {
    pub free_blocks: u64,
    pub total_blocks: u64,
    pub full_capacity: u64,
    pub admission_ceiling: u64,
    pub reserved_count: u64,
    pub override_active: bool,
    pub last_signal: Option<GcSignal>,
    zone_starved: Vec<bool>,
    zone_generation: Vec<u64>,
    starved_zones: usize,
    /// Allocations applied to a zone whose matching erase completion has
    /// not reached the aggregate yet.
    pending_debits: u64,
    /// Tickets of parked reservations, oldest first.
    pub queue: VecDeque<u64>,
    pub next_ticket: u64,
    pub shut_down: bool,
    pub counters: AdmissionCounters,
}

impl RateLimiterState {
    pub fn new(
        thresholds: &Thresholds,
        total_blocks: u64,
        full_capacity: u64,
        zone_free: &[u64],
    ) -> Self {
        let zone_starved: Vec<bool> = zone_free
            .iter()
            .map(|&free| free < thresholds.per_zone_low)
            .collect();
        let starved_zones = zone_starved.iter().filter(|s| **s).count();

        Self {
            free_blocks: zone_free.iter().sum(),
            total_blocks,
            full_capacity,
            admission_ceiling: 0,
            reserved_count: 0,
            override_active: false,
            last_signal: None,
            zone_starved,
            zone_generation: vec![0; zone_free.len()],
            starved_zones,
            pending_debits: 0,
            queue: VecDeque::new(),
            next_ticket: 0,
            shut_down: false,
            counters: AdmissionCounters::default(),
        }
    }

    /// Adds one free block to the aggregate, settling a pending debit first.
    pub fn credit_free(&mut self) {
        if self.pending_debits > 0 {
            self.pending_debits -= 1;
        } else {
            self.free_blocks += 1;
        }
    }

    /// Removes one free block from the aggregate.
    ///
    /// The zone ledger has already accepted the allocation, so an aggregate
    /// at zero only means a concurrent erase completion is still on its way
    /// from the zone lock. The debit is parked until that credit lands.
    pub fn debit_free(&mut self) {
        if self.free_blocks > 0 {
            self.free_blocks -= 1;
        } else {
            self.pending_debits += 1;
            debug!(pending = self.pending_debits, "aggregate debit deferred");
        }
    }

    #[cfg(test)]
    pub fn pending_debits(&self) -> u64 {
        self.pending_debits
    }

    pub fn starved_zones(&self) -> usize {
        self.starved_zones
    }

    pub fn zone_starved(&self, zone: u32) -> bool {
        self.zone_starved.get(zone as usize).copied().unwrap_or(false)
    }

    /// Applies a zone's post-update count to its starvation flag.
    fn observe_zone(&mut self, thresholds: &Thresholds, snapshot: ZoneSnapshot) {
        let idx = snapshot.zone as usize;
        if idx >= self.zone_generation.len() || snapshot.generation <= self.zone_generation[idx] {
            return;
        }
        self.zone_generation[idx] = snapshot.generation;

        let was_starved = self.zone_starved[idx];
        let starved = if snapshot.free < thresholds.per_zone_low {
            true
        } else if snapshot.free >= thresholds.per_zone_high {
            false
        } else {
            was_starved
        };

        if starved != was_starved {
            self.zone_starved[idx] = starved;
            if starved {
                self.starved_zones += 1;
            } else {
                self.starved_zones -= 1;
            }
            debug!(
                zone = snapshot.zone,
                free = snapshot.free,
                starved,
                "zone starvation flag changed"
            );
        }
    }

    /// Recomputes the ceiling and GC decision, clearing any override.
    pub fn recompute(&mut self, thresholds: &Thresholds, zone: Option<ZoneSnapshot>) -> Recompute {
        if let Some(snapshot) = zone {
            self.observe_zone(thresholds, snapshot);
        }

        let previous = self.admission_ceiling;
        self.admission_ceiling = thresholds.ceiling_for(self.free_blocks, self.full_capacity);
        self.override_active = false;
        self.counters.recomputes += 1;

        let decision = if thresholds.aggregate_wants_gc(self.free_blocks) || self.starved_zones > 0
        {
            GcSignal::Start
        } else {
            GcSignal::Stop
        };

        let signal = if self.last_signal != Some(decision) {
            self.last_signal = Some(decision);
            match decision {
                GcSignal::Start => self.counters.gc_start_signals += 1,
                GcSignal::Stop => self.counters.gc_stop_signals += 1,
            }
            Some(decision)
        } else {
            None
        };

        if self.admission_ceiling != previous {
            debug!(
                free_blocks = self.free_blocks,
                from = previous,
                to = self.admission_ceiling,
                "admission ceiling changed"
            );
        }

        Recompute {
            ceiling_raised: self.admission_ceiling > previous,
            signal,
        }
    }

    /// Whether `n` more slots fit under the ceiling.
    pub fn fits(&self, n: u64) -> bool {
        self.reserved_count
            .checked_add(n)
            .is_some_and(|total| total <= self.admission_ceiling)
    }

    /// Takes `n` slots. Callers check [`Self::fits`] first under the same lock.
    pub fn admit(&mut self, n: u64) {
        self.reserved_count += n;
        self.counters.admitted += 1;
    }

    /// Queues a new ticket behind every parked reservation.
    pub fn enqueue(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        self.queue.push_back(ticket);
        ticket
    }

    /// Removes a ticket that gives up waiting.
    pub fn withdraw(&mut self, ticket: u64) {
        if let Some(pos) = self.queue.iter().position(|t| *t == ticket) {
            self.queue.remove(pos);
        }
    }

    pub fn is_head(&self, ticket: u64) -> bool {
        self.queue.front() == Some(&ticket)
    }
}
