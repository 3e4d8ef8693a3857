//! Admission gate: counting reservations over the staging buffer.
//!
//! Reservations check and increment `reserved_count` under the aggregate
//! lock. A reservation that does not fit parks on the limiter's condition
//! variable behind a FIFO ticket; only the oldest ticket may claim capacity,
//! and every waiter re-checks after each wake-up. Anything that can grow the
//! available capacity (release, a ceiling increase, teardown) mutates state
//! first and notifies under the same lock.

use std::time::{Duration, Instant};

use parking_lot::MutexGuard;
use tracing::{debug, error, info, warn};

use crate::controller::RateLimiterState;
use crate::error::{AdmissionError, AdmissionResult};
use crate::limiter::RateLimiter;

impl RateLimiter {
    /// Reserves `n` staging-buffer slots, blocking until they fit.
    ///
    /// Fails only if the request can never fit or the limiter is shut down.
    pub fn reserve(&self, n: u64) -> AdmissionResult<()> {
        self.reserve_until(n, None)
    }

    /// Like [`RateLimiter::reserve`], but gives up after `timeout`.
    ///
    /// An expired attempt leaves the queue and never touches `reserved_count`.
    /// A timeout too large to represent as a deadline waits without limit.
    pub fn reserve_timeout(&self, n: u64, timeout: Duration) -> AdmissionResult<()> {
        self.reserve_until(n, Instant::now().checked_add(timeout))
    }

    /// Reserves `n` slots only if that is possible right now without
    /// overtaking parked reservations.
    pub fn try_reserve(&self, n: u64) -> AdmissionResult<bool> {
        let mut state = self.state.lock();
        self.check_request(&state, n)?;
        if n == 0 {
            return Ok(true);
        }
        if state.queue.is_empty() && state.fits(n) {
            state.admit(n);
            return Ok(true);
        }
        Ok(false)
    }

    fn check_request(&self, state: &RateLimiterState, n: u64) -> AdmissionResult<()> {
        if state.shut_down {
            return Err(AdmissionError::ShutDown);
        }
        if n > state.full_capacity {
            return Err(AdmissionError::RequestTooLarge {
                requested: n,
                capacity: state.full_capacity,
            });
        }
        Ok(())
    }

    fn reserve_until(&self, n: u64, deadline: Option<Instant>) -> AdmissionResult<()> {
        let mut state = self.state.lock();
        self.check_request(&state, n)?;
        if n == 0 {
            return Ok(());
        }
        if state.queue.is_empty() && state.fits(n) {
            state.admit(n);
            return Ok(());
        }

        let ticket = state.enqueue();
        state.counters.waited += 1;
        let started = Instant::now();
        debug!(
            ticket,
            requested = n,
            reserved = state.reserved_count,
            ceiling = state.admission_ceiling,
            "reservation parked"
        );

        loop {
            if state.shut_down {
                self.leave_queue(&mut state, ticket);
                return Err(AdmissionError::ShutDown);
            }

            if state.is_head(ticket) && state.fits(n) {
                state.queue.pop_front();
                state.admit(n);
                debug!(
                    ticket,
                    requested = n,
                    waited_us = started.elapsed().as_micros() as u64,
                    "reservation admitted after wait"
                );
                if !state.queue.is_empty() {
                    // The next ticket may fit in what is left.
                    self.space.notify_all();
                }
                return Ok(());
            }

            match deadline {
                None => self.space.wait(&mut state),
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        self.leave_queue(&mut state, ticket);
                        state.counters.timed_out += 1;
                        let waited_ms = started.elapsed().as_millis() as u64;
                        warn!(ticket, requested = n, waited_ms, "reservation timed out");
                        return Err(AdmissionError::Timeout {
                            requested: n,
                            waited_ms,
                        });
                    }
                    // Expiry is handled on the next pass, after a final re-check.
                    let _ = self.space.wait_until(&mut state, deadline);
                }
            }
        }
    }

    fn leave_queue(&self, state: &mut MutexGuard<'_, RateLimiterState>, ticket: u64) {
        let was_head = state.is_head(ticket);
        state.withdraw(ticket);
        if was_head && !state.queue.is_empty() {
            self.space.notify_all();
        }
    }

    /// Returns `n` slots once their data has left the staging buffer.
    pub fn release(&self, n: u64) -> AdmissionResult<()> {
        let mut state = self.state.lock();
        if n > state.reserved_count {
            error!(
                released = n,
                reserved = state.reserved_count,
                "reservation count underflow"
            );
            return Err(AdmissionError::InvariantViolation(format!(
                "release of {} slots with only {} reserved",
                n, state.reserved_count
            )));
        }
        state.reserved_count -= n;
        if !state.queue.is_empty() {
            self.space.notify_all();
        }
        Ok(())
    }

    /// Device teardown: fails every parked and future reservation.
    ///
    /// Releases and ledger updates keep working so in-flight data can drain.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        info!(
            waiters = state.queue.len(),
            reserved = state.reserved_count,
            "rate limiter shut down"
        );
        self.space.notify_all();
    }

    /// Whether [`RateLimiter::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.state.lock().shut_down
    }
}
