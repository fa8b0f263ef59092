//! Tick Scheduling
//!
//! [`TickScheduler`] holds every live simulation behind generational
//! handles; [`TickClock`] turns wall-clock wakeups into a whole number of
//! fixed ticks, correcting its own sleep for drift.

use std::time::{Duration, Instant};

use tracing::warn;

// =============================================================================
// SCHEDULER
// =============================================================================

/// Handle to a registered instance. Stale handles never resolve.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TickHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Arena of instances ticked in registration-slot order.
#[derive(Debug)]
pub struct TickScheduler<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: usize,
}

impl<T> Default for TickScheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TickScheduler<T> {
    pub fn new() -> Self {
        Self { slots: Vec::new(), free: Vec::new(), live: 0 }
    }

    /// Register an instance; it is ticked from the next pass on.
    pub fn register(&mut self, value: T) -> TickHandle {
        self.live += 1;

        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.value = Some(value);
            return TickHandle { index, generation: slot.generation };
        }

        let index = self.slots.len() as u32;
        self.slots.push(Slot { generation: 0, value: Some(value) });
        TickHandle { index, generation: 0 }
    }

    /// Remove an instance. Its handle and any copies become stale.
    pub fn unregister(&mut self, handle: TickHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }

        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.live -= 1;
        Some(value)
    }

    pub fn get(&self, handle: TickHandle) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: TickHandle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_mut())
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Live handles in slot order.
    pub fn handles(&self) -> Vec<TickHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.value.is_some())
            .map(|(i, s)| TickHandle { index: i as u32, generation: s.generation })
            .collect()
    }

    /// Run `ticks` passes, calling `f` on every live instance per pass.
    pub fn run_ticks<F>(&mut self, ticks: u32, mut f: F)
    where
        F: FnMut(TickHandle, &mut T),
    {
        for _ in 0..ticks {
            for (i, slot) in self.slots.iter_mut().enumerate() {
                if let Some(value) = slot.value.as_mut() {
                    f(TickHandle { index: i as u32, generation: slot.generation }, value);
                }
            }
        }
    }
}

// =============================================================================
// CLOCK
// =============================================================================

/// Drift-correcting fixed-rate clock.
///
/// Each wake measures how late it fired and shortens the next sleep by the
/// same amount. Elapsed time accumulates and is paid out as whole ticks.
#[derive(Debug, Clone)]
pub struct TickClock {
    target: Duration,
    sleep: Duration,
    then: Instant,
    accumulator: Duration,
    max_catch_up: u32,
}

impl TickClock {
    pub fn new(tick_rate: u32, now: Instant) -> Self {
        let target = Duration::from_secs_f64(1.0 / f64::from(tick_rate.max(1)));
        Self {
            target,
            sleep: target,
            then: now,
            accumulator: Duration::ZERO,
            max_catch_up: tick_rate.max(1),
        }
    }

    /// Cap on ticks paid out by one wake; the excess backlog is dropped.
    pub fn with_max_catch_up(mut self, ticks: u32) -> Self {
        self.max_catch_up = ticks.max(1);
        self
    }

    pub fn interval(&self) -> Duration {
        self.target
    }

    pub fn next_sleep(&self) -> Duration {
        self.sleep
    }

    /// Instant the next wake is due.
    pub fn next_wake(&self) -> Instant {
        self.then + self.sleep
    }

    /// Account for a wake at `now` and return how many ticks are due.
    pub fn wake(&mut self, now: Instant) -> u32 {
        let actual = now.saturating_duration_since(self.then);
        self.then = now;

        let drift = actual.as_secs_f64() - self.sleep.as_secs_f64();
        let corrected = (self.target.as_secs_f64() - drift)
            .clamp(0.0, self.target.as_secs_f64() * 2.0);
        self.sleep = Duration::from_secs_f64(corrected);

        self.accumulator += actual;
        let due = (self.accumulator.as_nanos() / self.target.as_nanos().max(1)) as u64;
        self.accumulator -= self.target * due as u32;

        if due > u64::from(self.max_catch_up) {
            warn!(due, cap = self.max_catch_up, "Tick backlog exceeded catch-up cap; dropping");
            self.accumulator = Duration::ZERO;
            return self.max_catch_up;
        }

        due as u32
    }
}

// =============================================================================
// TESTS
// =============================================================================
