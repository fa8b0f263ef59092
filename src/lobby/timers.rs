//! Room Timers
//!
//! Delayed lobby transitions. Each timer carries the room's epoch at
//! scheduling time; the room manager ignores timers whose room is gone or
//! whose epoch has moved on.

use std::time::{Duration, Instant};

use crate::lobby::room::RoomId;

/// What a timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// End of the pre-game freeze.
    PreGameFreeze,
    /// Kickoff delay elapsed; the match starts.
    Kickoff,
    /// Post-match pause elapsed; reset or set up the next match.
    MatchReset,
}

/// A scheduled timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTimer {
    pub due: Instant,
    pub room_id: RoomId,
    pub epoch: u64,
    pub kind: TimerKind,
}

/// Pending timers for every room.
#[derive(Debug, Default)]
pub struct Timers {
    pending: Vec<PendingTimer>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, now: Instant, delay: Duration, room_id: RoomId, epoch: u64, kind: TimerKind) {
        self.pending.push(PendingTimer { due: now + delay, room_id, epoch, kind });
    }

    /// Drop every timer for a room. Returns how many were dropped.
    pub fn cancel_room(&mut self, room_id: &str) -> usize {
        let before = self.pending.len();
        self.pending.retain(|t| t.room_id != room_id);
        before - self.pending.len()
    }

    /// Remove and return timers due at `now`, earliest first.
    pub fn poll(&mut self, now: Instant) -> Vec<PendingTimer> {
        let (mut due, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|t| t.due <= now);
        self.pending = rest;
        due.sort_by_key(|t| t.due);
        due
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.pending.iter().map(|t| t.due).min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_due_in_order() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.schedule(now, Duration::from_secs(3), "a".into(), 0, TimerKind::PreGameFreeze);
        timers.schedule(now, Duration::from_secs(1), "b".into(), 0, TimerKind::Kickoff);
        timers.schedule(now, Duration::from_secs(5), "c".into(), 0, TimerKind::MatchReset);

        assert!(timers.poll(now).is_empty());
        assert_eq!(timers.next_due(), Some(now + Duration::from_secs(1)));

        let due = timers.poll(now + Duration::from_secs(3));
        let rooms: Vec<_> = due.iter().map(|t| t.room_id.as_str()).collect();
        assert_eq!(rooms, vec!["b", "a"]);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_cancel_room() {
        let now = Instant::now();
        let mut timers = Timers::new();
        timers.schedule(now, Duration::from_secs(1), "a".into(), 0, TimerKind::PreGameFreeze);
        timers.schedule(now, Duration::from_secs(2), "a".into(), 0, TimerKind::Kickoff);
        timers.schedule(now, Duration::from_secs(1), "b".into(), 0, TimerKind::Kickoff);

        assert_eq!(timers.cancel_room("a"), 2);
        assert_eq!(timers.poll(now + Duration::from_secs(10)).len(), 1);
        assert!(timers.is_empty());
    }
}
