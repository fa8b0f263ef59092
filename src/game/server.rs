//! Authoritative Simulator
//!
//! Owns the event queue for one room, applies inputs in arrival order and
//! decides when clients need a resync, a snapshot or a new round.

use std::collections::VecDeque;

use tracing::{debug, instrument};

use crate::core::rng::DeterministicRng;
use crate::core::sizes::BoardSizes;
use crate::game::events::{EventKind, GameUpdate, PlayerEvent, SimEvent, SimEventData};
use crate::game::physics::{BallData, PADDLE_NORMALS, SIDE_COUNT};
use crate::game::state::{BallStep, PhysicsStep, PlayerId, SimState, TickError};

/// Timing knobs for the server simulator.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSimConfig {
    /// Ticks between full-state snapshots.
    pub snapshot_interval: u64,
    /// Ticks between per-player resyncs.
    pub resync_interval: u64,
    /// Match length in ticks.
    pub match_duration_ticks: u32,
    /// Ticks between a round arming and the kickoff.
    pub round_countdown_ticks: u32,
    /// Acceptable lead of client ticks over server ticks, inclusive.
    pub offset_window: (i64, i64),
    /// Maximum kickoff deviation from straight at a side, in degrees.
    pub kickoff_spread_degrees: f64,
}

impl Default for ServerSimConfig {
    fn default() -> Self {
        Self {
            snapshot_interval: 300,
            resync_interval: 20,
            match_duration_ticks: crate::MATCH_DURATION_TICKS,
            round_countdown_ticks: 180,
            offset_window: (1, 2),
            kickoff_spread_degrees: 30.0,
        }
    }
}

/// A queued input tagged with the paddle it drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedEvent {
    pub paddle_index: usize,
    pub event: PlayerEvent,
}

/// Server-side simulator for one match.
#[derive(Debug)]
pub struct ServerSimulator {
    core: SimState,
    players: [Option<PlayerId>; SIDE_COUNT],
    verified_event_ids: [u64; SIDE_COUNT],
    queue: VecDeque<QueuedEvent>,
    config: ServerSimConfig,
    timer: u32,
    running: bool,
    finished: bool,
    rng: DeterministicRng,
}

impl ServerSimulator {
    /// Create a simulator; players take paddle indices in the order given.
    /// Anything past the fourth player is ignored.
    pub fn new(
        players: &[PlayerId],
        sizes: BoardSizes,
        config: ServerSimConfig,
        rng: DeterministicRng,
    ) -> Self {
        let mut slots: [Option<PlayerId>; SIDE_COUNT] = Default::default();
        let mut mask = 0u8;
        for (index, player) in players.iter().take(SIDE_COUNT).enumerate() {
            slots[index] = Some(player.clone());
            mask |= 1 << index;
        }

        Self {
            core: SimState::new(sizes, mask),
            players: slots,
            verified_event_ids: [0; SIDE_COUNT],
            queue: VecDeque::new(),
            timer: config.match_duration_ticks,
            config,
            running: false,
            finished: false,
            rng,
        }
    }

    pub fn core(&self) -> &SimState {
        &self.core
    }

    pub fn tick(&self) -> u64 {
        self.core.tick()
    }

    pub fn players(&self) -> &[Option<PlayerId>; SIDE_COUNT] {
        &self.players
    }

    pub fn paddle_index(&self, player_id: &PlayerId) -> Option<usize> {
        self.players.iter().position(|p| p.as_ref() == Some(player_id))
    }

    pub fn active_count(&self) -> usize {
        self.players.iter().flatten().count()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Match ticks remaining.
    pub fn timer_remaining(&self) -> u32 {
        self.timer
    }

    pub fn verified_event_id(&self, index: usize) -> u64 {
        self.verified_event_ids.get(index).copied().unwrap_or(0)
    }

    /// Drop a player from the match and close their side.
    pub fn remove_player(&mut self, player_id: &PlayerId) -> Result<Option<usize>, TickError> {
        let Some(index) = self.paddle_index(player_id) else {
            return Ok(None);
        };

        self.players[index] = None;
        self.queue.retain(|q| q.paddle_index != index);
        let mask = self.core.active_mask() & !(1 << index);
        self.core.set_active_mask(mask)?;
        Ok(Some(index))
    }

    // =========================================================================
    // EVENT QUEUE
    // =========================================================================

    /// An event is accepted only if it was taken no earlier than the current
    /// server tick.
    pub fn can_queue_event(&self, event: &PlayerEvent) -> bool {
        !self.core.is_detached() && event.client_tick >= self.core.tick()
    }

    /// Enqueue an already-validated event.
    pub fn queue_event(&mut self, paddle_index: usize, event: PlayerEvent) -> Result<(), TickError> {
        if self.core.is_detached() {
            return Err(TickError::Detached);
        }
        if paddle_index >= SIDE_COUNT {
            return Err(TickError::InvalidPaddle(paddle_index));
        }
        self.queue.push_back(QueuedEvent { paddle_index, event });
        Ok(())
    }

    /// Drain the queue in arrival order.
    pub fn get_queue_entries(&mut self) -> Vec<QueuedEvent> {
        self.queue.drain(..).collect()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Verified ids only move forward.
    pub fn update_verified_event_id(&mut self, index: usize, event_id: u64) {
        if let Some(slot) = self.verified_event_ids.get_mut(index) {
            *slot = (*slot).max(event_id);
        }
    }

    /// Tick adjustment that brings a client's lead back into the window.
    ///
    /// Returns zero inside the window, otherwise the delta toward its upper
    /// edge. Client ticks are untrusted, so the delta saturates at the
    /// bounds of `i64`.
    pub fn calculate_offset_delta(&self, client_tick: u64) -> i64 {
        let diff = i128::from(client_tick) - i128::from(self.core.tick());
        let (low, high) = self.config.offset_window;
        let (low, high) = (i128::from(low), i128::from(high));
        if diff < low || diff > high {
            let delta = high - diff;
            i64::try_from(delta).unwrap_or(if delta < 0 { i64::MIN } else { i64::MAX })
        } else {
            0
        }
    }

    /// Authoritative update for paddle `index`.
    pub fn game_update(&self, index: usize) -> GameUpdate {
        GameUpdate {
            server_tick: self.core.tick(),
            verified_event_id: self.verified_event_id(index),
            positions: *self.core.paddle_positions(),
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Start the match clock and arm the first round.
    #[instrument(skip(self))]
    pub fn start_match(&mut self) -> Result<Vec<SimEvent>, TickError> {
        if self.core.is_detached() {
            return Err(TickError::Detached);
        }
        self.running = true;
        self.finished = false;
        self.timer = self.config.match_duration_ticks;
        let event = self.arm_round()?;
        debug!("Match started");
        Ok(vec![event])
    }

    /// Stop the clock without waiting for it to expire.
    pub fn finish(&mut self) {
        self.running = false;
        self.finished = true;
    }

    /// Stop the simulator for good.
    pub fn detach(&mut self) -> Result<(), TickError> {
        if self.core.is_detached() {
            return Err(TickError::Detached);
        }
        self.running = false;
        self.queue.clear();
        self.core.detach()
    }

    /// Pick a kickoff toward a random active side, up to the configured
    /// spread off straight.
    fn kickoff_direction(&mut self) -> [f64; 2] {
        let active: Vec<usize> = (0..SIDE_COUNT)
            .filter(|i| self.players[*i].is_some())
            .collect();

        let side = self.rng.choose(&active).copied().unwrap_or(0);
        let normal = PADDLE_NORMALS[side];
        let toward = [-normal[0], -normal[1]];

        let spread = self.config.kickoff_spread_degrees.to_radians();
        let angle = self.rng.next_f64_range(-spread, spread);
        let (sin, cos) = angle.sin_cos();
        [toward[0] * cos - toward[1] * sin, toward[0] * sin + toward[1] * cos]
    }

    fn arm_round(&mut self) -> Result<SimEvent, TickError> {
        let direction = self.kickoff_direction();
        let countdown = self.config.round_countdown_ticks;
        self.core.round_start(countdown, direction)?;
        Ok(SimEvent::round_start(self.core.tick(), countdown, direction))
    }

    // =========================================================================
    // TICK
    // =========================================================================

    /// Run one server tick.
    ///
    /// 1. Drain queued inputs, applying each and advancing the sender's
    ///    verified id.
    /// 2. Count down or move the ball; a goal arms a new round.
    /// 3. Flag a snapshot on snapshot boundaries.
    /// 4. Run the match timer.
    /// 5. Resync every player on resync boundaries.
    /// 6. End the match when the timer expires.
    /// 7. Advance the tick.
    pub fn step(&mut self) -> Result<Vec<SimEvent>, TickError> {
        if self.core.is_detached() {
            return Err(TickError::Detached);
        }

        let mut events = Vec::new();
        let tick = self.core.tick();

        // 1. Inputs
        for entry in self.get_queue_entries() {
            if self.players[entry.paddle_index].is_none() {
                continue;
            }
            if !self.finished {
                match entry.event.kind {
                    EventKind::Move => {
                        self.core.apply_input(entry.paddle_index, entry.event.payload)?;
                    }
                }
            }
            self.update_verified_event_id(entry.paddle_index, entry.event.event_id);
        }

        // 2. Physics
        if self.running {
            match self.core.step()? {
                PhysicsStep::Countdown { .. } | PhysicsStep::Ball(BallStep::Moved) => {}
                PhysicsStep::Ball(BallStep::Hit { .. }) => {
                    events.push(SimEvent::ball_sync(tick, *self.core.ball()));
                }
                PhysicsStep::Ball(BallStep::Goal { target, scorer }) => {
                    events.push(SimEvent::goal(tick, scorer, target));
                    events.push(self.arm_round()?);
                }
            }
        }

        // 3. Snapshot
        if tick % self.config.snapshot_interval.max(1) == 0 {
            events.push(SimEvent::new(tick, SimEventData::FullSnapshot));
        }

        // 4. Timer
        if self.running && self.timer > 0 {
            self.timer -= 1;
        }

        // 5. Resync
        if tick % self.config.resync_interval.max(1) == 0 {
            for (index, player) in self.players.iter().enumerate() {
                if let Some(player_id) = player {
                    events.push(SimEvent::update(tick, player_id.clone(), self.game_update(index)));
                }
            }
            events.push(SimEvent::ball_sync(tick, *self.core.ball()));
        }

        // 6. Match end
        if self.running && self.timer == 0 {
            self.finish();
            self.core.set_ball(BallData { dx: 0.0, dz: 0.0, ..*self.core.ball() })?;
            events.push(SimEvent::new(tick, SimEventData::MatchEnded));
        }

        // 7. Advance
        self.core.advance_tick()?;

        Ok(events)
    }
}

// =============================================================================
// TESTS
// =============================================================================
