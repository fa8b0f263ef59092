//! Client Prediction
//!
//! A client-side simulator that applies the local player's input
//! immediately, keeps a history of unacknowledged inputs and reconciles
//! against authoritative updates. Remote updates are held in a jitter
//! buffer and released a few ticks after their server tick.

use tracing::trace;

use crate::core::sizes::BoardSizes;
use crate::game::events::{EventKind, GameUpdate, PlayerEvent};
use crate::game::physics::{BallData, SIDE_COUNT};
use crate::game::state::{PhysicsStep, SimState, TickError};

/// Reconciliation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileConfig {
    /// Initial lead of the client tick over the server tick.
    pub initial_offset: i64,
    /// Paddle corrections at or below this distance are ignored.
    pub paddle_hysteresis: f64,
    /// Ball corrections below this distance are ignored.
    pub ball_hysteresis: f64,
    /// Upper bound on ticks replayed when fast-forwarding the ball.
    pub max_fast_forward: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            initial_offset: 5,
            paddle_hysteresis: 2.0,
            ball_hysteresis: 0.1,
            max_fast_forward: 120,
        }
    }
}

/// Kind of buffered remote update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Positions,
    Ball,
}

/// Buffered remote payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RemoteUpdate {
    Positions([f64; SIDE_COUNT]),
    Ball(BallData),
}

impl RemoteUpdate {
    pub fn kind(&self) -> UpdateKind {
        match self {
            RemoteUpdate::Positions(_) => UpdateKind::Positions,
            RemoteUpdate::Ball(_) => UpdateKind::Ball,
        }
    }
}

/// A remote update waiting for its release tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueuedUpdate {
    pub apply_at: u64,
    pub server_tick: u64,
    pub data: RemoteUpdate,
}

/// Predicting simulator for one local player.
#[derive(Debug, Clone)]
pub struct ClientSimulator {
    core: SimState,
    player_index: usize,
    tick_offset: i64,
    next_event_id: u64,
    history: Vec<PlayerEvent>,
    /// Last authoritative position of the local paddle.
    verified_position: f64,
    remote_queue: Vec<QueuedUpdate>,
    config: ReconcileConfig,
}

impl ClientSimulator {
    pub fn new(player_index: usize, sizes: BoardSizes, active_mask: u8, config: ReconcileConfig) -> Self {
        Self {
            core: SimState::new(sizes, active_mask),
            player_index,
            tick_offset: config.initial_offset,
            next_event_id: 1,
            history: Vec::new(),
            verified_position: 0.0,
            remote_queue: Vec::new(),
            config,
        }
    }

    pub fn core(&self) -> &SimState {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut SimState {
        &mut self.core
    }

    pub fn tick(&self) -> u64 {
        self.core.tick()
    }

    pub fn tick_offset(&self) -> i64 {
        self.tick_offset
    }

    pub fn player_index(&self) -> usize {
        self.player_index
    }

    /// Local paddle position.
    pub fn position(&self) -> f64 {
        self.core.paddle_positions()[self.player_index]
    }

    /// Inputs not yet acknowledged by the server.
    pub fn history(&self) -> &[PlayerEvent] {
        &self.history
    }

    // =========================================================================
    // TICK SYNC
    // =========================================================================

    /// Jump to `server_tick` plus the current offset.
    pub fn set_tick(&mut self, server_tick: u64) -> Result<(), TickError> {
        self.core.set_tick(server_tick.saturating_add_signed(self.tick_offset))
    }

    /// Shift both the offset and the current tick by `delta`.
    pub fn adjust_tick(&mut self, delta: i64) -> Result<(), TickError> {
        self.tick_offset = self.tick_offset.saturating_add(delta);
        let tick = self.core.tick().saturating_add_signed(delta);
        self.core.set_tick(tick)
    }

    // =========================================================================
    // INPUT HISTORY
    // =========================================================================

    /// Stamp an event with the next id and the current tick, and remember it.
    pub fn create_history_event(&mut self, kind: EventKind, payload: i32) -> Result<PlayerEvent, TickError> {
        if self.core.is_detached() {
            return Err(TickError::Detached);
        }
        let event = PlayerEvent {
            event_id: self.next_event_id,
            client_tick: self.core.tick(),
            kind,
            payload,
        };
        self.next_event_id += 1;
        self.history.push(event);
        Ok(event)
    }

    /// Apply a local move immediately and record it for sending.
    pub fn record_input(&mut self, direction: i32) -> Result<PlayerEvent, TickError> {
        self.core.apply_input(self.player_index, direction)?;
        self.create_history_event(EventKind::Move, direction)
    }

    /// Last authoritative position the local paddle was reconciled from.
    pub fn verified_position(&self) -> f64 {
        self.verified_position
    }

    /// Forget an input the server rejected and re-predict without it,
    /// starting from the last authoritative position.
    pub fn handle_dropped_packet(&mut self, event_id: u64) -> Result<bool, TickError> {
        self.history.retain(|e| e.event_id != event_id);
        self.reconcile_position(self.verified_position)
    }

    /// Replay the remaining history on top of `verified` and snap to the
    /// result only if it differs from the current prediction by more than
    /// the paddle hysteresis. Returns whether a correction was applied.
    pub fn reconcile_position(&mut self, verified: f64) -> Result<bool, TickError> {
        let current = self.position();

        self.core.set_paddle_position(self.player_index, verified)?;
        self.verified_position = verified;
        for event in self.history.clone() {
            match event.kind {
                EventKind::Move => {
                    self.core.apply_input(self.player_index, event.payload)?;
                }
            }
        }

        let predicted = self.position();
        if (predicted - current).abs() <= self.config.paddle_hysteresis {
            self.core.set_paddle_position(self.player_index, current)?;
            return Ok(false);
        }

        trace!(current, predicted, "Paddle correction");
        Ok(true)
    }

    /// Drop history the server has acknowledged.
    pub fn clear_old_history(&mut self, verified_event_id: u64) {
        self.history.retain(|e| e.event_id > verified_event_id);
    }

    /// Consume an authoritative `game.update`.
    pub fn apply_server_update(&mut self, update: &GameUpdate) -> Result<bool, TickError> {
        self.clear_old_history(update.verified_event_id);
        let corrected = self.reconcile_position(update.positions[self.player_index])?;
        self.queue_update(update.server_tick, RemoteUpdate::Positions(update.positions));
        Ok(corrected)
    }

    // =========================================================================
    // JITTER BUFFER
    // =========================================================================

    /// Buffer a remote update for release half an offset after its tick.
    pub fn queue_update(&mut self, server_tick: u64, data: RemoteUpdate) {
        let delay = (self.tick_offset / 2).max(0) as u64;
        self.remote_queue.push(QueuedUpdate {
            apply_at: server_tick + delay,
            server_tick,
            data,
        });
    }

    /// Take every buffered update of `kind` that is due at the current tick.
    pub fn extract_queue_entries(&mut self, kind: UpdateKind) -> Vec<QueuedUpdate> {
        let now = self.core.tick();
        let mut due = Vec::new();
        self.remote_queue.retain(|entry| {
            if entry.data.kind() == kind && entry.apply_at <= now {
                due.push(*entry);
                false
            } else {
                true
            }
        });
        due
    }

    pub fn pending_updates(&self) -> usize {
        self.remote_queue.len()
    }

    /// Snap remote paddles to their latest released positions.
    fn apply_remote_positions(&mut self) -> Result<(), TickError> {
        let Some(latest) = self.extract_queue_entries(UpdateKind::Positions)
            .into_iter()
            .max_by_key(|e| e.server_tick)
        else {
            return Ok(());
        };

        if let RemoteUpdate::Positions(positions) = latest.data {
            for (index, position) in positions.iter().enumerate() {
                if index != self.player_index {
                    self.core.set_paddle_position(index, *position)?;
                }
            }
        }
        Ok(())
    }

    /// Reconcile the ball against its latest released server state.
    fn apply_remote_ball(&mut self) -> Result<(), TickError> {
        let Some(latest) = self.extract_queue_entries(UpdateKind::Ball)
            .into_iter()
            .max_by_key(|e| e.server_tick)
        else {
            return Ok(());
        };

        if let RemoteUpdate::Ball(ball) = latest.data {
            self.reconcile_ball(latest.server_tick, ball)?;
        }
        Ok(())
    }

    // =========================================================================
    // BALL
    // =========================================================================

    /// Rewind the ball to server truth and fast-forward to the local tick.
    ///
    /// Keeps the local ball if the result lands within the ball hysteresis.
    /// Returns whether the ball was replaced.
    pub fn reconcile_ball(&mut self, server_tick: u64, verified: BallData) -> Result<bool, TickError> {
        let snapshot = *self.core.ball();

        self.core.set_ball(verified)?;
        if !self.core.is_starting() {
            let steps = self.core.tick()
                .saturating_sub(server_tick)
                .min(self.config.max_fast_forward);
            for _ in 0..steps {
                self.core.move_ball()?;
            }
        }

        if self.core.ball().distance_to(&snapshot) < self.config.ball_hysteresis {
            self.core.set_ball(snapshot)?;
            return Ok(false);
        }

        Ok(true)
    }

    /// Arm a round from a `round.start` broadcast.
    pub fn round_start(&mut self, countdown_ticks: u32, direction: [f64; 2]) -> Result<(), TickError> {
        self.core.round_start(countdown_ticks, direction)
    }

    /// Advance one local tick.
    pub fn on_tick(&mut self) -> Result<PhysicsStep, TickError> {
        self.apply_remote_positions()?;
        self.apply_remote_ball()?;
        let step = self.core.step()?;
        self.core.advance_tick()?;
        Ok(step)
    }

    pub fn detach(&mut self) -> Result<(), TickError> {
        if self.core.is_detached() {
            return Err(TickError::Detached);
        }
        self.history.clear();
        self.remote_queue.clear();
        self.core.detach()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rng::DeterministicRng;
    use crate::game::server::{ServerSimConfig, ServerSimulator};
    use crate::game::state::PlayerId;
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;

    fn client(index: usize) -> ClientSimulator {
        ClientSimulator::new(index, BoardSizes::default(), 0b1111, ReconcileConfig::default())
    }

    #[test]
    fn test_tick_sync() {
        let mut c = client(1);
        c.set_tick(100).unwrap();
        assert_eq!(c.tick(), 105);

        c.adjust_tick(-1).unwrap();
        assert_eq!(c.tick_offset(), 4);
        assert_eq!(c.tick(), 104);

        c.set_tick(200).unwrap();
        assert_eq!(c.tick(), 204);
    }

    #[test]
    fn test_history_event_ids() {
        let mut c = client(1);
        c.set_tick(10).unwrap();
        let a = c.record_input(1).unwrap();
        let b = c.record_input(-1).unwrap();
        assert_eq!((a.event_id, a.client_tick), (1, 15));
        assert_eq!(b.event_id, 2);
        assert_eq!(c.history().len(), 2);

        c.clear_old_history(1);
        assert_eq!(c.history(), &[b]);
    }

    #[test]
    fn test_small_correction_is_ignored() {
        let mut c = client(1);
        for _ in 0..3 {
            c.record_input(1).unwrap();
        }
        assert_eq!(c.position(), 3.0);

        // Dropping one input predicts 2.0, within hysteresis
        assert!(!c.handle_dropped_packet(1).unwrap());
        assert_eq!(c.position(), 3.0);
        assert_eq!(c.history().len(), 2);
    }

    #[test]
    fn test_dropped_packet_replays_from_server_position() {
        let mut c = client(1);
        for _ in 0..6 {
            c.record_input(1).unwrap();
        }
        assert_eq!(c.position(), 6.0);

        // Server acknowledged the first two inputs at position 10
        let update = GameUpdate {
            server_tick: 0,
            verified_event_id: 2,
            positions: [0.0, 10.0, 0.0, 0.0],
        };
        assert!(c.apply_server_update(&update).unwrap());
        assert_eq!(c.verified_position(), 10.0);
        assert_eq!(c.position(), 14.0);

        // Dropping input 3 predicts 13, within hysteresis
        assert!(!c.handle_dropped_packet(3).unwrap());
        assert_eq!(c.position(), 14.0);
        assert_eq!(c.history().len(), 3);

        // Two more drops land on 11, past hysteresis, not on 1
        c.handle_dropped_packet(4).unwrap();
        assert!(c.handle_dropped_packet(5).unwrap());
        assert_eq!(c.position(), 11.0);
    }

    #[test]
    fn test_tick_sync_saturates() {
        let mut c = client(1);
        c.set_tick(u64::MAX).unwrap();
        assert_eq!(c.tick(), u64::MAX);
        c.adjust_tick(1).unwrap();
        assert_eq!(c.tick(), u64::MAX);

        c.set_tick(0).unwrap();
        c.adjust_tick(i64::MIN).unwrap();
        c.adjust_tick(i64::MIN).unwrap();
        assert_eq!(c.tick(), 0);
        assert_eq!(c.tick_offset(), i64::MIN);

        c.set_tick(3).unwrap();
        assert_eq!(c.tick(), 0);
    }

    #[test]
    fn test_second_detach_leaves_state() {
        let mut c = client(1);
        c.queue_update(0, RemoteUpdate::Ball(BallData::CENTERED));
        c.detach().unwrap();
        assert_eq!(c.pending_updates(), 0);

        assert_eq!(c.detach(), Err(TickError::Detached));
        assert_eq!(c.record_input(1), Err(TickError::Detached));
    }

    #[test]
    fn test_large_correction_snaps() {
        let mut c = client(1);
        for _ in 0..5 {
            c.record_input(1).unwrap();
        }
        c.handle_dropped_packet(1).unwrap();
        c.handle_dropped_packet(2).unwrap();
        assert!(c.handle_dropped_packet(3).unwrap());
        assert_eq!(c.position(), 2.0);
    }

    #[test]
    fn test_server_update_clears_acknowledged() {
        let mut c = client(1);
        for _ in 0..4 {
            c.record_input(1).unwrap();
        }
        let update = GameUpdate { server_tick: 2, verified_event_id: 3, positions: [0.0, 3.0, 0.0, 0.0] };
        assert!(!c.apply_server_update(&update).unwrap());
        assert_eq!(c.history().len(), 1);
        assert_eq!(c.position(), 4.0);
    }

    #[test]
    fn test_jitter_buffer_release() {
        let mut c = client(1);
        c.set_tick(100).unwrap();
        assert_eq!(c.tick(), 105);

        c.queue_update(110, RemoteUpdate::Positions([5.0, 0.0, -3.0, 0.0]));
        let remote_ball = BallData { x: 5.0, z: -4.0, ..BallData::CENTERED };
        c.queue_update(110, RemoteUpdate::Ball(remote_ball));

        // Offset 5 delays release by 2 ticks: due at 112
        assert!(c.extract_queue_entries(UpdateKind::Positions).is_empty());
        for _ in 0..7 {
            c.on_tick().unwrap();
        }
        assert_eq!(c.core().paddle_positions()[0], 0.0);
        assert_eq!(*c.core().ball(), BallData::CENTERED);

        // Released on the tick that reaches 112
        c.on_tick().unwrap();
        assert_eq!(c.tick(), 113);
        assert_eq!(c.core().paddle_positions()[0], 5.0);
        assert_eq!(c.core().paddle_positions()[2], -3.0);
        // Own paddle untouched by remote positions
        assert_eq!(c.position(), 0.0);

        // The ball entry is released on the same tick and reconciled
        assert_eq!(*c.core().ball(), remote_ball);
        assert_eq!(c.pending_updates(), 0);
    }

    #[test]
    fn test_jitter_buffer_keeps_latest_ball() {
        let mut c = client(0);
        c.set_tick(100).unwrap();

        let older = BallData { x: -6.0, ..BallData::CENTERED };
        let newer = BallData { x: 7.0, ..BallData::CENTERED };
        c.queue_update(101, RemoteUpdate::Ball(newer));
        c.queue_update(100, RemoteUpdate::Ball(older));

        c.on_tick().unwrap();
        assert_eq!(c.core().ball().x, 7.0);
        assert_eq!(c.pending_updates(), 0);
    }

    #[test]
    fn test_reconcile_ball_hysteresis() {
        let mut c = client(1);
        c.core_mut().set_tick(50).unwrap();
        let local = BallData { x: 0.0, z: 0.0, dx: 0.0, dz: 0.5, last_hit_paddle_index: None };
        c.core_mut().set_ball(local).unwrap();

        // Server saw the ball at tick 48 two steps back: same trajectory
        let truth = BallData { z: -1.0 + 0.05, ..local };
        assert!(!c.reconcile_ball(48, truth).unwrap());
        assert_eq!(*c.core().ball(), local);

        // Far away truth is fast-forwarded and replaces the local ball
        let truth = BallData { x: 10.0, z: 0.0, dx: 0.5, dz: 0.0, last_hit_paddle_index: None };
        assert!(c.reconcile_ball(48, truth).unwrap());
        assert!((c.core().ball().x - 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_agrees_with_server_without_loss() {
        let ids = [PlayerId::from("a"), PlayerId::from("b")];
        let mut server = ServerSimulator::new(
            &ids,
            BoardSizes::default(),
            ServerSimConfig::default(),
            DeterministicRng::new(3),
        );
        let mut c = client(1);
        c.set_tick(server.tick()).unwrap();

        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..200 {
            if rng.gen_bool(0.5) {
                let event = c.record_input(rng.gen_range(-1..=1)).unwrap();
                assert!(server.can_queue_event(&event));
                server.queue_event(1, event).unwrap();
            }
            c.on_tick().unwrap();
            server.step().unwrap();
        }
        server.step().unwrap();

        let update = server.game_update(1);
        assert!(!c.apply_server_update(&update).unwrap());
        assert_eq!(c.position(), update.positions[1]);
        assert!(c.history().is_empty());
    }
}
