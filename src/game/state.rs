//! Simulation State
//!
//! The deterministic per-tick core shared by the server and client
//! simulators. It owns paddle positions, the ball and the round countdown,
//! and knows nothing about networking.

use std::fmt;

use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::core::sizes::BoardSizes;
use crate::game::physics::{
    self, BallData, Axis, ObstacleKind, SIDE_COUNT,
};

// =============================================================================
// PLAYER ID
// =============================================================================

/// Opaque player identifier supplied by the identity provider.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub String);

impl PlayerId {
    /// Create from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random v4 UUID identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow as `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Errors raised by the tick core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TickError {
    #[error("simulation is detached")]
    Detached,

    #[error("paddle index {0} is out of range")]
    InvalidPaddle(usize),
}

// =============================================================================
// STEP RESULTS
// =============================================================================

/// Outcome of moving the ball one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BallStep {
    /// No contact this tick.
    Moved,
    /// The ball bounced off an obstacle.
    Hit { obstacle: ObstacleKind },
    /// The ball left through `target`'s side. `scorer` is the last paddle hit.
    Goal { target: usize, scorer: Option<usize> },
}

/// Outcome of a full physics step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PhysicsStep {
    /// Round countdown running; `kicked_off` is set on the tick it expired.
    Countdown { kicked_off: bool },
    /// Ball advanced.
    Ball(BallStep),
}

// =============================================================================
// SIM STATE
// =============================================================================

/// Deterministic simulation core.
#[derive(Debug, Clone)]
pub struct SimState {
    sizes: BoardSizes,
    tick: u64,
    paddle_positions: [f64; SIDE_COUNT],
    ball: BallData,
    countdown: u32,
    kickoff_direction: [f64; 2],
    starting: bool,
    active_mask: u8,
    detached: bool,
}

impl SimState {
    /// Fresh core with the ball at rest in the centre.
    pub fn new(sizes: BoardSizes, active_mask: u8) -> Self {
        Self {
            sizes,
            tick: 0,
            paddle_positions: [0.0; SIDE_COUNT],
            ball: BallData::CENTERED,
            countdown: 0,
            kickoff_direction: [0.0, 0.0],
            starting: false,
            active_mask: active_mask & 0b1111,
            detached: false,
        }
    }

    #[inline]
    fn ensure_attached(&self) -> Result<(), TickError> {
        if self.detached {
            Err(TickError::Detached)
        } else {
            Ok(())
        }
    }

    #[inline]
    fn check_index(index: usize) -> Result<(), TickError> {
        if index < SIDE_COUNT {
            Ok(())
        } else {
            Err(TickError::InvalidPaddle(index))
        }
    }

    pub fn sizes(&self) -> &BoardSizes {
        &self.sizes
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn paddle_positions(&self) -> &[f64; SIDE_COUNT] {
        &self.paddle_positions
    }

    pub fn ball(&self) -> &BallData {
        &self.ball
    }

    pub fn countdown(&self) -> u32 {
        self.countdown
    }

    pub fn is_starting(&self) -> bool {
        self.starting
    }

    pub fn active_mask(&self) -> u8 {
        self.active_mask
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Overwrite the tick counter.
    pub fn set_tick(&mut self, tick: u64) -> Result<(), TickError> {
        self.ensure_attached()?;
        self.tick = tick;
        Ok(())
    }

    /// Advance the tick counter by one.
    pub fn advance_tick(&mut self) -> Result<u64, TickError> {
        self.ensure_attached()?;
        self.tick += 1;
        Ok(self.tick)
    }

    /// Overwrite one paddle position (clamped to its travel range).
    pub fn set_paddle_position(&mut self, index: usize, position: f64) -> Result<(), TickError> {
        self.ensure_attached()?;
        Self::check_index(index)?;
        let limit = self.sizes.paddle_limit();
        self.paddle_positions[index] = position.clamp(-limit, limit);
        Ok(())
    }

    /// Overwrite the ball.
    pub fn set_ball(&mut self, ball: BallData) -> Result<(), TickError> {
        self.ensure_attached()?;
        self.ball = ball;
        Ok(())
    }

    /// Open or close sides. A cleared bit turns the goal into a wall.
    pub fn set_active_mask(&mut self, mask: u8) -> Result<(), TickError> {
        self.ensure_attached()?;
        self.active_mask = mask & 0b1111;
        Ok(())
    }

    /// Move paddle `index` one unit in the sign of `direction`.
    ///
    /// Paddles on even sides face the opposite way along their axis, so
    /// their input is inverted before applying. Returns the new position.
    pub fn apply_input(&mut self, index: usize, direction: i32) -> Result<f64, TickError> {
        self.ensure_attached()?;
        Self::check_index(index)?;

        let sign = f64::from(direction.signum());
        let step = if index % 2 == 0 { -sign } else { sign };
        let limit = self.sizes.paddle_limit();

        let position = (self.paddle_positions[index] + step).clamp(-limit, limit);
        self.paddle_positions[index] = position;
        Ok(position)
    }

    /// Advance the ball by its velocity and resolve at most one collision.
    ///
    /// A goal recentres the ball but keeps its velocity; the caller is
    /// expected to arm a new round.
    pub fn move_ball(&mut self) -> Result<BallStep, TickError> {
        self.ensure_attached()?;

        self.ball.x += self.ball.dx;
        self.ball.z += self.ball.dz;

        if let Some(target) = physics::goal_side(&self.sizes, self.ball.x, self.ball.z) {
            // Conceding off your own paddle credits nobody
            let scorer = self.ball.last_hit_paddle_index.filter(|&index| index != target);
            self.ball.x = 0.0;
            self.ball.z = 0.0;
            self.ball.last_hit_paddle_index = None;
            return Ok(BallStep::Goal { target, scorer });
        }

        let (obstacles, ball_box) = physics::compute_bounding_boxes(
            &self.sizes,
            self.active_mask,
            &self.paddle_positions,
            &self.ball,
        );

        for obstacle in obstacles {
            let Some(axis) = physics::resolve_collision_axis(&mut self.ball, &ball_box, &obstacle.bounds)
            else {
                continue;
            };

            if let ObstacleKind::Paddle(index) = obstacle.kind {
                let face_axis = if index < 2 { Axis::Z } else { Axis::X };
                if axis == face_axis {
                    let speed = self.ball.speed();
                    let dir = physics::compute_reflection_angle(
                        &self.sizes,
                        index,
                        [self.ball.x, self.ball.z],
                        self.paddle_positions[index],
                    );
                    self.ball.dx = dir[0] * speed;
                    self.ball.dz = dir[1] * speed;
                }
                self.ball.last_hit_paddle_index = Some(index);
            }

            return Ok(BallStep::Hit { obstacle: obstacle.kind });
        }

        Ok(BallStep::Moved)
    }

    /// Recentre the ball at rest and arm a countdown.
    pub fn round_start(&mut self, countdown: u32, direction: [f64; 2]) -> Result<(), TickError> {
        self.ensure_attached()?;
        self.ball = BallData::CENTERED;
        self.countdown = countdown;
        self.kickoff_direction = direction;
        self.starting = true;
        if countdown == 0 {
            self.kickoff()?;
        }
        Ok(())
    }

    /// Launch the ball along the stored direction at the configured speed.
    pub fn kickoff(&mut self) -> Result<(), TickError> {
        self.ensure_attached()?;
        let [x, z] = self.kickoff_direction;
        let len = x.hypot(z);
        let (dx, dz) = if len > 0.0 { (x / len, z / len) } else { (0.0, 0.0) };
        self.ball.dx = dx * self.sizes.ball_speed;
        self.ball.dz = dz * self.sizes.ball_speed;
        self.countdown = 0;
        self.starting = false;
        Ok(())
    }

    /// Count the round countdown down by one tick, kicking off at zero.
    pub fn advance_countdown(&mut self) -> Result<bool, TickError> {
        self.ensure_attached()?;
        if !self.starting {
            return Ok(false);
        }
        self.countdown = self.countdown.saturating_sub(1);
        if self.countdown == 0 {
            self.kickoff()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Countdown while a round is arming, otherwise move the ball.
    pub fn step(&mut self) -> Result<PhysicsStep, TickError> {
        if self.starting {
            let kicked_off = self.advance_countdown()?;
            Ok(PhysicsStep::Countdown { kicked_off })
        } else {
            self.move_ball().map(PhysicsStep::Ball)
        }
    }

    /// Stop the core. Every later mutation fails with [`TickError::Detached`].
    pub fn detach(&mut self) -> Result<(), TickError> {
        self.ensure_attached()?;
        self.detached = true;
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
