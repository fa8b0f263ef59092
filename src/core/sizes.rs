//! Board Dimensions
//!
//! Every length in the simulation is expressed in board units. The board is
//! a square centred on the origin in the x/z plane.

use serde::{Serialize, Deserialize};

/// Geometry and speed constants shared by client and server.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardSizes {
    /// Edge length of the square board.
    pub board_size: f64,
    /// Width of the goal opening on each side.
    pub goal_size: f64,
    /// Length of a paddle along its axis of travel.
    pub paddle_size: f64,
    /// Thickness of walls and paddles; also the ball's edge length.
    pub border_size: f64,
    /// Ball speed in units per tick.
    pub ball_speed: f64,
}

impl Default for BoardSizes {
    fn default() -> Self {
        Self {
            board_size: 100.0,
            goal_size: 50.0,
            paddle_size: 12.0,
            border_size: 4.0,
            ball_speed: 0.6,
        }
    }
}

impl BoardSizes {
    /// Half the board edge.
    #[inline]
    pub fn half(&self) -> f64 {
        self.board_size * 0.5
    }

    /// Distance from the centre beyond which the ball has left the board.
    #[inline]
    pub fn out_of_bounds(&self) -> f64 {
        self.half() + self.border_size
    }

    /// Maximum paddle offset from the centre of its side.
    #[inline]
    pub fn paddle_limit(&self) -> f64 {
        (self.goal_size - self.paddle_size) * 0.5
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_lengths() {
        let sizes = BoardSizes::default();
        assert_eq!(sizes.half(), 50.0);
        assert_eq!(sizes.out_of_bounds(), 54.0);
        assert_eq!(sizes.paddle_limit(), 19.0);
    }
}
