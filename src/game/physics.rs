//! Board Physics
//!
//! Pure geometry and collision functions for the four-sided board.
//! Nothing here owns state; the tick core feeds in paddle positions and the
//! ball and applies the results.
//!
//! ```text
//!              paddle 0 (z = -half, moves along x)
//!          ┌──┬─────────┬ ─ ─ ─ ┬─────────┬──┐
//!          │  │  wall   │ goal  │  wall   │  │
//!          ├──┘         └ ─ ─ ─ ┘         └──┤
//!  paddle 2                                   paddle 3
//!  (x=-half)                                  (x=+half)
//!          ├──┐         ┌ ─ ─ ─ ┐         ┌──┤
//!          │  │  wall   │ goal  │  wall   │  │
//!          └──┴─────────┴ ─ ─ ─ ┴─────────┴──┘
//!              paddle 1 (z = +half)
//! ```

use serde::{Serialize, Deserialize};

use crate::core::sizes::BoardSizes;

/// Number of sides (and paddles) on the board.
pub const SIDE_COUNT: usize = 4;

/// Outward normal of each paddle, pointing into the board, as (x, z).
pub const PADDLE_NORMALS: [[f64; 2]; SIDE_COUNT] = [
    [0.0, 1.0],
    [0.0, -1.0],
    [1.0, 0.0],
    [-1.0, 0.0],
];

/// Ball state: position, velocity and the paddle that touched it last.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BallData {
    /// Position on the x axis.
    pub x: f64,
    /// Position on the z axis.
    pub z: f64,
    /// Velocity on the x axis (units per tick).
    pub dx: f64,
    /// Velocity on the z axis (units per tick).
    pub dz: f64,
    /// Paddle index of the last paddle hit.
    pub last_hit_paddle_index: Option<usize>,
}

impl BallData {
    /// Ball resting at the centre.
    pub const CENTERED: BallData = BallData {
        x: 0.0,
        z: 0.0,
        dx: 0.0,
        dz: 0.0,
        last_hit_paddle_index: None,
    };

    /// Speed magnitude.
    #[inline]
    pub fn speed(&self) -> f64 {
        self.dx.hypot(self.dz)
    }

    /// Euclidean distance between two ball positions.
    #[inline]
    pub fn distance_to(&self, other: &BallData) -> f64 {
        (self.x - other.x).hypot(self.z - other.z)
    }
}

/// Axis-aligned bounding box in the x/z plane.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    pub min_x: f64,
    pub min_z: f64,
    pub max_x: f64,
    pub max_z: f64,
}

impl Aabb {
    /// Box centred on (x, z) with the given edge lengths.
    pub fn centered(x: f64, z: f64, size_x: f64, size_z: f64) -> Self {
        let hx = size_x * 0.5;
        let hz = size_z * 0.5;
        Self {
            min_x: x - hx,
            min_z: z - hz,
            max_x: x + hx,
            max_z: z + hz,
        }
    }

    /// Intersection of two boxes. Boxes that only touch do not intersect.
    pub fn overlap(&self, other: &Aabb) -> Option<Aabb> {
        // Strict: a ball resting flush against a wall after resolution
        // must not collide again on the next tick.
        if self.max_x <= other.min_x
            || other.max_x <= self.min_x
            || self.max_z <= other.min_z
            || other.max_z <= self.min_z
        {
            return None;
        }

        Some(Aabb {
            min_x: self.min_x.max(other.min_x),
            min_z: self.min_z.max(other.min_z),
            max_x: self.max_x.min(other.max_x),
            max_z: self.max_z.min(other.max_z),
        })
    }

    #[inline]
    fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    #[inline]
    fn depth(&self) -> f64 {
        self.max_z - self.min_z
    }
}

/// A static piece of the border: centre and edge lengths.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Segment {
    pub x: f64,
    pub z: f64,
    pub size_x: f64,
    pub size_z: f64,
}

impl Segment {
    fn bounds(&self) -> Aabb {
        Aabb::centered(self.x, self.z, self.size_x, self.size_z)
    }
}

/// What the ball can collide with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObstacleKind {
    Corner,
    Wall,
    Paddle(usize),
}

/// An obstacle and its bounding box.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Obstacle {
    pub kind: ObstacleKind,
    pub bounds: Aabb,
}

/// Axis along which a collision was resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    X,
    Z,
}

/// Whether side `index` is set in an active-sides bitmask.
#[inline]
pub fn side_is_active(mask: u8, index: usize) -> bool {
    index < SIDE_COUNT && mask & (1 << index) != 0
}

/// Corner blocks, in fixed order.
pub fn compute_corners(sizes: &BoardSizes) -> [Segment; 4] {
    let half = sizes.half();
    let b = sizes.border_size;
    [
        Segment { x: -half, z: -half, size_x: b, size_z: b },
        Segment { x: half, z: -half, size_x: b, size_z: b },
        Segment { x: half, z: half, size_x: b, size_z: b },
        Segment { x: -half, z: half, size_x: b, size_z: b },
    ]
}

/// Wall segments for every side, in side order.
///
/// A side whose bit is set in `open_sides` keeps a goal-sized gap between two
/// walls; a closed side is a single wall spanning corner to corner.
pub fn compute_border_geometry(sizes: &BoardSizes, open_sides: u8) -> Vec<Segment> {
    let half = sizes.half();
    let b = sizes.border_size;
    let length = (sizes.board_size - sizes.goal_size - b) * 0.5;
    let center = (sizes.goal_size + length) * 0.5;
    let full = sizes.board_size - b;

    let mut walls = Vec::with_capacity(SIDE_COUNT * 2);

    for side in 0..SIDE_COUNT {
        let open = side_is_active(open_sides, side);
        let horizontal = side < 2;
        let fixed = match side {
            0 | 2 => -half,
            _ => half,
        };

        let place = |along: f64, len: f64| {
            if horizontal {
                Segment { x: along, z: fixed, size_x: len, size_z: b }
            } else {
                Segment { x: fixed, z: along, size_x: b, size_z: len }
            }
        };

        if open {
            walls.push(place(-center, length));
            walls.push(place(center, length));
        } else {
            walls.push(place(0.0, full));
        }
    }

    walls
}

/// Bounding box of paddle `index` at `position` along its axis.
pub fn paddle_bounds(sizes: &BoardSizes, index: usize, position: f64) -> Aabb {
    let half = sizes.half();
    let b = sizes.border_size;
    let p = sizes.paddle_size;
    match index {
        0 => Aabb::centered(position, -half, p, b),
        1 => Aabb::centered(position, half, p, b),
        2 => Aabb::centered(-half, position, b, p),
        _ => Aabb::centered(half, position, b, p),
    }
}

/// Bounding box of the ball.
pub fn ball_bounds(sizes: &BoardSizes, ball: &BallData) -> Aabb {
    Aabb::centered(ball.x, ball.z, sizes.border_size, sizes.border_size)
}

/// Obstacles in collision priority order (corners, walls, paddles by index)
/// plus the ball's box.
pub fn compute_bounding_boxes(
    sizes: &BoardSizes,
    active_mask: u8,
    paddle_positions: &[f64; SIDE_COUNT],
    ball: &BallData,
) -> (Vec<Obstacle>, Aabb) {
    let mut obstacles = Vec::with_capacity(16);

    for corner in compute_corners(sizes) {
        obstacles.push(Obstacle { kind: ObstacleKind::Corner, bounds: corner.bounds() });
    }

    for wall in compute_border_geometry(sizes, active_mask) {
        obstacles.push(Obstacle { kind: ObstacleKind::Wall, bounds: wall.bounds() });
    }

    for (index, position) in paddle_positions.iter().enumerate() {
        if side_is_active(active_mask, index) {
            obstacles.push(Obstacle {
                kind: ObstacleKind::Paddle(index),
                bounds: paddle_bounds(sizes, index, *position),
            });
        }
    }

    (obstacles, ball_bounds(sizes, ball))
}

/// Push the ball out of `other` along the axis of least penetration and
/// flip its velocity on that axis. Returns the axis, or `None` on no overlap.
pub fn resolve_collision_axis(ball: &mut BallData, ball_box: &Aabb, other: &Aabb) -> Option<Axis> {
    let overlap = ball_box.overlap(other)?;

    let axis = if overlap.width() <= overlap.depth() { Axis::X } else { Axis::Z };

    match axis {
        Axis::X => {
            let push = if ball_box.min_x < other.min_x { -overlap.width() } else { overlap.width() };
            ball.x += push;
            ball.dx = -ball.dx;
        }
        Axis::Z => {
            let push = if ball_box.min_z < other.min_z { -overlap.depth() } else { overlap.depth() };
            ball.z += push;
            ball.dz = -ball.dz;
        }
    }

    Some(axis)
}

/// Minimum-translation collision resolution. Returns whether a hit occurred.
pub fn resolve_collision(ball: &mut BallData, ball_box: &Aabb, other: &Aabb) -> bool {
    resolve_collision_axis(ball, ball_box, other).is_some()
}

/// Unit direction for a ball leaving paddle `index`.
///
/// The hit offset from the paddle centre, normalised to [-1, 1], blends the
/// paddle's tangent into its outward normal: a centre hit returns the normal,
/// an edge hit returns a direction 45° off it.
pub fn compute_reflection_angle(
    sizes: &BoardSizes,
    index: usize,
    ball_pos: [f64; 2],
    paddle_pos: f64,
) -> [f64; 2] {
    let normal = PADDLE_NORMALS[index % SIDE_COUNT];
    let (along, tangent) = if index < 2 {
        (ball_pos[0], [1.0, 0.0])
    } else {
        (ball_pos[1], [0.0, 1.0])
    };

    let reach = (sizes.paddle_size + sizes.border_size) * 0.5;
    let t = ((along - paddle_pos) / reach).clamp(-1.0, 1.0);

    let dir = [normal[0] + tangent[0] * t, normal[1] + tangent[1] * t];
    let len = dir[0].hypot(dir[1]);
    [dir[0] / len, dir[1] / len]
}

/// Side whose goal line the position has crossed, if any.
///
/// The z axis is checked first so a ball leaving through a corner region is
/// attributed consistently.
pub fn goal_side(sizes: &BoardSizes, x: f64, z: f64) -> Option<usize> {
    let bound = sizes.out_of_bounds();
    if z < -bound {
        Some(0)
    } else if z > bound {
        Some(1)
    } else if x < -bound {
        Some(2)
    } else if x > bound {
        Some(3)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_SIDES: u8 = 0b1111;

    #[test]
    fn test_overlap_touching_is_not_a_hit() {
        let a = Aabb::centered(0.0, 0.0, 2.0, 2.0);
        let b = Aabb::centered(2.0, 0.0, 2.0, 2.0);
        assert!(a.overlap(&b).is_none());

        let c = Aabb::centered(1.5, 0.0, 2.0, 2.0);
        let o = a.overlap(&c).unwrap();
        assert!((o.width() - 0.5).abs() < 1e-9);
        assert!((o.depth() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_open_side_leaves_goal_gap() {
        let sizes = BoardSizes::default();
        let walls = compute_border_geometry(&sizes, ALL_SIDES);
        assert_eq!(walls.len(), 8);

        // Top side walls end exactly at the goal posts
        let left = walls[0].bounds();
        let right = walls[1].bounds();
        assert!((left.max_x + sizes.goal_size * 0.5).abs() < 1e-9);
        assert!((right.min_x - sizes.goal_size * 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_closed_side_is_single_wall() {
        let sizes = BoardSizes::default();
        // Only sides 0 and 1 open
        let walls = compute_border_geometry(&sizes, 0b0011);
        assert_eq!(walls.len(), 6);

        let left_wall = walls[4].bounds();
        assert_eq!(left_wall.min_z, -(sizes.board_size - sizes.border_size) * 0.5);
        assert_eq!(left_wall.max_z, (sizes.board_size - sizes.border_size) * 0.5);
    }

    #[test]
    fn test_bounding_box_order() {
        let sizes = BoardSizes::default();
        let (obstacles, _) =
            compute_bounding_boxes(&sizes, 0b0101, &[0.0; 4], &BallData::CENTERED);

        assert!(obstacles[..4].iter().all(|o| o.kind == ObstacleKind::Corner));
        let paddles: Vec<_> = obstacles.iter()
            .filter_map(|o| match o.kind {
                ObstacleKind::Paddle(i) => Some(i),
                _ => None,
            })
            .collect();
        assert_eq!(paddles, vec![0, 2]);
        assert_eq!(obstacles.last().unwrap().kind, ObstacleKind::Paddle(2));
    }

    #[test]
    fn test_resolve_pushes_out_and_flips() {
        let sizes = BoardSizes::default();
        let half = sizes.half();
        // Ball moving up into the top paddle, slightly inside it
        let mut ball = BallData { x: 0.0, z: -half + 3.5, dx: 0.1, dz: -0.5, last_hit_paddle_index: None };
        let ball_box = ball_bounds(&sizes, &ball);
        let paddle = paddle_bounds(&sizes, 0, 0.0);

        assert!(resolve_collision(&mut ball, &ball_box, &paddle));
        assert_eq!(ball.dz, 0.5);
        assert_eq!(ball.dx, 0.1);

        // Now exactly touching: no further hit
        let ball_box = ball_bounds(&sizes, &ball);
        assert!(ball_box.overlap(&paddle).is_none());
    }

    #[test]
    fn test_reflection_angle_bounds() {
        let sizes = BoardSizes::default();

        let centre = compute_reflection_angle(&sizes, 0, [0.0, 0.0], 0.0);
        assert_eq!(centre, PADDLE_NORMALS[0]);

        for index in 0..SIDE_COUNT {
            for offset in [-20.0, -5.0, 0.0, 3.0, 20.0] {
                let pos = if index < 2 { [offset, 0.0] } else { [0.0, offset] };
                let dir = compute_reflection_angle(&sizes, index, pos, 0.0);
                let normal = PADDLE_NORMALS[index];
                let cos = dir[0] * normal[0] + dir[1] * normal[1];
                assert!((dir[0].hypot(dir[1]) - 1.0).abs() < 1e-9);
                assert!(cos >= std::f64::consts::FRAC_1_SQRT_2 - 1e-9);
            }
        }
    }

    #[test]
    fn test_goal_side() {
        let sizes = BoardSizes::default();
        let bound = sizes.out_of_bounds();
        assert_eq!(goal_side(&sizes, 0.0, -bound - 0.1), Some(0));
        assert_eq!(goal_side(&sizes, 0.0, bound + 0.1), Some(1));
        assert_eq!(goal_side(&sizes, -bound - 0.1, 0.0), Some(2));
        assert_eq!(goal_side(&sizes, bound + 0.1, 0.0), Some(3));
        assert_eq!(goal_side(&sizes, bound, bound), None);
    }
}
