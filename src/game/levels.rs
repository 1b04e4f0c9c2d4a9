use serde::{Deserialize, Serialize};

use crate::frame::Camera;
use crate::Direction;

/// One required crossing: this camera, this way.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitPoint {
    pub camera: Camera,
    pub direction: Direction,
}

impl HitPoint {
    pub const fn new(camera: Camera, direction: Direction) -> Self {
        Self { camera, direction }
    }
}

/// Ordered course of hit-points.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    pub name: String,
    pub hit_points: Vec<HitPoint>,
}

impl Level {
    pub fn new(name: impl Into<String>, hit_points: Vec<HitPoint>) -> Self {
        Self {
            name: name.into(),
            hit_points,
        }
    }

    pub fn len(&self) -> usize {
        self.hit_points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hit_points.is_empty()
    }

    pub fn hit_point(&self, gate: usize) -> Option<&HitPoint> {
        self.hit_points.get(gate)
    }
}

const A_RIGHT: HitPoint = HitPoint::new(Camera::A, Direction::Right);
const A_LEFT: HitPoint = HitPoint::new(Camera::A, Direction::Left);
const B_RIGHT: HitPoint = HitPoint::new(Camera::B, Direction::Right);
const B_LEFT: HitPoint = HitPoint::new(Camera::B, Direction::Left);

pub fn builtin_levels() -> Vec<Level> {
    // Out along the line, back left through camera A, five laps and a dash home.
    let mut daytona = Vec::new();
    for _ in 0..5 {
        daytona.extend([A_RIGHT, B_RIGHT, A_LEFT]);
    }
    daytona.extend([A_RIGHT, B_RIGHT]);

    // Figure eights: turn behind camera B, then behind camera A.
    let mut imola = Vec::new();
    for _ in 0..3 {
        imola.extend([A_RIGHT, B_RIGHT, B_LEFT, B_LEFT, A_LEFT, A_LEFT]);
    }
    imola.extend([A_RIGHT, B_RIGHT]);

    vec![
        Level::new("Daytona", daytona),
        Level::new("Imola", imola),
        Level::new("Drag Race", vec![A_RIGHT, B_RIGHT]),
    ]
}
