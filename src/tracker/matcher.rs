//! Backward box matching.
//!
//! Starting from a candidate box that straddles the centerline, walk back one
//! frame position at a time, each step taking the first retained box that
//! plausibly is the same object seen one frame earlier. The walk ends when
//! the lookback budget runs out or the object reaches a horizontal frame edge.
//! Comparing where the object ended up with where it is now gives the
//! direction of travel.

use super::motion_box::{MotionBox, MotionHistory};
use super::FRAME_WIDTH;
use crate::Direction;

const MIN_MATCH_AREA: u32 = 15;
const MAX_MATCH_AREA: u32 = 10_000;
const MIN_SIDE: i32 = 5;
const MAX_SIDE: i32 = 100;
/// Smaller-to-larger rectangle area ratio two boxes must reach.
const MIN_SCALE_RATIO: f32 = 0.3;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MatchOutcome {
    pub direction: Option<Direction>,
    /// Matched boxes, nearest position first.
    pub chain: Vec<MotionBox>,
}

impl MatchOutcome {
    pub fn deepest(&self) -> Option<&MotionBox> {
        self.chain.last()
    }
}

fn sane_size(b: &MotionBox) -> bool {
    (MIN_SIDE..=MAX_SIDE).contains(&b.w) && (MIN_SIDE..=MAX_SIDE).contains(&b.h)
}

fn scale_ratio(a: &MotionBox, b: &MotionBox) -> f32 {
    let da = (a.w * a.h) as f32;
    let db = (b.w * b.h) as f32;
    let (lo, hi) = if da < db { (da, db) } else { (db, da) };
    if hi <= 0.0 {
        return 0.0;
    }
    lo / hi
}

/// Whether `previous` can be the reference object one frame earlier.
pub fn is_match(reference: &MotionBox, previous: &MotionBox) -> bool {
    (MIN_MATCH_AREA..=MAX_MATCH_AREA).contains(&previous.area)
        && !reference.same_rect(previous)
        && sane_size(reference)
        && sane_size(previous)
        && scale_ratio(reference, previous) >= MIN_SCALE_RATIO
        && reference.overlaps(previous)
}

fn at_edge(b: &MotionBox) -> bool {
    b.x == 0 || b.right() >= FRAME_WIDTH
}

/// Walks back from `candidate` at `position`, allowing `budget` further steps
/// after the first match. There is no backtracking: the first plausible box at
/// each position is the only one followed.
pub fn backward_match(
    history: &MotionHistory,
    candidate: &MotionBox,
    position: u32,
    budget: u32,
) -> MatchOutcome {
    let mut outcome = MatchOutcome::default();
    let mut reference = *candidate;
    let mut remaining = budget;
    let mut current = position;

    loop {
        current = match current.checked_sub(1) {
            Some(p) if p > 0 => p,
            _ => return MatchOutcome::default(),
        };
        let Some(boxes) = history.get(current) else {
            return MatchOutcome::default();
        };
        let Some(found) = boxes.iter().find(|b| is_match(&reference, b)) else {
            return MatchOutcome::default();
        };
        outcome.chain.push(*found);

        if remaining == 0 || at_edge(found) {
            outcome.direction = Some(if candidate.right() < found.right() {
                Direction::Left
            } else {
                Direction::Right
            });
            return outcome;
        }
        reference = *found;
        remaining -= 1;
    }
}

/// Angle of travel in degrees between two sightings, 0 = level flight.
pub fn dive_angle(now: &MotionBox, earlier: &MotionBox) -> f32 {
    let dy = (now.y - earlier.y).abs() as f32;
    let dx = (now.x - earlier.x).abs() as f32 + 1e-7;
    (dy / dx).atan().to_degrees()
}
