//! Sleipnir base station core.
//!
//! Measurement core of a model-aircraft speed/course timing instrument. Two
//! fixed cameras film the flight path; this crate ingests their frames,
//! detects the aircraft crossing the vertical centerline of each camera and
//! turns the resulting triggers into scored passes and gate times.
//!
//! # Module Structure
//!
//! - `frame`: frames and the ordered, gapless per-flight frame store
//! - `storage`: SQLite-backed durable frame storage
//! - `server`: camera ingestion server (upload protocol, camera liveness)
//! - `tracker`: per-camera motion tracking and backward box matching
//! - `event`: single-consumer event bus
//! - `game`: Speed-Trap, Gate-Crasher and Align disciplines
//! - `announcement`: scored results and their persistence
//! - `config`: runtime configuration

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod announcement;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod frame;
pub mod game;
pub mod server;
pub mod storage;
pub mod tracker;

pub use announcement::{GateAnnouncement, SpeedAnnouncement};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SleipnirConfig;
pub use error::{SleipnirError, SleipnirResult};
pub use event::{Event, EventHandler, EventLoop, EventSender};
pub use frame::{Camera, Frame, FrameCollection};
pub use game::{AlignLogic, Discipline, GateCrasher, SpeedTrap};
pub use server::{CameraServer, ServerHandle};
pub use storage::{Database, FrameRepository, InMemoryFrameRepository};
pub use tracker::{MotionBox, MotionTracker, TrackerSettings, TrackerWorker};

// -------------------- Direction --------------------

/// Direction of travel across a camera's field of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Left,
    Right,
}

impl Direction {
    /// Maps a tracker verdict (-1, 0, +1) to a direction; 0 means no hit.
    pub fn from_signum(value: i32) -> Option<Self> {
        match value.signum() {
            -1 => Some(Direction::Left),
            1 => Some(Direction::Right),
            _ => None,
        }
    }

    pub fn signum(self) -> i32 {
        match self {
            Direction::Left => -1,
            Direction::Right => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Direction::Left => "LEFT",
            Direction::Right => "RIGHT",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// -------------------- Games --------------------

/// Discipline a capture belongs to. Each keeps its own frame table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Game {
    Align,
    SpeedTrap,
    GateCrasher,
}

impl Game {
    pub const ALL: [Game; 3] = [Game::Align, Game::SpeedTrap, Game::GateCrasher];

    pub fn name(self) -> &'static str {
        match self {
            Game::Align => "align",
            Game::SpeedTrap => "speed_trap",
            Game::GateCrasher => "gate_crasher",
        }
    }

    pub(crate) fn frame_table(self) -> &'static str {
        match self {
            Game::Align => "align_frame",
            Game::SpeedTrap => "speed_trap_frame",
            Game::GateCrasher => "gate_crasher_frame",
        }
    }

    pub(crate) fn announcement_table(self) -> Option<&'static str> {
        match self {
            Game::Align => None,
            Game::SpeedTrap => Some("speed_trap_announcement"),
            Game::GateCrasher => Some("gate_crasher_announcement"),
        }
    }
}

impl fmt::Display for Game {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Flight numbers selectable by the operator.
pub const MIN_FLIGHT: u32 = 1;
pub const MAX_FLIGHT: u32 = 20;

pub fn validate_flight(flight: u32) -> SleipnirResult<()> {
    if !(MIN_FLIGHT..=MAX_FLIGHT).contains(&flight) {
        return Err(SleipnirError::illegal_state(format!(
            "flight must be between {} and {}, got {}",
            MIN_FLIGHT, MAX_FLIGHT, flight
        )));
    }
    Ok(())
}
