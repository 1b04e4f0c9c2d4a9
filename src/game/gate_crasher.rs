//! Gate-Crasher: fly a level's hit-points in order, against the clock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::levels::{builtin_levels, Level};
use super::{Discipline, Station, TrackingPipeline};
use crate::announcement::GateAnnouncement;
use crate::error::{SleipnirError, SleipnirResult};
use crate::event::{Event, EventHandler};
use crate::frame::{Camera, Frame, FrameCollection};
use crate::{validate_flight, Direction, Game};

/// Missing the next gate for this long restarts the course.
pub const RESTART_AFTER: Duration = Duration::from_secs(15);
/// One physical pass must not count twice.
pub const DEBOUNCE: Duration = Duration::from_millis(300);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateStep {
    Ignored,
    Hit(GateAnnouncement),
    Finished { hit: GateAnnouncement, total_ms: i64 },
}

/// Course state without any I/O.
#[derive(Debug)]
pub struct GateMachine {
    level: Level,
    gate: usize,
    hits: Vec<GateAnnouncement>,
    restart_at: Option<Instant>,
    no_hit_until: Option<Instant>,
    timestamp_start: i64,
    current_runtime_ms: i64,
}

impl GateMachine {
    pub fn new(level: Level) -> Self {
        Self {
            level,
            gate: 0,
            hits: Vec::new(),
            restart_at: None,
            no_hit_until: None,
            timestamp_start: 0,
            current_runtime_ms: 0,
        }
    }

    pub fn level(&self) -> &Level {
        &self.level
    }

    /// Index of the next gate to hit.
    pub fn current_gate(&self) -> usize {
        self.gate
    }

    pub fn hits(&self) -> &[GateAnnouncement] {
        &self.hits
    }

    pub fn current_runtime_ms(&self) -> i64 {
        self.current_runtime_ms
    }

    pub fn reset(&mut self) {
        self.gate = 0;
        self.hits.clear();
        self.restart_at = None;
        self.no_hit_until = None;
        self.timestamp_start = 0;
        self.current_runtime_ms = 0;
    }

    /// Restarts the course if the next gate was missed. True if it did.
    pub fn check_restart(&mut self, now: Instant) -> bool {
        match self.restart_at {
            Some(deadline) if now > deadline => {
                self.reset();
                true
            }
            _ => false,
        }
    }

    /// Running clock display. Follows camera A only so it does not jitter
    /// between the two capture clocks.
    pub fn update_runtime(&mut self, camera: Camera, timestamp: i64) {
        if self.gate > 0 && camera == Camera::A {
            self.current_runtime_ms = timestamp - self.timestamp_start;
        }
    }

    pub fn on_trigger(
        &mut self,
        camera: Camera,
        direction: Direction,
        position: u32,
        timestamp: i64,
        now: Instant,
    ) -> GateStep {
        let Some(hit_point) = self.level.hit_point(self.gate).copied() else {
            return GateStep::Ignored;
        };
        if hit_point.camera != camera || hit_point.direction != direction {
            log::debug!(
                "{} {} is not gate {} of {}",
                camera,
                direction,
                self.gate,
                self.level.name
            );
            return GateStep::Ignored;
        }
        if self.no_hit_until.is_some_and(|until| now <= until) {
            log::debug!("{} {} within debounce window", camera, direction);
            return GateStep::Ignored;
        }
        self.no_hit_until = Some(now + DEBOUNCE);

        let time_ms = match self.hits.last() {
            Some(previous) if self.gate > 0 => timestamp - previous.timestamp,
            _ => {
                self.timestamp_start = timestamp;
                0
            }
        };
        let hit = GateAnnouncement {
            level_name: self.level.name.clone(),
            gate_number: self.gate as u32,
            camera: hit_point.camera,
            position,
            timestamp,
            direction: hit_point.direction,
            time_ms,
        };
        self.hits.push(hit.clone());
        log::info!("gate {} of {} hit in {} ms", self.gate, self.level.name, time_ms);

        if self.gate + 1 == self.level.len() {
            let total_ms = self.hits.iter().map(|h| h.time_ms).sum();
            self.restart_at = None;
            self.gate += 1;
            return GateStep::Finished { hit, total_ms };
        }

        self.restart_at = Some(now + RESTART_AFTER);
        self.gate += 1;
        GateStep::Hit(hit)
    }
}

pub struct GateCrasher {
    station: Station,
    pipeline: TrackingPipeline,
    levels: Vec<Level>,
    level_index: usize,
    machine: GateMachine,
    flight: u32,
    frames: Option<Arc<FrameCollection>>,
    running: bool,
}

impl GateCrasher {
    pub fn new(station: Station, flight: u32) -> anyhow::Result<Self> {
        validate_flight(flight)?;
        let pipeline = TrackingPipeline::spawn(station.settings)?;
        let levels = builtin_levels();
        let machine = GateMachine::new(levels[0].clone());
        Ok(Self {
            station,
            pipeline,
            levels,
            level_index: 0,
            machine,
            flight,
            frames: None,
            running: false,
        })
    }

    pub fn levels(&self) -> &[Level] {
        &self.levels
    }

    pub fn level_names(&self) -> Vec<&str> {
        self.levels.iter().map(|l| l.name.as_str()).collect()
    }

    pub fn level(&self) -> &Level {
        &self.levels[self.level_index]
    }

    pub fn level_index_by_name(&self, name: &str) -> Option<usize> {
        self.levels.iter().position(|l| l.name == name)
    }

    pub fn set_level(&mut self, index: usize) -> SleipnirResult<()> {
        if self.running {
            return Err(SleipnirError::illegal_state("cannot change level during a run"));
        }
        let level = self
            .levels
            .get(index)
            .ok_or_else(|| SleipnirError::illegal_state(format!("no level with index {}", index)))?;
        self.machine = GateMachine::new(level.clone());
        self.level_index = index;
        Ok(())
    }

    pub fn set_level_by_name(&mut self, name: &str) -> SleipnirResult<()> {
        let index = self
            .level_index_by_name(name)
            .ok_or_else(|| SleipnirError::illegal_state(format!("unknown level '{}'", name)))?;
        self.set_level(index)
    }

    pub fn flight(&self) -> u32 {
        self.flight
    }

    pub fn set_flight(&mut self, flight: u32) -> SleipnirResult<()> {
        validate_flight(flight)?;
        if self.running {
            return Err(SleipnirError::illegal_state("cannot change flight during a run"));
        }
        log::info!("loading gate announcements for flight {}", flight);
        let loaded = self.station.db.fetch_gate_announcements(flight)?;
        self.flight = flight;
        self.frames = None;
        self.station.events.emit(Event::GateAnnouncementsLoaded(loaded));
        Ok(())
    }

    pub fn current_gate(&self) -> usize {
        self.machine.current_gate()
    }

    pub fn current_runtime_ms(&self) -> i64 {
        self.machine.current_runtime_ms()
    }

    pub fn announcements(&self) -> &[GateAnnouncement] {
        self.machine.hits()
    }

    pub fn announcement(&self, index: usize) -> Option<&GateAnnouncement> {
        self.machine.hits().get(index)
    }

    pub fn get_time(&self, frame: &Frame) -> SleipnirResult<i64> {
        match &self.frames {
            Some(frames) => frames.time_of(frame),
            None => Ok(0),
        }
    }

    fn on_new_frame(&mut self, frame: &Frame) -> SleipnirResult<()> {
        let Some(frames) = self.frames.clone() else {
            return Ok(());
        };
        if self.pipeline.lag.skip() {
            return Ok(());
        }
        if self.machine.check_restart(self.station.clock.now()) {
            self.pipeline.lag.reset();
            log::info!("gate missed, restarting {}", self.machine.level().name);
            self.station.events.emit(Event::CourseRestarted);
            return Ok(());
        }

        let last_known = frames.get_frame_count(frame.camera);
        if self.pipeline.lag.detect(frame.camera, last_known, frame.position) {
            return Ok(());
        }

        let Some(analysis) = self.pipeline.exchange(&frames, frame)? else {
            return Ok(());
        };
        self.machine
            .update_runtime(analysis.frame.camera, analysis.frame.timestamp);
        self.station.events.emit(Event::FrameAnalyzed {
            frame: analysis.frame.clone(),
            image: analysis.image,
            direction: analysis.direction,
        });

        let Some(direction) = analysis.direction else {
            return Ok(());
        };
        let now = self.station.clock.now();
        let step = self.machine.on_trigger(
            analysis.frame.camera,
            direction,
            analysis.frame.position,
            analysis.frame.timestamp,
            now,
        );
        match step {
            GateStep::Hit(hit) => self.station.events.emit(Event::GateHit(hit)),
            GateStep::Finished { hit, total_ms } => {
                self.station.events.emit(Event::GateHit(hit));
                log::info!("{} finished in {} ms", self.machine.level().name, total_ms);
                self.station.events.emit(Event::CourseFinished { total_ms });
                self.stop_run()?;
            }
            GateStep::Ignored => {}
        }
        Ok(())
    }
}

impl Discipline for GateCrasher {
    fn game(&self) -> Game {
        Game::GateCrasher
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn start_run(&mut self) -> SleipnirResult<()> {
        log::info!("gate crasher starting...");
        if self.running {
            return Err(SleipnirError::illegal_state("gate crasher is already running"));
        }
        if !self.station.server.is_ready_to_shoot() {
            return Err(SleipnirError::illegal_state("camera server is not ready to shoot"));
        }

        self.pipeline.reset()?;
        let frames = self.station.frame_collection(Game::GateCrasher, self.flight);
        self.station.server.start_shooting(frames.clone())?;

        self.machine.reset();
        self.frames = Some(frames);
        self.running = true;
        self.station.events.emit(Event::GameStarted(Game::GateCrasher));
        Ok(())
    }

    fn stop_run(&mut self) -> SleipnirResult<()> {
        if !self.running {
            return Ok(());
        }
        log::info!("gate crasher stopping...");
        self.station.server.stop_shooting();
        self.pipeline.drain();
        self.running = false;
        log::info!("saving {} gate announcements", self.machine.hits().len());
        let saved = self
            .station
            .db
            .store_gate_announcements(self.flight, self.machine.hits());
        self.station.events.emit(Event::GameStopped(Game::GateCrasher));
        saved
    }
}

impl EventHandler for GateCrasher {
    fn handle(&mut self, event: &Event) -> anyhow::Result<()> {
        match event {
            Event::NewFrame(frame) if self.running => self.on_new_frame(frame)?,
            Event::CameraOffline(camera) if self.running => {
                log::warn!("{} went offline, stopping the run", camera);
                self.stop_run()?;
            }
            _ => {}
        }
        Ok(())
    }
}
