//! Speed-Trap: one pass through both cameras, timed over a known distance.
//!
//! Flying right, camera A starts the pass and camera B ends it; flying left
//! the cameras swap roles. A pass that is not completed within six seconds is
//! aborted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Discipline, Station, TrackingPipeline};
use crate::announcement::{max_speeds, MaxSpeeds, SpeedAnnouncement};
use crate::error::{SleipnirError, SleipnirResult};
use crate::event::{Event, EventHandler};
use crate::frame::{Camera, Frame, FrameCollection};
use crate::{validate_flight, Direction, Game};

pub const ABORT_AFTER: Duration = Duration::from_secs(6);
/// Faster passes are sensor artifacts.
pub const MAX_PLAUSIBLE_KMH: f64 = 500.0;
pub const DEFAULT_DISTANCE_M: f64 = 100.0;

/// A classified crossing on one camera.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Trigger {
    pub camera: Camera,
    pub position: u32,
    pub timestamp: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpeedPass {
    pub direction: Direction,
    pub start: Trigger,
    pub end: Trigger,
}

impl SpeedPass {
    /// End minus start, in capture-clock milliseconds.
    pub fn elapsed_ms(&self) -> i64 {
        self.end.timestamp - self.start.timestamp
    }

    fn trigger_on(&self, camera: Camera) -> &Trigger {
        if self.start.camera == camera {
            &self.start
        } else {
            &self.end
        }
    }
}

/// Turns a completed pass into an announcement, or `None` when the derived
/// speed is implausible.
pub fn score_pass(pass: &SpeedPass, distance_m: f64) -> Option<SpeedAnnouncement> {
    let ms = pass.elapsed_ms();
    let kmh = if ms > 0 {
        (distance_m / 1000.0) / (ms as f64 / 3_600_000.0)
    } else {
        0.0
    };
    if kmh >= MAX_PLAUSIBLE_KMH {
        log::warn!("not announcing a pass of {:.1} km/h", kmh);
        return None;
    }
    let cam1 = pass.trigger_on(Camera::A);
    let cam2 = pass.trigger_on(Camera::B);
    Some(SpeedAnnouncement {
        cam1_position: cam1.position,
        cam2_position: cam2.position,
        duration_ms: (cam1.timestamp - cam2.timestamp).abs(),
        speed_kmh: kmh,
        direction: pass.direction,
    })
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PassStep {
    /// Wrong way on a camera that matters right now.
    Discarded,
    /// Nothing to do with the pass in progress.
    Ignored,
    Started(Camera),
    Completed(SpeedPass),
}

/// Pass state without any I/O.
#[derive(Debug, Default)]
pub struct PassMachine {
    armed: Option<(Direction, Trigger)>,
    abort_at: Option<Instant>,
}

impl PassMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn direction(&self) -> Option<Direction> {
        self.armed.map(|(direction, _)| direction)
    }

    pub fn reset(&mut self) {
        self.armed = None;
        self.abort_at = None;
    }

    /// Drops an armed pass whose deadline has passed. True if it did.
    pub fn check_abort(&mut self, now: Instant) -> bool {
        match self.abort_at {
            Some(deadline) if now > deadline => {
                self.reset();
                true
            }
            _ => false,
        }
    }

    pub fn on_trigger(
        &mut self,
        camera: Camera,
        direction: Direction,
        position: u32,
        timestamp: i64,
        now: Instant,
    ) -> PassStep {
        let trigger = Trigger {
            camera,
            position,
            timestamp,
        };
        let armed = self.direction();

        match (camera, armed, direction) {
            (Camera::A, None, Direction::Left) | (Camera::B, None, Direction::Right) => {
                log::info!("{} triggered the wrong way for the start of a pass, discarding", camera);
                PassStep::Discarded
            }
            (Camera::A, Some(Direction::Left), Direction::Right)
            | (Camera::B, Some(Direction::Right), Direction::Left) => {
                log::info!("{} triggered the wrong way in a pass, discarding", camera);
                PassStep::Discarded
            }
            (Camera::A, None, Direction::Right) | (Camera::B, None, Direction::Left) => {
                log::info!("initiating timed pass from {} heading {}", camera, direction);
                self.armed = Some((direction, trigger));
                self.abort_at = Some(now + ABORT_AFTER);
                PassStep::Started(camera)
            }
            (Camera::B, Some(Direction::Right), Direction::Right)
            | (Camera::A, Some(Direction::Left), Direction::Left) => {
                let Some((direction, start)) = self.armed.take() else {
                    return PassStep::Ignored;
                };
                self.abort_at = None;
                log::info!("timed pass completed on {} heading {}", camera, direction);
                PassStep::Completed(SpeedPass {
                    direction,
                    start,
                    end: trigger,
                })
            }
            _ => {
                log::debug!("{} {} does not affect the pass in progress", camera, direction);
                PassStep::Ignored
            }
        }
    }
}

pub struct SpeedTrap {
    station: Station,
    pipeline: TrackingPipeline,
    machine: PassMachine,
    flight: u32,
    distance_m: f64,
    frames: Option<Arc<FrameCollection>>,
    running: bool,
    announcements: Vec<SpeedAnnouncement>,
}

impl SpeedTrap {
    pub fn new(station: Station, flight: u32) -> anyhow::Result<Self> {
        validate_flight(flight)?;
        log::info!(
            "max dive angle is set at {}°, blur strength at {}",
            station.settings.max_dive_angle,
            station.settings.blur_strength
        );
        let pipeline = TrackingPipeline::spawn(station.settings)?;
        Ok(Self {
            station,
            pipeline,
            machine: PassMachine::new(),
            flight,
            distance_m: DEFAULT_DISTANCE_M,
            frames: None,
            running: false,
            announcements: Vec::new(),
        })
    }

    pub fn flight(&self) -> u32 {
        self.flight
    }

    /// Switches flights and loads the announcements stored for the new one.
    pub fn set_flight(&mut self, flight: u32) -> SleipnirResult<()> {
        validate_flight(flight)?;
        if self.running {
            return Err(SleipnirError::illegal_state("cannot change flight during a run"));
        }
        log::info!("loading announcements for flight {}", flight);
        self.announcements = self.station.db.fetch_speed_announcements(flight)?;
        self.flight = flight;
        self.frames = None;
        self.station
            .events
            .emit(Event::SpeedAnnouncementsLoaded(self.announcements.clone()));
        Ok(())
    }

    pub fn distance_m(&self) -> f64 {
        self.distance_m
    }

    pub fn set_distance_m(&mut self, distance_m: f64) {
        self.distance_m = distance_m;
    }

    pub fn pass_direction(&self) -> Option<Direction> {
        self.machine.direction()
    }

    pub fn announcements(&self) -> &[SpeedAnnouncement] {
        &self.announcements
    }

    pub fn announcement(&self, index: usize) -> Option<&SpeedAnnouncement> {
        self.announcements.get(index)
    }

    pub fn remove_announcement(&mut self, index: usize) -> Option<SpeedAnnouncement> {
        if index < self.announcements.len() {
            Some(self.announcements.remove(index))
        } else {
            None
        }
    }

    pub fn max_speeds(&self) -> MaxSpeeds {
        max_speeds(&self.announcements)
    }

    /// Persists the current announcements for the flight.
    pub fn save_announcements(&self) -> SleipnirResult<()> {
        log::info!("saving {} announcements", self.announcements.len());
        self.station
            .db
            .store_speed_announcements(self.flight, &self.announcements)
    }

    /// Frame time since the start of the run, 0 before any frames.
    pub fn get_time(&self, frame: &Frame) -> SleipnirResult<i64> {
        match &self.frames {
            Some(frames) => frames.time_of(frame),
            None => Ok(0),
        }
    }

    pub fn frames(&self) -> Option<&Arc<FrameCollection>> {
        self.frames.as_ref()
    }

    fn on_new_frame(&mut self, frame: &Frame) -> SleipnirResult<()> {
        let Some(frames) = self.frames.clone() else {
            return Ok(());
        };
        if self.pipeline.lag.skip() {
            return Ok(());
        }
        if self.machine.check_abort(self.station.clock.now()) {
            log::info!("speed pass aborted");
            self.station.events.emit(Event::PassAborted);
        }

        let last_known = frames.get_frame_count(frame.camera);
        if self.pipeline.lag.detect(frame.camera, last_known, frame.position) {
            return Ok(());
        }

        let Some(analysis) = self.pipeline.exchange(&frames, frame)? else {
            return Ok(());
        };
        if let Some(direction) = analysis.direction {
            self.check_pass(&analysis.frame, direction);
        }
        self.station.events.emit(Event::FrameAnalyzed {
            frame: analysis.frame,
            image: analysis.image,
            direction: analysis.direction,
        });
        Ok(())
    }

    fn check_pass(&mut self, frame: &Frame, direction: Direction) {
        let now = self.station.clock.now();
        match self
            .machine
            .on_trigger(frame.camera, direction, frame.position, frame.timestamp, now)
        {
            PassStep::Started(camera) => self.station.events.emit(Event::PassStarted(camera)),
            PassStep::Completed(pass) => {
                self.station.events.emit(Event::PassEnded(pass.clone()));
                if let Some(announcement) = score_pass(&pass, self.distance_m) {
                    log::info!(
                        "{:.1} km/h heading {} in {} ms",
                        announcement.speed_kmh,
                        announcement.direction,
                        announcement.duration_ms
                    );
                    self.announcements.push(announcement.clone());
                    self.station.events.emit(Event::AnnouncementNew(announcement));
                }
            }
            PassStep::Discarded | PassStep::Ignored => {}
        }
    }
}

impl Discipline for SpeedTrap {
    fn game(&self) -> Game {
        Game::SpeedTrap
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn start_run(&mut self) -> SleipnirResult<()> {
        log::info!("speed trap starting...");
        if self.running {
            return Err(SleipnirError::illegal_state("speed trap is already running"));
        }
        if !self.station.server.is_ready_to_shoot() {
            return Err(SleipnirError::illegal_state("camera server is not ready to shoot"));
        }

        self.pipeline.reset()?;
        let frames = self.station.frame_collection(Game::SpeedTrap, self.flight);
        self.station.server.start_shooting(frames.clone())?;

        self.machine.reset();
        self.announcements.clear();
        self.frames = Some(frames);
        self.running = true;
        self.station.events.emit(Event::GameStarted(Game::SpeedTrap));
        Ok(())
    }

    fn stop_run(&mut self) -> SleipnirResult<()> {
        if !self.running {
            return Ok(());
        }
        log::info!("speed trap stopping...");
        self.station.server.stop_shooting();
        self.pipeline.drain();
        self.running = false;
        let saved = self.save_announcements();
        self.station.events.emit(Event::GameStopped(Game::SpeedTrap));
        saved
    }
}

impl EventHandler for SpeedTrap {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::testing::online_station;
    use crate::game::LagGuard;
    use std::sync::Mutex;

    fn analyzed(events: &[Event]) -> Vec<(Camera, u32)> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::FrameAnalyzed { frame, .. } => Some((frame.camera, frame.position)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn lagging_run_skips_the_recovery_window_untracked() {
        let mut fixture = online_station();
        let trap = Arc::new(Mutex::new(SpeedTrap::new(fixture.station.clone(), 1).unwrap()));
        fixture.events.subscribe(trap.clone());
        trap.lock().unwrap().start_run().unwrap();
        fixture.dispatch();

        // The store is 19 frames ahead when the first new-frame event is handled.
        for position in 1..=20 {
            fixture.upload(Camera::A, position);
        }
        let seen = fixture.dispatch();
        assert!(analyzed(&seen).is_empty());
        assert!(trap.lock().unwrap().pipeline.lag.is_recovering());

        // 19 events so far were skipped; 26 more close the window.
        for position in 1..=26 {
            fixture.upload(Camera::B, position);
        }
        let seen = fixture.dispatch();
        let new_frames = seen.iter().filter(|e| matches!(e, Event::NewFrame(_))).count();
        assert_eq!(new_frames as u32 + 19, LagGuard::RECOVERY_EVENTS);
        assert!(analyzed(&seen).is_empty());
        {
            let trap = trap.lock().unwrap();
            assert!(!trap.pipeline.lag.is_recovering());
            assert!(!trap.pipeline.is_busy(Camera::A));
            assert!(!trap.pipeline.is_busy(Camera::B));
        }

        fixture.upload(Camera::A, 21);
        assert!(analyzed(&fixture.dispatch()).is_empty());
        assert!(trap.lock().unwrap().pipeline.is_busy(Camera::A));

        fixture.upload(Camera::A, 22);
        assert_eq!(analyzed(&fixture.dispatch()), vec![(Camera::A, 21)]);

        trap.lock().unwrap().stop_run().unwrap();
    }

    #[test]
    fn failed_start_leaves_capture_off() {
        let fixture = online_station();
        let mut trap = SpeedTrap::new(fixture.station.clone(), 1).unwrap();
        trap.pipeline.workers[Camera::B.index()].shut_down();

        assert!(matches!(
            trap.start_run(),
            Err(SleipnirError::IllegalState(_))
        ));
        assert!(!trap.is_running());
        assert!(!fixture.station.server.is_accepting());
    }

    fn pass(direction: Direction, a: (u32, i64), b: (u32, i64)) -> SpeedPass {
        let ta = Trigger {
            camera: Camera::A,
            position: a.0,
            timestamp: a.1,
        };
        let tb = Trigger {
            camera: Camera::B,
            position: b.0,
            timestamp: b.1,
        };
        match direction {
            Direction::Right => SpeedPass {
                direction,
                start: ta,
                end: tb,
            },
            Direction::Left => SpeedPass {
                direction,
                start: tb,
                end: ta,
            },
        }
    }

    #[test]
    fn implausible_speed_is_rejected() {
        // 100 m in 360 ms is 1000 km/h.
        assert!(score_pass(&pass(Direction::Right, (10, 1000), (42, 1360)), 100.0).is_none());
    }

    #[test]
    fn speed_is_derived_from_distance_and_duration() {
        // 100 m in 1.8 s is 200 km/h.
        let announcement = score_pass(&pass(Direction::Left, (80, 5800), (12, 4000)), 100.0).unwrap();
        assert!((announcement.speed_kmh - 200.0).abs() < 1e-9);
        assert_eq!(announcement.duration_ms, 1800);
        assert_eq!(announcement.cam1_position, 80);
        assert_eq!(announcement.cam2_position, 12);
        assert_eq!(announcement.direction, Direction::Left);
    }

    #[test]
    fn non_positive_duration_scores_zero() {
        let announcement = score_pass(&pass(Direction::Right, (1, 500), (2, 500)), 100.0).unwrap();
        assert_eq!(announcement.speed_kmh, 0.0);
    }

    #[test]
    fn right_pass_runs_from_a_to_b() {
        let now = Instant::now();
        let mut machine = PassMachine::new();
        assert_eq!(
            machine.on_trigger(Camera::A, Direction::Right, 10, 1000, now),
            PassStep::Started(Camera::A)
        );
        // Wrong way on the finishing camera is dropped without disarming.
        assert_eq!(
            machine.on_trigger(Camera::B, Direction::Left, 30, 1500, now),
            PassStep::Discarded
        );
        // Camera A again does not matter while armed to the right.
        assert_eq!(
            machine.on_trigger(Camera::A, Direction::Right, 12, 1020, now),
            PassStep::Ignored
        );
        match machine.on_trigger(Camera::B, Direction::Right, 40, 2800, now) {
            PassStep::Completed(pass) => {
                assert_eq!(pass.direction, Direction::Right);
                assert_eq!(pass.start.position, 10);
                assert_eq!(pass.elapsed_ms(), 1800);
            }
            other => panic!("expected completion, got {:?}", other),
        }
        assert_eq!(machine.direction(), None);
    }

    #[test]
    fn wrong_way_starts_are_discarded() {
        let now = Instant::now();
        let mut machine = PassMachine::new();
        assert_eq!(
            machine.on_trigger(Camera::A, Direction::Left, 1, 0, now),
            PassStep::Discarded
        );
        assert_eq!(
            machine.on_trigger(Camera::B, Direction::Right, 1, 0, now),
            PassStep::Discarded
        );
        assert_eq!(machine.direction(), None);
    }

    #[test]
    fn armed_pass_aborts_after_six_seconds() {
        let t0 = Instant::now();
        let mut machine = PassMachine::new();
        machine.on_trigger(Camera::B, Direction::Left, 5, 100, t0);
        assert!(!machine.check_abort(t0 + Duration::from_secs(6)));
        assert!(machine.check_abort(t0 + Duration::from_millis(6001)));
        assert_eq!(machine.direction(), None);
        assert!(!machine.check_abort(t0 + Duration::from_secs(20)));
    }
}
