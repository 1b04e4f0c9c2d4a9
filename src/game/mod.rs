//! Timing disciplines.
//!
//! A discipline owns a run: it starts capture on the [`CameraServer`], feeds
//! every new frame through the per-camera trackers and turns classified
//! crossings into announcements. All of it happens on the event loop thread.

mod align;
mod gate_crasher;
mod levels;
mod speed_trap;

use image::GrayImage;
use std::sync::Arc;

use crate::clock::Clock;
use crate::error::SleipnirResult;
use crate::event::{EventHandler, EventSender};
use crate::frame::{Camera, Frame, FrameCollection};
use crate::server::CameraServer;
use crate::storage::{Database, FrameRepository};
use crate::tracker::{TrackerJob, TrackerSettings, TrackerWorker};
use crate::{Direction, Game};

pub use align::{AlignLogic, ALIGN_FLIGHT};
pub use gate_crasher::{GateCrasher, GateMachine, GateStep};
pub use levels::{builtin_levels, HitPoint, Level};
pub use speed_trap::{
    score_pass, PassMachine, PassStep, SpeedPass, SpeedTrap, Trigger, DEFAULT_DISTANCE_M,
};

/// Collaborators shared by every discipline for the lifetime of the process.
#[derive(Clone)]
pub struct Station {
    pub server: CameraServer,
    pub db: Arc<Database>,
    pub events: EventSender,
    pub clock: Arc<dyn Clock>,
    pub settings: TrackerSettings,
}

impl Station {
    pub(crate) fn frame_collection(&self, game: Game, flight: u32) -> Arc<FrameCollection> {
        let repository: Arc<dyn FrameRepository> = self.db.clone();
        Arc::new(FrameCollection::new(repository, game, flight))
    }
}

pub trait Discipline: EventHandler {
    fn game(&self) -> Game;

    fn is_running(&self) -> bool;

    /// Fails with `IllegalState` when a run is active or the cameras are not
    /// ready; nothing is changed in that case.
    fn start_run(&mut self) -> SleipnirResult<()>;

    /// Stops capture and persists the run's announcements. A no-op when idle.
    fn stop_run(&mut self) -> SleipnirResult<()>;
}

/// Skips new-frame events while the trackers catch up with the upload stream.
#[derive(Debug, Default)]
pub struct LagGuard {
    recovery: u32,
}

impl LagGuard {
    /// Largest tolerated distance between the newest stored frame and the frame being handled.
    pub const MAX_ALLOWED_LAG: u32 = 15;
    /// Both cameras feed the same queue, so the backlog drains at a third of the lag.
    pub const RECOVERY_EVENTS: u32 = Self::MAX_ALLOWED_LAG * 3;

    /// True while recovering; each call consumes one skipped event.
    pub fn skip(&mut self) -> bool {
        if self.recovery > 0 {
            self.recovery -= 1;
            return true;
        }
        false
    }

    /// Enters recovery when the frame store is more than `MAX_ALLOWED_LAG`
    /// positions ahead of the frame at hand.
    pub fn detect(&mut self, camera: Camera, last_known: u32, position: u32) -> bool {
        if last_known.saturating_sub(position) > Self::MAX_ALLOWED_LAG {
            log::warn!(
                "lag detected when fetching new frame {}: {}, skipping ahead {} frames",
                camera,
                position,
                Self::MAX_ALLOWED_LAG
            );
            self.recovery = Self::RECOVERY_EVENTS;
            return true;
        }
        false
    }

    pub fn is_recovering(&self) -> bool {
        self.recovery > 0
    }

    pub fn reset(&mut self) {
        self.recovery = 0;
    }
}

/// Tracker verdict for a frame handled one event earlier.
#[derive(Clone, Debug)]
pub struct Analysis {
    pub frame: Frame,
    pub direction: Option<Direction>,
    pub image: Arc<GrayImage>,
}

/// The two camera trackers plus lag handling, shared by the timed disciplines.
pub(crate) struct TrackingPipeline {
    workers: [TrackerWorker; 2],
    pub lag: LagGuard,
    settings: TrackerSettings,
}

impl TrackingPipeline {
    pub fn spawn(settings: TrackerSettings) -> anyhow::Result<Self> {
        Ok(Self {
            workers: [
                TrackerWorker::spawn(Camera::A)?,
                TrackerWorker::spawn(Camera::B)?,
            ],
            lag: LagGuard::default(),
            settings,
        })
    }

    pub fn reset(&mut self) -> SleipnirResult<()> {
        for worker in self.workers.iter_mut() {
            worker.reset()?;
        }
        self.lag.reset();
        Ok(())
    }

    /// Lets in-flight jobs finish and drops their results.
    pub fn drain(&mut self) {
        for camera in Camera::ALL {
            if self.is_busy(camera) {
                log::debug!("dropping the pending {} verdict", camera);
                let _ = self.workers[camera.index()].wait();
            }
        }
    }

    /// Waits for the camera's previous job, submits `frame` and returns the
    /// previous job's verdict. The first frame after a reset yields `None`.
    ///
    /// A frame whose image cannot be loaded is not tracked, but the verdict
    /// already waiting is still handed back.
    pub fn exchange(
        &mut self,
        frames: &FrameCollection,
        frame: &Frame,
    ) -> SleipnirResult<Option<Analysis>> {
        let worker = &mut self.workers[frame.camera.index()];
        let previous = worker.wait();

        match frames.take_image(frame.camera, frame.position) {
            Ok(image) => worker.submit(TrackerJob {
                position: frame.position,
                image,
                settings: self.settings,
            })?,
            Err(err) => log::warn!(
                "dropping frame {} #{} from tracking: {}",
                frame.camera,
                frame.position,
                err
            ),
        }

        let Some(result) = previous else {
            return Ok(None);
        };
        let analyzed = match frames.get_frame(frame.camera, result.position) {
            Ok(analyzed) => analyzed,
            Err(err) if err.is_not_found() => return Ok(None),
            Err(err) => return Err(err),
        };
        Ok(Some(Analysis {
            frame: analyzed,
            direction: result.direction,
            image: Arc::new(result.image),
        }))
    }

    pub fn is_busy(&self, camera: Camera) -> bool {
        self.workers[camera.index()].is_busy()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::Station;
    use crate::clock::ManualClock;
    use crate::event::{self, Event, EventLoop};
    use crate::frame::{encode_jpeg, Camera};
    use crate::server::{CameraRequest, CameraServer};
    use crate::storage::Database;
    use crate::tracker::testing::sky_with_plane;
    use crate::tracker::TrackerSettings;

    pub struct StationFixture {
        pub station: Station,
        pub events: EventLoop,
        pub seen: Arc<Mutex<Vec<Event>>>,
    }

    /// In-memory station with both cameras online.
    pub fn online_station() -> StationFixture {
        let clock = Arc::new(ManualClock::new());
        let (tx, mut events) = event::channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        events.subscribe_fn(move |e| {
            sink.lock().unwrap().push(e.clone());
            Ok(())
        });
        let server = CameraServer::new(tx.clone(), clock.clone());
        for camera in Camera::ALL {
            server.handle_request(CameraRequest::start_camera(camera)).unwrap();
        }
        server.check_online();
        let station = Station {
            server,
            db: Arc::new(Database::open_in_memory().unwrap()),
            events: tx,
            clock,
            settings: TrackerSettings::default(),
        };
        let mut fixture = StationFixture {
            station,
            events,
            seen,
        };
        fixture.dispatch();
        fixture
    }

    impl StationFixture {
        /// Stores a frame through the upload protocol without dispatching it.
        pub fn upload(&self, camera: Camera, position: u32) {
            let jpeg = encode_jpeg(&sky_with_plane(10 + position as i32, 60)).unwrap();
            self.station
                .server
                .handle_request(CameraRequest::upload_frame(
                    camera,
                    position,
                    1000 + 11 * position as i64,
                    jpeg,
                ))
                .unwrap();
        }

        pub fn dispatch(&mut self) -> Vec<Event> {
            self.events.dispatch_pending();
            std::mem::take(&mut *self.seen.lock().unwrap())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_jpeg;
    use crate::storage::InMemoryFrameRepository;
    use crate::tracker::testing::sky_with_plane;

    fn frames_with_bodies(bodies: Vec<Vec<u8>>) -> FrameCollection {
        let frames = FrameCollection::new(Arc::new(InMemoryFrameRepository::new()), Game::SpeedTrap, 1);
        for (i, body) in bodies.into_iter().enumerate() {
            let position = i as u32 + 1;
            frames
                .add_frame(Frame::new(1, Camera::A, position, 1000 + 11 * position as i64, Some(body)))
                .unwrap();
        }
        frames
    }

    #[test]
    fn undecodable_frame_keeps_the_pending_verdict() {
        let jpeg = |x| encode_jpeg(&sky_with_plane(x, 100)).unwrap();
        let frames = frames_with_bodies(vec![jpeg(40), jpeg(60), b"not-a-jpeg".to_vec(), jpeg(100)]);
        let mut pipeline = TrackingPipeline::spawn(TrackerSettings::default()).unwrap();

        let mut delivered = Vec::new();
        for position in 1..=4 {
            let frame = frames.get_frame(Camera::A, position).unwrap();
            if let Some(analysis) = pipeline.exchange(&frames, &frame).unwrap() {
                delivered.push(analysis.frame.position);
            }
        }
        assert_eq!(delivered, vec![1, 2]);
        // Frame 3 was never submitted, frame 4 is.
        assert!(pipeline.is_busy(Camera::A));
        assert!(!pipeline.is_busy(Camera::B));

        pipeline.drain();
        assert!(!pipeline.is_busy(Camera::A));
    }

    #[test]
    fn lag_guard_skips_forty_five_events() {
        let mut guard = LagGuard::default();
        assert!(!guard.detect(Camera::A, 30, 15));
        assert!(guard.detect(Camera::A, 31, 15));

        let skipped = (0..100).take_while(|_| guard.skip()).count();
        assert_eq!(skipped, 45);
        assert!(!guard.is_recovering());
    }

    #[test]
    fn store_behind_the_frame_is_not_lag() {
        let mut guard = LagGuard::default();
        assert!(!guard.detect(Camera::B, 3, 10));
        assert!(!guard.skip());
    }
}
