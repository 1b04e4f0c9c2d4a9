//! Camera alignment: live frames from one camera so it can be aimed.

use super::{Discipline, Station};
use crate::error::{SleipnirError, SleipnirResult};
use crate::event::{Event, EventHandler};
use crate::frame::Camera;
use crate::Game;

/// Alignment frames always land in this flight of the align table.
pub const ALIGN_FLIGHT: u32 = 1;

pub struct AlignLogic {
    station: Station,
    target: Camera,
    aligning: Option<Camera>,
}

impl AlignLogic {
    /// `target` is the camera `start_run` aligns.
    pub fn new(station: Station, target: Camera) -> Self {
        Self {
            station,
            target,
            aligning: None,
        }
    }

    pub fn target(&self) -> Camera {
        self.target
    }

    pub fn set_target(&mut self, target: Camera) {
        self.target = target;
    }

    pub fn aligning(&self) -> Option<Camera> {
        self.aligning
    }

    pub fn start_align(&mut self, camera: Camera) -> SleipnirResult<()> {
        if let Some(current) = self.aligning {
            return Err(SleipnirError::illegal_state(format!(
                "{} is already aligning",
                current
            )));
        }
        log::info!("start aligning {}", camera);
        let frames = self.station.frame_collection(Game::Align, ALIGN_FLIGHT);
        self.station.server.start_shooting(frames)?;
        self.aligning = Some(camera);
        self.station.events.emit(Event::AlignStarted(camera));
        Ok(())
    }

    pub fn stop_align(&mut self, camera: Camera) -> SleipnirResult<()> {
        if self.aligning != Some(camera) {
            return Err(SleipnirError::illegal_state(format!(
                "{} is not aligning",
                camera
            )));
        }
        log::info!("stop aligning {}", camera);
        self.station.server.stop_shooting();
        self.aligning = None;
        self.station.events.emit(Event::AlignStopped(camera));
        Ok(())
    }
}

impl Discipline for AlignLogic {
    fn game(&self) -> Game {
        Game::Align
    }

    fn is_running(&self) -> bool {
        self.aligning.is_some()
    }

    fn start_run(&mut self) -> SleipnirResult<()> {
        self.start_align(self.target)
    }

    fn stop_run(&mut self) -> SleipnirResult<()> {
        match self.aligning {
            Some(camera) => self.stop_align(camera),
            None => Ok(()),
        }
    }
}

impl EventHandler for AlignLogic {
    fn handle(&mut self, event: &Event) -> anyhow::Result<()> {
        match event {
            Event::NewFrame(frame) if self.aligning == Some(frame.camera) => {
                self.station.events.emit(Event::AlignFrame(frame.clone()));
            }
            Event::CameraOffline(camera) if self.aligning == Some(*camera) => {
                log::warn!("{} went offline while aligning", camera);
                self.stop_align(*camera)?;
            }
            _ => {}
        }
        Ok(())
    }
}
