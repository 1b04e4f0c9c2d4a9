//! Per-camera motion tracking.
//!
//! Each frame is blurred and differenced against the previous blurred frame.
//! Changed regions become [`MotionBox`]es; a box that straddles the centerline
//! is followed backwards through earlier frames to decide whether, and in
//! which direction, the object crossed.

mod image_ops;
mod matcher;
mod motion_box;
mod worker;

use image::GrayImage;

use crate::frame::Camera;
use crate::Direction;

pub use image_ops::{abs_diff, dilate, find_boxes, gaussian_blur, kernel_size, outline_box, threshold};
pub use matcher::{backward_match, dive_angle, is_match, MatchOutcome};
pub use motion_box::{MotionBox, MotionHistory};
pub use worker::TrackerWorker;

/// Frame width the camera agents deliver.
pub const FRAME_WIDTH: i32 = 320;
pub const CENTERLINE: i32 = FRAME_WIDTH / 2;

const MIN_CANDIDATE_AREA: u32 = 135;
const MAX_CANDIDATE_AREA: u32 = 10_000;
/// Candidates are only classified once this many frames exist behind them.
const MIN_CANDIDATE_POSITION: u32 = 4;

const LOOKBACK_START: u32 = 10;
const LOOKBACK_STEP: u32 = 10;
const LOOKBACK_MAX: u32 = 30;
/// A match that ends with the object inside this band is extended further back.
const CENTER_BAND: (f32, f32) = (80.0, 240.0);

const HISTORY_WINDOW: u32 = LOOKBACK_MAX + 2;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackerSettings {
    /// Boxes reaching below this row are ignored.
    pub ground_level: i32,
    pub max_dive_angle: f32,
    pub blur_strength: f32,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            ground_level: 400,
            max_dive_angle: 10.0,
            blur_strength: 4.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TrackerJob {
    pub position: u32,
    pub image: GrayImage,
    pub settings: TrackerSettings,
}

#[derive(Clone, Debug)]
pub struct TrackerResult {
    pub position: u32,
    pub direction: Option<Direction>,
    /// The input frame with candidate boxes outlined.
    pub image: GrayImage,
}

impl TrackerResult {
    pub fn has_motion(&self) -> bool {
        self.direction.is_some()
    }
}

pub struct MotionTracker {
    camera: Camera,
    last_position: u32,
    baseline: Option<GrayImage>,
    history: MotionHistory,
}

impl MotionTracker {
    pub fn new(camera: Camera) -> Self {
        Self {
            camera,
            last_position: 0,
            baseline: None,
            history: MotionHistory::new(HISTORY_WINDOW),
        }
    }

    pub fn camera(&self) -> Camera {
        self.camera
    }

    pub fn last_position(&self) -> u32 {
        self.last_position
    }

    pub fn reset(&mut self) {
        self.last_position = 0;
        self.baseline = None;
        self.history.clear();
    }

    /// Analyzes one frame. Returns `None` for a repeat of the last position.
    pub fn track(&mut self, job: TrackerJob) -> Option<TrackerResult> {
        let TrackerJob {
            position,
            mut image,
            settings,
        } = job;

        if position == self.last_position {
            log::debug!("{} position {} already tracked", self.camera, position);
            return None;
        }
        if self.last_position + 1 != position {
            log::warn!("missed frame on camera {}: {}", self.camera, position);
        }
        self.last_position = position;

        let blurred = gaussian_blur(&image, settings.blur_strength);
        let mut direction = None;

        let baseline = self
            .baseline
            .as_ref()
            .filter(|baseline| baseline.dimensions() == blurred.dimensions());
        if let Some(baseline) = baseline {
            let mask = dilate(&threshold(&abs_diff(baseline, &blurred)));
            let boxes = find_boxes(&mask);
            self.history.insert(position, boxes.clone());

            for candidate in &boxes {
                if candidate.bottom() > settings.ground_level {
                    continue;
                }
                if !(MIN_CANDIDATE_AREA..=MAX_CANDIDATE_AREA).contains(&candidate.area) {
                    continue;
                }
                outline_box(&mut image, candidate);

                if !candidate.straddles(CENTERLINE) || position <= MIN_CANDIDATE_POSITION {
                    continue;
                }
                direction = self.classify(candidate, position, settings.max_dive_angle);
                if let Some(found) = direction {
                    log::info!(
                        "motion found on {} position {}: {} (area {})",
                        self.camera,
                        position,
                        found,
                        candidate.area
                    );
                    break;
                }
            }
        }

        self.baseline = Some(blurred);
        Some(TrackerResult {
            position,
            direction,
            image,
        })
    }

    fn classify(&self, candidate: &MotionBox, position: u32, max_dive_angle: f32) -> Option<Direction> {
        let mut budget = LOOKBACK_START;
        loop {
            if budget > LOOKBACK_START {
                log::info!(
                    "testing {} frames back on {} position {}",
                    budget,
                    self.camera,
                    position
                );
            }
            let outcome = backward_match(&self.history, candidate, position, budget);
            let direction = outcome.direction?;
            let deepest = outcome.deepest()?;

            let angle = dive_angle(candidate, deepest);
            if angle > max_dive_angle {
                log::debug!(
                    "max dive angle of {}° exceeded on position {} ({:.2}°)",
                    max_dive_angle,
                    position,
                    angle
                );
                return None;
            }

            let center = deepest.center_x();
            if center > CENTER_BAND.0 && center < CENTER_BAND.1 && budget < LOOKBACK_MAX {
                budget += LOOKBACK_STEP;
                continue;
            }
            return Some(direction);
        }
    }
}
