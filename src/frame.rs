//! Frames and the ordered per-flight frame store.
//!
//! `FrameCollection` keeps frame metadata in memory for both cameras of one
//! flight and guarantees gapless sequencing: position N is accepted only right
//! after N-1. Image payloads are transient. The upload handler persists the
//! full frame through the `FrameRepository` and keeps only metadata in memory;
//! images are reloaded from storage when the tracker needs them.

use image::{DynamicImage, GrayImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{SleipnirError, SleipnirResult};
use crate::storage::FrameRepository;
use crate::Game;

/// One of the two fixed cameras. `A` sits on the left end of the flight path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Camera {
    A,
    B,
}

impl Camera {
    pub const ALL: [Camera; 2] = [Camera::A, Camera::B];

    pub fn index(self) -> usize {
        match self {
            Camera::A => 0,
            Camera::B => 1,
        }
    }

    /// Identifier used by the camera agents on the wire.
    pub fn wire_id(self) -> &'static str {
        match self {
            Camera::A => "cam1",
            Camera::B => "cam2",
        }
    }

    pub fn from_wire_id(id: &str) -> Option<Self> {
        match id {
            "cam1" => Some(Camera::A),
            "cam2" => Some(Camera::B),
            _ => None,
        }
    }

    pub fn db_id(self) -> i64 {
        match self {
            Camera::A => 1,
            Camera::B => 2,
        }
    }

    pub fn from_db_id(id: i64) -> Option<Self> {
        match id {
            1 => Some(Camera::A),
            2 => Some(Camera::B),
            _ => None,
        }
    }
}

impl fmt::Display for Camera {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_id())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub flight: u32,
    pub camera: Camera,
    /// 1-based, contiguous per (flight, camera).
    pub position: u32,
    /// Capture-device clock in milliseconds.
    pub timestamp: i64,
    image: Option<Vec<u8>>,
}

impl Frame {
    pub fn new(
        flight: u32,
        camera: Camera,
        position: u32,
        timestamp: i64,
        image: Option<Vec<u8>>,
    ) -> Self {
        Self {
            flight,
            camera,
            position,
            timestamp,
            image,
        }
    }

    pub fn image(&self) -> Option<&[u8]> {
        self.image.as_deref()
    }

    pub fn has_image(&self) -> bool {
        self.image.is_some()
    }

    pub fn take_image(&mut self) -> Option<Vec<u8>> {
        self.image.take()
    }

    /// Metadata-only copy.
    pub fn shell(&self) -> Frame {
        Frame {
            image: None,
            ..self.clone()
        }
    }
}

#[derive(Default)]
struct FrameIndex {
    frames: [BTreeMap<u32, Frame>; 2],
    last_position: [u32; 2],
}

/// Ordered, thread-safe frame store for one flight of one game.
pub struct FrameCollection {
    game: Game,
    flight: u32,
    repository: Arc<dyn FrameRepository>,
    index: Mutex<FrameIndex>,
}

impl FrameCollection {
    pub fn new(repository: Arc<dyn FrameRepository>, game: Game, flight: u32) -> Self {
        Self {
            game,
            flight,
            repository,
            index: Mutex::new(FrameIndex::default()),
        }
    }

    pub fn game(&self) -> Game {
        self.game
    }

    pub fn flight(&self) -> u32 {
        self.flight
    }

    pub fn repository(&self) -> &Arc<dyn FrameRepository> {
        &self.repository
    }

    fn lock(&self) -> MutexGuard<'_, FrameIndex> {
        self.index.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records a frame. Fails with `SequenceGap` unless the position directly
    /// follows the last one recorded for that camera.
    pub fn add_frame(&self, frame: Frame) -> SleipnirResult<()> {
        let mut index = self.lock();
        let slot = frame.camera.index();
        let expected = index.last_position[slot] + 1;
        if frame.position != expected {
            log::error!(
                "missing frame on {}: got position {}, expected {}",
                frame.camera,
                frame.position,
                expected
            );
            return Err(SleipnirError::SequenceGap {
                camera: frame.camera,
                position: frame.position,
                expected,
            });
        }
        index.last_position[slot] = frame.position;
        index.frames[slot].insert(frame.position, frame);
        Ok(())
    }

    /// Undoes the most recent `add_frame` for a camera, used when durable
    /// persistence of that frame failed.
    pub(crate) fn rollback(&self, camera: Camera, position: u32) {
        let mut index = self.lock();
        let slot = camera.index();
        if index.last_position[slot] == position {
            index.frames[slot].remove(&position);
            index.last_position[slot] = position.saturating_sub(1);
        }
    }

    /// Cached frame, or a shell rebuilt from storage on a cache miss.
    pub fn get_frame(&self, camera: Camera, position: u32) -> SleipnirResult<Frame> {
        let mut index = self.lock();
        self.get_frame_locked(&mut index, camera, position)
    }

    fn get_frame_locked(
        &self,
        index: &mut FrameIndex,
        camera: Camera,
        position: u32,
    ) -> SleipnirResult<Frame> {
        let slot = camera.index();
        if let Some(frame) = index.frames[slot].get(&position) {
            return Ok(frame.shell());
        }
        let timestamp = self
            .repository
            .load_timestamp(self.game, self.flight, camera, position)?
            .ok_or(SleipnirError::NotFound { camera, position })?;
        let frame = Frame::new(self.flight, camera, position, timestamp, None);
        index.frames[slot].insert(position, frame.clone());
        Ok(frame)
    }

    pub fn get_last_frame(&self, camera: Camera) -> SleipnirResult<Option<Frame>> {
        let mut index = self.lock();
        let last = index.last_position[camera.index()];
        if last == 0 {
            return Ok(None);
        }
        match self.get_frame_locked(&mut index, camera, last) {
            Ok(frame) => Ok(Some(frame)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Highest known position for the camera, 0 when empty.
    pub fn get_frame_count(&self, camera: Camera) -> u32 {
        self.lock().last_position[camera.index()]
    }

    /// Latest of the two first-frame timestamps; 0 for a camera without frames.
    pub fn get_start_timestamp(&self) -> SleipnirResult<i64> {
        let mut index = self.lock();
        let mut start = 0;
        for camera in Camera::ALL {
            match self.get_frame_locked(&mut index, camera, 1) {
                Ok(frame) => start = start.max(frame.timestamp),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(start)
    }

    /// Frame time relative to the start of the flight, never negative.
    pub fn time_of(&self, frame: &Frame) -> SleipnirResult<i64> {
        Ok((frame.timestamp - self.get_start_timestamp()?).max(0))
    }

    /// Hands out the frame image as grayscale pixels. An in-memory payload is
    /// consumed; otherwise the blob is reloaded from storage.
    pub fn take_image(&self, camera: Camera, position: u32) -> SleipnirResult<GrayImage> {
        let cached = {
            let mut index = self.lock();
            index.frames[camera.index()]
                .get_mut(&position)
                .and_then(Frame::take_image)
        };
        let bytes = match cached {
            Some(bytes) => bytes,
            None => {
                self.repository
                    .load(self.game, self.flight, camera, position)?
                    .ok_or(SleipnirError::NotFound { camera, position })?
                    .image
            }
        };
        decode_grayscale(&bytes)
    }

    /// Recovers per-camera last positions from storage for a previous flight.
    pub fn load(&self) -> SleipnirResult<()> {
        log::info!("lazy loading {} flight {}", self.game, self.flight);
        let mut counts = [0u32; 2];
        for camera in Camera::ALL {
            counts[camera.index()] = self
                .repository
                .load_frame_count(self.game, self.flight, camera)?
                .unwrap_or(0);
        }
        let mut index = self.lock();
        index.last_position = counts;
        Ok(())
    }

    /// Deletes the flight from storage and forgets every cached frame.
    pub fn purge(&self) -> SleipnirResult<()> {
        log::info!(
            "deleting {} frames for flight {}, hang on...",
            self.game,
            self.flight
        );
        self.repository.delete_flight(self.game, self.flight)?;
        *self.lock() = FrameIndex::default();
        Ok(())
    }
}

pub fn decode_grayscale(bytes: &[u8]) -> SleipnirResult<GrayImage> {
    Ok(image::load_from_memory(bytes)?.to_luma8())
}

pub fn encode_jpeg(image: &GrayImage) -> SleipnirResult<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(image.clone()).write_to(&mut out, ImageFormat::Jpeg)?;
    Ok(out.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryFrameRepository;

    fn collection() -> (Arc<InMemoryFrameRepository>, FrameCollection) {
        let repo = Arc::new(InMemoryFrameRepository::new());
        let frames = FrameCollection::new(repo.clone(), Game::SpeedTrap, 1);
        (repo, frames)
    }

    #[test]
    fn rejects_positions_out_of_sequence() {
        let (_repo, frames) = collection();
        frames.add_frame(Frame::new(1, Camera::A, 1, 100, None)).unwrap();

        let err = frames
            .add_frame(Frame::new(1, Camera::A, 3, 120, None))
            .unwrap_err();
        assert!(matches!(
            err,
            SleipnirError::SequenceGap {
                position: 3,
                expected: 2,
                ..
            }
        ));

        // Duplicate positions are gaps too.
        assert!(frames.add_frame(Frame::new(1, Camera::A, 1, 100, None)).is_err());
        // Each camera is sequenced on its own.
        assert!(frames.add_frame(Frame::new(1, Camera::B, 2, 100, None)).is_err());
        frames.add_frame(Frame::new(1, Camera::B, 1, 90, None)).unwrap();
        frames.add_frame(Frame::new(1, Camera::A, 2, 111, None)).unwrap();

        assert_eq!(frames.get_frame_count(Camera::A), 2);
        assert_eq!(frames.get_frame_count(Camera::B), 1);
    }

    #[test]
    fn get_frame_falls_back_to_storage() {
        let (repo, frames) = collection();
        repo.store(Game::SpeedTrap, &Frame::new(1, Camera::B, 7, 777, None), b"img")
            .unwrap();

        let frame = frames.get_frame(Camera::B, 7).unwrap();
        assert_eq!(frame.timestamp, 777);
        assert!(!frame.has_image());

        let err = frames.get_frame(Camera::B, 8).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn start_timestamp_is_latest_first_frame() {
        let (_repo, frames) = collection();
        assert_eq!(frames.get_start_timestamp().unwrap(), 0);

        frames.add_frame(Frame::new(1, Camera::A, 1, 1_000, None)).unwrap();
        assert_eq!(frames.get_start_timestamp().unwrap(), 1_000);

        frames.add_frame(Frame::new(1, Camera::B, 1, 1_040, None)).unwrap();
        assert_eq!(frames.get_start_timestamp().unwrap(), 1_040);

        let early = Frame::new(1, Camera::A, 1, 1_000, None);
        assert_eq!(frames.time_of(&early).unwrap(), 0);
    }

    #[test]
    fn last_frame_and_reload() {
        let (repo, frames) = collection();
        assert!(frames.get_last_frame(Camera::A).unwrap().is_none());

        for position in 1..=3 {
            let frame = Frame::new(1, Camera::A, position, 10 * position as i64, None);
            repo.store(Game::SpeedTrap, &frame, b"").unwrap();
        }

        let reopened = FrameCollection::new(repo, Game::SpeedTrap, 1);
        reopened.load().unwrap();
        let last = reopened.get_last_frame(Camera::A).unwrap().unwrap();
        assert_eq!(last.position, 3);
        assert_eq!(last.timestamp, 30);
        assert!(reopened
            .add_frame(Frame::new(1, Camera::A, 4, 40, None))
            .is_ok());
    }

    #[test]
    fn take_image_consumes_memory_then_reloads() {
        let (repo, frames) = collection();
        let pixels = GrayImage::from_pixel(32, 16, image::Luma([200u8]));
        let jpeg = encode_jpeg(&pixels).unwrap();

        let frame = Frame::new(1, Camera::A, 1, 5, Some(jpeg.clone()));
        repo.store(Game::SpeedTrap, &frame, &jpeg).unwrap();
        frames.add_frame(frame).unwrap();

        let first = frames.take_image(Camera::A, 1).unwrap();
        assert_eq!(first.dimensions(), (32, 16));
        assert!(!frames.get_frame(Camera::A, 1).unwrap().has_image());

        let second = frames.take_image(Camera::A, 1).unwrap();
        assert_eq!(second.dimensions(), (32, 16));

        assert!(frames.take_image(Camera::B, 1).unwrap_err().is_not_found());
    }

    #[test]
    fn rollback_reopens_the_position() {
        let (_repo, frames) = collection();
        frames.add_frame(Frame::new(1, Camera::A, 1, 5, None)).unwrap();
        frames.rollback(Camera::A, 1);
        assert_eq!(frames.get_frame_count(Camera::A), 0);
        frames.add_frame(Frame::new(1, Camera::A, 1, 5, None)).unwrap();
    }
}
