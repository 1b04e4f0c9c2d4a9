use thiserror::Error;

use crate::frame::Camera;

/// Failures raised by the frame store, storage layer and timing disciplines.
///
/// `SequenceGap` and `NotFound` are recoverable: the former means the camera
/// agent is expected to retry with the next position, the latter means the
/// frame is "not yet available" rather than corrupt.
#[derive(Debug, Error)]
pub enum SleipnirError {
    #[error("sequence gap on {camera}: got position {position}, expected {expected}")]
    SequenceGap {
        camera: Camera,
        position: u32,
        expected: u32,
    },

    #[error("frame {position} on {camera} not found")]
    NotFound { camera: Camera, position: u32 },

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("image decode failure: {0}")]
    Image(#[from] image::ImageError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl SleipnirError {
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        SleipnirError::IllegalState(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SleipnirError::NotFound { .. })
    }
}

pub type SleipnirResult<T> = std::result::Result<T, SleipnirError>;
