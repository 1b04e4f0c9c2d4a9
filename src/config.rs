use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::SleipnirError;
use crate::game::DEFAULT_DISTANCE_M;
use crate::storage::DB_FILE_NAME;
use crate::tracker::TrackerSettings;

const DEFAULT_SAVE_PATH: &str = ".";
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_MAX_DIVE_ANGLE: f32 = 10.0;
const DEFAULT_BLUR_STRENGTH: f32 = 4.0;
const DEFAULT_GROUND_LEVEL: i32 = 400;

#[derive(Debug, Deserialize, Default)]
struct SleipnirConfigFile {
    save_path: Option<PathBuf>,
    listen_addr: Option<String>,
    tracker: Option<TrackerConfigFile>,
    speed_trap: Option<SpeedTrapConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackerConfigFile {
    max_dive_angle: Option<f32>,
    blur_strength: Option<f32>,
    ground_level: Option<i32>,
}

#[derive(Debug, Deserialize, Default)]
struct SpeedTrapConfigFile {
    distance_m: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct SleipnirConfig {
    pub save_path: PathBuf,
    pub listen_addr: String,
    pub max_dive_angle: f32,
    pub blur_strength: f32,
    pub ground_level: i32,
    pub distance_m: f64,
}

impl Default for SleipnirConfig {
    fn default() -> Self {
        Self {
            save_path: PathBuf::from(DEFAULT_SAVE_PATH),
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            max_dive_angle: DEFAULT_MAX_DIVE_ANGLE,
            blur_strength: DEFAULT_BLUR_STRENGTH,
            ground_level: DEFAULT_GROUND_LEVEL,
            distance_m: DEFAULT_DISTANCE_M,
        }
    }
}

impl SleipnirConfig {
    /// File named by `SLEIPNIR_CONFIG` (optional), then `SLEIPNIR_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SLEIPNIR_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SleipnirConfigFile) -> Self {
        let defaults = Self::default();
        let tracker = file.tracker.unwrap_or_default();
        Self {
            save_path: file.save_path.unwrap_or(defaults.save_path),
            listen_addr: file.listen_addr.unwrap_or(defaults.listen_addr),
            max_dive_angle: tracker.max_dive_angle.unwrap_or(defaults.max_dive_angle),
            blur_strength: tracker.blur_strength.unwrap_or(defaults.blur_strength),
            ground_level: tracker.ground_level.unwrap_or(defaults.ground_level),
            distance_m: file
                .speed_trap
                .and_then(|speed_trap| speed_trap.distance_m)
                .unwrap_or(defaults.distance_m),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("SLEIPNIR_SAVE_PATH") {
            if !path.trim().is_empty() {
                self.save_path = PathBuf::from(path);
            }
        }
        if let Ok(addr) = std::env::var("SLEIPNIR_LISTEN_ADDR") {
            if !addr.trim().is_empty() {
                self.listen_addr = addr;
            }
        }
        if let Some(angle) = env_number("SLEIPNIR_MAX_DIVE_ANGLE")? {
            self.max_dive_angle = angle;
        }
        if let Some(blur) = env_number("SLEIPNIR_BLUR_STRENGTH")? {
            self.blur_strength = blur;
        }
        if let Some(ground) = env_number("SLEIPNIR_GROUND_LEVEL")? {
            self.ground_level = ground;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), SleipnirError> {
        if !self.save_path.is_dir() {
            return Err(SleipnirError::Config(format!(
                "save path {} is not a directory",
                self.save_path.display()
            )));
        }
        if !(1.0..=90.0).contains(&self.max_dive_angle) {
            return Err(SleipnirError::Config(format!(
                "max dive angle must be within 1..=90, got {}",
                self.max_dive_angle
            )));
        }
        if !(1.0..=5.0).contains(&self.blur_strength) {
            return Err(SleipnirError::Config(format!(
                "blur strength must be within 1..=5, got {}",
                self.blur_strength
            )));
        }
        if self.distance_m.is_nan() || self.distance_m <= 0.0 {
            return Err(SleipnirError::Config(format!(
                "speed trap distance must be positive, got {}",
                self.distance_m
            )));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.save_path.join(DB_FILE_NAME)
    }

    pub fn tracker_settings(&self) -> TrackerSettings {
        TrackerSettings {
            ground_level: self.ground_level,
            max_dive_angle: self.max_dive_angle,
            blur_strength: self.blur_strength,
        }
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a number, got '{}'", key, raw)),
        _ => Ok(None),
    }
}

fn read_config_file(path: &Path) -> Result<SleipnirConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
