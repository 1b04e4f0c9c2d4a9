//! sleipnir_replay - replays a recorded flight as two camera agents
//!
//! Reads the frames of a stored flight and uploads them to a running base
//! station with the camera upload protocol, paced at the camera frame rate.
//! Each camera waits for `OK-START`, then streams until the server answers
//! `OK-STOP` or the recording runs out.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use sleipnir_base::storage::FrameRepository;
use sleipnir_base::{validate_flight, Camera, Database, Game};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum GameArg {
    SpeedTrap,
    GateCrasher,
    Align,
}

impl From<GameArg> for Game {
    fn from(arg: GameArg) -> Self {
        match arg {
            GameArg::SpeedTrap => Game::SpeedTrap,
            GameArg::GateCrasher => Game::GateCrasher,
            GameArg::Align => Game::Align,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Recorded flight to replay.
    flight: u32,
    /// Recorded frames to skip at the start of the flight.
    #[arg(default_value_t = 0)]
    jump: u32,
    /// Directory holding sleipnir.db.
    #[arg(long, env = "SLEIPNIR_SAVE_PATH", default_value = ".")]
    save_path: PathBuf,
    /// Table the recording is read from.
    #[arg(long, value_enum, default_value = "speed-trap")]
    game: GameArg,
    /// Base station upload URL.
    #[arg(long, default_value = "http://127.0.0.1:8000/")]
    url: String,
    /// Upload rate per camera.
    #[arg(long, default_value_t = 90)]
    fps: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AgentState {
    Idle,
    Uploading { next: u32 },
    Exhausted,
}

struct CameraAgent {
    camera: Camera,
    state: AgentState,
    /// Recorded (position, timestamp) pairs left after the jump.
    recording: Vec<(u32, i64)>,
}

impl CameraAgent {
    fn new(db: &Database, game: Game, flight: u32, camera: Camera, jump: u32) -> Result<Self> {
        let recording: Vec<(u32, i64)> = db
            .load_flight_timestamps(game, flight, camera)?
            .into_iter()
            .filter(|(position, _)| *position > jump)
            .collect();
        log::info!("{} has {} recorded frames to replay", camera, recording.len());
        Ok(Self {
            camera,
            state: AgentState::Idle,
            recording,
        })
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    validate_flight(args.flight)?;
    if args.fps == 0 {
        return Err(anyhow!("fps must be greater than zero"));
    }
    let game = Game::from(args.game);
    let db = Database::open(&args.save_path)?;
    let agent = ureq::AgentBuilder::new()
        .timeout(Duration::from_secs(1))
        .build();

    let mut cameras = [
        CameraAgent::new(&db, game, args.flight, Camera::A, args.jump)?,
        CameraAgent::new(&db, game, args.flight, Camera::B, args.jump)?,
    ];

    log::info!(
        "replaying {} flight {} (skipping {}) to {} at {} fps",
        game,
        args.flight,
        args.jump,
        args.url,
        args.fps
    );

    let mut start = Instant::now();
    let mut count: u64 = 0;
    loop {
        if count as f64 > start.elapsed().as_secs_f64() * args.fps as f64 {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }
        count += 1;

        for cam in cameras.iter_mut() {
            if cam.state == AgentState::Idle {
                let reply = post(&agent, &args.url, &format!("action=startcamera&cam={}", cam.camera), &[])?;
                if reply == "OK-START" {
                    log::info!("{} start requested by the base station", cam.camera);
                    start = Instant::now();
                    count = 0;
                    cam.state = AgentState::Uploading { next: 1 };
                }
            }

            if let AgentState::Uploading { next } = cam.state {
                let Some(&(recorded, timestamp)) = cam.recording.get(next as usize - 1) else {
                    log::info!("{} recording ends after {} frames", cam.camera, next - 1);
                    cam.state = AgentState::Exhausted;
                    continue;
                };
                let Some(stored) = db.load(game, args.flight, cam.camera, recorded)? else {
                    return Err(anyhow!("{} frame {} vanished from the recording", cam.camera, recorded));
                };
                let query = format!(
                    "action=uploadframe&cam={}&position={}&timestamp={}",
                    cam.camera, next, timestamp
                );
                let reply = post(&agent, &args.url, &query, &stored.image)?;
                cam.state = if reply == "OK-STOP" {
                    log::info!("{} stopped by the base station", cam.camera);
                    AgentState::Idle
                } else {
                    AgentState::Uploading { next: next + 1 }
                };
            }
        }

        if cameras.iter().all(|cam| cam.state == AgentState::Exhausted) {
            log::info!("replay finished");
            return Ok(());
        }
    }
}

fn post(agent: &ureq::Agent, url: &str, query: &str, body: &[u8]) -> Result<String> {
    let target = format!("{}?{}", url, query);
    let response = agent
        .post(&target)
        .send_bytes(body)
        .with_context(|| format!("base station rejected {}", query))?;
    response.into_string().context("read base station reply")
}
