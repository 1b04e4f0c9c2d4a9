//! sleipnird - Sleipnir base station daemon
//!
//! This daemon:
//! 1. Opens the flight database under the configured save path
//! 2. Serves the camera upload protocol
//! 3. Runs one discipline (Speed-Trap, Gate-Crasher or Align) on the event loop
//! 4. Starts the run as soon as the cameras are ready and persists results on Ctrl-C

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use sleipnir_base::event::{self, Event, EventLoop};
use sleipnir_base::game::Station;
use sleipnir_base::{
    AlignLogic, Camera, CameraServer, Clock, Database, Discipline, GateCrasher, SleipnirConfig,
    SpeedTrap, SystemClock,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum GameArg {
    SpeedTrap,
    GateCrasher,
    Align,
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Discipline to run.
    #[arg(long, value_enum, default_value = "speed-trap")]
    game: GameArg,
    /// Flight slot the run is recorded in (1..=20).
    #[arg(long, default_value_t = 1)]
    flight: u32,
    /// Distance between the two cameras in meters (overrides the config file).
    #[arg(long)]
    distance: Option<f64>,
    /// Gate-Crasher level name.
    #[arg(long, default_value = "Daytona")]
    level: String,
    /// Camera to align (cam1|cam2).
    #[arg(long, default_value = "cam1", value_parser = parse_camera)]
    align_camera: Camera,
}

fn parse_camera(raw: &str) -> Result<Camera, String> {
    Camera::from_wire_id(raw).ok_or_else(|| format!("unknown camera '{}', expected cam1 or cam2", raw))
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = SleipnirConfig::load()?;
    if let Some(distance) = args.distance {
        config.distance_m = distance;
        config.validate()?;
    }

    let db = Arc::new(Database::open(&config.save_path)?);
    let (events, mut event_loop) = event::channel();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let server = CameraServer::new(events.clone(), clock.clone());
    let server_handle = server.spawn(&config.listen_addr)?;

    let station = Station {
        server: server.clone(),
        db,
        events,
        clock,
        settings: config.tracker_settings(),
    };

    subscribe_reporter(&mut event_loop);

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_signal.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!(
        "sleipnird running. saving to {}, serving cameras on {}",
        config.save_path.display(),
        server_handle.addr
    );

    let result = match args.game {
        GameArg::SpeedTrap => {
            let mut speed_trap = SpeedTrap::new(station, args.flight)?;
            speed_trap.set_distance_m(config.distance_m);
            let ready_server = server.clone();
            run(speed_trap, &mut event_loop, &shutdown, move || {
                ready_server.is_ready_to_shoot()
            })
        }
        GameArg::GateCrasher => {
            let mut gate_crasher = GateCrasher::new(station, args.flight)?;
            gate_crasher.set_level_by_name(&args.level)?;
            let ready_server = server.clone();
            run(gate_crasher, &mut event_loop, &shutdown, move || {
                ready_server.is_ready_to_shoot()
            })
        }
        GameArg::Align => {
            let target = args.align_camera;
            let align = AlignLogic::new(station, target);
            let ready_server = server.clone();
            run(align, &mut event_loop, &shutdown, move || {
                ready_server.is_online(target) && !ready_server.is_accepting()
            })
        }
    };

    log::info!("shutdown signal received, stopping camera server...");
    server_handle.stop()?;
    result
}

/// Drives `discipline` on the event loop until Ctrl-C. A run starts whenever
/// a camera comes online, nothing is running and `ready` holds.
fn run<D, F>(discipline: D, event_loop: &mut EventLoop, shutdown: &AtomicBool, ready: F) -> Result<()>
where
    D: Discipline + 'static,
    F: Fn() -> bool + Send + 'static,
{
    let game = discipline.game();
    let discipline = Arc::new(Mutex::new(discipline));
    event_loop.subscribe(discipline.clone());

    let starter = discipline.clone();
    event_loop.subscribe_fn(move |event| {
        if let Event::CameraOnline(_) = event {
            let mut discipline = starter.lock().unwrap_or_else(|e| e.into_inner());
            if !discipline.is_running() && ready() {
                discipline.start_run()?;
            }
        }
        Ok(())
    });

    log::info!("{} waiting for cameras (Ctrl-C to stop)...", game);
    event_loop.run_until(shutdown);

    let stopped = discipline
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .stop_run();
    event_loop.dispatch_pending();
    stopped.map_err(Into::into)
}

fn subscribe_reporter(event_loop: &mut EventLoop) {
    event_loop.subscribe_fn(|event| {
        match event {
            Event::CameraOnline(camera) => log::info!("{} online", camera),
            Event::CameraOffline(camera) => log::info!("{} offline", camera),
            Event::GameStarted(game) => log::info!("{} started", game),
            Event::GameStopped(game) => log::info!("{} stopped", game),
            Event::PassStarted(camera) => log::info!("pass started at {}", camera),
            Event::PassAborted => log::info!("pass aborted"),
            Event::AnnouncementNew(announcement) => log::info!(
                "{} pass: {:.1} km/h in {} ms",
                announcement.direction,
                announcement.speed_kmh,
                announcement.duration_ms
            ),
            Event::GateHit(hit) => log::info!(
                "{} gate {} hit at {} #{}: {} ms",
                hit.level_name,
                hit.gate_number,
                hit.camera,
                hit.position,
                hit.time_ms
            ),
            Event::CourseFinished { total_ms } => log::info!("course finished in {} ms", total_ms),
            Event::CourseRestarted => log::info!("course restarted"),
            Event::AlignFrame(frame) => {
                log::debug!("align frame {} #{}", frame.camera, frame.position)
            }
            _ => {}
        }
        Ok(())
    });
}
