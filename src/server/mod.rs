//! Camera ingestion server.
//!
//! Two camera agents talk to the base over plain HTTP `POST /` requests. An
//! idle agent polls with `startcamera` and starts streaming `uploadframe`
//! requests once it is told `OK-START`. Every accepted frame is written to
//! durable storage, recorded in the current [`FrameCollection`] and announced
//! as [`Event::NewFrame`].

mod http;

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::clock::Clock;
use crate::error::{SleipnirError, SleipnirResult};
use crate::event::{Event, EventSender};
use crate::frame::{Camera, Frame, FrameCollection};

use http::{read_request, write_json_response, write_text_response, HttpRequest};

/// No contact for this long marks a camera offline.
pub const OFFLINE_AFTER: Duration = Duration::from_secs(5);
/// Contact within this window counts as actively shooting.
pub const SHOOTING_WITHIN: Duration = Duration::from_secs(1);
pub const SWEEP_INTERVAL: Duration = Duration::from_millis(2500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraAction {
    StartCamera,
    UploadFrame,
}

impl CameraAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "startcamera" => Some(CameraAction::StartCamera),
            "uploadframe" => Some(CameraAction::UploadFrame),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CameraRequest {
    pub action: CameraAction,
    pub camera: Camera,
    pub position: u32,
    pub timestamp: i64,
    pub image: Vec<u8>,
}

impl CameraRequest {
    pub fn start_camera(camera: Camera) -> Self {
        Self {
            action: CameraAction::StartCamera,
            camera,
            position: 0,
            timestamp: 0,
            image: Vec::new(),
        }
    }

    pub fn upload_frame(camera: Camera, position: u32, timestamp: i64, image: Vec<u8>) -> Self {
        Self {
            action: CameraAction::UploadFrame,
            camera,
            position,
            timestamp,
            image,
        }
    }
}

/// Reply tokens the camera agents understand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraResponse {
    Start,
    Stop,
    Continue,
}

impl CameraResponse {
    pub fn token(self) -> &'static str {
        match self {
            CameraResponse::Start => "OK-START",
            CameraResponse::Stop => "OK-STOP",
            CameraResponse::Continue => "OK-CONTINUE",
        }
    }
}

#[derive(Default)]
struct Status {
    accepting: bool,
    frames: Option<Arc<FrameCollection>>,
    /// Set while a flight is purged ahead of capture.
    starting: bool,
    last_seen: [Option<Instant>; 2],
    online: [bool; 2],
}

struct Inner {
    events: EventSender,
    clock: Arc<dyn Clock>,
    status: Mutex<Status>,
}

/// Shared handle to the ingestion state. Clones refer to the same server.
#[derive(Clone)]
pub struct CameraServer {
    inner: Arc<Inner>,
}

#[derive(Serialize)]
struct HealthReport {
    status: &'static str,
    accepting: bool,
    shooting: bool,
    cam1_online: bool,
    cam2_online: bool,
}

impl CameraServer {
    pub fn new(events: EventSender, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                events,
                clock,
                status: Mutex::new(Status::default()),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Status> {
        self.inner.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Applies one agent request. A frame that fails to persist is rolled
    /// back and reported as an error.
    pub fn handle_request(&self, request: CameraRequest) -> SleipnirResult<CameraResponse> {
        let now = self.inner.clock.now();
        let frames = {
            let mut status = self.lock();
            status.last_seen[request.camera.index()] = Some(now);
            match (status.accepting, status.frames.clone()) {
                (true, Some(frames)) => frames,
                _ => return Ok(CameraResponse::Stop),
            }
        };

        if request.action == CameraAction::StartCamera {
            return Ok(CameraResponse::Start);
        }

        let frame = Frame::new(
            frames.flight(),
            request.camera,
            request.position,
            request.timestamp,
            None,
        );
        match frames.add_frame(frame.clone()) {
            Ok(()) => {}
            // Already logged; the agent keeps streaming and the next position decides.
            Err(SleipnirError::SequenceGap { .. }) => return Ok(CameraResponse::Continue),
            Err(err) => return Err(err),
        }
        if let Err(err) = frames
            .repository()
            .store(frames.game(), &frame, &request.image)
        {
            log::error!(
                "failed to store {} frame {}: {}",
                frame.camera,
                frame.position,
                err
            );
            frames.rollback(frame.camera, frame.position);
            return Err(err);
        }

        self.inner.events.emit(Event::NewFrame(frame));
        Ok(CameraResponse::Continue)
    }

    /// Liveness sweep: flips cameras online/offline and emits the transitions.
    pub fn check_online(&self) {
        let now = self.inner.clock.now();
        let mut transitions = Vec::new();
        {
            let mut status = self.lock();
            for camera in Camera::ALL {
                let slot = camera.index();
                let alive = status.last_seen[slot]
                    .map(|seen| now.saturating_duration_since(seen) < OFFLINE_AFTER)
                    .unwrap_or(false);
                if status.online[slot] != alive {
                    status.online[slot] = alive;
                    transitions.push((camera, alive));
                }
            }
        }
        for (camera, alive) in transitions {
            if alive {
                log::info!("camera {} is coming online", camera);
                self.inner.events.emit(Event::CameraOnline(camera));
            } else {
                log::info!("camera {} is going offline", camera);
                self.inner.events.emit(Event::CameraOffline(camera));
            }
        }
    }

    pub fn is_online(&self, camera: Camera) -> bool {
        self.lock().online[camera.index()]
    }

    /// Both cameras online and no capture active.
    pub fn is_ready_to_shoot(&self) -> bool {
        let status = self.lock();
        status.online.iter().all(|online| *online) && !status.accepting
    }

    pub fn is_accepting(&self) -> bool {
        self.lock().accepting
    }

    /// Capture active and at least one camera heard from within the last second.
    pub fn is_shooting(&self) -> bool {
        let now = self.inner.clock.now();
        let status = self.lock();
        status.accepting
            && status.last_seen.iter().flatten().any(|seen| {
                now.saturating_duration_since(*seen) < SHOOTING_WITHIN
            })
    }

    /// Starts accepting frames into `frames` after purging what storage holds
    /// for that flight.
    pub fn start_shooting(&self, frames: Arc<FrameCollection>) -> SleipnirResult<()> {
        {
            let mut status = self.lock();
            if status.accepting || status.starting {
                return Err(SleipnirError::illegal_state("capture is already active"));
            }
            if !status.online.iter().any(|online| *online) {
                log::error!("unable to start shooting because no camera is online");
                return Err(SleipnirError::illegal_state("no camera is online"));
            }
            status.starting = true;
        }

        let purged = frames.purge();

        let mut status = self.lock();
        status.starting = false;
        purged?;
        status.frames = Some(frames);
        status.accepting = true;
        Ok(())
    }

    pub fn stop_shooting(&self) {
        log::info!("request to stop shooting");
        self.lock().accepting = false;
    }

    fn health(&self) -> HealthReport {
        HealthReport {
            status: "ok",
            accepting: self.is_accepting(),
            shooting: self.is_shooting(),
            cam1_online: self.is_online(Camera::A),
            cam2_online: self.is_online(Camera::B),
        }
    }

    /// Binds `addr` and serves camera agents on a background thread. The same
    /// thread runs the liveness sweep.
    pub fn spawn(&self, addr: &str) -> Result<ServerHandle> {
        let configured_addr: SocketAddr = addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!("camera server listening on {}", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let server = self.clone();
        let join = std::thread::Builder::new()
            .name("camera-server".into())
            .spawn(move || {
                if let Err(err) = run_server(listener, server, shutdown_thread) {
                    log::error!("camera server stopped: {}", err);
                }
            })?;

        Ok(ServerHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

#[derive(Debug)]
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("camera server thread panicked"))?;
        }
        Ok(())
    }
}

fn run_server(listener: TcpListener, server: CameraServer, shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut last_sweep = Instant::now();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        if last_sweep.elapsed() >= SWEEP_INTERVAL {
            server.check_online();
            last_sweep = Instant::now();
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let server = server.clone();
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &server) {
                        log::warn!("camera request rejected: {}", err);
                    }
                });
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(5));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, server: &CameraServer) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => {
            let payload = serde_json::to_vec(&server.health())?;
            write_json_response(&mut stream, 200, &payload)?;
            return Ok(());
        }
        ("POST", "/") => {}
        (_, "/") => {
            write_text_response(&mut stream, 405, "method not allowed")?;
            return Ok(());
        }
        _ => {
            write_text_response(&mut stream, 404, "not found")?;
            return Ok(());
        }
    }

    let camera_request = match parse_camera_request(&request) {
        Ok(Some(camera_request)) => camera_request,
        // Unknown camera ids get an empty reply, as before.
        Ok(None) => {
            write_text_response(&mut stream, 200, "")?;
            return Ok(());
        }
        Err(err) => {
            write_text_response(&mut stream, 400, &err.to_string())?;
            return Err(err);
        }
    };

    match server.handle_request(camera_request) {
        Ok(response) => write_text_response(&mut stream, 200, response.token()),
        Err(err) => {
            write_text_response(&mut stream, 500, "storage failure")?;
            Err(err.into())
        }
    }
}

fn parse_camera_request(request: &HttpRequest) -> Result<Option<CameraRequest>> {
    let params = request.params();
    let param = |names: &[&str]| names.iter().find_map(|name| params.get(*name).cloned());

    let action = param(&["action"]).ok_or_else(|| anyhow!("missing action"))?;
    let action = CameraAction::parse(&action).ok_or_else(|| anyhow!("unknown action '{}'", action))?;
    let camera_id = param(&["cam", "id"]).unwrap_or_default();
    let Some(camera) = Camera::from_wire_id(&camera_id) else {
        log::info!("{:?} from unknown camera id '{}'", action, camera_id);
        return Ok(None);
    };

    match action {
        CameraAction::StartCamera => Ok(Some(CameraRequest::start_camera(camera))),
        CameraAction::UploadFrame => {
            let position = param(&["position", "framenumber"])
                .ok_or_else(|| anyhow!("missing position"))?
                .parse::<u32>()?;
            let timestamp = param(&["timestamp"])
                .ok_or_else(|| anyhow!("missing timestamp"))?
                .parse::<i64>()?;
            Ok(Some(CameraRequest::upload_frame(
                camera,
                position,
                timestamp,
                request.payload().to_vec(),
            )))
        }
    }
}
