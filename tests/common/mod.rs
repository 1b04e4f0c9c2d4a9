#![allow(dead_code)]

use image::{GrayImage, Luma};
use std::sync::{Arc, Mutex};

use sleipnir_base::event::{self, Event, EventLoop};
use sleipnir_base::frame::encode_jpeg;
use sleipnir_base::game::Station;
use sleipnir_base::server::CameraRequest;
use sleipnir_base::{Camera, CameraServer, Database, ManualClock, TrackerSettings};

pub struct Rig {
    pub clock: Arc<ManualClock>,
    pub server: CameraServer,
    pub db: Arc<Database>,
    pub events: EventLoop,
    pub seen: Arc<Mutex<Vec<Event>>>,
    pub station: Station,
}

/// In-memory station whose event loop records every event it dispatches.
pub fn rig() -> Rig {
    let clock = Arc::new(ManualClock::new());
    let db = Arc::new(Database::open_in_memory().expect("in-memory db"));
    let (tx, mut events) = event::channel();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    events.subscribe_fn(move |e| {
        sink.lock().unwrap().push(e.clone());
        Ok(())
    });
    let server = CameraServer::new(tx.clone(), clock.clone());
    let station = Station {
        server: server.clone(),
        db: db.clone(),
        events: tx,
        clock: clock.clone(),
        settings: TrackerSettings::default(),
    };
    Rig {
        clock,
        server,
        db,
        events,
        seen,
        station,
    }
}

impl Rig {
    pub fn bring_cameras_online(&mut self) {
        for camera in Camera::ALL {
            self.server
                .handle_request(CameraRequest::start_camera(camera))
                .expect("start camera");
        }
        self.server.check_online();
        self.drain();
    }

    pub fn drain(&mut self) -> Vec<Event> {
        self.events.dispatch_pending();
        std::mem::take(&mut *self.seen.lock().unwrap())
    }

    /// Uploads one frame and lets every handler see it.
    pub fn upload(&mut self, camera: Camera, position: u32, timestamp: i64, image: &GrayImage) {
        let jpeg = encode_jpeg(image).expect("encode frame");
        self.server
            .handle_request(CameraRequest::upload_frame(camera, position, timestamp, jpeg))
            .expect("upload frame");
        self.events.dispatch_pending();
    }

    /// Flies the aircraft rightwards across `camera`, one frame every 11 ms.
    pub fn fly_right(&mut self, camera: Camera, first_timestamp: i64) {
        for i in 0..40u32 {
            let image = sky_with_plane(i as i32 * 8, 60);
            self.upload(camera, i + 1, first_timestamp + i as i64 * 11, &image);
        }
    }

    pub fn take_seen(&self) -> Vec<Event> {
        std::mem::take(&mut *self.seen.lock().unwrap())
    }
}

/// Light sky with a dark 24x12 aircraft at `x`.
pub fn sky_with_plane(x: i32, y: i32) -> GrayImage {
    let mut image = GrayImage::from_pixel(320, 240, Luma([200]));
    for yy in y.max(0)..(y + 12).min(240) {
        for xx in x.max(0)..(x + 24).min(320) {
            image.put_pixel(xx as u32, yy as u32, Luma([20]));
        }
    }
    image
}
