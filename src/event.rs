//! Single-consumer event bus.
//!
//! Producers (upload handlers, disciplines) hold a cloneable [`EventSender`];
//! emission never blocks. One [`EventLoop`] drains the queue on a fixed tick
//! and hands each event to every subscribed handler in registration order, so
//! events from one producer are observed in the order they were emitted.

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use image::GrayImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::announcement::{GateAnnouncement, SpeedAnnouncement};
use crate::frame::{Camera, Frame};
use crate::game::SpeedPass;
use crate::{Direction, Game};

pub const TICK: Duration = Duration::from_millis(5);

#[derive(Clone, Debug)]
pub enum Event {
    CameraOnline(Camera),
    CameraOffline(Camera),
    /// A frame was accepted by the ingestion server.
    NewFrame(Frame),
    /// Tracker output for a frame, one frame behind the upload stream.
    FrameAnalyzed {
        frame: Frame,
        image: Arc<GrayImage>,
        direction: Option<Direction>,
    },
    GameStarted(Game),
    GameStopped(Game),
    PassStarted(Camera),
    PassEnded(SpeedPass),
    PassAborted,
    AnnouncementNew(SpeedAnnouncement),
    SpeedAnnouncementsLoaded(Vec<SpeedAnnouncement>),
    GateHit(GateAnnouncement),
    CourseFinished { total_ms: i64 },
    CourseRestarted,
    GateAnnouncementsLoaded(Vec<GateAnnouncement>),
    AlignStarted(Camera),
    AlignStopped(Camera),
    AlignFrame(Frame),
}

/// Receives events on the event loop thread.
pub trait EventHandler: Send {
    fn handle(&mut self, event: &Event) -> anyhow::Result<()>;
}

impl<T: EventHandler> EventHandler for Arc<Mutex<T>> {
    fn handle(&mut self, event: &Event) -> anyhow::Result<()> {
        let mut inner = self.lock().unwrap_or_else(|e| e.into_inner());
        inner.handle(event)
    }
}

struct FnHandler<F>(F);

impl<F> EventHandler for FnHandler<F>
where
    F: FnMut(&Event) -> anyhow::Result<()> + Send,
{
    fn handle(&mut self, event: &Event) -> anyhow::Result<()> {
        (self.0)(event)
    }
}

#[derive(Clone, Debug)]
pub struct EventSender {
    tx: Sender<Event>,
}

impl EventSender {
    pub fn emit(&self, event: Event) {
        // The loop may already be gone during shutdown; nothing is listening then.
        if self.tx.send(event).is_err() {
            log::debug!("event dropped, event loop has shut down");
        }
    }
}

pub struct EventLoop {
    rx: Receiver<Event>,
    tx: Sender<Event>,
    handlers: Vec<Box<dyn EventHandler>>,
}

pub fn channel() -> (EventSender, EventLoop) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (
        EventSender { tx: tx.clone() },
        EventLoop {
            rx,
            tx,
            handlers: Vec::new(),
        },
    )
}

impl EventLoop {
    pub fn sender(&self) -> EventSender {
        EventSender {
            tx: self.tx.clone(),
        }
    }

    pub fn subscribe<H: EventHandler + 'static>(&mut self, handler: H) {
        self.handlers.push(Box::new(handler));
    }

    pub fn subscribe_fn<F>(&mut self, f: F)
    where
        F: FnMut(&Event) -> anyhow::Result<()> + Send + 'static,
    {
        self.subscribe(FnHandler(f));
    }

    /// Dispatches everything queued right now, including events emitted by
    /// handlers along the way. Returns the number of events delivered.
    pub fn dispatch_pending(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    self.dispatch(&event);
                    delivered += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        delivered
    }

    fn dispatch(&mut self, event: &Event) {
        for handler in self.handlers.iter_mut() {
            if let Err(err) = handler.handle(event) {
                log::error!("event handler failed on {:?}: {:#}", EventName(event), err);
            }
        }
    }

    /// Drains the queue every tick until `shutdown` is set, then delivers
    /// whatever is still queued.
    pub fn run_until(&mut self, shutdown: &AtomicBool) {
        while !shutdown.load(Ordering::SeqCst) {
            if self.dispatch_pending() == 0 {
                std::thread::sleep(TICK);
            }
        }
        self.dispatch_pending();
    }
}

/// Debug view that leaves out image payloads.
struct EventName<'a>(&'a Event);

impl std::fmt::Debug for EventName<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Event::FrameAnalyzed { frame, direction, .. } => {
                write!(f, "FrameAnalyzed({} #{}, {:?})", frame.camera, frame.position, direction)
            }
            Event::NewFrame(frame) => write!(f, "NewFrame({} #{})", frame.camera, frame.position),
            other => write!(f, "{:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handlers_see_events_in_emission_order() {
        let (tx, mut events) = channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        events.subscribe_fn(move |event| {
            if let Event::CameraOnline(camera) = event {
                sink.lock().unwrap().push(*camera);
            }
            Ok(())
        });

        tx.emit(Event::CameraOnline(Camera::B));
        tx.emit(Event::CameraOnline(Camera::A));
        tx.emit(Event::PassAborted);

        assert_eq!(events.dispatch_pending(), 3);
        assert_eq!(*seen.lock().unwrap(), vec![Camera::B, Camera::A]);
    }

    #[test]
    fn failing_handler_does_not_starve_the_next_one() {
        let (tx, mut events) = channel();
        let count = Arc::new(Mutex::new(0));
        events.subscribe_fn(|_| anyhow::bail!("boom"));
        let counter = count.clone();
        events.subscribe_fn(move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        tx.emit(Event::CourseRestarted);
        events.dispatch_pending();
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn events_emitted_by_handlers_are_delivered_in_the_same_drain() {
        let (_tx, mut events) = channel();
        let inner = events.sender();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        events.subscribe_fn(move |event| {
            match event {
                Event::GameStarted(game) => {
                    sink.lock().unwrap().push(game.name());
                    inner.emit(Event::GameStopped(*game));
                }
                Event::GameStopped(_) => sink.lock().unwrap().push("stopped"),
                _ => {}
            }
            Ok(())
        });

        events.sender().emit(Event::GameStarted(Game::SpeedTrap));
        assert_eq!(events.dispatch_pending(), 2);
        assert_eq!(*seen.lock().unwrap(), vec!["speed_trap", "stopped"]);
    }

    #[test]
    fn run_until_drains_after_shutdown() {
        let (tx, mut events) = channel();
        let shutdown = AtomicBool::new(true);
        let seen = Arc::new(Mutex::new(0));
        let counter = seen.clone();
        events.subscribe_fn(move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });
        tx.emit(Event::PassAborted);
        events.run_until(&shutdown);
        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
