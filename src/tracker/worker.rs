use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender};
use std::thread::JoinHandle;

use super::{MotionTracker, TrackerJob, TrackerResult};
use crate::error::{SleipnirError, SleipnirResult};
use crate::frame::Camera;

enum Command {
    Track(TrackerJob),
    Reset,
}

/// Runs one camera's [`MotionTracker`] on a dedicated thread.
///
/// At most one job is in flight: callers `wait()` for the previous result
/// before they `submit()` the next frame.
pub struct TrackerWorker {
    camera: Camera,
    commands: Option<Sender<Command>>,
    results: Receiver<Option<TrackerResult>>,
    in_flight: bool,
    join: Option<JoinHandle<()>>,
}

impl TrackerWorker {
    pub fn spawn(camera: Camera) -> Result<Self> {
        let (command_tx, command_rx) = crossbeam_channel::unbounded::<Command>();
        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        let join = std::thread::Builder::new()
            .name(format!("motion-track-{}", camera))
            .spawn(move || {
                let mut tracker = MotionTracker::new(camera);
                for command in command_rx {
                    match command {
                        Command::Track(job) => {
                            if result_tx.send(tracker.track(job)).is_err() {
                                break;
                            }
                        }
                        Command::Reset => tracker.reset(),
                    }
                }
            })
            .with_context(|| format!("failed to spawn motion tracker for {}", camera))?;

        Ok(Self {
            camera,
            commands: Some(command_tx),
            results: result_rx,
            in_flight: false,
            join: Some(join),
        })
    }

    pub fn camera(&self) -> Camera {
        self.camera
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight
    }

    /// Blocks until the in-flight job finishes and returns its result. Returns
    /// `None` when nothing was in flight or the job was a repeated position.
    pub fn wait(&mut self) -> Option<TrackerResult> {
        if !self.in_flight {
            return None;
        }
        self.in_flight = false;
        match self.results.recv() {
            Ok(result) => result,
            Err(_) => {
                log::error!("motion tracker for {} is gone", self.camera);
                None
            }
        }
    }

    pub fn submit(&mut self, job: TrackerJob) -> SleipnirResult<()> {
        if self.in_flight {
            return Err(SleipnirError::illegal_state(format!(
                "motion tracker for {} is still busy",
                self.camera
            )));
        }
        self.send(Command::Track(job))?;
        self.in_flight = true;
        Ok(())
    }

    /// Lets the running job finish, then clears the tracker state.
    pub fn reset(&mut self) -> SleipnirResult<()> {
        let _ = self.wait();
        self.send(Command::Reset)
    }

    fn send(&self, command: Command) -> SleipnirResult<()> {
        let sent = self
            .commands
            .as_ref()
            .map(|tx| tx.send(command).is_ok())
            .unwrap_or(false);
        if !sent {
            return Err(SleipnirError::illegal_state(format!(
                "motion tracker for {} has stopped",
                self.camera
            )));
        }
        Ok(())
    }

    /// Closes the job queue and joins the thread. Later sends fail.
    pub(crate) fn shut_down(&mut self) {
        self.commands.take();
        self.in_flight = false;
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("motion tracker thread for {} panicked", self.camera);
            }
        }
    }
}

impl Drop for TrackerWorker {
    fn drop(&mut self) {
        self.shut_down();
    }
}
