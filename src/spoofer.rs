//! Moving a device's simulated location, by hand or on a timer

use std::{ops::Range, time::Duration};

use rand::Rng;
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{Instant, sleep},
};
use tracing::{debug, warn};

use crate::{
    LocsimError,
    facade::{Device, ResetOutcome},
    geo::{Coordinate, MoveType},
    move_state::MoveState,
};

/// Drives one device's location and keeps track of where it was sent
///
/// The tracked location only changes once the device accepted the change.
#[derive(Debug)]
pub struct LocationSpoofer {
    device: Device,
    /// How far a [`step`](Self::step) moves, and the speed of auto updates
    pub move_type: MoveType,
    pub move_state: MoveState,
    /// Direction of movement, degrees clockwise from north
    pub heading: f64,
    /// Factor range applied to the speed on each auto update, e.g. `0.8..1.2`
    ///
    /// An empty range leaves the speed as is.
    pub speed_variance: Option<Range<f64>>,
    current_location: Option<Coordinate>,
    /// Last location that wasn't GPS jitter
    real_location: Option<Coordinate>,
    total_distance: f64,
}

impl LocationSpoofer {
    pub fn new(device: Device) -> Self {
        Self {
            device,
            move_type: MoveType::default(),
            move_state: MoveState::default(),
            heading: 0.0,
            speed_variance: None,
            current_location: None,
            real_location: None,
            total_distance: 0.0,
        }
    }

    pub fn device(&mut self) -> &mut Device {
        &mut self.device
    }

    pub fn into_device(self) -> Device {
        self.device
    }

    /// The last location the device accepted
    pub fn current_location(&self) -> Option<Coordinate> {
        self.current_location
    }

    /// Meters moved since the location was last reset
    pub fn total_distance(&self) -> f64 {
        self.total_distance
    }

    pub async fn set_location(&mut self, coordinate: Coordinate) -> Result<(), LocsimError> {
        self.send(coordinate, false).await
    }

    async fn send(&mut self, coordinate: Coordinate, jitter: bool) -> Result<(), LocsimError> {
        self.device.locate(coordinate).await?;
        if let Some(previous) = self.current_location {
            self.total_distance += previous.distance_to(&coordinate);
        }
        self.current_location = Some(coordinate);
        if !jitter {
            self.real_location = Some(coordinate);
        }
        Ok(())
    }

    /// Moves one second's worth of distance
    ///
    /// The direction is `heading`, or the route in [`MoveState::Navigation`].
    /// Returns the new location, or `None` if there is nowhere to move.
    pub async fn step(&mut self) -> Result<Option<Coordinate>, LocsimError> {
        let next = self.move_state.next_location(
            self.move_type.speed(),
            self.heading,
            self.current_location,
            false,
        );
        let Some(next) = next else {
            debug!("Nowhere to step to from {:?}", self.current_location);
            return Ok(None);
        };
        self.set_location(next).await?;
        Ok(Some(next))
    }

    /// Moves as far as the current speed goes in `elapsed`
    ///
    /// In [`MoveState::Manual`] this jitters around the last real location
    /// instead. Returns `None` once there is nowhere left to go.
    pub async fn update(&mut self, elapsed: Duration) -> Result<Option<Coordinate>, LocsimError> {
        let mut speed = self.move_type.speed();
        if let Some(variance) = self.speed_variance.clone().filter(|r| !r.is_empty()) {
            speed = (speed * rand::rng().random_range(variance)).max(0.0);
        }
        let distance = speed * elapsed.as_secs_f64();

        let jitter = self.move_state == MoveState::Manual;
        let from = if jitter {
            self.real_location
        } else {
            self.current_location
        };
        let Some(next) = self
            .move_state
            .next_location(distance, self.heading, from, true)
        else {
            return Ok(None);
        };
        self.send(next, jitter).await?;
        Ok(Some(next))
    }

    /// Hands the spoofer to a task that calls [`update`](Self::update) until
    /// stopped, the route ends or the device refuses a location
    pub fn auto_update(self) -> AutoUpdate {
        let (stop, stopped) = oneshot::channel();
        AutoUpdate {
            stop,
            task: tokio::spawn(self.run_auto_update(stopped)),
        }
    }

    async fn run_auto_update(
        mut self,
        mut stopped: oneshot::Receiver<()>,
    ) -> (Self, AutoUpdateEnd) {
        if self.move_state.requires_initial_location() && self.current_location.is_none() {
            debug!("No location to auto update from");
            return (self, AutoUpdateEnd::NoLocation);
        }

        let mut interval = self.move_state.update_interval(None);
        let mut last_update: Option<Instant> = None;
        loop {
            tokio::select! {
                // A dropped handle stops the loop too
                _ = &mut stopped => return (self, AutoUpdateEnd::Stopped),
                _ = sleep(interval) => {}
            }

            // A slow device still moves the location at the set speed
            let elapsed = last_update.map_or(interval, |at| at.elapsed());
            let started = Instant::now();
            let next_interval = self.move_state.update_interval(Some(interval));
            match self.update(elapsed).await {
                Ok(Some(location)) => debug!("Auto update moved to {location}"),
                Ok(None) => return (self, AutoUpdateEnd::Finished),
                Err(e) => {
                    warn!("Auto update stopped: {e}");
                    return (self, AutoUpdateEnd::Failed(e));
                }
            }
            last_update = Some(started);
            interval = next_interval;
        }
    }

    /// Returns the device to its real location
    ///
    /// The tracked location and distance are cleared only when the device
    /// actually reset; after a [`ResetOutcome::NoOp`] it still shows the old location.
    pub async fn reset_location(&mut self) -> Result<ResetOutcome, LocsimError> {
        let outcome = self.device.reset().await?;
        if outcome == ResetOutcome::Reset {
            self.current_location = None;
            self.real_location = None;
            self.total_distance = 0.0;
        }
        Ok(outcome)
    }
}

/// Why an auto update loop ended
#[derive(Debug)]
pub enum AutoUpdateEnd {
    Stopped,
    /// The route is done, or there was no location left to move from
    Finished,
    /// The move state needs a location to start from and there was none
    NoLocation,
    /// The device refused a location
    Failed(LocsimError),
}

/// A running auto update loop
///
/// Dropping the handle stops the loop and drops the spoofer with it.
#[derive(Debug)]
pub struct AutoUpdate {
    stop: oneshot::Sender<()>,
    task: JoinHandle<(LocationSpoofer, AutoUpdateEnd)>,
}

impl AutoUpdate {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stops the loop after the update in flight, and returns the spoofer
    pub async fn stop(self) -> Result<(LocationSpoofer, AutoUpdateEnd), LocsimError> {
        let _ = self.stop.send(());
        Self::join(self.task).await
    }

    /// Waits for the loop to end on its own
    pub async fn finished(self) -> Result<(LocationSpoofer, AutoUpdateEnd), LocsimError> {
        let Self { stop, task } = self;
        let ended = Self::join(task).await;
        drop(stop);
        ended
    }

    async fn join(
        task: JoinHandle<(LocationSpoofer, AutoUpdateEnd)>,
    ) -> Result<(LocationSpoofer, AutoUpdateEnd), LocsimError> {
        task.await
            .map_err(|e| LocsimError::AutoUpdateFailed(e.to_string()))
    }
}
