//! What decides a spoofed location's next position

use std::{ops::Range, time::Duration};

use rand::Rng;

use crate::geo::Coordinate;

/// Pause between auto updates outside of [`MoveState::Manual`]
pub const AUTO_UPDATE_INTERVAL: Duration = Duration::from_millis(250);

/// Seconds between GPS jitter updates while standing still
const JITTER_INTERVAL: Range<f64> = 5.0..15.0;
/// Meters a jitter update strays from the real location
const JITTER_DISTANCE: Range<f64> = 5.0..10.0;

/// An ordered list of waypoints and how far along it the location is
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NavigationRoute {
    waypoints: Vec<Coordinate>,
    index: usize,
}

impl NavigationRoute {
    pub fn new(waypoints: Vec<Coordinate>) -> Self {
        Self {
            waypoints,
            index: 0,
        }
    }

    pub fn waypoints(&self) -> &[Coordinate] {
        &self.waypoints
    }

    pub fn is_at_start(&self) -> bool {
        self.index == 0
    }

    /// The waypoint being headed for, `None` once the route is done
    pub fn current(&self) -> Option<Coordinate> {
        self.waypoints.get(self.index).copied()
    }

    pub fn is_finished(&self) -> bool {
        self.index >= self.waypoints.len()
    }

    fn advance(&mut self) {
        if !self.is_finished() {
            self.index += 1;
        }
    }
}

/// How a location moves
#[derive(Debug, Clone, PartialEq, Default)]
pub enum MoveState {
    /// Moves only when stepped. Auto updates add GPS jitter around the last
    /// location that was set or stepped to.
    #[default]
    Manual,
    /// Keeps moving along the heading
    Auto,
    /// Follows a route from its first waypoint to its last
    Navigation(NavigationRoute),
}

impl MoveState {
    /// Whether auto updates need a location to start from
    ///
    /// A route starts by jumping to its first waypoint, so it doesn't.
    pub fn requires_initial_location(&self) -> bool {
        !matches!(self, Self::Navigation(_))
    }

    /// The minimum pause before the next auto update
    pub fn update_interval(&self, previous: Option<Duration>) -> Duration {
        match self {
            Self::Manual => Duration::from_secs_f64(rand::rng().random_range(JITTER_INTERVAL)),
            _ => previous.unwrap_or(AUTO_UPDATE_INTERVAL),
        }
    }

    /// Where to go from `previous` after moving `distance` meters
    ///
    /// A route advances as waypoints are reached. Returns `None` when there is
    /// nowhere to go: no location to move from, or the route is done.
    pub fn next_location(
        &mut self,
        distance: f64,
        heading: f64,
        previous: Option<Coordinate>,
        auto_update: bool,
    ) -> Option<Coordinate> {
        match self {
            Self::Navigation(route) => Self::next_on_route(route, distance, previous),
            Self::Manual if auto_update => {
                let mut rng = rand::rng();
                let distance = rng.random_range(JITTER_DISTANCE);
                let heading = rng.random_range(0.0..360.0);
                previous.map(|from| from.offset(distance, heading))
            }
            _ => previous.map(|from| from.offset(distance, heading)),
        }
    }

    fn next_on_route(
        route: &mut NavigationRoute,
        distance: f64,
        previous: Option<Coordinate>,
    ) -> Option<Coordinate> {
        if route.is_at_start() {
            let start = route.current()?;
            if previous != Some(start) {
                return Some(start);
            }
            route.advance();
        }

        let waypoint = route.current()?;
        let Some(from) = previous else {
            return Some(waypoint);
        };
        if from.distance_to(&waypoint) <= distance {
            route.advance();
            return Some(waypoint);
        }
        Some(from.offset(distance, from.heading_to(&waypoint)))
    }
}
