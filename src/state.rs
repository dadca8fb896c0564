//! # Run-state coordinator.
//!
//! [`RunState`] is the single shared lifecycle flag set every other component
//! reads. The three transition flags are mutually exclusive: a transition is
//! entered through [`RunState::begin`], which either hands back an RAII
//! [`TransitionGuard`] or refuses because another transition is in flight.
//! The crash flag is orthogonal: a crashed server may well be restarting.
//!
//! The lock is a plain std mutex. It is only ever held for a few loads and
//! stores and is never held across an await point.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::ServerError;

/// A lifecycle transition in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Starting,
    Stopping,
    Restarting,
}

/// Externally visible server status.
///
/// The crashed variants mirror the base ones at a fixed offset so numeric
/// consumers can recover the base state with a subtraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Offline,
    Starting,
    Online,
    Stopping,
    Restarting,
    CrashedOffline,
    CrashedStarting,
    CrashedOnline,
    CrashedStopping,
    CrashedRestarting,
}

/// Numeric distance between a base status and its crashed twin.
pub const CRASH_OFFSET: i32 = 5;

impl Status {
    pub fn as_i32(self) -> i32 {
        match self {
            Status::Offline => 0,
            Status::Starting => 1,
            Status::Online => 2,
            Status::Stopping => 3,
            Status::Restarting => 4,
            Status::CrashedOffline => CRASH_OFFSET,
            Status::CrashedStarting => CRASH_OFFSET + 1,
            Status::CrashedOnline => CRASH_OFFSET + 2,
            Status::CrashedStopping => CRASH_OFFSET + 3,
            Status::CrashedRestarting => CRASH_OFFSET + 4,
        }
    }

    fn crashed(self) -> Status {
        match self {
            Status::Offline => Status::CrashedOffline,
            Status::Starting => Status::CrashedStarting,
            Status::Online => Status::CrashedOnline,
            Status::Stopping => Status::CrashedStopping,
            Status::Restarting => Status::CrashedRestarting,
            other => other,
        }
    }

    pub fn is_crashed(self) -> bool {
        self.as_i32() >= CRASH_OFFSET
    }
}

#[derive(Debug, Default)]
struct Flags {
    starting: bool,
    stopping: bool,
    restarting: bool,
    crashed: bool,
    last_start: Option<Instant>,
}

/// Shared lifecycle state. Constructed once and shared by reference.
#[derive(Debug, Default)]
pub struct RunState {
    inner: Mutex<Flags>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters a transition, or refuses with [`ServerError::Busy`] when any
    /// transition is already in flight. The returned guard clears the flag on
    /// drop, including on early error returns.
    pub fn begin(&self, transition: Transition) -> Result<TransitionGuard<'_>, ServerError> {
        let mut flags = self.inner.lock().unwrap();
        if flags.starting || flags.stopping || flags.restarting {
            return Err(ServerError::Busy);
        }
        match transition {
            Transition::Starting => flags.starting = true,
            Transition::Stopping => flags.stopping = true,
            Transition::Restarting => flags.restarting = true,
        }
        Ok(TransitionGuard {
            state: self,
            transition,
        })
    }

    /// True while any of start, stop, or restart is running.
    pub fn transition_in_flight(&self) -> bool {
        let flags = self.inner.lock().unwrap();
        flags.starting || flags.stopping || flags.restarting
    }

    pub fn is_crashed(&self) -> bool {
        self.inner.lock().unwrap().crashed
    }

    /// Marks the server crashed.
    pub fn crashed(&self) {
        self.inner.lock().unwrap().crashed = true;
    }

    /// Clears the crash flag after a successful probe or start.
    pub fn recovered(&self) {
        self.inner.lock().unwrap().crashed = false;
    }

    /// Records the moment of the most recent successful start.
    pub fn mark_started(&self) {
        self.inner.lock().unwrap().last_start = Some(Instant::now());
    }

    /// True when the most recent successful start lies within `window`.
    pub fn started_within(&self, window: Duration) -> bool {
        self.inner
            .lock()
            .unwrap()
            .last_start
            .is_some_and(|at| at.elapsed() < window)
    }

    /// Derives the externally visible status. `up` reports whether the child
    /// process is currently running.
    pub fn status(&self, up: bool) -> Status {
        let flags = self.inner.lock().unwrap();
        let base = if flags.restarting {
            Status::Restarting
        } else if flags.stopping {
            Status::Stopping
        } else if flags.starting {
            Status::Starting
        } else if up {
            Status::Online
        } else {
            Status::Offline
        };
        if flags.crashed {
            base.crashed()
        } else {
            base
        }
    }
}

/// Releases the transition flag when dropped.
#[derive(Debug)]
pub struct TransitionGuard<'a> {
    state: &'a RunState,
    transition: Transition,
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        let mut flags = self.state.inner.lock().unwrap();
        match self.transition {
            Transition::Starting => flags.starting = false,
            Transition::Stopping => flags.stopping = false,
            Transition::Restarting => flags.restarting = false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_are_exclusive() {
        let state = RunState::new();
        let guard = state.begin(Transition::Starting).unwrap();
        assert!(matches!(
            state.begin(Transition::Stopping),
            Err(ServerError::Busy)
        ));
        assert!(matches!(
            state.begin(Transition::Restarting),
            Err(ServerError::Busy)
        ));
        drop(guard);
        state.begin(Transition::Stopping).unwrap();
    }

    #[test]
    fn guard_releases_on_drop() {
        let state = RunState::new();
        {
            let _guard = state.begin(Transition::Restarting).unwrap();
            assert!(state.transition_in_flight());
        }
        assert!(!state.transition_in_flight());
    }

    #[test]
    fn crash_flag_is_orthogonal() {
        let state = RunState::new();
        state.crashed();
        let _guard = state.begin(Transition::Restarting).unwrap();
        assert!(state.is_crashed());
        assert_eq!(state.status(false), Status::CrashedRestarting);
        state.recovered();
        assert_eq!(state.status(false), Status::Restarting);
    }

    #[test]
    fn status_derivation() {
        let state = RunState::new();
        assert_eq!(state.status(false), Status::Offline);
        assert_eq!(state.status(true), Status::Online);

        state.crashed();
        assert_eq!(state.status(true), Status::CrashedOnline);
        assert_eq!(
            state.status(true).as_i32(),
            Status::Online.as_i32() + CRASH_OFFSET
        );
        assert!(state.status(true).is_crashed());
    }

    #[test]
    fn start_debounce_window() {
        let state = RunState::new();
        assert!(!state.started_within(Duration::from_secs(10)));
        state.mark_started();
        assert!(state.started_within(Duration::from_secs(10)));
        assert!(!state.started_within(Duration::ZERO));
    }
}
