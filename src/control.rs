use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_std::channel::Sender;

use crate::instrument::Clock;
use crate::{Error, Result};

const PAUSE_POLL: Duration = Duration::from_millis(200);

/// Progress notification from a running loop. Each carries at most two numbers so it maps onto a
/// two-column table row or a telemetry frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event {
    /// A ramp or sweep setpoint, reported before it is applied.
    Setpoint(f64),
    /// One measured data point.
    Sample { point: f64, value: f64 },
    Converged { point: f64, power: f64 },
    /// The power estimate was undefined and `power` was substituted.
    DomainFallback { point: f64, power: f64 },
    /// The iteration cap was reached before the response came within threshold.
    NotConverged { point: f64, power: f64 },
    /// A complete field sweep at the given source frequency.
    SweepDone { point: f64 },
}

impl Event {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Setpoint(_) => "SETPOINT",
            Event::Sample { .. } => "SAMPLE",
            Event::Converged { .. } => "CONVERGED",
            Event::DomainFallback { .. } => "DOMAIN_FALLBACK",
            Event::NotConverged { .. } => "NOT_CONVERGED",
            Event::SweepDone { .. } => "SWEEP_DONE",
        }
    }

    /// `(point, value)` for telemetry. Single-valued events repeat their value as the point.
    #[must_use]
    pub fn pair(&self) -> (f64, f64) {
        match *self {
            Event::Setpoint(x) => (x, x),
            Event::Sample { point, value } => (point, value),
            Event::Converged { point, power }
            | Event::DomainFallback { point, power }
            | Event::NotConverged { point, power } => (point, power),
            Event::SweepDone { point } => (point, point),
        }
    }
}

/// Receives events on the run thread. Implementations must return quickly, since any time spent
/// here delays the next instrument access.
pub trait Observer {
    fn notify(&mut self, event: Event);
}

impl<F: FnMut(Event)> Observer for F {
    fn notify(&mut self, event: Event) {
        self(event);
    }
}

impl Observer for Vec<Event> {
    fn notify(&mut self, event: Event) {
        self.push(event);
    }
}

impl Observer for () {
    fn notify(&mut self, _event: Event) {}
}

/// Hand events to another task without blocking. If the receiving side has gone away the events
/// are dropped; the run itself carries on.
impl Observer for Sender<Event> {
    fn notify(&mut self, event: Event) {
        let _ = self.try_send(event);
    }
}

/// Cooperative pause/cancel flags shared between a run and whoever supervises it. Runs only look
/// at these between steps.
#[derive(Debug, Default)]
pub struct RunControl {
    paused: AtomicBool,
    cancelled: AtomicBool,
}

impl RunControl {
    #[must_use]
    pub fn new() -> Self {
        RunControl::default()
    }

    #[inline]
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[inline]
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Block while paused, then report whether the run may continue. The actuators keep their
    /// last commanded value for as long as this blocks.
    /// # Errors
    /// `Error::Cancelled` once `cancel` has been called.
    pub fn checkpoint<C: Clock + ?Sized>(&self, clock: &mut C) -> Result<()> {
        while self.is_paused() && !self.is_cancelled() {
            clock.sleep(PAUSE_POLL);
        }
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::VirtualClock;

    #[test]
    fn checkpoint_passes_when_idle() {
        let control = RunControl::new();
        let mut clock = VirtualClock::default();
        assert!(control.checkpoint(&mut clock).is_ok());
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[test]
    fn cancel_overrides_pause() {
        let control = RunControl::new();
        control.pause();
        control.cancel();
        let mut clock = VirtualClock::default();
        assert!(matches!(control.checkpoint(&mut clock), Err(Error::Cancelled)));
    }

    #[test]
    fn channel_observer_does_not_block() {
        let (mut tx, rx) = async_std::channel::bounded(1);
        tx.notify(Event::Setpoint(1.0));
        // queue is full; this one is dropped instead of blocking
        tx.notify(Event::Setpoint(2.0));
        assert_eq!(rx.try_recv().ok(), Some(Event::Setpoint(1.0)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn pairs() {
        assert_eq!(Event::Setpoint(3.0).pair(), (3.0, 3.0));
        assert_eq!(
            Event::Converged {
                point: 12.5,
                power: 4.0
            }
            .pair(),
            (12.5, 4.0)
        );
        assert_eq!(Event::SweepDone { point: 9.0 }.kind(), "SWEEP_DONE");
    }
}
