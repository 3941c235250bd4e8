#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
use std::str::Split;
use std::time::Duration;

use log::{debug, info};

use crate::control::{Event, Observer, RunControl};
use crate::instrument::{Actuator, Clock, Sensor};
use crate::util::duration_ms;
use crate::{Error, Result};

/// Largest accepted sub-step count per nominal step.
pub const MAX_OVERSAMPLE: u32 = 1000;

/// Largest number of setpoints a single ramp may generate. Longer ramps are refused before
/// anything is written.
pub const MAX_SETPOINTS: usize = 10_000_000;

/// Rate limit for moving an actuator between two values. `max_rate_per_step` is the largest
/// change allowed per nominal step; each nominal step is further split into `oversample`
/// sub-steps, each followed by `settle`.
#[derive(Debug, Clone, PartialEq)]
pub struct RampSetup {
    max_rate_per_step: f64,
    oversample: u32,
    pub settle: Duration,
}

impl Default for RampSetup {
    fn default() -> Self {
        RampSetup {
            max_rate_per_step: 100.0,
            oversample: 10,
            settle: Duration::from_millis(100),
        }
    }
}

impl RampSetup {
    #[must_use]
    pub fn new() -> Self {
        RampSetup::default()
    }

    pub fn max_rate_per_step(&mut self, rate: f64) -> &mut Self {
        self.max_rate_per_step = rate;
        self
    }

    pub fn oversample(&mut self, factor: u32) -> &mut Self {
        self.oversample = factor;
        self
    }

    pub fn settle_ms(&mut self, time_ms: f64) -> &mut Self {
        self.settle = duration_ms(time_ms);
        self
    }

    #[inline]
    #[must_use]
    pub fn rate(&self) -> f64 {
        self.max_rate_per_step
    }

    #[inline]
    #[must_use]
    pub fn oversample_factor(&self) -> u32 {
        self.oversample
    }

    /// Largest difference between two consecutive generated setpoints.
    #[inline]
    #[must_use]
    pub fn max_substep(&self) -> f64 {
        self.max_rate_per_step / f64::from(self.oversample)
    }

    /// # Errors
    /// `InvalidConfiguration` for a non-positive (or NaN) rate or an oversampling factor outside
    /// `1..=MAX_OVERSAMPLE`.
    pub fn validate(&self) -> Result<()> {
        if !(self.max_rate_per_step > 0.0) || !self.max_rate_per_step.is_finite() {
            return Err(Error::invalid(format!(
                "maximum ramp rate must be positive, got {}",
                self.max_rate_per_step
            )));
        }
        if self.oversample == 0 || self.oversample > MAX_OVERSAMPLE {
            return Err(Error::invalid(format!(
                "ramp oversampling factor must be within 1..={MAX_OVERSAMPLE}, got {}",
                self.oversample
            )));
        }
        Ok(())
    }

    /// Evenly spaced values from `current` to `target`, both inclusive. The count is
    /// `oversample * ceil(|target - current| / rate) + 1`, so `current == target` yields the single
    /// value `target`.
    /// # Errors
    /// `InvalidConfiguration` if the setup is invalid, either endpoint is not finite, or the ramp
    /// would need more than `MAX_SETPOINTS` values.
    pub fn setpoints(&self, current: f64, target: f64) -> Result<Vec<f64>> {
        self.validate()?;
        if !current.is_finite() || !target.is_finite() {
            return Err(Error::invalid(format!(
                "cannot ramp from {current} to {target}"
            )));
        }
        let steps = ((current - target).abs() / self.max_rate_per_step).ceil();
        let count = steps * f64::from(self.oversample);
        if count.is_nan() || count >= MAX_SETPOINTS as f64 {
            return Err(Error::invalid(format!(
                "ramp from {current} to {target} at {} per step needs more than {MAX_SETPOINTS} \
                 setpoints",
                self.max_rate_per_step
            )));
        }
        let intervals = count as usize;
        if intervals == 0 {
            return Ok(vec![target]);
        }
        let span = target - current;
        let mut out = Vec::with_capacity(intervals + 1);
        out.extend((0..intervals).map(|i| current + span * (i as f64) / (intervals as f64)));
        // the last point is exactly the target, not an accumulated approximation
        out.push(target);
        Ok(out)
    }

    /// Walk `actuator` from `current` to `target`. Every setpoint is reported to `observer` before
    /// it is applied and followed by the settle delay. Returns the last value applied.
    ///
    /// The run may be paused or cancelled between any two setpoints; on cancellation the
    /// actuator stays at whatever was last applied.
    ///
    /// When `current == target` the single setpoint is reported but nothing is written.
    /// # Errors
    /// `InvalidConfiguration` before anything is written, `Cancelled`, or the actuator's
    /// `DeviceError`.
    pub fn drive<A, C, O>(
        &self,
        current: f64,
        target: f64,
        actuator: &mut A,
        clock: &mut C,
        control: &RunControl,
        observer: &mut O,
    ) -> Result<f64>
    where
        A: Actuator + ?Sized,
        C: Clock + ?Sized,
        O: Observer + ?Sized,
    {
        let setpoints = self.setpoints(current, target)?;
        if setpoints.len() == 1 {
            observer.notify(Event::Setpoint(target));
            return Ok(target);
        }
        info!(
            "ramping {current} -> {target} in {} setpoints",
            setpoints.len()
        );
        let mut applied = current;
        for value in setpoints {
            control.checkpoint(clock)?;
            observer.notify(Event::Setpoint(value));
            actuator.set_value(value)?;
            applied = value;
            debug!("ramp setpoint {value}");
            clock.sleep(self.settle);
        }
        Ok(applied)
    }

    /// Like `drive`, starting from whatever `probe` reads right now.
    pub fn move_to<A, S, C, O>(
        &self,
        target: f64,
        actuator: &mut A,
        probe: &mut S,
        clock: &mut C,
        control: &RunControl,
        observer: &mut O,
    ) -> Result<f64>
    where
        A: Actuator + ?Sized,
        S: Sensor + ?Sized,
        C: Clock + ?Sized,
        O: Observer + ?Sized,
    {
        self.validate()?;
        let current = probe.measure()?;
        self.drive(current, target, actuator, clock, control, observer)
    }

    /// Remote get/set of the ramp parameters, e.g. `RATE:SET:50` or `OVERSAMPLE:GET`.
    /// # Errors
    /// `Err(())` if the command is not recognised or the value does not parse.
    #[allow(clippy::result_unit_err)]
    pub fn process_command(&mut self, cmd: Split<'_, char>) -> std::result::Result<String, ()> {
        let resp = match cmd.collect::<Vec<&str>>()[..] {
            ["RATE", "SET", x] => {
                self.max_rate_per_step(x.parse::<f64>().map_err(|_| ())?);
                String::new()
            }
            ["RATE", "GET"] => self.max_rate_per_step.to_string(),
            ["OVERSAMPLE", "SET", x] => {
                self.oversample(x.parse::<u32>().map_err(|_| ())?);
                String::new()
            }
            ["OVERSAMPLE", "GET"] => self.oversample.to_string(),
            ["SETTLE_TIME", "SET", x] => {
                self.settle_ms(x.parse::<f64>().map_err(|_| ())?);
                String::new()
            }
            ["SETTLE_TIME", "GET"] => (self.settle.as_secs_f64() * 1000.0).to_string(),
            _ => Err(())?,
        };
        Ok(resp)
    }
}
