#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
use std::time::Duration;

use log::info;

use crate::control::{Event, Observer, RunControl};
use crate::instrument::{idle_or_warn, Actuator, Clock, Sensor};
use crate::util::duration_ms;
use crate::{Error, Result};

/// Frequency scan of a detector response at fixed source power. The scan covers `[start, stop)`
/// in increments of `step`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanParameters {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
    pub settle: Duration,
    /// Source power held during the scan.
    pub power: f64,
}

impl Default for ScanParameters {
    fn default() -> Self {
        ScanParameters {
            start: 8.0,
            stop: 14.0,
            step: 0.01,
            settle: Duration::from_millis(50),
            power: 0.0,
        }
    }
}

impl ScanParameters {
    #[must_use]
    pub fn new(start: f64, stop: f64, step: f64) -> Self {
        ScanParameters {
            start,
            stop,
            step,
            ..ScanParameters::default()
        }
    }

    pub fn settle_ms(&mut self, time_ms: f64) -> &mut Self {
        self.settle = duration_ms(time_ms);
        self
    }

    pub fn power(&mut self, power: f64) -> &mut Self {
        self.power = power;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if ![self.start, self.stop, self.step, self.power]
            .iter()
            .all(|x| x.is_finite())
        {
            return Err(Error::invalid("scan parameters must be finite"));
        }
        if self.start > self.stop {
            return Err(Error::invalid(format!(
                "scan start {} is above stop {}",
                self.start, self.stop
            )));
        }
        if self.step <= 0.0 || self.step > self.stop {
            return Err(Error::invalid(format!(
                "scan step {} must be positive and no larger than stop {}",
                self.step, self.stop
            )));
        }
        Ok(())
    }

    /// `start, start + step, ...` strictly below `stop`.
    pub fn frequencies(&self) -> Result<Vec<f64>> {
        self.validate()?;
        let count = ((self.stop - self.start) / self.step).ceil() as usize;
        Ok((0..count)
            .map(|i| self.start + self.step * i as f64)
            .collect())
    }

    /// Run the scan. The source output is switched on for the duration and idled afterwards, on
    /// success, error or cancellation alike. Returns every `(frequency, reading)` pair in order;
    /// each one is also reported as `Event::Sample`.
    pub fn run<F, P, S, C, O>(
        &self,
        frequency: &mut F,
        power: &mut P,
        sensor: &mut S,
        clock: &mut C,
        control: &RunControl,
        observer: &mut O,
    ) -> Result<Vec<(f64, f64)>>
    where
        F: Actuator + ?Sized,
        P: Actuator + ?Sized,
        S: Sensor + ?Sized,
        C: Clock + ?Sized,
        O: Observer + ?Sized,
    {
        let points = self.frequencies()?;
        info!(
            "scanning {} points from {} to {} at power {}",
            points.len(),
            self.start,
            self.stop,
            self.power
        );
        let mut trace = Vec::with_capacity(points.len());
        let res = (|| -> Result<()> {
            power.set_value(self.power)?;
            power.output_on()?;
            for &f in &points {
                control.checkpoint(clock)?;
                frequency.set_value(f)?;
                clock.sleep(self.settle);
                let value = sensor.measure()?;
                observer.notify(Event::Sample { point: f, value });
                trace.push((f, value));
            }
            Ok(())
        })();
        match res {
            Ok(()) => {
                power.idle()?;
                Ok(trace)
            }
            Err(e) => {
                idle_or_warn(power, "source power");
                Err(e)
            }
        }
    }
}
