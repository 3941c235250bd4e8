//! Magnetic field sweeps: step the magnet through a range, reading back the field and a detector
//! at every step. The magnet is only ever moved through `RampSetup`, never jumped.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]

use std::fmt;
use std::str::{FromStr, Split};
use std::time::Duration;

use log::{debug, info, warn};

use crate::control::{Event, Observer, RunControl};
use crate::instrument::{idle_or_warn, Actuator, Clock, Sensor};
use crate::ramp::RampSetup;
use crate::util::duration_ms;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Up,
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}

impl FromStr for Direction {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            other => Err(format!("unknown sweep direction '{other}'")),
        }
    }
}

/// Configuration of one sweep. Copied when a run starts; later edits apply to the next run.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepParameters {
    pub start: f64,
    pub stop: f64,
    pub step: f64,
    /// Wait after each sweep setpoint before reading.
    pub settle: Duration,
    /// Wait after arriving at the first setpoint.
    pub start_settle: Duration,
    pub direction: Direction,
    pub ramp: RampSetup,
}

impl Default for SweepParameters {
    fn default() -> Self {
        SweepParameters {
            start: 0.0,
            stop: 500.0,
            step: 1.0,
            settle: Duration::from_millis(200),
            start_settle: Duration::from_secs(3),
            direction: Direction::Up,
            ramp: RampSetup::default(),
        }
    }
}

impl SweepParameters {
    #[must_use]
    pub fn new(start: f64, stop: f64, step: f64) -> Self {
        SweepParameters {
            start,
            stop,
            step,
            ..SweepParameters::default()
        }
    }

    pub fn settle_ms(&mut self, time_ms: f64) -> &mut Self {
        self.settle = duration_ms(time_ms);
        self
    }

    pub fn start_settle_ms(&mut self, time_ms: f64) -> &mut Self {
        self.start_settle = duration_ms(time_ms);
        self
    }

    pub fn direction(&mut self, direction: Direction) -> &mut Self {
        self.direction = direction;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if ![self.start, self.stop, self.step].iter().all(|x| x.is_finite()) {
            return Err(Error::invalid("sweep range must be finite"));
        }
        if self.start >= self.stop {
            return Err(Error::invalid(format!(
                "sweep start {} must be below stop {}",
                self.start, self.stop
            )));
        }
        if self.step <= 0.0 {
            return Err(Error::invalid(format!(
                "sweep step must be positive, got {}",
                self.step
            )));
        }
        self.ramp.validate()
    }

    /// `Up`: `start, start + step, ...` below `stop`. `Down`: `stop, stop - step, ...` above
    /// `start`.
    pub fn setpoints(&self) -> Result<Vec<f64>> {
        self.validate()?;
        let count = ((self.stop - self.start) / self.step).ceil() as usize;
        let (origin, step) = match self.direction {
            Direction::Up => (self.start, self.step),
            Direction::Down => (self.stop, -self.step),
        };
        Ok((0..count).map(|i| origin + step * i as f64).collect())
    }

    /// Remote get/set, e.g. `START:SET:100` or `DIRECTION:GET`.
    #[allow(clippy::result_unit_err)]
    pub fn process_command(&mut self, cmd: Split<'_, char>) -> std::result::Result<String, ()> {
        let resp = match cmd.collect::<Vec<&str>>()[..] {
            ["START", "SET", x] => {
                self.start = x.parse::<f64>().map_err(|_| ())?;
                String::new()
            }
            ["START", "GET"] => self.start.to_string(),
            ["STOP", "SET", x] => {
                self.stop = x.parse::<f64>().map_err(|_| ())?;
                String::new()
            }
            ["STOP", "GET"] => self.stop.to_string(),
            ["STEP", "SET", x] => {
                self.step = x.parse::<f64>().map_err(|_| ())?;
                String::new()
            }
            ["STEP", "GET"] => self.step.to_string(),
            ["SETTLE_TIME", "SET", x] => {
                self.settle_ms(x.parse::<f64>().map_err(|_| ())?);
                String::new()
            }
            ["SETTLE_TIME", "GET"] => (self.settle.as_secs_f64() * 1000.0).to_string(),
            ["DIRECTION", "SET", x] => {
                self.direction = x.parse::<Direction>().map_err(|_| ())?;
                String::new()
            }
            ["DIRECTION", "GET"] => self.direction.to_string(),
            _ => Err(())?,
        };
        Ok(resp)
    }
}

/// One sweep trace: `(measured field, detector reading)` per setpoint.
pub type Trace = Vec<(f64, f64)>;

/// Drives the magnet and reads the field probe and detector for the duration of a run.
pub struct FieldSweep<'a, M: ?Sized, P: ?Sized, D: ?Sized, C: ?Sized> {
    params: &'a SweepParameters,
    magnet: &'a mut M,
    probe: &'a mut P,
    detector: &'a mut D,
    clock: &'a mut C,
}

impl<'a, M, P, D, C> FieldSweep<'a, M, P, D, C>
where
    M: Actuator + ?Sized,
    P: Sensor + ?Sized,
    D: Sensor + ?Sized,
    C: Clock + ?Sized,
{
    pub fn new(
        params: &'a SweepParameters,
        magnet: &'a mut M,
        probe: &'a mut P,
        detector: &'a mut D,
        clock: &'a mut C,
    ) -> Self {
        FieldSweep {
            params,
            magnet,
            probe,
            detector,
            clock,
        }
    }

    fn ramp_to<O: Observer + ?Sized>(
        &mut self,
        target: f64,
        control: &RunControl,
        observer: &mut O,
    ) -> Result<f64> {
        self.params.ramp.move_to(
            target,
            self.magnet,
            self.probe,
            self.clock,
            control,
            observer,
        )
    }

    fn sweep_once<O: Observer + ?Sized>(
        &mut self,
        setpoints: &[f64],
        control: &RunControl,
        observer: &mut O,
    ) -> Result<Trace> {
        let Some(&first) = setpoints.first() else {
            return Ok(Vec::new());
        };
        self.ramp_to(first, control, observer)?;
        self.clock.sleep(self.params.start_settle);

        let mut trace = Vec::with_capacity(setpoints.len());
        for &setpoint in setpoints {
            control.checkpoint(self.clock)?;
            observer.notify(Event::Setpoint(setpoint));
            self.magnet.set_value(setpoint)?;
            self.clock.sleep(self.params.settle);
            let field = self.probe.measure()?;
            let value = self.detector.measure()?;
            debug!("field {field}: {value}");
            observer.notify(Event::Sample {
                point: field,
                value,
            });
            trace.push((field, value));
        }
        Ok(trace)
    }

    /// Ramp to the first setpoint, sweep, and ramp the field back to zero.
    ///
    /// On error or cancellation the magnet is left where it was; it is never dropped straight to
    /// zero.
    pub fn run<O: Observer + ?Sized>(
        &mut self,
        control: &RunControl,
        observer: &mut O,
    ) -> Result<Trace> {
        let setpoints = self.params.setpoints()?;
        info!(
            "field sweep {} -> {} by {} ({})",
            self.params.start, self.params.stop, self.params.step, self.params.direction
        );
        let trace = self.sweep_once(&setpoints, control, observer)?;
        self.ramp_to(0.0, control, observer)?;
        Ok(trace)
    }

    /// A full sweep for every `(frequency, power)` row, typically the output of an equalisation.
    /// `Event::SweepDone` follows each frequency. The source is idled once all rows are done, and
    /// also on any error.
    pub fn run_calibrated<F, W, O>(
        &mut self,
        frequency: &mut F,
        power: &mut W,
        rows: &[(f64, f64)],
        control: &RunControl,
        observer: &mut O,
    ) -> Result<Vec<(f64, Trace)>>
    where
        F: Actuator + ?Sized,
        W: Actuator + ?Sized,
        O: Observer + ?Sized,
    {
        let setpoints = self.params.setpoints()?;
        if rows.is_empty() {
            return Err(Error::invalid("calibrated sweep needs at least one row"));
        }
        info!("calibrated field sweep over {} frequencies", rows.len());

        let mut out = Vec::with_capacity(rows.len());
        let res = (|| -> Result<()> {
            for &(f, p) in rows {
                control.checkpoint(self.clock)?;
                frequency.set_value(f)?;
                power.set_value(p)?;
                power.output_on()?;
                info!("sweeping at {f} GHz, power {p}");
                let trace = self.sweep_once(&setpoints, control, observer)?;
                observer.notify(Event::SweepDone { point: f });
                out.push((f, trace));
            }
            Ok(())
        })();
        if let Err(e) = res {
            warn!("calibrated sweep stopped: {e}");
            idle_or_warn(power, "source power");
            return Err(e);
        }
        power.idle()?;
        self.ramp_to(0.0, control, observer)?;
        Ok(out)
    }
}
