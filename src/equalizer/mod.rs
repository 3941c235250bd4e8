//! Equalise a square-law detector: for each operating point (source frequency), search for the
//! source power at which the detector voltage sits within a threshold of a target.
//!
//! Each iteration probes the response at the current trial power and at `power + probe_step`,
//! fits the two readings to the detector model, and jumps to the power the model predicts for
//! the target. Predictions the model cannot make fall back to `domain_fallback`; predictions above
//! `ceiling` are replaced by `ceiling_fallback` so an unlucky estimate never commands a large
//! output.

use std::fmt;
use std::num::NonZeroU32;
use std::str::{FromStr, Split};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::control::{Event, Observer, RunControl};
use crate::instrument::{idle_or_warn, Actuator, Clock, Sensor};
use crate::util::duration_ms;
use crate::{Error, Result};

#[cfg(test)]
mod tests;

/// How the next trial power is derived from the two readings of an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Estimator {
    /// Fit `V = c * sqrt(P) + b` through both readings and solve for the target. Exact in one
    /// step for an ideal square-law detector.
    #[default]
    SqrtSecant,
    /// Slope proxy `a = (V - V_start) / (2 * probe_step)` and `P = sqrt(target / a)`. This is
    /// the rule used by the older calibration scripts; it does not in general settle on the
    /// target for a square-root response.
    HalfSlope,
}

impl fmt::Display for Estimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Estimator::SqrtSecant => write!(f, "sqrt_secant"),
            Estimator::HalfSlope => write!(f, "half_slope"),
        }
    }
}

impl FromStr for Estimator {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqrt_secant" => Ok(Estimator::SqrtSecant),
            "half_slope" => Ok(Estimator::HalfSlope),
            other => Err(format!("unknown estimator '{other}'")),
        }
    }
}

/// Outcome of one model evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    pub slope: f64,
    /// `None` when the model has no answer: flat or inverted response, negative trial power.
    pub power: Option<f64>,
}

impl Estimator {
    #[must_use]
    pub fn estimate(
        self,
        power: f64,
        probe_step: f64,
        v_start: f64,
        v_probe: f64,
        target: f64,
    ) -> Estimate {
        match self {
            Estimator::SqrtSecant => {
                if power < 0.0 || power + probe_step < 0.0 {
                    return Estimate {
                        slope: f64::NAN,
                        power: None,
                    };
                }
                let root_start = power.sqrt();
                let slope = (v_probe - v_start) / ((power + probe_step).sqrt() - root_start);
                let offset = v_start - slope * root_start;
                let root = (target - offset) / slope;
                Estimate {
                    slope,
                    power: (root.is_finite() && root > 0.0).then(|| root * root),
                }
            }
            Estimator::HalfSlope => {
                let slope = (v_probe - v_start) / (2.0 * probe_step);
                let ratio = target / slope;
                Estimate {
                    slope,
                    power: (ratio.is_finite() && ratio > 0.0).then(|| ratio.sqrt()),
                }
            }
        }
    }
}

/// Parameters of an equalisation run. Snapshotted when a run starts; edits apply to the next run.
#[derive(Debug, Clone, PartialEq)]
pub struct EqualizerSettings {
    pub target_v: f64,
    pub threshold_v: f64,
    pub seed_power: f64,
    pub probe_step: f64,
    pub domain_fallback: f64,
    pub ceiling: f64,
    pub ceiling_fallback: f64,
    pub settle: Duration,
    max_iterations: Option<NonZeroU32>,
    pub estimator: Estimator,
    /// Also return the source to idle when a run is cancelled, not only on device errors.
    pub idle_on_abort: bool,
}

impl Default for EqualizerSettings {
    fn default() -> Self {
        EqualizerSettings {
            target_v: -0.3,
            threshold_v: 0.05,
            seed_power: 1.0,
            probe_step: 3.0,
            domain_fallback: 3.0,
            ceiling: 17.0,
            ceiling_fallback: 2.0,
            settle: Duration::from_millis(50),
            max_iterations: NonZeroU32::new(100),
            estimator: Estimator::SqrtSecant,
            idle_on_abort: true,
        }
    }
}

impl EqualizerSettings {
    #[must_use]
    pub fn new() -> Self {
        EqualizerSettings::default()
    }

    /// `0` removes the cap: a point that never reaches the threshold is retried until the run is
    /// cancelled.
    pub fn set_max_iterations(&mut self, max: u32) -> &mut Self {
        self.max_iterations = NonZeroU32::new(max);
        self
    }

    #[inline]
    #[must_use]
    pub fn max_iterations(&self) -> Option<NonZeroU32> {
        self.max_iterations
    }

    pub fn settle_ms(&mut self, time_ms: f64) -> &mut Self {
        self.settle = duration_ms(time_ms);
        self
    }

    /// # Errors
    /// `InvalidConfiguration` describing the first offending parameter.
    pub fn validate(&self) -> Result<()> {
        let finite = [
            ("target_v", self.target_v),
            ("threshold_v", self.threshold_v),
            ("seed_power", self.seed_power),
            ("probe_step", self.probe_step),
            ("domain_fallback", self.domain_fallback),
            ("ceiling", self.ceiling),
            ("ceiling_fallback", self.ceiling_fallback),
        ];
        if let Some((name, _)) = finite.iter().find(|(_, v)| !v.is_finite()) {
            return Err(Error::invalid(format!("equalizer {name} must be finite")));
        }
        if self.threshold_v <= 0.0 {
            return Err(Error::invalid("equalizer threshold must be positive"));
        }
        if self.probe_step == 0.0 {
            return Err(Error::invalid("equalizer probe step must be non-zero"));
        }
        if self.domain_fallback > self.ceiling || self.ceiling_fallback > self.ceiling {
            return Err(Error::invalid(format!(
                "equalizer fallback powers must not exceed the ceiling {}",
                self.ceiling
            )));
        }
        Ok(())
    }

    /// Remote get/set, e.g. `TARGET:SET:-0.25` or `MAX_ITER:GET`.
    /// # Errors
    /// `Err(())` if the command is not recognised or the value does not parse.
    #[allow(clippy::result_unit_err)]
    pub fn process_command(&mut self, cmd: Split<'_, char>) -> std::result::Result<String, ()> {
        let resp = match cmd.collect::<Vec<&str>>()[..] {
            ["TARGET", "SET", x] => {
                self.target_v = x.parse::<f64>().map_err(|_| ())?;
                String::new()
            }
            ["TARGET", "GET"] => self.target_v.to_string(),
            ["THRESHOLD", "SET", x] => {
                self.threshold_v = x.parse::<f64>().map_err(|_| ())?;
                String::new()
            }
            ["THRESHOLD", "GET"] => self.threshold_v.to_string(),
            ["SEED", "SET", x] => {
                self.seed_power = x.parse::<f64>().map_err(|_| ())?;
                String::new()
            }
            ["SEED", "GET"] => self.seed_power.to_string(),
            ["PROBE_STEP", "SET", x] => {
                self.probe_step = x.parse::<f64>().map_err(|_| ())?;
                String::new()
            }
            ["PROBE_STEP", "GET"] => self.probe_step.to_string(),
            ["CEILING", "SET", x] => {
                self.ceiling = x.parse::<f64>().map_err(|_| ())?;
                String::new()
            }
            ["CEILING", "GET"] => self.ceiling.to_string(),
            ["MAX_ITER", "SET", x] => {
                self.set_max_iterations(x.parse::<u32>().map_err(|_| ())?);
                String::new()
            }
            ["MAX_ITER", "GET"] => self.max_iterations.map_or(0, NonZeroU32::get).to_string(),
            ["ESTIMATOR", "SET", x] => {
                self.estimator = x.parse::<Estimator>().map_err(|_| ())?;
                String::new()
            }
            ["ESTIMATOR", "GET"] => self.estimator.to_string(),
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

#[derive(Serialize, Deserialize, Debug)]
struct EqualizerSerialize {
    target_v: f64,
    threshold_v: f64,
    seed_power: f64,
    probe_step: f64,
    domain_fallback: f64,
    ceiling: f64,
    ceiling_fallback: f64,
    settle_ms: f64,
    // 0 = unbounded
    max_iterations: u32,
    estimator: String,
    idle_on_abort: bool,
}

impl EqualizerSerialize {
    fn into_settings(self) -> std::result::Result<EqualizerSettings, String> {
        let mut out = EqualizerSettings {
            target_v: self.target_v,
            threshold_v: self.threshold_v,
            seed_power: self.seed_power,
            probe_step: self.probe_step,
            domain_fallback: self.domain_fallback,
            ceiling: self.ceiling,
            ceiling_fallback: self.ceiling_fallback,
            estimator: self.estimator.parse()?,
            idle_on_abort: self.idle_on_abort,
            ..EqualizerSettings::default()
        };
        out.settle_ms(self.settle_ms)
            .set_max_iterations(self.max_iterations);
        out.validate().map_err(|e| e.to_string())?;
        Ok(out)
    }

    fn from_settings(settings: &EqualizerSettings) -> Self {
        EqualizerSerialize {
            target_v: settings.target_v,
            threshold_v: settings.threshold_v,
            seed_power: settings.seed_power,
            probe_step: settings.probe_step,
            domain_fallback: settings.domain_fallback,
            ceiling: settings.ceiling,
            ceiling_fallback: settings.ceiling_fallback,
            settle_ms: settings.settle.as_secs_f64() * 1000.0,
            max_iterations: settings.max_iterations.map_or(0, NonZeroU32::get),
            estimator: settings.estimator.to_string(),
            idle_on_abort: settings.idle_on_abort,
        }
    }
}

impl<'de> Deserialize<'de> for EqualizerSettings {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        EqualizerSerialize::deserialize(d)?
            .into_settings()
            .map_err(serde::de::Error::custom)
    }
}

impl Serialize for EqualizerSettings {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        EqualizerSerialize::from_settings(self).serialize(serializer)
    }
}

/// Per-point search state. Created fresh for every operating point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EqualisationState {
    pub point: f64,
    pub power: f64,
    pub voltage: f64,
    pub iterations: u32,
    pub slope: Option<f64>,
}

impl EqualisationState {
    #[must_use]
    pub fn new(point: f64, seed_power: f64) -> Self {
        EqualisationState {
            point,
            power: seed_power,
            voltage: f64::NAN,
            iterations: 0,
            slope: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn within(&self, target: f64, threshold: f64) -> bool {
        (self.voltage - target).abs() <= threshold
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Equalisation {
    /// `(point, power)` for every point that reached the threshold, in input order.
    pub converged: Vec<(f64, f64)>,
    /// Final state of points that hit the iteration cap.
    pub unconverged: Vec<EqualisationState>,
    pub domain_fallbacks: usize,
}

/// Drives the operating-point actuator, the power actuator and the detector through the search.
/// Exclusively borrows all three for the duration of a run.
pub struct VoltageEqualizer<'a, F: ?Sized, P: ?Sized, S: ?Sized, C: ?Sized> {
    settings: &'a EqualizerSettings,
    point: &'a mut F,
    power: &'a mut P,
    sensor: &'a mut S,
    clock: &'a mut C,
}

impl<'a, F, P, S, C> VoltageEqualizer<'a, F, P, S, C>
where
    F: Actuator + ?Sized,
    P: Actuator + ?Sized,
    S: Sensor + ?Sized,
    C: Clock + ?Sized,
{
    pub fn new(
        settings: &'a EqualizerSettings,
        point: &'a mut F,
        power: &'a mut P,
        sensor: &'a mut S,
        clock: &'a mut C,
    ) -> Self {
        VoltageEqualizer {
            settings,
            point,
            power,
            sensor,
            clock,
        }
    }

    /// Equalise every point in `points`, in order.
    ///
    /// On success the power actuator is left at the last converged value; the caller decides
    /// when to idle it. On a device error it is idled before the error is returned, and on
    /// cancellation too if `idle_on_abort` is set.
    /// # Errors
    /// `InvalidConfiguration` before any actuation, `Cancelled`, or `Device`.
    pub fn run<O: Observer + ?Sized>(
        &mut self,
        points: &[f64],
        control: &RunControl,
        observer: &mut O,
    ) -> Result<Equalisation> {
        self.settings.validate()?;
        info!(
            "equalising {} points to {} V (+/- {} V)",
            points.len(),
            self.settings.target_v,
            self.settings.threshold_v
        );
        let res = self.run_points(points, control, observer);
        match &res {
            Err(Error::Device(e)) => {
                warn!("device error during equalisation, idling source: {e}");
                idle_or_warn(self.power, "source power");
            }
            Err(Error::Cancelled) if self.settings.idle_on_abort => {
                idle_or_warn(self.power, "source power");
            }
            _ => {}
        }
        res
    }

    fn run_points<O: Observer + ?Sized>(
        &mut self,
        points: &[f64],
        control: &RunControl,
        observer: &mut O,
    ) -> Result<Equalisation> {
        let mut out = Equalisation::default();
        self.power.output_on()?;
        for &point in points {
            control.checkpoint(self.clock)?;
            let state = self.equalise_point(point, control, observer, &mut out.domain_fallbacks)?;
            if state.within(self.settings.target_v, self.settings.threshold_v) {
                out.converged.push((state.point, state.power));
            } else {
                out.unconverged.push(state);
            }
        }
        Ok(out)
    }

    fn apply_power(&mut self, power: f64) -> Result<()> {
        self.power.set_value(power)?;
        self.clock.sleep(self.settings.settle);
        Ok(())
    }

    fn equalise_point<O: Observer + ?Sized>(
        &mut self,
        point: f64,
        control: &RunControl,
        observer: &mut O,
        domain_fallbacks: &mut usize,
    ) -> Result<EqualisationState> {
        let cfg = self.settings;
        self.point.set_value(point)?;
        let mut state = EqualisationState::new(point, cfg.seed_power);
        self.apply_power(state.power)?;
        state.voltage = self.sensor.measure()?;

        while !state.within(cfg.target_v, cfg.threshold_v) {
            control.checkpoint(self.clock)?;
            if let Some(max) = cfg.max_iterations {
                if state.iterations >= max.get() {
                    warn!(
                        "point {point}: no convergence after {} iterations (power {}, {} V)",
                        state.iterations, state.power, state.voltage
                    );
                    observer.notify(Event::NotConverged {
                        point,
                        power: state.power,
                    });
                    return Ok(state);
                }
            }

            let v_start = self.sensor.measure()?;
            self.apply_power(state.power + cfg.probe_step)?;
            let v_probe = self.sensor.measure()?;

            let estimate =
                cfg.estimator
                    .estimate(state.power, cfg.probe_step, v_start, v_probe, cfg.target_v);
            state.slope = Some(estimate.slope);
            let mut next = if let Some(p) = estimate.power {
                p
            } else {
                warn!(
                    "{}; continuing from {}",
                    Error::ConvergenceDomain {
                        point,
                        power: state.power
                    },
                    cfg.domain_fallback
                );
                *domain_fallbacks += 1;
                observer.notify(Event::DomainFallback {
                    point,
                    power: cfg.domain_fallback,
                });
                cfg.domain_fallback
            };
            if next > cfg.ceiling {
                debug!(
                    "point {point}: estimate {next} above ceiling {}, using {}",
                    cfg.ceiling, cfg.ceiling_fallback
                );
                next = cfg.ceiling_fallback;
            }

            state.power = next;
            self.apply_power(next)?;
            state.voltage = self.sensor.measure()?;
            state.iterations += 1;
            debug!(
                "point {point}: iteration {} power {} -> {} V (slope {})",
                state.iterations, state.power, state.voltage, estimate.slope
            );
        }

        info!(
            "point {point}: {} V at power {} after {} iterations",
            state.voltage, state.power, state.iterations
        );
        observer.notify(Event::Converged {
            point,
            power: state.power,
        });
        Ok(state)
    }
}
