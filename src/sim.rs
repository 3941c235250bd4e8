//! Stand-ins for the instruments, so runs can be exercised without hardware. The models are
//! crude on purpose: a square-law microwave diode behind a transmission line with a few
//! resonances, a magnet that reaches its setpoint instantly, and a lock-in that sees the field
//! derivative of a single ferromagnetic resonance line.
#![allow(clippy::cast_precision_loss)]

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::distributions::{Distribution, Uniform};

use crate::instrument::{Actuator, Bench, Clock, DeviceError, Sensor, SystemClock};

/// GHz per mT for a free electron.
const GYROMAGNETIC_GHZ_PER_MT: f64 = 0.028;
const LINEWIDTH_MT: f64 = 4.0;

/// Transmission resonances of the simulated feed line, in GHz.
const LINE_RESONANCES_GHZ: [f64; 4] = [9.2, 10.7, 12.1, 13.6];

/// A clock that only counts. Sleeping returns immediately.
#[derive(Debug, Default, Clone)]
pub struct VirtualClock {
    elapsed: Duration,
}

impl VirtualClock {
    #[inline]
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }
}

impl Clock for VirtualClock {
    fn sleep(&mut self, duration: Duration) {
        self.elapsed += duration;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LabState {
    pub frequency_ghz: f64,
    pub power: f64,
    pub output: bool,
    pub field_mt: f64,
    pub circulator: Option<usize>,
    /// Number of times the circulator selector was written.
    pub switches: u32,
}

/// Diode responsivity in V per sqrt(power unit) at `frequency_ghz`; always positive, the diode
/// itself produces negative voltages.
#[must_use]
pub fn responsivity(frequency_ghz: f64) -> f64 {
    0.08 + LINE_RESONANCES_GHZ
        .iter()
        .map(|f0| {
            let x = (frequency_ghz - f0) / 0.25;
            0.12 / (1.0 + x * x)
        })
        .sum::<f64>()
}

#[derive(Debug, Clone)]
pub struct SimulatedLab {
    state: Arc<Mutex<LabState>>,
    pub diode_noise_v: f64,
    pub probe_noise_mt: f64,
    pub lock_in_noise: f64,
}

impl Default for SimulatedLab {
    fn default() -> Self {
        SimulatedLab {
            state: Arc::new(Mutex::new(LabState::default())),
            diode_noise_v: 0.0,
            probe_noise_mt: 0.0,
            lock_in_noise: 0.0,
        }
    }
}

impl SimulatedLab {
    #[must_use]
    pub fn new() -> Self {
        SimulatedLab::default()
    }

    #[must_use]
    pub fn noisy() -> Self {
        SimulatedLab {
            diode_noise_v: 0.002,
            probe_noise_mt: 0.05,
            lock_in_noise: 0.01,
            ..SimulatedLab::default()
        }
    }

    /// # Errors
    /// Fails only if a previous holder of the state panicked.
    pub fn snapshot(&self) -> Result<LabState, DeviceError> {
        lock(&self.state, "lab").map(|s| *s)
    }

    pub fn set_field(&self, field_mt: f64) -> Result<(), DeviceError> {
        lock(&self.state, "magnet")?.field_mt = field_mt;
        Ok(())
    }

    #[must_use]
    pub fn source_frequency(&self) -> SourceFrequency {
        SourceFrequency {
            state: Arc::clone(&self.state),
        }
    }

    #[must_use]
    pub fn source_power(&self) -> SourcePower {
        SourcePower {
            state: Arc::clone(&self.state),
        }
    }

    #[must_use]
    pub fn diode(&self) -> Diode {
        Diode {
            state: Arc::clone(&self.state),
            noise: noise(self.diode_noise_v),
        }
    }

    #[must_use]
    pub fn magnet(&self) -> Magnet {
        Magnet {
            state: Arc::clone(&self.state),
        }
    }

    #[must_use]
    pub fn hall_probe(&self) -> HallProbe {
        HallProbe {
            state: Arc::clone(&self.state),
            noise: noise(self.probe_noise_mt),
        }
    }

    #[must_use]
    pub fn lock_in(&self) -> LockIn {
        LockIn {
            state: Arc::clone(&self.state),
            noise: noise(self.lock_in_noise),
        }
    }

    #[must_use]
    pub fn circulator(&self) -> Circulator {
        Circulator {
            state: Arc::clone(&self.state),
        }
    }

    /// A complete bench on this lab. `realtime` selects the system clock instead of a virtual one.
    #[must_use]
    pub fn bench(&self, realtime: bool) -> Bench {
        let clock: Box<dyn Clock + Send> = if realtime {
            Box::new(SystemClock)
        } else {
            Box::new(VirtualClock::default())
        };
        Bench {
            source_frequency: Box::new(self.source_frequency()),
            source_power: Box::new(self.source_power()),
            diode: Box::new(self.diode()),
            magnet: Box::new(self.magnet()),
            field_probe: Box::new(self.hall_probe()),
            detector: Box::new(self.lock_in()),
            clock,
        }
    }
}

fn lock<'a>(
    state: &'a Mutex<LabState>,
    instrument: &str,
) -> Result<MutexGuard<'a, LabState>, DeviceError> {
    state
        .lock()
        .map_err(|_| DeviceError::new(instrument, "simulated lab state poisoned"))
}

fn noise(amplitude: f64) -> Uniform<f64> {
    let a = amplitude.abs();
    Uniform::new_inclusive(-a, a)
}

#[derive(Debug)]
pub struct SourceFrequency {
    state: Arc<Mutex<LabState>>,
}

impl Actuator for SourceFrequency {
    fn set_value(&mut self, value: f64) -> Result<(), DeviceError> {
        if value <= 0.0 {
            return Err(DeviceError::new(
                "source",
                format!("frequency {value} GHz out of range"),
            ));
        }
        lock(&self.state, "source")?.frequency_ghz = value;
        Ok(())
    }

    // the frequency has no unsafe state; the power side switches the output off
    fn idle(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct SourcePower {
    state: Arc<Mutex<LabState>>,
}

impl Actuator for SourcePower {
    fn set_value(&mut self, value: f64) -> Result<(), DeviceError> {
        lock(&self.state, "source")?.power = value;
        Ok(())
    }

    fn output_on(&mut self) -> Result<(), DeviceError> {
        lock(&self.state, "source")?.output = true;
        Ok(())
    }

    fn idle(&mut self) -> Result<(), DeviceError> {
        let mut state = lock(&self.state, "source")?;
        state.output = false;
        state.power = 0.0;
        Ok(())
    }
}

#[derive(Debug)]
pub struct Diode {
    state: Arc<Mutex<LabState>>,
    noise: Uniform<f64>,
}

impl Sensor for Diode {
    fn measure(&mut self) -> Result<f64, DeviceError> {
        let state = *lock(&self.state, "multimeter")?;
        let signal = if state.output {
            -responsivity(state.frequency_ghz) * state.power.max(0.0).sqrt()
        } else {
            0.0
        };
        Ok(signal + self.noise.sample(&mut rand::thread_rng()))
    }
}

#[derive(Debug)]
pub struct Magnet {
    state: Arc<Mutex<LabState>>,
}

impl Actuator for Magnet {
    fn set_value(&mut self, value: f64) -> Result<(), DeviceError> {
        lock(&self.state, "magnet")?.field_mt = value;
        Ok(())
    }
}

/// Selector of a bank of circulators; takes the position index.
#[derive(Debug)]
pub struct Circulator {
    state: Arc<Mutex<LabState>>,
}

impl Actuator for Circulator {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn set_value(&mut self, value: f64) -> Result<(), DeviceError> {
        if !(value >= 0.0 && value.fract() == 0.0 && value < 16.0) {
            return Err(DeviceError::new(
                "circulator",
                format!("no selector position {value}"),
            ));
        }
        let mut state = lock(&self.state, "circulator")?;
        state.circulator = Some(value as usize);
        state.switches += 1;
        Ok(())
    }

    // stays where it is
    fn idle(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct HallProbe {
    state: Arc<Mutex<LabState>>,
    noise: Uniform<f64>,
}

impl Sensor for HallProbe {
    fn measure(&mut self) -> Result<f64, DeviceError> {
        let field = lock(&self.state, "hall probe")?.field_mt;
        Ok(field + self.noise.sample(&mut rand::thread_rng()))
    }
}

#[derive(Debug)]
pub struct LockIn {
    state: Arc<Mutex<LabState>>,
    noise: Uniform<f64>,
}

impl Sensor for LockIn {
    fn measure(&mut self) -> Result<f64, DeviceError> {
        let state = *lock(&self.state, "lock-in")?;
        let signal = if state.output {
            let resonance = state.frequency_ghz / GYROMAGNETIC_GHZ_PER_MT;
            let x = (state.field_mt - resonance) / LINEWIDTH_MT;
            // field derivative of a Lorentzian absorption line
            -2.0 * x / (1.0 + x * x).powi(2) * state.power.max(0.0).sqrt()
        } else {
            0.0
        };
        Ok(signal + self.noise.sample(&mut rand::thread_rng()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diode_is_square_law_and_dark_when_off() {
        let lab = SimulatedLab::new();
        let mut power = lab.source_power();
        let mut freq = lab.source_frequency();
        let mut diode = lab.diode();
        freq.set_value(10.0).unwrap();
        power.set_value(4.0).unwrap();
        assert_eq!(diode.measure().unwrap(), 0.0);
        power.output_on().unwrap();
        let v4 = diode.measure().unwrap();
        power.set_value(16.0).unwrap();
        let v16 = diode.measure().unwrap();
        assert!(v4 < 0.0);
        assert!((v16 / v4 - 2.0).abs() < 1e-12);
        power.idle().unwrap();
        assert!(!lab.snapshot().unwrap().output);
    }

    #[test]
    fn responsivity_peaks_on_resonances() {
        for f0 in LINE_RESONANCES_GHZ {
            assert!(responsivity(f0) > responsivity(f0 - 0.3));
            assert!(responsivity(f0) > responsivity(f0 + 0.3));
        }
    }

    #[test]
    fn circulator_positions() {
        let lab = SimulatedLab::new();
        let mut circ = lab.circulator();
        circ.set_value(2.0).unwrap();
        assert!(circ.set_value(1.5).is_err());
        assert!(circ.set_value(-1.0).is_err());
        let state = lab.snapshot().unwrap();
        assert_eq!(state.circulator, Some(2));
        assert_eq!(state.switches, 1);
    }

    #[test]
    fn noisy_probe_stays_close() {
        let lab = SimulatedLab::noisy();
        lab.set_field(120.0).unwrap();
        let mut probe = lab.hall_probe();
        for _ in 0..100 {
            assert!((probe.measure().unwrap() - 120.0).abs() <= 0.05);
        }
    }

    #[test]
    fn virtual_clock_accumulates() {
        let mut clock = VirtualClock::default();
        clock.sleep(Duration::from_millis(30));
        clock.sleep(Duration::from_millis(70));
        assert_eq!(clock.elapsed(), Duration::from_millis(100));
    }
}
