//! Capabilities the control loops need from the outside world. Instrument drivers (SCPI, DAQ
//! boards, serial ports) implement these; nothing in this crate talks to hardware directly.

use std::thread;
use std::time::Duration;

use log::warn;
use thiserror::Error;

use crate::band::{BandPlan, BandSwitch};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{instrument}: {message}")]
pub struct DeviceError {
    pub instrument: String,
    pub message: String,
}

impl DeviceError {
    #[must_use]
    pub fn new(instrument: impl Into<String>, message: impl Into<String>) -> Self {
        DeviceError {
            instrument: instrument.into(),
            message: message.into(),
        }
    }
}

/// Anything with a single real-valued setpoint: magnet field, source frequency, source power.
pub trait Actuator {
    /// # Errors
    /// Returns the driver's `DeviceError` if the value could not be applied.
    fn set_value(&mut self, value: f64) -> Result<(), DeviceError>;

    /// Enable the physical output, for instruments that have one.
    fn output_on(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Return to a safe idle state. For a bare setpoint that is zero; sources override this to
    /// also switch their output off.
    fn idle(&mut self) -> Result<(), DeviceError> {
        self.set_value(0.0)
    }
}

/// Synchronous, blocking readout.
pub trait Sensor {
    fn measure(&mut self) -> Result<f64, DeviceError>;
}

pub trait Clock {
    fn sleep(&mut self, duration: Duration);
}

impl<F> Actuator for F
where
    F: FnMut(f64) -> Result<(), DeviceError>,
{
    fn set_value(&mut self, value: f64) -> Result<(), DeviceError> {
        self(value)
    }
}

impl<F> Sensor for F
where
    F: FnMut() -> Result<f64, DeviceError>,
{
    fn measure(&mut self) -> Result<f64, DeviceError> {
        self()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn sleep(&mut self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Put `actuator` into its idle state, logging rather than propagating a failure. Used on
/// teardown paths where a more important error is already on its way to the caller.
pub fn idle_or_warn<A: Actuator + ?Sized>(actuator: &mut A, name: &str) {
    if let Err(e) = actuator.idle() {
        warn!("failed to return {name} to idle: {e}");
    }
}

/// The full set of instruments a run needs. A run takes the bench by value and hands it back
/// when it finishes, so two runs can never drive the same instrument.
pub struct Bench {
    pub source_frequency: Box<dyn Actuator + Send>,
    pub source_power: Box<dyn Actuator + Send>,
    pub diode: Box<dyn Sensor + Send>,
    pub magnet: Box<dyn Actuator + Send>,
    pub field_probe: Box<dyn Sensor + Send>,
    pub detector: Box<dyn Sensor + Send>,
    pub clock: Box<dyn Clock + Send>,
}

impl std::fmt::Debug for Bench {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bench").finish_non_exhaustive()
    }
}

impl Bench {
    /// Route every source frequency change through circulator selection with `selector`.
    /// # Errors
    /// `InvalidConfiguration` if `plan` does not validate.
    pub fn with_band_switch(
        self,
        plan: BandPlan,
        selector: Box<dyn Actuator + Send>,
    ) -> crate::Result<Self> {
        Ok(Bench {
            source_frequency: Box::new(BandSwitch::new(plan, self.source_frequency, selector)?),
            ..self
        })
    }
}
