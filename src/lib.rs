#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

extern crate serde;
extern crate toml;

pub mod band;
pub mod calibration;
pub mod communications;
pub mod configs;
pub mod control;
pub mod equalizer;
pub mod instrument;
pub mod maxima;
pub mod ramp;
pub mod scan;
pub mod session;
pub mod sim;
pub mod sweep;
pub mod table;
mod util;

use thiserror::Error;

pub use instrument::DeviceError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    /// The square-root response model was evaluated outside of its domain. Runs never terminate
    /// on this; it is surfaced so callers can log or count it.
    #[error("square-root model undefined at point {point} (trial power {power})")]
    ConvergenceDomain { point: f64, power: f64 },
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("run cancelled")]
    Cancelled,
    /// A run is already in progress and holds the instruments.
    #[error("{0} is already running")]
    Busy(String),
    /// The worker thread of a run died without handing the instruments back.
    #[error("run worker lost: {0}")]
    WorkerLost(String),
    #[error("table I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidConfiguration(msg.into())
    }
}
