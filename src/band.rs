//! Circulator selection. The source reaches the diode through one of several circulators, each
//! covering a frequency band. A `BandSwitch` sits in front of the source frequency actuator and
//! flips the selector before any frequency it has a band for; inside the excluded gaps and
//! outside `[min_ghz, max_ghz]` the frequency is set without touching the selector.

use log::{debug, info};

use crate::instrument::{Actuator, DeviceError};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct BandPlan {
    /// Inclusive `(low, high)` range of each selector position, in position order. The first
    /// band containing a frequency wins.
    pub bands: Vec<(f64, f64)>,
    /// Open intervals where no circulator is selected.
    pub gaps: Vec<(f64, f64)>,
    pub min_ghz: f64,
    pub max_ghz: f64,
}

impl Default for BandPlan {
    fn default() -> Self {
        BandPlan {
            bands: Vec::new(),
            gaps: vec![(26.0, 27.0)],
            min_ghz: 8.0,
            max_ghz: 40.0,
        }
    }
}

impl BandPlan {
    #[must_use]
    pub fn new(bands: Vec<(f64, f64)>) -> Self {
        BandPlan {
            bands,
            ..BandPlan::default()
        }
    }

    /// # Errors
    /// `InvalidConfiguration` for non-finite limits, an empty or inverted range, or an empty
    /// plan.
    pub fn validate(&self) -> Result<()> {
        if self.bands.is_empty() {
            return Err(Error::invalid("band plan has no circulator bands"));
        }
        if !self.min_ghz.is_finite() || !self.max_ghz.is_finite() || self.min_ghz >= self.max_ghz {
            return Err(Error::invalid(format!(
                "band plan limits {} .. {} GHz are not a range",
                self.min_ghz, self.max_ghz
            )));
        }
        for &(low, high) in &self.bands {
            if !low.is_finite() || !high.is_finite() || low > high {
                return Err(Error::invalid(format!("invalid circulator band {low} .. {high}")));
            }
        }
        for &(low, high) in &self.gaps {
            if !low.is_finite() || !high.is_finite() || low >= high {
                return Err(Error::invalid(format!("invalid band gap {low} .. {high}")));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn excluded(&self, frequency: f64) -> bool {
        frequency < self.min_ghz
            || frequency > self.max_ghz
            || self
                .gaps
                .iter()
                .any(|&(low, high)| low < frequency && frequency < high)
    }

    /// Selector position for `frequency`, if one should be selected.
    #[must_use]
    pub fn select(&self, frequency: f64) -> Option<usize> {
        if self.excluded(frequency) {
            return None;
        }
        self.bands
            .iter()
            .position(|&(low, high)| low <= frequency && frequency <= high)
    }
}

/// Source frequency actuator with circulator switching in front of it. The selector receives
/// the position index, and is only written when the position changes.
pub struct BandSwitch {
    plan: BandPlan,
    frequency: Box<dyn Actuator + Send>,
    selector: Box<dyn Actuator + Send>,
    position: Option<usize>,
}

impl std::fmt::Debug for BandSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BandSwitch")
            .field("plan", &self.plan)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl BandSwitch {
    /// # Errors
    /// `InvalidConfiguration` if `plan` does not validate.
    pub fn new(
        plan: BandPlan,
        frequency: Box<dyn Actuator + Send>,
        selector: Box<dyn Actuator + Send>,
    ) -> Result<Self> {
        plan.validate()?;
        info!("circulator switching over {} bands", plan.bands.len());
        Ok(BandSwitch {
            plan,
            frequency,
            selector,
            position: None,
        })
    }

    #[inline]
    #[must_use]
    pub fn position(&self) -> Option<usize> {
        self.position
    }
}

impl Actuator for BandSwitch {
    #[allow(clippy::cast_precision_loss)]
    fn set_value(&mut self, value: f64) -> std::result::Result<(), DeviceError> {
        match self.plan.select(value) {
            Some(position) if self.position != Some(position) => {
                debug!("selecting circulator {position} for {value} GHz");
                // forget the old position first: a failed switch leaves it unknown
                self.position = None;
                self.selector.set_value(position as f64)?;
                self.position = Some(position);
            }
            Some(_) => {}
            None => debug!("no circulator for {value} GHz"),
        }
        self.frequency.set_value(value)
    }

    fn output_on(&mut self) -> std::result::Result<(), DeviceError> {
        self.frequency.output_on()
    }

    fn idle(&mut self) -> std::result::Result<(), DeviceError> {
        self.frequency.idle()
    }
}
