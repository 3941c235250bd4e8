//! Source calibration: scan the detector over frequency, pick the response maxima as anchors, and
//! equalise the detector voltage at every anchor. Each stage is written to its own table.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::control::{Observer, RunControl};
use crate::equalizer::{Equalisation, EqualizerSettings, VoltageEqualizer};
use crate::instrument::{idle_or_warn, Bench};
use crate::maxima::LocalMaximaPicker;
use crate::scan::ScanParameters;
use crate::table;
use crate::Result;

pub const SCAN_TABLE: &str = "frequencies";
pub const ANCHOR_TABLE: &str = "frequencies_maxima";
pub const POWER_TABLE: &str = "frequencies_power";

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationSettings {
    pub scan: ScanParameters,
    pub maxima_order: usize,
    pub equalizer: EqualizerSettings,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        CalibrationSettings {
            scan: ScanParameters::default(),
            maxima_order: 8,
            equalizer: EqualizerSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    pub scan: Vec<(f64, f64)>,
    pub anchors: Vec<(f64, f64)>,
    pub equalisation: Equalisation,
    pub scan_table: PathBuf,
    pub anchor_table: PathBuf,
    pub power_table: PathBuf,
}

impl Calibration {
    /// The equalised `(frequency, power)` table.
    #[must_use]
    pub fn powers(&self) -> &[(f64, f64)] {
        &self.equalisation.converged
    }
}

impl CalibrationSettings {
    pub fn validate(&self) -> Result<LocalMaximaPicker> {
        self.scan.validate()?;
        self.equalizer.validate()?;
        LocalMaximaPicker::new(self.maxima_order)
    }

    /// Run the whole pipeline on `bench`, writing the tables into `output_dir`. The source is
    /// idled at the end, also after an error.
    pub fn run<O: Observer + ?Sized>(
        &self,
        bench: &mut Bench,
        output_dir: &Path,
        control: &RunControl,
        observer: &mut O,
    ) -> Result<Calibration> {
        let picker = self.validate()?;
        fs::create_dir_all(output_dir)?;
        let res = self.stages(&picker, bench, output_dir, control, observer);
        match &res {
            Ok(cal) => {
                info!(
                    "calibration done: {} of {} anchors equalised",
                    cal.equalisation.converged.len(),
                    cal.anchors.len()
                );
                bench.source_power.idle()?;
            }
            Err(e) => {
                warn!("calibration aborted: {e}");
                idle_or_warn(bench.source_power.as_mut(), "source power");
            }
        }
        res
    }

    fn stages<O: Observer + ?Sized>(
        &self,
        picker: &LocalMaximaPicker,
        bench: &mut Bench,
        output_dir: &Path,
        control: &RunControl,
        observer: &mut O,
    ) -> Result<Calibration> {
        let scan = self.scan.run(
            bench.source_frequency.as_mut(),
            bench.source_power.as_mut(),
            bench.diode.as_mut(),
            bench.clock.as_mut(),
            control,
            observer,
        )?;
        let scan_table = table::save(output_dir, SCAN_TABLE, &scan)?;

        let anchors = picker.pick(&scan);
        let anchor_table = table::save(output_dir, ANCHOR_TABLE, &anchors)?;
        if anchors.is_empty() {
            warn!("no response maxima in the scan; nothing to equalise");
        }

        let frequencies: Vec<f64> = anchors.iter().map(|a| a.0).collect();
        let equalisation = VoltageEqualizer::new(
            &self.equalizer,
            bench.source_frequency.as_mut(),
            bench.source_power.as_mut(),
            bench.diode.as_mut(),
            bench.clock.as_mut(),
        )
        .run(&frequencies, control, observer)?;
        let power_table = table::save(output_dir, POWER_TABLE, &equalisation.converged)?;

        Ok(Calibration {
            scan,
            anchors,
            equalisation,
            scan_table,
            anchor_table,
            power_table,
        })
    }
}
