//! Supervises one run at a time. The instruments live in a `Bench` that is moved onto the worker
//! thread for the duration of a run and handed back when it finishes, so a second run cannot
//! start until the first has released them.

use std::fmt;
use std::path::PathBuf;
use std::str::Split;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use async_std::channel::{self, Receiver, Sender};
use log::{error, info, warn};

use crate::calibration::Calibration;
use crate::configs::Settings;
use crate::control::{Event, Observer, RunControl};
use crate::instrument::Bench;
use crate::sweep::{FieldSweep, Trace};
use crate::table;
use crate::{Error, Result};

/// Events queued for publishing before new ones are dropped.
const EVENT_QUEUE: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub enum RunKind {
    Scan,
    Calibrate,
    Sweep,
    /// Field sweeps over every `(frequency, power)` row of a table file.
    FrequencySweep(PathBuf),
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunKind::Scan => write!(f, "SCAN"),
            RunKind::Calibrate => write!(f, "CALIBRATE"),
            RunKind::Sweep => write!(f, "SWEEP"),
            RunKind::FrequencySweep(path) => write!(f, "FREQ_SWEEP:{}", path.display()),
        }
    }
}

#[derive(Debug)]
pub enum RunOutcome {
    Scan { trace: Vec<(f64, f64)>, table: PathBuf },
    Calibration(Calibration),
    Sweep { traces: Vec<(f64, Trace)>, tables: Vec<PathBuf> },
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Scan { trace, table } => {
                write!(f, "scan of {} points in {}", trace.len(), table.display())
            }
            RunOutcome::Calibration(cal) => write!(
                f,
                "{} of {} anchors equalised, {}",
                cal.equalisation.converged.len(),
                cal.anchors.len(),
                cal.power_table.display()
            ),
            RunOutcome::Sweep { traces, .. } => write!(f, "{} field sweeps", traces.len()),
        }
    }
}

/// Run `kind` to completion on the calling thread.
pub fn execute<O: Observer + ?Sized>(
    kind: &RunKind,
    settings: &Settings,
    bench: &mut Bench,
    control: &RunControl,
    observer: &mut O,
) -> Result<RunOutcome> {
    let dir = settings.output_dir.as_path();
    match kind {
        RunKind::Scan => {
            let trace = settings.calibration.scan.run(
                bench.source_frequency.as_mut(),
                bench.source_power.as_mut(),
                bench.diode.as_mut(),
                bench.clock.as_mut(),
                control,
                observer,
            )?;
            std::fs::create_dir_all(dir)?;
            let table = table::save(dir, "frequencies", &trace)?;
            Ok(RunOutcome::Scan { trace, table })
        }
        RunKind::Calibrate => settings
            .calibration
            .run(bench, dir, control, observer)
            .map(RunOutcome::Calibration),
        RunKind::Sweep | RunKind::FrequencySweep(_) => {
            let mut sweep = FieldSweep::new(
                &settings.sweep,
                bench.magnet.as_mut(),
                bench.field_probe.as_mut(),
                bench.detector.as_mut(),
                bench.clock.as_mut(),
            );
            let traces = match (kind, settings.sweep_source) {
                (RunKind::FrequencySweep(path), _) => {
                    let rows = table::read_table(path)?;
                    sweep.run_calibrated(
                        bench.source_frequency.as_mut(),
                        bench.source_power.as_mut(),
                        &rows,
                        control,
                        observer,
                    )?
                }
                (_, Some(row)) => sweep.run_calibrated(
                    bench.source_frequency.as_mut(),
                    bench.source_power.as_mut(),
                    &[row],
                    control,
                    observer,
                )?,
                (_, None) => vec![(f64::NAN, sweep.run(control, observer)?)],
            };
            std::fs::create_dir_all(dir)?;
            let tables = traces
                .iter()
                .map(|(f, trace)| {
                    let kind = if f.is_nan() {
                        "sweep".to_string()
                    } else {
                        format!("sweep_{f}GHz")
                    };
                    table::save(dir, &kind, trace)
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(RunOutcome::Sweep { traces, tables })
        }
    }
}

type Worker = JoinHandle<(Bench, Result<RunOutcome>)>;

struct ActiveRun {
    kind: RunKind,
    control: Arc<RunControl>,
    handle: Worker,
}

pub struct Session {
    /// Settings for the next run. A running run works on its own copy.
    pub pending: Settings,
    bench: Option<Bench>,
    active: Option<ActiveRun>,
    last_result: String,
    events_tx: Sender<Event>,
    events_rx: Receiver<Event>,
}

impl Session {
    #[must_use]
    pub fn new(settings: Settings, bench: Bench) -> Self {
        let (events_tx, events_rx) = channel::bounded(EVENT_QUEUE);
        Session {
            pending: settings,
            bench: Some(bench),
            active: None,
            last_result: String::from("none"),
            events_tx,
            events_rx,
        }
    }

    /// Events emitted by the current run, in order.
    #[must_use]
    pub fn events(&self) -> &Receiver<Event> {
        &self.events_rx
    }

    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// # Errors
    /// `Busy` if a run is already in progress, `WorkerLost` if the instruments went down with a
    /// crashed run.
    pub fn start(&mut self, kind: RunKind) -> Result<()> {
        if let Some(active) = &self.active {
            return Err(Error::Busy(active.kind.to_string()));
        }
        let mut bench = self
            .bench
            .take()
            .ok_or_else(|| {
                Error::WorkerLost("instruments unavailable after a crashed run".into())
            })?;
        let settings = self.pending.clone();
        let control = Arc::new(RunControl::new());
        let worker_control = Arc::clone(&control);
        let mut tx = self.events_tx.clone();
        let worker_kind = kind.clone();
        info!("starting {kind}");
        let handle = thread::spawn(move || {
            let res = execute(&worker_kind, &settings, &mut bench, &worker_control, &mut tx);
            (bench, res)
        });
        self.active = Some(ActiveRun {
            kind,
            control,
            handle,
        });
        Ok(())
    }

    fn control(&self) -> Option<&RunControl> {
        self.active.as_ref().map(|a| a.control.as_ref())
    }

    /// Returns `false` if nothing is running.
    pub fn pause(&self) -> bool {
        if let Some(control) = self.control() {
            control.pause();
            true
        } else {
            false
        }
    }

    pub fn resume(&self) -> bool {
        if let Some(control) = self.control() {
            control.resume();
            true
        } else {
            false
        }
    }

    pub fn cancel(&self) -> bool {
        if let Some(control) = self.control() {
            control.cancel();
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn status(&self) -> String {
        match &self.active {
            Some(a) if a.control.is_cancelled() => format!("CANCELLING:{}", a.kind),
            Some(a) if a.control.is_paused() => format!("PAUSED:{}", a.kind),
            Some(a) => format!("RUNNING:{}", a.kind),
            None => format!("IDLE (last run: {})", self.last_result),
        }
    }

    fn finish(&mut self, active: ActiveRun) -> Result<RunOutcome> {
        match active.handle.join() {
            Ok((bench, res)) => {
                self.bench = Some(bench);
                match &res {
                    Ok(outcome) => {
                        info!("{} finished: {outcome}", active.kind);
                        self.last_result = format!("{}: {outcome}", active.kind);
                    }
                    Err(e) => {
                        error!("{} failed: {e}", active.kind);
                        self.last_result = format!("{}: {e}", active.kind);
                    }
                }
                res
            }
            Err(_) => {
                error!("{} panicked; instruments are no longer available", active.kind);
                self.last_result = format!("{}: panicked", active.kind);
                Err(Error::WorkerLost(format!("{} panicked", active.kind)))
            }
        }
    }

    /// Collect the result of a run that has finished, without blocking.
    pub fn poll(&mut self) -> Option<Result<RunOutcome>> {
        if !self.active.as_ref()?.handle.is_finished() {
            return None;
        }
        let active = self.active.take()?;
        Some(self.finish(active))
    }

    /// Block until the current run finishes.
    pub fn wait(&mut self) -> Option<Result<RunOutcome>> {
        let active = self.active.take()?;
        Some(self.finish(active))
    }

    fn process_run_command(&mut self, cmd: Split<'_, char>) -> std::result::Result<String, ()> {
        let parts = cmd.collect::<Vec<&str>>();
        let kind = match parts[..] {
            ["START", "SCAN"] => RunKind::Scan,
            ["START", "CALIBRATE"] => RunKind::Calibrate,
            ["START", "SWEEP"] => RunKind::Sweep,
            // paths may contain the separator
            ["START", "FREQ_SWEEP", ref path @ ..] if !path.is_empty() => {
                RunKind::FrequencySweep(PathBuf::from(path.join(":")))
            }
            ["PAUSE"] => return Ok(if self.pause() { "OK" } else { "NOT RUNNING" }.into()),
            ["RESUME"] => return Ok(if self.resume() { "OK" } else { "NOT RUNNING" }.into()),
            ["CANCEL"] => return Ok(if self.cancel() { "OK" } else { "NOT RUNNING" }.into()),
            ["STATUS"] => return Ok(self.status()),
            _ => return Err(()),
        };
        Ok(match self.start(kind) {
            Ok(()) => "OK".to_string(),
            Err(e) => {
                warn!("refused to start run: {e}");
                format!("ERROR: {e}")
            }
        })
    }

    fn process_maxima_command(&mut self, cmd: Split<'_, char>) -> std::result::Result<String, ()> {
        let resp = match cmd.collect::<Vec<&str>>()[..] {
            ["ORDER", "SET", x] => {
                let order = x.parse::<usize>().map_err(|_| ())?;
                if order == 0 {
                    Err(())?;
                }
                self.pending.calibration.maxima_order = order;
                String::new()
            }
            ["ORDER", "GET"] => self.pending.calibration.maxima_order.to_string(),
            _ => Err(())?,
        };
        Ok(resp)
    }

    /// Handle a colon separated command and return the reply for the sender.
    /// # Errors
    /// `Err(())` if `cmd` is not a valid command.
    #[allow(clippy::result_unit_err)]
    pub fn process_command(&mut self, mut cmd: Split<'_, char>) -> std::result::Result<String, ()> {
        match cmd.next() {
            Some("RUN") => self.process_run_command(cmd),
            Some("EQ") => {
                let eq = &mut self.pending.calibration.equalizer;
                match cmd.clone().collect::<Vec<&str>>()[..] {
                    ["DUMP"] => toml::to_string(&*eq).map_err(|_| ()),
                    _ => eq.process_command(cmd),
                }
            }
            Some("RAMP") => self.pending.sweep.ramp.process_command(cmd),
            Some("SWEEP") => self.pending.sweep.process_command(cmd),
            Some("MAXIMA") => self.process_maxima_command(cmd),
            Some(_) | None => Err(()),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.control.cancel();
            let _ = self.finish(active);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::Sensor;
    use crate::scan::ScanParameters;
    use crate::sim::SimulatedLab;
    use crate::DeviceError;
    use std::time::Duration;

    fn settings(name: &str) -> Settings {
        let mut out = Settings::default();
        out.output_dir =
            std::env::temp_dir().join(format!("labsweep-session-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&out.output_dir);
        out.calibration.scan = ScanParameters::new(9.0, 10.0, 0.05);
        out.calibration.scan.power(4.0);
        out.sweep = crate::sweep::SweepParameters::new(300.0, 400.0, 10.0);
        out.sweep_source = Some((9.8, 2.0));
        out
    }

    #[test]
    fn scan_run_writes_table_and_returns_bench() {
        let lab = SimulatedLab::new();
        let mut session = Session::new(settings("scan"), lab.bench(false));
        assert_eq!(session.process_command("RUN:START:SCAN".split(':')), Ok("OK".into()));
        let outcome = session.wait().unwrap().unwrap();
        let RunOutcome::Scan { trace, table } = outcome else {
            panic!("expected a scan outcome");
        };
        assert_eq!(trace.len(), 20);
        assert_eq!(table::read_table(&table).unwrap(), trace);
        assert!(session.status().starts_with("IDLE"));

        let samples = std::iter::from_fn(|| session.events().try_recv().ok())
            .filter(|e| matches!(e, Event::Sample { .. }))
            .count();
        assert_eq!(samples, 20);

        // instruments are back: a second run can start
        assert!(session.start(RunKind::Sweep).is_ok());
        assert!(matches!(
            session.wait(),
            Some(Ok(RunOutcome::Sweep { .. }))
        ));
        std::fs::remove_dir_all(&session.pending.output_dir).unwrap();
    }

    #[test]
    fn one_run_at_a_time_and_cancel() {
        let lab = SimulatedLab::new();
        let mut bench = lab.bench(false);
        let mut diode = lab.diode();
        bench.diode = Box::new(move || -> std::result::Result<f64, DeviceError> {
            std::thread::sleep(Duration::from_millis(20));
            diode.measure()
        });
        let mut session = Session::new(settings("busy"), bench);
        session.start(RunKind::Scan).unwrap();
        assert!(session.status().starts_with("RUNNING:SCAN"));
        let reply = session.process_command("RUN:START:CALIBRATE".split(':')).unwrap();
        assert_eq!(reply, "ERROR: SCAN is already running");
        assert!(matches!(session.start(RunKind::Sweep), Err(Error::Busy(kind)) if kind == "SCAN"));

        assert_eq!(session.process_command("RUN:PAUSE".split(':')), Ok("OK".into()));
        assert!(session.status().starts_with("PAUSED"));
        assert_eq!(session.process_command("RUN:CANCEL".split(':')), Ok("OK".into()));
        assert!(matches!(session.wait(), Some(Err(Error::Cancelled))));
        assert!(!lab.snapshot().unwrap().output);
        assert_eq!(session.process_command("RUN:CANCEL".split(':')), Ok("NOT RUNNING".into()));
        assert!(session.status().contains("cancelled"));
    }

    #[test]
    fn crashed_run_loses_instruments() {
        let lab = SimulatedLab::new();
        let mut bench = lab.bench(false);
        bench.diode = Box::new(|| -> std::result::Result<f64, DeviceError> {
            panic!("multimeter driver crashed")
        });
        let mut session = Session::new(settings("crash"), bench);
        session.start(RunKind::Scan).unwrap();
        assert!(matches!(session.wait(), Some(Err(Error::WorkerLost(_)))));
        assert!(session.status().contains("panicked"));
        assert!(matches!(
            session.start(RunKind::Scan),
            Err(Error::WorkerLost(_))
        ));
        assert!(!session.is_running());
    }

    #[test]
    fn settings_edits_apply_to_next_run() {
        let lab = SimulatedLab::new();
        let mut session = Session::new(settings("edit"), lab.bench(false));
        assert_eq!(session.process_command("EQ:TARGET:SET:-0.2".split(':')), Ok(String::new()));
        assert_eq!(session.pending.calibration.equalizer.target_v, -0.2);
        assert_eq!(session.process_command("RAMP:RATE:SET:25".split(':')), Ok(String::new()));
        assert_eq!(session.pending.sweep.ramp.rate(), 25.0);
        assert_eq!(session.process_command("MAXIMA:ORDER:SET:4".split(':')), Ok(String::new()));
        assert_eq!(session.process_command("MAXIMA:ORDER:GET".split(':')), Ok("4".into()));
        assert!(session.process_command("MAXIMA:ORDER:SET:0".split(':')).is_err());
        assert!(session
            .process_command("EQ:DUMP".split(':'))
            .unwrap()
            .contains("target_v = -0.2"));
        assert!(session.process_command("LASER:GET".split(':')).is_err());
        assert!(session.process_command("RUN:START:NOTHING".split(':')).is_err());
    }

    #[test]
    fn frequency_sweep_from_table() {
        let lab = SimulatedLab::new();
        let s = settings("freq");
        std::fs::create_dir_all(&s.output_dir).unwrap();
        let rows_path = s.output_dir.join("rows.dat");
        table::write_table(&rows_path, &[(9.8, 2.0), (10.2, 2.5)]).unwrap();
        let dir = s.output_dir.clone();
        let mut session = Session::new(s, lab.bench(false));
        let cmd = format!("RUN:START:FREQ_SWEEP:{}", rows_path.display());
        assert_eq!(session.process_command(cmd.split(':')), Ok("OK".into()));
        let Some(Ok(RunOutcome::Sweep { traces, tables })) = session.wait() else {
            panic!("expected two sweeps");
        };
        assert_eq!(traces.len(), 2);
        assert_eq!(tables.len(), 2);
        assert_eq!(lab.snapshot().unwrap().field_mt, 0.0);
        std::fs::remove_dir_all(dir).unwrap();
    }
}
