use std::fs::read_to_string;
use std::path::{Path, PathBuf};

use gethostname::gethostname;
use log::info;

use crate::band::BandPlan;
use crate::calibration::CalibrationSettings;
use crate::communications::Comms;
use crate::equalizer::{EqualizerSettings, Estimator};
use crate::ramp::RampSetup;
use crate::scan::ScanParameters;
use crate::sweep::{Direction, SweepParameters};
use crate::util::{find_file, tomlget_opt, tomlget_or, AsNumber};

/// Everything a session needs, read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub logs_port: u16,
    pub command_port: u16,
    pub output_dir: PathBuf,
    pub sweep: SweepParameters,
    /// Source `(frequency, power)` held during a single sweep; without it the source is left
    /// alone.
    pub sweep_source: Option<(f64, f64)>,
    pub calibration: CalibrationSettings,
    /// Circulator switching in front of the source, when the bench has a selector.
    pub bands: Option<BandPlan>,
    /// Simulated instruments sleep for real when set.
    pub realtime: bool,
    pub noisy: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            logs_port: 8080,
            command_port: 8081,
            output_dir: PathBuf::from("."),
            sweep: SweepParameters::default(),
            sweep_source: None,
            calibration: CalibrationSettings::default(),
            bands: None,
            realtime: true,
            noisy: true,
        }
    }
}

fn hostname() -> Result<String, String> {
    gethostname()
        .into_string()
        .map_err(|_| "failed to get hostname".to_string())
}

/// TOML integers are `i64`; anything that does not fit the setting's type is rejected rather
/// than wrapped.
fn integer<T: TryFrom<i64>>(value: i64, sec: &str, key: &str) -> Result<T, String> {
    T::try_from(value).map_err(|_| format!("{sec}:{key} = {value} is out of range"))
}

pub fn ramp_from_config(cfg: &toml::Value) -> Result<RampSetup, String> {
    let mut out = RampSetup::new();
    out.max_rate_per_step(tomlget_or!(
        cfg,
        "ramp",
        "max_rate_per_step",
        as_number,
        f64,
        100.0
    ))
    .oversample(integer(
        tomlget_or!(cfg, "ramp", "oversample", as_integer, i64, 10),
        "ramp",
        "oversample",
    )?)
    .settle_ms(tomlget_or!(cfg, "ramp", "settle_ms", as_number, f64, 100.0));
    out.validate().map_err(|e| e.to_string())?;
    Ok(out)
}

pub fn sweep_from_config(cfg: &toml::Value) -> Result<SweepParameters, String> {
    let mut out = SweepParameters::new(
        tomlget_or!(cfg, "sweep", "start", as_number, f64, 0.0),
        tomlget_or!(cfg, "sweep", "stop", as_number, f64, 500.0),
        tomlget_or!(cfg, "sweep", "step", as_number, f64, 1.0),
    );
    out.settle_ms(tomlget_or!(cfg, "sweep", "settle_ms", as_number, f64, 200.0))
        .start_settle_ms(tomlget_or!(
            cfg,
            "sweep",
            "start_settle_ms",
            as_number,
            f64,
            3000.0
        ))
        .direction(
            tomlget_or!(cfg, "sweep", "direction", as_str, "up").parse::<Direction>()?,
        );
    out.ramp = ramp_from_config(cfg)?;
    out.validate().map_err(|e| e.to_string())?;
    Ok(out)
}

pub fn scan_from_config(cfg: &toml::Value) -> Result<ScanParameters, String> {
    let mut out = ScanParameters::new(
        tomlget_or!(cfg, "scan", "start", as_number, f64, 8.0),
        tomlget_or!(cfg, "scan", "stop", as_number, f64, 14.0),
        tomlget_or!(cfg, "scan", "step", as_number, f64, 0.01),
    );
    out.settle_ms(tomlget_or!(cfg, "scan", "settle_ms", as_number, f64, 50.0))
        .power(tomlget_or!(cfg, "scan", "power", as_number, f64, 0.0));
    out.validate().map_err(|e| e.to_string())?;
    Ok(out)
}

pub fn equalizer_from_config(cfg: &toml::Value) -> Result<EqualizerSettings, String> {
    let mut out = EqualizerSettings::new();
    out.target_v = tomlget_or!(cfg, "equalizer", "target_v", as_number, f64, -0.3);
    out.threshold_v = tomlget_or!(cfg, "equalizer", "threshold_v", as_number, f64, 0.05);
    out.seed_power = tomlget_or!(cfg, "equalizer", "seed_power", as_number, f64, 1.0);
    out.probe_step = tomlget_or!(cfg, "equalizer", "probe_step", as_number, f64, 3.0);
    out.domain_fallback = tomlget_or!(cfg, "equalizer", "domain_fallback", as_number, f64, 3.0);
    out.ceiling = tomlget_or!(cfg, "equalizer", "ceiling", as_number, f64, 17.0);
    out.ceiling_fallback =
        tomlget_or!(cfg, "equalizer", "ceiling_fallback", as_number, f64, 2.0);
    out.estimator =
        tomlget_or!(cfg, "equalizer", "estimator", as_str, "sqrt_secant").parse::<Estimator>()?;
    out.idle_on_abort = tomlget_or!(cfg, "equalizer", "idle_on_abort", as_bool, bool, true);
    out.settle_ms(tomlget_or!(cfg, "equalizer", "settle_ms", as_number, f64, 50.0))
        .set_max_iterations(integer(
            tomlget_or!(cfg, "equalizer", "max_iterations", as_integer, i64, 100),
            "equalizer",
            "max_iterations",
        )?);
    out.validate().map_err(|e| e.to_string())?;
    Ok(out)
}

pub fn calibration_from_config(cfg: &toml::Value) -> Result<CalibrationSettings, String> {
    let out = CalibrationSettings {
        scan: scan_from_config(cfg)?,
        maxima_order: integer(
            tomlget_or!(cfg, "maxima", "order", as_integer, i64, 8),
            "maxima",
            "order",
        )?,
        equalizer: equalizer_from_config(cfg)?,
    };
    out.validate().map_err(|e| e.to_string())?;
    Ok(out)
}

/// `[bands] <key>` as a list of `[low, high]` pairs, `None` if the key is absent.
fn ranges(cfg: &toml::Value, key: &str) -> Result<Option<Vec<(f64, f64)>>, String> {
    let Some(list) = cfg.get("bands").and_then(|sec| sec.get(key)) else {
        return Ok(None);
    };
    let malformed = || format!("bands:{key} must be a list of [low, high] pairs");
    list.as_array()
        .ok_or_else(malformed)?
        .iter()
        .map(|pair| match pair.as_array().map(Vec::as_slice) {
            Some([low, high]) => low.as_number().zip(high.as_number()).ok_or_else(malformed),
            _ => Err(malformed()),
        })
        .collect::<Result<Vec<_>, String>>()
        .map(Some)
}

/// Circulator bands are optional: without `[bands] ranges` the source is driven directly.
pub fn bands_from_config(cfg: &toml::Value) -> Result<Option<BandPlan>, String> {
    let Some(bands) = ranges(cfg, "ranges")? else {
        return Ok(None);
    };
    let mut out = BandPlan::new(bands);
    if let Some(gaps) = ranges(cfg, "gaps")? {
        out.gaps = gaps;
    }
    out.min_ghz = tomlget_or!(cfg, "bands", "min_ghz", as_number, f64, 8.0);
    out.max_ghz = tomlget_or!(cfg, "bands", "max_ghz", as_number, f64, 40.0);
    out.validate().map_err(|e| e.to_string())?;
    Ok(Some(out))
}

/// Read every section. A `[<hostname>]` section may override `output_dir` for one machine.
pub fn settings_from_config(cfg: &toml::Value) -> Result<Settings, String> {
    let hostname = hostname()?;
    let hostname = hostname.as_str();
    let output_dir = tomlget_opt!(cfg, hostname, "output_dir", as_str)
        .unwrap_or_else(|| tomlget_or!(cfg, "general", "output_dir", as_str, "."));
    Ok(Settings {
        logs_port: integer(
            tomlget_or!(cfg, "general", "logs_port", as_integer, i64, 8080),
            "general",
            "logs_port",
        )?,
        command_port: integer(
            tomlget_or!(cfg, "general", "command_port", as_integer, i64, 8081),
            "general",
            "command_port",
        )?,
        output_dir: PathBuf::from(output_dir),
        sweep: sweep_from_config(cfg)?,
        sweep_source: tomlget_opt!(cfg, "sweep", "frequency", as_number, f64)
            .zip(tomlget_opt!(cfg, "sweep", "power", as_number, f64)),
        calibration: calibration_from_config(cfg)?,
        bands: bands_from_config(cfg)?,
        realtime: tomlget_or!(cfg, "sim", "realtime", as_bool, bool, true),
        noisy: tomlget_or!(cfg, "sim", "noisy", as_bool, bool, true),
    })
}

/// Find `file_name` (absolute, in the working directory, or next to the executable) and parse it.
pub fn load_config(file_name: &Path) -> Result<toml::Value, String> {
    let path = find_file(file_name)
        .ok_or_else(|| format!("config file {} not found", file_name.display()))?;
    info!("reading config file {}", path.display());
    let text = read_to_string(&path).map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    text.parse::<toml::Value>()
        .map_err(|e| format!("failed to parse {}: {e}", path.display()))
}

pub async fn comms_from_config(settings: &Settings) -> Result<Comms, String> {
    let mut out = Comms::new().ok_or("failed to instantiate comms struct")?;
    out.bind_sockets(settings.logs_port, settings.command_port)
        .await
        .map_err(|e| format!("error [{e}] in binding sockets"))?;
    Ok(out)
}
