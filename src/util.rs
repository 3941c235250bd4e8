use std::path::{Path, PathBuf};
use std::time::Duration;

/// Read `[$sec] $key` from a `toml::Value`, falling back to `$or` (with a warning) when the key
/// is missing or has the wrong type.
macro_rules! tomlget_or {
    ($cfg:ident, $sec:expr, $key:expr, $conv:ident, $as:ty, $or:expr) => {
        $cfg.get($sec)
            .and_then(|sec| sec.get($key))
            .map(|val| val.$conv())
            .unwrap_or_else(|| {
                log::warn!(
                    "failed to find {}:{} in config; proceeding with default {:?}",
                    $sec, $key, $or
                );
                Some($or)
            })
            .unwrap_or_else(|| {
                log::warn!(
                    "failed to convert {}:{} to {}; proceeding with default {:?}",
                    $sec,
                    $key,
                    stringify!($as),
                    $or
                );
                $or
            }) as $as
    };
    ($cfg:ident, $sec:expr, $key:expr, as_str, $or:expr) => {
        $cfg.get($sec)
            .and_then(|sec| sec.get($key))
            .map(|val| val.as_str())
            .unwrap_or_else(|| {
                log::warn!(
                    "failed to get {}:{} in config; proceeding with default {:?}",
                    $sec, $key, $or
                );
                Some($or)
            })
            .unwrap_or_else(|| {
                log::warn!(
                    "failed to convert {}:{} to string; proceeding with default {:?}",
                    $sec, $key, $or
                );
                $or
            })
    };
}

/// Like `tomlget_or!` but silent: `None` if missing or mistyped.
macro_rules! tomlget_opt {
    ($cfg:ident, $sec:expr, $key:expr, $conv:ident, $as:ty) => {
        $cfg.get($sec)
            .and_then(|sec| sec.get($key))
            .and_then(|val| val.$conv())
            .map(|val| val as $as)
    };
    ($cfg:ident, $sec:expr, $key:expr, as_str) => {
        $cfg.get($sec)
            .and_then(|sec| sec.get($key))
            .and_then(|val| val.as_str())
    };
}

/// TOML distinguishes `5` from `5.0`; configuration values that are physically real numbers
/// should accept either.
pub trait AsNumber {
    fn as_number(&self) -> Option<f64>;
}

impl AsNumber for toml::Value {
    #[allow(clippy::cast_precision_loss)]
    fn as_number(&self) -> Option<f64> {
        self.as_float()
            .or_else(|| self.as_integer().map(|x| x as f64))
    }
}

/// Milliseconds to a `Duration` with microsecond resolution, treating negative or non-finite
/// values as zero.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn duration_ms(time_ms: f64) -> Duration {
    if time_ms.is_finite() && time_ms > 0.0 {
        Duration::from_micros((time_ms * 1000.0).round() as u64)
    } else {
        Duration::ZERO
    }
}

pub fn find_file(file_name: &Path) -> Option<PathBuf> {
    if file_name.is_absolute() {
        if file_name.exists() {
            return Some(file_name.into());
        } else {
            return None;
        }
    }
    if let Ok(cwd) = std::env::current_dir() {
        if cwd.join(file_name).exists() {
            return Some(cwd.join(file_name));
        }
    }
    if let Ok(exe) = std::env::current_exe() {
        if exe.parent()?.join(file_name).exists() {
            return Some(exe.parent()?.join(file_name));
        }
    }
    None
}

pub(crate) use {tomlget_opt, tomlget_or};
