//! Two-column tables: scan traces, calibration anchors, equalised `(frequency, power)` pairs.
//! Stored as one `x<TAB>y` row per line.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Local;
use log::info;

use crate::{Error, Result};

const TIMESTAMP_FORMAT: &str = "%d-%m-%y_%H-%M-%S";

/// `<kind>_<day-month-year_hour-minute-second>.dat`, local time.
#[must_use]
pub fn timestamped_name(kind: &str) -> String {
    format!("{kind}_{}.dat", Local::now().format(TIMESTAMP_FORMAT))
}

/// Write `rows` to a new file at `path`. An existing file is never overwritten.
/// # Errors
/// `Io` if the file exists or cannot be written.
pub fn write_table(path: &Path, rows: &[(f64, f64)]) -> Result<()> {
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let mut out = BufWriter::new(file);
    for (x, y) in rows {
        writeln!(out, "{x}\t{y}")?;
    }
    out.flush()?;
    info!("wrote {} rows to {}", rows.len(), path.display());
    Ok(())
}

/// Write `rows` to `dir/timestamped_name(kind)` and return the path.
pub fn save(dir: &Path, kind: &str, rows: &[(f64, f64)]) -> Result<PathBuf> {
    let path = dir.join(timestamped_name(kind));
    write_table(&path, rows)?;
    Ok(path)
}

/// Parse a table. Blank lines and lines starting with `#` are skipped; columns may be separated
/// by any whitespace.
/// # Errors
/// `Io` on read failure, `InvalidConfiguration` naming the first malformed line.
pub fn read_table(path: &Path) -> Result<Vec<(f64, f64)>> {
    let text = fs::read_to_string(path)?;
    parse_rows(&text).map_err(|line| {
        Error::invalid(format!(
            "{}:{line}: expected two numeric columns",
            path.display()
        ))
    })
}

fn parse_rows(text: &str) -> std::result::Result<Vec<(f64, f64)>, usize> {
    let mut rows = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut cols = line.split_whitespace().map(str::parse::<f64>);
        match (cols.next(), cols.next(), cols.next()) {
            (Some(Ok(x)), Some(Ok(y)), None) => rows.push((x, y)),
            _ => return Err(n + 1),
        }
    }
    Ok(rows)
}
