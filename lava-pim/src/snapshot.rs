//! The snapshot file
//!
//! First line is the PIM's refresh port, then one line per process. A new
//! table is written to `<path>.<pid>` and renamed over the old one, so a
//! reader opening `path` always gets a complete table.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error};

use crate::error::{PimError, Result};
use crate::process::ProcessRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub port: u16,
    pub records: Vec<ProcessRecord>,
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}", std::process::id()));
    PathBuf::from(name)
}

/// Atomically replace the snapshot at `path`
pub fn publish(path: &Path, port: u16, records: &[ProcessRecord]) -> Result<()> {
    let temp = temp_path(path);
    if let Err(e) = write_table(&temp, port, records) {
        error!("writing {} failed: {}", temp.display(), e);
        let _ = std::fs::remove_file(&temp);
        return Err(e);
    }
    if let Err(e) = std::fs::rename(&temp, path) {
        error!("rename {} to {} failed: {}", temp.display(), path.display(), e);
        let _ = std::fs::remove_file(&temp);
        return Err(e.into());
    }
    debug!("process table of {} entries published to {}", records.len(), path.display());
    Ok(())
}

fn write_table(temp: &Path, port: u16, records: &[ProcessRecord]) -> Result<()> {
    let mut out = BufWriter::new(File::create(temp)?);
    writeln!(out, "{port}")?;
    for record in records {
        writeln!(out, "{}", record.to_line())?;
    }
    out.flush()?;
    Ok(())
}

pub fn read_snapshot(path: &Path) -> Result<Snapshot> {
    let content = std::fs::read_to_string(path)?;
    parse_snapshot(&content).map_err(|reason| PimError::Snapshot {
        path: path.display().to_string(),
        reason,
    })
}

fn parse_snapshot(content: &str) -> std::result::Result<Snapshot, String> {
    let mut lines = content.lines();
    let port = lines
        .next()
        .ok_or("empty file")?
        .trim()
        .parse::<u16>()
        .map_err(|e| format!("bad port line: {e}"))?;

    let mut records = Vec::new();
    for (n, line) in lines.enumerate().filter(|(_, l)| !l.trim().is_empty()) {
        let record = ProcessRecord::parse_line(line).ok_or_else(|| format!("bad record on line {}", n + 2))?;
        records.push(record);
    }
    Ok(Snapshot { port, records })
}
