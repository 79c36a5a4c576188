//! System-wide physical memory readings.

use std::fs;
use std::io;
use std::path::PathBuf;

use crate::plat::PlatFailed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Memory {
    pub total_physical_bytes: usize,
    pub available_bytes: usize,
}

impl Memory {
    pub fn used_fraction(&self) -> f64 {
        1.0 - (self.available_bytes as f64 / self.total_physical_bytes as f64)
    }
}

/// A fresh snapshot on every call. Implementations must not cache: other processes change the
/// answer between two reads.
pub trait MemoryStatus {
    fn read(&mut self) -> Result<Memory, PlatFailed>;
}

/// Reads `MemTotal` and `MemAvailable` out of `/proc/meminfo`.
#[derive(Debug, Clone)]
pub struct ProcMeminfo {
    path: PathBuf,
}

impl ProcMeminfo {
    pub fn new() -> Self {
        Self { path: PathBuf::from("/proc/meminfo") }
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcMeminfo {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStatus for ProcMeminfo {
    fn read(&mut self) -> Result<Memory, PlatFailed> {
        let contents = fs::read_to_string(&self.path).map_err(|e| PlatFailed::new("read /proc/meminfo", e))?;
        parse_meminfo(&contents).ok_or_else(|| {
            PlatFailed::new(
                "parse /proc/meminfo",
                io::Error::new(io::ErrorKind::InvalidData, "MemTotal or MemAvailable missing"),
            )
        })
    }
}

/// Pull the two fields we need out of `/proc/meminfo` text. Values there are in kB.
pub fn parse_meminfo(contents: &str) -> Option<Memory> {
    let mut total = None;
    let mut available = None;

    for line in contents.lines() {
        let line = line.trim_start();
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = Some(kb_field(rest)?);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = Some(kb_field(rest)?);
        }
    }

    let total_physical_bytes = total?;
    if total_physical_bytes == 0 {
        return None;
    }
    Some(Memory { total_physical_bytes, available_bytes: available? })
}

fn kb_field(rest: &str) -> Option<usize> {
    let kb = rest.split_whitespace().next()?.parse::<u64>().ok()?;
    usize::try_from(kb.checked_mul(1024)?).ok()
}
