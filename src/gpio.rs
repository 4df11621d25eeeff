// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::time::Instant;

// ============================================================================
// SignalLine Trait
// ============================================================================

/// Out-of-band select line. `false` drives the line low (peripheral selected),
/// `true` drives it high (released).
pub trait SignalLine {
    fn set(&mut self, high: bool) -> std::io::Result<()>;
}

// ============================================================================
// Sysfs GPIO Implementation
// ============================================================================

/// GPIO exported through sysfs. The value file is opened, written and closed
/// on every call; no descriptor is held between calls.
pub struct SysfsGpio {
    value_path: PathBuf,
}

impl SysfsGpio {
    pub fn new(root: &Path, line: u32) -> Self {
        SysfsGpio {
            value_path: root.join(format!("gpio{}", line)).join("value"),
        }
    }

    pub fn value_path(&self) -> &Path {
        &self.value_path
    }
}

impl SignalLine for SysfsGpio {
    fn set(&mut self, high: bool) -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).open(&self.value_path)?;
        let written = file.write(if high { b"1" } else { b"0" })?;
        if written != 1 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("short write to {}", self.value_path.display()),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Mock Signal Line for Testing
// ============================================================================

#[cfg(test)]
pub struct MockSignalLine {
    // Every level successfully driven, in order
    pub levels: Vec<bool>,
    // When each successful set happened
    pub set_times: Vec<Instant>,
    // Zero-based call indices that fail
    fail_on: Vec<usize>,
    calls: usize,
}

#[cfg(test)]
impl MockSignalLine {
    pub fn new() -> Self {
        MockSignalLine::failing_on(&[])
    }

    pub fn failing_on(calls: &[usize]) -> Self {
        MockSignalLine {
            levels: Vec::new(),
            set_times: Vec::new(),
            fail_on: calls.to_vec(),
            calls: 0,
        }
    }
}

#[cfg(test)]
impl SignalLine for MockSignalLine {
    fn set(&mut self, high: bool) -> std::io::Result<()> {
        let call = self.calls;
        self.calls += 1;
        if self.fail_on.contains(&call) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "Mock gpio failure",
            ));
        }
        self.levels.push(high);
        self.set_times.push(Instant::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysfs_value_path() {
        let gpio = SysfsGpio::new(Path::new("/sys/class/gpio"), 59);
        assert_eq!(gpio.value_path(), Path::new("/sys/class/gpio/gpio59/value"));
    }

    #[test]
    fn test_sysfs_writes_ascii_levels() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("gpio7")).unwrap();
        std::fs::write(root.path().join("gpio7/value"), b"").unwrap();

        let mut gpio = SysfsGpio::new(root.path(), 7);

        gpio.set(false).unwrap();
        assert_eq!(std::fs::read(gpio.value_path()).unwrap(), b"0");

        gpio.set(true).unwrap();
        assert_eq!(std::fs::read(gpio.value_path()).unwrap(), b"1");
    }

    #[test]
    fn test_sysfs_missing_line_fails() {
        let root = tempfile::tempdir().unwrap();
        let mut gpio = SysfsGpio::new(root.path(), 3);

        let err = gpio.set(true).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
