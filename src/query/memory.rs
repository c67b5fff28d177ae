//! Query memory monitor
//!
//! Accounts the bytes a query has materialized and trips once a
//! configured ceiling is crossed. Checking is sampled: the ceiling is
//! compared every `check_rate` observations so the hot loop stays cheap.

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct MemoryMonitor {
    limit: usize,
    check_rate: u32,
    until_check: u32,
    used: usize,
}

impl MemoryMonitor {
    /// A `limit` of zero disables the ceiling entirely
    pub fn new(check_rate: u32, limit: usize) -> Self {
        let rate = check_rate.max(1);
        Self {
            limit,
            check_rate: rate,
            until_check: rate,
            used: 0,
        }
    }

    /// Account bytes; compares against the ceiling every `check_rate`
    /// observations
    pub fn observe(&mut self, bytes: usize) -> Result<()> {
        self.used += bytes;
        self.until_check -= 1;
        if self.until_check == 0 {
            self.until_check = self.check_rate;
            self.check_now()?;
        }
        Ok(())
    }

    /// Compare immediately, regardless of the sampling rate
    pub fn check_now(&self) -> Result<()> {
        if self.limit > 0 && self.used > self.limit {
            return Err(Error::OutOfMemory {
                used: self.used,
                limit: self.limit,
            });
        }
        Ok(())
    }

    pub fn set_check_rate(&mut self, rate: u32) {
        self.check_rate = rate.max(1);
        self.until_check = self.until_check.min(self.check_rate);
    }

    pub fn used(&self) -> usize {
        self.used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_disabled_limit_never_trips() {
        let mut monitor = MemoryMonitor::new(1, 0);
        for _ in 0..1000 {
            monitor.observe(usize::MAX / 2000).unwrap();
        }
    }

    #[test]
    fn test_ceiling_trips_on_check() {
        let mut monitor = MemoryMonitor::new(1, 100);
        monitor.observe(60).unwrap();
        let err = monitor.observe(60).unwrap_err();
        assert!(matches!(err, Error::OutOfMemory { used: 120, limit: 100 }));
    }

    #[test]
    fn test_check_is_sampled() {
        let mut monitor = MemoryMonitor::new(4, 100);
        // Over the ceiling, but the comparison only runs on the 4th
        // observation.
        monitor.observe(200).unwrap();
        monitor.observe(0).unwrap();
        monitor.observe(0).unwrap();
        assert!(monitor.observe(0).is_err());
    }

    #[test]
    fn test_check_now_ignores_rate() {
        let mut monitor = MemoryMonitor::new(100, 10);
        monitor.observe(50).unwrap();
        assert!(monitor.check_now().is_err());
    }
}
