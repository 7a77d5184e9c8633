// src/schedule.rs
//! Daily active-hours window for the pollers.

use std::str::FromStr;

use chrono::{Local, Timelike};

/// `start <= hour < end`, local time. `end` may be 24.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveHours {
    pub start: u32,
    pub end: u32,
}

impl ActiveHours {
    pub fn contains_hour(&self, hour: u32) -> bool {
        if self.start <= self.end {
            self.start <= hour && hour < self.end
        } else {
            // wraps past midnight, e.g. 22-6
            hour >= self.start || hour < self.end
        }
    }

    pub fn is_active_now(&self) -> bool {
        self.contains_hour(Local::now().hour())
    }
}

impl FromStr for ActiveHours {
    type Err = String;

    /// Parses `"8-24"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (a, b) = s
            .split_once('-')
            .ok_or_else(|| format!("expected START-END, got {s:?}"))?;
        let start: u32 = a.trim().parse().map_err(|e| format!("start hour: {e}"))?;
        let end: u32 = b.trim().parse().map_err(|e| format!("end hour: {e}"))?;
        if start > 23 || end > 24 || start == end {
            return Err(format!("hours out of range: {s:?}"));
        }
        Ok(Self { start, end })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_window_is_half_open() {
        let w: ActiveHours = "8-24".parse().unwrap();
        assert!(!w.contains_hour(7));
        assert!(w.contains_hour(8));
        assert!(w.contains_hour(23));
    }

    #[test]
    fn overnight_window_wraps() {
        let w: ActiveHours = "22-6".parse().unwrap();
        assert!(w.contains_hour(23));
        assert!(w.contains_hour(0));
        assert!(!w.contains_hour(6));
        assert!(!w.contains_hour(12));
    }

    #[test]
    fn rejects_garbage() {
        assert!("8".parse::<ActiveHours>().is_err());
        assert!("25-3".parse::<ActiveHours>().is_err());
        assert!("5-5".parse::<ActiveHours>().is_err());
    }
}
