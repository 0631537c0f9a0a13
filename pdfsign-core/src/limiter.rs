// SPDX-License-Identifier: MIT
//
// PDF Sign Service: Multi-Tenant PDF Signing and Verification
// Copyright (c) 2025 PDF Sign Service Contributors
//
// https://github.com/pdfsign/pdfsign-service

//! Multi-window counting rate limiter
//!
//! A limiter is an ordered list of windows such as `2/1s, 100/1m, 2000/1h`.
//! Every window must allow a call for the call to pass; the first window that
//! refuses is reported so the caller knows how long to back off.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Interval of the "grand total" window; exhausting it is permanent
pub const TOTAL_INTERVAL: &str = "876000h";

/// One counting window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    /// Calls allowed per interval; `0` means unlimited
    pub max: u64,
    /// Interval as written in the license, e.g. `1s`, `24h`
    pub interval: String,
    /// Calls left in the current interval
    #[serde(default)]
    pub count: u64,
    /// Start of the current interval
    #[serde(default)]
    pub last_tick: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unlimited: bool,
    #[serde(skip)]
    period: Duration,
}

impl Window {
    pub fn new(max: u64, interval: &str) -> Result<Self> {
        Ok(Self {
            max,
            interval: interval.to_string(),
            count: 0,
            last_tick: None,
            unlimited: max == 0,
            period: parse_interval(interval)?,
        })
    }

    /// Length of the interval
    pub fn period(&self) -> Duration {
        self.period
    }

    /// The grand-total window cannot recover by waiting
    pub fn is_total(&self) -> bool {
        self.interval == TOTAL_INTERVAL
    }

    fn elapsed(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_tick
            .map(|tick| (now - tick).to_std().unwrap_or(Duration::ZERO))
    }

    /// Consume one call if the window allows it
    pub fn allow_at(&mut self, now: DateTime<Utc>) -> bool {
        if self.unlimited {
            return true;
        }

        let interval_over = self.elapsed(now).map_or(true, |e| e >= self.period);
        if interval_over {
            self.count = self.max - 1;
            self.last_tick = Some(now);
            return true;
        }

        if self.count > 0 {
            self.count -= 1;
            return true;
        }

        false
    }

    /// Time until the window refills
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        match self.elapsed(now) {
            Some(elapsed) => self.period.saturating_sub(elapsed),
            None => Duration::ZERO,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.remaining_at(Utc::now())
    }
}

/// Parse `<number><unit>` with units `ms`, `s`, `m`, `h`, `d`
pub fn parse_interval(text: &str) -> Result<Duration> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| Error::Config(format!("interval '{}' has no unit", text)))?;
    let (number, unit) = text.split_at(split);
    let value: u64 = number
        .parse()
        .map_err(|_| Error::Config(format!("interval '{}' has no amount", text)))?;

    let seconds = match unit {
        "ms" => return Ok(Duration::from_millis(value)),
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86_400,
        other => {
            return Err(Error::Config(format!(
                "interval '{}' has unknown unit '{}'",
                text, other
            )))
        }
    };

    if seconds == 0 {
        return Err(Error::Config(format!("interval '{}' must be positive", text)));
    }
    Ok(Duration::from_secs(seconds))
}

/// Ordered set of windows guarded by one mutex
#[derive(Debug)]
pub struct RateLimiter {
    windows: Mutex<Vec<Window>>,
    dirty: AtomicBool,
}

impl RateLimiter {
    pub fn new(windows: Vec<Window>) -> Self {
        Self {
            windows: Mutex::new(windows),
            dirty: AtomicBool::new(false),
        }
    }

    /// Check every window in order; on refusal return the offending window
    pub fn allow(&self) -> (bool, Option<Window>) {
        self.allow_at(Utc::now())
    }

    pub fn allow_at(&self, now: DateTime<Utc>) -> (bool, Option<Window>) {
        let mut windows = self.windows.lock();
        for window in windows.iter_mut() {
            if !window.allow_at(now) {
                return (false, Some(window.clone()));
            }
        }
        self.dirty.store(true, Ordering::SeqCst);
        (true, None)
    }

    /// Copy of the current counters
    pub fn snapshot(&self) -> Vec<Window> {
        self.windows.lock().clone()
    }

    /// Restore counters saved by a previous run.
    ///
    /// Saved windows are matched by `(max, interval)`; windows the current
    /// license does not define are dropped.
    pub fn restore(&self, saved: &[Window]) {
        let mut windows = self.windows.lock();
        for window in windows.iter_mut() {
            if let Some(prev) = saved
                .iter()
                .find(|s| s.max == window.max && s.interval == window.interval)
            {
                window.count = prev.count.min(window.max);
                window.last_tick = prev.last_tick;
            }
        }
    }

    /// Returns whether counters changed since the last call, clearing the flag
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::SeqCst)
    }

    /// Flag counters for the next save
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }
}
