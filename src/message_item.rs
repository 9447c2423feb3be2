use chrono::{DateTime, Local, TimeDelta};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Message priority. Lower values play first; 1 is the top tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub u8);

impl Priority {
    pub const TOP: Priority = Priority(1);

    /// Priority 0 is not a valid tier.
    pub fn is_valid(self) -> bool {
        self.0 >= 1
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Convert an interval in minutes to whole seconds. Non-positive (or NaN)
/// intervals yield 0, meaning the message does not repeat.
pub fn interval_seconds_for(interval_minutes: f64) -> i64 {
    if interval_minutes > 0.0 {
        (interval_minutes * 60.0) as i64
    } else {
        0
    }
}

/// One schedulable message in the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
    /// File name inside the messages folder. Unique within a queue.
    pub filename: String,
    pub priority: Priority,
    /// Repeat interval in minutes; fractional values express seconds.
    pub interval: f64,
    /// Canonical scheduling unit derived from `interval`.
    pub interval_seconds: i64,
    /// When the item becomes eligible. Only meaningful while active.
    pub next_play_time: DateTime<Local>,
    /// When the item last finished, fade tail included.
    pub end_time: Option<DateTime<Local>>,
    pub last_played: Option<DateTime<Local>>,
    /// True while the item waits for its tier's turn (or is locked for playback).
    pub is_pending: bool,
}

impl QueueItem {
    /// New item with no history. Tiers below the top start pending.
    pub fn new(filename: String, priority: Priority, interval: f64, now: DateTime<Local>) -> Self {
        QueueItem {
            filename,
            priority,
            interval,
            interval_seconds: interval_seconds_for(interval),
            next_play_time: now,
            end_time: None,
            last_played: None,
            is_pending: priority > Priority::TOP,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.is_pending
    }

    /// True if the message plays once and does not repeat.
    pub fn is_single_shot(&self) -> bool {
        self.interval_seconds <= 0
    }

    /// A single-shot message that already played. It stays queued but is
    /// never selected or reactivated again.
    pub fn is_spent(&self) -> bool {
        self.is_single_shot() && self.last_played.is_some()
    }

    pub fn interval_delta(&self) -> TimeDelta {
        TimeDelta::seconds(self.interval_seconds.max(0))
    }

    /// Set `next_play_time` one interval after `at`.
    pub fn schedule_after(&mut self, at: DateTime<Local>) {
        self.next_play_time = at + self.interval_delta();
    }

    pub fn is_due(&self, now: DateTime<Local>) -> bool {
        self.next_play_time <= now
    }

    /// Time left before the item becomes eligible (negative once overdue).
    pub fn time_until_play(&self, now: DateTime<Local>) -> TimeDelta {
        self.next_play_time - now
    }

    /// Whole seconds until play, floored at zero. Used for countdown columns.
    pub fn countdown_secs(&self, now: DateTime<Local>) -> i64 {
        self.time_until_play(now).num_seconds().max(0)
    }

    pub fn next_play_time_display(&self) -> String {
        self.next_play_time.format("%H:%M:%S").to_string()
    }

    /// "45 sec" under a minute, otherwise "2.5 min".
    pub fn interval_display(&self) -> String {
        if self.interval_seconds <= 0 {
            "once".to_string()
        } else if self.interval < 1.0 {
            format!("{} sec", self.interval_seconds)
        } else {
            format!("{:.1} min", self.interval)
        }
    }

    /// Scheduling order: priority, then `next_play_time`, then the item that
    /// waited longest since its last play (never-played first).
    pub fn cmp_schedule(&self, other: &QueueItem) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.next_play_time.cmp(&other.next_play_time))
            .then(self.last_played.cmp(&other.last_played))
    }
}
