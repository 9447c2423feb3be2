//! Queue persistence and restart detection.
//!
//! The snapshot is a JSON document next to a *session marker* side file. The
//! marker is written when a session begins and removed by a shutdown save, so
//! on load its presence tells a live reload apart from a fresh process start.

use crate::error::Result;
use crate::message_item::{interval_seconds_for, Priority, QueueItem};
use chrono::{DateTime, Local};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const SNAPSHOT_VERSION: u32 = 2;

/// Snapshots older than this are treated as coming from a previous run.
pub const RESTART_GAP_SECS: i64 = 60;

/// Why a load was treated as a process restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// The previous process saved with the shutdown flag.
    ShutdownSave,
    /// No session marker, so the previous session never began or was cleaned up.
    MissingSessionMarker,
    /// The snapshot is older than [`RESTART_GAP_SECS`].
    StaleSnapshot { gap_secs: i64 },
    /// Bare array from before snapshots carried metadata.
    LegacyFormat,
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartReason::ShutdownSave => write!(f, "clean shutdown"),
            RestartReason::MissingSessionMarker => write!(f, "no session marker"),
            RestartReason::StaleSnapshot { gap_secs } => write!(f, "snapshot {}s old", gap_secs),
            RestartReason::LegacyFormat => write!(f, "legacy format"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    /// Nothing usable on disk.
    Fresh,
    /// Same session; state restored verbatim.
    LiveReload,
    Restart(RestartReason),
}

#[derive(Debug)]
pub struct LoadedQueue {
    pub items: Vec<QueueItem>,
    pub kind: LoadKind,
}

impl LoadedQueue {
    fn empty() -> Self {
        LoadedQueue {
            items: Vec::new(),
            kind: LoadKind::Fresh,
        }
    }
}

/// Decide restart semantics. Checks run in order: shutdown flag, session
/// marker, then the save gap.
pub fn detect_restart(
    is_shutdown_save: bool,
    marker_present: bool,
    saved_at: DateTime<Local>,
    now: DateTime<Local>,
) -> LoadKind {
    if is_shutdown_save {
        return LoadKind::Restart(RestartReason::ShutdownSave);
    }
    if !marker_present {
        return LoadKind::Restart(RestartReason::MissingSessionMarker);
    }
    let gap_secs = (now - saved_at).num_seconds();
    if gap_secs > RESTART_GAP_SECS {
        return LoadKind::Restart(RestartReason::StaleSnapshot { gap_secs });
    }
    LoadKind::LiveReload
}

/// Full reschedule after a restart: every item counts its interval from
/// `now`, only the top tier is active and play history is dropped.
pub fn reset_for_restart(items: &mut [QueueItem], now: DateTime<Local>) {
    for item in items.iter_mut() {
        item.schedule_after(now);
        item.is_pending = item.priority > Priority::TOP;
        item.last_played = None;
        item.end_time = None;
    }
}

// ── On-disk representation ──────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct StoredItem {
    filename: String,
    priority: Priority,
    interval: f64,
    #[serde(default)]
    interval_seconds: Option<i64>,
    #[serde(with = "iso_time")]
    next_play_time: DateTime<Local>,
    #[serde(default)]
    is_pending: bool,
    #[serde(default, with = "iso_time::option", skip_serializing_if = "Option::is_none")]
    end_time: Option<DateTime<Local>>,
    #[serde(default, with = "iso_time::option", skip_serializing_if = "Option::is_none")]
    last_played: Option<DateTime<Local>>,
}

impl StoredItem {
    fn from_item(item: &QueueItem) -> Self {
        StoredItem {
            filename: item.filename.clone(),
            priority: item.priority,
            interval: item.interval,
            interval_seconds: Some(item.interval_seconds),
            next_play_time: item.next_play_time,
            is_pending: item.is_pending,
            end_time: item.end_time,
            last_played: item.last_played,
        }
    }

    fn into_item(self) -> QueueItem {
        QueueItem {
            interval_seconds: self
                .interval_seconds
                .map(|s| s.max(0))
                .unwrap_or_else(|| interval_seconds_for(self.interval)),
            filename: self.filename,
            priority: self.priority,
            interval: self.interval,
            next_play_time: self.next_play_time,
            end_time: self.end_time,
            last_played: self.last_played,
            is_pending: self.is_pending,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    #[serde(with = "iso_time")]
    save_timestamp: DateTime<Local>,
    #[serde(default)]
    is_shutdown_save: bool,
    messages: Vec<StoredItem>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SnapshotFile {
    Current(Snapshot),
    Legacy(Vec<StoredItem>),
}

// ── Serializer ──────────────────────────────────────────────────────────────

pub struct QueueSerializer {
    queue_file_path: PathBuf,
    marker_path: PathBuf,
}

impl QueueSerializer {
    pub fn new(queue_file_path: &Path) -> Self {
        QueueSerializer {
            queue_file_path: queue_file_path.to_path_buf(),
            marker_path: queue_file_path.with_extension("session"),
        }
    }

    pub fn marker_path(&self) -> &Path {
        &self.marker_path
    }

    pub fn has_session_marker(&self) -> bool {
        self.marker_path.exists()
    }

    /// Write the session marker. Its content is informational only.
    pub fn begin_session(&self, now: DateTime<Local>) -> Result<()> {
        ensure_parent(&self.marker_path)?;
        fs::write(&self.marker_path, now.to_rfc3339())?;
        Ok(())
    }

    /// Remove the session marker. A missing marker is not an error.
    pub fn end_session(&self) -> Result<()> {
        match fs::remove_file(&self.marker_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the queue. A shutdown save also ends the session so the next
    /// load reschedules everything.
    pub fn save(&self, items: &[QueueItem], is_shutdown: bool, now: DateTime<Local>) -> Result<()> {
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            save_timestamp: now,
            is_shutdown_save: is_shutdown,
            messages: items.iter().map(StoredItem::from_item).collect(),
        };
        let json = serde_json::to_string_pretty(&snapshot)?;
        ensure_parent(&self.queue_file_path)?;
        fs::write(&self.queue_file_path, json)?;
        if is_shutdown {
            self.end_session()?;
        }
        Ok(())
    }

    /// Load the queue, applying restart semantics. Unreadable or corrupt
    /// files yield an empty queue.
    pub fn load(&self, now: DateTime<Local>) -> LoadedQueue {
        if !self.queue_file_path.exists() {
            info!("No saved queue at {}", self.queue_file_path.display());
            return LoadedQueue::empty();
        }
        let data = match fs::read_to_string(&self.queue_file_path) {
            Ok(data) => data,
            Err(e) => {
                warn!("Could not read queue file, starting empty: {}", e);
                return LoadedQueue::empty();
            }
        };
        let parsed: SnapshotFile = match serde_json::from_str(&data) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Corrupt queue file, starting empty: {}", e);
                return LoadedQueue::empty();
            }
        };

        let marker_present = self.has_session_marker();
        let (stored, kind) = match parsed {
            SnapshotFile::Current(snapshot) => {
                let kind = detect_restart(
                    snapshot.is_shutdown_save,
                    marker_present,
                    snapshot.save_timestamp,
                    now,
                );
                (snapshot.messages, kind)
            }
            SnapshotFile::Legacy(items) => (items, LoadKind::Restart(RestartReason::LegacyFormat)),
        };

        let mut items: Vec<QueueItem> = stored.into_iter().map(StoredItem::into_item).collect();
        match kind {
            LoadKind::Restart(reason) => {
                info!(
                    "Restart detected ({}), rescheduling {} message(s)",
                    reason,
                    items.len()
                );
                reset_for_restart(&mut items, now);
            }
            _ => info!("Live reload, restored {} message(s) as saved", items.len()),
        }
        LoadedQueue { items, kind }
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// ISO-8601 timestamps. Written as RFC 3339; naive timestamps from older
/// files are read as local time.
mod iso_time {
    use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn parse(raw: &str) -> Result<DateTime<Local>, String> {
        if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
            return Ok(t.with_timezone(&Local));
        }
        let naive: NaiveDateTime = raw
            .parse()
            .map_err(|e| format!("invalid timestamp '{}': {}", raw, e))?;
        Local
            .from_local_datetime(&naive)
            .earliest()
            .ok_or_else(|| format!("timestamp '{}' does not exist in local time", raw))
    }

    pub fn serialize<S: Serializer>(t: &DateTime<Local>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Local>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).map_err(de::Error::custom)
    }

    pub mod option {
        use chrono::{DateTime, Local};
        use serde::{de, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(t: &Option<DateTime<Local>>, s: S) -> Result<S::Ok, S::Error> {
            match t {
                Some(t) => s.serialize_str(&t.to_rfc3339()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Local>>, D::Error> {
            match Option::<String>::deserialize(d)? {
                Some(raw) => super::parse(&raw).map(Some).map_err(de::Error::custom),
                None => Ok(None),
            }
        }
    }
}
