//! QueueService: the authoritative set of queued messages.
//!
//! Decides admission, which priority tier is active, and which message plays
//! next. Tiers take turns: when a message finishes, the next tier (by
//! priority value, wrapping to the top) becomes active and every other tier
//! waits.

use crate::error::{Error, Result};
use crate::message_item::{Priority, QueueItem};
use crate::serializer::{LoadKind, QueueSerializer};
use chrono::{DateTime, Local};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

/// Queue shared between the playback loop and command callers.
pub type SharedQueue = Arc<Mutex<QueueService>>;

// ── Tier rotation ───────────────────────────────────────────────────────────

/// The distinct priorities that still hold a playable (non-spent) message,
/// in ascending order. Rotation moves to the next higher value and wraps to
/// the first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rotation {
    tiers: Vec<Priority>,
}

impl Rotation {
    pub fn from_items(items: &[QueueItem]) -> Self {
        let mut tiers: Vec<Priority> = items
            .iter()
            .filter(|m| !m.is_spent())
            .map(|m| m.priority)
            .collect();
        tiers.sort();
        tiers.dedup();
        Rotation { tiers }
    }

    pub fn tiers(&self) -> &[Priority] {
        &self.tiers
    }

    pub fn first(&self) -> Option<Priority> {
        self.tiers.first().copied()
    }

    /// Tier that follows `current`, wrapping around. `current` need not be
    /// present itself (its last message may have been removed or spent).
    pub fn after(&self, current: Priority) -> Option<Priority> {
        self.tiers
            .iter()
            .copied()
            .find(|t| *t > current)
            .or_else(|| self.first())
    }
}

// ── QueueService ────────────────────────────────────────────────────────────

pub struct QueueService {
    messages: Vec<QueueItem>,
    /// Filename of the message between `register_start` and `register_end`.
    currently_playing: Option<String>,
    /// Latest completion time seen, across all messages.
    last_end_time: Option<DateTime<Local>>,
    serializer: Option<QueueSerializer>,
    load_kind: LoadKind,
}

impl QueueService {
    /// A queue with no persistence.
    pub fn in_memory() -> Self {
        QueueService {
            messages: Vec::new(),
            currently_playing: None,
            last_end_time: None,
            serializer: None,
            load_kind: LoadKind::Fresh,
        }
    }

    /// Load the queue persisted at `queue_file` and begin a session there.
    pub fn open(queue_file: &Path) -> Self {
        Self::open_at(queue_file, Local::now())
    }

    pub fn open_at(queue_file: &Path, now: DateTime<Local>) -> Self {
        let serializer = QueueSerializer::new(queue_file);
        let loaded = serializer.load(now);
        if let Err(e) = serializer.begin_session(now) {
            warn!("Could not write session marker: {}", e);
        }
        let mut service = QueueService::in_memory();
        service.serializer = Some(serializer);
        service.load_kind = loaded.kind;
        service.restore(loaded.items);
        service
    }

    pub fn shared(self) -> SharedQueue {
        Arc::new(Mutex::new(self))
    }

    /// Install loaded items: first occurrence of a filename wins, then sort
    /// by priority.
    fn restore(&mut self, items: Vec<QueueItem>) {
        let mut seen = HashSet::new();
        let mut unique: Vec<QueueItem> = items
            .into_iter()
            .filter(|m| seen.insert(m.filename.clone()))
            .collect();
        unique.sort_by_key(|m| m.priority);
        self.last_end_time = unique.iter().filter_map(|m| m.end_time).max();
        self.messages = unique;

        for msg in &self.messages {
            info!(
                "  {} {}: {} (next {})",
                msg.priority,
                msg.filename,
                if msg.is_pending { "pending" } else { "active" },
                msg.next_play_time_display()
            );
        }
    }

    /// How the queue was obtained at open time.
    pub fn load_kind(&self) -> LoadKind {
        self.load_kind
    }

    // ── Admission ───────────────────────────────────────────────────────────

    pub fn add(&mut self, filename: &str, priority: Priority, interval: f64) -> Result<QueueItem> {
        self.add_at(filename, priority, interval, Local::now())
    }

    /// Queue a new message. While something plays the newcomer waits; when
    /// idle it becomes active if nothing else is, or if it outranks the
    /// active tier.
    pub fn add_at(
        &mut self,
        filename: &str,
        priority: Priority,
        interval: f64,
        now: DateTime<Local>,
    ) -> Result<QueueItem> {
        if !priority.is_valid() {
            return Err(Error::InvalidPriority(priority.0));
        }
        if self.contains(filename) {
            warn!("Message '{}' is already queued", filename);
            return Err(Error::DuplicateMessage(filename.to_string()));
        }

        let mut msg = QueueItem::new(filename.to_string(), priority, interval, now);
        let min_active = self.active_priority();

        match (&self.currently_playing, min_active) {
            (Some(playing), _) => {
                // next_play_time is set when its tier is activated.
                msg.is_pending = true;
                info!("Queued {} {} as pending ('{}' is playing)", priority, filename, playing);
            }
            (None, None) => {
                msg.is_pending = false;
                msg.schedule_after(now);
                info!("Queued {} {} as active, plays at {}", priority, filename, msg.next_play_time_display());
            }
            (None, Some(active)) if priority < active => {
                for other in self.messages.iter_mut().filter(|m| m.is_active()) {
                    other.is_pending = true;
                }
                msg.is_pending = false;
                msg.schedule_after(now);
                info!(
                    "Queued {} {} preempting {}, plays at {}",
                    priority,
                    filename,
                    active,
                    msg.next_play_time_display()
                );
            }
            (None, Some(_)) => {
                msg.is_pending = true;
                info!("Queued {} {} as pending, waiting for its turn", priority, filename);
            }
        }

        self.messages.push(msg.clone());
        self.persist();
        Ok(msg)
    }

    // ── Selection ───────────────────────────────────────────────────────────

    fn eligible_index(&self, now: DateTime<Local>) -> Option<usize> {
        self.messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_active() && !m.is_spent() && m.is_due(now))
            .min_by(|(_, a), (_, b)| a.cmp_schedule(b))
            .map(|(i, _)| i)
    }

    /// What `next_eligible` would return, without locking it.
    pub fn peek_next(&self, now: DateTime<Local>) -> Option<&QueueItem> {
        self.eligible_index(now).map(|i| &self.messages[i])
    }

    /// Pick the due active message with the best priority and mark it pending
    /// so it cannot be selected again while it plays. Returns a copy.
    pub fn next_eligible(&mut self, now: DateTime<Local>) -> Option<QueueItem> {
        let idx = self.eligible_index(now)?;
        let msg = &mut self.messages[idx];
        msg.is_pending = true;
        info!("Selected {} {}", msg.priority, msg.filename);
        Some(msg.clone())
    }

    /// Activate the first tier when idle and nothing is active, e.g. after a
    /// restart with no top-priority message. Returns the activated tier.
    pub fn resume_rotation(&mut self, now: DateTime<Local>) -> Option<Priority> {
        if self.currently_playing.is_some() {
            return None;
        }
        if self.messages.iter().any(|m| m.is_active() && !m.is_spent()) {
            return None;
        }
        let tier = Rotation::from_items(&self.messages).first()?;
        self.activate_tier(tier, now);
        info!("Rotation stalled, activated {}", tier);
        self.persist();
        Some(tier)
    }

    // ── Playback bookkeeping ────────────────────────────────────────────────

    pub fn register_start(&mut self, item: &QueueItem) {
        self.currently_playing = Some(item.filename.clone());
        info!("Playing {} {}", item.priority, item.filename);
    }

    /// Record a completion at `completed_at` (fade tail included), reschedule
    /// the message and hand the turn to the next tier.
    pub fn register_end(&mut self, item: &QueueItem, completed_at: DateTime<Local>) {
        self.last_end_time = Some(match self.last_end_time {
            Some(prev) => prev.max(completed_at),
            None => completed_at,
        });

        match self.messages.iter_mut().find(|m| m.filename == item.filename) {
            Some(msg) => {
                msg.end_time = Some(completed_at);
                msg.last_played = Some(completed_at);
                msg.is_pending = true;
                msg.schedule_after(completed_at);
                if msg.is_single_shot() {
                    info!("Finished {} {} (single shot)", msg.priority, msg.filename);
                } else {
                    info!(
                        "Finished {} {}, next at {}",
                        msg.priority,
                        msg.filename,
                        msg.next_play_time_display()
                    );
                }
            }
            None => warn!("Finished '{}' but it is no longer queued", item.filename),
        }
        self.currently_playing = None;

        match Rotation::from_items(&self.messages).after(item.priority) {
            Some(next) => {
                let base = self.last_end_time.unwrap_or(completed_at);
                self.activate_tier(next, base);
                info!("Rotation advanced to {}", next);
            }
            None => debug!("No playable messages left to rotate to"),
        }
        self.persist();
    }

    /// Playback could not start. Clear the playing marker and re-arm the
    /// message for its next slot without advancing the rotation.
    pub fn abort_start(&mut self, item: &QueueItem, now: DateTime<Local>) {
        self.currently_playing = None;
        if let Some(msg) = self.messages.iter_mut().find(|m| m.filename == item.filename) {
            msg.is_pending = false;
            msg.schedule_after(now);
            warn!(
                "Could not start {}, retrying at {}",
                msg.filename,
                msg.next_play_time_display()
            );
        }
        self.persist();
    }

    /// Undo a `register_start` whose playback never began, e.g. after a tick
    /// failed midway. Returns the released filename.
    pub fn abort_playing(&mut self, now: DateTime<Local>) -> Option<String> {
        let name = self.currently_playing.clone()?;
        match self.get(&name).cloned() {
            Some(item) => self.abort_start(&item, now),
            None => self.currently_playing = None,
        }
        Some(name)
    }

    /// Make `tier` the only active tier, each of its messages due one
    /// interval after `base`.
    fn activate_tier(&mut self, tier: Priority, base: DateTime<Local>) {
        for msg in self.messages.iter_mut() {
            if msg.priority == tier && !msg.is_spent() {
                msg.is_pending = false;
                msg.schedule_after(base);
            } else {
                msg.is_pending = true;
            }
        }
    }

    // ── Removal ─────────────────────────────────────────────────────────────

    pub fn remove(&mut self, filename: &str) -> Result<QueueItem> {
        let idx = self
            .messages
            .iter()
            .position(|m| m.filename == filename)
            .ok_or_else(|| Error::MessageNotFound(filename.to_string()))?;
        let removed = self.messages.remove(idx);
        info!("Removed {} {}", removed.priority, removed.filename);
        self.persist();
        Ok(removed)
    }

    /// Drop every message. A message on air keeps its playing marker until
    /// its end (or abort) is registered.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.last_end_time = None;
        info!("Queue cleared");
        self.persist();
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    pub fn contains(&self, filename: &str) -> bool {
        self.messages.iter().any(|m| m.filename == filename)
    }

    pub fn get(&self, filename: &str) -> Option<&QueueItem> {
        self.messages.iter().find(|m| m.filename == filename)
    }

    /// Copies of all messages sorted by priority (queue order within a tier).
    pub fn get_queue_items(&self) -> Vec<QueueItem> {
        let mut items = self.messages.clone();
        items.sort_by_key(|m| m.priority);
        items
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn currently_playing(&self) -> Option<&str> {
        self.currently_playing.as_deref()
    }

    /// Lowest priority value among active messages.
    pub fn active_priority(&self) -> Option<Priority> {
        self.messages
            .iter()
            .filter(|m| m.is_active())
            .map(|m| m.priority)
            .min()
    }

    pub fn last_end_time(&self) -> Option<DateTime<Local>> {
        self.last_end_time
    }

    pub fn log_state(&self, now: DateTime<Local>) {
        if self.messages.is_empty() {
            debug!("Queue empty");
            return;
        }
        for msg in self.get_queue_items() {
            if msg.is_active() {
                let remaining = msg.time_until_play(now).num_seconds();
                if remaining > 0 {
                    debug!("  active  {} {}: in {}s", msg.priority, msg.filename, remaining);
                } else {
                    debug!("  active  {} {}: ready", msg.priority, msg.filename);
                }
            } else {
                debug!("  pending {} {}: waiting for turn", msg.priority, msg.filename);
            }
        }
    }

    // ── Persistence ─────────────────────────────────────────────────────────

    /// Write the current state. Without a serializer this is a no-op.
    pub fn save(&self) -> Result<()> {
        match &self.serializer {
            Some(ser) => ser.save(&self.messages, false, Local::now()),
            None => Ok(()),
        }
    }

    /// Final save on clean exit; the next load will reschedule everything.
    pub fn shutdown_save(&self) -> Result<()> {
        match &self.serializer {
            Some(ser) => {
                info!("Saving queue for shutdown");
                ser.save(&self.messages, true, Local::now())
            }
            None => Ok(()),
        }
    }

    /// Drop the session marker without saving, so the next open is treated
    /// as a restart.
    pub fn end_session(&self) -> Result<()> {
        match &self.serializer {
            Some(ser) => ser.end_session(),
            None => Ok(()),
        }
    }

    fn persist(&self) {
        if let Err(e) = self.save() {
            warn!("Queue not saved, keeping in-memory state: {}", e);
        }
    }
}

impl Default for QueueService {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    fn t0() -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
    }

    fn at(secs: i64) -> DateTime<Local> {
        t0() + TimeDelta::seconds(secs)
    }

    fn active_tiers(q: &QueueService) -> Vec<Priority> {
        let mut tiers: Vec<Priority> = q
            .get_queue_items()
            .iter()
            .filter(|m| m.is_active())
            .map(|m| m.priority)
            .collect();
        tiers.dedup();
        tiers
    }

    #[test]
    fn rotation_skips_gaps_and_wraps() {
        let items = vec![
            QueueItem::new("a".into(), Priority(1), 1.0, t0()),
            QueueItem::new("c".into(), Priority(3), 1.0, t0()),
            QueueItem::new("c2".into(), Priority(3), 1.0, t0()),
        ];
        let rot = Rotation::from_items(&items);
        assert_eq!(rot.tiers(), &[Priority(1), Priority(3)]);
        assert_eq!(rot.after(Priority(1)), Some(Priority(3)));
        assert_eq!(rot.after(Priority(3)), Some(Priority(1)));
        assert_eq!(rot.after(Priority(2)), Some(Priority(3)));
        assert_eq!(Rotation::from_items(&[]).after(Priority(1)), None);
    }

    #[test]
    fn first_message_becomes_active() {
        let mut q = QueueService::in_memory();
        let item = q.add_at("a.mp3", Priority(3), 0.1, t0()).unwrap();
        assert!(item.is_active());
        assert_eq!(item.next_play_time, at(6));
    }

    #[test]
    fn duplicate_filename_rejected() {
        let mut q = QueueService::in_memory();
        q.add_at("a.mp3", Priority(1), 1.0, t0()).unwrap();
        let err = q.add_at("a.mp3", Priority(2), 5.0, t0()).unwrap_err();
        assert!(matches!(err, Error::DuplicateMessage(ref f) if f == "a.mp3"));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn zero_priority_rejected() {
        let mut q = QueueService::in_memory();
        assert!(matches!(
            q.add_at("a.mp3", Priority(0), 1.0, t0()),
            Err(Error::InvalidPriority(0))
        ));
        assert!(q.is_empty());
    }

    #[test]
    fn higher_priority_preempts_active_tier() {
        let mut q = QueueService::in_memory();
        q.add_at("low.mp3", Priority(3), 1.0, t0()).unwrap();
        let top = q.add_at("top.mp3", Priority(1), 0.5, at(10)).unwrap();
        assert!(top.is_active());
        assert_eq!(top.next_play_time, at(40));
        assert!(q.get("low.mp3").unwrap().is_pending);
        assert_eq!(active_tiers(&q), vec![Priority(1)]);
    }

    #[test]
    fn lower_or_equal_priority_waits() {
        let mut q = QueueService::in_memory();
        q.add_at("a.mp3", Priority(2), 1.0, t0()).unwrap();
        let same = q.add_at("b.mp3", Priority(2), 1.0, t0()).unwrap();
        let lower = q.add_at("c.mp3", Priority(4), 1.0, t0()).unwrap();
        assert!(same.is_pending);
        assert!(lower.is_pending);
        assert!(q.get("a.mp3").unwrap().is_active());
    }

    #[test]
    fn add_while_playing_is_always_pending() {
        let mut q = QueueService::in_memory();
        q.add_at("a.mp3", Priority(2), 0.1, t0()).unwrap();
        let picked = q.next_eligible(at(6)).unwrap();
        q.register_start(&picked);

        let urgent = q.add_at("urgent.mp3", Priority(1), 1.0, at(7)).unwrap();
        assert!(urgent.is_pending);
        assert_eq!(q.currently_playing(), Some("a.mp3"));
    }

    #[test]
    fn next_eligible_waits_for_due_time() {
        let mut q = QueueService::in_memory();
        q.add_at("a.mp3", Priority(1), 0.1, t0()).unwrap();
        assert!(q.next_eligible(at(5)).is_none());
        assert_eq!(q.next_eligible(at(6)).unwrap().filename, "a.mp3");
    }

    #[test]
    fn next_eligible_locks_winner() {
        let mut q = QueueService::in_memory();
        q.add_at("a.mp3", Priority(1), 0.1, t0()).unwrap();
        assert!(q.next_eligible(at(10)).is_some());
        assert!(q.next_eligible(at(11)).is_none());
        assert!(q.get("a.mp3").unwrap().is_pending);
    }

    #[test]
    fn next_eligible_prefers_earliest_then_never_played() {
        let mut q = QueueService::in_memory();
        q.add_at("a.mp3", Priority(1), 0.5, t0()).unwrap();
        q.add_at("b.mp3", Priority(1), 0.5, t0()).unwrap();
        q.add_at("c.mp3", Priority(1), 0.5, t0()).unwrap();
        // Make all three tier-1 messages active and due at the same instant.
        q.activate_tier(Priority(1), t0());
        q.messages[0].last_played = Some(t0());

        let first = q.next_eligible(at(30)).unwrap();
        assert_eq!(first.filename, "b.mp3");
        assert_eq!(q.peek_next(at(30)).unwrap().filename, "c.mp3");
    }

    #[test]
    fn empty_queue_yields_nothing() {
        let mut q = QueueService::in_memory();
        assert!(q.next_eligible(t0()).is_none());
        assert!(q.peek_next(t0()).is_none());
        assert!(q.resume_rotation(t0()).is_none());
        assert!(q.active_priority().is_none());
    }

    #[test]
    fn register_end_reschedules_from_completion() {
        let mut q = QueueService::in_memory();
        q.add_at("a.mp3", Priority(1), 0.1, t0()).unwrap();
        q.add_at("b.mp3", Priority(2), 0.25, t0()).unwrap();
        let a = q.next_eligible(at(6)).unwrap();
        q.register_start(&a);
        q.register_end(&a, at(8));

        let a = q.get("a.mp3").unwrap();
        assert_eq!(a.next_play_time, at(14));
        assert_eq!(a.end_time, Some(at(8)));
        assert_eq!(a.last_played, Some(at(8)));
        assert!(a.is_pending);

        let b = q.get("b.mp3").unwrap();
        assert!(b.is_active());
        assert_eq!(b.next_play_time, at(8 + 15));
        assert!(q.currently_playing().is_none());
    }

    #[test]
    fn single_tier_wraps_back_to_itself() {
        let mut q = QueueService::in_memory();
        q.add_at("a.mp3", Priority(1), 0.1, t0()).unwrap();
        let a = q.next_eligible(at(6)).unwrap();
        q.register_start(&a);
        q.register_end(&a, at(8));
        let a = q.get("a.mp3").unwrap();
        assert!(a.is_active());
        assert_eq!(a.next_play_time, at(14));
    }

    #[test]
    fn tiers_cycle_in_order() {
        let mut q = QueueService::in_memory();
        q.add_at("p1.mp3", Priority(1), 0.1, t0()).unwrap();
        q.add_at("p2.mp3", Priority(2), 0.1, t0()).unwrap();
        q.add_at("p3.mp3", Priority(3), 0.1, t0()).unwrap();

        let mut visited = Vec::new();
        let mut clock = 0;
        for _ in 0..4 {
            clock += 10;
            let msg = q.next_eligible(at(clock)).unwrap();
            visited.push(msg.priority.0);
            q.register_start(&msg);
            clock += 2;
            q.register_end(&msg, at(clock));
            assert_eq!(active_tiers(&q).len(), 1);
        }
        assert_eq!(visited, vec![1, 2, 3, 1]);
    }

    #[test]
    fn activation_uses_latest_global_end() {
        let mut q = QueueService::in_memory();
        q.add_at("p1.mp3", Priority(1), 0.1, t0()).unwrap();
        q.add_at("p2.mp3", Priority(2), 0.5, t0()).unwrap();
        q.last_end_time = Some(at(100));

        let p1 = q.next_eligible(at(6)).unwrap();
        q.register_start(&p1);
        // Completion reported earlier than a previously seen end.
        q.register_end(&p1, at(50));
        assert_eq!(q.get("p1.mp3").unwrap().next_play_time, at(56));
        assert_eq!(q.get("p2.mp3").unwrap().next_play_time, at(130));
        assert_eq!(q.last_end_time(), Some(at(100)));
    }

    #[test]
    fn single_shot_is_spent_after_play() {
        let mut q = QueueService::in_memory();
        q.add_at("once.mp3", Priority(1), 0.0, t0()).unwrap();
        q.add_at("loop.mp3", Priority(2), 0.1, t0()).unwrap();

        let once = q.next_eligible(t0()).unwrap();
        assert_eq!(once.filename, "once.mp3");
        q.register_start(&once);
        q.register_end(&once, at(3));

        assert!(q.get("once.mp3").unwrap().is_spent());
        let next = q.next_eligible(at(9)).unwrap();
        assert_eq!(next.filename, "loop.mp3");
        q.register_start(&next);
        q.register_end(&next, at(11));

        // The rotation skips the spent tier and stays on tier 2.
        assert!(q.get("once.mp3").unwrap().is_pending);
        assert!(q.get("loop.mp3").unwrap().is_active());
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn register_end_after_removal_still_rotates() {
        let mut q = QueueService::in_memory();
        q.add_at("a.mp3", Priority(1), 0.1, t0()).unwrap();
        q.add_at("b.mp3", Priority(2), 0.1, t0()).unwrap();
        let a = q.next_eligible(at(6)).unwrap();
        q.register_start(&a);
        q.remove("a.mp3").unwrap();
        q.register_end(&a, at(8));
        assert!(q.currently_playing().is_none());
        assert!(q.get("b.mp3").unwrap().is_active());
    }

    #[test]
    fn abort_start_rearms_without_rotating() {
        let mut q = QueueService::in_memory();
        q.add_at("a.mp3", Priority(1), 0.1, t0()).unwrap();
        q.add_at("b.mp3", Priority(2), 0.1, t0()).unwrap();
        let a = q.next_eligible(at(6)).unwrap();
        q.register_start(&a);
        q.abort_start(&a, at(7));

        assert!(q.currently_playing().is_none());
        let a = q.get("a.mp3").unwrap();
        assert!(a.is_active());
        assert_eq!(a.next_play_time, at(13));
        assert!(q.get("b.mp3").unwrap().is_pending);
    }

    #[test]
    fn abort_playing_releases_marker() {
        let mut q = QueueService::in_memory();
        assert_eq!(q.abort_playing(t0()), None);
        q.add_at("a.mp3", Priority(1), 0.1, t0()).unwrap();
        let a = q.next_eligible(at(6)).unwrap();
        q.register_start(&a);
        assert_eq!(q.abort_playing(at(7)).as_deref(), Some("a.mp3"));
        assert!(q.currently_playing().is_none());
        assert!(q.get("a.mp3").unwrap().is_active());
    }

    #[test]
    fn resume_rotation_recovers_stalled_queue() {
        let mut q = QueueService::in_memory();
        q.add_at("a.mp3", Priority(2), 0.1, t0()).unwrap();
        q.add_at("b.mp3", Priority(3), 0.1, t0()).unwrap();
        for m in q.messages.iter_mut() {
            m.is_pending = true;
        }
        assert_eq!(q.resume_rotation(at(20)), Some(Priority(2)));
        assert_eq!(q.get("a.mp3").unwrap().next_play_time, at(26));
        // Already active: nothing to do.
        assert_eq!(q.resume_rotation(at(21)), None);
    }

    #[test]
    fn resume_rotation_idle_while_playing() {
        let mut q = QueueService::in_memory();
        q.add_at("a.mp3", Priority(1), 0.1, t0()).unwrap();
        let a = q.next_eligible(at(6)).unwrap();
        q.register_start(&a);
        assert_eq!(q.resume_rotation(at(7)), None);
    }

    #[test]
    fn remove_and_clear() {
        let mut q = QueueService::in_memory();
        q.add_at("a.mp3", Priority(1), 1.0, t0()).unwrap();
        q.add_at("b.mp3", Priority(2), 1.0, t0()).unwrap();
        assert_eq!(q.remove("a.mp3").unwrap().filename, "a.mp3");
        assert!(matches!(q.remove("a.mp3"), Err(Error::MessageNotFound(_))));

        q.last_end_time = Some(t0());
        q.clear();
        assert!(q.is_empty());
        assert!(q.last_end_time().is_none());
        assert!(q.currently_playing().is_none());
    }

    #[test]
    fn clear_during_playback_keeps_newcomers_pending() {
        let mut q = QueueService::in_memory();
        q.add_at("a.mp3", Priority(1), 1.0, t0()).unwrap();
        let a = q.next_eligible(t0() + TimeDelta::seconds(61)).unwrap();
        q.register_start(&a);

        q.clear();
        assert_eq!(q.currently_playing(), Some("a.mp3"));
        let b = q.add_at("b.mp3", Priority(1), 1.0, t0() + TimeDelta::seconds(62)).unwrap();
        assert!(b.is_pending);

        q.register_end(&a, t0() + TimeDelta::seconds(90));
        assert!(q.currently_playing().is_none());
        assert!(q.get("b.mp3").unwrap().is_active());
    }

    #[test]
    fn queue_items_sorted_by_priority() {
        let mut q = QueueService::in_memory();
        q.add_at("c.mp3", Priority(3), 1.0, t0()).unwrap();
        q.add_at("a.mp3", Priority(1), 1.0, t0()).unwrap();
        q.add_at("b.mp3", Priority(2), 1.0, t0()).unwrap();
        let names: Vec<String> = q.get_queue_items().into_iter().map(|m| m.filename).collect();
        assert_eq!(names, vec!["a.mp3", "b.mp3", "c.mp3"]);
    }

    #[test]
    fn open_reloads_live_state_and_drops_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue_state.json");
        let ser = QueueSerializer::new(&path);
        ser.begin_session(t0()).unwrap();
        let a = QueueItem::new("a.mp3".into(), Priority(2), 1.0, t0());
        let mut dup = QueueItem::new("a.mp3".into(), Priority(1), 9.0, t0());
        dup.is_pending = false;
        let mut b = QueueItem::new("b.mp3".into(), Priority(1), 1.0, t0());
        b.end_time = Some(at(-5));
        ser.save(&[a, dup, b], false, t0()).unwrap();

        let q = QueueService::open_at(&path, at(3));
        assert_eq!(q.load_kind(), LoadKind::LiveReload);
        assert_eq!(q.len(), 2);
        let items = q.get_queue_items();
        assert_eq!(items[0].filename, "b.mp3");
        assert_eq!(items[1].priority, Priority(2));
        assert_eq!(q.last_end_time(), Some(at(-5)));
        assert!(ser.has_session_marker());
    }

    #[test]
    fn mutations_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue_state.json");
        let mut q = QueueService::open_at(&path, t0());
        q.add("a.mp3", Priority(1), 1.0).unwrap();
        q.add("b.mp3", Priority(2), 1.0).unwrap();
        q.remove("b.mp3").unwrap();

        let reopened = QueueService::open(&path);
        assert_eq!(reopened.len(), 1);
        assert!(reopened.contains("a.mp3"));
    }
}
