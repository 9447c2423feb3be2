//! MessageQueueManager: the playback loop.
//!
//! Each tick either closes out a message that has ended, or starts the next
//! eligible one: duck the background, wait for the fade, then hand the file
//! to the player. Runs on its own thread; errors and panics in a tick are
//! logged and followed by a cooldown, never ending the loop.

use crate::config::Settings;
use crate::error::Result;
use crate::fade::AudioFadeManager;
use crate::message_item::{Priority, QueueItem};
use crate::player::Player;
use crate::queue_service::SharedQueue;
use chrono::{DateTime, Local, TimeDelta};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

/// Ticks between debug summaries of the queue.
const SUMMARY_EVERY: u64 = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopSettings {
    pub tick: Duration,
    pub error_cooldown: Duration,
    pub shutdown_timeout: Duration,
    /// Extra wait after the duck-down fade before the message starts.
    pub start_margin: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        LoopSettings {
            tick: Duration::from_secs(1),
            error_cooldown: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(2),
            start_margin: Duration::from_millis(200),
        }
    }
}

impl From<&Settings> for LoopSettings {
    fn from(settings: &Settings) -> Self {
        LoopSettings {
            tick: settings.tick(),
            error_cooldown: settings.error_cooldown(),
            shutdown_timeout: settings.shutdown_timeout(),
            ..LoopSettings::default()
        }
    }
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Nothing playing and nothing due.
    Idle,
    /// A message is still on air.
    Playing,
    Started(String),
    /// Playback could not start; the message was re-armed.
    StartFailed(String),
    Finished(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManagerStatus {
    pub running: bool,
    pub current_message: Option<String>,
    pub queue_len: usize,
    pub active_priority: Option<Priority>,
}

struct Inner {
    queue: SharedQueue,
    player: Arc<dyn Player>,
    fades: Arc<AudioFadeManager>,
    settings: LoopSettings,
    current: Mutex<Option<QueueItem>>,
    stop_requested: Mutex<bool>,
    wake: Condvar,
}

impl Inner {
    /// Sleep for `duration` unless stop is requested first. Returns false
    /// when interrupted.
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut stopped = self.stop_requested.lock();
        while !*stopped {
            if self.wake.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        !*stopped
    }

    fn tick(&self) -> Result<TickOutcome> {
        // An ended message leaves `current` before its end sequence runs, so
        // a failure there is never retried against the same item.
        let ended = {
            let mut current = self.current.lock();
            if current.is_some() && !self.player.is_media_ended() {
                return Ok(TickOutcome::Playing);
            }
            current.take()
        };
        if let Some(item) = ended {
            return self.finish(item);
        }

        let picked = {
            let mut queue = self.queue.lock();
            let now = Local::now();
            queue.resume_rotation(now);
            let picked = queue.next_eligible(now);
            if let Some(item) = &picked {
                queue.register_start(item);
            }
            picked
        };

        match picked {
            Some(item) => self.start(item),
            None => Ok(TickOutcome::Idle),
        }
    }

    fn start(&self, item: QueueItem) -> Result<TickOutcome> {
        info!("Starting {} {}", item.priority, item.filename);
        self.fades.start_message_transition();

        if !self.sleep(self.fades.fade_duration() + self.settings.start_margin) {
            info!("Stopping before {} went on air", item.filename);
            self.revert(&item);
            return Ok(TickOutcome::StartFailed(item.filename));
        }

        match self.player.play_message(&item.filename) {
            Ok(()) => {
                let name = item.filename.clone();
                *self.current.lock() = Some(item);
                Ok(TickOutcome::Started(name))
            }
            Err(e) => {
                warn!("Could not play {}: {}", item.filename, e);
                self.revert(&item);
                Ok(TickOutcome::StartFailed(item.filename))
            }
        }
    }

    /// Back to the background program and release the scheduler's marker.
    fn revert(&self, item: &QueueItem) {
        if let Err(e) = self.player.switch_to_background() {
            warn!("Could not switch back to background: {}", e);
        }
        self.fades.cleanup();
        self.queue.lock().abort_start(item, Local::now());
    }

    fn finish(&self, item: QueueItem) -> Result<TickOutcome> {
        let completed = completion_time(Local::now(), self.fades.fade_duration());
        self.queue.lock().register_end(&item, completed);
        self.fades.end_message_transition();
        self.player.switch_to_background()?;
        info!("Back to background after {}", item.filename);
        Ok(TickOutcome::Finished(item.filename))
    }

    /// After a failed tick, release a message that was selected but never
    /// went on air.
    fn recover(&self) {
        if self.current.lock().is_some() {
            return;
        }
        if let Some(name) = self.queue.lock().abort_playing(Local::now()) {
            warn!("Released {} after a failed tick", name);
            self.fades.cleanup();
        }
    }

    fn run(&self, running: &AtomicBool) {
        let mut ticks: u64 = 0;
        while running.load(Ordering::Relaxed) {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.tick()));
            let failed = match result {
                Ok(Ok(outcome)) => {
                    debug!("Tick: {:?}", outcome);
                    false
                }
                Ok(Err(e)) => {
                    error!("Playback loop error: {}", e);
                    true
                }
                Err(_) => {
                    error!("Playback loop panicked");
                    true
                }
            };
            if failed {
                self.recover();
                warn!("Retrying in {:.1}s", self.settings.error_cooldown.as_secs_f32());
                self.sleep(self.settings.error_cooldown);
                continue;
            }

            ticks += 1;
            if ticks % SUMMARY_EVERY == 0 {
                self.queue.lock().log_state(Local::now());
            }
            self.sleep(self.settings.tick);
        }
    }
}

/// A message is complete once its fade back up has finished.
pub fn completion_time(now: DateTime<Local>, fade: Duration) -> DateTime<Local> {
    now + TimeDelta::from_std(fade).unwrap_or(TimeDelta::zero())
}

struct Worker {
    handle: thread::JoinHandle<()>,
    done: mpsc::Receiver<()>,
}

pub struct MessageQueueManager {
    inner: Arc<Inner>,
    running: Arc<AtomicBool>,
    worker: Option<Worker>,
}

impl MessageQueueManager {
    pub fn new(
        queue: SharedQueue,
        player: Arc<dyn Player>,
        fades: Arc<AudioFadeManager>,
        settings: LoopSettings,
    ) -> Self {
        MessageQueueManager {
            inner: Arc::new(Inner {
                queue,
                player,
                fades,
                settings,
                current: Mutex::new(None),
                stop_requested: Mutex::new(false),
                wake: Condvar::new(),
            }),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn queue(&self) -> &SharedQueue {
        &self.inner.queue
    }

    pub fn fades(&self) -> &Arc<AudioFadeManager> {
        &self.inner.fades
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn current_message(&self) -> Option<QueueItem> {
        self.inner.current.lock().clone()
    }

    pub fn status(&self) -> ManagerStatus {
        let queue = self.inner.queue.lock();
        ManagerStatus {
            running: self.is_running(),
            current_message: self.inner.current.lock().as_ref().map(|m| m.filename.clone()),
            queue_len: queue.len(),
            active_priority: queue.active_priority(),
        }
    }

    /// Run one iteration synchronously.
    pub fn tick(&self) -> Result<TickOutcome> {
        self.inner.tick()
    }

    /// Start the loop thread. Does nothing if already running.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        *self.inner.stop_requested.lock() = false;
        self.running.store(true, Ordering::Relaxed);

        let inner = self.inner.clone();
        let running = self.running.clone();
        let (done_tx, done) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name("message-queue".into())
            .spawn(move || {
                inner.run(&running);
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(handle) => {
                self.worker = Some(Worker { handle, done });
                info!("Message queue manager started");
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    /// Stop the loop, waiting up to the shutdown timeout for it to exit,
    /// then restore the background level.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        *self.inner.stop_requested.lock() = true;
        self.inner.wake.notify_all();

        if let Some(worker) = self.worker.take() {
            match worker.done.recv_timeout(self.inner.settings.shutdown_timeout) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    let _ = worker.handle.join();
                    info!("Message queue manager stopped");
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    warn!("Message queue thread did not stop in time, detaching it");
                }
            }
        }
        self.inner.fades.cleanup();
    }
}

impl Drop for MessageQueueManager {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::fade::FadeSettings;
    use crate::player::SimulatedPlayer;
    use crate::queue_service::QueueService;
    use std::path::Path;

    fn quick_fades() -> FadeSettings {
        FadeSettings {
            duration_secs: 0.02,
            tail_wait_secs: 0.0,
            background_volume: 5,
            ..FadeSettings::default()
        }
    }

    fn quick_loop() -> LoopSettings {
        LoopSettings {
            tick: Duration::from_millis(10),
            error_cooldown: Duration::from_millis(20),
            shutdown_timeout: Duration::from_secs(2),
            start_margin: Duration::from_millis(5),
        }
    }

    fn setup(player: Arc<dyn Player>) -> MessageQueueManager {
        let fades = Arc::new(AudioFadeManager::with_settings(player.clone(), quick_fades()));
        MessageQueueManager::new(QueueService::in_memory().shared(), player, fades, quick_loop())
    }

    fn add_due(manager: &MessageQueueManager, name: &str, priority: u8, interval: f64) {
        let past = Local::now() - TimeDelta::seconds(30);
        manager
            .queue()
            .lock()
            .add_at(name, Priority(priority), interval, past)
            .unwrap();
    }

    fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
        let started = Instant::now();
        while started.elapsed() < limit {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn empty_queue_is_idle() {
        let player = Arc::new(SimulatedPlayer::new(Duration::from_secs(1)));
        let manager = setup(player);
        assert_eq!(manager.tick().unwrap(), TickOutcome::Idle);
    }

    #[test]
    fn message_lifecycle() {
        let player = Arc::new(SimulatedPlayer::new(Duration::from_secs(60)));
        let manager = setup(player.clone());
        add_due(&manager, "a.mp3", 1, 0.1);

        assert_eq!(manager.tick().unwrap(), TickOutcome::Started("a.mp3".into()));
        assert_eq!(player.current_message().as_deref(), Some("a.mp3"));
        manager.fades().wait_for_ramp();
        assert_eq!(player.background_volume().unwrap(), 5);
        assert_eq!(manager.queue().lock().currently_playing(), Some("a.mp3"));

        assert_eq!(manager.tick().unwrap(), TickOutcome::Playing);

        player.finish_message();
        let before = Local::now();
        assert_eq!(manager.tick().unwrap(), TickOutcome::Finished("a.mp3".into()));
        manager.fades().wait_for_ramp();
        assert_eq!(player.background_volume().unwrap(), 100);

        let queue = manager.queue().lock();
        assert!(queue.currently_playing().is_none());
        let item = queue.get("a.mp3").unwrap();
        assert!(item.end_time.unwrap() >= before);
        assert!(item.next_play_time > Local::now());
        assert!(manager.current_message().is_none());
    }

    #[test]
    fn failed_start_rearms_message() {
        let player = Arc::new(SimulatedPlayer::new(Duration::from_secs(1)));
        player.fail_on("bad.mp3");
        let manager = setup(player.clone());
        add_due(&manager, "bad.mp3", 1, 0.1);

        assert_eq!(manager.tick().unwrap(), TickOutcome::StartFailed("bad.mp3".into()));
        assert_eq!(player.background_volume().unwrap(), 100);
        let queue = manager.queue().lock();
        assert!(queue.currently_playing().is_none());
        let item = queue.get("bad.mp3").unwrap();
        assert!(item.is_active());
        assert!(item.next_play_time > Local::now());
    }

    #[test]
    fn completion_includes_fade() {
        let now = Local::now();
        assert_eq!(completion_time(now, Duration::from_secs(4)), now + TimeDelta::seconds(4));
    }

    #[test]
    fn loop_plays_and_stops() {
        let player = Arc::new(SimulatedPlayer::new(Duration::from_millis(30)));
        let mut manager = setup(player.clone());
        // Single shots, so the tier-2 message is due as soon as tier 1 ends.
        add_due(&manager, "a.mp3", 1, 0.0);
        add_due(&manager, "b.mp3", 2, 0.0);

        manager.start().unwrap();
        assert!(manager.is_running());
        assert!(wait_until(Duration::from_secs(5), || player.played().len() >= 2));

        let started = Instant::now();
        manager.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!manager.status().running);
        assert_eq!(player.played(), vec!["a.mp3".to_string(), "b.mp3".to_string()]);
    }

    #[test]
    fn status_reports_queue() {
        let player = Arc::new(SimulatedPlayer::new(Duration::from_secs(60)));
        let manager = setup(player);
        add_due(&manager, "a.mp3", 2, 0.1);
        manager.tick().unwrap();
        let status = manager.status();
        assert!(!status.running);
        assert_eq!(status.current_message.as_deref(), Some("a.mp3"));
        assert_eq!(status.queue_len, 1);
    }

    /// Panics on the first `play_message`, then behaves.
    struct FlakyPlayer {
        inner: SimulatedPlayer,
        tripped: AtomicBool,
    }

    impl Player for FlakyPlayer {
        fn play_message(&self, filename: &str) -> Result<()> {
            if !self.tripped.swap(true, Ordering::Relaxed) {
                panic!("decoder blew up");
            }
            self.inner.play_message(filename)
        }
        fn is_media_ended(&self) -> bool {
            self.inner.is_media_ended()
        }
        fn switch_to_background(&self) -> Result<()> {
            self.inner.switch_to_background()
        }
        fn set_background_volume(&self, percent: u8) -> Result<()> {
            self.inner.set_background_volume(percent)
        }
        fn background_volume(&self) -> Result<u8> {
            self.inner.background_volume()
        }
        fn switch_background_source(&self, path: &Path) -> Result<()> {
            self.inner.switch_background_source(path)
        }
    }

    #[test]
    fn loop_survives_panicking_tick() {
        let player = Arc::new(FlakyPlayer {
            inner: SimulatedPlayer::new(Duration::from_secs(60)),
            tripped: AtomicBool::new(false),
        });
        let mut manager = setup(player.clone());
        // Re-armed one interval after the failure, so keep it at zero.
        add_due(&manager, "a.mp3", 1, 0.0);

        manager.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            player.inner.current_message().is_some()
        }));
        manager.stop();
        assert!(player.tripped.load(Ordering::Relaxed));
    }

    #[test]
    fn player_errors_surface_from_tick() {
        struct DeadPlayer;
        impl Player for DeadPlayer {
            fn play_message(&self, _: &str) -> Result<()> {
                Ok(())
            }
            fn is_media_ended(&self) -> bool {
                true
            }
            fn switch_to_background(&self) -> Result<()> {
                Err(Error::Player("gone".into()))
            }
            fn set_background_volume(&self, _: u8) -> Result<()> {
                Ok(())
            }
            fn background_volume(&self) -> Result<u8> {
                Ok(100)
            }
            fn switch_background_source(&self, _: &Path) -> Result<()> {
                Ok(())
            }
        }

        let manager = setup(Arc::new(DeadPlayer));
        add_due(&manager, "a.mp3", 1, 0.1);
        assert_eq!(manager.tick().unwrap(), TickOutcome::Started("a.mp3".into()));
        assert!(matches!(manager.tick(), Err(Error::Player(_))));
        // The message was still closed out.
        assert!(manager.current_message().is_none());
        assert!(manager.queue().lock().currently_playing().is_none());
    }

    /// Panics once when asked to return to the background.
    struct StuckBackgroundPlayer {
        inner: SimulatedPlayer,
        tripped: AtomicBool,
    }

    impl Player for StuckBackgroundPlayer {
        fn play_message(&self, filename: &str) -> Result<()> {
            self.inner.play_message(filename)
        }
        fn is_media_ended(&self) -> bool {
            self.inner.is_media_ended()
        }
        fn switch_to_background(&self) -> Result<()> {
            if !self.tripped.swap(true, Ordering::Relaxed) {
                panic!("background stream vanished");
            }
            self.inner.switch_to_background()
        }
        fn set_background_volume(&self, percent: u8) -> Result<()> {
            self.inner.set_background_volume(percent)
        }
        fn background_volume(&self) -> Result<u8> {
            self.inner.background_volume()
        }
        fn switch_background_source(&self, path: &Path) -> Result<()> {
            self.inner.switch_background_source(path)
        }
    }

    #[test]
    fn end_sequence_panic_closes_message_once() {
        let player = Arc::new(StuckBackgroundPlayer {
            inner: SimulatedPlayer::new(Duration::from_secs(60)),
            tripped: AtomicBool::new(false),
        });
        let manager = setup(player.clone());
        add_due(&manager, "a.mp3", 1, 0.1);
        add_due(&manager, "b.mp3", 2, 60.0);

        assert_eq!(manager.tick().unwrap(), TickOutcome::Started("a.mp3".into()));
        player.inner.finish_message();
        let ended = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| manager.tick()));
        assert!(ended.is_err());
        assert!(manager.current_message().is_none());

        let b_next = manager.queue().lock().get("b.mp3").unwrap().next_play_time;
        // The next tick must not run the end sequence for "a.mp3" again.
        assert_ne!(manager.tick().unwrap(), TickOutcome::Finished("a.mp3".into()));
        let queue = manager.queue().lock();
        assert_eq!(queue.get("b.mp3").unwrap().next_play_time, b_next);
        assert!(queue.currently_playing().is_none());
    }

    #[test]
    fn clear_while_on_air_keeps_new_items_pending() {
        let player = Arc::new(SimulatedPlayer::new(Duration::from_secs(60)));
        let manager = setup(player.clone());
        add_due(&manager, "a.mp3", 1, 0.1);
        assert_eq!(manager.tick().unwrap(), TickOutcome::Started("a.mp3".into()));

        manager.queue().lock().clear();
        manager.queue().lock().add("b.mp3", Priority(1), 60.0).unwrap();
        assert!(!manager.queue().lock().get("b.mp3").unwrap().is_active());
        assert_eq!(manager.tick().unwrap(), TickOutcome::Playing);

        player.finish_message();
        assert_eq!(manager.tick().unwrap(), TickOutcome::Finished("a.mp3".into()));
        assert!(manager.queue().lock().currently_playing().is_none());
    }
}
