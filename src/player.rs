//! Media backend contract consumed by the playback loop and the fade manager.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Two channels: a continuous background program (the radio) whose level
/// can be ducked, and a one-shot message channel.
pub trait Player: Send + Sync {
    /// Start playing a message file (name relative to the messages folder).
    fn play_message(&self, filename: &str) -> Result<()>;

    /// True once the current message has finished, or if none is playing.
    fn is_media_ended(&self) -> bool;

    /// Stop any message and return to the background program.
    fn switch_to_background(&self) -> Result<()>;

    /// Background level in percent (0-100).
    fn set_background_volume(&self, percent: u8) -> Result<()>;

    fn background_volume(&self) -> Result<u8>;

    /// Replace the looped background program. The current level is kept.
    fn switch_background_source(&self, path: &Path) -> Result<()>;
}

/// In-process player with no audio output. Messages "play" for a fixed
/// length. Used for dry runs and by tests.
pub struct SimulatedPlayer {
    message_length: Duration,
    state: Mutex<SimState>,
}

struct SimState {
    volume: u8,
    current: Option<(String, Instant)>,
    played: Vec<String>,
    volume_log: Vec<u8>,
    background: Option<PathBuf>,
    failing: HashSet<String>,
    volume_fails: bool,
}

impl SimulatedPlayer {
    pub fn new(message_length: Duration) -> Self {
        SimulatedPlayer {
            message_length,
            state: Mutex::new(SimState {
                volume: 100,
                current: None,
                played: Vec::new(),
                volume_log: Vec::new(),
                background: None,
                failing: HashSet::new(),
                volume_fails: false,
            }),
        }
    }

    /// Make `play_message` (or a background switch) fail for this file.
    pub fn fail_on(&self, filename: &str) {
        self.state.lock().failing.insert(filename.to_string());
    }

    /// Make volume get/set fail, as a closed background channel would.
    pub fn fail_volume(&self, fail: bool) {
        self.state.lock().volume_fails = fail;
    }

    /// End the current message now.
    pub fn finish_message(&self) {
        self.state.lock().current = None;
    }

    pub fn current_message(&self) -> Option<String> {
        self.state.lock().current.as_ref().map(|(f, _)| f.clone())
    }

    /// Every message started so far, in order.
    pub fn played(&self) -> Vec<String> {
        self.state.lock().played.clone()
    }

    /// Every background level applied so far, in order.
    pub fn volume_log(&self) -> Vec<u8> {
        self.state.lock().volume_log.clone()
    }

    pub fn background(&self) -> Option<PathBuf> {
        self.state.lock().background.clone()
    }
}

impl Player for SimulatedPlayer {
    fn play_message(&self, filename: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing.contains(filename) {
            return Err(Error::Player(format!("Cannot open '{}'", filename)));
        }
        state.current = Some((filename.to_string(), Instant::now()));
        state.played.push(filename.to_string());
        Ok(())
    }

    fn is_media_ended(&self) -> bool {
        match &self.state.lock().current {
            Some((_, started)) => started.elapsed() >= self.message_length,
            None => true,
        }
    }

    fn switch_to_background(&self) -> Result<()> {
        self.state.lock().current = None;
        Ok(())
    }

    fn set_background_volume(&self, percent: u8) -> Result<()> {
        let mut state = self.state.lock();
        if state.volume_fails {
            return Err(Error::Player("background channel closed".into()));
        }
        let volume = percent.min(100);
        state.volume = volume;
        state.volume_log.push(volume);
        Ok(())
    }

    fn background_volume(&self) -> Result<u8> {
        let state = self.state.lock();
        if state.volume_fails {
            return Err(Error::Player("background channel closed".into()));
        }
        Ok(state.volume)
    }

    fn switch_background_source(&self, path: &Path) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing.contains(&path.to_string_lossy().into_owned()) {
            return Err(Error::Player(format!("Cannot open '{}'", path.display())));
        }
        state.background = Some(path.to_path_buf());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_message_ends_after_length() {
        let player = SimulatedPlayer::new(Duration::from_millis(20));
        assert!(player.is_media_ended());
        player.play_message("a.mp3").unwrap();
        assert!(!player.is_media_ended());
        std::thread::sleep(Duration::from_millis(30));
        assert!(player.is_media_ended());
        assert_eq!(player.played(), vec!["a.mp3".to_string()]);
    }

    #[test]
    fn simulated_failures() {
        let player = SimulatedPlayer::new(Duration::from_secs(1));
        player.fail_on("broken.mp3");
        assert!(player.play_message("broken.mp3").is_err());
        assert!(player.played().is_empty());

        player.fail_volume(true);
        assert!(player.set_background_volume(10).is_err());
        assert!(player.background_volume().is_err());
    }

    #[test]
    fn switch_to_background_ends_message() {
        let player = SimulatedPlayer::new(Duration::from_secs(60));
        player.play_message("a.mp3").unwrap();
        assert_eq!(player.current_message().as_deref(), Some("a.mp3"));
        player.switch_to_background().unwrap();
        assert!(player.is_media_ended());
    }

    #[test]
    fn volume_is_capped_and_logged() {
        let player = SimulatedPlayer::new(Duration::from_secs(1));
        player.set_background_volume(150).unwrap();
        player.set_background_volume(40).unwrap();
        assert_eq!(player.volume_log(), vec![100, 40]);
        assert_eq!(player.background_volume().unwrap(), 40);
    }

    #[test]
    fn background_switch_keeps_level() {
        let player = SimulatedPlayer::new(Duration::from_secs(1));
        player.set_background_volume(30).unwrap();
        player.switch_background_source(Path::new("beds/night.mp3")).unwrap();
        assert_eq!(player.background().as_deref(), Some(Path::new("beds/night.mp3")));
        assert_eq!(player.background_volume().unwrap(), 30);

        player.fail_on("beds/broken.mp3");
        assert!(player.switch_background_source(Path::new("beds/broken.mp3")).is_err());
        assert_eq!(player.background().as_deref(), Some(Path::new("beds/night.mp3")));
    }
}
