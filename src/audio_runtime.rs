//! AudioRuntime: dedicated audio thread behind a `Player` handle.
//!
//! The rodio output stream is not `Send`, so one thread owns it together
//! with two sinks: a looped background bed and a one-shot message sink.
//! `AudioHandle` talks to that thread over `mpsc` and mirrors the state the
//! playback loop polls (background level, message active) in atomics.
//! Message end is detected by the thread via `recv_timeout` + `sink.empty()`,
//! with the file's probed duration as a fallback for sinks that never drain.

use crate::error::{Error, Result};
use crate::player::Player;
use log::{debug, info, warn};
use rodio::{Decoder, OutputStream, Sink};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

/// How long a caller waits for the audio thread to answer.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);
/// Slack past the probed duration before a message is forced to end.
const END_GRACE: Duration = Duration::from_secs(2);
const POLL: Duration = Duration::from_millis(50);

/// File extensions accepted as messages.
pub const MESSAGE_EXTENSIONS: [&str; 4] = ["mp3", "wav", "aac", "ogg"];

pub fn is_message_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| MESSAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Duration from the file's tags/properties, if lofty can read it.
pub fn probe_duration(path: &Path) -> Option<Duration> {
    use lofty::file::AudioFile;
    match lofty::read_from_path(path) {
        Ok(tagged) => Some(tagged.properties().duration()).filter(|d| !d.is_zero()),
        Err(e) => {
            debug!("No duration for '{}': {}", path.display(), e);
            None
        }
    }
}

// ── Commands ────────────────────────────────────────────────────────────────

enum AudioCmd {
    PlayMessage {
        path: PathBuf,
        reply: mpsc::Sender<std::result::Result<(), String>>,
    },
    SwitchToBackground,
    SetBackground {
        path: PathBuf,
        reply: mpsc::Sender<std::result::Result<(), String>>,
    },
    SetVolume(u8),
    Shutdown,
}

struct SharedState {
    volume: AtomicU8,
    message_active: AtomicBool,
}

// ── Handle ──────────────────────────────────────────────────────────────────

/// Send + Sync handle to the audio thread.
#[derive(Clone)]
pub struct AudioHandle {
    tx: mpsc::Sender<AudioCmd>,
    state: Arc<SharedState>,
    messages_dir: PathBuf,
}

impl AudioHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(AudioCmd::Shutdown);
    }

    fn send(&self, cmd: AudioCmd) -> Result<()> {
        self.tx
            .send(cmd)
            .map_err(|_| Error::Player("audio thread has stopped".into()))
    }
}

impl Player for AudioHandle {
    fn play_message(&self, filename: &str) -> Result<()> {
        let path = self.messages_dir.join(filename);
        let (reply, answer) = mpsc::channel();
        self.send(AudioCmd::PlayMessage { path, reply })?;
        await_reply(answer)
    }

    fn is_media_ended(&self) -> bool {
        !self.state.message_active.load(Ordering::Relaxed)
    }

    fn switch_to_background(&self) -> Result<()> {
        self.send(AudioCmd::SwitchToBackground)
    }

    fn set_background_volume(&self, percent: u8) -> Result<()> {
        let percent = percent.min(100);
        self.send(AudioCmd::SetVolume(percent))?;
        self.state.volume.store(percent, Ordering::Relaxed);
        Ok(())
    }

    fn background_volume(&self) -> Result<u8> {
        Ok(self.state.volume.load(Ordering::Relaxed))
    }

    fn switch_background_source(&self, path: &Path) -> Result<()> {
        let (reply, answer) = mpsc::channel();
        self.send(AudioCmd::SetBackground {
            path: path.to_path_buf(),
            reply,
        })?;
        await_reply(answer)
    }
}

fn await_reply(answer: mpsc::Receiver<std::result::Result<(), String>>) -> Result<()> {
    match answer.recv_timeout(REPLY_TIMEOUT) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(Error::Player(e)),
        Err(_) => Err(Error::Player("audio thread did not answer".into())),
    }
}

// ── Runtime ─────────────────────────────────────────────────────────────────

/// Spawn the audio thread. Fails if no output device can be opened.
///
/// `background` is looped on its own sink at full level; without it the
/// background channel is silent but still tracks its level. The bed can be
/// replaced later with `switch_background_source`.
pub fn spawn_audio_runtime(background: Option<PathBuf>, messages_dir: PathBuf) -> Result<AudioHandle> {
    let (tx, rx) = mpsc::channel::<AudioCmd>();
    let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(), String>>();
    let state = Arc::new(SharedState {
        volume: AtomicU8::new(100),
        message_active: AtomicBool::new(false),
    });
    let thread_state = state.clone();

    std::thread::Builder::new()
        .name("audio-runtime".into())
        .spawn(move || audio_thread_loop(rx, ready_tx, background, thread_state))?;

    match ready_rx.recv_timeout(REPLY_TIMEOUT) {
        Ok(Ok(())) => Ok(AudioHandle { tx, state, messages_dir }),
        Ok(Err(e)) => Err(Error::Player(e)),
        Err(_) => Err(Error::Player("audio thread failed to start".into())),
    }
}

struct Message {
    sink: Sink,
    started: Instant,
    limit: Option<Duration>,
}

fn open_source(path: &Path) -> std::result::Result<BufReader<File>, String> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| format!("Cannot open '{}': {}", path.display(), e))
}

/// Main loop for the audio thread. Owns the output stream and sinks.
fn audio_thread_loop(
    rx: mpsc::Receiver<AudioCmd>,
    ready: mpsc::Sender<std::result::Result<(), String>>,
    background: Option<PathBuf>,
    state: Arc<SharedState>,
) {
    let (_stream, handle) = match OutputStream::try_default() {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ready.send(Err(format!("Failed to open audio output: {}", e)));
            return;
        }
    };

    let mut bed = match Sink::try_new(&handle) {
        Ok(sink) => sink,
        Err(e) => {
            let _ = ready.send(Err(format!("Failed to create audio sink: {}", e)));
            return;
        }
    };
    if let Some(path) = &background {
        match start_bed(&handle, path, 1.0) {
            Ok(sink) => {
                bed = sink;
                info!("Background program: {}", path.display());
            }
            Err(e) => warn!("Background unavailable, continuing silent: {}", e),
        }
    }
    let _ = ready.send(Ok(()));

    let mut message: Option<Message> = None;

    loop {
        match rx.recv_timeout(POLL) {
            Ok(AudioCmd::PlayMessage { path, reply }) => {
                if let Some(old) = message.take() {
                    old.sink.stop();
                }
                let result = start_message(&handle, &path).map(|msg| {
                    info!("Message on air: {}", path.display());
                    state.message_active.store(true, Ordering::Relaxed);
                    message = Some(msg);
                });
                let _ = reply.send(result);
            }

            Ok(AudioCmd::SwitchToBackground) => {
                if let Some(old) = message.take() {
                    old.sink.stop();
                }
                state.message_active.store(false, Ordering::Relaxed);
                bed.play();
            }

            Ok(AudioCmd::SetBackground { path, reply }) => {
                // The old bed keeps playing unless the new one decodes.
                let level = state.volume.load(Ordering::Relaxed) as f32 / 100.0;
                let result = start_bed(&handle, &path, level).map(|sink| {
                    bed.stop();
                    bed = sink;
                    info!("Background program switched to {}", path.display());
                });
                let _ = reply.send(result);
            }

            Ok(AudioCmd::SetVolume(percent)) => {
                bed.set_volume(percent as f32 / 100.0);
            }

            Ok(AudioCmd::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if let Some(old) = message.take() {
                    old.sink.stop();
                }
                bed.stop();
                state.message_active.store(false, Ordering::Relaxed);
                debug!("Audio thread exiting");
                break;
            }

            Err(mpsc::RecvTimeoutError::Timeout) => {
                let ended = match &message {
                    Some(msg) if msg.sink.empty() => true,
                    Some(msg) => match msg.limit {
                        Some(limit) if msg.started.elapsed() > limit + END_GRACE => {
                            warn!("Message overran its length, ending it");
                            msg.sink.stop();
                            true
                        }
                        _ => false,
                    },
                    None => false,
                };
                if ended {
                    message = None;
                    state.message_active.store(false, Ordering::Relaxed);
                }
            }
        }
    }
}

/// A new looped bed sink at `level`, already playing.
fn start_bed(handle: &rodio::OutputStreamHandle, path: &Path, level: f32) -> std::result::Result<Sink, String> {
    let file = open_source(path)?;
    let source = Decoder::new_looped(file).map_err(|e| format!("Cannot decode '{}': {}", path.display(), e))?;
    let sink = Sink::try_new(handle).map_err(|e| format!("Failed to create sink: {}", e))?;
    sink.set_volume(level);
    sink.append(source);
    sink.play();
    Ok(sink)
}

fn start_message(handle: &rodio::OutputStreamHandle, path: &Path) -> std::result::Result<Message, String> {
    let file = open_source(path)?;
    let source = Decoder::new(file).map_err(|e| format!("Cannot decode '{}': {}", path.display(), e))?;
    let sink = Sink::try_new(handle).map_err(|e| format!("Failed to create sink: {}", e))?;
    sink.append(source);
    sink.play();
    Ok(Message {
        sink,
        started: Instant::now(),
        limit: probe_duration(path),
    })
}
