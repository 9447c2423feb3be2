//! Background ducking for message transitions.
//!
//! `AudioFadeManager` ramps the background level down before a message and
//! back up afterwards. Ramps run on a worker thread; starting a new ramp
//! cancels and joins the previous one, so only one ramp ever drives the
//! channel. The level never goes below the configured floor.

use crate::error::{Error, Result};
use crate::player::Player;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

// ── FadeCurve ───────────────────────────────────────────────────────────────

/// Shape of a ramp. `apply` maps progress in [0, 1] to a blend factor in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FadeCurve {
    Linear,
    Exponential,
    Logarithmic,
    #[default]
    Smooth,
}

impl FadeCurve {
    pub fn apply(self, progress: f32) -> f32 {
        let p = progress.clamp(0.0, 1.0);
        match self {
            FadeCurve::Linear => p,
            FadeCurve::Exponential => p * p,
            FadeCurve::Logarithmic => p.sqrt(),
            FadeCurve::Smooth => 0.5 * (1.0 + (PI * (p - 0.5)).sin()),
        }
    }

    pub fn from_str_loose(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "linear" => Ok(FadeCurve::Linear),
            "exponential" | "exp" => Ok(FadeCurve::Exponential),
            "logarithmic" | "log" => Ok(FadeCurve::Logarithmic),
            "smooth" | "s-curve" => Ok(FadeCurve::Smooth),
            _ => Err(Error::UnknownCurve(s.to_string())),
        }
    }
}

impl fmt::Display for FadeCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FadeCurve::Linear => write!(f, "linear"),
            FadeCurve::Exponential => write!(f, "exponential"),
            FadeCurve::Logarithmic => write!(f, "logarithmic"),
            FadeCurve::Smooth => write!(f, "smooth"),
        }
    }
}

/// Blend factor for `progress` along `curve`.
pub fn compute_curve(progress: f32, curve: FadeCurve) -> f32 {
    curve.apply(progress)
}

/// Level applied at one ramp step: the curve blends from `start` to `end`
/// (raised to `floor`), truncated to a whole percent and kept in [floor, 100].
pub fn ramp_step_volume(start: u8, end: u8, floor: u8, progress: f32, curve: FadeCurve) -> u8 {
    let floor = floor.min(100);
    let end = end.max(floor);
    let blended = start as f32 + (end as f32 - start as f32) * curve.apply(progress);
    (blended as i32).clamp(floor as i32, 100) as u8
}

// ── Settings & presets ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FadeSettings {
    pub duration_secs: f32,
    pub curve: FadeCurve,
    /// Floor for the background level while a message plays (percent).
    pub background_volume: u8,
    /// Level restored after a message (percent).
    pub normal_volume: u8,
    pub steps_per_sec: u32,
    /// Pause before ramping back up, letting the message tail out.
    pub tail_wait_secs: f32,
}

impl Default for FadeSettings {
    fn default() -> Self {
        FadeSettings {
            duration_secs: 4.0,
            curve: FadeCurve::Smooth,
            background_volume: 2,
            normal_volume: 100,
            steps_per_sec: 100,
            tail_wait_secs: 0.5,
        }
    }
}

/// Longest fade `set_fade_settings` accepts.
pub const MAX_FADE_SECS: f32 = 5.0;
pub const MAX_TAIL_WAIT_SECS: f32 = 5.0;
pub const MAX_STEPS_PER_SEC: u32 = 1000;

impl FadeSettings {
    pub fn duration(&self) -> Duration {
        secs_or_zero(self.duration_secs)
    }

    pub fn tail_wait(&self) -> Duration {
        secs_or_zero(self.tail_wait_secs)
    }

    /// Pull hand-edited values back into range. Non-finite times fall back
    /// to the defaults; levels are capped at 100%.
    pub fn sanitized(self) -> Self {
        let defaults = FadeSettings::default();
        let bounded = |value: f32, default: f32, max: f32| {
            if value.is_finite() { value.clamp(0.0, max) } else { default }
        };
        FadeSettings {
            duration_secs: bounded(self.duration_secs, defaults.duration_secs, MAX_FADE_SECS),
            tail_wait_secs: bounded(self.tail_wait_secs, defaults.tail_wait_secs, MAX_TAIL_WAIT_SECS),
            steps_per_sec: self.steps_per_sec.clamp(1, MAX_STEPS_PER_SEC),
            background_volume: self.background_volume.min(100),
            normal_volume: self.normal_volume.min(100),
            curve: self.curve,
        }
    }
}

fn secs_or_zero(value: f32) -> Duration {
    Duration::try_from_secs_f32(value.max(0.0)).unwrap_or(Duration::ZERO)
}

/// Named fade setups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadePreset {
    Professional,
    Fast,
    Smooth,
    Dramatic,
}

impl FadePreset {
    pub const ALL: [FadePreset; 4] = [
        FadePreset::Professional,
        FadePreset::Fast,
        FadePreset::Smooth,
        FadePreset::Dramatic,
    ];

    pub fn from_str_loose(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        FadePreset::ALL
            .into_iter()
            .find(|preset| preset.to_string() == wanted)
            .ok_or_else(|| Error::UnknownPreset(s.to_string()))
    }

    /// (duration in seconds, curve, background floor).
    pub fn values(self) -> (f32, FadeCurve, u8) {
        match self {
            FadePreset::Professional => (2.5, FadeCurve::Smooth, 5),
            FadePreset::Fast => (1.0, FadeCurve::Exponential, 10),
            FadePreset::Smooth => (3.0, FadeCurve::Logarithmic, 8),
            FadePreset::Dramatic => (4.0, FadeCurve::Exponential, 2),
        }
    }
}

impl fmt::Display for FadePreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FadePreset::Professional => write!(f, "professional"),
            FadePreset::Fast => write!(f, "fast"),
            FadePreset::Smooth => write!(f, "smooth"),
            FadePreset::Dramatic => write!(f, "dramatic"),
        }
    }
}

// ── AudioFadeManager ────────────────────────────────────────────────────────

struct Ramp {
    cancel: Arc<AtomicBool>,
    handle: thread::JoinHandle<()>,
}

impl Ramp {
    fn cancel_and_join(self) {
        self.cancel.store(true, Ordering::Relaxed);
        let _ = self.handle.join();
    }
}

pub struct AudioFadeManager {
    player: Arc<dyn Player>,
    settings: Mutex<FadeSettings>,
    ramp: Mutex<Option<Ramp>>,
    /// Last level the manager applied or observed.
    current_volume: Arc<AtomicU8>,
}

impl AudioFadeManager {
    pub fn new(player: Arc<dyn Player>) -> Self {
        Self::with_settings(player, FadeSettings::default())
    }

    /// Start from `settings`, only pulled into range (see
    /// `FadeSettings::sanitized`). Short test fades below the 0.5 s minimum
    /// of `set_fade_settings` are kept.
    pub fn with_settings(player: Arc<dyn Player>, settings: FadeSettings) -> Self {
        let settings = settings.sanitized();
        info!(
            "Fade manager: {:.1}s {} fade, background {}%",
            settings.duration_secs, settings.curve, settings.background_volume
        );
        AudioFadeManager {
            player,
            current_volume: Arc::new(AtomicU8::new(settings.normal_volume)),
            settings: Mutex::new(settings),
            ramp: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> FadeSettings {
        *self.settings.lock()
    }

    pub fn fade_duration(&self) -> Duration {
        self.settings.lock().duration()
    }

    pub fn current_volume(&self) -> u8 {
        self.current_volume.load(Ordering::Relaxed)
    }

    /// Update fade parameters. Duration is kept within 0.5-5 s and the
    /// background floor within 0-50%. The tail wait and step rate are pulled
    /// into range as well.
    pub fn set_fade_settings(
        &self,
        duration_secs: Option<f32>,
        curve: Option<FadeCurve>,
        background_volume: Option<u8>,
    ) -> FadeSettings {
        let mut settings = self.settings.lock();
        if let Some(d) = duration_secs {
            settings.duration_secs = d.clamp(0.5, MAX_FADE_SECS);
        }
        if let Some(c) = curve {
            settings.curve = c;
        }
        if let Some(v) = background_volume {
            settings.background_volume = v.min(50);
        }
        *settings = settings.sanitized();
        info!(
            "Fade settings: {:.1}s {} fade, background {}%",
            settings.duration_secs, settings.curve, settings.background_volume
        );
        *settings
    }

    /// Apply a named preset. Unknown names change nothing.
    pub fn apply_preset(&self, name: &str) -> Result<FadeSettings> {
        let preset = FadePreset::from_str_loose(name)?;
        let (duration, curve, floor) = preset.values();
        let settings = self.set_fade_settings(Some(duration), Some(curve), Some(floor));
        info!("Fade preset '{}' applied", preset);
        Ok(settings)
    }

    /// Ramp the background from `start` to `end` over `duration` on a worker
    /// thread, replacing any ramp in flight.
    pub fn ramp_volume(&self, start: u8, end: u8, duration: Duration, curve: FadeCurve) {
        let settings = self.settings();
        let floor = settings.background_volume;
        let end = end.max(floor);
        let steps = ((duration.as_secs_f32() * settings.steps_per_sec as f32) as u32).max(1);
        let step_delay = duration / steps;

        let mut slot = self.ramp.lock();
        if let Some(previous) = slot.take() {
            previous.cancel_and_join();
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let thread_cancel = cancel.clone();
        let player = self.player.clone();
        let current = self.current_volume.clone();

        debug!("Fade {}% -> {}% over {:.2}s ({})", start, end, duration.as_secs_f32(), curve);

        let spawned = thread::Builder::new()
            .name("fade-ramp".into())
            .spawn(move || {
                for i in 0..=steps {
                    if thread_cancel.load(Ordering::Relaxed) {
                        return;
                    }
                    let progress = i as f32 / steps as f32;
                    let volume = ramp_step_volume(start, end, floor, progress, curve);
                    if let Err(e) = player.set_background_volume(volume) {
                        warn!("Fade aborted: {}", e);
                        return;
                    }
                    current.store(volume, Ordering::Relaxed);
                    if i < steps {
                        thread::sleep(step_delay);
                    }
                }
                debug!("Fade finished at {}%", end);
            });

        match spawned {
            Ok(handle) => *slot = Some(Ramp { cancel, handle }),
            Err(e) => {
                warn!("Could not start fade thread, jumping to {}%: {}", end, e);
                self.apply_volume(end);
            }
        }
    }

    /// Stop the ramp in flight, if any, leaving the level where it is.
    pub fn cancel_ramp(&self) {
        if let Some(ramp) = self.ramp.lock().take() {
            ramp.cancel_and_join();
        }
    }

    /// Block until the ramp in flight has finished.
    pub fn wait_for_ramp(&self) {
        if let Some(ramp) = self.ramp.lock().take() {
            let _ = ramp.handle.join();
        }
    }

    /// Duck the background to the floor ahead of a message.
    pub fn start_message_transition(&self) {
        self.cancel_ramp();
        let settings = self.settings();
        let current = match self.player.background_volume() {
            Ok(0) => settings.normal_volume,
            Ok(v) => v,
            Err(e) => {
                warn!("Could not read background volume: {}", e);
                settings.normal_volume
            }
        };
        self.current_volume.store(current, Ordering::Relaxed);

        if current > settings.background_volume {
            info!("Transition to message: background {}% -> {}%", current, settings.background_volume);
            self.ramp_volume(current, settings.background_volume, settings.duration(), settings.curve);
        } else {
            debug!("Background already at {}%, no fade needed", current);
        }
    }

    /// Let the message tail out, then bring the background back up.
    pub fn end_message_transition(&self) {
        let settings = self.settings();
        thread::sleep(settings.tail_wait());
        self.cancel_ramp();
        let current = match self.player.background_volume() {
            Ok(v) => v,
            Err(e) => {
                warn!("Could not read background volume: {}", e);
                settings.background_volume
            }
        };
        info!("Transition to background: {}% -> {}%", current, settings.normal_volume);
        self.ramp_volume(current, settings.normal_volume, settings.duration(), settings.curve);
    }

    /// Stop fading and leave the background at its normal level.
    pub fn cleanup(&self) {
        self.cancel_ramp();
        self.apply_volume(self.settings().normal_volume);
    }

    fn apply_volume(&self, volume: u8) {
        match self.player.set_background_volume(volume) {
            Ok(()) => self.current_volume.store(volume, Ordering::Relaxed),
            Err(e) => warn!("Could not set background volume to {}%: {}", volume, e),
        }
    }
}

impl Drop for AudioFadeManager {
    fn drop(&mut self) {
        self.cancel_ramp();
    }
}
