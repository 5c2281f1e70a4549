//! Voice-operated transmit control.
//!
//! Amplitude above the threshold keys the transmitter; silence longer than
//! the hangtime releases it. The hard timeout is a safety governor: no
//! matter what the audio does, a single transmission never exceeds it, and
//! after it trips the controller stays idle until the amplitude drops below
//! the threshold once, so a stuck source cannot immediately re-key a shared
//! channel.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::audio;
use crate::config::VoxSection;
use crate::error::BridgeError;
use crate::frame::AudioFrame;
use crate::stats::VoxStats;

/// Narrow interface to the PTT enforcement point. Invoked with `true` on
/// key-up and `false` on release.
pub type PttCallback = Box<dyn Fn(bool) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VoxState {
    Idle,
    Transmitting,
}

pub struct VoxController {
    threshold: f32,
    hangtime: Duration,
    hard_timeout: Duration,
    state: VoxState,
    transmission_start: Option<Instant>,
    last_above: Option<Instant>,
    /// Armed after a hard timeout; cleared once amplitude falls to or below
    /// the threshold.
    timeout_latched: bool,
    ptt_cb: PttCallback,
    stats: Arc<VoxStats>,
}

impl VoxController {
    pub fn new(cfg: &VoxSection, ptt_cb: PttCallback, stats: Arc<VoxStats>) -> Self {
        Self {
            threshold: cfg.threshold,
            hangtime: Duration::from_millis(cfg.hangtime_ms),
            hard_timeout: Duration::from_millis(cfg.hard_timeout_ms),
            state: VoxState::Idle,
            transmission_start: None,
            last_above: None,
            timeout_latched: false,
            ptt_cb,
            stats,
        }
    }

    /// Evaluate one frame at time `now`, annotating it with the measured
    /// amplitude and the PTT state. `Err(Safety)` means the hard timeout
    /// tripped on this frame and it must not be forwarded.
    pub fn process_frame(
        &mut self,
        frame: &mut AudioFrame,
        now: Instant,
    ) -> Result<(), BridgeError> {
        let amp = audio::rms(&frame.pcm);
        frame.amplitude_rms = amp;

        if self.state == VoxState::Transmitting {
            if let Some(start) = self.transmission_start {
                if now.duration_since(start) >= self.hard_timeout {
                    warn!(
                        elapsed_ms = now.duration_since(start).as_millis() as u64,
                        "hard timeout reached, forcing PTT off"
                    );
                    self.release(now);
                    self.stats.hard_timeouts.fetch_add(1, Ordering::Relaxed);
                    self.timeout_latched = true;
                    frame.ptt_active = false;
                    return Err(BridgeError::Safety);
                }
            }
        }

        if amp > self.threshold {
            match self.state {
                VoxState::Idle if !self.timeout_latched => self.activate(now),
                VoxState::Transmitting => self.last_above = Some(now),
                VoxState::Idle => {}
            }
        } else {
            self.timeout_latched = false;
            if self.state == VoxState::Transmitting {
                if let Some(last) = self.last_above {
                    if now.duration_since(last) >= self.hangtime {
                        self.release(now);
                        self.stats.deactivations.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }

        frame.ptt_active = self.state == VoxState::Transmitting;
        Ok(())
    }

    /// Unconditional release, used at shutdown and on fatal conditions.
    /// Always fires the callback so the enforcement point ends up off.
    pub fn force_off(&mut self) {
        let was_transmitting = self.state == VoxState::Transmitting;
        if was_transmitting {
            self.release(Instant::now());
            self.stats.deactivations.fetch_add(1, Ordering::Relaxed);
        } else {
            self.state = VoxState::Idle;
            self.transmission_start = None;
            (self.ptt_cb)(false);
            self.stats.ptt_active.store(false, Ordering::Relaxed);
        }
    }

    fn activate(&mut self, now: Instant) {
        self.state = VoxState::Transmitting;
        self.transmission_start = Some(now);
        self.last_above = Some(now);
        (self.ptt_cb)(true);
        self.stats.activations.fetch_add(1, Ordering::Relaxed);
        self.stats.ptt_active.store(true, Ordering::Relaxed);
        debug!("PTT on: amplitude above threshold");
    }

    /// Common release path: accounts transmission time and fires the
    /// callback. Callers bump the counter for their reason.
    fn release(&mut self, now: Instant) {
        if let Some(start) = self.transmission_start.take() {
            let tx_ms = now.duration_since(start).as_millis() as u64;
            self.stats.total_tx_ms.fetch_add(tx_ms, Ordering::Relaxed);
        }
        self.state = VoxState::Idle;
        (self.ptt_cb)(false);
        self.stats.ptt_active.store(false, Ordering::Relaxed);
        debug!("PTT off");
    }
}
