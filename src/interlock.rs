//! Echo interlock coupling the two pipeline directions.
//!
//! The RX stage notes activity for every frame the jitter buffer delivers;
//! the TX stage asks, just before the VOX decision, whether radio audio was
//! heard recently. While it was, TX frames are attenuated and gated so the
//! bridge never keys the transmitter on its own received audio.
//!
//! State is a pair of atomics (active flag + last-activity nanoseconds
//! against a monotonic epoch); Release stores on the RX side pair with
//! Acquire loads on the TX side.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::EchoInterlockSection;

pub struct EchoInterlock {
    enable: bool,
    rx_timeout: Duration,
    mute_gain: f32,
    epoch: Instant,
    rx_active: AtomicBool,
    rx_last_nanos: AtomicU64,
}

impl EchoInterlock {
    pub fn new(cfg: &EchoInterlockSection) -> Self {
        Self {
            enable: cfg.enable,
            rx_timeout: Duration::from_millis(cfg.rx_timeout_ms),
            mute_gain: cfg.tx_mute_gain,
            epoch: Instant::now(),
            rx_active: AtomicBool::new(false),
            rx_last_nanos: AtomicU64::new(0),
        }
    }

    /// Record RX activity at `now`. Called for every frame the jitter
    /// buffer emits.
    pub fn note_rx_active(&self, now: Instant) {
        self.rx_last_nanos
            .store(self.nanos_since_epoch(now), Ordering::Release);
        self.rx_active.store(true, Ordering::Release);
    }

    /// Whether TX must be muted at `now`. Expires the RX flag once the
    /// configured window has passed.
    pub fn is_tx_muted(&self, now: Instant) -> bool {
        if !self.enable {
            return false;
        }
        if self.rx_active.load(Ordering::Acquire) {
            let last = self.rx_last_nanos.load(Ordering::Acquire);
            let elapsed = self.nanos_since_epoch(now).saturating_sub(last);
            if elapsed > self.rx_timeout.as_nanos() as u64 {
                self.rx_active.store(false, Ordering::Release);
            }
        }
        self.rx_active.load(Ordering::Acquire)
    }

    /// The gain TX should apply at `now`.
    pub fn tx_gain(&self, gain: f32, now: Instant) -> f32 {
        if self.is_tx_muted(now) {
            gain * self.mute_gain
        } else {
            gain
        }
    }

    fn nanos_since_epoch(&self, now: Instant) -> u64 {
        now.duration_since(self.epoch).as_nanos() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interlock(enable: bool, rx_timeout_ms: u64, tx_mute_gain: f32) -> EchoInterlock {
        EchoInterlock::new(&EchoInterlockSection { enable, rx_timeout_ms, tx_mute_gain })
    }

    #[test]
    fn mutes_within_window_and_expires_after() {
        let il = interlock(true, 200, 0.0);
        let t0 = Instant::now() + Duration::from_secs(1);
        assert!(!il.is_tx_muted(t0));

        il.note_rx_active(t0);
        assert!(il.is_tx_muted(t0 + Duration::from_millis(10)));
        assert!(il.is_tx_muted(t0 + Duration::from_millis(190)));
        assert!(!il.is_tx_muted(t0 + Duration::from_millis(201)));
        // Stays expired without new activity.
        assert!(!il.is_tx_muted(t0 + Duration::from_millis(150)));
    }

    #[test]
    fn fresh_activity_extends_the_window() {
        let il = interlock(true, 200, 0.0);
        let t0 = Instant::now() + Duration::from_secs(1);
        il.note_rx_active(t0);
        il.note_rx_active(t0 + Duration::from_millis(150));
        assert!(il.is_tx_muted(t0 + Duration::from_millis(300)));
        assert!(!il.is_tx_muted(t0 + Duration::from_millis(400)));
    }

    #[test]
    fn tx_gain_applies_mute_factor() {
        let il = interlock(true, 200, 0.1);
        let t0 = Instant::now() + Duration::from_secs(1);
        il.note_rx_active(t0);
        let muted = il.tx_gain(2.0, t0 + Duration::from_millis(50));
        assert!((muted - 0.2).abs() < f32::EPSILON);
        let clear = il.tx_gain(2.0, t0 + Duration::from_millis(500));
        assert!((clear - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn disabled_interlock_never_mutes() {
        let il = interlock(false, 200, 0.0);
        let t0 = Instant::now() + Duration::from_secs(1);
        il.note_rx_active(t0);
        assert!(!il.is_tx_muted(t0 + Duration::from_millis(10)));
        assert_eq!(il.tx_gain(1.0, t0 + Duration::from_millis(10)), 1.0);
    }
}
