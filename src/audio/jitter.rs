//! Receive-side jitter buffer with a phase-locked 20 ms output clock.
//!
//! Frames are kept in arrival order; on a loopback interface the modem's
//! ordering is trusted and no sequence reordering is attempted. The service
//! loop is polled at ~1 kHz: it tops the buffer up to the target depth,
//! enforces the hard cap, and emits one frame per tick of the output clock.
//! The emit timestamp advances by exactly one frame period per emission so
//! accumulated lateness catches up; an underrun resets the phase to the
//! current time so recovery does not burst.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use tracing::warn;

use crate::config::JitterSection;
use crate::frame::AudioFrame;
use crate::stats::JitterStats;

const EMIT_TIMEOUT: Duration = Duration::from_millis(100);

pub struct JitterBuffer {
    target_depth: usize,
    frame_time: Duration,
    buf: VecDeque<AudioFrame>,
    last_emit: Option<Instant>,
    stats: Arc<JitterStats>,
}

impl JitterBuffer {
    pub fn new(cfg: &JitterSection, stats: Arc<JitterStats>) -> Self {
        Self {
            target_depth: cfg.buffer_size,
            frame_time: Duration::from_millis(cfg.frame_time_ms),
            buf: VecDeque::new(),
            last_emit: None,
            stats,
        }
    }

    /// One poll iteration: refill, cap, and emit if the clock says so.
    pub fn service(
        &mut self,
        input: &Receiver<AudioFrame>,
        output: &Sender<AudioFrame>,
        now: Instant,
    ) {
        while self.buf.len() < self.target_depth {
            match input.try_recv() {
                Ok(frame) => {
                    self.buf.push_back(frame);
                    self.stats.buffered.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => break,
            }
        }

        while self.buf.len() > self.target_depth * 2 {
            self.buf.pop_front();
            self.stats.overflow_drops.fetch_add(1, Ordering::Relaxed);
            warn!("jitter buffer overflow, dropping oldest frame");
        }

        match self.last_emit {
            None => {
                if let Some(frame) = self.buf.pop_front() {
                    self.emit(frame, output);
                    self.last_emit = Some(now);
                }
            }
            Some(last) => {
                if now.duration_since(last) >= self.frame_time {
                    if let Some(frame) = self.buf.pop_front() {
                        self.emit(frame, output);
                        // Phase-locked: late emissions catch up over the
                        // following poll iterations.
                        self.last_emit = Some(last + self.frame_time);
                    } else {
                        self.stats.underruns.fetch_add(1, Ordering::Relaxed);
                        self.last_emit = Some(now);
                    }
                }
            }
        }
    }

    #[cfg(test)]
    fn depth(&self) -> usize {
        self.buf.len()
    }

    fn emit(&self, frame: AudioFrame, output: &Sender<AudioFrame>) {
        match output.send_timeout(frame, EMIT_TIMEOUT) {
            Ok(()) => {
                self.stats.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.late_drops.fetch_add(1, Ordering::Relaxed);
                warn!("downstream queue blocked for 100ms, dropping paced frame");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::samples_to_pcm;
    use crate::frame::Source;
    use crossbeam_channel::bounded;

    fn frame(seq: u32) -> AudioFrame {
        AudioFrame::new(
            samples_to_pcm(&[0i16; 160]),
            8000,
            1,
            seq,
            seq as u64 * 20_000,
            Source::Mmdvm,
        )
    }

    fn buffer() -> (JitterBuffer, Arc<JitterStats>) {
        let stats = Arc::new(JitterStats::default());
        (JitterBuffer::new(&JitterSection::default(), stats.clone()), stats)
    }

    #[test]
    fn first_frame_emits_immediately() {
        let (mut jb, _stats) = buffer();
        let (in_tx, in_rx) = bounded(100);
        let (out_tx, out_rx) = bounded(100);
        in_tx.send(frame(0)).unwrap();
        jb.service(&in_rx, &out_tx, Instant::now());
        assert_eq!(out_rx.try_recv().unwrap().sequence, 0);
    }

    #[test]
    fn steady_state_emits_one_frame_per_period() {
        let (mut jb, stats) = buffer();
        let (in_tx, in_rx) = bounded(100);
        let (out_tx, out_rx) = bounded(100);
        let t0 = Instant::now();

        for seq in 0..20 {
            in_tx.send(frame(seq)).unwrap();
        }
        // Poll at 1 ms over 200 ms of synthetic time.
        for tick in 0..200 {
            jb.service(&in_rx, &out_tx, t0 + Duration::from_millis(tick));
        }
        // One immediate emission plus one per elapsed 20 ms period.
        let emitted: Vec<u32> = out_rx.try_iter().map(|f| f.sequence).collect();
        assert_eq!(emitted.len(), 10);
        assert_eq!(emitted, (0..10).collect::<Vec<_>>());
        assert_eq!(stats.underruns.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn underrun_counts_and_resets_phase() {
        let (mut jb, stats) = buffer();
        let (in_tx, in_rx) = bounded(100);
        let (out_tx, out_rx) = bounded(100);
        let t0 = Instant::now();

        in_tx.send(frame(0)).unwrap();
        jb.service(&in_rx, &out_tx, t0);
        assert_eq!(out_rx.try_recv().unwrap().sequence, 0);

        // Clock fires with an empty buffer: underrun, phase reset.
        let t_gap = t0 + Duration::from_millis(25);
        jb.service(&in_rx, &out_tx, t_gap);
        assert_eq!(stats.underruns.load(Ordering::Relaxed), 1);

        // A frame arriving 5 ms later must wait a full period from the
        // reset, not emit in a burst.
        in_tx.send(frame(1)).unwrap();
        jb.service(&in_rx, &out_tx, t_gap + Duration::from_millis(5));
        assert!(out_rx.try_recv().is_err());
        jb.service(&in_rx, &out_tx, t_gap + Duration::from_millis(20));
        assert_eq!(out_rx.try_recv().unwrap().sequence, 1);
    }

    #[test]
    fn fill_stops_at_target_depth() {
        let (mut jb, stats) = buffer();
        // target 3: deliver 10 frames while the clock is stalled.
        let (in_tx, in_rx) = bounded(100);
        let (out_tx, out_rx) = bounded(100);
        let t0 = Instant::now();

        for seq in 0..10 {
            in_tx.send(frame(seq)).unwrap();
        }
        jb.service(&in_rx, &out_tx, t0);
        // Fill stops at the target depth, so no overflow yet.
        assert_eq!(stats.overflow_drops.load(Ordering::Relaxed), 0);
        // First frame emitted immediately, two buffered.
        assert_eq!(out_rx.try_recv().unwrap().sequence, 0);
        assert_eq!(jb.depth(), 2);
    }

    #[test]
    fn late_emission_catches_up() {
        let (mut jb, stats) = buffer();
        let (in_tx, in_rx) = bounded(100);
        let (out_tx, out_rx) = bounded(100);
        let t0 = Instant::now();

        for seq in 0..4 {
            in_tx.send(frame(seq)).unwrap();
        }
        jb.service(&in_rx, &out_tx, t0); // immediate emit, phase = t0
        // The poll thread stalls for 60 ms; three periods are owed.
        let late = t0 + Duration::from_millis(60);
        jb.service(&in_rx, &out_tx, late);
        jb.service(&in_rx, &out_tx, late + Duration::from_millis(1));
        jb.service(&in_rx, &out_tx, late + Duration::from_millis(2));
        let emitted: Vec<u32> = out_rx.try_iter().map(|f| f.sequence).collect();
        assert_eq!(emitted, vec![0, 1, 2, 3]);
        assert_eq!(stats.underruns.load(Ordering::Relaxed), 0);
    }
}
