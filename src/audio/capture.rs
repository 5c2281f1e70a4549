//! Optional local audio capture feeding the TX pipeline.
//!
//! A cpal input stream writes device samples into an SPSC ring; the bridge
//! runs a framer thread that pulls fixed frames out of the ring and injects
//! them into the TX ingress queue tagged `local_capture`. The device does
//! not have to honour the configured format: multi-channel input is
//! averaged down to mono in the callback, and whatever rate the device
//! actually runs at is carried on the frame for the TX resampler to
//! normalise.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapRb,
};
use tracing::warn;

use crate::config::CaptureSection;
use crate::stats::CaptureStats;

/// Ring depth in frames. A framer thread stalled this long sheds samples at
/// the ring instead of blocking the driver callback.
const RING_FRAMES: usize = 64;

pub struct CaptureSource {
    _stream: cpal::Stream,
    cons: Arc<Mutex<HeapCons<i16>>>,
    frame_samples: usize,
    sample_rate: u32,
}

// Safety: the cpal stream handle is not Sync on every platform. It is
// write-once here: created, started, then held only to keep the stream
// alive. All sample traffic goes through the mutex-guarded ring ends, one
// thread per end, which is the access pattern these impls assert.
unsafe impl Send for CaptureSource {}
unsafe impl Sync for CaptureSource {}

impl CaptureSource {
    pub fn start(cfg: &CaptureSection, stats: Arc<CaptureStats>) -> Result<Self> {
        let host = cpal::default_host();
        let dev = host
            .default_input_device()
            .ok_or(anyhow!("no input device"))?;

        let (stream_cfg, device_channels) = input_config(&dev, cfg)?;
        let sample_rate = stream_cfg.sample_rate.0;
        let frame_samples = sample_rate as usize * cfg.frame_ms as usize / 1000;

        let rb = HeapRb::<i16>::new(frame_samples * RING_FRAMES);
        let (prod, cons) = rb.split();
        let prod = Arc::new(Mutex::new(prod));
        let cons = Arc::new(Mutex::new(cons));

        let cb_prod = prod.clone();
        let cb_stats = stats.clone();
        let ch = device_channels as usize;
        let stream = dev.build_input_stream(
            &stream_cfg,
            move |data: &[i16], _| {
                let mut p = cb_prod.lock();
                if ch <= 1 {
                    for &s in data {
                        if p.try_push(s).is_err() {
                            cb_stats.ring_overflows.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                } else {
                    // Average the interleaved channels down to mono.
                    for group in data.chunks_exact(ch) {
                        let sum: i32 = group.iter().map(|&s| s as i32).sum();
                        let mono = (sum as f32 / ch as f32).round() as i16;
                        if p.try_push(mono).is_err() {
                            cb_stats.ring_overflows.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            },
            move |err| {
                warn!(error = %err, "capture stream error");
            },
            None,
        )?;
        stream.play()?;

        Ok(Self { _stream: stream, cons, frame_samples, sample_rate })
    }

    /// Pull one full frame out of the ring. Returns false until enough
    /// samples have accumulated; `out` is only written on success.
    pub fn read_frame(&self, out: &mut [i16]) -> bool {
        if out.len() != self.frame_samples {
            return false;
        }
        let mut c = self.cons.lock();
        if c.occupied_len() < out.len() {
            return false;
        }
        let mut got = 0usize;
        while got < out.len() {
            match c.try_pop() {
                Some(v) => {
                    out[got] = v;
                    got += 1;
                }
                None => break,
            }
        }
        got == out.len()
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Choose the stream config for the capture device.
///
/// The TX processor resamples and mixes down everything it ingests, so the
/// configured rate and channel count are preferences, not requirements: one
/// scan picks the friendliest channel count among the ranges covering the
/// configured rate, and when no range covers it the device's default config
/// is used as-is and the resampler absorbs the difference.
fn input_config(dev: &cpal::Device, cfg: &CaptureSection) -> Result<(cpal::StreamConfig, u16)> {
    let mut best_channels: Option<u16> = None;
    if let Ok(ranges) = dev.supported_input_configs() {
        for range in ranges {
            let covers_rate = range.min_sample_rate().0 <= cfg.sample_rate
                && range.max_sample_rate().0 >= cfg.sample_rate;
            if !covers_rate {
                continue;
            }
            let ch = range.channels();
            if ch == cfg.channels {
                best_channels = Some(ch);
                break;
            }
            // Fewer channels means less mixdown work in the callback.
            best_channels = Some(best_channels.map_or(ch, |best| best.min(ch)));
        }
    }

    if let Some(channels) = best_channels {
        return Ok((
            cpal::StreamConfig {
                channels,
                sample_rate: cpal::SampleRate(cfg.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            },
            channels,
        ));
    }

    let fallback = dev
        .default_input_config()
        .context("no usable input configuration")?;
    let channels = fallback.channels();
    Ok((fallback.config(), channels))
}
