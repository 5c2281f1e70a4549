//! Gain, AGC, and the interception plugin chain.
//!
//! The TX instance normalises every ingress frame to 8 kHz mono before
//! applying gain; the RX instance trusts the wire contract (already 8 kHz
//! mono) and skips resampling.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::warn;

use crate::audio::{self, resampler::Resampler};
use crate::config::{AudioSection, ProcessingSection};
use crate::error::BridgeError;
use crate::frame::AudioFrame;
use crate::stats::ProcessorStats;

/// A stage in the interception chain: 16-bit LE mono PCM at 8 kHz in, same
/// format out. The chain is populated at startup and frozen.
pub type PcmPlugin = Box<dyn Fn(&[u8]) -> anyhow::Result<Vec<u8>> + Send>;

pub struct AudioProcessor {
    target_rate: u32,
    target_channels: u16,
    gain: f32,
    gain_min: f32,
    gain_max: f32,
    enable_agc: bool,
    agc_threshold_db: f32,
    intercept_enabled: bool,
    plugins: Vec<PcmPlugin>,
    resampler: Resampler,
    stats: Arc<ProcessorStats>,
}

impl AudioProcessor {
    pub fn new(
        audio: &AudioSection,
        processing: &ProcessingSection,
        stats: Arc<ProcessorStats>,
    ) -> Self {
        Self {
            target_rate: audio.sample_rate,
            target_channels: audio.channels,
            gain: audio.gain,
            gain_min: audio.gain_min,
            gain_max: audio.gain_max,
            enable_agc: audio.enable_agc,
            agc_threshold_db: audio.agc_threshold_db,
            intercept_enabled: processing.enable_interception_pipe,
            plugins: Vec::new(),
            resampler: Resampler::new(audio.sample_rate, audio.channels),
            stats,
        }
    }

    pub fn register_plugin(&mut self, plugin: PcmPlugin) {
        self.plugins.push(plugin);
    }

    /// TX path: resample to target format, then gain, AGC, plugins.
    pub fn process_tx(&mut self, frame: &mut AudioFrame) {
        if frame.sample_rate != self.target_rate || frame.channels != self.target_channels {
            frame.pcm = self
                .resampler
                .resample(&frame.pcm, frame.sample_rate, frame.channels);
            frame.sample_rate = self.target_rate;
            frame.channels = self.target_channels;
            self.stats.resampled.fetch_add(1, Ordering::Relaxed);
        }
        self.apply_common(frame);
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// RX path: gain, AGC, plugins. The modem wire contract already
    /// delivers 8 kHz mono, so no resampling.
    pub fn process_rx(&mut self, frame: &mut AudioFrame) {
        self.apply_common(frame);
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn apply_common(&self, frame: &mut AudioFrame) {
        let gain = self.gain.clamp(self.gain_min, self.gain_max);
        apply_gain(&mut frame.pcm, gain);
        if self.enable_agc {
            self.apply_agc(&mut frame.pcm);
        }
        if self.intercept_enabled {
            self.run_plugins(&mut frame.pcm);
        }
    }

    /// Per-frame RMS-tracked gain toward the configured target level.
    fn apply_agc(&self, pcm: &mut [u8]) {
        let rms = audio::rms(pcm);
        if rms == 0.0 {
            return;
        }
        let rms_db = 20.0 * (rms / 32768.0).log10();
        let gain_db = self.agc_threshold_db - rms_db;
        let gain = 10f32.powf(gain_db / 20.0).clamp(0.1, 10.0);
        apply_gain(pcm, gain);
    }

    /// Run the buffer through the chain in order. A plugin error or a
    /// misaligned return halts the chain; the buffer as it stood before the
    /// failing plugin is kept.
    fn run_plugins(&self, pcm: &mut Vec<u8>) {
        for (idx, plugin) in self.plugins.iter().enumerate() {
            match plugin(pcm) {
                Ok(out) if out.len() % 2 == 0 => *pcm = out,
                Ok(out) => {
                    self.stats.plugin_errors.fetch_add(1, Ordering::Relaxed);
                    let err = BridgeError::Plugin(format!(
                        "plugin {idx} returned misaligned buffer ({} bytes)",
                        out.len()
                    ));
                    warn!(error = %err, "interception chain halted");
                    break;
                }
                Err(e) => {
                    self.stats.plugin_errors.fetch_add(1, Ordering::Relaxed);
                    let err = BridgeError::Plugin(format!("plugin {idx}: {e}"));
                    warn!(error = %err, "interception chain halted");
                    break;
                }
            }
        }
    }
}

/// Multiply every sample by `gain`, clipping to the int16 range before the
/// cast so overflow can never wrap.
pub fn apply_gain(pcm: &mut [u8], gain: f32) {
    for c in pcm.chunks_exact_mut(2) {
        let s = i16::from_le_bytes([c[0], c[1]]) as f32 * gain;
        let v = s.round().clamp(-32768.0, 32767.0) as i16;
        c.copy_from_slice(&v.to_le_bytes());
    }
}
