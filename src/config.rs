//! CLI surface and JSON configuration.
//!
//! Every section is optional in the file; missing keys fall back to the
//! defaults below. Out-of-range values are rejected at load time, before
//! any socket is bound.

use clap::Parser;
use serde::Deserialize;

use crate::error::BridgeError;

#[derive(Parser, Debug, Clone)]
#[command(name = "usrp-bridge", about = "Bidirectional USRP/MMDVM analog radio bridge")]
pub struct Cli {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "config.json")]
    pub config: String,

    /// Enable verbose (debug) logging.
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub usrp: UsrpSection,
    pub usrp_client: UsrpClientSection,
    pub mmdvm: MmdvmSection,
    pub mmdvm_rx: MmdvmRxSection,
    pub audio: AudioSection,
    pub vox: VoxSection,
    pub jitter_buffer: JitterSection,
    pub echo_interlock: EchoInterlockSection,
    pub processing: ProcessingSection,
    pub capture: CaptureSection,
    pub stats: StatsSection,
    pub queues: QueueSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UsrpSection {
    pub listen_address: String,
    pub listen_port: u16,
    pub buffer_size: usize,
}

impl Default for UsrpSection {
    fn default() -> Self {
        Self { listen_address: "0.0.0.0".into(), listen_port: 40001, buffer_size: 4096 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UsrpClientSection {
    pub target_address: String,
    pub target_port: u16,
}

impl Default for UsrpClientSection {
    fn default() -> Self {
        Self { target_address: "127.0.0.1".into(), target_port: 40001 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MmdvmSection {
    pub address: String,
    pub port: u16,
    pub buffer_size: usize,
}

impl Default for MmdvmSection {
    fn default() -> Self {
        Self { address: "127.0.0.1".into(), port: 33100, buffer_size: 4096 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MmdvmRxSection {
    pub listen_address: String,
    pub rx_port: u16,
    pub buffer_size: usize,
}

impl Default for MmdvmRxSection {
    fn default() -> Self {
        Self { listen_address: "0.0.0.0".into(), rx_port: 33101, buffer_size: 4096 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioSection {
    /// Target rate for everything past the TX resampler; the modem wire
    /// contract is 8 kHz.
    pub sample_rate: u32,
    pub channels: u16,
    pub gain: f32,
    pub gain_min: f32,
    pub gain_max: f32,
    pub enable_agc: bool,
    pub agc_threshold_db: f32,
}

impl Default for AudioSection {
    fn default() -> Self {
        Self {
            sample_rate: 8000,
            channels: 1,
            gain: 1.0,
            gain_min: 0.0,
            gain_max: 10.0,
            enable_agc: false,
            agc_threshold_db: -20.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoxSection {
    /// RMS amplitude that keys the transmitter.
    pub threshold: f32,
    pub hangtime_ms: u64,
    pub hard_timeout_ms: u64,
}

impl Default for VoxSection {
    fn default() -> Self {
        Self { threshold: 1000.0, hangtime_ms: 600, hard_timeout_ms: 60_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JitterSection {
    pub frame_time_ms: u64,
    /// Target depth in frames; the hard cap is twice this.
    pub buffer_size: usize,
}

impl Default for JitterSection {
    fn default() -> Self {
        Self { frame_time_ms: 20, buffer_size: 3 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EchoInterlockSection {
    pub enable: bool,
    pub rx_timeout_ms: u64,
    pub tx_mute_gain: f32,
}

impl Default for EchoInterlockSection {
    fn default() -> Self {
        Self { enable: true, rx_timeout_ms: 200, tx_mute_gain: 0.0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingSection {
    pub enable_interception_pipe: bool,
}

impl Default for ProcessingSection {
    fn default() -> Self {
        Self { enable_interception_pipe: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureSection {
    pub enable: bool,
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_ms: u32,
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self { enable: false, sample_rate: 16_000, channels: 1, frame_ms: 20 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatsSection {
    pub enable: bool,
    pub interval_secs: u64,
}

impl Default for StatsSection {
    fn default() -> Self {
        Self { enable: true, interval_secs: 30 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    /// Capacity of every pipeline queue, in frames.
    pub capacity: usize,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, BridgeError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("cannot read {path}: {e}")))?;
        let cfg: Config = serde_json::from_str(&text)
            .map_err(|e| BridgeError::Config(format!("invalid JSON in {path}: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        let a = &self.audio;
        if a.sample_rate == 0 || a.sample_rate > 96_000 {
            return Err(BridgeError::Config(format!(
                "audio.sample_rate out of range: {}",
                a.sample_rate
            )));
        }
        if a.channels == 0 || a.channels > 8 {
            return Err(BridgeError::Config(format!(
                "audio.channels out of range: {}",
                a.channels
            )));
        }
        if a.gain_min > a.gain_max {
            return Err(BridgeError::Config(format!(
                "audio.gain_min {} exceeds gain_max {}",
                a.gain_min, a.gain_max
            )));
        }
        if !(a.gain_min..=a.gain_max).contains(&a.gain) {
            return Err(BridgeError::Config(format!(
                "audio.gain {} outside [{}, {}]",
                a.gain, a.gain_min, a.gain_max
            )));
        }
        if self.vox.threshold < 0.0 {
            return Err(BridgeError::Config(format!(
                "vox.threshold must be non-negative: {}",
                self.vox.threshold
            )));
        }
        if self.vox.hard_timeout_ms == 0 {
            return Err(BridgeError::Config("vox.hard_timeout_ms must be positive".into()));
        }
        if self.jitter_buffer.frame_time_ms == 0 || self.jitter_buffer.buffer_size == 0 {
            return Err(BridgeError::Config(
                "jitter_buffer.frame_time_ms and buffer_size must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.echo_interlock.tx_mute_gain) {
            return Err(BridgeError::Config(format!(
                "echo_interlock.tx_mute_gain outside [0, 1]: {}",
                self.echo_interlock.tx_mute_gain
            )));
        }
        if self.capture.enable && (self.capture.sample_rate == 0 || self.capture.frame_ms == 0) {
            return Err(BridgeError::Config(
                "capture.sample_rate and frame_ms must be positive".into(),
            ));
        }
        if self.queues.capacity == 0 {
            return Err(BridgeError::Config("queues.capacity must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.usrp.listen_port, 40001);
        assert_eq!(cfg.usrp_client.target_port, 40001);
        assert_eq!(cfg.mmdvm.port, 33100);
        assert_eq!(cfg.mmdvm_rx.rx_port, 33101);
        assert_eq!(cfg.audio.sample_rate, 8000);
        assert_eq!(cfg.vox.hangtime_ms, 600);
        assert_eq!(cfg.jitter_buffer.frame_time_ms, 20);
        assert!(cfg.echo_interlock.enable);
        assert!(!cfg.capture.enable);
        assert_eq!(cfg.queues.capacity, 100);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{"vox": {"threshold": 1500}, "mmdvm": {"port": 34100}}"#,
        )
        .unwrap();
        assert_eq!(cfg.vox.threshold, 1500.0);
        assert_eq!(cfg.vox.hangtime_ms, 600);
        assert_eq!(cfg.mmdvm.port, 34100);
        assert_eq!(cfg.mmdvm.address, "127.0.0.1");
    }

    #[test]
    fn out_of_range_values_are_fatal() {
        let mut cfg = Config::default();
        cfg.audio.sample_rate = 192_000;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.audio.gain = 99.0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.echo_interlock.tx_mute_gain = 2.0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.jitter_buffer.buffer_size = 0;
        assert!(cfg.validate().is_err());
    }
}
