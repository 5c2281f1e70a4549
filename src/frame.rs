use std::time::{SystemTime, UNIX_EPOCH};

/// Where a frame entered the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Usrp,
    Mmdvm,
    LocalCapture,
}

/// The unit flowing through every pipeline queue.
///
/// `pcm` holds 16-bit little-endian signed samples, interleaved when
/// multi-channel. A frame is owned exclusively by the stage holding it;
/// moving it through a channel transfers that ownership, so stages may
/// mutate in place without aliasing.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_width: u16,
    /// Monotonic counter assigned by the ingress component.
    pub sequence: u32,
    /// Capture time, microseconds since the Unix epoch (set by ingress).
    pub timestamp_us: u64,
    pub source: Source,
    /// Set by VOX on TX frames while the controller is transmitting.
    pub ptt_active: bool,
    /// Set by the TX gate when the echo interlock attenuated this frame.
    pub echo_muted: bool,
    /// RMS amplitude, populated by VOX for telemetry.
    pub amplitude_rms: f32,
}

impl AudioFrame {
    pub fn new(
        pcm: Vec<u8>,
        sample_rate: u32,
        channels: u16,
        sequence: u32,
        timestamp_us: u64,
        source: Source,
    ) -> Self {
        Self {
            pcm,
            sample_rate,
            channels,
            sample_width: 2,
            sequence,
            timestamp_us,
            source,
            ptt_active: false,
            echo_muted: false,
            amplitude_rms: 0.0,
        }
    }

    /// Bytes per interleaved sample group.
    pub fn frame_bytes(&self) -> usize {
        self.sample_width.max(1) as usize * self.channels.max(1) as usize
    }

    /// Whether `pcm` length is a whole number of sample groups.
    pub fn is_aligned(&self) -> bool {
        !self.pcm.is_empty() && self.pcm.len() % self.frame_bytes() == 0
    }
}

pub fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_tracks_channel_count() {
        let mut f = AudioFrame::new(vec![0u8; 12], 8000, 1, 0, 0, Source::Usrp);
        assert!(f.is_aligned());
        f.channels = 2;
        assert!(f.is_aligned());
        f.pcm.truncate(10);
        assert!(!f.is_aligned());
        f.pcm.clear();
        assert!(!f.is_aligned());
    }
}
