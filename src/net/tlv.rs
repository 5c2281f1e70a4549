//! TLV datagram codec and the two components speaking it.
//!
//! Frames are `type (u8) | length (u16 LE) | value`. PCM frames carry 8 kHz
//! mono 16-bit LE audio; PTT start/stop are zero-length control frames. The
//! gateway keeps PTT commands out of the PCM queue entirely, so a backed-up
//! data path can never delay a key-up or, worse, a release.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::config::{MmdvmRxSection, MmdvmSection};
use crate::error::BridgeError;
use crate::frame::{unix_micros, AudioFrame, Source};
use crate::net::resolve_target;
use crate::stats::{DmrGatewayStats, MmdvmReceiverStats};

pub const TLV_TYPE_PCM: u8 = 0x00;
pub const TLV_TYPE_AMBE: u8 = 0x01;
pub const TLV_TYPE_PTT_START: u8 = 0x05;
pub const TLV_TYPE_PTT_STOP: u8 = 0x06;
pub const TLV_HEADER_LEN: usize = 3;

/// Wire sample format delivered by the modem.
pub const MODEM_SAMPLE_RATE: u32 = 8000;
pub const MODEM_CHANNELS: u16 = 1;

const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Split a datagram into `(type, value)`.
pub fn parse_frame(buf: &[u8]) -> Result<(u8, &[u8]), BridgeError> {
    if buf.len() < TLV_HEADER_LEN {
        return Err(BridgeError::WireFormat(format!(
            "TLV datagram too short: {} bytes",
            buf.len()
        )));
    }
    let ty = buf[0];
    let len = u16::from_le_bytes([buf[1], buf[2]]) as usize;
    if buf.len() < TLV_HEADER_LEN + len {
        return Err(BridgeError::WireFormat(format!(
            "TLV truncated: declared {} bytes, datagram carries {}",
            len,
            buf.len() - TLV_HEADER_LEN
        )));
    }
    Ok((ty, &buf[TLV_HEADER_LEN..TLV_HEADER_LEN + len]))
}

/// Assemble a TLV frame. Values are bounded by the u16 length field.
pub fn encode_frame(ty: u8, value: &[u8]) -> Bytes {
    debug_assert!(value.len() <= u16::MAX as usize);
    let mut b = BytesMut::with_capacity(TLV_HEADER_LEN + value.len());
    b.put_u8(ty);
    b.put_u16_le(value.len() as u16);
    b.extend_from_slice(value);
    b.freeze()
}

pub fn encode_ptt(on: bool) -> Bytes {
    encode_frame(if on { TLV_TYPE_PTT_START } else { TLV_TYPE_PTT_STOP }, &[])
}

/// Listens for TLV frames from the modem and feeds the RX pipeline.
pub struct MmdvmReceiver {
    socket: UdpSocket,
    buffer_size: usize,
    tx: Sender<AudioFrame>,
    running: Arc<AtomicBool>,
    stats: Arc<MmdvmReceiverStats>,
    sequence: u32,
}

impl MmdvmReceiver {
    pub fn bind(
        cfg: &MmdvmRxSection,
        tx: Sender<AudioFrame>,
        running: Arc<AtomicBool>,
        stats: Arc<MmdvmReceiverStats>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind((cfg.listen_address.as_str(), cfg.rx_port))
            .with_context(|| format!("bind MMDVM receiver {}:{}", cfg.listen_address, cfg.rx_port))?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;
        Ok(Self { socket, buffer_size: cfg.buffer_size, tx, running, stats, sequence: 0 })
    }

    pub fn run(mut self) {
        match self.socket.local_addr() {
            Ok(addr) => info!(%addr, "MMDVM receiver listening"),
            Err(_) => info!("MMDVM receiver listening"),
        }
        let mut buf = vec![0u8; self.buffer_size];
        while self.running.load(Ordering::Relaxed) {
            match self.socket.recv_from(&mut buf) {
                Ok((n, _peer)) => self.handle_datagram(&buf[..n]),
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    if self.running.load(Ordering::Relaxed) {
                        debug!(error = %e, "MMDVM receiver socket error");
                    }
                    break;
                }
            }
        }
        info!("MMDVM receiver stopped");
    }

    fn handle_datagram(&mut self, data: &[u8]) {
        let (ty, value) = match parse_frame(data) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "dropping TLV datagram");
                return;
            }
        };

        match ty {
            TLV_TYPE_PCM => {
                if value.is_empty() || value.len() % 2 != 0 {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    debug!(len = value.len(), "unusable PCM frame");
                    return;
                }
                let frame = AudioFrame::new(
                    value.to_vec(),
                    MODEM_SAMPLE_RATE,
                    MODEM_CHANNELS,
                    self.sequence,
                    unix_micros(),
                    Source::Mmdvm,
                );
                self.sequence = self.sequence.wrapping_add(1);
                match self.tx.try_send(frame) {
                    Ok(()) => {
                        self.stats.packets.fetch_add(1, Ordering::Relaxed);
                        self.stats
                            .bytes
                            .fetch_add(data.len() as u64, Ordering::Relaxed);
                    }
                    Err(_) => {
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            TLV_TYPE_AMBE => {
                self.stats.ambe_ignored.fetch_add(1, Ordering::Relaxed);
            }
            TLV_TYPE_PTT_START | TLV_TYPE_PTT_STOP => {
                // Not expected from the modem; count and move on.
                self.stats.control_ignored.fetch_add(1, Ordering::Relaxed);
                debug!(frame_type = ty, "ignoring unsolicited PTT frame");
            }
            other => {
                self.stats.unknown_ignored.fetch_add(1, Ordering::Relaxed);
                debug!(frame_type = other, "ignoring unknown TLV type");
            }
        }
    }
}

/// Out-of-band PTT command path into the modem. Shares the gateway socket
/// but never touches the PCM queue.
#[derive(Clone)]
pub struct PttHandle {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    stats: Arc<DmrGatewayStats>,
}

impl PttHandle {
    pub fn send_ptt(&self, on: bool) {
        match self.send(&encode_ptt(on)) {
            Ok(_) => {
                self.stats.ptt_commands.fetch_add(1, Ordering::Relaxed);
                self.stats.ptt_active.store(on, Ordering::Relaxed);
                debug!(on, "PTT command sent");
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, on, "failed to send PTT command");
            }
        }
    }

    fn send(&self, datagram: &[u8]) -> Result<usize, BridgeError> {
        Ok(self.socket.send_to(datagram, self.target)?)
    }
}

/// Sends VOX-approved PCM frames to the modem as TLV datagrams.
pub struct DmrGateway {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    rx: Receiver<AudioFrame>,
    running: Arc<AtomicBool>,
    stats: Arc<DmrGatewayStats>,
}

impl DmrGateway {
    pub fn new(
        cfg: &MmdvmSection,
        rx: Receiver<AudioFrame>,
        running: Arc<AtomicBool>,
        stats: Arc<DmrGatewayStats>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").context("bind DMR gateway socket")?;
        let target = resolve_target(&cfg.address, cfg.port)?;
        Ok(Self { socket: Arc::new(socket), target, rx, running, stats })
    }

    pub fn ptt_handle(&self) -> PttHandle {
        PttHandle {
            socket: self.socket.clone(),
            target: self.target,
            stats: self.stats.clone(),
        }
    }

    pub fn run(self) {
        info!(target = %self.target, "DMR gateway started");
        while self.running.load(Ordering::Relaxed) {
            let frame = match self.rx.recv_timeout(RECV_TIMEOUT) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            // VOX decides, this is the enforcement point.
            if !frame.ptt_active {
                self.stats.gated.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let datagram = encode_frame(TLV_TYPE_PCM, &frame.pcm);
            match self.send(&datagram) {
                Ok(n) => {
                    self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                    self.stats.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    debug!(error = %e, "TLV send failed, dropping frame");
                }
            }
        }
        info!("DMR gateway stopped");
    }

    fn send(&self, datagram: &[u8]) -> Result<usize, BridgeError> {
        Ok(self.socket.send_to(datagram, self.target)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    fn test_receiver(
        tx: Sender<AudioFrame>,
    ) -> (MmdvmReceiver, Arc<MmdvmReceiverStats>) {
        let cfg = MmdvmRxSection {
            listen_address: "127.0.0.1".into(),
            rx_port: 0,
            buffer_size: 4096,
        };
        let stats = Arc::new(MmdvmReceiverStats::default());
        let rx = MmdvmReceiver::bind(
            &cfg,
            tx,
            Arc::new(AtomicBool::new(true)),
            stats.clone(),
        )
        .unwrap();
        (rx, stats)
    }

    #[test]
    fn frame_roundtrip() {
        let value: Vec<u8> = (0..=255).collect();
        let wire = encode_frame(TLV_TYPE_PCM, &value);
        let (ty, parsed) = parse_frame(&wire).unwrap();
        assert_eq!(ty, TLV_TYPE_PCM);
        assert_eq!(parsed, &value[..]);
    }

    #[test]
    fn ptt_frames_are_three_bytes() {
        assert_eq!(&encode_ptt(true)[..], &[TLV_TYPE_PTT_START, 0, 0]);
        assert_eq!(&encode_ptt(false)[..], &[TLV_TYPE_PTT_STOP, 0, 0]);
        let ptt_frame = encode_ptt(true);
        let (ty, value) = parse_frame(&ptt_frame).unwrap();
        assert_eq!(ty, TLV_TYPE_PTT_START);
        assert!(value.is_empty());
    }

    #[test]
    fn short_and_truncated_datagrams_are_rejected() {
        assert!(parse_frame(&[]).is_err());
        assert!(parse_frame(&[TLV_TYPE_PCM, 4]).is_err());
        // Declares 4 bytes, carries 2.
        assert!(parse_frame(&[TLV_TYPE_PCM, 4, 0, 1, 2]).is_err());
    }

    #[test]
    fn trailing_bytes_beyond_declared_length_are_ignored() {
        let (ty, value) = parse_frame(&[TLV_TYPE_PCM, 2, 0, 7, 8, 99, 99]).unwrap();
        assert_eq!(ty, TLV_TYPE_PCM);
        assert_eq!(value, &[7, 8]);
    }

    #[test]
    fn pcm_frame_enters_the_pipeline() {
        let (q_tx, q_rx) = bounded(4);
        let (mut receiver, stats) = test_receiver(q_tx);
        let wire = encode_frame(TLV_TYPE_PCM, &[1, 0, 2, 0]);
        receiver.handle_datagram(&wire);
        let frame = q_rx.try_recv().unwrap();
        assert_eq!(frame.sample_rate, MODEM_SAMPLE_RATE);
        assert_eq!(frame.channels, MODEM_CHANNELS);
        assert_eq!(frame.pcm, vec![1, 0, 2, 0]);
        assert_eq!(frame.source, Source::Mmdvm);
        assert_eq!(frame.sequence, 0);
        assert_eq!(stats.packets.load(Ordering::Relaxed), 1);

        receiver.handle_datagram(&wire);
        assert_eq!(q_rx.try_recv().unwrap().sequence, 1);
    }

    #[test]
    fn ambe_and_unknown_types_are_counted_and_dropped() {
        let (q_tx, q_rx) = bounded(4);
        let (mut receiver, stats) = test_receiver(q_tx);
        receiver.handle_datagram(&encode_frame(TLV_TYPE_AMBE, &[0u8; 9]));
        receiver.handle_datagram(&encode_frame(0x42, &[0u8; 2]));
        assert_eq!(stats.ambe_ignored.load(Ordering::Relaxed), 1);
        assert_eq!(stats.unknown_ignored.load(Ordering::Relaxed), 1);
        assert!(q_rx.try_recv().is_err());
    }

    #[test]
    fn unsolicited_ptt_is_counted_and_dropped() {
        let (q_tx, q_rx) = bounded(4);
        let (mut receiver, stats) = test_receiver(q_tx);
        receiver.handle_datagram(&encode_ptt(true));
        assert_eq!(stats.control_ignored.load(Ordering::Relaxed), 1);
        assert_eq!(stats.errors.load(Ordering::Relaxed), 0);
        assert!(q_rx.try_recv().is_err());
    }

    #[test]
    fn send_failure_surfaces_as_io_error_and_counts() {
        // Destination port 0 is invalid, so the send itself fails.
        let (_q_tx, q_rx) = bounded::<AudioFrame>(1);
        let cfg = MmdvmSection {
            address: "127.0.0.1".into(),
            port: 0,
            buffer_size: 4096,
        };
        let stats = Arc::new(DmrGatewayStats::default());
        let gateway =
            DmrGateway::new(&cfg, q_rx, Arc::new(AtomicBool::new(true)), stats.clone()).unwrap();

        let handle = gateway.ptt_handle();
        assert!(matches!(
            handle.send(&encode_ptt(true)),
            Err(BridgeError::Io(_))
        ));
        handle.send_ptt(true);
        assert_eq!(stats.errors.load(Ordering::Relaxed), 1);
        assert_eq!(stats.ptt_commands.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn zero_length_pcm_is_counted_as_error() {
        let (q_tx, q_rx) = bounded(4);
        let (mut receiver, stats) = test_receiver(q_tx);
        receiver.handle_datagram(&encode_frame(TLV_TYPE_PCM, &[]));
        assert_eq!(stats.errors.load(Ordering::Relaxed), 1);
        assert!(q_rx.try_recv().is_err());
    }
}
