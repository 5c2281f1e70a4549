//! Per-component counters and the aggregate operator snapshot.
//!
//! Counters are plain relaxed atomics bumped on the hot paths; `snapshot()`
//! turns them into serialisable structs the stats reporter logs as JSON.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

#[derive(Default)]
pub struct UsrpServerStats {
    pub packets: AtomicU64,
    pub control_packets: AtomicU64,
    pub errors: AtomicU64,
    pub dropped: AtomicU64,
    pub high_water_seq: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct UsrpServerSnapshot {
    pub packets: u64,
    pub control_packets: u64,
    pub errors: u64,
    pub dropped: u64,
    pub high_water_seq: u64,
}

impl UsrpServerStats {
    pub fn snapshot(&self) -> UsrpServerSnapshot {
        UsrpServerSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            control_packets: self.control_packets.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            high_water_seq: self.high_water_seq.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
pub struct UsrpClientStats {
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub errors: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct UsrpClientSnapshot {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub errors: u64,
}

impl UsrpClientStats {
    pub fn snapshot(&self) -> UsrpClientSnapshot {
        UsrpClientSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
pub struct MmdvmReceiverStats {
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
    pub errors: AtomicU64,
    pub dropped: AtomicU64,
    pub ambe_ignored: AtomicU64,
    pub control_ignored: AtomicU64,
    pub unknown_ignored: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct MmdvmReceiverSnapshot {
    pub packets: u64,
    pub bytes: u64,
    pub errors: u64,
    pub dropped: u64,
    pub ambe_ignored: u64,
    pub control_ignored: u64,
    pub unknown_ignored: u64,
}

impl MmdvmReceiverStats {
    pub fn snapshot(&self) -> MmdvmReceiverSnapshot {
        MmdvmReceiverSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            ambe_ignored: self.ambe_ignored.load(Ordering::Relaxed),
            control_ignored: self.control_ignored.load(Ordering::Relaxed),
            unknown_ignored: self.unknown_ignored.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
pub struct DmrGatewayStats {
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub errors: AtomicU64,
    pub ptt_commands: AtomicU64,
    pub gated: AtomicU64,
    pub ptt_active: AtomicBool,
}

#[derive(Debug, Serialize)]
pub struct DmrGatewaySnapshot {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub errors: u64,
    pub ptt_commands: u64,
    pub gated: u64,
    pub ptt_active: bool,
}

impl DmrGatewayStats {
    pub fn snapshot(&self) -> DmrGatewaySnapshot {
        DmrGatewaySnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            ptt_commands: self.ptt_commands.load(Ordering::Relaxed),
            gated: self.gated.load(Ordering::Relaxed),
            ptt_active: self.ptt_active.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
pub struct ProcessorStats {
    pub processed: AtomicU64,
    pub resampled: AtomicU64,
    pub plugin_errors: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct ProcessorSnapshot {
    pub processed: u64,
    pub resampled: u64,
    pub plugin_errors: u64,
}

impl ProcessorStats {
    pub fn snapshot(&self) -> ProcessorSnapshot {
        ProcessorSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            resampled: self.resampled.load(Ordering::Relaxed),
            plugin_errors: self.plugin_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
pub struct VoxStats {
    pub activations: AtomicU64,
    pub deactivations: AtomicU64,
    pub hard_timeouts: AtomicU64,
    pub total_tx_ms: AtomicU64,
    pub ptt_active: AtomicBool,
}

#[derive(Debug, Serialize)]
pub struct VoxSnapshot {
    pub activations: u64,
    pub deactivations: u64,
    pub hard_timeouts: u64,
    pub total_tx_ms: u64,
    pub ptt_active: bool,
}

impl VoxStats {
    pub fn snapshot(&self) -> VoxSnapshot {
        VoxSnapshot {
            activations: self.activations.load(Ordering::Relaxed),
            deactivations: self.deactivations.load(Ordering::Relaxed),
            hard_timeouts: self.hard_timeouts.load(Ordering::Relaxed),
            total_tx_ms: self.total_tx_ms.load(Ordering::Relaxed),
            ptt_active: self.ptt_active.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
pub struct JitterStats {
    pub buffered: AtomicU64,
    pub emitted: AtomicU64,
    pub overflow_drops: AtomicU64,
    pub underruns: AtomicU64,
    pub late_drops: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct JitterSnapshot {
    pub buffered: u64,
    pub emitted: u64,
    pub overflow_drops: u64,
    pub underruns: u64,
    pub late_drops: u64,
}

impl JitterStats {
    pub fn snapshot(&self) -> JitterSnapshot {
        JitterSnapshot {
            buffered: self.buffered.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            overflow_drops: self.overflow_drops.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            late_drops: self.late_drops.load(Ordering::Relaxed),
        }
    }
}

/// Drops and mutes accounted by the pipeline glue itself.
#[derive(Default)]
pub struct PipelineStats {
    pub tx_queue_drops: AtomicU64,
    pub rx_queue_drops: AtomicU64,
    pub gate_drops: AtomicU64,
    pub interlock_muted: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct PipelineSnapshot {
    pub tx_queue_drops: u64,
    pub rx_queue_drops: u64,
    pub gate_drops: u64,
    pub interlock_muted: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineSnapshot {
        PipelineSnapshot {
            tx_queue_drops: self.tx_queue_drops.load(Ordering::Relaxed),
            rx_queue_drops: self.rx_queue_drops.load(Ordering::Relaxed),
            gate_drops: self.gate_drops.load(Ordering::Relaxed),
            interlock_muted: self.interlock_muted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
pub struct CaptureStats {
    pub frames: AtomicU64,
    pub ring_overflows: AtomicU64,
    pub queue_drops: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct CaptureSnapshot {
    pub frames: u64,
    pub ring_overflows: u64,
    pub queue_drops: u64,
}

impl CaptureStats {
    pub fn snapshot(&self) -> CaptureSnapshot {
        CaptureSnapshot {
            frames: self.frames.load(Ordering::Relaxed),
            ring_overflows: self.ring_overflows.load(Ordering::Relaxed),
            queue_drops: self.queue_drops.load(Ordering::Relaxed),
        }
    }
}

/// All counter blocks, shared between the components and the reporter.
pub struct BridgeStats {
    pub usrp_server: Arc<UsrpServerStats>,
    pub usrp_client: Arc<UsrpClientStats>,
    pub mmdvm_receiver: Arc<MmdvmReceiverStats>,
    pub dmr_gateway: Arc<DmrGatewayStats>,
    pub processor_tx: Arc<ProcessorStats>,
    pub processor_rx: Arc<ProcessorStats>,
    pub vox: Arc<VoxStats>,
    pub jitter: Arc<JitterStats>,
    pub pipeline: Arc<PipelineStats>,
    pub capture: Arc<CaptureStats>,
}

#[derive(Debug, Serialize)]
pub struct BridgeSnapshot {
    pub usrp_server: UsrpServerSnapshot,
    pub usrp_client: UsrpClientSnapshot,
    pub mmdvm_receiver: MmdvmReceiverSnapshot,
    pub dmr_gateway: DmrGatewaySnapshot,
    pub processor_tx: ProcessorSnapshot,
    pub processor_rx: ProcessorSnapshot,
    pub vox: VoxSnapshot,
    pub jitter: JitterSnapshot,
    pub pipeline: PipelineSnapshot,
    pub capture: CaptureSnapshot,
}

impl BridgeStats {
    pub fn new() -> Self {
        Self {
            usrp_server: Arc::new(UsrpServerStats::default()),
            usrp_client: Arc::new(UsrpClientStats::default()),
            mmdvm_receiver: Arc::new(MmdvmReceiverStats::default()),
            dmr_gateway: Arc::new(DmrGatewayStats::default()),
            processor_tx: Arc::new(ProcessorStats::default()),
            processor_rx: Arc::new(ProcessorStats::default()),
            vox: Arc::new(VoxStats::default()),
            jitter: Arc::new(JitterStats::default()),
            pipeline: Arc::new(PipelineStats::default()),
            capture: Arc::new(CaptureStats::default()),
        }
    }

    pub fn snapshot(&self) -> BridgeSnapshot {
        BridgeSnapshot {
            usrp_server: self.usrp_server.snapshot(),
            usrp_client: self.usrp_client.snapshot(),
            mmdvm_receiver: self.mmdvm_receiver.snapshot(),
            dmr_gateway: self.dmr_gateway.snapshot(),
            processor_tx: self.processor_tx.snapshot(),
            processor_rx: self.processor_rx.snapshot(),
            vox: self.vox.snapshot(),
            jitter: self.jitter.snapshot(),
            pipeline: self.pipeline.snapshot(),
            capture: self.capture.snapshot(),
        }
    }
}

impl Default for BridgeStats {
    fn default() -> Self {
        Self::new()
    }
}
