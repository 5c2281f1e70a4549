//! Pipeline orchestration: queue wiring, worker threads, and the shutdown
//! sequence.
//!
//! Responsibilities:
//! - Build the six bounded queues and hand their ends to the components.
//! - Spawn one thread per long-lived component.
//! - Couple the two directions through the echo interlock.
//! - Run the strict shutdown order: stop flag, final PTT off, thread joins
//!   with a deadline, final statistics.
//!
//! Backpressure policy: ingress UDP threads drop-newest silently (counted);
//! the processing stages drop-newest with a warning at most every 100th
//! drop so a wedged peer cannot flood the log.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::audio::capture::CaptureSource;
use crate::audio::jitter::JitterBuffer;
use crate::audio::processor::{self, AudioProcessor, PcmPlugin};
use crate::audio::samples_to_pcm;
use crate::audio::vox::VoxController;
use crate::config::Config;
use crate::error::BridgeError;
use crate::frame::{unix_micros, AudioFrame, Source};
use crate::interlock::EchoInterlock;
use crate::net::tlv::{DmrGateway, MmdvmReceiver, PttHandle};
use crate::net::usrp::{UsrpClient, UsrpServer};
use crate::stats::{BridgeStats, PipelineStats};

const GET_TIMEOUT: Duration = Duration::from_secs(1);
const PUT_TIMEOUT: Duration = Duration::from_millis(100);
const JOIN_DEADLINE: Duration = Duration::from_secs(2);
const DROP_WARN_EVERY: u64 = 100;

pub struct Bridge {
    running: Arc<AtomicBool>,
    stats: Arc<BridgeStats>,
    ptt: PttHandle,
    vox: Arc<Mutex<VoxController>>,
    threads: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    shutdown_done: Mutex<bool>,
}

impl Bridge {
    /// Bind all sockets, wire the queues, and start every worker thread.
    /// Bind failures are fatal; everything after startup recovers locally.
    pub fn start(cfg: Config) -> Result<Self> {
        Self::start_with_plugins(cfg, Vec::new(), Vec::new())
    }

    /// Like [`Bridge::start`], with interception chains for the two
    /// directions. The chains are frozen once the pipelines run.
    pub fn start_with_plugins(
        cfg: Config,
        tx_plugins: Vec<PcmPlugin>,
        rx_plugins: Vec<PcmPlugin>,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(BridgeStats::new());
        let capacity = cfg.queues.capacity;

        // TX direction: USRP server -> processor -> VOX/gate -> gateway.
        let (q1_tx, q1_rx) = bounded::<AudioFrame>(capacity);
        let (q2_tx, q2_rx) = bounded::<AudioFrame>(capacity);
        let (q3_tx, q3_rx) = bounded::<AudioFrame>(capacity);
        // RX direction: MMDVM receiver -> jitter -> processor -> USRP client.
        let (q4_tx, q4_rx) = bounded::<AudioFrame>(capacity);
        let (q5_tx, q5_rx) = bounded::<AudioFrame>(capacity);
        let (q6_tx, q6_rx) = bounded::<AudioFrame>(capacity);

        let interlock = Arc::new(EchoInterlock::new(&cfg.echo_interlock));

        let usrp_server = UsrpServer::bind(
            &cfg.usrp,
            q1_tx.clone(),
            running.clone(),
            stats.usrp_server.clone(),
        )?;
        let mmdvm_receiver = MmdvmReceiver::bind(
            &cfg.mmdvm_rx,
            q4_tx,
            running.clone(),
            stats.mmdvm_receiver.clone(),
        )?;
        let dmr_gateway =
            DmrGateway::new(&cfg.mmdvm, q3_rx, running.clone(), stats.dmr_gateway.clone())?;
        let usrp_client =
            UsrpClient::new(&cfg.usrp_client, q6_rx, running.clone(), stats.usrp_client.clone())?;

        let ptt = dmr_gateway.ptt_handle();
        let cb_ptt = ptt.clone();
        let vox = Arc::new(Mutex::new(VoxController::new(
            &cfg.vox,
            Box::new(move |on| cb_ptt.send_ptt(on)),
            stats.vox.clone(),
        )));

        let mut processor_tx =
            AudioProcessor::new(&cfg.audio, &cfg.processing, stats.processor_tx.clone());
        for plugin in tx_plugins {
            processor_tx.register_plugin(plugin);
        }
        let mut processor_rx =
            AudioProcessor::new(&cfg.audio, &cfg.processing, stats.processor_rx.clone());
        for plugin in rx_plugins {
            processor_rx.register_plugin(plugin);
        }

        let mut threads: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        threads.push(("usrp-server", spawn_named("usrp-server", move || usrp_server.run())?));
        threads.push((
            "mmdvm-receiver",
            spawn_named("mmdvm-receiver", move || mmdvm_receiver.run())?,
        ));
        threads.push(("dmr-gateway", spawn_named("dmr-gateway", move || dmr_gateway.run())?));
        threads.push(("usrp-client", spawn_named("usrp-client", move || usrp_client.run())?));

        // TX processor stage: Q1 -> normalise -> Q2.
        {
            let running = running.clone();
            let pipeline = stats.pipeline.clone();
            threads.push((
                "tx-processor",
                spawn_named("tx-processor", move || {
                    let mut dropped = 0u64;
                    loop {
                        let mut frame = match recv_stage(&q1_rx, &running) {
                            Some(frame) => frame,
                            None => break,
                        };
                        processor_tx.process_tx(&mut frame);
                        if q2_tx.send_timeout(frame, PUT_TIMEOUT).is_err() {
                            pipeline.tx_queue_drops.fetch_add(1, Ordering::Relaxed);
                            dropped += 1;
                            if dropped % DROP_WARN_EVERY == 1 {
                                let err = BridgeError::Backpressure("vox queue");
                                warn!(error = %err, dropped, "dropping TX frame");
                            }
                        }
                    }
                    info!("TX processor stopped");
                })?,
            ));
        }

        // TX VOX/gate stage: Q2 -> interlock -> VOX -> gate -> Q3.
        {
            let running = running.clone();
            let pipeline = stats.pipeline.clone();
            let interlock = interlock.clone();
            let vox = vox.clone();
            threads.push((
                "tx-vox",
                spawn_named("tx-vox", move || {
                    let mut dropped = 0u64;
                    loop {
                        let mut frame = match recv_stage(&q2_rx, &running) {
                            Some(frame) => frame,
                            None => break,
                        };
                        if !tx_gate(&mut frame, &interlock, &vox, &pipeline, Instant::now()) {
                            continue;
                        }
                        if q3_tx.send_timeout(frame, PUT_TIMEOUT).is_err() {
                            pipeline.tx_queue_drops.fetch_add(1, Ordering::Relaxed);
                            dropped += 1;
                            if dropped % DROP_WARN_EVERY == 1 {
                                let err = BridgeError::Backpressure("gateway queue");
                                warn!(error = %err, dropped, "dropping TX frame");
                            }
                        }
                    }
                    info!("TX VOX stage stopped");
                })?,
            ));
        }

        // Jitter buffer service: Q4 -> paced -> Q5, polled at ~1 kHz.
        {
            let running = running.clone();
            let mut jitter = JitterBuffer::new(&cfg.jitter_buffer, stats.jitter.clone());
            threads.push((
                "jitter-buffer",
                spawn_named("jitter-buffer", move || {
                    while running.load(Ordering::Relaxed) {
                        jitter.service(&q4_rx, &q5_tx, Instant::now());
                        thread::sleep(Duration::from_millis(1));
                    }
                    info!("jitter buffer stopped");
                })?,
            ));
        }

        // RX processor stage: Q5 -> interlock note -> process -> Q6.
        {
            let running = running.clone();
            let pipeline = stats.pipeline.clone();
            let interlock = interlock.clone();
            threads.push((
                "rx-processor",
                spawn_named("rx-processor", move || {
                    let mut dropped = 0u64;
                    loop {
                        let mut frame = match recv_stage(&q5_rx, &running) {
                            Some(frame) => frame,
                            None => break,
                        };
                        interlock.note_rx_active(Instant::now());
                        processor_rx.process_rx(&mut frame);
                        if q6_tx.send_timeout(frame, PUT_TIMEOUT).is_err() {
                            pipeline.rx_queue_drops.fetch_add(1, Ordering::Relaxed);
                            dropped += 1;
                            if dropped % DROP_WARN_EVERY == 1 {
                                let err = BridgeError::Backpressure("usrp client queue");
                                warn!(error = %err, dropped, "dropping RX frame");
                            }
                        }
                    }
                    info!("RX processor stopped");
                })?,
            ));
        }

        // Optional local capture source feeding the TX pipeline.
        if cfg.capture.enable {
            let capture = CaptureSource::start(&cfg.capture, stats.capture.clone())
                .context("start local capture")?;
            let running = running.clone();
            let capture_stats = stats.capture.clone();
            threads.push((
                "capture-framer",
                spawn_named("capture-framer", move || {
                    let mut buf = vec![0i16; capture.frame_samples()];
                    let mut sequence = 0u32;
                    while running.load(Ordering::Relaxed) {
                        if capture.read_frame(&mut buf) {
                            let frame = AudioFrame::new(
                                samples_to_pcm(&buf),
                                capture.sample_rate(),
                                1,
                                sequence,
                                unix_micros(),
                                Source::LocalCapture,
                            );
                            sequence = sequence.wrapping_add(1);
                            match q1_tx.try_send(frame) {
                                Ok(()) => {
                                    capture_stats.frames.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(_) => {
                                    capture_stats.queue_drops.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        } else {
                            thread::sleep(Duration::from_millis(2));
                        }
                    }
                    info!("capture framer stopped");
                })?,
            ));
        }

        // Periodic statistics reporter.
        if cfg.stats.enable {
            let running = running.clone();
            let stats = stats.clone();
            let interval = Duration::from_secs(cfg.stats.interval_secs.max(1));
            threads.push((
                "stats",
                spawn_named("stats", move || {
                    let mut elapsed = Duration::ZERO;
                    while running.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(200));
                        elapsed += Duration::from_millis(200);
                        if elapsed >= interval {
                            elapsed = Duration::ZERO;
                            if let Ok(json) = serde_json::to_string(&stats.snapshot()) {
                                info!(stats = %json, "statistics");
                            }
                        }
                    }
                })?,
            ));
        }

        info!("bridge started");
        Ok(Self {
            running,
            stats,
            ptt,
            vox,
            threads: Mutex::new(threads),
            shutdown_done: Mutex::new(false),
        })
    }

    /// Block until the running flag clears (signal handler or fatal
    /// condition), then run the shutdown sequence.
    pub fn run(&self) {
        while self.running.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(200));
        }
        self.shutdown();
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Strict shutdown order; safe to call from several places, the first
    /// caller wins.
    pub fn shutdown(&self) {
        {
            let mut done = self.shutdown_done.lock();
            if *done {
                return;
            }
            *done = true;
        }
        info!("stopping bridge");
        self.running.store(false, Ordering::SeqCst);

        // The radio must end up unkeyed no matter what the pipelines were
        // doing: one best-effort PTT stop on the wire, then force the
        // controller idle (which repeats the stop through its callback).
        self.ptt.send_ptt(false);
        self.vox.lock().force_off();

        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for (name, handle) in threads {
            let deadline = Instant::now() + JOIN_DEADLINE;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!(thread = name, "did not stop within deadline");
            }
        }

        match serde_json::to_string(&self.stats.snapshot()) {
            Ok(json) => info!(stats = %json, "final statistics"),
            Err(e) => warn!(error = %e, "could not serialise final statistics"),
        }
        info!("bridge stopped");
    }
}

fn spawn_named(
    name: &'static str,
    body: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .with_context(|| format!("spawn {name} thread"))
}

/// Stage-side receive with the shared 1 s timeout. `None` ends the stage.
fn recv_stage(rx: &Receiver<AudioFrame>, running: &AtomicBool) -> Option<AudioFrame> {
    loop {
        if !running.load(Ordering::Relaxed) {
            return None;
        }
        match rx.recv_timeout(GET_TIMEOUT) {
            Ok(frame) => return Some(frame),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return None,
        }
    }
}

/// The interlock/VOX/gate step between the TX processor and the gateway.
/// Returns whether the frame goes to the modem.
pub(crate) fn tx_gate(
    frame: &mut AudioFrame,
    interlock: &EchoInterlock,
    vox: &Mutex<VoxController>,
    pipeline: &PipelineStats,
    now: Instant,
) -> bool {
    if interlock.is_tx_muted(now) {
        processor::apply_gain(&mut frame.pcm, interlock.tx_gain(1.0, now));
        frame.echo_muted = true;
        pipeline.interlock_muted.fetch_add(1, Ordering::Relaxed);
    }
    if vox.lock().process_frame(frame, now).is_err() {
        // Hard timeout tripped on this frame; it is withheld.
        return false;
    }
    if frame.ptt_active && frame.echo_muted {
        // Keyed but interlocked: this is the echo protection doing its job.
        pipeline.gate_drops.fetch_add(1, Ordering::Relaxed);
    }
    frame.ptt_active && !frame.echo_muted
}
