//! usrp-bridge: bidirectional bridge between a SIP/VoIP endpoint speaking
//! the USRP UDP framing and a digital-radio modem speaking TLV with
//! explicit PTT signalling.
//!
//! TX (phone -> radio): USRP server -> resample/gain/AGC -> VOX -> gateway.
//! RX (radio -> phone): TLV receiver -> jitter buffer -> gain/AGC -> USRP
//! client. The echo interlock couples the two so received radio audio can
//! never key the transmitter back.

mod audio;
mod bridge;
mod config;
mod error;
mod frame;
mod interlock;
mod net;
mod stats;

use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use crate::bridge::Bridge;
use crate::config::{Cli, Config};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.into()))
        .init();

    let cfg = Config::load(&cli.config).context("load configuration")?;
    info!(config = %cli.config, "configuration loaded");

    let bridge = Bridge::start(cfg).context("start bridge")?;

    let running = bridge.running_flag();
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .context("install signal handler")?;

    info!("bridge running, Ctrl+C to stop");
    bridge.run();
    Ok(())
}
