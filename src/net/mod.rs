//! UDP wire codecs and the four socket-owning components: the USRP server
//! and client toward the SIP adapter, and the TLV receiver and gateway
//! toward the radio modem.

pub mod tlv;
pub mod usrp;

use std::net::{SocketAddr, ToSocketAddrs};

use anyhow::{anyhow, Context, Result};

/// Resolve a host/port pair once at startup.
pub fn resolve_target(address: &str, port: u16) -> Result<SocketAddr> {
    (address, port)
        .to_socket_addrs()
        .with_context(|| format!("resolve {address}:{port}"))?
        .next()
        .ok_or_else(|| anyhow!("no address for {address}:{port}"))
}
