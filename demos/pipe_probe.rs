//! Probe a SQL Server named pipe: connect, exchange a pre-login message and
//! optionally switch to TLS.
//!
//! Usage:
//!
//! ```bash
//! RUST_LOG=npipe_wire=debug cargo run --example pipe_probe -- 'np:\\.\pipe\sql\query' --tls
//! ```

use npipe_wire::connection::{CallbackContext, DataSource, Deadline, TransportHandle};
use npipe_wire::protocol::constants::{packet_type, HEADER_LEN};
use npipe_wire::protocol::PreloginHeader;
use npipe_wire::{Packet, Status, TracingErrorSink};
use std::sync::Arc;
use std::time::Duration;

/// PRELOGIN option tokens
const OPTION_VERSION: u8 = 0x00;
const OPTION_ENCRYPTION: u8 = 0x01;
const OPTION_TERMINATOR: u8 = 0xFF;

const ENCRYPT_OFF: u8 = 0x00;
const ENCRYPT_ON: u8 = 0x01;

/// Minimal PRELOGIN message: client version plus encryption preference
fn prelogin_request(encrypt: bool) -> Packet {
    let table_len = 2 * 5 + 1;
    let version = [0x10, 0x00, 0x00, 0x00, 0x00, 0x00];
    let mut payload = Vec::with_capacity(table_len + version.len() + 1);

    payload.push(OPTION_VERSION);
    payload.extend_from_slice(&(table_len as u16).to_be_bytes());
    payload.extend_from_slice(&(version.len() as u16).to_be_bytes());
    payload.push(OPTION_ENCRYPTION);
    payload.extend_from_slice(&((table_len + version.len()) as u16).to_be_bytes());
    payload.extend_from_slice(&1u16.to_be_bytes());
    payload.push(OPTION_TERMINATOR);
    payload.extend_from_slice(&version);
    payload.push(if encrypt { ENCRYPT_ON } else { ENCRYPT_OFF });

    let header = PreloginHeader::for_payload(packet_type::PRELOGIN, payload.len(), true);
    let mut packet = Packet::allocate(HEADER_LEN, payload.len());
    packet.header_mut().copy_from_slice(&header.encode());
    packet.append(&payload);
    packet
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let data_source = args.next().unwrap_or_else(|| r"np:\\.\pipe\sql\query".to_string());
    let use_tls = args.any(|arg| arg == "--tls");

    let config = DataSource::parse(&data_source)?.to_config().build();
    println!("connecting to {}", config.pipe_path());

    let handle = TransportHandle::connect(
        config,
        Deadline::after(Duration::from_secs(15)),
        CallbackContext(0),
        Arc::new(TracingErrorSink),
    )
    .await;
    if handle.status() != Status::Success {
        return Err("could not open pipe (see log for details)".into());
    }
    println!("connected, connection id {}", handle.connection_id());

    handle.send(&prelogin_request(use_tls)).await?;
    let reply = handle.receive(Some(Duration::from_secs(15))).await?;
    println!("pre-login reply: {} bytes", reply.len());

    if use_tls {
        // Certificate checks are skipped: this is a connectivity probe.
        handle.enable_tls(false).await?;
        println!("TLS state: {}", handle.tls_state().await);
    }

    handle.dispose().await;
    Ok(())
}
