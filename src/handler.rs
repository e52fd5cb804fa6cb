//! The application-supplied connection handler — an external collaborator
//! per §1, but the crate still defines the seam it plugs into and ships a
//! default (the echo handler of §8 Scenario 1) so the binary is runnable out
//! of the box.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::listener::Stream;

/// Invoked once per accepted (and allow-listed) connection. The handler
/// decides framing; the supervisor only knows about bytes (§1 Non-goals).
///
/// Handler failures are logged by Handler Dispatch and never affect the
/// supervisor's state machine or other connections (§4.6, §7).
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, stream: Stream, remote_address: SocketAddr) -> std::io::Result<()>;
}

/// Reads one line at a time and writes it back, stripping the trailing
/// newline. This is the literal handler used by §8 Scenario 1 ("echo
/// round-trip") and by the UNIX/TLS parity scenarios.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait]
impl ConnectionHandler for EchoHandler {
    async fn handle(&self, stream: Stream, _remote_address: SocketAddr) -> std::io::Result<()> {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        loop {
            line.clear();
            let bytes_read = reader.read_line(&mut line).await?;
            if bytes_read == 0 {
                return Ok(());
            }
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
        }
    }
}
