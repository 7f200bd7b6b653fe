use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use common::emulator::ArrayEmulator;

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Async twin of the threaded emulator server.
pub async fn run_emulator_task(
    socket: UdpSocket,
    mut emulator: ArrayEmulator,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<()> {
    let mut buf = [0u8; 256];

    while !shutdown.load(Ordering::Relaxed) {
        let (len, from) = match timeout(SHUTDOWN_POLL, socket.recv_from(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => continue,
        };
        match emulator.handle(&buf[..len]) {
            Ok(reply) => {
                socket.send_to(&reply, from).await?;
            }
            Err(e) => warn!(error = %e, %from, "ignoring bad command datagram"),
        }
    }
    debug!("emulator task stopped");
    Ok(())
}
