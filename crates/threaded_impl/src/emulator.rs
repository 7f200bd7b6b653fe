use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use common::emulator::ArrayEmulator;

/// How often the emulator wakes up to check the shutdown flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Answers every command datagram on `socket` with the emulator's telemetry.
pub fn run_emulator_thread(
    socket: UdpSocket,
    mut emulator: ArrayEmulator,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<()> {
    socket.set_read_timeout(Some(SHUTDOWN_POLL))?;
    let mut buf = [0u8; 256];

    while !shutdown.load(Ordering::Relaxed) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => continue,
            Err(e) => return Err(e),
        };
        match emulator.handle(&buf[..len]) {
            Ok(reply) => {
                socket.send_to(&reply, from)?;
            }
            Err(e) => warn!(error = %e, %from, "ignoring bad command datagram"),
        }
    }
    debug!("emulator thread stopped");
    Ok(())
}
