use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use common::{Backend, LoopEvent, LoopShared};

/// Blocking poll loop: send, wait for the reply, update, publish, sleep.
///
/// Runs until `shared.shutdown` is set. Shutdown is noticed between cycles, so
/// it can take up to one receive timeout.
pub fn run_link_thread(
    socket: UdpSocket,
    peer: SocketAddr,
    mut backend: Backend,
    shared: LoopShared,
    events: SyncSender<LoopEvent>,
    poll_interval: Duration,
) {
    // one spare byte so oversized datagrams show up as a size mismatch
    let mut buf = vec![0u8; backend.layout().frame_len + 1];
    backend.publish(&shared);

    while !shared.is_shutdown() {
        let mut emitted = backend.take_requests(&shared);

        let sent = match backend.next_datagram() {
            Ok(bytes) => match socket.send_to(&bytes, peer) {
                Ok(_) => true,
                Err(e) => {
                    shared.diagnostics.record_send_error();
                    warn!(error = %e, %peer, "send failed");
                    false
                }
            },
            Err(e) => {
                warn!(error = %e, "could not encode outbound frame");
                false
            }
        };

        let received = if sent {
            socket
                .set_read_timeout(Some(backend.recv_timeout()))
                .and_then(|_| socket.recv_from(&mut buf))
        } else {
            // a failed send counts as a cycle with no reply
            thread::sleep(backend.recv_timeout());
            Err(ErrorKind::TimedOut.into())
        };

        match received {
            Ok((len, from)) => {
                debug!(len, %from, "telemetry received");
                emitted.extend(backend.handle_datagram(&buf[..len]));
            }
            Err(e) => {
                if !matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) {
                    debug!(error = %e, "receive failed");
                }
                emitted.extend(backend.handle_timeout());
            }
        }

        backend.publish(&shared);
        forward(&events, &shared, emitted);

        thread::sleep(poll_interval);
    }
    debug!("link thread stopped");
}

fn forward(events: &SyncSender<LoopEvent>, shared: &LoopShared, emitted: Vec<LoopEvent>) {
    for event in emitted {
        match events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                shared.diagnostics.record_dropped_event();
            }
        }
    }
}
