use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

use common::{Backend, LoopEvent, LoopShared};

/// Async poll loop; same cycle as the threaded link, with `tokio::time::timeout`
/// bounding the receive.
pub async fn run_link_task(
    socket: UdpSocket,
    peer: SocketAddr,
    mut backend: Backend,
    shared: LoopShared,
    events: mpsc::Sender<LoopEvent>,
    poll_interval: Duration,
) {
    let mut buf = vec![0u8; backend.layout().frame_len + 1];
    backend.publish(&shared);

    while !shared.is_shutdown() {
        let mut emitted = backend.take_requests(&shared);
        let wait = backend.recv_timeout();

        let sent = match backend.next_datagram() {
            Ok(bytes) => match socket.send_to(&bytes, peer).await {
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
            match timeout(wait, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) => {
                    debug!(len, %from, "telemetry received");
                    Some(len)
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "receive failed");
                    None
                }
                Err(_) => None,
            }
        } else {
            sleep(wait).await;
            None
        };

        match received {
            Some(len) => emitted.extend(backend.handle_datagram(&buf[..len])),
            None => emitted.extend(backend.handle_timeout()),
        }

        backend.publish(&shared);
        for event in emitted {
            if events.try_send(event).is_err() {
                shared.diagnostics.record_dropped_event();
            }
        }

        sleep(poll_interval).await;
    }
    debug!("link task stopped");
}
