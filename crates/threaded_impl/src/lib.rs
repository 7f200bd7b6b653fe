//! Controller link on a dedicated OS thread with a blocking UDP socket.

pub mod emulator;
pub mod link;

use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::info;

use common::{Backend, LoopEvent, LoopShared, TestbedConfig, TestbedController, TestbedResult};

pub use emulator::run_emulator_thread;
pub use link::run_link_thread;

/// Handle to a running link thread. Dropping it stops the thread.
pub struct ThreadedController {
    shared: LoopShared,
    events: Receiver<LoopEvent>,
    local_addr: SocketAddr,
    worker: Option<JoinHandle<()>>,
}

/// Binds the link socket and starts the poll loop.
pub fn spawn(config: &TestbedConfig) -> TestbedResult<ThreadedController> {
    let socket = UdpSocket::bind(config.network.bind)?;
    let local_addr = socket.local_addr()?;
    let shared = LoopShared::new(config.elements());
    let backend = Backend::new(config, Arc::clone(&shared.diagnostics))?;
    // open the mailbox before the caller gets a handle
    backend.publish(&shared);
    let (tx, rx) = mpsc::sync_channel(config.network.event_capacity);

    let peer = config.network.peer;
    let poll_interval = config.network.poll_interval();
    let loop_shared = shared.clone();
    let worker = thread::Builder::new()
        .name("wpt-link".into())
        .spawn(move || run_link_thread(socket, peer, backend, loop_shared, tx, poll_interval))?;

    info!(%local_addr, %peer, "threaded link started");
    Ok(ThreadedController {
        shared,
        events: rx,
        local_addr,
        worker: Some(worker),
    })
}

impl ThreadedController {
    /// Loop notifications, in order. Events are dropped (and counted) when nobody drains this.
    pub fn events(&self) -> &Receiver<LoopEvent> {
        &self.events
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the loop and waits for the thread to exit.
    pub fn stop(mut self) {
        self.join();
    }

    fn join(&mut self) {
        self.shared.request_shutdown();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl TestbedController for ThreadedController {
    fn shared(&self) -> &LoopShared {
        &self.shared
    }
}

impl Drop for ThreadedController {
    fn drop(&mut self) {
        self.join();
    }
}
