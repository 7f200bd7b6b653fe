//! Controller link as a tokio task.

pub mod emulator;
pub mod link;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use common::{Backend, LoopEvent, LoopShared, TestbedConfig, TestbedController, TestbedResult};

pub use emulator::run_emulator_task;
pub use link::run_link_task;

pub struct AsyncController {
    shared: LoopShared,
    events: mpsc::Receiver<LoopEvent>,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

/// Binds the link socket and spawns the poll loop on the current runtime.
pub async fn spawn(config: &TestbedConfig) -> TestbedResult<AsyncController> {
    let socket = UdpSocket::bind(config.network.bind).await?;
    let local_addr = socket.local_addr()?;
    let shared = LoopShared::new(config.elements());
    let backend = Backend::new(config, Arc::clone(&shared.diagnostics))?;
    // open the mailbox before the caller gets a handle
    backend.publish(&shared);
    let (tx, rx) = mpsc::channel(config.network.event_capacity);

    let task = tokio::spawn(link::run_link_task(
        socket,
        config.network.peer,
        backend,
        shared.clone(),
        tx,
        config.network.poll_interval(),
    ));

    info!(%local_addr, peer = %config.network.peer, "async link started");
    Ok(AsyncController {
        shared,
        events: rx,
        local_addr,
        task,
    })
}

impl AsyncController {
    pub fn events(&mut self) -> &mut mpsc::Receiver<LoopEvent> {
        &mut self.events
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops the loop and waits for the task to finish its current cycle.
    pub async fn stop(self) {
        self.shared.request_shutdown();
        let _ = self.task.await;
    }
}

impl TestbedController for AsyncController {
    fn shared(&self) -> &LoopShared {
        &self.shared
    }
}
