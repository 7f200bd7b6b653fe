use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::ValueEnum;
use tokio::runtime::Runtime;

use async_impl::AsyncController;
use common::{LoopEvent, TestbedConfig, TestbedController};
use threaded_impl::ThreadedController;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LoopMode {
    Threaded,
    Async,
}

/// A running link in either loop mode, driven from the blocking console.
pub enum Session {
    Threaded(ThreadedController),
    Async {
        runtime: Runtime,
        controller: AsyncController,
    },
}

impl Session {
    pub fn start(config: &TestbedConfig, mode: LoopMode) -> Result<Self> {
        match mode {
            LoopMode::Threaded => {
                let controller =
                    threaded_impl::spawn(config).context("starting threaded link")?;
                Ok(Session::Threaded(controller))
            }
            LoopMode::Async => {
                let runtime = Runtime::new().context("building tokio runtime")?;
                let controller = runtime
                    .block_on(async_impl::spawn(config))
                    .context("starting async link")?;
                Ok(Session::Async {
                    runtime,
                    controller,
                })
            }
        }
    }

    pub fn controller(&self) -> &dyn TestbedController {
        match self {
            Session::Threaded(controller) => controller,
            Session::Async { controller, .. } => controller,
        }
    }

    /// Next loop event, or `None` once `wait` elapses or the loop is gone.
    pub fn next_event(&mut self, wait: Duration) -> Option<LoopEvent> {
        match self {
            Session::Threaded(controller) => controller.events().recv_timeout(wait).ok(),
            Session::Async {
                runtime,
                controller,
            } => runtime
                .block_on(tokio::time::timeout(wait, controller.events().recv()))
                .ok()
                .flatten(),
        }
    }

    /// Drains events until `done` matches one or `wait` elapses. Every event is
    /// passed to `seen` first.
    pub fn wait_until(
        &mut self,
        wait: Duration,
        mut seen: impl FnMut(&LoopEvent),
        mut done: impl FnMut(&LoopEvent) -> bool,
    ) -> Option<LoopEvent> {
        let deadline = Instant::now() + wait;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return None;
            }
            let event = self.next_event(left)?;
            seen(&event);
            if done(&event) {
                return Some(event);
            }
        }
    }

    pub fn stop(self) {
        match self {
            Session::Threaded(controller) => controller.stop(),
            Session::Async {
                runtime,
                controller,
            } => runtime.block_on(controller.stop()),
        }
    }
}
