use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub mod backend;
pub mod beamforming;
pub mod config;
pub mod dataset;
pub mod diagnostics;
pub mod emulator;
pub mod error;
pub mod geometry;
pub mod handoff;
pub mod logger;
pub mod logging;
pub mod protocol;
pub mod sequencer;
pub mod survey;
pub mod telemetry;

pub use backend::Backend;
pub use beamforming::{BeamformingEngine, Direction, PhaseProfile};
pub use config::{load_config, TestbedConfig};
pub use diagnostics::LinkDiagnostics;
pub use error::{ConfigError, FrameError, GeometryError, TestbedError, TestbedResult};
pub use geometry::{ArrayGeometry, PhaseQuantizer};
pub use handoff::{CommandMailbox, LoopShared, SnapshotCell, TestbedController};
pub use protocol::{CommandFrame, CommandTag, FrameLayout, ScanMethod};
pub use survey::SurveyPosition;
pub use telemetry::TelemetrySnapshot;

/// Link state as seen by the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LinkStatus {
    /// Firmware idle and answering.
    #[default]
    Ready,
    /// Firmware is executing a command.
    Busy,
    /// No datagram arrived within the receive timeout.
    Disconnected,
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LinkStatus::Ready => "READY",
            LinkStatus::Busy => "BUSY",
            LinkStatus::Disconnected => "DISCONNECTED",
        };
        f.write_str(s)
    }
}

/// Notifications published by a control loop to its collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    Started(CommandTag),
    /// A command completed; `snapshot` is the state right after the falling edge.
    Finished {
        tag: CommandTag,
        snapshot: Arc<TelemetrySnapshot>,
    },
    Dropped(CommandTag),
    Disconnected,
    Reconnected,
    /// Power amplifiers reading below the fault threshold after a command.
    PaFault(Vec<usize>),
    /// Survey wants the equipment moved to this position before the next scan.
    SurveyMoved(SurveyPosition),
    SurveyComplete,
}
