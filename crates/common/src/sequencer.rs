//! Single-command-in-flight state machine driven by the firmware's echoed command tag.
//!
//! The sequencer performs no I/O. Each poll cycle the owner calls
//! [`CommandSequencer::outbound`] to get the frame to send, then exactly one of
//! [`CommandSequencer::on_echo`] (a frame arrived) or
//! [`CommandSequencer::on_timeout`] (nothing arrived before the deadline).
//!
//! Edges are read off the echoed tag:
//! - rising: the echo matches the command we sent and it was not yet seen running;
//! - falling: the echo drops from a non-NOP tag to NOP.

use crate::protocol::{CommandFrame, CommandTag};
use crate::LinkStatus;

/// Something the sequencer wants its owner to know about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerEvent {
    /// Firmware started executing the command we sent.
    Started(CommandTag),
    /// Firmware finished the command (echo went back to NOP).
    Finished(CommandTag),
    /// The command was never echoed within the ack window and was given up.
    Dropped(CommandTag),
    Disconnected,
    Reconnected,
}

/// Observable sequencer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SequencerState {
    /// Last command sent that has not yet finished (NOP when none).
    pub in_flight: CommandTag,
    /// Whether the firmware has echoed `in_flight` at least once.
    pub in_flight_running: bool,
    pub last_echo: CommandTag,
    pub previous_echo: CommandTag,
    pub status: LinkStatus,
}

#[derive(Debug, Clone)]
pub struct CommandSequencer {
    state: SequencerState,
    pending: Option<CommandFrame>,
    ack_timeout_cycles: u32,
    unacked_frames: u32,
}

impl CommandSequencer {
    /// `ack_timeout_cycles`: received frames without an echo before an in-flight command is dropped.
    pub fn new(ack_timeout_cycles: u32) -> Self {
        Self {
            state: SequencerState::default(),
            pending: None,
            ack_timeout_cycles: ack_timeout_cycles.max(1),
            unacked_frames: 0,
        }
    }

    pub fn state(&self) -> &SequencerState {
        &self.state
    }

    pub fn status(&self) -> LinkStatus {
        self.state.status
    }

    pub fn pending(&self) -> Option<&CommandFrame> {
        self.pending.as_ref()
    }

    /// True when nothing is in flight and the firmware reports idle.
    pub fn can_accept(&self) -> bool {
        self.state.in_flight.is_nop() && self.state.last_echo.is_nop()
    }

    /// True when a new command could go out and none is waiting to.
    pub fn is_idle(&self) -> bool {
        self.can_accept() && self.pending.is_none()
    }

    /// Requests a command. Rejected (not queued) while another is in flight or the
    /// firmware is busy. A request that has not been sent yet is replaced.
    pub fn issue(&mut self, frame: CommandFrame) -> bool {
        if frame.tag().is_nop() || !self.can_accept() {
            return false;
        }
        self.pending = Some(frame);
        true
    }

    /// Frame to transmit this cycle; the pending command is consumed and becomes in flight.
    pub fn outbound(&mut self) -> CommandFrame {
        match self.pending.take() {
            Some(frame) => {
                self.state.in_flight = frame.tag();
                self.state.in_flight_running = false;
                self.unacked_frames = 0;
                frame
            }
            None => CommandFrame::Nop,
        }
    }

    /// No datagram before the deadline. Echo tracking is left untouched.
    pub fn on_timeout(&mut self) -> Option<SequencerEvent> {
        if self.state.status == LinkStatus::Disconnected {
            return None;
        }
        self.state.status = LinkStatus::Disconnected;
        Some(SequencerEvent::Disconnected)
    }

    /// A telemetry frame arrived carrying `echo` as the firmware's current command.
    pub fn on_echo(&mut self, echo: CommandTag) -> Vec<SequencerEvent> {
        let mut events = Vec::new();
        if self.state.status == LinkStatus::Disconnected {
            events.push(SequencerEvent::Reconnected);
        }

        let previous = self.state.last_echo;
        self.state.previous_echo = previous;
        self.state.last_echo = echo;

        let in_flight = self.state.in_flight;
        if !in_flight.is_nop() && !self.state.in_flight_running && echo == in_flight {
            self.state.in_flight_running = true;
            events.push(SequencerEvent::Started(echo));
        } else if !previous.is_nop() && echo.is_nop() {
            if self.state.in_flight_running || in_flight == previous {
                self.clear_in_flight();
            }
            events.push(SequencerEvent::Finished(previous));
        }

        if !self.state.in_flight.is_nop() && !self.state.in_flight_running && echo.is_nop() {
            self.unacked_frames += 1;
            if self.unacked_frames >= self.ack_timeout_cycles {
                events.push(SequencerEvent::Dropped(self.state.in_flight));
                self.clear_in_flight();
            }
        }

        self.state.status = if echo.is_nop() {
            LinkStatus::Ready
        } else {
            LinkStatus::Busy
        };
        events
    }

    fn clear_in_flight(&mut self) {
        self.state.in_flight = CommandTag::Nop;
        self.state.in_flight_running = false;
        self.unacked_frames = 0;
    }
}
