use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Link counters shared between the control loop and its handle.
#[derive(Debug, Default)]
pub struct LinkDiagnostics {
    pub frames_sent: AtomicU64,
    pub frames_received: AtomicU64,
    pub timeouts: AtomicU64,
    pub malformed_frames: AtomicU64,
    pub send_errors: AtomicU64,
    pub busy_rejections: AtomicU64,
    pub dropped_events: AtomicU64,
    pub dropped_commands: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct DiagnosticsSnapshot {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub timeouts: u64,
    pub malformed_frames: u64,
    pub send_errors: u64,
    pub busy_rejections: u64,
    pub dropped_events: u64,
    pub dropped_commands: u64,
}

impl LinkDiagnostics {
    pub fn record_sent(&self) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_busy_rejection(&self) {
        self.busy_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_event(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_command(&self) {
        self.dropped_commands.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            busy_rejections: self.busy_rejections.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
            dropped_commands: self.dropped_commands.load(Ordering::Relaxed),
        }
    }
}
