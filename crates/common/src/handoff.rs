//! Primitives that carry commands into a control loop and state back out.
//!
//! The loop is the only writer of live state. Collaborators see immutable
//! snapshots and post commands through a single-slot mailbox.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::warn;

use crate::diagnostics::{DiagnosticsSnapshot, LinkDiagnostics};
use crate::protocol::{validate_command, CommandFrame};
use crate::survey::SurveyPlan;
use crate::telemetry::TelemetrySnapshot;
use crate::LinkStatus;

/// Latest published value; readers get a cheap `Arc` clone.
#[derive(Debug)]
pub struct SnapshotCell<T> {
    inner: Arc<RwLock<Arc<T>>>,
}

impl<T> Clone for SnapshotCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Default> Default for SnapshotCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> SnapshotCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(value))),
        }
    }

    pub fn publish(&self, value: T) {
        let value = Arc::new(value);
        let mut slot = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *slot = value;
    }

    pub fn latest(&self) -> Arc<T> {
        let slot = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&slot)
    }
}

#[derive(Debug, Default)]
struct MailboxSlot {
    pending: Option<CommandFrame>,
    survey: Option<SurveyPlan>,
    accepting: bool,
}

impl MailboxSlot {
    fn is_free(&self) -> bool {
        self.accepting && self.pending.is_none() && self.survey.is_none()
    }
}

/// Single-slot command mailbox. Requests are rejected, never queued, while the
/// loop reports that it cannot take a command or a request is already waiting.
#[derive(Debug, Clone, Default)]
pub struct CommandMailbox {
    slot: Arc<Mutex<MailboxSlot>>,
}

impl CommandMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_issue(&self, frame: CommandFrame) -> bool {
        if frame.tag().is_nop() {
            return false;
        }
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if !slot.is_free() {
            return false;
        }
        slot.pending = Some(frame);
        true
    }

    /// Asks the loop to start a survey; same acceptance rule as commands.
    pub fn try_start_survey(&self, plan: SurveyPlan) -> bool {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if !slot.is_free() {
            return false;
        }
        slot.survey = Some(plan);
        true
    }

    /// Loop side: removes the waiting request, if any. Acceptance stays closed
    /// until the loop publishes again.
    pub fn take(&self) -> Option<CommandFrame> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let frame = slot.pending.take();
        if frame.is_some() {
            slot.accepting = false;
        }
        frame
    }

    /// Loop side: removes a waiting survey request, if any.
    pub fn take_survey(&self) -> Option<SurveyPlan> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let plan = slot.survey.take();
        if plan.is_some() {
            slot.accepting = false;
        }
        plan
    }

    /// Loop side: publishes whether the sequencer can take a new command.
    pub fn set_accepting(&self, accepting: bool) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .accepting = accepting;
    }

    pub fn is_accepting(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_free()
    }
}

/// State shared by a control loop and every handle to it.
#[derive(Debug, Clone)]
pub struct LoopShared {
    pub mailbox: CommandMailbox,
    pub snapshot: SnapshotCell<TelemetrySnapshot>,
    pub diagnostics: Arc<LinkDiagnostics>,
    pub shutdown: Arc<AtomicBool>,
    elements: usize,
}

impl LoopShared {
    /// `elements`: phase shifters on the array, the length every SET_PHASE must have.
    pub fn new(elements: usize) -> Self {
        Self {
            mailbox: CommandMailbox::new(),
            snapshot: SnapshotCell::default(),
            diagnostics: Arc::default(),
            shutdown: Arc::default(),
            elements,
        }
    }

    /// Posts `frame`. Frames that would not encode for this array are refused
    /// here, so `true` always means the loop will send it.
    pub fn issue(&self, frame: CommandFrame) -> bool {
        if let Err(e) = validate_command(&frame, self.elements) {
            warn!(tag = %frame.tag(), error = %e, "refusing invalid command");
            return false;
        }
        let accepted = self.mailbox.try_issue(frame);
        if !accepted {
            self.diagnostics.record_busy_rejection();
        }
        accepted
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

/// Collaborator-facing view of a running control loop.
pub trait TestbedController {
    fn shared(&self) -> &LoopShared;

    /// Posts a command; `false` when the array is busy or a command is already waiting.
    fn issue_command(&self, frame: CommandFrame) -> bool {
        self.shared().issue(frame)
    }

    /// Hands a survey plan to the loop; `false` under the same conditions as commands.
    fn start_survey(&self, plan: SurveyPlan) -> bool {
        let accepted = self.shared().mailbox.try_start_survey(plan);
        if !accepted {
            self.shared().diagnostics.record_busy_rejection();
        }
        accepted
    }

    fn current_status(&self) -> LinkStatus {
        self.shared().snapshot.latest().link
    }

    fn current_telemetry(&self) -> Arc<TelemetrySnapshot> {
        self.shared().snapshot.latest()
    }

    fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.shared().diagnostics.snapshot()
    }

    /// Asks the loop to stop after its current cycle.
    fn shutdown(&self) {
        self.shared().request_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ScanMethod;

    #[test]
    fn readers_keep_their_snapshot_after_publish() {
        let cell = SnapshotCell::new(1u32);
        let before = cell.latest();
        cell.publish(2);
        assert_eq!(*before, 1);
        assert_eq!(*cell.latest(), 2);
    }

    #[test]
    fn mailbox_rejects_until_loop_accepts() {
        let mailbox = CommandMailbox::new();
        assert!(!mailbox.try_issue(CommandFrame::Reset));
        mailbox.set_accepting(true);
        assert!(mailbox.try_issue(CommandFrame::Reset));
        // slot occupied
        assert!(!mailbox.try_issue(CommandFrame::Scan(ScanMethod::Steering)));
        assert_eq!(mailbox.take(), Some(CommandFrame::Reset));
        assert_eq!(mailbox.take(), None);
        // closed until the loop publishes again
        assert!(!mailbox.try_issue(CommandFrame::Reset));
    }

    #[test]
    fn survey_request_occupies_the_slot() {
        let mailbox = CommandMailbox::new();
        mailbox.set_accepting(true);
        assert!(mailbox.try_start_survey(SurveyPlan::standard()));
        assert!(!mailbox.try_issue(CommandFrame::Reset));
        assert_eq!(mailbox.take_survey().map(|p| p.len()), Some(51));
        assert!(!mailbox.is_accepting());
        mailbox.set_accepting(true);
        assert!(mailbox.is_accepting());
    }

    #[test]
    fn nop_never_enters_the_mailbox() {
        let mailbox = CommandMailbox::new();
        mailbox.set_accepting(true);
        assert!(!mailbox.try_issue(CommandFrame::Nop));
        assert!(mailbox.is_accepting());
    }

    #[test]
    fn rejections_are_counted() {
        let shared = LoopShared::new(16);
        assert!(!shared.issue(CommandFrame::SetLoss(4)));
        assert_eq!(shared.diagnostics.snapshot().busy_rejections, 1);
    }

    #[test]
    fn invalid_phase_profiles_never_enter_the_mailbox() {
        let shared = LoopShared::new(16);
        shared.mailbox.set_accepting(true);
        assert!(!shared.issue(CommandFrame::SetPhase(vec![0; 200])));
        assert!(!shared.issue(CommandFrame::SetPhase(vec![0; 4])));
        assert!(shared.mailbox.is_accepting());
        assert_eq!(shared.mailbox.take(), None);
        // not a busy rejection
        assert_eq!(shared.diagnostics.snapshot().busy_rejections, 0);

        assert!(shared.issue(CommandFrame::SetPhase(vec![2; 16])));
        assert_eq!(shared.mailbox.take(), Some(CommandFrame::SetPhase(vec![2; 16])));
    }

    struct Handle(LoopShared);

    impl TestbedController for Handle {
        fn shared(&self) -> &LoopShared {
            &self.0
        }
    }

    #[test]
    fn controller_trait_reads_published_state() {
        let handle = Handle(LoopShared::new(16));
        assert_eq!(handle.current_status(), LinkStatus::Ready);
        handle.0.snapshot.publish(TelemetrySnapshot {
            link: LinkStatus::Busy,
            frames: 7,
            ..Default::default()
        });
        assert_eq!(handle.current_status(), LinkStatus::Busy);
        assert_eq!(handle.current_telemetry().frames, 7);
        handle.shutdown();
        assert!(handle.0.is_shutdown());
    }
}
