//! Per-link context owned by a control loop.
//!
//! `Backend` composes the sequencer, the telemetry store, the CSV logger and an
//! optional survey. It never touches a socket: the threaded and async loops
//! move bytes and call into it once per cycle.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::{NetworkConfig, TestbedConfig};
use crate::diagnostics::LinkDiagnostics;
use crate::error::{FrameError, TestbedResult};
use crate::handoff::LoopShared;
use crate::logger::{LogRecord, TelemetryLogger};
use crate::protocol::{
    encode_command, validate_command, CommandFrame, CommandTag, FrameLayout, ScanMethod,
    COMMAND_FRAME_LEN,
};
use crate::sequencer::{CommandSequencer, SequencerEvent};
use crate::survey::{Survey, SurveyPlan};
use crate::telemetry::{TelemetrySnapshot, TelemetryStore};
use crate::{LinkStatus, LoopEvent};

#[derive(Debug)]
pub struct Backend {
    network: NetworkConfig,
    layout: FrameLayout,
    sequencer: CommandSequencer,
    store: TelemetryStore,
    logger: Option<TelemetryLogger>,
    survey: Option<Survey>,
    diagnostics: Arc<LinkDiagnostics>,
}

impl Backend {
    /// Builds the context and, when CSV logging is enabled, opens the log file.
    pub fn new(config: &TestbedConfig, diagnostics: Arc<LinkDiagnostics>) -> TestbedResult<Self> {
        let layout = config.layout()?;
        let logger = if config.log.enable_csv {
            Some(TelemetryLogger::create(&config.log.csv_dir, layout.elements)?)
        } else {
            None
        };
        Ok(Self {
            network: config.network.clone(),
            layout,
            sequencer: CommandSequencer::new(config.sequencer.ack_timeout_cycles),
            store: TelemetryStore::new(config.engine()?, config.quantizer()?),
            logger,
            survey: None,
            diagnostics,
        })
    }

    /// Replaces the CSV sink.
    pub fn with_logger(mut self, logger: TelemetryLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    pub fn store(&self) -> &TelemetryStore {
        &self.store
    }

    pub fn sequencer(&self) -> &CommandSequencer {
        &self.sequencer
    }

    pub fn logger(&self) -> Option<&TelemetryLogger> {
        self.logger.as_ref()
    }

    pub fn status(&self) -> LinkStatus {
        self.sequencer.status()
    }

    /// Receive deadline for the cycle about to run.
    pub fn recv_timeout(&self) -> Duration {
        self.network.recv_timeout(self.sequencer.status())
    }

    pub fn is_surveying(&self) -> bool {
        self.survey.is_some()
    }

    /// `(completed, total)` of the running survey.
    pub fn survey_progress(&self) -> Option<(usize, usize)> {
        self.survey.as_ref().map(Survey::progress)
    }

    /// Whether a collaborator command would be taken right now.
    pub fn accepting(&self) -> bool {
        self.sequencer.is_idle() && self.survey.is_none()
    }

    /// Requests a command. Frames that cannot be encoded for this array are refused up front.
    pub fn issue(&mut self, frame: CommandFrame) -> bool {
        if let Err(e) = validate_command(&frame, self.layout.elements) {
            warn!(tag = %frame.tag(), error = %e, "refusing unencodable command");
            return false;
        }
        let tag = frame.tag();
        let accepted = self.sequencer.issue(frame);
        if accepted {
            debug!(%tag, "command queued");
        } else {
            self.diagnostics.record_busy_rejection();
            debug!(%tag, "command rejected, array busy");
        }
        accepted
    }

    /// Starts visiting `plan`; scans are issued automatically whenever the array is idle.
    pub fn start_survey(&mut self, plan: SurveyPlan) -> Vec<LoopEvent> {
        let survey = Survey::new(plan);
        match survey.current() {
            Some(first) => {
                info!(position = %first, positions = survey.progress().1, "survey started");
                self.survey = Some(survey);
                vec![LoopEvent::SurveyMoved(first)]
            }
            None => {
                info!("survey plan is empty");
                vec![LoopEvent::SurveyComplete]
            }
        }
    }

    /// Moves waiting collaborator requests into the sequencer or survey.
    pub fn take_requests(&mut self, shared: &LoopShared) -> Vec<LoopEvent> {
        if let Some(frame) = shared.mailbox.take() {
            let tag = frame.tag();
            if !self.issue(frame) {
                warn!(%tag, "mailbox command lost to the sequencer");
            }
        }
        match shared.mailbox.take_survey() {
            Some(plan) => self.start_survey(plan),
            None => Vec::new(),
        }
    }

    /// Bytes to send this cycle. Consumes the pending command, if any.
    pub fn next_datagram(&mut self) -> Result<[u8; COMMAND_FRAME_LEN], FrameError> {
        if self.survey.is_some() && self.sequencer.is_idle() {
            self.sequencer.issue(CommandFrame::Scan(ScanMethod::Steering));
        }
        let frame = self.sequencer.outbound();
        if !frame.tag().is_nop() {
            info!(tag = %frame.tag(), "sending command");
        }
        let bytes = encode_command(&frame)?;
        self.diagnostics.record_sent();
        Ok(bytes)
    }

    /// Nothing arrived before the deadline.
    pub fn handle_timeout(&mut self) -> Vec<LoopEvent> {
        self.diagnostics.record_timeout();
        match self.sequencer.on_timeout() {
            Some(SequencerEvent::Disconnected) => {
                warn!(peer = %self.network.peer, "waiting for controller packet");
                vec![LoopEvent::Disconnected]
            }
            _ => Vec::new(),
        }
    }

    /// A datagram arrived. Malformed frames are counted and otherwise ignored.
    pub fn handle_datagram(&mut self, bytes: &[u8]) -> Vec<LoopEvent> {
        self.diagnostics.record_received();
        let frame = match self.layout.decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.diagnostics.record_malformed();
                warn!(error = %e, len = bytes.len(), "dropping malformed telemetry frame");
                return Vec::new();
            }
        };

        let echo = frame.echoed;
        self.store.update(frame);
        let mut events = Vec::new();
        for event in self.sequencer.on_echo(echo) {
            match event {
                SequencerEvent::Started(tag) => {
                    info!(%tag, "rising edge");
                    events.push(LoopEvent::Started(tag));
                }
                SequencerEvent::Finished(tag) => {
                    info!(%tag, "falling edge");
                    self.on_finished(tag, &mut events);
                }
                SequencerEvent::Dropped(tag) => {
                    self.diagnostics.record_dropped_command();
                    warn!(%tag, "command never acknowledged, dropped");
                    events.push(LoopEvent::Dropped(tag));
                }
                SequencerEvent::Reconnected => {
                    info!("controller link restored");
                    events.push(LoopEvent::Reconnected);
                }
                SequencerEvent::Disconnected => events.push(LoopEvent::Disconnected),
            }
        }
        events
    }

    fn on_finished(&mut self, tag: CommandTag, events: &mut Vec<LoopEvent>) {
        let snapshot = Arc::new(self.snapshot());

        if matches!(tag, CommandTag::Scan | CommandTag::Steer) {
            let truth = match (&self.survey, tag) {
                (Some(survey), CommandTag::Scan) => survey.current(),
                _ => None,
            };
            let records = LogRecord::from_snapshot(&snapshot, truth);
            if let Some(logger) = self.logger.as_mut() {
                if let Err(e) = logger.log(&records) {
                    warn!(error = %e, "failed to write CSV rows");
                }
            }
        }

        if !snapshot.pa_faults.is_empty() {
            warn!(elements = ?snapshot.pa_faults, "power amplifier fault");
            events.push(LoopEvent::PaFault(snapshot.pa_faults.clone()));
        }

        events.push(LoopEvent::Finished { tag, snapshot });

        if tag == CommandTag::Scan {
            self.advance_survey(events);
        }
    }

    fn advance_survey(&mut self, events: &mut Vec<LoopEvent>) {
        let Some(survey) = self.survey.as_mut() else {
            return;
        };
        match survey.advance() {
            Some(next) => {
                let (done, total) = survey.progress();
                info!(position = %next, "progress: {done} / {total}");
                events.push(LoopEvent::SurveyMoved(next));
            }
            None => {
                info!("survey complete");
                self.survey = None;
                events.push(LoopEvent::SurveyComplete);
            }
        }
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.store.snapshot(self.sequencer.status())
    }

    /// Publishes the snapshot and the mailbox's accepting flag.
    pub fn publish(&self, shared: &LoopShared) {
        shared.snapshot.publish(self.snapshot());
        shared.mailbox.set_accepting(self.accepting());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SurveyConfig;
    use crate::emulator::ArrayEmulator;
    use crate::survey::SurveyPosition;

    fn config() -> TestbedConfig {
        let mut config = TestbedConfig::default();
        config.log.enable_csv = false;
        config
    }

    fn backend() -> Backend {
        Backend::new(&config(), Arc::new(LinkDiagnostics::default())).unwrap()
    }

    /// Runs one full cycle against the emulator.
    fn cycle(backend: &mut Backend, emu: &mut ArrayEmulator) -> Vec<LoopEvent> {
        let out = backend.next_datagram().unwrap();
        let reply = emu.handle(&out).unwrap();
        backend.handle_datagram(&reply)
    }

    fn run_until_idle(backend: &mut Backend, emu: &mut ArrayEmulator) -> Vec<LoopEvent> {
        let mut events = Vec::new();
        for _ in 0..20 {
            events.extend(cycle(backend, emu));
            if backend.sequencer().is_idle() && emu.running().is_none() {
                break;
            }
        }
        events
    }

    #[test]
    fn scan_against_emulator_finishes_with_directions() {
        let mut b = backend();
        let mut emu = ArrayEmulator::from_config(&config()).unwrap();
        assert!(b.issue(CommandFrame::Scan(ScanMethod::Steering)));
        let events = run_until_idle(&mut b, &mut emu);

        assert_eq!(events[0], LoopEvent::Started(CommandTag::Scan));
        let snapshot = events
            .iter()
            .find_map(|e| match e {
                LoopEvent::Finished { tag: CommandTag::Scan, snapshot } => Some(snapshot.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(snapshot.link, LinkStatus::Ready);
        let found = snapshot.peripherals[0].direction;
        assert!((found.theta_deg - 30.0).abs() <= 5.0, "{found:?}");
        assert!((found.phi_deg - 45.0).abs() <= 5.0, "{found:?}");
        assert_eq!(b.status(), LinkStatus::Ready);
    }

    #[test]
    fn busy_backend_rejects_and_counts() {
        let diag = Arc::new(LinkDiagnostics::default());
        let mut b = Backend::new(&config(), Arc::clone(&diag)).unwrap();
        let mut emu = ArrayEmulator::from_config(&config()).unwrap();
        assert!(b.issue(CommandFrame::Reset));
        cycle(&mut b, &mut emu);
        assert_eq!(b.status(), LinkStatus::Busy);
        assert!(!b.issue(CommandFrame::SetLoss(1)));
        assert_eq!(diag.snapshot().busy_rejections, 1);
        assert_eq!(b.recv_timeout(), Duration::from_millis(5000));
    }

    #[test]
    fn oversized_phase_command_is_refused() {
        let mut b = backend();
        assert!(!b.issue(CommandFrame::SetPhase(vec![0; 200])));
        assert!(b.sequencer().is_idle());
    }

    #[test]
    fn malformed_frame_leaves_state_alone() {
        let diag = Arc::new(LinkDiagnostics::default());
        let mut b = Backend::new(&config(), Arc::clone(&diag)).unwrap();
        let before = b.snapshot();
        assert!(b.handle_datagram(&[0u8; 10]).is_empty());
        assert_eq!(b.snapshot(), before);
        assert_eq!(diag.snapshot().malformed_frames, 1);
    }

    #[test]
    fn timeout_then_reply_reconnects() {
        let mut b = backend();
        let mut emu = ArrayEmulator::from_config(&config()).unwrap();
        assert_eq!(b.handle_timeout(), vec![LoopEvent::Disconnected]);
        assert!(b.handle_timeout().is_empty());
        assert_eq!(b.status(), LinkStatus::Disconnected);
        assert_eq!(cycle(&mut b, &mut emu), vec![LoopEvent::Reconnected]);
    }

    #[test]
    fn pa_fault_is_reported_on_completion() {
        let mut b = backend();
        let mut emu = ArrayEmulator::from_config(&config()).unwrap();
        emu.set_pa_power(5, 100);
        assert!(b.issue(CommandFrame::SetLoss(20)));
        let events = run_until_idle(&mut b, &mut emu);
        assert!(events.contains(&LoopEvent::PaFault(vec![5])));
        assert_eq!(b.snapshot().attenuation, 20);
    }

    #[test]
    fn survey_scans_each_position_and_logs_ground_truth() {
        let dir = tempfile::tempdir().unwrap();
        let logger = TelemetryLogger::create(dir.path(), 16).unwrap();
        let mut b = backend().with_logger(logger);
        let mut emu = ArrayEmulator::from_config(&config()).unwrap();

        let plan = SurveyPlan::from_config(&SurveyConfig {
            end_index: Some(2),
            ..Default::default()
        });
        let events = b.start_survey(plan);
        assert_eq!(
            events,
            vec![LoopEvent::SurveyMoved(SurveyPosition {
                range: 50,
                theta_deg: 0,
                phi_deg: 0
            })]
        );
        assert!(!b.accepting());

        let mut events = Vec::new();
        for _ in 0..40 {
            events.extend(cycle(&mut b, &mut emu));
            if !b.is_surveying() {
                break;
            }
        }
        let scans = events
            .iter()
            .filter(|e| matches!(e, LoopEvent::Finished { tag: CommandTag::Scan, .. }))
            .count();
        assert_eq!(scans, 2);
        assert_eq!(events.last(), Some(&LoopEvent::SurveyComplete));

        // two emulated peripherals per scan
        let logger = b.logger().unwrap();
        assert_eq!(logger.rows_written(), 4);
        let text = std::fs::read_to_string(logger.path().unwrap()).unwrap();
        let rows: Vec<_> = text.lines().skip(1).collect();
        assert!(rows[0].starts_with("1,50,0,0,"));
        assert!(rows[2].starts_with("1,50,10,180,"));
    }

    #[test]
    fn empty_survey_completes_immediately() {
        let mut b = backend();
        let plan = SurveyPlan::from_config(&SurveyConfig {
            end_index: Some(0),
            ..Default::default()
        });
        assert_eq!(b.start_survey(plan), vec![LoopEvent::SurveyComplete]);
        assert!(!b.is_surveying());
    }

    #[test]
    fn mailbox_requests_reach_the_sequencer() {
        let mut b = backend();
        let shared = LoopShared::new(16);
        b.publish(&shared);
        assert!(shared.issue(CommandFrame::Steer(1)));
        assert!(b.take_requests(&shared).is_empty());
        assert_eq!(b.sequencer().pending(), Some(&CommandFrame::Steer(1)));
        b.publish(&shared);
        assert!(!shared.mailbox.is_accepting());
    }

    #[test]
    fn mailbox_verdict_matches_the_sequencer() {
        let mut b = backend();
        let shared = LoopShared::new(b.layout().elements);
        b.publish(&shared);
        assert!(!shared.issue(CommandFrame::SetPhase(vec![0; 200])));
        assert!(!shared.issue(CommandFrame::SetPhase(vec![1; 3])));
        assert!(b.take_requests(&shared).is_empty());
        assert_eq!(b.sequencer().pending(), None);

        let codes = vec![1; b.layout().elements];
        assert!(shared.issue(CommandFrame::SetPhase(codes.clone())));
        b.take_requests(&shared);
        assert_eq!(b.sequencer().pending(), Some(&CommandFrame::SetPhase(codes)));
    }

    #[test]
    fn publish_shares_snapshot_and_acceptance() {
        let b = backend();
        let shared = LoopShared::new(16);
        b.publish(&shared);
        assert!(shared.mailbox.is_accepting());
        assert_eq!(shared.snapshot.latest().link, LinkStatus::Ready);
    }
}
