//! Transport Finite-State Machine
//!
//! The single authority on what the transport is doing. It decides whether a
//! request is legal in the current state and sequences the side effects
//! (declick, freeze, locate, butler hand-off) through a [`TransportApi`]
//! implemented by the cycle driver. The machine itself owns no position or
//! speed; that keeps it testable against a recording mock.
//!
//! Motion and butler state are orthogonal: the transport can be `Stopped`
//! while still waiting for the butler to finish flushing after the stop.

use tl_core::SamplePosition;

use crate::error::RequestError;

// ═══════════════════════════════════════════════════════════════════════════════
// TYPES
// ═══════════════════════════════════════════════════════════════════════════════

/// What the transport does once a locate completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocateTransportDisposition {
    MustRoll,
    MustStop,
    /// Roll if the transport was rolling when the locate was requested
    #[default]
    RollIfAppropriate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocateRequest {
    pub target: SamplePosition,
    pub disposition: LocateTransportDisposition,
    /// Locate even when already at the target
    pub force: bool,
    /// Synthetic locate generated by a loop wrap
    pub for_loop_end: bool,
}

impl LocateRequest {
    pub fn new(target: SamplePosition, disposition: LocateTransportDisposition) -> Self {
        Self {
            target,
            disposition,
            force: false,
            for_loop_end: false,
        }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionState {
    Stopped,
    Rolling,
    /// Fading out before freezing position
    DeclickToStop,
    /// Fading out before jumping
    DeclickToLocate,
    /// Position moved; disk buffers are being refilled
    WaitingForLocate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButlerState {
    NotWaitingForButler,
    WaitingForButler,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FsmEvent {
    StartTransport,
    StopTransport { abort: bool, clear_state: bool },
    Locate(LocateRequest),
    SetSpeed(f64),
    /// The declick fade requested by `begin_declick_out` has finished
    DeclickDone,
    /// Post-transport work blocking motion has been cleared
    ButlerDone,
}

/// Side effects the machine asks its owner to perform
pub trait TransportApi {
    /// Begin playback at the current speed, fading in
    fn start_playback(&mut self);
    /// Freeze position and flag stop work. Returns whether the butler must
    /// run before the stop is complete.
    fn stop_transport(&mut self, abort: bool, clear_state: bool) -> bool;
    /// Move the playhead. Returns whether the butler must run before the
    /// locate is complete.
    fn locate(&mut self, request: &LocateRequest) -> bool;
    /// A locate has fully completed
    fn locate_done(&mut self);
    /// Start fading audio out; `FsmEvent::DeclickDone` follows
    fn begin_declick_out(&mut self);
    fn set_transport_speed(&mut self, speed: f64);
    fn actively_recording(&self) -> bool;
    /// Report a request that became illegal between queueing and execution
    fn refuse(&mut self, error: RequestError);
}

// ═══════════════════════════════════════════════════════════════════════════════
// MACHINE
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct TransportFsm {
    motion: MotionState,
    butler: ButlerState,
    /// Locate waiting for a declick to finish. Last writer wins.
    pending_locate: Option<LocateRequest>,
    /// Whether the transport was rolling when the current locate began
    rolling_before_locate: bool,
    roll_after_locate: bool,
    /// Stop requested while a locate was in flight
    deferred_stop: Option<(bool, bool)>,
    /// Start requested while a stop was still completing
    deferred_start: bool,
    stop_abort: bool,
    stop_clear_state: bool,
}

impl Default for TransportFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl TransportFsm {
    pub fn new() -> Self {
        Self {
            motion: MotionState::Stopped,
            butler: ButlerState::NotWaitingForButler,
            pending_locate: None,
            rolling_before_locate: false,
            roll_after_locate: false,
            deferred_stop: None,
            deferred_start: false,
            stop_abort: false,
            stop_clear_state: false,
        }
    }

    #[inline]
    pub fn motion(&self) -> MotionState {
        self.motion
    }

    #[inline]
    pub fn butler_state(&self) -> ButlerState {
        self.butler
    }

    #[inline]
    pub fn rolling(&self) -> bool {
        self.motion == MotionState::Rolling
    }

    #[inline]
    pub fn stopped(&self) -> bool {
        self.motion == MotionState::Stopped
    }

    /// Audio is still flowing (rolling or fading out)
    #[inline]
    pub fn moving(&self) -> bool {
        matches!(
            self.motion,
            MotionState::Rolling | MotionState::DeclickToStop | MotionState::DeclickToLocate
        )
    }

    #[inline]
    pub fn declick_in_progress(&self) -> bool {
        matches!(
            self.motion,
            MotionState::DeclickToStop | MotionState::DeclickToLocate
        )
    }

    #[inline]
    pub fn locating(&self) -> bool {
        matches!(
            self.motion,
            MotionState::DeclickToLocate | MotionState::WaitingForLocate
        )
    }

    #[inline]
    pub fn waiting_for_butler(&self) -> bool {
        self.butler == ButlerState::WaitingForButler
    }

    /// Target of a locate not yet executed
    pub fn pending_locate(&self) -> Option<LocateRequest> {
        self.pending_locate
    }

    /// Back to `Stopped` with nothing in flight (engine halt)
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn process_event(&mut self, event: FsmEvent, api: &mut impl TransportApi) {
        match event {
            FsmEvent::StartTransport => self.on_start(api),
            FsmEvent::StopTransport { abort, clear_state } => {
                self.on_stop(abort, clear_state, api)
            }
            FsmEvent::Locate(request) => self.on_locate(request, api),
            FsmEvent::SetSpeed(speed) => self.on_set_speed(speed, api),
            FsmEvent::DeclickDone => self.on_declick_done(api),
            FsmEvent::ButlerDone => self.on_butler_done(api),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Handlers
    // ─────────────────────────────────────────────────────────────────────────────

    fn on_start(&mut self, api: &mut impl TransportApi) {
        match self.motion {
            MotionState::Stopped if self.waiting_for_butler() => self.deferred_start = true,
            MotionState::Stopped => self.start(api),
            MotionState::Rolling => {}
            MotionState::DeclickToStop => self.deferred_start = true,
            MotionState::DeclickToLocate | MotionState::WaitingForLocate => {
                self.roll_after_locate = true;
                self.deferred_stop = None;
            }
        }
    }

    fn on_stop(&mut self, abort: bool, clear_state: bool, api: &mut impl TransportApi) {
        self.deferred_start = false;
        match self.motion {
            // Already stopped: nothing changes, nothing is announced
            MotionState::Stopped => {}
            MotionState::Rolling => {
                self.stop_abort = abort;
                self.stop_clear_state = clear_state;
                self.motion = MotionState::DeclickToStop;
                api.begin_declick_out();
            }
            MotionState::DeclickToStop => {
                self.stop_abort |= abort;
                self.stop_clear_state |= clear_state;
            }
            MotionState::DeclickToLocate | MotionState::WaitingForLocate => {
                self.roll_after_locate = false;
                self.deferred_stop = Some((abort, clear_state));
            }
        }
    }

    fn on_locate(&mut self, request: LocateRequest, api: &mut impl TransportApi) {
        if api.actively_recording() && !request.for_loop_end {
            api.refuse(RequestError::ActivelyRecording);
            return;
        }

        match self.motion {
            MotionState::Stopped => {
                self.rolling_before_locate = false;
                self.roll_after_locate = Self::should_roll(request.disposition, false);
                self.deferred_stop = None;
                self.execute_locate(request, api);
            }
            MotionState::Rolling => {
                self.rolling_before_locate = true;
                self.roll_after_locate = Self::should_roll(request.disposition, true);
                self.deferred_stop = None;
                self.pending_locate = Some(request);
                self.motion = MotionState::DeclickToLocate;
                api.begin_declick_out();
            }
            MotionState::DeclickToLocate => {
                self.roll_after_locate =
                    Self::should_roll(request.disposition, self.rolling_before_locate);
                self.deferred_stop = None;
                self.pending_locate = Some(request);
            }
            // Runs once the stop completes, from a stopped transport
            MotionState::DeclickToStop => self.pending_locate = Some(request),
            MotionState::WaitingForLocate => {
                // Newer target supersedes the one in flight
                self.roll_after_locate =
                    Self::should_roll(request.disposition, self.rolling_before_locate);
                self.deferred_stop = None;
                self.execute_locate(request, api);
            }
        }
    }

    fn on_set_speed(&mut self, speed: f64, api: &mut impl TransportApi) {
        if speed == 0.0 {
            self.on_stop(false, false, api);
            return;
        }
        api.set_transport_speed(speed);
        match self.motion {
            MotionState::Stopped => self.on_start(api),
            MotionState::DeclickToLocate | MotionState::WaitingForLocate => {
                self.roll_after_locate = true;
                self.deferred_stop = None;
            }
            MotionState::DeclickToStop => self.deferred_start = true,
            MotionState::Rolling => {}
        }
    }

    fn on_declick_done(&mut self, api: &mut impl TransportApi) {
        match self.motion {
            MotionState::DeclickToStop => {
                if api.stop_transport(self.stop_abort, self.stop_clear_state) {
                    self.butler = ButlerState::WaitingForButler;
                }
                self.motion = MotionState::Stopped;
                self.stop_abort = false;
                self.stop_clear_state = false;

                if let Some(request) = self.pending_locate.take() {
                    self.rolling_before_locate = false;
                    self.roll_after_locate = Self::should_roll(request.disposition, false)
                        || std::mem::take(&mut self.deferred_start);
                    self.execute_locate(request, api);
                } else if self.deferred_start && !self.waiting_for_butler() {
                    self.deferred_start = false;
                    self.start(api);
                }
            }
            MotionState::DeclickToLocate => {
                if let Some(request) = self.pending_locate.take() {
                    self.execute_locate(request, api);
                } else {
                    self.motion = MotionState::Rolling;
                }
            }
            _ => {}
        }
    }

    fn on_butler_done(&mut self, api: &mut impl TransportApi) {
        self.butler = ButlerState::NotWaitingForButler;
        match self.motion {
            MotionState::WaitingForLocate => self.finish_locate(api),
            MotionState::Stopped if self.deferred_start => {
                self.deferred_start = false;
                self.start(api);
            }
            _ => {}
        }
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────────

    fn should_roll(disposition: LocateTransportDisposition, was_rolling: bool) -> bool {
        match disposition {
            LocateTransportDisposition::MustRoll => true,
            LocateTransportDisposition::MustStop => false,
            LocateTransportDisposition::RollIfAppropriate => was_rolling,
        }
    }

    fn start(&mut self, api: &mut impl TransportApi) {
        self.motion = MotionState::Rolling;
        api.start_playback();
    }

    fn execute_locate(&mut self, request: LocateRequest, api: &mut impl TransportApi) {
        self.motion = MotionState::WaitingForLocate;
        if api.locate(&request) {
            self.butler = ButlerState::WaitingForButler;
        } else if !self.waiting_for_butler() {
            self.finish_locate(api);
        }
    }

    fn finish_locate(&mut self, api: &mut impl TransportApi) {
        self.motion = MotionState::Stopped;
        api.locate_done();

        if let Some((abort, clear_state)) = self.deferred_stop.take() {
            if api.stop_transport(abort, clear_state) {
                self.butler = ButlerState::WaitingForButler;
            }
        } else if self.roll_after_locate {
            self.start(api);
        }
        self.roll_after_locate = false;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Start,
        Stop(bool),
        Locate(u64),
        LocateDone,
        DeclickOut,
        Speed(f64),
        Refused(RequestError),
    }

    #[derive(Default)]
    struct MockApi {
        calls: Vec<Call>,
        recording: bool,
        butler_needed: bool,
    }

    impl TransportApi for MockApi {
        fn start_playback(&mut self) {
            self.calls.push(Call::Start);
        }
        fn stop_transport(&mut self, abort: bool, _clear_state: bool) -> bool {
            self.calls.push(Call::Stop(abort));
            self.butler_needed
        }
        fn locate(&mut self, request: &LocateRequest) -> bool {
            self.calls.push(Call::Locate(request.target.0));
            self.butler_needed
        }
        fn locate_done(&mut self) {
            self.calls.push(Call::LocateDone);
        }
        fn begin_declick_out(&mut self) {
            self.calls.push(Call::DeclickOut);
        }
        fn set_transport_speed(&mut self, speed: f64) {
            self.calls.push(Call::Speed(speed));
        }
        fn actively_recording(&self) -> bool {
            self.recording
        }
        fn refuse(&mut self, error: RequestError) {
            self.calls.push(Call::Refused(error));
        }
    }

    fn locate(target: u64, disposition: LocateTransportDisposition) -> FsmEvent {
        FsmEvent::Locate(LocateRequest::new(SamplePosition(target), disposition))
    }

    fn stop() -> FsmEvent {
        FsmEvent::StopTransport {
            abort: false,
            clear_state: false,
        }
    }

    #[test]
    fn test_start_then_stop_goes_through_declick() {
        let mut fsm = TransportFsm::new();
        let mut api = MockApi::default();

        fsm.process_event(FsmEvent::StartTransport, &mut api);
        assert_eq!(fsm.motion(), MotionState::Rolling);

        fsm.process_event(stop(), &mut api);
        assert_eq!(fsm.motion(), MotionState::DeclickToStop);
        assert!(fsm.moving());

        fsm.process_event(FsmEvent::DeclickDone, &mut api);
        assert_eq!(fsm.motion(), MotionState::Stopped);
        assert_eq!(api.calls, vec![Call::Start, Call::DeclickOut, Call::Stop(false)]);
    }

    #[test]
    fn test_stop_when_stopped_is_silent() {
        let mut fsm = TransportFsm::new();
        let mut api = MockApi::default();
        fsm.process_event(stop(), &mut api);
        fsm.process_event(stop(), &mut api);
        assert!(api.calls.is_empty());
        assert!(fsm.stopped());
    }

    #[test]
    fn test_locate_from_stopped_waits_for_butler() {
        let mut fsm = TransportFsm::new();
        let mut api = MockApi {
            butler_needed: true,
            ..Default::default()
        };

        fsm.process_event(locate(5000, LocateTransportDisposition::RollIfAppropriate), &mut api);
        assert_eq!(fsm.motion(), MotionState::WaitingForLocate);
        assert!(fsm.waiting_for_butler());

        fsm.process_event(FsmEvent::ButlerDone, &mut api);
        assert_eq!(fsm.motion(), MotionState::Stopped);
        assert_eq!(api.calls, vec![Call::Locate(5000), Call::LocateDone]);
    }

    #[test]
    fn test_must_roll_locate_rolls_afterwards() {
        let mut fsm = TransportFsm::new();
        let mut api = MockApi::default();
        fsm.process_event(locate(100, LocateTransportDisposition::MustRoll), &mut api);
        assert!(fsm.rolling());
        assert_eq!(
            api.calls,
            vec![Call::Locate(100), Call::LocateDone, Call::Start]
        );
    }

    #[test]
    fn test_locate_while_rolling_declicks_then_resumes() {
        let mut fsm = TransportFsm::new();
        let mut api = MockApi::default();
        fsm.process_event(FsmEvent::StartTransport, &mut api);
        fsm.process_event(locate(700, LocateTransportDisposition::RollIfAppropriate), &mut api);
        assert_eq!(fsm.motion(), MotionState::DeclickToLocate);
        assert!(fsm.locating());

        fsm.process_event(FsmEvent::DeclickDone, &mut api);
        assert!(fsm.rolling());
        assert_eq!(
            api.calls,
            vec![
                Call::Start,
                Call::DeclickOut,
                Call::Locate(700),
                Call::LocateDone,
                Call::Start
            ]
        );
    }

    #[test]
    fn test_last_locate_during_declick_wins() {
        let mut fsm = TransportFsm::new();
        let mut api = MockApi::default();
        fsm.process_event(FsmEvent::StartTransport, &mut api);
        fsm.process_event(locate(1, LocateTransportDisposition::MustStop), &mut api);
        fsm.process_event(locate(2, LocateTransportDisposition::MustStop), &mut api);
        fsm.process_event(locate(3, LocateTransportDisposition::MustStop), &mut api);
        assert_eq!(fsm.pending_locate().map(|r| r.target.0), Some(3));

        fsm.process_event(FsmEvent::DeclickDone, &mut api);
        let locates: Vec<_> = api
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Locate(_)))
            .collect();
        assert_eq!(locates, vec![&Call::Locate(3)]);
        assert!(fsm.stopped());
    }

    #[test]
    fn test_locate_refused_while_recording() {
        let mut fsm = TransportFsm::new();
        let mut api = MockApi {
            recording: true,
            ..Default::default()
        };
        fsm.process_event(FsmEvent::StartTransport, &mut api);
        fsm.process_event(locate(9, LocateTransportDisposition::MustRoll), &mut api);

        assert!(fsm.rolling());
        assert_eq!(
            api.calls,
            vec![Call::Start, Call::Refused(RequestError::ActivelyRecording)]
        );
    }

    #[test]
    fn test_loop_locate_allowed_while_recording() {
        let mut fsm = TransportFsm::new();
        let mut api = MockApi {
            recording: true,
            ..Default::default()
        };
        let mut request = LocateRequest::new(SamplePosition(1000), LocateTransportDisposition::MustRoll);
        request.for_loop_end = true;
        fsm.process_event(FsmEvent::Locate(request), &mut api);
        assert!(api.calls.contains(&Call::Locate(1000)));
    }

    #[test]
    fn test_stop_during_locate_leaves_transport_stopped() {
        let mut fsm = TransportFsm::new();
        let mut api = MockApi {
            butler_needed: true,
            ..Default::default()
        };
        fsm.process_event(locate(400, LocateTransportDisposition::MustRoll), &mut api);
        fsm.process_event(stop(), &mut api);
        fsm.process_event(FsmEvent::ButlerDone, &mut api);

        assert!(fsm.stopped());
        assert!(!api.calls.contains(&Call::Start));
        assert_eq!(api.calls.last(), Some(&Call::Stop(false)));
    }

    #[test]
    fn test_start_during_stop_declick_restarts() {
        let mut fsm = TransportFsm::new();
        let mut api = MockApi::default();
        fsm.process_event(FsmEvent::StartTransport, &mut api);
        fsm.process_event(stop(), &mut api);
        fsm.process_event(FsmEvent::StartTransport, &mut api);
        fsm.process_event(FsmEvent::DeclickDone, &mut api);

        assert!(fsm.rolling());
    }

    #[test]
    fn test_zero_speed_means_stop() {
        let mut fsm = TransportFsm::new();
        let mut api = MockApi::default();
        fsm.process_event(FsmEvent::SetSpeed(1.5), &mut api);
        assert!(fsm.rolling());
        fsm.process_event(FsmEvent::SetSpeed(0.0), &mut api);
        assert_eq!(fsm.motion(), MotionState::DeclickToStop);
        assert_eq!(api.calls[0], Call::Speed(1.5));
    }
}
