//! Process Cycle Driver
//!
//! [`ProcessEngine::process`] is the single real-time entry point, called
//! once per audio buffer. Each cycle:
//!
//! 1. drains due session events into the transport FSM
//! 2. asks the active transport master for a strategy and applies it
//! 3. runs the declick envelope
//! 4. processes routes and advances the playhead by `nframes * speed`
//! 5. wraps at the loop end, or stops/moves on at a bounded-roll or
//!    play-range end
//! 6. publishes post-transport work and summons the butler
//! 7. publishes state and flushes staged notifications
//!
//! Nothing here blocks or allocates; shared data is read through atomics and
//! snapshots, and everything that goes wrong becomes a counter or a
//! notification.

use std::sync::Arc;

use tl_core::{SamplePosition, TimeDomain};

use crate::butler::ButlerWaker;
use crate::context::{PunchLoopLock, RecordState, TransportContext, TransportState};
use crate::declick::{DeclickOutcome, DeclickPhase, DeclickRamp, Declicker};
use crate::error::{RequestError, RouteError};
use crate::events::{EventAction, EventReceiver, SessionEvent};
use crate::fsm::{FsmEvent, LocateRequest, LocateTransportDisposition, MotionState, TransportApi, TransportFsm};
use crate::master::{
    MasterSync, PlanInput, SyncSource, TransportMaster, TransportMasterAction,
    TransportMasterState, TransportMasterStrategy,
};
use crate::notify::{NotificationOutbox, TransportNotification};
use crate::post_transport::PostTransportWork;

// ═══════════════════════════════════════════════════════════════════════════════
// ROUTE SEAM
// ═══════════════════════════════════════════════════════════════════════════════

/// What route processing needs to know about one cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleContext {
    /// Playhead at the start of the cycle
    pub start: SamplePosition,
    /// Playhead after advancing (before any loop wrap)
    pub end: SamplePosition,
    pub nframes: u32,
    pub speed: f64,
    /// Declick gain to apply to this cycle's output
    pub ramp: DeclickRamp,
    pub rolling: bool,
    pub recording: bool,
}

/// Route graph / DSP, driven once per cycle
pub trait RouteProcessor {
    /// Returns whether disk buffers want the butler
    fn process_routes(&mut self, cycle: &CycleContext) -> Result<bool, RouteError>;
}

/// Route processor for a session without routes
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRoutes;

impl RouteProcessor for NoRoutes {
    fn process_routes(&mut self, _cycle: &CycleContext) -> Result<bool, RouteError> {
        Ok(false)
    }
}

/// Summary of one cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleReport {
    pub start: SamplePosition,
    pub end: SamplePosition,
    pub speed: f64,
    pub state: TransportState,
    pub events_applied: usize,
    pub route_fault: bool,
    /// Playhead wrapped at the loop end
    pub looped: bool,
    /// Post-transport bits raised this cycle
    pub work_added: PostTransportWork,
    pub butler_summoned: bool,
    /// Notifications delivered to the outbox
    pub notifications: usize,
}

impl CycleReport {
    fn idle(position: SamplePosition, state: TransportState) -> Self {
        Self {
            start: position,
            end: position,
            speed: 0.0,
            state,
            events_applied: 0,
            route_fault: false,
            looped: false,
            work_added: PostTransportWork::empty(),
            butler_summoned: false,
            notifications: 0,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSPORT CORE
// ═══════════════════════════════════════════════════════════════════════════════

/// Where a play-range request has got to
#[derive(Debug, Clone, Copy)]
struct PlayRangeCursor {
    index: usize,
    leave_rolling: bool,
}

/// Position, speed and record state; carries out what the FSM decides
struct TransportCore {
    ctx: Arc<TransportContext>,
    outbox: NotificationOutbox,
    declicker: Declicker,
    position: SamplePosition,
    /// Sub-sample remainder carried between varispeed cycles
    frac: f64,
    /// Play speed; 0.0 while stopped
    speed: f64,
    default_speed: f64,
    play_loop: bool,
    record: RecordState,
    /// Bounded roll end
    stop_at: Option<SamplePosition>,
    /// The playhead may not pass this while fading out at a loop or
    /// play-range end
    fade_limit: Option<SamplePosition>,
    /// Preroll record: capture holds off until here
    record_from: Option<SamplePosition>,
    play_range: Option<PlayRangeCursor>,
    /// Tempo map version and quarter-note position a parked playhead holds
    /// in beat time
    beat_anchor: Option<(u64, f64)>,
    /// Roll-and-return target
    return_on_stop: Option<SamplePosition>,
    last_roll_start: SamplePosition,
    /// Locate to run once the current FSM transition completes
    follow_up_locate: Option<SamplePosition>,
    /// Bits raised this cycle, published in step 6
    work: PostTransportWork,
}

impl TransportCore {
    fn new(ctx: Arc<TransportContext>, outbox: NotificationOutbox) -> Self {
        let config = ctx.config();
        Self {
            declicker: Declicker::new(config.declick_samples()),
            default_speed: config.default_play_speed,
            outbox,
            position: SamplePosition::ZERO,
            frac: 0.0,
            speed: 0.0,
            play_loop: false,
            record: RecordState::Disabled,
            stop_at: None,
            fade_limit: None,
            record_from: None,
            play_range: None,
            beat_anchor: None,
            return_on_stop: None,
            last_roll_start: SamplePosition::ZERO,
            follow_up_locate: None,
            work: PostTransportWork::empty(),
            ctx,
        }
    }

    fn set_record(&mut self, state: RecordState) {
        if self.record != state {
            self.record = state;
            self.ctx.publish_record_status(state);
            self.outbox.stage(TransportNotification::RecordStateChanged(state));
        }
    }

    fn clear_scheduled(&mut self) {
        self.stop_at = None;
        self.return_on_stop = None;
        self.record_from = None;
        self.cancel_play_range();
    }

    fn cancel_play_range(&mut self) {
        if self.play_range.take().is_some() {
            self.outbox
                .stage(TransportNotification::PlayRange { active: false });
        }
    }

    /// Punch or preroll holds recording back to a window
    fn record_gated(&self) -> bool {
        self.record_from.is_some()
            || (!self.play_loop && self.ctx.locations().load().punch_armed())
    }

    /// Span recording is allowed in while gated, `[from, until)`
    fn record_window(&self) -> (SamplePosition, SamplePosition) {
        let locations = self.ctx.locations().load();
        let punch_in = locations.punch_in_at().filter(|_| !self.play_loop);
        let punch_out = locations.punch_out_at().filter(|_| !self.play_loop);
        let from = match (self.record_from, punch_in) {
            (Some(a), Some(b)) => a.max(b),
            (a, b) => a.or(b).unwrap_or(SamplePosition::ZERO),
        };
        (from, punch_out.unwrap_or(SamplePosition::MAX))
    }

    /// Remember where a parked playhead sits in beats
    fn anchor_beats(&mut self) {
        if self.ctx.config().position_domain != TimeDomain::BeatTime {
            return;
        }
        let version = self.ctx.tempo_map().version();
        let quarters = self.ctx.tempo_map().load().quarter_notes_at_sample(self.position);
        self.beat_anchor = Some((version, quarters));
    }

    fn advance(&mut self, nframes: u32, speed: f64) -> SamplePosition {
        let distance = nframes as f64 * speed + self.frac;
        let whole = distance.trunc();
        self.frac = distance - whole;
        self.position = self.position.offset(whole as i64);
        if let Some(limit) = self.fade_limit.filter(|limit| self.position > *limit) {
            self.position = limit;
            self.frac = 0.0;
        }
        self.position
    }

    fn halt(&mut self) {
        self.speed = 0.0;
        self.frac = 0.0;
        self.declicker.reset();
        self.clear_scheduled();
        self.follow_up_locate = None;
        self.fade_limit = None;
        self.work = PostTransportWork::empty();
        if self.record == RecordState::Recording {
            self.set_record(RecordState::Enabled);
        }
    }
}

impl TransportApi for TransportCore {
    fn start_playback(&mut self) {
        if self.speed == 0.0 {
            self.speed = self.default_speed;
        }
        if self.record == RecordState::Enabled && !self.record_gated() {
            self.set_record(RecordState::Recording);
        }
        self.last_roll_start = self.position;
        self.frac = 0.0;
        self.fade_limit = None;
        self.declicker.fade_in();
    }

    fn stop_transport(&mut self, abort: bool, clear_state: bool) -> bool {
        self.speed = 0.0;
        self.frac = 0.0;
        self.declicker.reset();
        self.stop_at = None;
        self.record_from = None;
        self.cancel_play_range();
        if self.record == RecordState::Recording {
            self.set_record(RecordState::Enabled);
        }
        self.anchor_beats();

        self.work |= PostTransportWork::STOP;
        if abort {
            self.work |= PostTransportWork::ABORT;
        }
        if clear_state {
            self.work |= PostTransportWork::CLEAR_SUBSTATE;
        }

        let auto_return = self.ctx.config().auto_return && !abort;
        let return_to = self
            .return_on_stop
            .take()
            .or_else(|| auto_return.then_some(self.last_roll_start));
        if let Some(target) = return_to.filter(|t| *t != self.position) {
            self.follow_up_locate = Some(target);
        }
        true
    }

    fn locate(&mut self, request: &LocateRequest) -> bool {
        let target = self.ctx.locations().load().clamp_locate(request.target);
        if !request.force && target == self.position {
            return false;
        }

        self.position = target;
        self.frac = 0.0;
        self.ctx.set_locate_target(target);
        self.work |= PostTransportWork::LOCATE;
        if request.for_loop_end {
            self.work |= PostTransportWork::LOOP_CHANGED;
        }
        self.outbox.stage(TransportNotification::PositionChanged(target));
        true
    }

    fn locate_done(&mut self) {
        self.outbox.stage(TransportNotification::Located(self.position));
        self.anchor_beats();
    }

    fn begin_declick_out(&mut self) {
        self.declicker.fade_out();
    }

    fn set_transport_speed(&mut self, speed: f64) {
        let max = self.ctx.config().max_varispeed;
        let speed = speed.clamp(-max, max);
        if self.speed != 0.0 && speed.signum() != self.speed.signum() {
            self.work |= PostTransportWork::REVERSE;
        }
        self.speed = speed;
    }

    fn actively_recording(&self) -> bool {
        self.record == RecordState::Recording
    }

    fn refuse(&mut self, error: RequestError) {
        self.outbox.stage(TransportNotification::RequestRefused(error));
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MASTER REGISTRY
// ═══════════════════════════════════════════════════════════════════════════════

struct SyncState {
    masters: Vec<Box<dyn TransportMaster>>,
    source: SyncSource,
    active: Option<usize>,
    planner: MasterSync,
    published: TransportMasterState,
}

impl SyncState {
    fn select(&mut self, source: SyncSource) {
        self.source = source;
        self.active = match source {
            SyncSource::Internal => None,
            _ => self.masters.iter().position(|m| m.source() == source),
        };
        if let Some(index) = self.active {
            self.masters[index].reset();
        }
        self.planner.reset();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROCESS ENGINE
// ═══════════════════════════════════════════════════════════════════════════════

/// Real-time side of the transport. Owned by the audio callback.
pub struct ProcessEngine {
    ctx: Arc<TransportContext>,
    fsm: TransportFsm,
    core: TransportCore,
    events: EventReceiver,
    sync: SyncState,
    waker: ButlerWaker,
    engine_time: u64,
    published_state: TransportState,
    published_speed: f64,
}

impl ProcessEngine {
    pub(crate) fn new(
        ctx: Arc<TransportContext>,
        events: EventReceiver,
        outbox: NotificationOutbox,
        waker: ButlerWaker,
    ) -> Self {
        let planner = MasterSync::new(ctx.config().sync.clone(), ctx.sample_rate());
        let mut core = TransportCore::new(Arc::clone(&ctx), outbox);
        core.anchor_beats();
        Self {
            fsm: TransportFsm::new(),
            core,
            events,
            sync: SyncState {
                masters: Vec::new(),
                source: SyncSource::Internal,
                active: None,
                planner,
                published: TransportMasterState::Stopped,
            },
            waker,
            engine_time: 0,
            published_state: TransportState::Stopped,
            published_speed: 0.0,
            ctx,
        }
    }

    /// Register a master; replaces any earlier master for the same source.
    /// Call before handing the engine to the audio thread.
    pub fn add_master(&mut self, master: Box<dyn TransportMaster>) {
        log::info!(
            "Registered transport master '{}' ({:?})",
            master.name(),
            master.source()
        );
        let source = master.source();
        self.sync.masters.retain(|m| m.source() != source);
        self.sync.masters.push(master);
        let current = self.sync.source;
        self.sync.select(current);
    }

    pub fn context(&self) -> &Arc<TransportContext> {
        &self.ctx
    }

    pub fn fsm(&self) -> &TransportFsm {
        &self.fsm
    }

    #[inline]
    pub fn position(&self) -> SamplePosition {
        self.core.position
    }

    pub fn engine_time(&self) -> u64 {
        self.engine_time
    }

    /// Notifications lost to a full outbox
    pub fn notifications_dropped(&self) -> u64 {
        self.core.outbox.dropped()
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Cycle
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn process(&mut self, nframes: u32, routes: &mut dyn RouteProcessor) -> CycleReport {
        let mut report = CycleReport::idle(self.core.position, self.published_state);
        if self.ctx.engine_halted() {
            return report;
        }

        self.poll_butler();
        self.follow_tempo_map();

        // 1. Session events due within this cycle
        let cycle_last = self.core.position + (nframes.max(1) as u64 - 1);
        {
            let Self {
                events, fsm, core, sync, ..
            } = self;
            report.events_applied =
                events.drain_due(cycle_last, |event| Self::apply_event(fsm, core, sync, event));
        }

        // 2. External master
        self.follow_master(nframes);

        // 3. Declick
        let moving = self.fsm.moving();
        let speed = if moving { self.core.speed } else { 0.0 };
        let (ramp, outcome) = if moving {
            self.core.declicker.run(nframes as usize)
        } else {
            (DeclickRamp::SILENT, DeclickOutcome::Running)
        };

        // 4. Routes and advance
        let start = self.core.position;
        let end = if moving {
            self.core.advance(nframes, speed)
        } else {
            start
        };
        if moving && speed > 0.0 {
            self.gate_record(start, end);
        }
        let cycle = CycleContext {
            start,
            end,
            nframes,
            speed,
            ramp,
            rolling: moving,
            recording: self.core.record == RecordState::Recording,
        };
        let refill = match routes.process_routes(&cycle) {
            Ok(refill) => refill,
            Err(_) => {
                let count = self.ctx.note_route_fault();
                self.core
                    .outbox
                    .stage(TransportNotification::RouteFault { count });
                report.route_fault = true;
                false
            }
        };

        // 5. Loop boundary, bounded roll, start of timeline
        if moving && speed > 0.0 {
            report.looped = self.check_loop(start, end, nframes);
            self.check_stop_at(end, nframes);
            self.check_play_range(end, nframes);
        } else if moving && speed < 0.0 && end == SamplePosition::ZERO && self.fsm.rolling() {
            self.dispatch(FsmEvent::StopTransport {
                abort: false,
                clear_state: false,
            });
        }
        if outcome == DeclickOutcome::FadeOutComplete {
            self.dispatch(FsmEvent::DeclickDone);
        }

        // 6. Post-transport work
        let added = std::mem::take(&mut self.core.work);
        if !added.is_empty() {
            self.ctx.post_transport_work.add(added);
        }
        report.work_added = added;
        if refill || !self.ctx.post_transport_work.is_empty() {
            self.waker.wake();
            report.butler_summoned = true;
        }

        // 7. Publish
        self.engine_time += nframes as u64;
        self.ctx.publish_engine_time(self.engine_time);
        self.publish();
        report.end = self.core.position;
        report.speed = self.published_speed;
        report.state = self.published_state;
        report.notifications = self.core.outbox.flush();
        report
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Engine conditions
    // ─────────────────────────────────────────────────────────────────────────────

    /// The backend reported an overrun
    pub fn xrun(&mut self) {
        let count = self.ctx.note_xrun();
        self.core.outbox.stage(TransportNotification::Xrun { count });
        if self.ctx.config().stop_recording_on_xrun && self.core.actively_recording() {
            self.dispatch(FsmEvent::StopTransport {
                abort: false,
                clear_state: false,
            });
            self.publish();
        }
        self.core.outbox.flush();
    }

    /// The backend stopped calling us. Everything pending is dropped and the
    /// transport is stopped where it is.
    pub fn engine_halted(&mut self) {
        if self.ctx.engine_halted() {
            return;
        }
        log::warn!("Audio engine halted at sample {}", self.core.position);

        self.ctx.set_engine_halted(true);
        self.fsm.reset();
        self.core.halt();
        let dropped = self.events.clear();
        self.ctx.post_transport_work.clear_all();
        // Any seek still owed is abandoned with the work bits
        self.ctx.mark_seeked(self.ctx.locate_generation());
        if dropped > 0 {
            log::warn!("Discarded {} pending transport events", dropped);
        }

        self.core.outbox.stage(TransportNotification::EngineHalted);
        self.publish();
        self.core.outbox.flush();
    }

    pub fn reengage(&mut self) {
        if !self.ctx.engine_halted() {
            return;
        }
        log::info!("Audio engine re-engaged");
        self.ctx.set_engine_halted(false);
        self.core.outbox.stage(TransportNotification::EngineReengaged);
        self.core.outbox.flush();
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Helpers
    // ─────────────────────────────────────────────────────────────────────────────

    fn dispatch(&mut self, event: FsmEvent) {
        Self::dispatch_to(&mut self.fsm, &mut self.core, event);
    }

    fn dispatch_to(fsm: &mut TransportFsm, core: &mut TransportCore, event: FsmEvent) {
        fsm.process_event(event, core);
        while let Some(target) = core.follow_up_locate.take() {
            let request = LocateRequest::new(target, LocateTransportDisposition::MustStop).forced();
            fsm.process_event(FsmEvent::Locate(request), core);
        }
    }

    /// Motion-blocking work the FSM waits on has been cleared by the butler
    fn poll_butler(&mut self) {
        if !self.fsm.waiting_for_butler()
            || self
                .ctx
                .post_transport_work()
                .intersects(PostTransportWork::BLOCKS_PROCESS)
        {
            return;
        }
        if self.ctx.locate_settled() {
            self.dispatch(FsmEvent::ButlerDone);
        } else {
            // The butler cleared LOCATE for a target that has since moved
            self.core.work |= PostTransportWork::LOCATE;
        }
    }

    fn apply_event(
        fsm: &mut TransportFsm,
        core: &mut TransportCore,
        sync: &mut SyncState,
        event: SessionEvent,
    ) {
        match event.action {
            EventAction::Roll => Self::dispatch_to(fsm, core, FsmEvent::StartTransport),
            EventAction::Stop { abort, clear_state } => {
                core.stop_at = None;
                Self::dispatch_to(fsm, core, FsmEvent::StopTransport { abort, clear_state });
            }
            EventAction::Locate(request) => {
                core.clear_scheduled();
                Self::dispatch_to(fsm, core, FsmEvent::Locate(request));
            }
            EventAction::LocateRollLocate { start, return_to } => {
                core.clear_scheduled();
                let request = LocateRequest::new(start, LocateTransportDisposition::MustRoll).forced();
                Self::dispatch_to(fsm, core, FsmEvent::Locate(request));
                if fsm.locating() || fsm.rolling() {
                    core.return_on_stop = Some(return_to);
                }
            }
            EventAction::BoundedRoll { start, end } => {
                core.clear_scheduled();
                let request = LocateRequest::new(start, LocateTransportDisposition::MustRoll).forced();
                Self::dispatch_to(fsm, core, FsmEvent::Locate(request));
                if fsm.locating() || fsm.rolling() {
                    core.stop_at = Some(end);
                }
            }
            EventAction::SetSpeed(speed) => Self::dispatch_to(fsm, core, FsmEvent::SetSpeed(speed)),
            EventAction::SetDefaultPlaySpeed(speed) => {
                core.default_speed = speed;
                core.ctx.publish_default_play_speed(speed);
            }
            EventAction::SetPlayLoop {
                enabled,
                leave_rolling,
            } => Self::set_play_loop(fsm, core, enabled, leave_rolling),
            EventAction::SetSyncSource(source) => {
                if source != sync.source {
                    sync.select(source);
                    core.ctx.publish_sync_source(source);
                    core.outbox
                        .stage(TransportNotification::SyncSourceChanged(source));
                    if source == SyncSource::Internal {
                        Self::publish_master_state(sync, core, TransportMasterState::Stopped);
                    }
                }
            }
            EventAction::SetRecordEnabled(true) => {
                if core.record == RecordState::Disabled {
                    let state = if fsm.rolling() && !core.record_gated() {
                        RecordState::Recording
                    } else {
                        RecordState::Enabled
                    };
                    core.set_record(state);
                }
            }
            EventAction::SetRecordEnabled(false) => core.set_record(RecordState::Disabled),
            EventAction::PlayRanges { leave_rolling } => {
                let Some(first) = core.ctx.play_ranges().load().first().copied() else {
                    core.refuse(RequestError::NoPlayRange);
                    return;
                };
                if core.play_loop {
                    Self::set_play_loop(fsm, core, false, true);
                }
                core.clear_scheduled();
                let request =
                    LocateRequest::new(first.start, LocateTransportDisposition::MustRoll).forced();
                Self::dispatch_to(fsm, core, FsmEvent::Locate(request));
                if fsm.locating() || fsm.rolling() {
                    core.play_range = Some(PlayRangeCursor {
                        index: 0,
                        leave_rolling,
                    });
                    core.outbox
                        .stage(TransportNotification::PlayRange { active: true });
                }
            }
            EventAction::CancelPlayRange => core.cancel_play_range(),
            EventAction::PrerollRecord { start, preroll } => {
                if fsm.rolling() {
                    core.refuse(RequestError::TransportRolling);
                    return;
                }
                core.clear_scheduled();
                if core.record == RecordState::Disabled {
                    core.set_record(RecordState::Enabled);
                }
                core.record_from = Some(start);
                let request = LocateRequest::new(
                    start.offset(-(preroll as i64)),
                    LocateTransportDisposition::MustRoll,
                )
                .forced();
                Self::dispatch_to(fsm, core, FsmEvent::Locate(request));
            }
            EventAction::LoopRangeChanged => core.work |= PostTransportWork::LOOP_CHANGED,
            EventAction::Overwrite => core.work |= PostTransportWork::OVERWRITE,
            EventAction::AdjustPlaybackBuffering => {
                core.work |= PostTransportWork::ADJUST_PLAYBACK_BUFFERING
            }
            EventAction::AdjustCaptureBuffering => {
                core.work |= PostTransportWork::ADJUST_CAPTURE_BUFFERING
            }
        }
    }

    fn set_play_loop(
        fsm: &mut TransportFsm,
        core: &mut TransportCore,
        enabled: bool,
        leave_rolling: bool,
    ) {
        if enabled {
            let Some(range) = core.ctx.locations().load().loop_range else {
                if !core.play_loop {
                    core.ctx.release_punch_loop(PunchLoopLock::OnlyLoop);
                }
                core.refuse(RequestError::NoLoopRange);
                return;
            };
            core.cancel_play_range();
            core.play_loop = true;
            core.work |= PostTransportWork::LOOP_CHANGED;
            let request = LocateRequest::new(range.start, LocateTransportDisposition::MustRoll);
            Self::dispatch_to(fsm, core, FsmEvent::Locate(request));
            if !fsm.moving() && !fsm.locating() {
                // Already parked on the loop start
                Self::dispatch_to(fsm, core, FsmEvent::StartTransport);
            }
        } else if core.play_loop {
            core.play_loop = false;
            core.ctx.release_punch_loop(PunchLoopLock::OnlyLoop);
            core.work |= PostTransportWork::LOOP_CHANGED;
            if !leave_rolling {
                Self::dispatch_to(
                    fsm,
                    core,
                    FsmEvent::StopTransport {
                        abort: false,
                        clear_state: false,
                    },
                );
            }
        }
    }

    /// Returns whether the playhead wrapped, or a non-seamless wrap began
    fn check_loop(&mut self, start: SamplePosition, end: SamplePosition, nframes: u32) -> bool {
        if !self.core.play_loop || !self.fsm.rolling() {
            return false;
        }
        let Some(range) = self.ctx.locations().load().loop_range else {
            return false;
        };
        if start >= range.end {
            return false;
        }

        if self.ctx.config().seamless_loop {
            if end < range.end {
                return false;
            }
            let overshoot = (end - range.end) % range.length();
            self.core.position = range.start + overshoot;
            self.core.work |= PostTransportWork::LOOP_CHANGED;
        } else {
            // Same lead as a bounded roll: the fade-out runs next cycle and
            // must not render past the loop end
            if end + nframes as u64 <= range.end && end < range.end {
                return false;
            }
            self.core.fade_limit = Some(range.end);
            if self.core.position > range.end {
                self.core.position = range.end;
                self.core.frac = 0.0;
            }
            let mut request =
                LocateRequest::new(range.start, LocateTransportDisposition::MustRoll).forced();
            request.for_loop_end = true;
            self.dispatch(FsmEvent::Locate(request));
        }
        self.core
            .outbox
            .stage(TransportNotification::Looped(range.start));
        true
    }

    fn check_stop_at(&mut self, end: SamplePosition, nframes: u32) {
        let Some(stop_at) = self.core.stop_at else {
            return;
        };
        // The fade-out runs next cycle; start it if that cycle reaches the bound
        if self.fsm.rolling() && end + nframes as u64 >= stop_at {
            self.core.stop_at = None;
            self.dispatch(FsmEvent::StopTransport {
                abort: false,
                clear_state: false,
            });
        }
    }

    /// Move on to the next play range, or finish, once the fade-out that
    /// starts next cycle would reach the current range's end
    fn check_play_range(&mut self, end: SamplePosition, nframes: u32) {
        let Some(mut cursor) = self.core.play_range else {
            return;
        };
        if !self.fsm.rolling() {
            return;
        }
        let (current, next) = {
            let ranges = self.ctx.play_ranges().load();
            (
                ranges.get(cursor.index).copied(),
                ranges.get(cursor.index + 1).copied(),
            )
        };
        let Some(current) = current else {
            self.core.cancel_play_range();
            return;
        };
        if end + (nframes as u64) < current.end {
            return;
        }

        match next {
            Some(next) => {
                cursor.index += 1;
                self.core.play_range = Some(cursor);
                self.core.fade_limit = Some(current.end);
                let request =
                    LocateRequest::new(next.start, LocateTransportDisposition::MustRoll).forced();
                self.dispatch(FsmEvent::Locate(request));
            }
            None if cursor.leave_rolling => self.core.cancel_play_range(),
            None => {
                self.core.cancel_play_range();
                self.core.fade_limit = Some(current.end);
                self.dispatch(FsmEvent::StopTransport {
                    abort: false,
                    clear_state: false,
                });
            }
        }
    }

    /// Open or close capture at the punch and preroll edges
    fn gate_record(&mut self, start: SamplePosition, end: SamplePosition) {
        if self.core.record == RecordState::Disabled
            || !self.fsm.rolling()
            || !self.core.record_gated()
        {
            return;
        }
        let (from, until) = self.core.record_window();
        let inside = end > from && start < until;
        match self.core.record {
            RecordState::Enabled if inside => {
                self.core.record_from = None;
                self.core.set_record(RecordState::Recording);
            }
            RecordState::Recording if !inside => self.core.set_record(RecordState::Enabled),
            _ => {}
        }
    }

    /// Keep a parked beat-time playhead on its beat when the tempo map changes
    fn follow_tempo_map(&mut self) {
        let Some((version, quarters)) = self.core.beat_anchor else {
            return;
        };
        if self.ctx.tempo_map().version() == version
            || self.sync.source != SyncSource::Internal
            || !self.fsm.stopped()
            || self.fsm.waiting_for_butler()
        {
            return;
        }
        let target = self.ctx.tempo_map().load().sample_at_quarter_notes(quarters);
        if target == self.core.position {
            self.core.anchor_beats();
            return;
        }
        let request = LocateRequest::new(target, LocateTransportDisposition::MustStop);
        self.dispatch(FsmEvent::Locate(request));
    }

    fn follow_master(&mut self, nframes: u32) {
        if self.sync.source == SyncSource::Internal {
            return;
        }

        let input = PlanInput {
            now: self.engine_time,
            nframes,
            position: self.core.position,
            speed: if self.fsm.moving() { self.core.speed } else { 0.0 },
            rolling: self.fsm.moving(),
            locating: self.fsm.locating() || self.fsm.waiting_for_butler(),
        };
        let (reading, latency, resolution) = match self.sync.active {
            Some(index) => {
                let master = &mut self.sync.masters[index];
                (master.read(self.engine_time), master.latency(), master.resolution())
            }
            None => (None, 0, 1),
        };
        let strategy = self.sync.planner.plan(&input, reading, latency, resolution);
        let state = self.sync.planner.state();
        Self::publish_master_state(&mut self.sync, &mut self.core, state);
        self.apply_strategy(strategy);
    }

    fn apply_strategy(&mut self, strategy: TransportMasterStrategy) {
        match strategy.action {
            TransportMasterAction::Relax | TransportMasterAction::Wait => {
                if self.fsm.rolling()
                    && strategy.catch_speed != 0.0
                    && strategy.catch_speed != self.core.speed
                {
                    self.dispatch(FsmEvent::SetSpeed(strategy.catch_speed));
                }
            }
            TransportMasterAction::Start => {
                if self.fsm.stopped() && strategy.catch_speed != 0.0 {
                    self.dispatch(FsmEvent::SetSpeed(strategy.catch_speed));
                }
            }
            TransportMasterAction::Stop => {
                if self.fsm.rolling() {
                    self.dispatch(FsmEvent::StopTransport {
                        abort: false,
                        clear_state: false,
                    });
                }
            }
            TransportMasterAction::Locate => {
                if !self.fsm.locating() && !self.core.actively_recording() {
                    let request =
                        LocateRequest::new(strategy.target, strategy.roll_disposition).forced();
                    self.core.clear_scheduled();
                    self.dispatch(FsmEvent::Locate(request));
                }
            }
            TransportMasterAction::NoRoll => {}
        }
    }

    fn publish_master_state(sync: &mut SyncState, core: &mut TransportCore, state: TransportMasterState) {
        if sync.published != state {
            sync.published = state;
            core.ctx.publish_master_state(state);
            core.outbox
                .stage(TransportNotification::SyncStateChanged(state));
        }
    }

    fn current_state(&self) -> TransportState {
        match self.fsm.motion() {
            MotionState::Stopped => TransportState::Stopped,
            MotionState::Rolling => {
                if self.core.declicker.phase() == DeclickPhase::FadeIn {
                    TransportState::DeclickingIn
                } else if self.core.play_loop {
                    TransportState::Looping
                } else {
                    TransportState::Rolling
                }
            }
            MotionState::DeclickToStop => TransportState::DeclickingOut,
            MotionState::DeclickToLocate | MotionState::WaitingForLocate => {
                TransportState::Locating
            }
        }
    }

    fn publish(&mut self) {
        let state = self.current_state();
        self.ctx.publish_state(state);
        if state != self.published_state {
            self.published_state = state;
            self.core
                .outbox
                .stage(TransportNotification::TransportStateChanged(state));
        }

        let speed = if self.fsm.moving() { self.core.speed } else { 0.0 };
        self.ctx.publish_speed(speed);
        if speed != self.published_speed {
            self.published_speed = speed;
            self.core
                .outbox
                .stage(TransportNotification::SpeedChanged(speed));
        }

        self.ctx.publish_position(self.core.position);
        self.ctx.publish_play_loop(self.core.play_loop);
        self.ctx.publish_locate_pending(self.fsm.locating());
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
