//! Transport request handle
//!
//! [`Transport`] is what the UI, control-surface shims and scripts hold. It
//! answers queries straight from the shared context and turns requests into
//! session events. Legality is checked here, synchronously, with the same
//! rules for every origin; the process thread re-checks when the event
//! comes due.

use std::sync::Arc;

use tl_core::{
    MusicalPosition, SamplePosition, TempoMap, Timecode, TimecodeRate, TransportPosition,
};

use crate::context::{PunchLoopLock, RecordState, TransportContext, TransportState};
use crate::error::{RequestError, RequestResult};
use crate::events::{EventAction, EventSender, RequestSource, SessionEvent};
use crate::fsm::{LocateRequest, LocateTransportDisposition};
use crate::locations::{Locations, Range};
use crate::master::{SyncSource, TransportMasterState};
use crate::post_transport::PostTransportWork;

#[derive(Debug, Clone)]
pub struct Transport {
    ctx: Arc<TransportContext>,
    events: EventSender,
}

impl Transport {
    pub(crate) fn new(ctx: Arc<TransportContext>, events: EventSender) -> Self {
        Self { ctx, events }
    }

    pub fn context(&self) -> &Arc<TransportContext> {
        &self.ctx
    }

    // ═══════════════════════════════════════════════════════════════════════
    // REQUESTS
    // ═══════════════════════════════════════════════════════════════════════

    /// Queue an arbitrary (possibly future-dated) event
    pub fn queue_event(&self, event: SessionEvent) -> RequestResult {
        self.check(&event.action, event.origin)
            .inspect_err(|e| self.log_refusal(&event, e))?;
        let result = self.events.queue_event(event);
        if let Err(e) = &result {
            if matches!(event.action, EventAction::SetPlayLoop { enabled: true, .. })
                && !self.ctx.play_loop()
            {
                self.ctx.release_punch_loop(PunchLoopLock::OnlyLoop);
            }
            self.log_refusal(&event, e);
        }
        result
    }

    fn log_refusal(&self, event: &SessionEvent, e: &RequestError) {
        log::debug!(
            "Transport request {:?} from {:?} refused: {}",
            event.action,
            event.origin,
            e
        );
    }

    fn queue(&self, action: EventAction, origin: RequestSource) -> RequestResult {
        self.queue_event(SessionEvent::immediate(action, origin))
    }

    pub fn request_roll(&self, origin: RequestSource) -> RequestResult {
        self.queue(EventAction::Roll, origin)
    }

    pub fn request_stop(&self, abort: bool, clear_state: bool, origin: RequestSource) -> RequestResult {
        self.queue(EventAction::Stop { abort, clear_state }, origin)
    }

    /// Move the playhead. Targets past the session end land on the end.
    pub fn request_locate(
        &self,
        target: SamplePosition,
        force: bool,
        disposition: LocateTransportDisposition,
        origin: RequestSource,
    ) -> RequestResult {
        let mut request = LocateRequest::new(target, disposition);
        request.force = force;
        self.queue(EventAction::Locate(request), origin)
    }

    /// Arm or disarm looping. Arming locates to the loop start and rolls;
    /// disarming stops unless `leave_rolling`.
    pub fn request_play_loop(
        &self,
        enabled: bool,
        leave_rolling: bool,
        origin: RequestSource,
    ) -> RequestResult {
        self.queue(
            EventAction::SetPlayLoop {
                enabled,
                leave_rolling,
            },
            origin,
        )
    }

    /// Varispeed; `0.0` stops
    pub fn request_transport_speed(&self, speed: f64, origin: RequestSource) -> RequestResult {
        self.queue(EventAction::SetSpeed(speed), origin)
    }

    /// Like [`request_transport_speed`](Self::request_transport_speed), but
    /// zero keeps the transport engaged at the smallest representable speed
    pub fn request_transport_speed_nonzero(&self, speed: f64, origin: RequestSource) -> RequestResult {
        let speed = if speed == 0.0 { f64::EPSILON } else { speed };
        self.request_transport_speed(speed, origin)
    }

    /// Speed used by plain rolls
    pub fn request_default_play_speed(&self, speed: f64, origin: RequestSource) -> RequestResult {
        self.queue(EventAction::SetDefaultPlaySpeed(speed), origin)
    }

    /// Locate to `start`, roll, and come back to `return_to` on the next stop
    pub fn request_roll_at_and_return(
        &self,
        start: SamplePosition,
        return_to: SamplePosition,
        origin: RequestSource,
    ) -> RequestResult {
        self.queue(EventAction::LocateRollLocate { start, return_to }, origin)
    }

    /// Play `start..end`, then stop
    pub fn request_bounded_roll(
        &self,
        start: SamplePosition,
        end: SamplePosition,
        origin: RequestSource,
    ) -> RequestResult {
        if start >= end {
            return Err(RequestError::InvalidRange {
                start: start.0,
                end: end.0,
            });
        }
        self.queue(EventAction::BoundedRoll { start, end }, origin)
    }

    /// Play each range in turn, then stop unless `leave_rolling`.
    ///
    /// A later request replaces the list; an explicit stop or locate ends it.
    pub fn request_play_range(
        &self,
        ranges: &[Range],
        leave_rolling: bool,
        origin: RequestSource,
    ) -> RequestResult {
        if ranges.is_empty() {
            return Err(RequestError::NoPlayRange);
        }
        if let Some(bad) = ranges.iter().find(|r| r.start >= r.end) {
            return Err(RequestError::InvalidRange {
                start: bad.start.0,
                end: bad.end.0,
            });
        }
        let action = EventAction::PlayRanges { leave_rolling };
        self.check(&action, origin)?;
        self.ctx.play_ranges().publish(ranges.to_vec());
        self.queue(action, origin)
    }

    /// Forget the active play range and keep rolling
    pub fn request_cancel_play_range(&self, origin: RequestSource) -> RequestResult {
        self.queue(EventAction::CancelPlayRange, origin)
    }

    /// Arm recording, roll from `preroll` samples before `start`, and start
    /// capturing once the playhead reaches `start`
    pub fn request_preroll_record(
        &self,
        start: SamplePosition,
        preroll: u64,
        origin: RequestSource,
    ) -> RequestResult {
        self.queue(EventAction::PrerollRecord { start, preroll }, origin)
    }

    /// Preroll record from the playhead, counting in
    /// [`count_in_bars`](crate::TransportConfig::count_in_bars) bars
    pub fn request_count_in_record(&self, origin: RequestSource) -> RequestResult {
        let start = self.ctx.transport_sample();
        let preroll = count_in_samples(
            &self.ctx.tempo_map().load(),
            start,
            self.ctx.config().count_in_bars,
        );
        self.request_preroll_record(start, preroll, origin)
    }

    /// Locate to the session start (or zero without a session range)
    pub fn goto_start(&self, and_roll: bool, origin: RequestSource) -> RequestResult {
        let start = self
            .ctx
            .locations()
            .load()
            .session_start()
            .unwrap_or(SamplePosition::ZERO);
        let disposition = if and_roll {
            LocateTransportDisposition::MustRoll
        } else {
            LocateTransportDisposition::RollIfAppropriate
        };
        self.request_locate(start, false, disposition, origin)
    }

    pub fn goto_end(&self, origin: RequestSource) -> RequestResult {
        let end = self
            .ctx
            .locations()
            .load()
            .session_end()
            .ok_or(RequestError::NoSessionRange)?;
        self.request_locate(end, false, LocateTransportDisposition::MustStop, origin)
    }

    pub fn request_sync_source(&self, source: SyncSource, origin: RequestSource) -> RequestResult {
        self.queue(EventAction::SetSyncSource(source), origin)
    }

    /// Arm recording; capture starts when the transport rolls
    pub fn maybe_enable_record(&self, origin: RequestSource) -> RequestResult {
        self.queue(EventAction::SetRecordEnabled(true), origin)
    }

    pub fn disable_record(&self, origin: RequestSource) -> RequestResult {
        self.queue(EventAction::SetRecordEnabled(false), origin)
    }

    /// Playback buffers must be re-read in place (playlist edited)
    pub fn request_overwrite_buffer(&self, origin: RequestSource) -> RequestResult {
        self.queue(EventAction::Overwrite, origin)
    }

    pub fn adjust_playback_buffering(&self) -> RequestResult {
        self.queue(EventAction::AdjustPlaybackBuffering, RequestSource::Engine)
    }

    pub fn adjust_capture_buffering(&self) -> RequestResult {
        self.queue(EventAction::AdjustCaptureBuffering, RequestSource::Engine)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // SHARED DATA EDITS
    // ═══════════════════════════════════════════════════════════════════════

    pub fn set_session_range(&self, start: SamplePosition, end: SamplePosition) -> RequestResult {
        let range = Self::range(start, end)?;
        self.ctx.locations().update(|l| l.session = Some(range));
        Ok(())
    }

    pub fn set_loop_range(&self, start: SamplePosition, end: SamplePosition) -> RequestResult {
        let range = Self::range(start, end)?;
        self.ctx.locations().update(|l| l.loop_range = Some(range));
        self.queue(EventAction::LoopRangeChanged, RequestSource::Engine)
    }

    pub fn set_punch_range(&self, start: SamplePosition, end: SamplePosition) -> RequestResult {
        let range = Self::range(start, end)?;
        self.ctx.locations().update(|l| l.punch = Some(range));
        Ok(())
    }

    /// Arm or disarm the punch edges. Refused while looping is armed.
    pub fn set_auto_punch(&self, punch_in: bool, punch_out: bool) -> RequestResult {
        let arming = punch_in || punch_out;
        if arming {
            if self.ctx.locations().load().punch.is_none() {
                return Err(RequestError::NoPunchRange);
            }
            if !self.ctx.claim_punch_loop(PunchLoopLock::OnlyPunch) {
                return Err(RequestError::PunchLoopConflict);
            }
        }
        self.ctx.locations().update(|l| {
            l.punch_in = punch_in;
            l.punch_out = punch_out;
        });
        if !arming {
            self.ctx.release_punch_loop(PunchLoopLock::OnlyPunch);
        }
        Ok(())
    }

    pub fn locations(&self) -> Locations {
        Locations::clone(&self.ctx.locations().load())
    }

    /// Edit a private copy of the tempo map and publish it
    pub fn edit_tempo_map<R>(&self, edit: impl FnOnce(&mut TempoMap) -> R) -> R {
        self.ctx.tempo_map().update(edit)
    }

    pub fn reset_xrun_count(&self) {
        self.ctx.reset_xrun_count();
    }

    fn range(start: SamplePosition, end: SamplePosition) -> RequestResult<Range> {
        Range::new(start.0, end.0).ok_or(RequestError::InvalidRange {
            start: start.0,
            end: end.0,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LEGALITY
    // ═══════════════════════════════════════════════════════════════════════

    fn check(&self, action: &EventAction, origin: RequestSource) -> RequestResult {
        if self.ctx.engine_halted() {
            return Err(RequestError::EngineHalted);
        }

        let moves_transport = matches!(
            action,
            EventAction::Roll
                | EventAction::Stop { .. }
                | EventAction::Locate(_)
                | EventAction::LocateRollLocate { .. }
                | EventAction::BoundedRoll { .. }
                | EventAction::SetSpeed(_)
                | EventAction::SetPlayLoop { .. }
                | EventAction::PlayRanges { .. }
                | EventAction::PrerollRecord { .. }
        );
        if moves_transport
            && origin.is_local()
            && self.ctx.external_sync()
            && !self.ctx.config().sync.allow_local_requests
        {
            return Err(RequestError::FollowingExternalMaster(origin));
        }

        let max_speed = self.ctx.config().max_varispeed;
        match *action {
            EventAction::Locate(_)
            | EventAction::LocateRollLocate { .. }
            | EventAction::BoundedRoll { .. }
            | EventAction::PlayRanges { .. }
            | EventAction::PrerollRecord { .. }
                if self.ctx.actively_recording() =>
            {
                Err(RequestError::ActivelyRecording)
            }
            EventAction::PrerollRecord { .. } if self.ctx.transport_state_rolling() => {
                Err(RequestError::TransportRolling)
            }
            EventAction::SetSpeed(speed) if !speed.is_finite() || speed.abs() > max_speed => {
                Err(RequestError::InvalidSpeed(speed))
            }
            EventAction::SetDefaultPlaySpeed(speed)
                if !speed.is_finite() || speed == 0.0 || speed.abs() > max_speed =>
            {
                Err(RequestError::InvalidSpeed(speed))
            }
            EventAction::SetPlayLoop { enabled: true, .. }
                if self.ctx.locations().load().loop_range.is_none() =>
            {
                Err(RequestError::NoLoopRange)
            }
            EventAction::SetPlayLoop { enabled: true, .. } => {
                if self.ctx.claim_punch_loop(PunchLoopLock::OnlyLoop) {
                    Ok(())
                } else {
                    Err(RequestError::PunchLoopConflict)
                }
            }
            _ => Ok(()),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // QUERIES
    // ═══════════════════════════════════════════════════════════════════════

    pub fn transport_sample(&self) -> SamplePosition {
        self.ctx.transport_sample()
    }

    pub fn transport_position(&self) -> TransportPosition {
        self.ctx.transport_position()
    }

    pub fn transport_speed(&self) -> f64 {
        self.ctx.transport_speed()
    }

    pub fn default_play_speed(&self) -> f64 {
        self.ctx.default_play_speed()
    }

    pub fn transport_state(&self) -> TransportState {
        self.ctx.transport_state()
    }

    pub fn transport_state_rolling(&self) -> bool {
        self.ctx.transport_state_rolling()
    }

    pub fn record_status(&self) -> RecordState {
        self.ctx.record_status()
    }

    pub fn actively_recording(&self) -> bool {
        self.ctx.actively_recording()
    }

    pub fn play_loop(&self) -> bool {
        self.ctx.play_loop()
    }

    pub fn locate_pending(&self) -> bool {
        self.ctx.locate_pending()
    }

    pub fn sync_source(&self) -> SyncSource {
        self.ctx.sync_source()
    }

    pub fn transport_master_state(&self) -> TransportMasterState {
        self.ctx.transport_master_state()
    }

    pub fn post_transport_work(&self) -> PostTransportWork {
        self.ctx.post_transport_work()
    }

    pub fn xrun_count(&self) -> u64 {
        self.ctx.xrun_count()
    }

    pub fn engine_halted(&self) -> bool {
        self.ctx.engine_halted()
    }

    pub fn position_bbt(&self) -> MusicalPosition {
        self.ctx.position_bbt()
    }

    pub fn position_timecode(&self, rate: TimecodeRate) -> Timecode {
        self.ctx.position_timecode(rate)
    }
}

/// Length of `bars` bars ending at the bar and beat under `start`, or
/// everything back to zero when there are fewer bars than that
fn count_in_samples(map: &TempoMap, start: SamplePosition, bars: u32) -> u64 {
    let at = map.samples_to_position(start);
    match at.bar.checked_sub(bars) {
        Some(bar) => {
            let from = map.position_to_samples(&MusicalPosition { bar, ..at });
            map.position_to_samples(&at) - from
        }
        None => start.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::events::{EventReceiver, session_event_queue};

    fn transport() -> (Transport, EventReceiver) {
        let ctx = Arc::new(TransportContext::new(TransportConfig::default()));
        let (tx, rx) = session_event_queue(64);
        (Transport::new(ctx, tx), rx)
    }

    fn drained(rx: &mut EventReceiver) -> Vec<EventAction> {
        let mut out = Vec::new();
        rx.drain_due(SamplePosition::MAX, |e| out.push(e.action));
        out
    }

    #[test]
    fn test_requests_become_events() {
        let (transport, mut rx) = transport();
        transport.request_roll(RequestSource::Ui).unwrap();
        transport
            .request_locate(
                SamplePosition(480),
                true,
                LocateTransportDisposition::MustStop,
                RequestSource::Mmc,
            )
            .unwrap();

        let actions = drained(&mut rx);
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0], EventAction::Roll);
        match actions[1] {
            EventAction::Locate(req) => {
                assert_eq!(req.target, SamplePosition(480));
                assert!(req.force);
                assert_eq!(req.disposition, LocateTransportDisposition::MustStop);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_locate_refused_while_recording() {
        let (transport, mut rx) = transport();
        transport.ctx.publish_record_status(RecordState::Recording);

        let result = transport.request_locate(
            SamplePosition(0),
            false,
            LocateTransportDisposition::RollIfAppropriate,
            RequestSource::Script,
        );
        assert_eq!(result, Err(RequestError::ActivelyRecording));
        assert!(drained(&mut rx).is_empty());
    }

    #[test]
    fn test_external_master_locks_out_local_origins() {
        let (transport, _rx) = transport();
        transport.ctx.publish_sync_source(SyncSource::Mtc);

        for origin in [RequestSource::Ui, RequestSource::ControlSurface, RequestSource::Script] {
            assert_eq!(
                transport.request_roll(origin),
                Err(RequestError::FollowingExternalMaster(origin))
            );
        }
        assert!(transport.request_roll(RequestSource::TransportMaster).is_ok());
        // Non-motion requests still go through
        assert!(transport.maybe_enable_record(RequestSource::Ui).is_ok());
    }

    #[test]
    fn test_speed_validation() {
        let (transport, mut rx) = transport();
        assert_eq!(
            transport.request_transport_speed(8.0, RequestSource::Ui),
            Err(RequestError::InvalidSpeed(8.0))
        );
        assert!(transport.request_transport_speed(f64::NAN, RequestSource::Ui).is_err());
        assert!(transport.request_default_play_speed(0.0, RequestSource::Ui).is_err());

        transport.request_transport_speed_nonzero(0.0, RequestSource::Ui).unwrap();
        assert_eq!(drained(&mut rx), vec![EventAction::SetSpeed(f64::EPSILON)]);
    }

    #[test]
    fn test_loop_and_session_ranges() {
        let (transport, mut rx) = transport();
        assert_eq!(
            transport.request_play_loop(true, false, RequestSource::Ui),
            Err(RequestError::NoLoopRange)
        );
        assert_eq!(transport.goto_end(RequestSource::Ui), Err(RequestError::NoSessionRange));
        assert!(transport
            .set_session_range(SamplePosition(100), SamplePosition(50))
            .is_err());

        transport
            .set_loop_range(SamplePosition(1000), SamplePosition(2000))
            .unwrap();
        transport.request_play_loop(true, false, RequestSource::Ui).unwrap();
        assert_eq!(
            transport.locations().loop_range,
            Range::new(1000, 2000)
        );
        assert_eq!(drained(&mut rx).len(), 2);
    }

    #[test]
    fn test_punch_and_loop_exclude_each_other() {
        let (transport, mut rx) = transport();
        assert_eq!(transport.set_auto_punch(true, false), Err(RequestError::NoPunchRange));

        transport
            .set_loop_range(SamplePosition(1000), SamplePosition(2000))
            .unwrap();
        transport
            .set_punch_range(SamplePosition(4000), SamplePosition(8000))
            .unwrap();
        transport.set_auto_punch(true, true).unwrap();
        assert_eq!(
            transport.request_play_loop(true, false, RequestSource::Ui),
            Err(RequestError::PunchLoopConflict)
        );

        transport.set_auto_punch(false, false).unwrap();
        transport.request_play_loop(true, false, RequestSource::Ui).unwrap();
        assert_eq!(
            transport.set_auto_punch(false, true),
            Err(RequestError::PunchLoopConflict)
        );
        assert_eq!(transport.context().punch_loop_lock(), PunchLoopLock::OnlyLoop);
        assert!(!transport.locations().punch_out);
        drained(&mut rx);
    }

    #[test]
    fn test_play_range_validation() {
        let (transport, mut rx) = transport();
        assert_eq!(
            transport.request_play_range(&[], false, RequestSource::Ui),
            Err(RequestError::NoPlayRange)
        );
        let backwards = Range {
            start: SamplePosition(500),
            end: SamplePosition(100),
        };
        assert!(transport
            .request_play_range(&[backwards], false, RequestSource::Ui)
            .is_err());

        let ranges = [Range::new(0, 100).unwrap(), Range::new(400, 500).unwrap()];
        transport
            .request_play_range(&ranges, true, RequestSource::Ui)
            .unwrap();
        assert_eq!(**transport.context().play_ranges().load(), ranges.to_vec());
        assert_eq!(
            drained(&mut rx),
            vec![EventAction::PlayRanges { leave_rolling: true }]
        );
    }

    #[test]
    fn test_count_in_prerolls_whole_bars() {
        let (transport, mut rx) = transport();
        // Bar 2 at 120 BPM 4/4
        transport.ctx.publish_position(SamplePosition(192_000));
        transport.request_count_in_record(RequestSource::Ui).unwrap();

        // Less than a bar in: preroll from zero
        transport.ctx.publish_position(SamplePosition(1000));
        transport.request_count_in_record(RequestSource::Ui).unwrap();

        assert_eq!(
            drained(&mut rx),
            vec![
                EventAction::PrerollRecord {
                    start: SamplePosition(192_000),
                    preroll: 96_000
                },
                EventAction::PrerollRecord {
                    start: SamplePosition(1000),
                    preroll: 1000
                },
            ]
        );

        transport.ctx.publish_state(TransportState::Rolling);
        assert_eq!(
            transport.request_count_in_record(RequestSource::Ui),
            Err(RequestError::TransportRolling)
        );
    }

    #[test]
    fn test_halted_engine_refuses_everything() {
        let (transport, _rx) = transport();
        transport.ctx.set_engine_halted(true);
        assert_eq!(
            transport.request_stop(false, false, RequestSource::Ui),
            Err(RequestError::EngineHalted)
        );
    }
}
