//! Shared transport context
//!
//! One `Arc<TransportContext>` is handed to every component (process driver,
//! butler, request handles, sync feeds) instead of reaching for a global
//! session. Position, speed and state are written only by the process
//! thread; everything else reads them through atomics.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use tl_core::{
    MusicalPosition, SamplePosition, Snapshot, TempoMap, Timecode, TimecodeRate, TransportPosition,
};

use crate::config::TransportConfig;
use crate::locations::{Locations, Range};
use crate::master::{SyncSource, TransportMasterState};
use crate::post_transport::{AtomicPostTransportWork, PostTransportWork};

// ============ Atomic helpers ============

/// Atomic f64 (bit-cast through u64)
#[derive(Debug)]
pub struct AtomicF64(AtomicU64);

impl AtomicF64 {
    pub fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }
}

impl Default for AtomicF64 {
    fn default() -> Self {
        Self::new(0.0)
    }
}

// ============ Published state ============

/// Externally visible transport state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TransportState {
    #[default]
    Stopped = 0,
    Rolling = 1,
    DeclickingIn = 2,
    DeclickingOut = 3,
    Locating = 4,
    /// Rolling with the loop armed
    Looping = 5,
}

impl From<u8> for TransportState {
    fn from(value: u8) -> Self {
        match value {
            1 => TransportState::Rolling,
            2 => TransportState::DeclickingIn,
            3 => TransportState::DeclickingOut,
            4 => TransportState::Locating,
            5 => TransportState::Looping,
            _ => TransportState::Stopped,
        }
    }
}

impl TransportState {
    /// Audio is moving through the routes
    pub fn is_rolling(self) -> bool {
        matches!(
            self,
            TransportState::Rolling
                | TransportState::DeclickingIn
                | TransportState::DeclickingOut
                | TransportState::Looping
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RecordState {
    #[default]
    Disabled = 0,
    /// Armed; becomes `Recording` when the transport rolls
    Enabled = 1,
    Recording = 2,
}

impl From<u8> for RecordState {
    fn from(value: u8) -> Self {
        match value {
            1 => RecordState::Enabled,
            2 => RecordState::Recording,
            _ => RecordState::Disabled,
        }
    }
}

/// Auto punch and looping exclude each other. Whichever is armed first
/// holds the lock until it is disarmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum PunchLoopLock {
    #[default]
    NoConstraint = 0,
    OnlyPunch = 1,
    OnlyLoop = 2,
}

impl From<u8> for PunchLoopLock {
    fn from(value: u8) -> Self {
        match value {
            1 => PunchLoopLock::OnlyPunch,
            2 => PunchLoopLock::OnlyLoop,
            _ => PunchLoopLock::NoConstraint,
        }
    }
}

// ============ Context ============

#[derive(Debug)]
pub struct TransportContext {
    config: TransportConfig,

    transport_sample: AtomicU64,
    /// Frames processed since the engine started; never jumps
    engine_time: AtomicU64,
    speed: AtomicF64,
    default_play_speed: AtomicF64,
    state: AtomicU8,
    record_status: AtomicU8,
    play_loop: AtomicBool,
    punch_or_loop: AtomicU8,
    locate_pending: AtomicBool,
    sync_source: AtomicU8,
    master_state: AtomicU8,

    pub(crate) post_transport_work: AtomicPostTransportWork,
    locate_target: AtomicU64,
    locate_generation: AtomicU64,
    /// Generation the butler last finished seeking for
    seeked_generation: AtomicU64,
    butler_generation: AtomicU64,

    xrun_count: AtomicU64,
    route_faults: AtomicU64,
    engine_halted: AtomicBool,

    tempo_map: Snapshot<TempoMap>,
    locations: Snapshot<Locations>,
    /// Ranges for the current play-range request, played in order
    play_ranges: Snapshot<Vec<Range>>,
}

impl TransportContext {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            transport_sample: AtomicU64::new(0),
            engine_time: AtomicU64::new(0),
            speed: AtomicF64::new(0.0),
            default_play_speed: AtomicF64::new(config.default_play_speed),
            state: AtomicU8::new(TransportState::Stopped as u8),
            record_status: AtomicU8::new(RecordState::Disabled as u8),
            play_loop: AtomicBool::new(false),
            punch_or_loop: AtomicU8::new(PunchLoopLock::NoConstraint as u8),
            locate_pending: AtomicBool::new(false),
            sync_source: AtomicU8::new(SyncSource::Internal as u8),
            master_state: AtomicU8::new(TransportMasterState::Stopped as u8),
            post_transport_work: AtomicPostTransportWork::new(),
            locate_target: AtomicU64::new(0),
            locate_generation: AtomicU64::new(0),
            seeked_generation: AtomicU64::new(0),
            butler_generation: AtomicU64::new(0),
            xrun_count: AtomicU64::new(0),
            route_faults: AtomicU64::new(0),
            engine_halted: AtomicBool::new(false),
            tempo_map: Snapshot::new(TempoMap::new(config.sample_rate)),
            locations: Snapshot::new(Locations::default()),
            play_ranges: Snapshot::default(),
            config,
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Read-only queries
    // ─────────────────────────────────────────────────────────────────────────────

    #[inline]
    pub fn transport_sample(&self) -> SamplePosition {
        SamplePosition(self.transport_sample.load(Ordering::Acquire))
    }

    /// Playhead tagged with the domain it is held in
    pub fn transport_position(&self) -> TransportPosition {
        TransportPosition {
            sample: self.transport_sample(),
            domain: self.config.position_domain,
        }
    }

    /// Monotonic engine clock, used to timestamp sync readings
    #[inline]
    pub fn engine_time(&self) -> u64 {
        self.engine_time.load(Ordering::Acquire)
    }

    #[inline]
    pub fn transport_speed(&self) -> f64 {
        self.speed.load()
    }

    #[inline]
    pub fn default_play_speed(&self) -> f64 {
        self.default_play_speed.load()
    }

    #[inline]
    pub fn transport_state(&self) -> TransportState {
        TransportState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn transport_state_rolling(&self) -> bool {
        self.transport_state().is_rolling()
    }

    #[inline]
    pub fn record_status(&self) -> RecordState {
        RecordState::from(self.record_status.load(Ordering::Acquire))
    }

    #[inline]
    pub fn actively_recording(&self) -> bool {
        self.record_status() == RecordState::Recording
    }

    #[inline]
    pub fn play_loop(&self) -> bool {
        self.play_loop.load(Ordering::Acquire)
    }

    #[inline]
    pub fn punch_loop_lock(&self) -> PunchLoopLock {
        PunchLoopLock::from(self.punch_or_loop.load(Ordering::Acquire))
    }

    #[inline]
    pub fn locate_pending(&self) -> bool {
        self.locate_pending.load(Ordering::Acquire)
    }

    #[inline]
    pub fn sync_source(&self) -> SyncSource {
        SyncSource::from(self.sync_source.load(Ordering::Acquire))
    }

    #[inline]
    pub fn transport_master_state(&self) -> TransportMasterState {
        TransportMasterState::from(self.master_state.load(Ordering::Acquire))
    }

    /// Following something other than the internal clock
    #[inline]
    pub fn external_sync(&self) -> bool {
        self.sync_source() != SyncSource::Internal
    }

    #[inline]
    pub fn post_transport_work(&self) -> PostTransportWork {
        self.post_transport_work.load()
    }

    #[inline]
    pub fn xrun_count(&self) -> u64 {
        self.xrun_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn route_fault_count(&self) -> u64 {
        self.route_faults.load(Ordering::Acquire)
    }

    #[inline]
    pub fn engine_halted(&self) -> bool {
        self.engine_halted.load(Ordering::Acquire)
    }

    pub fn tempo_map(&self) -> &Snapshot<TempoMap> {
        &self.tempo_map
    }

    pub fn locations(&self) -> &Snapshot<Locations> {
        &self.locations
    }

    pub fn play_ranges(&self) -> &Snapshot<Vec<Range>> {
        &self.play_ranges
    }

    pub fn position_bbt(&self) -> MusicalPosition {
        self.tempo_map.load().samples_to_position(self.transport_sample())
    }

    pub fn position_timecode(&self, rate: TimecodeRate) -> Timecode {
        Timecode::from_samples(self.transport_sample(), self.sample_rate(), rate)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Counters any thread may bump
    // ─────────────────────────────────────────────────────────────────────────────

    /// Count an xrun; the process thread announces it next cycle
    pub fn note_xrun(&self) -> u64 {
        self.xrun_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn reset_xrun_count(&self) {
        self.xrun_count.store(0, Ordering::Release);
    }

    pub(crate) fn note_route_fault(&self) -> u64 {
        self.route_faults.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn set_engine_halted(&self, halted: bool) {
        self.engine_halted.store(halted, Ordering::Release);
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Process-thread publication
    // ─────────────────────────────────────────────────────────────────────────────

    /// Take the punch/loop lock for `want`. Succeeds if it was free or
    /// already held for `want`.
    pub(crate) fn claim_punch_loop(&self, want: PunchLoopLock) -> bool {
        match self.punch_or_loop.compare_exchange(
            PunchLoopLock::NoConstraint as u8,
            want as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(current) => current == want as u8,
        }
    }

    /// Free the lock if `held` still owns it
    pub(crate) fn release_punch_loop(&self, held: PunchLoopLock) {
        let _ = self.punch_or_loop.compare_exchange(
            held as u8,
            PunchLoopLock::NoConstraint as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn publish_position(&self, pos: SamplePosition) {
        self.transport_sample.store(pos.0, Ordering::Release);
    }

    pub(crate) fn publish_engine_time(&self, frames: u64) {
        self.engine_time.store(frames, Ordering::Release);
    }

    pub(crate) fn publish_speed(&self, speed: f64) {
        self.speed.store(speed);
    }

    pub(crate) fn publish_default_play_speed(&self, speed: f64) {
        self.default_play_speed.store(speed);
    }

    pub(crate) fn publish_state(&self, state: TransportState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn publish_record_status(&self, status: RecordState) {
        self.record_status.store(status as u8, Ordering::Release);
    }

    pub(crate) fn publish_play_loop(&self, enabled: bool) {
        self.play_loop.store(enabled, Ordering::Release);
    }

    pub(crate) fn publish_locate_pending(&self, pending: bool) {
        self.locate_pending.store(pending, Ordering::Release);
    }

    pub(crate) fn publish_sync_source(&self, source: SyncSource) {
        self.sync_source.store(source as u8, Ordering::Release);
    }

    pub(crate) fn publish_master_state(&self, state: TransportMasterState) {
        self.master_state.store(state as u8, Ordering::Release);
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Butler hand-off
    // ─────────────────────────────────────────────────────────────────────────────

    /// Record where the butler should seek. Target is written before the
    /// generation so a butler seeing the new generation sees the new target.
    pub(crate) fn set_locate_target(&self, target: SamplePosition) {
        self.locate_target.store(target.0, Ordering::Release);
        self.locate_generation.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn locate_generation(&self) -> u64 {
        self.locate_generation.load(Ordering::Acquire)
    }

    pub(crate) fn locate_target(&self) -> SamplePosition {
        SamplePosition(self.locate_target.load(Ordering::Acquire))
    }

    pub(crate) fn mark_seeked(&self, generation: u64) {
        self.seeked_generation.store(generation, Ordering::Release);
    }

    /// True once the butler has seeked to the latest locate target
    pub(crate) fn locate_settled(&self) -> bool {
        self.seeked_generation.load(Ordering::Acquire) == self.locate_generation()
    }

    /// Bumped by the butler after every pass that did transport work
    pub(crate) fn butler_pass_completed(&self) {
        self.butler_generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn butler_generation(&self) -> u64 {
        self.butler_generation.load(Ordering::Acquire)
    }
}
