//! Transport master feeds
//!
//! Protocol decoders (MTC/LTC readers, MIDI input handlers, an engine-level
//! shared transport) run on their own threads. Each gets a feed handle that
//! turns protocol messages into a [`MasterReading`]; the paired
//! [`FeedMaster`] hands the latest reading to the process thread.
//!
//! Readings are stamped with [`TransportContext::engine_time`], so the
//! planner can compensate for their age.

use std::sync::Arc;

use parking_lot::Mutex;
use tl_core::{SamplePosition, Timecode, TimecodeRate};

use crate::context::TransportContext;
use crate::master::{MasterReading, SyncSource, TransportMaster};

type SharedReading = Arc<Mutex<Option<MasterReading>>>;

/// Frames a timecode stream may jump before the speed estimate restarts
const MAX_FRAME_JUMP: u64 = 4;

/// Weight of a new speed measurement against the running estimate
const SPEED_SMOOTHING: f64 = 0.5;

/// MIDI beat clock resolution
const CLOCKS_PER_QUARTER: f64 = 24.0;

// ═══════════════════════════════════════════════════════════════════════════════
// FEED MASTER
// ═══════════════════════════════════════════════════════════════════════════════

/// Process-thread side of a feed
pub struct FeedMaster {
    source: SyncSource,
    name: String,
    shared: SharedReading,
    /// Last reading obtained without contention
    cached: Option<MasterReading>,
    latency: u64,
    resolution: u64,
    /// A moving reading older than this means the signal is gone
    stale_after: u64,
}

impl FeedMaster {
    fn new(source: SyncSource, name: &str, shared: SharedReading, stale_after: u64) -> Self {
        Self {
            source,
            name: name.to_string(),
            shared,
            cached: None,
            latency: 0,
            resolution: 1,
            stale_after,
        }
    }

    /// Input latency of the decoder, in samples
    pub fn with_latency(mut self, latency: u64) -> Self {
        self.latency = latency;
        self
    }

    fn with_resolution(mut self, resolution: u64) -> Self {
        self.resolution = resolution.max(1);
        self
    }
}

impl TransportMaster for FeedMaster {
    fn source(&self) -> SyncSource {
        self.source
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, now: u64) -> Option<MasterReading> {
        // Never wait on the feed thread; a contended slot reuses the last reading
        if let Some(slot) = self.shared.try_lock() {
            self.cached = *slot;
        }
        let reading = self.cached?;
        if reading.speed != 0.0 && now.saturating_sub(reading.timestamp) > self.stale_after {
            return None;
        }
        Some(reading)
    }

    fn latency(&self) -> u64 {
        self.latency
    }

    fn resolution(&self) -> u64 {
        self.resolution
    }

    fn reset(&mut self) {
        self.cached = None;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENGINE FEED
// ═══════════════════════════════════════════════════════════════════════════════

/// Shared transport owned by the audio backend
pub struct EngineFeed {
    ctx: Arc<TransportContext>,
    shared: SharedReading,
}

pub fn engine_feed(ctx: &Arc<TransportContext>) -> (EngineFeed, FeedMaster) {
    let shared = SharedReading::default();
    let master = FeedMaster::new(
        SyncSource::Engine,
        "Engine",
        Arc::clone(&shared),
        ctx.sample_rate() as u64,
    );
    (
        EngineFeed {
            ctx: Arc::clone(ctx),
            shared,
        },
        master,
    )
}

impl EngineFeed {
    pub fn update(&self, rolling: bool, position: SamplePosition) {
        *self.shared.lock() = Some(MasterReading {
            speed: if rolling { 1.0 } else { 0.0 },
            position,
            timestamp: self.ctx.engine_time(),
            locked: true,
        });
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TIMECODE FEED (MTC / LTC)
// ═══════════════════════════════════════════════════════════════════════════════

pub struct TimecodeFeed {
    ctx: Arc<TransportContext>,
    shared: SharedReading,
    /// Frame count and engine time of the last frame used for speed
    last: Option<(u64, u64)>,
    speed: Option<f64>,
}

/// `source` is [`SyncSource::Mtc`] or [`SyncSource::Ltc`]
pub fn timecode_feed(
    ctx: &Arc<TransportContext>,
    source: SyncSource,
    rate: TimecodeRate,
) -> (TimecodeFeed, FeedMaster) {
    let shared = SharedReading::default();
    let spf = rate.samples_per_frame(ctx.sample_rate());
    let name = match source {
        SyncSource::Ltc => "LTC",
        _ => "MTC",
    };
    let master = FeedMaster::new(
        source,
        name,
        Arc::clone(&shared),
        (spf * MAX_FRAME_JUMP as f64) as u64,
    )
    .with_resolution(spf.round() as u64);
    (
        TimecodeFeed {
            ctx: Arc::clone(ctx),
            shared,
            last: None,
            speed: None,
        },
        master,
    )
}

impl TimecodeFeed {
    /// A complete frame was decoded
    pub fn push_frame(&mut self, tc: Timecode) {
        let now = self.ctx.engine_time();
        self.push_frame_at(tc, now);
    }

    pub fn push_frame_at(&mut self, tc: Timecode, now: u64) {
        let frame = tc.frame_count();
        let spf = tc.rate.samples_per_frame(self.ctx.sample_rate());

        match self.last {
            Some((prev_frame, _)) if frame.abs_diff(prev_frame) > MAX_FRAME_JUMP => {
                // Discontinuity: position is good, speed is not
                self.speed = None;
                self.last = Some((frame, now));
            }
            Some((prev_frame, prev_time)) if now > prev_time => {
                let frames = frame as f64 - prev_frame as f64;
                let raw = frames * spf / (now - prev_time) as f64;
                self.speed = Some(match self.speed {
                    Some(speed) => speed + SPEED_SMOOTHING * (raw - speed),
                    None => raw,
                });
                self.last = Some((frame, now));
            }
            // Several frames inside one engine cycle; measure across them later
            Some(_) => {}
            None => self.last = Some((frame, now)),
        }

        *self.shared.lock() = Some(MasterReading {
            speed: self.speed.unwrap_or(0.0),
            position: tc.to_samples(self.ctx.sample_rate()),
            timestamp: now,
            locked: self.speed.is_some(),
        });
    }

    /// Drop the speed estimate (decoder lost sync)
    pub fn reset(&mut self) {
        self.last = None;
        self.speed = None;
        *self.shared.lock() = None;
    }

    pub fn speed(&self) -> Option<f64> {
        self.speed
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MIDI CLOCK FEED
// ═══════════════════════════════════════════════════════════════════════════════

/// MIDI beat clock: 24 clocks per quarter, plus start/stop/continue and
/// song position pointer. Speed is the measured tempo over the tempo map's.
pub struct MidiClockFeed {
    ctx: Arc<TransportContext>,
    shared: SharedReading,
    running: bool,
    /// Song position of the most recent start/continue/pointer, in quarters
    origin_quarters: f64,
    /// Clocks received since `origin_quarters`
    clocks: u64,
    /// Clock count and engine time where the interval measurement starts
    anchor: Option<(u64, u64)>,
    /// Smoothed samples per clock
    interval: Option<f64>,
}

pub fn midi_clock_feed(ctx: &Arc<TransportContext>) -> (MidiClockFeed, FeedMaster) {
    let shared = SharedReading::default();
    // Slower than 20 BPM counts as gone
    let stale_after = (ctx.sample_rate() as f64 * 3.0 / CLOCKS_PER_QUARTER) as u64;
    let master = FeedMaster::new(
        SyncSource::MidiClock,
        "MIDI Clock",
        Arc::clone(&shared),
        stale_after,
    );
    (
        MidiClockFeed {
            ctx: Arc::clone(ctx),
            shared,
            running: false,
            origin_quarters: 0.0,
            clocks: 0,
            anchor: None,
            interval: None,
        },
        master,
    )
}

impl MidiClockFeed {
    pub fn start(&mut self) {
        self.origin_quarters = 0.0;
        self.clocks = 0;
        self.anchor = None;
        self.interval = None;
        self.running = true;
    }

    pub fn continue_playback(&mut self) {
        self.origin_quarters = self.quarters();
        self.clocks = 0;
        self.anchor = None;
        self.interval = None;
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
        self.anchor = None;
        self.publish(0.0, true, self.ctx.engine_time());
    }

    /// Song position pointer, in MIDI beats (sixteenth notes)
    pub fn song_position(&mut self, sixteenths: u16) {
        self.origin_quarters = sixteenths as f64 / 4.0;
        self.clocks = 0;
        self.anchor = None;
        if !self.running {
            self.publish(0.0, true, self.ctx.engine_time());
        }
    }

    pub fn clock_tick(&mut self) {
        let now = self.ctx.engine_time();
        self.clock_tick_at(now);
    }

    pub fn clock_tick_at(&mut self, now: u64) {
        if !self.running {
            return;
        }

        match self.anchor {
            Some((anchor_clocks, anchor_time)) if now > anchor_time => {
                let raw = (now - anchor_time) as f64 / (self.clocks - anchor_clocks) as f64;
                self.interval = Some(match self.interval {
                    Some(interval) => interval + SPEED_SMOOTHING * (raw - interval),
                    None => raw,
                });
                self.anchor = Some((self.clocks, now));
            }
            Some(_) => {}
            None => self.anchor = Some((self.clocks, now)),
        }

        let quarters = self.quarters();
        let speed = match self.interval {
            Some(interval) if interval > 0.0 => {
                let measured_bpm =
                    60.0 * self.ctx.sample_rate() as f64 / (interval * CLOCKS_PER_QUARTER);
                let map = self.ctx.tempo_map().load();
                let at = map.sample_at_quarter_notes(quarters);
                measured_bpm / map.tempo_at_sample(at)
            }
            _ => 0.0,
        };
        self.publish_at_quarters(quarters, speed, self.interval.is_some(), now);
        self.clocks += 1;
    }

    pub fn running(&self) -> bool {
        self.running
    }

    /// Position of the next clock, in quarter notes
    fn quarters(&self) -> f64 {
        self.origin_quarters + self.clocks as f64 / CLOCKS_PER_QUARTER
    }

    fn publish(&self, speed: f64, locked: bool, now: u64) {
        self.publish_at_quarters(self.quarters(), speed, locked, now);
    }

    fn publish_at_quarters(&self, quarters: f64, speed: f64, locked: bool, now: u64) {
        let position = self.ctx.tempo_map().load().sample_at_quarter_notes(quarters);
        *self.shared.lock() = Some(MasterReading {
            speed,
            position,
            timestamp: now,
            locked,
        });
    }
}
