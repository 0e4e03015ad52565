//! Tempo and Time Signature Map
//!
//! Translates between the time units the transport cares about:
//! - Samples: audio samples (absolute)
//! - Ticks: PPQ-based (musical, 960 ticks per quarter note)
//! - Seconds: real time
//! - Bars/Beats/Ticks: musical position (1.1.000 = bar 1, beat 1, tick 0)
//!
//! Every edit rebuilds a segment table, so lookups are a binary search plus
//! a closed-form formula. Reads never allocate, which is what lets the
//! process thread convert positions through a [`crate::Snapshot`] of the map.

use serde::{Deserialize, Serialize};

use crate::SamplePosition;

// ═══════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Pulses per quarter note
pub const PPQ: u32 = 960;

/// Minimum tempo
pub const MIN_TEMPO: f64 = 20.0;

/// Maximum tempo
pub const MAX_TEMPO: f64 = 400.0;

/// Tempo used by a fresh map
pub const DEFAULT_TEMPO: f64 = 120.0;

// ═══════════════════════════════════════════════════════════════════════════════
// TIME SIGNATURE
// ═══════════════════════════════════════════════════════════════════════════════

/// Time signature (e.g., 4/4, 3/4, 6/8)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSignature {
    /// Beats per bar
    pub numerator: u8,
    /// Note value that gets one beat
    pub denominator: u8,
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self::COMMON
    }
}

impl TimeSignature {
    pub const COMMON: Self = Self {
        numerator: 4,
        denominator: 4,
    };

    pub const WALTZ: Self = Self {
        numerator: 3,
        denominator: 4,
    };

    pub fn new(numerator: u8, denominator: u8) -> Self {
        Self {
            numerator: numerator.max(1),
            denominator: denominator.max(1),
        }
    }

    /// Ticks per beat at this time signature
    pub fn ticks_per_beat(&self) -> u64 {
        PPQ as u64 * 4 / self.denominator as u64
    }

    /// Ticks per bar at this time signature
    pub fn ticks_per_bar(&self) -> u64 {
        self.ticks_per_beat() * self.numerator as u64
    }

    /// Compound meter (6/8, 9/8, 12/8)
    pub fn is_compound(&self) -> bool {
        self.denominator == 8 && self.numerator % 3 == 0
    }
}

impl std::fmt::Display for TimeSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// How tempo moves from one event to the next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TempoRamp {
    /// Jump to the new tempo
    #[default]
    Instant,
    /// Tempo changes linearly (in ticks) until the next event
    Linear,
}

/// Tempo change event
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TempoEvent {
    pub tick: u64,
    pub bpm: f64,
    /// Ramp toward the next event
    pub ramp: TempoRamp,
}

impl TempoEvent {
    pub fn new(tick: u64, bpm: f64) -> Self {
        Self::with_ramp(tick, bpm, TempoRamp::Instant)
    }

    pub fn with_ramp(tick: u64, bpm: f64, ramp: TempoRamp) -> Self {
        Self {
            tick,
            bpm: bpm.clamp(MIN_TEMPO, MAX_TEMPO),
            ramp,
        }
    }
}

/// Time signature change, always on a bar line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSignatureEvent {
    /// Bar index (0-based)
    pub bar: u32,
    pub time_signature: TimeSignature,
}

impl TimeSignatureEvent {
    pub fn new(bar: u32, time_signature: TimeSignature) -> Self {
        Self {
            bar,
            time_signature,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MUSICAL POSITION
// ═══════════════════════════════════════════════════════════════════════════════

/// Bars:Beats:Ticks position, 0-indexed internally
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct MusicalPosition {
    pub bar: u32,
    pub beat: u8,
    pub tick: u16,
}

impl MusicalPosition {
    pub fn new(bar: u32, beat: u8, tick: u16) -> Self {
        Self { bar, beat, tick }
    }

    /// "Bar.Beat.Tick", 1-indexed
    pub fn to_display_string(&self) -> String {
        format!("{}.{}.{:03}", self.bar + 1, self.beat + 1, self.tick)
    }

    pub fn from_display_string(s: &str) -> Option<Self> {
        let mut parts = s.trim().split('.');
        let bar = parts.next()?.parse::<u32>().ok()?.checked_sub(1)?;
        let beat = parts.next()?.parse::<u8>().ok()?.checked_sub(1)?;
        let tick = parts.next()?.parse::<u16>().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self { bar, beat, tick })
    }
}

impl std::fmt::Display for MusicalPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{:03}", self.bar + 1, self.beat + 1, self.tick)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SEGMENT TABLES
// ═══════════════════════════════════════════════════════════════════════════════

/// One tempo event resolved to an absolute start sample
#[derive(Debug, Clone, Copy)]
struct TempoSegment {
    tick: u64,
    sample: f64,
    bpm: f64,
    /// Equal to `bpm` unless the segment ramps
    end_bpm: f64,
    /// `u64::MAX` for the open-ended last segment
    len_ticks: u64,
}

impl TempoSegment {
    #[inline]
    fn slope(&self) -> Option<f64> {
        if self.len_ticks == u64::MAX || (self.end_bpm - self.bpm).abs() < f64::EPSILON {
            None
        } else {
            Some((self.end_bpm - self.bpm) / self.len_ticks as f64)
        }
    }

    /// Samples elapsed after `dt` ticks into the segment.
    ///
    /// With a linear ramp, samples-per-tick is `k / bpm(t)` and the integral
    /// has a closed form in `ln`.
    #[inline]
    fn samples_for_ticks(&self, dt: f64, sample_rate: f64) -> f64 {
        let k = 60.0 * sample_rate / PPQ as f64;
        match self.slope() {
            Some(m) => k / m * ((self.bpm + m * dt) / self.bpm).ln(),
            None => k * dt / self.bpm,
        }
    }

    /// Inverse of [`Self::samples_for_ticks`]
    #[inline]
    fn ticks_for_samples(&self, ds: f64, sample_rate: f64) -> f64 {
        let k = 60.0 * sample_rate / PPQ as f64;
        match self.slope() {
            Some(m) => (self.bpm * (ds * m / k).exp() - self.bpm) / m,
            None => ds * self.bpm / k,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct MeterSegment {
    bar: u32,
    tick: u64,
    time_signature: TimeSignature,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TEMPO MAP
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Serialize, Deserialize)]
struct TempoMapData {
    tempo_events: Vec<TempoEvent>,
    time_sig_events: Vec<TimeSignatureEvent>,
    sample_rate: u32,
}

/// Tempo and time signature map
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "TempoMapData", into = "TempoMapData")]
pub struct TempoMap {
    /// Sorted by tick; the first event is always at tick 0
    tempo_events: Vec<TempoEvent>,
    /// Sorted by bar; the first event is always at bar 0
    time_sig_events: Vec<TimeSignatureEvent>,
    sample_rate: u32,
    segments: Vec<TempoSegment>,
    meters: Vec<MeterSegment>,
}

impl Default for TempoMap {
    fn default() -> Self {
        Self::new(48000)
    }
}

impl From<TempoMapData> for TempoMap {
    fn from(data: TempoMapData) -> Self {
        let mut map = Self::new(data.sample_rate);
        for ev in data.tempo_events {
            map.set_tempo_with_ramp(ev.tick, ev.bpm, ev.ramp);
        }
        for ev in data.time_sig_events {
            map.set_time_signature(ev.bar, ev.time_signature);
        }
        map
    }
}

impl From<TempoMap> for TempoMapData {
    fn from(map: TempoMap) -> Self {
        Self {
            tempo_events: map.tempo_events,
            time_sig_events: map.time_sig_events,
            sample_rate: map.sample_rate,
        }
    }
}

impl TempoMap {
    pub fn new(sample_rate: u32) -> Self {
        let mut map = Self {
            tempo_events: vec![TempoEvent::new(0, DEFAULT_TEMPO)],
            time_sig_events: vec![TimeSignatureEvent::new(0, TimeSignature::default())],
            sample_rate: sample_rate.max(1),
            segments: Vec::new(),
            meters: Vec::new(),
        };
        map.rebuild();
        map
    }

    pub fn with_tempo(sample_rate: u32, bpm: f64) -> Self {
        let mut map = Self::new(sample_rate);
        map.set_tempo(0, bpm);
        map
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate.max(1);
        self.rebuild();
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Tempo Management
    // ─────────────────────────────────────────────────────────────────────────────

    /// Tempo at tick, following ramps
    pub fn tempo_at_tick(&self, tick: u64) -> f64 {
        let seg = &self.segments[self.segment_for_tick(tick)];
        match seg.slope() {
            Some(m) => seg.bpm + m * (tick - seg.tick).min(seg.len_ticks) as f64,
            None => seg.bpm,
        }
    }

    pub fn tempo_at_sample(&self, sample: SamplePosition) -> f64 {
        self.tempo_at_tick(self.samples_to_ticks(sample.0))
    }

    pub fn set_tempo(&mut self, tick: u64, bpm: f64) {
        self.set_tempo_with_ramp(tick, bpm, TempoRamp::Instant);
    }

    pub fn set_tempo_with_ramp(&mut self, tick: u64, bpm: f64, ramp: TempoRamp) {
        let event = TempoEvent::with_ramp(tick, bpm, ramp);
        match self.tempo_events.binary_search_by_key(&tick, |e| e.tick) {
            Ok(idx) => self.tempo_events[idx] = event,
            Err(idx) => self.tempo_events.insert(idx, event),
        }
        self.rebuild();
    }

    /// Remove the tempo event at `tick`. The event at tick 0 stays.
    pub fn remove_tempo_event(&mut self, tick: u64) {
        if tick > 0 {
            self.tempo_events.retain(|e| e.tick != tick);
            self.rebuild();
        }
    }

    pub fn tempo_events(&self) -> &[TempoEvent] {
        &self.tempo_events
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Time Signature Management
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn time_signature_at_bar(&self, bar: u32) -> TimeSignature {
        self.meters[self.meter_for_bar(bar)].time_signature
    }

    pub fn set_time_signature(&mut self, bar: u32, time_sig: TimeSignature) {
        let event = TimeSignatureEvent::new(bar, time_sig);
        match self.time_sig_events.binary_search_by_key(&bar, |e| e.bar) {
            Ok(idx) => self.time_sig_events[idx] = event,
            Err(idx) => self.time_sig_events.insert(idx, event),
        }
        self.rebuild();
    }

    /// Remove the meter change at `bar`. The one at bar 0 stays.
    pub fn remove_time_signature_event(&mut self, bar: u32) {
        if bar > 0 {
            self.time_sig_events.retain(|e| e.bar != bar);
            self.rebuild();
        }
    }

    pub fn time_signature_events(&self) -> &[TimeSignatureEvent] {
        &self.time_sig_events
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Conversion: Ticks <-> Samples
    // ─────────────────────────────────────────────────────────────────────────────

    /// Exact sample position of a tick (fractional)
    pub fn ticks_to_samples_f64(&self, ticks: f64) -> f64 {
        let ticks = ticks.max(0.0);
        let seg = &self.segments[self.segment_for_tick(ticks as u64)];
        seg.sample + seg.samples_for_ticks(ticks - seg.tick as f64, self.sample_rate as f64)
    }

    /// Exact tick position of a sample (fractional)
    pub fn samples_to_ticks_f64(&self, samples: f64) -> f64 {
        let samples = samples.max(0.0);
        let idx = self
            .segments
            .partition_point(|s| s.sample <= samples)
            .saturating_sub(1);
        let seg = &self.segments[idx];
        seg.tick as f64 + seg.ticks_for_samples(samples - seg.sample, self.sample_rate as f64)
    }

    /// Ticks to samples, rounded to the nearest sample
    pub fn ticks_to_samples(&self, ticks: u64) -> u64 {
        self.ticks_to_samples_f64(ticks as f64).round() as u64
    }

    /// Samples to ticks, rounded to the nearest tick
    pub fn samples_to_ticks(&self, samples: u64) -> u64 {
        self.samples_to_ticks_f64(samples as f64).round() as u64
    }

    /// Position in quarter notes, as MIDI song position and clock math want it
    pub fn quarter_notes_at_sample(&self, sample: SamplePosition) -> f64 {
        self.samples_to_ticks_f64(sample.0 as f64) / PPQ as f64
    }

    pub fn sample_at_quarter_notes(&self, quarters: f64) -> SamplePosition {
        SamplePosition(self.ticks_to_samples_f64(quarters * PPQ as f64).round() as u64)
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Conversion: Ticks <-> Musical Position
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn ticks_to_position(&self, ticks: u64) -> MusicalPosition {
        let idx = self
            .meters
            .partition_point(|m| m.tick <= ticks)
            .saturating_sub(1);
        let meter = &self.meters[idx];
        let ts = meter.time_signature;

        let rel = ticks - meter.tick;
        let bars = rel / ts.ticks_per_bar();
        let in_bar = rel % ts.ticks_per_bar();

        MusicalPosition {
            bar: meter.bar + bars as u32,
            beat: (in_bar / ts.ticks_per_beat()) as u8,
            tick: (in_bar % ts.ticks_per_beat()) as u16,
        }
    }

    pub fn position_to_ticks(&self, pos: &MusicalPosition) -> u64 {
        let meter = &self.meters[self.meter_for_bar(pos.bar)];
        let ts = meter.time_signature;
        meter.tick
            + (pos.bar - meter.bar) as u64 * ts.ticks_per_bar()
            + pos.beat as u64 * ts.ticks_per_beat()
            + pos.tick as u64
    }

    pub fn samples_to_position(&self, sample: SamplePosition) -> MusicalPosition {
        self.ticks_to_position(self.samples_to_ticks_f64(sample.0 as f64).floor() as u64)
    }

    pub fn position_to_samples(&self, pos: &MusicalPosition) -> SamplePosition {
        SamplePosition(self.ticks_to_samples(self.position_to_ticks(pos)))
    }

    /// Tick of the next bar line strictly after `tick`
    pub fn next_bar(&self, tick: u64) -> u64 {
        let pos = self.ticks_to_position(tick);
        self.position_to_ticks(&MusicalPosition::new(pos.bar + 1, 0, 0))
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Conversion: Seconds
    // ─────────────────────────────────────────────────────────────────────────────

    pub fn ticks_to_seconds(&self, ticks: u64) -> f64 {
        self.ticks_to_samples_f64(ticks as f64) / self.sample_rate as f64
    }

    pub fn seconds_to_ticks(&self, seconds: f64) -> u64 {
        self.samples_to_ticks_f64(seconds * self.sample_rate as f64)
            .round() as u64
    }

    pub fn samples_to_seconds(&self, samples: u64) -> f64 {
        samples as f64 / self.sample_rate as f64
    }

    pub fn seconds_to_samples(&self, seconds: f64) -> u64 {
        (seconds.max(0.0) * self.sample_rate as f64).round() as u64
    }

    // ─────────────────────────────────────────────────────────────────────────────
    // Segment tables
    // ─────────────────────────────────────────────────────────────────────────────

    #[inline]
    fn segment_for_tick(&self, tick: u64) -> usize {
        self.segments
            .partition_point(|s| s.tick <= tick)
            .saturating_sub(1)
    }

    #[inline]
    fn meter_for_bar(&self, bar: u32) -> usize {
        self.meters.partition_point(|m| m.bar <= bar).saturating_sub(1)
    }

    fn rebuild(&mut self) {
        if self.tempo_events.first().is_none_or(|e| e.tick != 0) {
            self.tempo_events.insert(0, TempoEvent::new(0, DEFAULT_TEMPO));
        }
        if self.time_sig_events.first().is_none_or(|e| e.bar != 0) {
            self.time_sig_events
                .insert(0, TimeSignatureEvent::new(0, TimeSignature::default()));
        }

        let sample_rate = self.sample_rate as f64;
        self.segments.clear();
        let mut sample = 0.0;
        for (i, event) in self.tempo_events.iter().enumerate() {
            let next = self.tempo_events.get(i + 1);
            let end_bpm = match (event.ramp, next) {
                (TempoRamp::Linear, Some(n)) => n.bpm,
                _ => event.bpm,
            };
            let seg = TempoSegment {
                tick: event.tick,
                sample,
                bpm: event.bpm,
                end_bpm,
                len_ticks: next.map_or(u64::MAX, |n| n.tick - event.tick),
            };
            if next.is_some() {
                sample += seg.samples_for_ticks(seg.len_ticks as f64, sample_rate);
            }
            self.segments.push(seg);
        }

        self.meters.clear();
        let mut tick = 0;
        let mut prev: Option<&TimeSignatureEvent> = None;
        for event in &self.time_sig_events {
            if let Some(p) = prev {
                tick += (event.bar - p.bar) as u64 * p.time_signature.ticks_per_bar();
            }
            self.meters.push(MeterSegment {
                bar: event.bar,
                tick,
                time_signature: event.time_signature,
            });
            prev = Some(event);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_time_signature() {
        let ts = TimeSignature::new(4, 4);
        assert_eq!(ts.ticks_per_bar(), 4 * PPQ as u64);
        assert_eq!(ts.ticks_per_beat(), PPQ as u64);

        let ts_68 = TimeSignature::new(6, 8);
        assert!(ts_68.is_compound());
        assert_eq!(ts_68.ticks_per_beat(), PPQ as u64 / 2);
        assert_eq!(ts_68.to_string(), "6/8");
    }

    #[test]
    fn test_ticks_to_samples_constant_tempo() {
        let map = TempoMap::new(48000);
        // 120 BPM: one quarter note = 0.5 s = 24000 samples
        assert_eq!(map.ticks_to_samples(PPQ as u64), 24000);
        assert_eq!(map.samples_to_ticks(24000), PPQ as u64);
    }

    #[test]
    fn test_tempo_change_offsets_later_positions() {
        let mut map = TempoMap::new(48000);
        map.set_tempo(PPQ as u64 * 4, 60.0);

        assert_eq!(map.tempo_at_tick(0), 120.0);
        assert_eq!(map.tempo_at_tick(PPQ as u64 * 4), 60.0);

        // One bar at 120 = 96000, then one beat at 60 = 48000
        assert_eq!(map.ticks_to_samples(PPQ as u64 * 4), 96000);
        assert_eq!(map.ticks_to_samples(PPQ as u64 * 5), 144000);
        assert_eq!(map.samples_to_ticks(144000), PPQ as u64 * 5);
    }

    #[test]
    fn test_linear_ramp_is_invertible() {
        let mut map = TempoMap::new(48000);
        map.set_tempo_with_ramp(0, 120.0, TempoRamp::Linear);
        map.set_tempo(PPQ as u64 * 4, 240.0);

        let end = map.ticks_to_samples_f64(PPQ as f64 * 4.0);
        // 96000 * ln(2)
        assert_relative_eq!(end, 66542.4, max_relative = 1e-4);
        assert_relative_eq!(map.tempo_at_tick(PPQ as u64 * 2), 180.0);

        for ticks in [0u64, 100, 960, 2000, 3839, 3840, 9000] {
            let samples = map.ticks_to_samples_f64(ticks as f64);
            let back = map.samples_to_ticks_f64(samples);
            assert_relative_eq!(back, ticks as f64, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_musical_position_across_meter_change() {
        let mut map = TempoMap::new(48000);
        map.set_time_signature(2, TimeSignature::WALTZ);

        // Two bars of 4/4, then 3/4
        let third_bar = map.position_to_ticks(&MusicalPosition::new(2, 0, 0));
        assert_eq!(third_bar, 8 * PPQ as u64);

        let pos = map.ticks_to_position(third_bar + 3 * PPQ as u64 + 10);
        assert_eq!(pos, MusicalPosition::new(3, 0, 10));
        assert_eq!(map.next_bar(third_bar), third_bar + 3 * PPQ as u64);
    }

    #[test]
    fn test_samples_to_position() {
        let map = TempoMap::new(48000);
        let pos = map.samples_to_position(SamplePosition(96000 + 24000));
        assert_eq!(pos, MusicalPosition::new(1, 1, 0));
        assert_eq!(map.position_to_samples(&pos), SamplePosition(120000));
    }

    #[test]
    fn test_first_events_cannot_be_removed() {
        let mut map = TempoMap::new(48000);
        map.remove_tempo_event(0);
        map.remove_time_signature_event(0);
        assert_eq!(map.tempo_events().len(), 1);
        assert_eq!(map.time_signature_events().len(), 1);
    }

    #[test]
    fn test_serde_rebuilds_segments() {
        let mut map = TempoMap::new(44100);
        map.set_tempo(PPQ as u64 * 8, 90.0);

        let json = serde_json::to_string(&map).unwrap();
        let restored: TempoMap = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.tempo_events(), map.tempo_events());
        assert_eq!(
            restored.ticks_to_samples(PPQ as u64 * 12),
            map.ticks_to_samples(PPQ as u64 * 12)
        );
    }

    #[test]
    fn test_position_display() {
        let pos = MusicalPosition::new(3, 2, 480);
        assert_eq!(pos.to_display_string(), "4.3.480");
        assert_eq!(MusicalPosition::from_display_string("4.3.480"), Some(pos));
        assert_eq!(MusicalPosition::from_display_string("0.1.0"), None);
        assert_eq!(MusicalPosition::from_display_string("1.1.0.5"), None);
    }
}
