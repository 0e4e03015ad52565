//! Transport configuration
//!
//! Persisted as JSON. Every struct uses `#[serde(default)]`, so a config file
//! only needs the keys it wants to change.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tl_core::{BufferSize, SampleRate, TimeDomain, TlError, TlResult};

/// What to do once an external sync signal has been gone for longer than
/// [`SyncPolicy::signal_timeout_ms`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LostSignalPolicy {
    /// Stop the transport
    #[default]
    Stop,
    /// Keep rolling at the last speed the master reported
    ContinueAtLastSpeed,
}

/// External-sync tuning.
///
/// None of these are protocol facts; they trade lock time against audible
/// speed wobble and belong to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPolicy {
    /// Master speed magnitude above which a stopped transport starts following
    pub engage_threshold: f64,
    /// Relative speed difference tolerated before correcting
    pub speed_tolerance: f64,
    /// Position error (samples) counted as locked
    pub lock_tolerance_samples: u64,
    /// Position error (samples) beyond which we locate instead of chasing
    pub locate_threshold_samples: u64,
    /// How far ahead of the master a sync locate lands; the transport then
    /// waits for the master to arrive before starting
    pub locate_lead_samples: u64,
    /// Fraction of the position error closed per cycle by varispeed
    pub catch_gain: f64,
    /// Largest allowed deviation of catch speed from master speed
    pub max_correction: f64,
    /// Largest change of catch speed from one cycle to the next
    pub max_slew_per_cycle: f64,
    /// Extra latency added to whatever the master measures
    pub extra_latency_samples: u64,
    /// How long a master may go silent before `on_signal_lost` applies
    pub signal_timeout_ms: u64,
    pub on_signal_lost: LostSignalPolicy,
    /// Honour roll/stop/locate from UI, control surfaces and scripts while
    /// following an external master
    pub allow_local_requests: bool,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            engage_threshold: 0.1,
            speed_tolerance: 0.002,
            lock_tolerance_samples: 64,
            locate_threshold_samples: 4800,
            locate_lead_samples: 2400,
            catch_gain: 0.25,
            max_correction: 0.05,
            max_slew_per_cycle: 0.01,
            extra_latency_samples: 0,
            signal_timeout_ms: 500,
            on_signal_lost: LostSignalPolicy::Stop,
            allow_local_requests: false,
        }
    }
}

/// Transport engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub sample_rate: u32,
    /// Nominal frames per process cycle (cycles may be shorter)
    pub block_size: u32,
    /// Fade length for starts, stops and locates
    pub declick_ms: f64,
    /// Wrap loops inside the cycle instead of stop + locate + roll
    pub seamless_loop: bool,
    /// On stop, return to where the last roll started
    pub auto_return: bool,
    pub default_play_speed: f64,
    /// Varispeed limit (absolute value)
    pub max_varispeed: f64,
    pub event_queue_capacity: usize,
    pub notification_capacity: usize,
    /// Butler wakes at least this often to refill buffers
    pub butler_period_ms: u64,
    pub stop_recording_on_xrun: bool,
    /// Bars of preroll before a count-in recording starts
    pub count_in_bars: u32,
    /// `BeatTime` keeps a parked playhead on its bar and beat when the tempo
    /// map changes; `AudioTime` keeps it on its sample
    pub position_domain: TimeDomain,
    pub sync: SyncPolicy,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            block_size: 256,
            declick_ms: 4.0,
            seamless_loop: true,
            auto_return: false,
            default_play_speed: 1.0,
            max_varispeed: 4.0,
            event_queue_capacity: 256,
            notification_capacity: 1024,
            butler_period_ms: 50,
            stop_recording_on_xrun: false,
            count_in_bars: 1,
            position_domain: TimeDomain::AudioTime,
            sync: SyncPolicy::default(),
        }
    }
}

impl TransportConfig {
    /// Low-latency preset
    pub fn low_latency() -> Self {
        Self {
            block_size: 64,
            declick_ms: 2.0,
            ..Default::default()
        }
    }

    pub fn declick_samples(&self) -> u64 {
        (self.declick_ms.max(0.0) * self.sample_rate as f64 / 1000.0).round() as u64
    }

    pub fn signal_timeout_samples(&self) -> u64 {
        self.sync.signal_timeout_ms * self.sample_rate as u64 / 1000
    }

    pub fn validate(&self) -> TlResult<()> {
        fn bad(msg: String) -> TlResult<()> {
            Err(TlError::InvalidParam(msg))
        }

        SampleRate::try_from(self.sample_rate)?;
        BufferSize::try_from(self.block_size)?;
        if !(self.max_varispeed.is_finite() && self.max_varispeed > 0.0) {
            return bad(format!("max_varispeed {} out of range", self.max_varispeed));
        }
        if !self.default_play_speed.is_finite()
            || self.default_play_speed == 0.0
            || self.default_play_speed.abs() > self.max_varispeed
        {
            return bad(format!(
                "default_play_speed {} out of range",
                self.default_play_speed
            ));
        }
        if self.event_queue_capacity == 0 || self.notification_capacity == 0 {
            return bad("queue capacities must be non-zero".into());
        }
        let sync = &self.sync;
        if !(0.0..=1.0).contains(&sync.catch_gain) {
            return bad(format!("sync.catch_gain {} not in [0, 1]", sync.catch_gain));
        }
        if sync.max_slew_per_cycle <= 0.0 || sync.max_correction < 0.0 {
            return bad("sync slew and correction limits must be positive".into());
        }
        if sync.lock_tolerance_samples > sync.locate_threshold_samples {
            return bad(format!(
                "sync.lock_tolerance_samples {} exceeds locate_threshold_samples {}",
                sync.lock_tolerance_samples, sync.locate_threshold_samples
            ));
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> TlResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| TlError::Serialization(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> TlResult<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
            .map_err(|e| TlError::Config(format!("{}: {e}", path.as_ref().display())))
    }

    /// Load, falling back to defaults (with a warning) on any error
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load_from(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("Using default transport config: {}", e);
                Self::default()
            }
        }
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> TlResult<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let json =
            serde_json::to_string_pretty(self).map_err(|e| TlError::Serialization(e.to_string()))?;
        fs::write(path, json)?;
        Ok(())
    }
}
