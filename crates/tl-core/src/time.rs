//! Sample-accurate position types

use serde::{Deserialize, Serialize};

/// Sample position in the timeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SamplePosition(pub u64);

impl SamplePosition {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(u64::MAX);

    #[inline]
    pub fn from_seconds(seconds: f64, sample_rate: f64) -> Self {
        Self((seconds.max(0.0) * sample_rate) as u64)
    }

    #[inline]
    pub fn to_seconds(self, sample_rate: f64) -> f64 {
        self.0 as f64 / sample_rate
    }

    #[inline]
    pub fn advance(&mut self, samples: u64) {
        self.0 = self.0.saturating_add(samples);
    }

    /// Move by a signed amount, clamping at zero
    #[inline]
    pub fn offset(self, delta: i64) -> Self {
        if delta >= 0 {
            Self(self.0.saturating_add(delta as u64))
        } else {
            Self(self.0.saturating_sub(delta.unsigned_abs()))
        }
    }

    /// Signed distance `other - self`
    #[inline]
    pub fn delta_to(self, other: Self) -> i64 {
        other.0 as i64 - self.0 as i64
    }

    #[inline]
    pub fn clamp_to(self, start: Self, end: Self) -> Self {
        Self(self.0.clamp(start.0, end.0.max(start.0)))
    }
}

impl std::ops::Add<u64> for SamplePosition {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0.saturating_add(rhs))
    }
}

impl std::ops::Sub for SamplePosition {
    type Output = u64;

    fn sub(self, rhs: Self) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}

impl From<u64> for SamplePosition {
    fn from(sample: u64) -> Self {
        Self(sample)
    }
}

impl std::fmt::Display for SamplePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Time duration in samples
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SampleDuration(pub u64);

impl SampleDuration {
    pub const ZERO: Self = Self(0);

    #[inline]
    pub fn from_seconds(seconds: f64, sample_rate: f64) -> Self {
        Self((seconds.max(0.0) * sample_rate) as u64)
    }

    #[inline]
    pub fn from_ms(ms: f64, sample_rate: f64) -> Self {
        Self::from_seconds(ms / 1000.0, sample_rate)
    }

    #[inline]
    pub fn to_seconds(self, sample_rate: f64) -> f64 {
        self.0 as f64 / sample_rate
    }

    #[inline]
    pub fn to_ms(self, sample_rate: f64) -> f64 {
        self.to_seconds(sample_rate) * 1000.0
    }
}

/// Which clock a position is anchored to.
///
/// Audio-time positions stay at a fixed sample when the tempo map changes;
/// beat-time positions keep their musical location and move in samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeDomain {
    #[default]
    AudioTime,
    BeatTime,
}

/// Transport position: a sample count tagged with its time domain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportPosition {
    pub sample: SamplePosition,
    pub domain: TimeDomain,
}

impl TransportPosition {
    pub const ZERO: Self = Self {
        sample: SamplePosition::ZERO,
        domain: TimeDomain::AudioTime,
    };

    pub fn audio(sample: u64) -> Self {
        Self {
            sample: SamplePosition(sample),
            domain: TimeDomain::AudioTime,
        }
    }

    pub fn beats(sample: u64) -> Self {
        Self {
            sample: SamplePosition(sample),
            domain: TimeDomain::BeatTime,
        }
    }

    #[inline]
    pub fn samples(&self) -> u64 {
        self.sample.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_clamps_at_zero() {
        let pos = SamplePosition(100);
        assert_eq!(pos.offset(-250), SamplePosition::ZERO);
        assert_eq!(pos.offset(50), SamplePosition(150));
        assert_eq!(pos.delta_to(SamplePosition(40)), -60);
    }

    #[test]
    fn test_clamp_to_range() {
        let start = SamplePosition(1000);
        let end = SamplePosition(2000);
        assert_eq!(SamplePosition(5000).clamp_to(start, end), end);
        assert_eq!(SamplePosition(10).clamp_to(start, end), start);
        assert_eq!(SamplePosition(1500).clamp_to(start, end), SamplePosition(1500));
    }

    #[test]
    fn test_duration_ms() {
        let d = SampleDuration::from_ms(10.0, 48000.0);
        assert_eq!(d.0, 480);
        assert!((d.to_ms(48000.0) - 10.0).abs() < 1e-9);
    }
}
