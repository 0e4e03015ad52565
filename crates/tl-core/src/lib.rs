//! tl-core: Time and tempo types for the Tideline transport
//!
//! Everything here is plain data plus pure arithmetic, so the real-time
//! thread can read it without allocating. Shared mutable state goes through
//! [`Snapshot`], which publishes whole new values instead of locking.

mod error;
mod snapshot;
mod tempo;
mod time;
mod timecode;

pub use error::*;
pub use snapshot::*;
pub use tempo::*;
pub use time::*;
pub use timecode::*;

/// Standard sample rate options
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum SampleRate {
    Hz44100 = 44100,
    Hz48000 = 48000,
    Hz88200 = 88200,
    Hz96000 = 96000,
    Hz176400 = 176400,
    Hz192000 = 192000,
}

impl SampleRate {
    #[inline]
    pub fn as_f64(self) -> f64 {
        self as u32 as f64
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Samples in `ms` milliseconds at this rate, rounded down
    #[inline]
    pub fn ms_to_samples(self, ms: f64) -> u64 {
        (ms * self.as_f64() / 1000.0) as u64
    }
}

impl Default for SampleRate {
    fn default() -> Self {
        Self::Hz48000
    }
}

impl TryFrom<u32> for SampleRate {
    type Error = TlError;

    fn try_from(hz: u32) -> TlResult<Self> {
        match hz {
            44100 => Ok(Self::Hz44100),
            48000 => Ok(Self::Hz48000),
            88200 => Ok(Self::Hz88200),
            96000 => Ok(Self::Hz96000),
            176400 => Ok(Self::Hz176400),
            192000 => Ok(Self::Hz192000),
            other => Err(TlError::InvalidSampleRate(other)),
        }
    }
}

/// Audio block size options
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum BufferSize {
    Samples32 = 32,
    Samples64 = 64,
    Samples128 = 128,
    Samples256 = 256,
    Samples512 = 512,
    Samples1024 = 1024,
    Samples2048 = 2048,
}

impl BufferSize {
    #[inline]
    pub fn as_usize(self) -> usize {
        self as u32 as usize
    }

    #[inline]
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// One block's duration in milliseconds
    #[inline]
    pub fn latency_ms(self, sample_rate: SampleRate) -> f64 {
        (self.as_u32() as f64 / sample_rate.as_f64()) * 1000.0
    }
}

impl Default for BufferSize {
    fn default() -> Self {
        Self::Samples256
    }
}

impl TryFrom<u32> for BufferSize {
    type Error = TlError;

    fn try_from(frames: u32) -> TlResult<Self> {
        match frames {
            32 => Ok(Self::Samples32),
            64 => Ok(Self::Samples64),
            128 => Ok(Self::Samples128),
            256 => Ok(Self::Samples256),
            512 => Ok(Self::Samples512),
            1024 => Ok(Self::Samples1024),
            2048 => Ok(Self::Samples2048),
            other => Err(TlError::InvalidParam(format!(
                "unsupported buffer size {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_rate_parse() {
        assert_eq!(SampleRate::try_from(48000).unwrap(), SampleRate::Hz48000);
        assert!(SampleRate::try_from(12345).is_err());
        assert_eq!(SampleRate::Hz48000.ms_to_samples(5.0), 240);
    }

    #[test]
    fn test_buffer_latency() {
        let ms = BufferSize::Samples256.latency_ms(SampleRate::Hz48000);
        assert!((ms - 5.333).abs() < 0.01);
        assert!(BufferSize::try_from(300).is_err());
    }
}
