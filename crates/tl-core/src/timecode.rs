//! SMPTE-style timecode (non-drop-frame)
//!
//! MTC and LTC masters report positions as timecode; the transport works in
//! samples. Conversions here are exact to the frame.

use serde::{Deserialize, Serialize};

use crate::{SamplePosition, TlError, TlResult};

/// Frame rate of a timecode stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimecodeRate {
    Fps24,
    #[default]
    Fps25,
    /// 30000/1001 fps, counted without dropping frame numbers
    Fps2997,
    Fps30,
}

impl TimecodeRate {
    /// Frame numbers per second (what the FF field counts to)
    pub fn nominal_fps(self) -> u32 {
        match self {
            TimecodeRate::Fps24 => 24,
            TimecodeRate::Fps25 => 25,
            TimecodeRate::Fps2997 | TimecodeRate::Fps30 => 30,
        }
    }

    /// Actual frames per second
    pub fn fps(self) -> f64 {
        match self {
            TimecodeRate::Fps2997 => 30000.0 / 1001.0,
            other => other.nominal_fps() as f64,
        }
    }

    pub fn samples_per_frame(self, sample_rate: u32) -> f64 {
        sample_rate as f64 / self.fps()
    }
}

/// HH:MM:SS:FF
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Timecode {
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub frames: u8,
    pub rate: TimecodeRate,
}

impl Timecode {
    pub fn new(hours: u8, minutes: u8, seconds: u8, frames: u8, rate: TimecodeRate) -> TlResult<Self> {
        if minutes > 59 || seconds > 59 || frames as u32 >= rate.nominal_fps() || hours > 23 {
            return Err(TlError::InvalidTimecode(format!(
                "{hours:02}:{minutes:02}:{seconds:02}:{frames:02} at {} fps",
                rate.nominal_fps()
            )));
        }
        Ok(Self {
            hours,
            minutes,
            seconds,
            frames,
            rate,
        })
    }

    /// Total frame count since 00:00:00:00
    pub fn frame_count(&self) -> u64 {
        let fps = self.rate.nominal_fps() as u64;
        ((self.hours as u64 * 60 + self.minutes as u64) * 60 + self.seconds as u64) * fps
            + self.frames as u64
    }

    pub fn from_frame_count(frames: u64, rate: TimecodeRate) -> Self {
        let fps = rate.nominal_fps() as u64;
        let total_seconds = frames / fps;
        Self {
            hours: ((total_seconds / 3600) % 24) as u8,
            minutes: ((total_seconds / 60) % 60) as u8,
            seconds: (total_seconds % 60) as u8,
            frames: (frames % fps) as u8,
            rate,
        }
    }

    /// Timecode of the frame containing `sample`
    pub fn from_samples(sample: SamplePosition, sample_rate: u32, rate: TimecodeRate) -> Self {
        let frames = (sample.0 as f64 / rate.samples_per_frame(sample_rate)).floor() as u64;
        Self::from_frame_count(frames, rate)
    }

    /// First sample of this frame
    pub fn to_samples(&self, sample_rate: u32) -> SamplePosition {
        let spf = self.rate.samples_per_frame(sample_rate);
        SamplePosition((self.frame_count() as f64 * spf).round() as u64)
    }

    pub fn parse(s: &str, rate: TimecodeRate) -> TlResult<Self> {
        let fields: Vec<u8> = s
            .trim()
            .split([':', ';'])
            .map(|f| f.parse::<u8>())
            .collect::<Result<_, _>>()
            .map_err(|e| TlError::InvalidTimecode(format!("{s}: {e}")))?;
        match fields.as_slice() {
            &[h, m, sec, f] => Self::new(h, m, sec, f, rate),
            _ => Err(TlError::InvalidTimecode(format!("{s}: expected HH:MM:SS:FF"))),
        }
    }
}

impl std::fmt::Display for Timecode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02}:{:02}",
            self.hours, self.minutes, self.seconds, self.frames
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timecode_to_samples() {
        let tc = Timecode::new(0, 1, 0, 12, TimecodeRate::Fps25).unwrap();
        // 60 s + 12 frames of 1920 samples at 48 kHz
        assert_eq!(tc.to_samples(48000), SamplePosition(60 * 48000 + 12 * 1920));
    }

    #[test]
    fn test_from_samples_lands_on_containing_frame() {
        let pos = SamplePosition(48000 * 3600 + 1919);
        let tc = Timecode::from_samples(pos, 48000, TimecodeRate::Fps25);
        assert_eq!(tc.to_string(), "01:00:00:00");

        let tc = Timecode::from_samples(pos + 1, 48000, TimecodeRate::Fps25);
        assert_eq!(tc.frames, 1);
    }

    #[test]
    fn test_2997_runs_slow() {
        let tc = Timecode::new(0, 0, 1, 0, TimecodeRate::Fps2997).unwrap();
        // 30 frames at 30000/1001 fps is 1.001 s
        assert_eq!(tc.to_samples(48000), SamplePosition(48048));
    }

    #[test]
    fn test_parse_and_validate() {
        let tc = Timecode::parse("10:20:30:23", TimecodeRate::Fps24).unwrap();
        assert_eq!(tc.frame_count(), ((10 * 60 + 20) * 60 + 30) * 24 + 23);
        assert!(Timecode::parse("10:20:30:24", TimecodeRate::Fps24).is_err());
        assert!(Timecode::parse("10:20:30", TimecodeRate::Fps24).is_err());
        assert!(Timecode::parse("aa:00:00:00", TimecodeRate::Fps24).is_err());
    }
}
