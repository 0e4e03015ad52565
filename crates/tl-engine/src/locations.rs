//! Session, loop and punch ranges
//!
//! Edited from non-real-time threads, read by the process thread through a
//! [`tl_core::Snapshot`].

use serde::{Deserialize, Serialize};
use tl_core::SamplePosition;

/// Half-open sample range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: SamplePosition,
    pub end: SamplePosition,
}

impl Range {
    /// `None` unless `start < end`
    pub fn new(start: u64, end: u64) -> Option<Self> {
        (start < end).then_some(Self {
            start: SamplePosition(start),
            end: SamplePosition(end),
        })
    }

    #[inline]
    pub fn length(&self) -> u64 {
        self.end - self.start
    }

    #[inline]
    pub fn contains(&self, pos: SamplePosition) -> bool {
        pos >= self.start && pos < self.end
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locations {
    /// Session start/end markers
    pub session: Option<Range>,
    /// Armed loop region
    pub loop_range: Option<Range>,
    /// Auto punch region
    pub punch: Option<Range>,
    /// Recording starts at the punch start
    pub punch_in: bool,
    /// Recording ends at the punch end
    pub punch_out: bool,
}

impl Locations {
    /// Clamp a locate target so it never lands past the session end.
    ///
    /// Without a session range every non-negative position is valid.
    pub fn clamp_locate(&self, target: SamplePosition) -> SamplePosition {
        match self.session {
            Some(r) if target > r.end => r.end,
            _ => target,
        }
    }

    pub fn session_start(&self) -> Option<SamplePosition> {
        self.session.map(|r| r.start)
    }

    pub fn session_end(&self) -> Option<SamplePosition> {
        self.session.map(|r| r.end)
    }

    pub fn punch_in_at(&self) -> Option<SamplePosition> {
        self.punch.filter(|_| self.punch_in).map(|r| r.start)
    }

    pub fn punch_out_at(&self) -> Option<SamplePosition> {
        self.punch.filter(|_| self.punch_out).map(|r| r.end)
    }

    /// Either punch edge is armed
    pub fn punch_armed(&self) -> bool {
        self.punch.is_some() && (self.punch_in || self.punch_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_requires_order() {
        assert!(Range::new(10, 10).is_none());
        assert!(Range::new(20, 10).is_none());
        let r = Range::new(1000, 2000).unwrap();
        assert_eq!(r.length(), 1000);
        assert!(r.contains(SamplePosition(1999)));
        assert!(!r.contains(SamplePosition(2000)));
    }

    #[test]
    fn test_clamp_locate_to_session_end() {
        let locs = Locations {
            session: Range::new(0, 48000),
            ..Default::default()
        };
        assert_eq!(locs.clamp_locate(SamplePosition(96000)), SamplePosition(48000));
        assert_eq!(locs.clamp_locate(SamplePosition(100)), SamplePosition(100));
        assert_eq!(
            Locations::default().clamp_locate(SamplePosition(96000)),
            SamplePosition(96000)
        );
    }

    #[test]
    fn test_punch_edges_follow_flags() {
        let mut locs = Locations {
            punch: Range::new(1000, 2000),
            ..Default::default()
        };
        assert!(!locs.punch_armed());
        assert_eq!(locs.punch_in_at(), None);

        locs.punch_out = true;
        assert!(locs.punch_armed());
        assert_eq!(locs.punch_in_at(), None);
        assert_eq!(locs.punch_out_at(), Some(SamplePosition(2000)));

        locs.punch_in = true;
        assert_eq!(locs.punch_in_at(), Some(SamplePosition(1000)));

        locs.punch = None;
        assert!(!locs.punch_armed());
        assert_eq!(locs.punch_out_at(), None);
    }
}
