//! Transport Master Synchronization
//!
//! Once per cycle the driver reads the active [`TransportMaster`] and asks
//! [`MasterSync::plan`] what the local transport should do. Planning is pure
//! bookkeeping over the reading and the local state; the returned
//! [`TransportMasterStrategy`] is applied by the driver, never here.
//!
//! ## Decisions, in order
//! 1. No (locked) signal: `Waiting`; hold speed until the configured
//!    timeout, then stop or keep rolling per policy.
//! 2. Master stopped: stop, or park on the master's position.
//! 3. Position error beyond the locate threshold: locate ahead of the master
//!    and wait for it to arrive.
//! 4. Stopped and master moving: start.
//! 5. Rolling: relax when locked, otherwise chase with a bounded
//!    proportional speed correction.

use serde::{Deserialize, Serialize};
use tl_core::SamplePosition;

use crate::config::{LostSignalPolicy, SyncPolicy};
use crate::fsm::LocateTransportDisposition;

// ═══════════════════════════════════════════════════════════════════════════════
// TYPES
// ═══════════════════════════════════════════════════════════════════════════════

/// Clock the transport follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum SyncSource {
    #[default]
    Internal = 0,
    /// Audio-engine level shared transport
    Engine = 1,
    /// Linear timecode
    Ltc = 2,
    /// MIDI timecode
    Mtc = 3,
    MidiClock = 4,
}

impl From<u8> for SyncSource {
    fn from(value: u8) -> Self {
        match value {
            1 => SyncSource::Engine,
            2 => SyncSource::Ltc,
            3 => SyncSource::Mtc,
            4 => SyncSource::MidiClock,
            _ => SyncSource::Internal,
        }
    }
}

/// Lock state against the external master
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TransportMasterState {
    /// Master is not moving
    #[default]
    Stopped = 0,
    /// No usable signal, or not yet locked
    Waiting = 1,
    Running = 2,
}

impl From<u8> for TransportMasterState {
    fn from(value: u8) -> Self {
        match value {
            1 => TransportMasterState::Waiting,
            2 => TransportMasterState::Running,
            _ => TransportMasterState::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMasterAction {
    /// Keep going at `catch_speed`
    Relax,
    /// Stay stopped
    NoRoll,
    Locate,
    Start,
    Stop,
    /// Not locked yet; hold or chase at `catch_speed`
    Wait,
}

/// One cycle's decision
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransportMasterStrategy {
    pub action: TransportMasterAction,
    pub target: SamplePosition,
    pub roll_disposition: LocateTransportDisposition,
    pub catch_speed: f64,
}

impl TransportMasterStrategy {
    fn new(action: TransportMasterAction, catch_speed: f64) -> Self {
        Self {
            action,
            target: SamplePosition::ZERO,
            roll_disposition: LocateTransportDisposition::RollIfAppropriate,
            catch_speed,
        }
    }

    fn locate(target: SamplePosition, disposition: LocateTransportDisposition) -> Self {
        Self {
            action: TransportMasterAction::Locate,
            target,
            roll_disposition: disposition,
            catch_speed: 0.0,
        }
    }
}

/// What a master reports
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MasterReading {
    pub speed: f64,
    /// Master position at `timestamp`
    pub position: SamplePosition,
    /// Engine time at which `position` was valid
    pub timestamp: u64,
    /// Decoder has a usable lock
    pub locked: bool,
}

/// A clock the transport can follow.
///
/// `read` runs on the process thread and must not block or allocate.
pub trait TransportMaster: Send {
    fn source(&self) -> SyncSource;

    fn name(&self) -> &str;

    /// Latest reading, or `None` when there is no signal
    fn read(&mut self, now: u64) -> Option<MasterReading>;

    /// Measured input latency, in samples
    fn latency(&self) -> u64 {
        0
    }

    /// Smallest position step the master can express (e.g. one frame)
    fn resolution(&self) -> u64 {
        1
    }

    /// Drop filter state (called when the master becomes active)
    fn reset(&mut self) {}
}

/// Local transport facts the planner needs
#[derive(Debug, Clone, Copy)]
pub struct PlanInput {
    /// Engine time at cycle start
    pub now: u64,
    pub nframes: u32,
    pub position: SamplePosition,
    pub speed: f64,
    pub rolling: bool,
    /// A locate is in flight
    pub locating: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// PLANNER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct MasterSync {
    policy: SyncPolicy,
    timeout_samples: u64,
    state: TransportMasterState,
    catch_speed: f64,
    /// Last speed a locked master reported
    last_speed: f64,
    lost_since: Option<u64>,
    /// Where a sync locate parked us, waiting for the master to arrive
    wait_target: Option<SamplePosition>,
}

impl MasterSync {
    pub fn new(policy: SyncPolicy, sample_rate: u32) -> Self {
        let timeout_samples = policy.signal_timeout_ms * sample_rate as u64 / 1000;
        Self {
            policy,
            timeout_samples,
            state: TransportMasterState::Stopped,
            catch_speed: 0.0,
            last_speed: 0.0,
            lost_since: None,
            wait_target: None,
        }
    }

    pub fn state(&self) -> TransportMasterState {
        self.state
    }

    pub fn catch_speed(&self) -> f64 {
        self.catch_speed
    }

    pub fn reset(&mut self) {
        self.state = TransportMasterState::Stopped;
        self.catch_speed = 0.0;
        self.last_speed = 0.0;
        self.lost_since = None;
        self.wait_target = None;
    }

    pub fn plan(
        &mut self,
        input: &PlanInput,
        reading: Option<MasterReading>,
        latency: u64,
        resolution: u64,
    ) -> TransportMasterStrategy {
        let reading = match reading {
            Some(r) if r.locked && r.speed.is_finite() => r,
            _ => return self.plan_without_signal(input),
        };
        self.lost_since = None;
        self.last_speed = reading.speed;

        // Where the master is now, not where it was when the reading was taken
        let age = input.now.saturating_sub(reading.timestamp)
            + latency
            + self.policy.extra_latency_samples;
        let master_pos = reading
            .position
            .offset((age as f64 * reading.speed).round() as i64);

        if input.locating {
            self.state = TransportMasterState::Waiting;
            return TransportMasterStrategy::new(TransportMasterAction::Wait, self.catch_speed);
        }

        let lock_tolerance = self.policy.lock_tolerance_samples.max(resolution);

        if reading.speed.abs() < self.policy.engage_threshold {
            self.state = TransportMasterState::Stopped;
            self.catch_speed = 0.0;
            self.wait_target = None;
            if input.rolling {
                return TransportMasterStrategy::new(TransportMasterAction::Stop, 0.0);
            }
            if input.position.delta_to(master_pos).unsigned_abs() > lock_tolerance {
                return TransportMasterStrategy::locate(
                    master_pos,
                    LocateTransportDisposition::MustStop,
                );
            }
            return TransportMasterStrategy::new(TransportMasterAction::NoRoll, 0.0);
        }

        let delta = input.position.delta_to(master_pos);
        let threshold = self.policy.locate_threshold_samples;

        if !input.rolling {
            if let Some(target) = self.wait_target {
                // Distance the master still has to travel, in its direction of motion
                let remaining = master_pos.delta_to(target) as f64 * reading.speed.signum();
                if remaining.abs() > (threshold + self.policy.locate_lead_samples) as f64 {
                    return self.locate_ahead(master_pos, reading.speed);
                }
                if remaining > 0.0 {
                    self.state = TransportMasterState::Waiting;
                    return TransportMasterStrategy::new(TransportMasterAction::Wait, 0.0);
                }
                self.wait_target = None;
                return self.start(reading.speed);
            }
            if delta.unsigned_abs() > threshold {
                return self.locate_ahead(master_pos, reading.speed);
            }
            return self.start(reading.speed);
        }

        if delta.unsigned_abs() > threshold {
            return self.locate_ahead(master_pos, reading.speed);
        }

        if self.catch_speed == 0.0 {
            self.catch_speed = input.speed;
        }

        let locked = delta.unsigned_abs() <= lock_tolerance;
        let speed_ok =
            (input.speed - reading.speed).abs() <= self.policy.speed_tolerance * reading.speed.abs();
        if locked && speed_ok {
            self.state = TransportMasterState::Running;
            self.catch_speed = input.speed;
            return TransportMasterStrategy::new(TransportMasterAction::Relax, input.speed);
        }

        // Bounded proportional correction toward the master, slew-limited
        let max_correction = self.policy.max_correction;
        let correction = (self.policy.catch_gain * delta as f64 / input.nframes.max(1) as f64)
            .clamp(-max_correction, max_correction);
        let desired = reading.speed + correction;
        let slew = self.policy.max_slew_per_cycle;
        self.catch_speed += (desired - self.catch_speed).clamp(-slew, slew);

        if locked {
            self.state = TransportMasterState::Running;
            TransportMasterStrategy::new(TransportMasterAction::Relax, self.catch_speed)
        } else {
            self.state = TransportMasterState::Waiting;
            TransportMasterStrategy::new(TransportMasterAction::Wait, self.catch_speed)
        }
    }

    fn plan_without_signal(&mut self, input: &PlanInput) -> TransportMasterStrategy {
        let since = *self.lost_since.get_or_insert(input.now);
        self.state = TransportMasterState::Waiting;

        if !input.rolling {
            return TransportMasterStrategy::new(TransportMasterAction::NoRoll, 0.0);
        }
        if input.now.saturating_sub(since) < self.timeout_samples {
            return TransportMasterStrategy::new(TransportMasterAction::Wait, self.catch_speed);
        }
        match self.policy.on_signal_lost {
            LostSignalPolicy::Stop => {
                self.catch_speed = 0.0;
                TransportMasterStrategy::new(TransportMasterAction::Stop, 0.0)
            }
            LostSignalPolicy::ContinueAtLastSpeed => {
                let speed = if self.last_speed != 0.0 {
                    self.last_speed
                } else {
                    input.speed
                };
                self.catch_speed = speed;
                TransportMasterStrategy::new(TransportMasterAction::Relax, speed)
            }
        }
    }

    fn start(&mut self, speed: f64) -> TransportMasterStrategy {
        self.state = TransportMasterState::Waiting;
        self.catch_speed = speed;
        TransportMasterStrategy::new(TransportMasterAction::Start, speed)
    }

    fn locate_ahead(&mut self, master_pos: SamplePosition, speed: f64) -> TransportMasterStrategy {
        let lead = self.policy.locate_lead_samples as i64 * speed.signum() as i64;
        let target = master_pos.offset(lead);
        self.state = TransportMasterState::Waiting;
        self.catch_speed = 0.0;
        self.wait_target = Some(target);
        TransportMasterStrategy::locate(target, LocateTransportDisposition::MustStop)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const SR: u32 = 48000;
    const N: u32 = 256;

    fn reading(position: u64, speed: f64, now: u64) -> Option<MasterReading> {
        Some(MasterReading {
            speed,
            position: SamplePosition(position),
            timestamp: now,
            locked: true,
        })
    }

    fn input(now: u64, position: u64, speed: f64, rolling: bool) -> PlanInput {
        PlanInput {
            now,
            nframes: N,
            position: SamplePosition(position),
            speed,
            rolling,
            locating: false,
        }
    }

    fn sync() -> MasterSync {
        MasterSync::new(SyncPolicy::default(), SR)
    }

    #[test]
    fn test_master_stopped_stops_rolling_transport() {
        let mut sync = sync();
        let plan = sync.plan(&input(0, 1000, 1.0, true), reading(1000, 0.0, 0), 0, 1);
        assert_eq!(plan.action, TransportMasterAction::Stop);
        assert_eq!(sync.state(), TransportMasterState::Stopped);
    }

    #[test]
    fn test_master_moving_starts_stopped_transport() {
        let mut sync = sync();
        let plan = sync.plan(&input(0, 1000, 0.0, false), reading(1010, 1.0, 0), 0, 1);
        assert_eq!(plan.action, TransportMasterAction::Start);
        assert_relative_eq!(plan.catch_speed, 1.0);
    }

    #[test]
    fn test_below_engage_threshold_does_not_start() {
        let mut sync = sync();
        let plan = sync.plan(&input(0, 1000, 0.0, false), reading(1000, 0.05, 0), 0, 1);
        assert_eq!(plan.action, TransportMasterAction::NoRoll);
    }

    #[test]
    fn test_large_delta_locates_ahead_then_waits() {
        let mut sync = sync();
        let policy = SyncPolicy::default();

        let plan = sync.plan(&input(0, 0, 0.0, false), reading(100_000, 1.0, 0), 0, 1);
        assert_eq!(plan.action, TransportMasterAction::Locate);
        let target = 100_000 + policy.locate_lead_samples;
        assert_eq!(plan.target, SamplePosition(target));
        assert_eq!(plan.roll_disposition, LocateTransportDisposition::MustStop);

        // Parked at the target, master still behind: wait
        let plan = sync.plan(&input(N as u64, target, 0.0, false), reading(100_256, 1.0, 256), 0, 1);
        assert_eq!(plan.action, TransportMasterAction::Wait);

        // Master arrives: start
        let plan = sync.plan(&input(10_000, target, 0.0, false), reading(target, 1.0, 10_000), 0, 1);
        assert_eq!(plan.action, TransportMasterAction::Start);
    }

    #[test]
    fn test_latency_compensation_moves_target() {
        let mut sync = sync();
        // Reading is 1000 samples old and the input adds 500 more of latency
        let plan = sync.plan(&input(1000, 0, 0.0, false), reading(50_000, 1.0, 0), 500, 1);
        assert_eq!(plan.action, TransportMasterAction::Locate);
        assert_eq!(
            plan.target,
            SamplePosition(51_500 + SyncPolicy::default().locate_lead_samples)
        );
    }

    #[test]
    fn test_locked_rolling_relaxes() {
        let mut sync = sync();
        let plan = sync.plan(&input(0, 10_000, 1.0, true), reading(10_010, 1.0, 0), 0, 1);
        assert_eq!(plan.action, TransportMasterAction::Relax);
        assert_eq!(sync.state(), TransportMasterState::Running);
        assert_relative_eq!(plan.catch_speed, 1.0);
    }

    #[test]
    fn test_catch_speed_slews_within_limit() {
        let mut sync = sync();
        let policy = SyncPolicy::default();

        // Master 2000 samples ahead: outside lock, inside locate threshold
        let mut speed = 1.0;
        let mut prev = speed;
        for cycle in 0..10u64 {
            let now = cycle * N as u64;
            let plan = sync.plan(&input(now, 10_000 + now, speed, true), reading(12_000 + now, 1.0, now), 0, 1);
            assert_eq!(plan.action, TransportMasterAction::Wait);
            assert!((plan.catch_speed - prev).abs() <= policy.max_slew_per_cycle + 1e-12);
            assert!(plan.catch_speed <= 1.0 + policy.max_correction + 1e-12);
            prev = plan.catch_speed;
            speed = plan.catch_speed;
        }
        assert!(speed > 1.0);
    }

    #[test]
    fn test_signal_loss_waits_then_stops() {
        let mut sync = sync();
        let timeout = SyncPolicy::default().signal_timeout_ms * SR as u64 / 1000;

        let plan = sync.plan(&input(0, 0, 1.0, true), None, 0, 1);
        assert_eq!(plan.action, TransportMasterAction::Wait);
        assert_eq!(sync.state(), TransportMasterState::Waiting);

        let plan = sync.plan(&input(timeout - 1, 0, 1.0, true), None, 0, 1);
        assert_eq!(plan.action, TransportMasterAction::Wait);

        let plan = sync.plan(&input(timeout, 0, 1.0, true), None, 0, 1);
        assert_eq!(plan.action, TransportMasterAction::Stop);
    }

    #[test]
    fn test_signal_loss_can_continue_at_last_speed() {
        let policy = SyncPolicy {
            on_signal_lost: LostSignalPolicy::ContinueAtLastSpeed,
            ..Default::default()
        };
        let mut sync = MasterSync::new(policy, SR);
        sync.plan(&input(0, 1000, 0.9, true), reading(1000, 0.9, 0), 0, 1);

        let plan = sync.plan(&input(SR as u64, 1000, 0.9, true), None, 0, 1);
        assert_eq!(plan.action, TransportMasterAction::Wait);

        let plan = sync.plan(&input(2 * SR as u64, 1000, 0.9, true), None, 0, 1);
        assert_eq!(plan.action, TransportMasterAction::Relax);
        assert_relative_eq!(plan.catch_speed, 0.9);
    }

    #[test]
    fn test_unlocked_reading_counts_as_lost() {
        let mut sync = sync();
        let unlocked = Some(MasterReading {
            speed: 1.0,
            position: SamplePosition(0),
            timestamp: 0,
            locked: false,
        });
        let plan = sync.plan(&input(0, 0, 0.0, false), unlocked, 0, 1);
        assert_eq!(plan.action, TransportMasterAction::NoRoll);
        assert_eq!(sync.state(), TransportMasterState::Waiting);
    }
}
