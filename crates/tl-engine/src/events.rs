//! Session Event Queue
//!
//! Any thread may queue an event through an [`EventSender`]. The process
//! thread owns the single [`EventReceiver`] and drains events whose target
//! sample has come due, earliest first, insertion order breaking ties.
//! Ties keep insertion order per sender clone; two threads racing for the
//! same target land in whichever order the channel accepted them.
//!
//! Events are `Copy` and the receiver's pending list is preallocated at
//! twice the channel bound, so draining does not allocate unless future
//! events pile up past that.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tl_core::SamplePosition;

use crate::error::{RequestError, RequestResult};
use crate::fsm::LocateRequest;
use crate::master::SyncSource;

/// Where a request came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestSource {
    Ui,
    /// MIDI Machine Control
    Mmc,
    /// Control surfaces and OSC bridges
    ControlSurface,
    Script,
    /// The active transport master
    TransportMaster,
    /// The engine itself (loop wraps, auto-return, xrun policy)
    Engine,
}

impl RequestSource {
    /// Sources that the external-master lockout applies to
    pub fn is_local(self) -> bool {
        !matches!(self, RequestSource::TransportMaster | RequestSource::Engine)
    }
}

/// What an event asks the transport to do
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventAction {
    /// Start rolling at the default play speed
    Roll,
    Stop { abort: bool, clear_state: bool },
    Locate(LocateRequest),
    /// Locate to `start`, roll, and return to `return_to` on the next stop
    LocateRollLocate {
        start: SamplePosition,
        return_to: SamplePosition,
    },
    /// Locate to `start`, roll, and stop at `end`
    BoundedRoll {
        start: SamplePosition,
        end: SamplePosition,
    },
    /// Varispeed; 0.0 stops
    SetSpeed(f64),
    SetDefaultPlaySpeed(f64),
    SetPlayLoop { enabled: bool, leave_rolling: bool },
    SetSyncSource(SyncSource),
    SetRecordEnabled(bool),
    /// Play the published play ranges in order, then stop unless
    /// `leave_rolling`
    PlayRanges { leave_rolling: bool },
    /// Drop the active play range and keep rolling
    CancelPlayRange,
    /// Roll from `preroll` samples before `start` with recording held off
    /// until `start`
    PrerollRecord { start: SamplePosition, preroll: u64 },
    /// Loop range was edited
    LoopRangeChanged,
    Overwrite,
    AdjustPlaybackBuffering,
    AdjustCaptureBuffering,
}

/// One queued request. Immutable once queued.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionEvent {
    pub action: EventAction,
    /// Due once the cycle covering this sample runs
    pub target_sample: SamplePosition,
    pub origin: RequestSource,
    seq: u64,
}

impl SessionEvent {
    /// Target used for "as soon as possible"
    pub const IMMEDIATE: SamplePosition = SamplePosition::ZERO;

    pub fn immediate(action: EventAction, origin: RequestSource) -> Self {
        Self::at(Self::IMMEDIATE, action, origin)
    }

    pub fn at(target_sample: SamplePosition, action: EventAction, origin: RequestSource) -> Self {
        Self {
            action,
            target_sample,
            origin,
            seq: 0,
        }
    }

    /// Arrival order assigned by the queue
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[inline]
    fn key(&self) -> (SamplePosition, u64) {
        (self.target_sample, self.seq)
    }
}

/// Create a queue holding up to `capacity` undelivered events
pub fn session_event_queue(capacity: usize) -> (EventSender, EventReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = bounded(capacity);
    (
        EventSender {
            tx,
            seq: Arc::new(AtomicU64::new(0)),
        },
        EventReceiver {
            rx,
            pending: Vec::with_capacity(capacity * 2),
        },
    )
}

/// Producer side; cheap to clone, usable from any thread
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<SessionEvent>,
    seq: Arc<AtomicU64>,
}

impl EventSender {
    /// Queue an event without blocking. Fails only when the queue is full or
    /// the process side is gone.
    ///
    /// Events with equal targets apply in the order one sender clone queued
    /// them. Across threads the order is whatever the channel saw. A refused
    /// event still consumes a sequence number.
    pub fn queue_event(&self, mut event: SessionEvent) -> RequestResult {
        event.seq = self.seq.fetch_add(1, Ordering::Relaxed);
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(RequestError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(RequestError::EngineHalted),
        }
    }
}

/// Consumer side, owned by the process thread
#[derive(Debug)]
pub struct EventReceiver {
    rx: Receiver<SessionEvent>,
    /// Sorted by descending (target, seq) so `pop()` yields the next due event
    pending: Vec<SessionEvent>,
}

impl EventReceiver {
    /// Move every newly arrived event into the sorted pending list.
    ///
    /// The channel is always emptied so a due event never waits behind
    /// future ones. The list only grows past its preallocation when more
    /// future events pile up than the channel itself can hold.
    fn collect(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(event) => {
                    let key = event.key();
                    let idx = self.pending.partition_point(|e| e.key() > key);
                    self.pending.insert(idx, event);
                }
                Err(_) => break,
            }
        }
    }

    /// Hand every event with `target_sample <= cycle_end` to `apply`, in
    /// ascending target order. Returns how many were applied.
    pub fn drain_due(
        &mut self,
        cycle_end: SamplePosition,
        mut apply: impl FnMut(SessionEvent),
    ) -> usize {
        let mut applied = 0;
        loop {
            self.collect();
            match self.pending.last() {
                Some(next) if next.target_sample <= cycle_end => {
                    if let Some(event) = self.pending.pop() {
                        apply(event);
                        applied += 1;
                    }
                }
                _ => break,
            }
        }
        applied
    }

    /// Discard everything queued (engine halt)
    pub fn clear(&mut self) -> usize {
        let mut dropped = self.pending.len();
        self.pending.clear();
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    /// Events waiting for a later cycle
    pub fn pending_len(&mut self) -> usize {
        self.collect();
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn targets(rx: &mut EventReceiver, cycle_end: u64) -> Vec<u64> {
        let mut out = Vec::new();
        rx.drain_due(SamplePosition(cycle_end), |e| out.push(e.target_sample.0));
        out
    }

    #[test]
    fn test_drains_in_target_order() {
        let (tx, mut rx) = session_event_queue(16);
        for t in [100, 50] {
            tx.queue_event(SessionEvent::at(
                SamplePosition(t),
                EventAction::Overwrite,
                RequestSource::Ui,
            ))
            .unwrap();
        }
        assert_eq!(targets(&mut rx, 255), vec![50, 100]);
    }

    #[test]
    fn test_equal_targets_are_fifo() {
        let (tx, mut rx) = session_event_queue(16);
        for speed in [1.0, 2.0, 0.5] {
            tx.queue_event(SessionEvent::immediate(
                EventAction::SetSpeed(speed),
                RequestSource::Script,
            ))
            .unwrap();
        }

        let mut speeds = Vec::new();
        rx.drain_due(SamplePosition(0), |e| {
            if let EventAction::SetSpeed(s) = e.action {
                speeds.push(s);
            }
        });
        assert_eq!(speeds, vec![1.0, 2.0, 0.5]);
    }

    #[test]
    fn test_future_events_stay_queued() {
        let (tx, mut rx) = session_event_queue(16);
        tx.queue_event(SessionEvent::at(
            SamplePosition(1000),
            EventAction::Roll,
            RequestSource::Ui,
        ))
        .unwrap();

        assert!(targets(&mut rx, 511).is_empty());
        assert_eq!(rx.pending_len(), 1);
        assert_eq!(targets(&mut rx, 1023), vec![1000]);
        assert_eq!(rx.pending_len(), 0);
    }

    #[test]
    fn test_full_queue_refuses() {
        let (tx, _rx) = session_event_queue(2);
        let ev = SessionEvent::immediate(EventAction::Roll, RequestSource::Ui);
        tx.queue_event(ev).unwrap();
        tx.queue_event(ev).unwrap();
        assert_eq!(tx.queue_event(ev), Err(RequestError::QueueFull));
    }

    #[test]
    fn test_disconnected_receiver_reports_halt() {
        let (tx, rx) = session_event_queue(2);
        drop(rx);
        let ev = SessionEvent::immediate(EventAction::Roll, RequestSource::Ui);
        assert_eq!(tx.queue_event(ev), Err(RequestError::EngineHalted));
    }

    #[test]
    fn test_many_producers_one_consumer() {
        let (tx, mut rx) = session_event_queue(1024);
        let handles: Vec<_> = (0..4u64)
            .map(|p| {
                let tx = tx.clone();
                thread::spawn(move || {
                    for i in 0..100u64 {
                        tx.queue_event(SessionEvent::at(
                            SamplePosition(p * 1000 + i),
                            EventAction::Overwrite,
                            RequestSource::Script,
                        ))
                        .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let drained = targets(&mut rx, u64::MAX);
        assert_eq!(drained.len(), 400);
        assert!(drained.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_immediate_event_not_stuck_behind_future_ones() {
        let (tx, mut rx) = session_event_queue(2);
        let later = SessionEvent::at(
            SamplePosition(1_000_000),
            EventAction::Roll,
            RequestSource::Ui,
        );
        tx.queue_event(later).unwrap();
        tx.queue_event(later).unwrap();
        assert_eq!(rx.drain_due(SamplePosition(255), |_| {}), 0);

        tx.queue_event(SessionEvent::immediate(
            EventAction::Stop {
                abort: false,
                clear_state: false,
            },
            RequestSource::Ui,
        ))
        .unwrap();
        let mut stops = 0;
        let applied = rx.drain_due(SamplePosition(511), |e| {
            if matches!(e.action, EventAction::Stop { .. }) {
                stops += 1;
            }
        });
        assert_eq!(applied, 1);
        assert_eq!(stops, 1);
        assert_eq!(rx.pending_len(), 2);
    }

    #[test]
    fn test_future_events_beyond_channel_bound_are_kept() {
        let (tx, mut rx) = session_event_queue(2);
        for round in 0..3u64 {
            for i in 0..2u64 {
                tx.queue_event(SessionEvent::at(
                    SamplePosition(10_000 + round * 10 + i),
                    EventAction::Overwrite,
                    RequestSource::Script,
                ))
                .unwrap();
            }
            assert!(targets(&mut rx, 0).is_empty());
        }
        assert_eq!(rx.pending_len(), 6);
        assert_eq!(
            targets(&mut rx, 20_000),
            vec![10_000, 10_001, 10_010, 10_011, 10_020, 10_021]
        );
    }

    #[test]
    fn test_refused_event_keeps_sender_order() {
        let (tx, mut rx) = session_event_queue(2);
        let speed = |s| SessionEvent::immediate(EventAction::SetSpeed(s), RequestSource::Script);
        tx.queue_event(speed(1.0)).unwrap();
        tx.queue_event(speed(2.0)).unwrap();
        assert_eq!(tx.queue_event(speed(3.0)), Err(RequestError::QueueFull));
        rx.pending_len();
        tx.queue_event(speed(0.5)).unwrap();

        let mut speeds = Vec::new();
        rx.drain_due(SamplePosition(0), |e| {
            if let EventAction::SetSpeed(s) = e.action {
                speeds.push(s);
            }
        });
        assert_eq!(speeds, vec![1.0, 2.0, 0.5]);
    }

    #[test]
    fn test_clear_discards_everything() {
        let (tx, mut rx) = session_event_queue(8);
        let ev = SessionEvent::at(SamplePosition(10_000), EventAction::Roll, RequestSource::Ui);
        tx.queue_event(ev).unwrap();
        rx.pending_len();
        tx.queue_event(ev).unwrap();

        assert_eq!(rx.clear(), 2);
        assert_eq!(rx.pending_len(), 0);
    }
}
