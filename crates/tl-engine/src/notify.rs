//! Notification outbox
//!
//! The process thread stages notifications while it runs a cycle and pushes
//! them into an SPSC ring once the cycle's bookkeeping is done. Observers
//! (clocks, meters, remote surfaces) drain the ring on their own schedule, so
//! no observer code ever runs inside the audio callback.

use rtrb::{Consumer, Producer, RingBuffer};
use tl_core::SamplePosition;

use crate::context::{RecordState, TransportState};
use crate::error::RequestError;
use crate::master::{SyncSource, TransportMasterState};

/// Something that already happened to the transport
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransportNotification {
    /// Non-linear position change (locate, loop wrap)
    PositionChanged(SamplePosition),
    TransportStateChanged(TransportState),
    SpeedChanged(f64),
    /// A locate has fully completed
    Located(SamplePosition),
    /// Playhead wrapped from loop end to loop start
    Looped(SamplePosition),
    /// A play-range request started or ended
    PlayRange { active: bool },
    RecordStateChanged(RecordState),
    Xrun { count: u64 },
    SyncSourceChanged(SyncSource),
    SyncStateChanged(TransportMasterState),
    /// A queued request turned out to be illegal when it came due
    RequestRefused(RequestError),
    /// Route processing reported a fault; `count` is the running total
    RouteFault { count: u64 },
    EngineHalted,
    EngineReengaged,
}

pub(crate) fn notification_channel(capacity: usize) -> (NotificationOutbox, NotificationReceiver) {
    let capacity = capacity.max(16);
    let (producer, consumer) = RingBuffer::new(capacity);
    (
        NotificationOutbox {
            staged: Vec::with_capacity(64),
            producer,
            dropped: 0,
        },
        NotificationReceiver { consumer },
    )
}

/// Process-thread side
pub(crate) struct NotificationOutbox {
    staged: Vec<TransportNotification>,
    producer: Producer<TransportNotification>,
    dropped: u64,
}

impl NotificationOutbox {
    /// Hold a notification until the end of the cycle
    #[inline]
    pub fn stage(&mut self, notification: TransportNotification) {
        if self.staged.len() < self.staged.capacity() {
            self.staged.push(notification);
        } else {
            self.dropped += 1;
        }
    }

    /// Publish everything staged this cycle. Returns how many were delivered.
    pub fn flush(&mut self) -> usize {
        let mut delivered = 0;
        for notification in self.staged.drain(..) {
            match self.producer.push(notification) {
                Ok(()) => delivered += 1,
                Err(_) => self.dropped += 1,
            }
        }
        delivered
    }

    /// Notifications lost to a full ring or staging area
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear_staged(&mut self) {
        self.staged.clear();
    }
}

/// Observer side
pub struct NotificationReceiver {
    consumer: Consumer<TransportNotification>,
}

impl NotificationReceiver {
    pub fn try_recv(&mut self) -> Option<TransportNotification> {
        self.consumer.pop().ok()
    }

    /// Hand every waiting notification to `handler`
    pub fn drain(&mut self, mut handler: impl FnMut(TransportNotification)) -> usize {
        let mut count = 0;
        while let Ok(notification) = self.consumer.pop() {
            handler(notification);
            count += 1;
        }
        count
    }

    pub fn drain_to_vec(&mut self) -> Vec<TransportNotification> {
        let mut out = Vec::with_capacity(self.consumer.slots());
        self.drain(|n| out.push(n));
        out
    }

    pub fn is_empty(&self) -> bool {
        self.consumer.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nothing_visible_until_flush() {
        let (mut outbox, mut rx) = notification_channel(16);
        outbox.stage(TransportNotification::Located(SamplePosition(10)));
        assert!(rx.is_empty());

        assert_eq!(outbox.flush(), 1);
        assert_eq!(
            rx.drain_to_vec(),
            vec![TransportNotification::Located(SamplePosition(10))]
        );
    }

    #[test]
    fn test_full_ring_counts_drops() {
        let (mut outbox, mut rx) = notification_channel(16);
        for i in 0..20 {
            outbox.stage(TransportNotification::Xrun { count: i });
        }
        assert_eq!(outbox.flush(), 16);
        assert_eq!(outbox.dropped(), 4);
        assert_eq!(rx.drain(|_| {}), 16);
    }
}
