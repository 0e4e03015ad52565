//! Butler: non-real-time transport work
//!
//! The process thread never seeks, flushes or reallocates. It sets
//! [`PostTransportWork`] bits and wakes the butler; the butler does the work
//! on its own thread and clears exactly the bits it satisfied. A wake with
//! nothing pending only refills buffers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use parking_lot::{Condvar, Mutex};
use tl_core::SamplePosition;

use crate::context::TransportContext;
use crate::error::ButlerError;
use crate::locations::Range;
use crate::post_transport::PostTransportWork;

// ═══════════════════════════════════════════════════════════════════════════════
// WORKER
// ═══════════════════════════════════════════════════════════════════════════════

/// Disk-side operations the butler performs on behalf of the transport.
///
/// Every method runs on the butler thread and may block.
pub trait ButlerWorker: Send {
    /// Top up playback buffers and drain capture buffers
    fn refill(&mut self) -> Result<(), ButlerError> {
        Ok(())
    }

    /// Refill playback buffers from `target`
    fn seek(&mut self, _target: SamplePosition) -> Result<(), ButlerError> {
        Ok(())
    }

    /// Commit captured audio after a stop
    fn flush_capture(&mut self) -> Result<(), ButlerError> {
        Ok(())
    }

    /// Throw away captured audio after an aborted stop
    fn discard_capture(&mut self) -> Result<(), ButlerError> {
        Ok(())
    }

    /// Discard and re-read playback buffers in place (playlist edited)
    fn overwrite(&mut self) -> Result<(), ButlerError> {
        Ok(())
    }

    fn adjust_playback_buffering(&mut self) -> Result<(), ButlerError> {
        Ok(())
    }

    fn adjust_capture_buffering(&mut self) -> Result<(), ButlerError> {
        Ok(())
    }

    /// Loop range changed, or playback wrapped
    fn loop_changed(&mut self, _loop_range: Option<Range>) -> Result<(), ButlerError> {
        Ok(())
    }

    /// Playback direction changed
    fn reverse(&mut self, _backwards: bool) -> Result<(), ButlerError> {
        Ok(())
    }

    /// Reset per-stream state after a stop that asked for it
    fn clear_substate(&mut self) -> Result<(), ButlerError> {
        Ok(())
    }
}

/// Worker with no disk streams
#[derive(Debug, Default, Clone, Copy)]
pub struct NullWorker;

impl ButlerWorker for NullWorker {}

// ═══════════════════════════════════════════════════════════════════════════════
// WORK PASS
// ═══════════════════════════════════════════════════════════════════════════════

fn report(what: &str, result: Result<(), ButlerError>) {
    if let Err(e) = result {
        log::error!("Butler {} failed: {}", what, e);
    }
}

/// Perform all pending post-transport work once. Returns the bits handled.
pub(crate) fn service(ctx: &TransportContext, worker: &mut dyn ButlerWorker) -> PostTransportWork {
    let work = ctx.post_transport_work();
    let ptw = &ctx.post_transport_work;

    if work.contains(PostTransportWork::ADJUST_PLAYBACK_BUFFERING) {
        report("playback buffer adjustment", worker.adjust_playback_buffering());
        ptw.clear(PostTransportWork::ADJUST_PLAYBACK_BUFFERING);
    }
    if work.contains(PostTransportWork::ADJUST_CAPTURE_BUFFERING) {
        report("capture buffer adjustment", worker.adjust_capture_buffering());
        ptw.clear(PostTransportWork::ADJUST_CAPTURE_BUFFERING);
    }

    if work.intersects(PostTransportWork::STOP | PostTransportWork::ABORT) {
        if work.contains(PostTransportWork::ABORT) {
            report("capture discard", worker.discard_capture());
        } else {
            report("capture flush", worker.flush_capture());
        }
        if work.contains(PostTransportWork::CLEAR_SUBSTATE) {
            report("substate clear", worker.clear_substate());
        }
        ptw.clear(PostTransportWork::STOP | PostTransportWork::ABORT | PostTransportWork::CLEAR_SUBSTATE);
    }

    if work.contains(PostTransportWork::REVERSE) {
        report("reverse", worker.reverse(ctx.transport_speed() < 0.0));
        ptw.clear(PostTransportWork::REVERSE);
    }

    if work.contains(PostTransportWork::LOOP_CHANGED) {
        let loop_range = ctx.locations().load().loop_range;
        report("loop change", worker.loop_changed(loop_range));
        ptw.clear(PostTransportWork::LOOP_CHANGED);
    }

    if work.contains(PostTransportWork::LOCATE) {
        // A newer locate may land while we seek; chase it until the target
        // holds still. The bit stays set for the whole chase.
        loop {
            let generation = ctx.locate_generation();
            let target = ctx.locate_target();
            report("seek", worker.seek(target));
            if ctx.locate_generation() != generation {
                continue;
            }
            ctx.mark_seeked(generation);
            ptw.clear(PostTransportWork::LOCATE);
            break;
        }
    }

    if work.contains(PostTransportWork::OVERWRITE) {
        report("overwrite", worker.overwrite());
        ptw.clear(PostTransportWork::OVERWRITE);
    }

    if work.contains(PostTransportWork::AUDITION) {
        ptw.clear(PostTransportWork::AUDITION);
    }

    report("refill", worker.refill());

    if !work.is_empty() {
        ctx.butler_pass_completed();
    }
    work
}

// ═══════════════════════════════════════════════════════════════════════════════
// THREAD
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle the process thread uses to summon the butler. Never blocks.
#[derive(Debug, Clone)]
pub struct ButlerWaker {
    tx: Sender<()>,
}

impl ButlerWaker {
    #[inline]
    pub fn wake(&self) {
        // A full slot already means "wake up"
        let _ = self.tx.try_send(());
    }
}

pub(crate) fn wake_channel() -> (ButlerWaker, Receiver<()>) {
    let (tx, rx) = bounded(1);
    (ButlerWaker { tx }, rx)
}

type IdleSignal = Arc<(Mutex<()>, Condvar)>;

pub struct Butler {
    ctx: Arc<TransportContext>,
    waker: ButlerWaker,
    running: Arc<AtomicBool>,
    idle: IdleSignal,
    handle: Option<JoinHandle<()>>,
}

impl Butler {
    pub fn spawn(ctx: Arc<TransportContext>, mut worker: Box<dyn ButlerWorker>) -> Self {
        let (waker, rx) = wake_channel();
        let running = Arc::new(AtomicBool::new(true));
        let idle: IdleSignal = Arc::new((Mutex::new(()), Condvar::new()));
        let period = Duration::from_millis(ctx.config().butler_period_ms.max(1));

        let thread_ctx = Arc::clone(&ctx);
        let thread_running = Arc::clone(&running);
        let thread_idle = Arc::clone(&idle);

        let handle = match thread::Builder::new()
            .name("butler".into())
            .spawn(move || {
                while thread_running.load(Ordering::Acquire) {
                    match rx.recv_timeout(period) {
                        Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if !thread_running.load(Ordering::Acquire) {
                        break;
                    }

                    let handled = service(&thread_ctx, worker.as_mut());
                    if !handled.is_empty() {
                        log::trace!("Butler handled {:?}", handled);
                    }

                    let (lock, condvar) = &*thread_idle;
                    let _guard = lock.lock();
                    condvar.notify_all();
                }
                log::info!("Butler thread exiting");
            }) {
            Ok(handle) => Some(handle),
            Err(e) => {
                log::error!(
                    "Failed to spawn butler thread: {}. Transport work will not complete.",
                    e
                );
                None
            }
        };

        Self {
            ctx,
            waker,
            running,
            idle,
            handle,
        }
    }

    pub fn waker(&self) -> ButlerWaker {
        self.waker.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && self.running.load(Ordering::Acquire)
    }

    /// Block until no post-transport work is pending. Returns `false` on
    /// timeout. Not for the process thread.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let (lock, condvar) = &*self.idle;
        let mut guard = lock.lock();
        while !self.ctx.post_transport_work.is_empty() {
            if condvar.wait_until(&mut guard, deadline).timed_out() {
                return self.ctx.post_transport_work.is_empty();
            }
        }
        true
    }

    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        self.waker.wake();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Butler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
