//! Transport assembly
//!
//! Wires the shared context, the event queue, the notification ring, the
//! butler thread and the process engine together. The caller gets back one
//! piece per thread: the [`ProcessEngine`] goes to the audio callback, the
//! [`Transport`] handle and the [`NotificationReceiver`] to the UI side.

use std::sync::Arc;

use tl_core::TlResult;

use crate::butler::{Butler, ButlerWorker, NullWorker};
use crate::config::TransportConfig;
use crate::context::TransportContext;
use crate::events::session_event_queue;
use crate::master::TransportMaster;
use crate::notify::{NotificationReceiver, notification_channel};
use crate::process::ProcessEngine;
use crate::transport::Transport;

/// Everything a running transport consists of
pub struct TransportSession {
    /// Real-time side; move into the audio callback
    pub process: ProcessEngine,
    /// Request/query handle; clone freely
    pub transport: Transport,
    /// Drained by the UI or control thread
    pub notifications: NotificationReceiver,
    /// Dropping it stops the butler thread
    pub butler: Butler,
}

pub struct TransportEngine;

impl TransportEngine {
    pub fn builder(config: TransportConfig) -> TransportBuilder {
        TransportBuilder {
            config,
            masters: Vec::new(),
            worker: None,
        }
    }
}

pub struct TransportBuilder {
    config: TransportConfig,
    masters: Vec<Box<dyn TransportMaster>>,
    worker: Option<Box<dyn ButlerWorker>>,
}

impl TransportBuilder {
    /// Register an external clock the transport can be told to follow
    pub fn with_master(mut self, master: Box<dyn TransportMaster>) -> Self {
        self.masters.push(master);
        self
    }

    /// Disk-side worker for the butler; defaults to one that does nothing
    pub fn with_butler_worker(mut self, worker: Box<dyn ButlerWorker>) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn build(self) -> TlResult<TransportSession> {
        self.config.validate()?;

        let ctx = Arc::new(TransportContext::new(self.config));
        let config = ctx.config();
        let (events_tx, events_rx) = session_event_queue(config.event_queue_capacity);
        let (outbox, notifications) = notification_channel(config.notification_capacity);

        let worker = self.worker.unwrap_or_else(|| Box::new(NullWorker));
        let butler = Butler::spawn(Arc::clone(&ctx), worker);

        let mut process = ProcessEngine::new(Arc::clone(&ctx), events_rx, outbox, butler.waker());
        for master in self.masters {
            process.add_master(master);
        }

        log::info!(
            "Transport ready: {} Hz, {} frame blocks, {} sample declick",
            config.sample_rate,
            config.block_size,
            config.declick_samples()
        );

        Ok(TransportSession {
            process,
            transport: Transport::new(ctx, events_tx),
            notifications,
            butler,
        })
    }
}
