//! tl-engine: Transport control for the Tideline engine
//!
//! Provides:
//! - Transport state machine with declicked starts, stops and locates
//! - Sample-accurate session events from any thread
//! - Butler thread for seeks, flushes and buffer refills
//! - Loop playback (seamless or locate-based) and bounded rolls
//! - Following external masters (engine, LTC, MTC, MIDI clock)
//! - Lock-free state queries and notifications

// Boxed trait objects for masters and workers are intentional
#![allow(clippy::type_complexity)]

mod butler;
mod config;
mod context;
mod declick;
mod engine;
mod error;
mod events;
mod feeds;
mod fsm;
mod locations;
mod master;
mod notify;
mod post_transport;
mod process;
mod transport;

pub use butler::{Butler, ButlerWaker, ButlerWorker, NullWorker};
pub use config::*;
pub use context::*;
pub use declick::*;
pub use engine::*;
pub use error::*;
pub use events::*;
pub use feeds::*;
pub use fsm::*;
pub use locations::*;
pub use master::*;
pub use notify::{NotificationReceiver, TransportNotification};
pub use post_transport::*;
pub use process::*;
pub use transport::*;
