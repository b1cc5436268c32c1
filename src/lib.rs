//! kiln — a local LLM inference server.
//!
//! Requests come in over HTTP and are served by external runner processes
//! that hold model weights in GPU/CPU memory. The heart of the crate is the
//! [`sched`] module: it decides when to load, share, evict, and unload
//! runners given the devices [`discover`] reports, the VRAM predictions
//! [`estimate`] makes, and the keep-alive and concurrency limits in
//! [`settings`].

pub mod discover;
pub mod error;
pub mod estimate;
pub mod model;
pub mod runner;
pub mod sched;
pub mod server;
pub mod settings;

pub use error::{KilnError, Result};
pub use sched::{Lease, Scheduler, SchedulerConfig};
pub use settings::Settings;
