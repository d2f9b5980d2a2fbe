//! # Core scheduling
//!
//! The slot pool and the loop that drives it.
//!
//! ## Module Structure
//!
//! * [`slot`] - Execution lanes and their per-request state machine.
//!
//! * `batch` - Composes one engine invocation out of every slot that has
//!   work: pending tokens of generating slots first, then prompt chunks.
//!
//! * `checkpoint` - Retained engine state snapshots keyed by token prefix,
//!   reused when a later prompt starts with the same tokens.
//!
//! * `slot_file` - On-disk format for the save and restore slot operations.
//!
//! * `scheduler` - The loop. It is the only code that touches slots,
//!   checkpoints or the engine.
//!
//! * `worker` - Spawns the loop as a background task and stops it, politely
//!   the first time and forcibly the second.

pub mod slot;
mod batch;
mod checkpoint;
mod scheduler;
mod slot_file;
mod worker;

pub use scheduler::{Metrics, ServerSnapshot};
pub(crate) use scheduler::Scheduler;
pub(crate) use slot_file::validate_filename;
pub(crate) use worker::WorkerHandle;
