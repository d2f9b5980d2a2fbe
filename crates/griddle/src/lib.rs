//! # Griddle
//!
//! A slot-based scheduling engine that multiplexes many concurrent inference
//! requests over a small, fixed pool of execution slots sharing one model and
//! one key-value cache.
//!
//! ## Overview
//!
//! Callers submit [`Task`]s to a [`ServerHandle`] from any thread. A single
//! background scheduler loop owns the [`Engine`] and every slot: each
//! iteration it assigns queued tasks to slots, composes one batch out of all
//! slots that have work (pending tokens of generating slots and chunks of
//! prompts still being processed), invokes the engine once, and routes each
//! output back to its task as a [`TaskResult`].
//!
//! Key properties:
//!
//! - Exactly one final result per admitted task, whatever happens
//! - A prompt that starts like a previous one skips the shared prefix, either
//!   by landing on the slot that still holds it or by restoring a retained
//!   checkpoint of engine state
//! - A failing or panicking request fails alone; the other slots keep going
//! - Cancellation frees a slot at the next iteration
//!
//! ## Architecture
//!
//! ### Engine
//!
//! The [`Engine`] trait is the only boundary to the model. It decodes a
//! [`Batch`](engine::Batch), and saves, restores and truncates the cached
//! state of one sequence. Nothing above it touches tensors.
//!
//! ### Slots
//!
//! A slot moves through [`SlotState`]: idle, prefilling its prompt,
//! generating, and back to idle. Its cache outlives the task so the next task
//! can reuse it. Slot state is published as a copied [`SlotSnapshot`] after
//! every iteration; readers never see live state.
//!
//! ### Routing
//!
//! With the `router` feature, an [`InstanceRouter`] maintains one server per
//! model, spawning on first use with concurrent requests sharing the spawn,
//! and stopping instances that were unloaded or have gone idle.
//!
//! ## Features
//!
//! - **router** - Enables the multi-model [`InstanceRouter`] (default)
//!
//! ## Logging
//!
//! The crate emits [`tracing`] events with `slot` and `task_id` fields. It
//! never installs a subscriber; that is left to the application.

mod communication;
mod core;
mod sampling;
mod server;

pub mod config;
pub mod engine;
pub mod error;
pub mod task;
pub mod tokens;

#[cfg(feature = "router")]
pub mod router;

pub use communication::ResultStream;
pub use config::{RouterConfig, ServerConfig};
pub use crate::core::slot::{SlotSnapshot, SlotState};
pub use crate::core::{Metrics, ServerSnapshot};
pub use engine::Engine;
pub use error::{EngineError, Result, ServerError, SpawnError, TaskError};
pub use sampling::Sampler;
pub use server::{HealthState, ServerHandle};
pub use task::{Payload, SamplingParams, StopReason, Task, TaskId, TaskKind, TaskResult, Timings};
pub use tokens::{MediaChunk, TokenId, TokenSequence, Unit};

#[cfg(feature = "router")]
pub use error::RouteError;
#[cfg(feature = "router")]
pub use router::{InstanceRouter, InstanceSpawner, InstanceState, Reaper};
