//! Channels between submitters and the scheduler: the task queue going in,
//! per-task result channels coming out.

mod item_stream;
mod pill;
mod queue;
mod queue_item;
mod results;

pub use item_stream::ResultStream;
pub(crate) use pill::Pill;
pub(crate) use queue::TaskQueue;
pub(crate) use queue_item::{QueueItem, ResultSender};
pub(crate) use results::ResultRegistry;
