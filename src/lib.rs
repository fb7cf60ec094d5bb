//! Lock-free containers for passing messages between threads of one
//! process.
//!
//! Three multi-producer containers are provided, differing in the order
//! consumers observe:
//!
//! - [`Stack`]: unbounded LIFO; pushers and pullers race on a single
//!   CAS word, last writer wins.
//! - [`BatchQueue`]: producers push one value at a time; a consumer
//!   atomically detaches the whole backlog as a [`Drain`] batch and
//!   walks it in insertion order.
//! - [`Queue`]: unbounded MPMC FIFO based on the Michael-Scott
//!   algorithm, with tagged head/tail pointers against ABA and a
//!   bounded quarantine so stale readers never touch freed memory.
//!
//! All operations are lock-free: an individual call may retry under
//! contention, but some thread always makes progress, and nothing ever
//! blocks except the optional `pull_wait` helpers, which sleep between
//! retries and honor each container's `finish_waiting` shutdown flag.
//!
//! The containers create no threads and take no locks. Length counters
//! are advisory: they are maintained with relaxed atomics and only
//! exact when the container is quiescent.
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use std::thread;
//!
//! use handoff::Queue;
//!
//! let queue = Arc::new(Queue::new());
//!
//! let producer = {
//!     let queue = Arc::clone(&queue);
//!     thread::spawn(move || {
//!         for i in 0..100 {
//!             queue.push(i);
//!         }
//!     })
//! };
//!
//! let mut received = 0;
//! while received < 100 {
//!     if let Some(value) = queue.pull() {
//!         assert_eq!(value, received);
//!         received += 1;
//!     }
//! }
//! producer.join().unwrap();
//! assert!(queue.is_empty());
//! ```
//!
//! # Pointer width
//!
//! The FIFO packs each pointer with a 16-bit generation counter into
//! one 64-bit word and therefore requires user-space addresses to fit
//! in 48 bits, which holds on current mainstream 64-bit platforms.
//! Wider addresses trip a debug assertion.

mod batch;
mod node;
mod quarantine;
mod queue;
mod stack;
mod sync;
mod tagged;

pub use crate::batch::{BatchQueue, Drain};
pub use crate::queue::Queue;
pub use crate::stack::Stack;
