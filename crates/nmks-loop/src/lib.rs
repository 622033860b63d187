//! nmks event loop
//!
//! Runs a client that must only ever be touched from one thread on a
//! dedicated background thread, and bridges calls from async tasks into
//! it.
//!
//! ```text
//!  tokio tasks                          loop thread
//! ┌────────────┐  LoopHandle::run(f)  ┌─────────────────────┐
//! │  caller    │ ───────────────────▶ │ FIFO job queue      │
//! │            │                      │  assert_owner()     │
//! │  Pending   │ ◀─────────────────── │  f(&mut S, handle)  │
//! └────────────┘   Promise::resolve   └─────────────────────┘
//! ```
//!
//! The loop-confined state `S` is created on the loop thread and never
//! leaves it, so it does not have to be `Send`.

mod event_loop;
mod promise;

pub use event_loop::{EventLoop, Job, LoopError, LoopHandle};
pub use promise::{Pending, Promise, promise};
