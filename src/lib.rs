//! # Battuta
//!
//! **Battuta** is a thread-per-dispatcher event-dispatch core for
//! systems software: the foundation protocol clients, RPC runtimes and
//! I/O services are built on.
//!
//! Unlike a general-purpose async runtime, Battuta keeps the classic
//! blocking model: every dispatcher owns one OS thread and a FIFO work
//! queue, and everything posted to it runs serially on that thread, in
//! post order. Three tightly coupled pieces share that contract:
//!
//! - A **[`Dispatcher`]** with non-blocking [`post`] and synchronous
//!   [`send`] delivery, plus in-queue cancellation
//! - A **[`Selector`]**, a dispatcher whose loop multiplexes
//!   file-descriptor readiness via `poll(2)` and a wake pipe
//! - A **[`Timer`]** that fires one-shot or repeating notifications at
//!   a fixed tick resolution, as event posts or direct callbacks
//!
//! An [`FdBinder`] rounds this out by tying an open descriptor to a
//! selector with a listener and a readiness mask.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use battuta::{Dispatcher, EventDispatcher, FnEvent, FnEventReceiver, EventId};
//! use std::sync::Arc;
//!
//! let dispatcher = Dispatcher::new("worker");
//! let receiver = Arc::new(FnEventReceiver);
//!
//! let event = FnEvent::new(EventId::FIRST_USER, &receiver, || {
//!     println!("ran on the worker thread");
//! });
//! dispatcher.post(event, receiver.clone()).unwrap();
//! dispatcher.shutdown().unwrap();
//! ```
//!
//! ## Modules
//!
//! - [`event`] — events, receivers and their identities
//! - [`dispatch`] — the dispatcher and the `EventDispatcher` capability set
//! - [`selector`] — readiness multiplexing and the poll-mask constants
//! - [`timer`] — timed and periodic dispatch
//! - [`fd`] — descriptor binding
//!
//! [`post`]: EventDispatcher::post
//! [`send`]: EventDispatcher::send

mod sys;

pub mod dispatch;
pub mod error;
pub mod event;
pub mod fd;
pub mod selector;
pub mod timer;

pub use dispatch::{Dispatcher, DispatcherRef, EventDispatcher};
pub use error::DispatchError;
pub use event::{
    receiver_key, Event, EventId, EventReceiver, EventRef, FnEvent, FnEventReceiver,
    ReceiverKey, ReceiverRef,
};
pub use fd::FdBinder;
pub use selector::{Selector, SelectorListener, MAX_POLL_FDS};
pub use timer::{Timer, TimerListener};
