//! A preemptive real-time kernel for deeply-embedded single-processor
//! microcontrollers.
//!
//! This crate implements the core of the kernel: the scheduler, thread
//! control blocks, mutexes with priority inheritance and priority ceiling,
//! counting semaphores, condition variables, a software timer supervisor,
//! bounded FIFO/priority queues, and a POSIX-flavoured signal subsystem.
//! Everything here shares one run-queue, one tick clock, and one set of
//! block/unblock invariants.
//!
//! Architecture-specific context save/restore, chip bring-up, and device
//! drivers are not part of this crate. It consumes two things from the host
//! application: an implementation of [`port::Port`] (stack initialization and
//! the context-switch request primitive) and a periodic call to
//! [`scheduler::Kernel::on_tick`] from a tick source.
#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), deny(unsafe_op_in_unsafe_fn))]

extern crate alloc;

pub mod config;
pub mod critical;
pub mod error;
pub mod port;
pub mod priobitmap;
pub mod scheduler;
pub mod thread;
pub mod tick;
pub mod utils;
pub mod wait;

pub mod condvar;
pub mod mutex;
pub mod queue;
pub mod semaphore;
pub mod timer;

#[cfg(feature = "signals")]
pub mod signal;

pub use error::Error;
pub use tick::{Duration, Tick};
