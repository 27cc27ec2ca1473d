// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cooperative multitasking on a single thread with stackful tasks.
//!
//! A [`Scheduler`] owns a FIFO queue of ready [`Task`]s. Every task runs on its own stack and keeps
//! running until it explicitly hands control back, either by calling [`Task::yield_now`] (it goes to
//! the back of the queue) or [`Task::exit`] (it is gone for good). Returning from the task body is
//! the same as calling `exit`. Because there is no preemption, a task that never yields starves every
//! other task on the scheduler.
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use strand::{Scheduler, Task};
//!
//! let seen = Rc::new(RefCell::new(Vec::new()));
//! let sched = Scheduler::open();
//!
//! for value in [44, 66] {
//!     let seen = seen.clone();
//!     sched
//!         .spawn(move |task: &Task| {
//!             for _ in 0..3 {
//!                 seen.borrow_mut().push(value);
//!                 task.yield_now().unwrap();
//!             }
//!         })
//!         .unwrap();
//! }
//!
//! let stats = sched.run();
//! assert_eq!(*seen.borrow(), [44, 66, 44, 66, 44, 66]);
//! assert_eq!(stats.exits, 2);
//! sched.shutdown();
//! ```

mod config;
mod error;
mod scheduler;
pub mod task;

pub use config::{Config, DEFAULT_STACK_SIZE};
pub use error::{SpawnError, SwapError};
pub use scheduler::{RunStats, Scheduler};
pub use task::{Id, Status, Task, TaskBuilder};
