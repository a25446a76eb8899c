//! Task Reactor - single-threaded cooperative task queue
//!
//! Producers on any thread post tasks through a [`ReactorHandle`]; the
//! [`Reactor`] executes them one at a time, in arrival order, on the task
//! that awaits [`Reactor::run`]. Delayed tasks are held until their deadline
//! and then queued behind whatever is already ready.
//!
//! The run ends when the [`StopSignal`] latch is set, either by a task or by
//! an outside party (e.g. a Ctrl-C handler).
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use task_reactor::{Reactor, ReactorHandle, TaskHandler};
//!
//! enum Job {
//!     Greet(String),
//!     Quit,
//! }
//!
//! struct Greeter;
//!
//! impl TaskHandler<Job> for Greeter {
//!     type Error = std::convert::Infallible;
//!
//!     fn handle(&mut self, job: Job, reactor: &ReactorHandle<Job>) -> Result<(), Self::Error> {
//!         match job {
//!             Job::Greet(name) => println!("hello {}", name),
//!             Job::Quit => reactor.stop(),
//!         }
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let reactor = Reactor::new();
//!     let handle = reactor.handle();
//!     handle.schedule(Job::Greet("world".into()));
//!     handle.schedule_in(Job::Quit, Duration::from_millis(500));
//!     let stats = reactor.run(&mut Greeter).await;
//!     println!("executed {} tasks", stats.executed);
//! }
//! ```

mod reactor;
mod signal;

pub use reactor::{Reactor, ReactorHandle, RunStats, TaskHandler};
pub use signal::StopSignal;
