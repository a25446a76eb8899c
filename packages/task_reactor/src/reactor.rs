use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, VecDeque};
use std::fmt::Display;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::signal::StopSignal;

/// Executes tasks on behalf of a [`Reactor`].
///
/// `handle` runs on the reactor's execution context and must not block.
/// It may schedule further tasks through `reactor`.
pub trait TaskHandler<T> {
    type Error: Display;

    fn handle(&mut self, task: T, reactor: &ReactorHandle<T>) -> Result<(), Self::Error>;
}

/// Counters describing a finished run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Tasks handed to the handler
    pub executed: u64,
    /// Tasks whose handler returned an error or panicked
    pub failed: u64,
    /// Tasks still queued or pending when the run ended
    pub dropped: usize,
}

struct Scheduled<T> {
    task: T,
    due: Option<Instant>,
}

struct Timer<T> {
    due: Instant,
    seq: u64,
    task: T,
}

impl<T> PartialEq for Timer<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<T> Eq for Timer<T> {}

impl<T> PartialOrd for Timer<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Timer<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due
            .cmp(&other.due)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Producer side of a reactor. Cheap to clone and safe to use from any thread.
pub struct ReactorHandle<T> {
    sender: mpsc::UnboundedSender<Scheduled<T>>,
    stop: StopSignal,
}

impl<T> Clone for ReactorHandle<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            stop: self.stop.clone(),
        }
    }
}

impl<T> ReactorHandle<T> {
    /// Queue a task to run as soon as everything ahead of it has run
    pub fn schedule(&self, task: T) {
        self.post(Scheduled { task, due: None });
    }

    /// Queue a task to run no earlier than `delay` from now
    pub fn schedule_in(&self, task: T, delay: Duration) {
        let due = if delay.is_zero() {
            None
        } else {
            Some(Instant::now() + delay)
        };
        self.post(Scheduled { task, due });
    }

    /// Set the stop latch. The run returns once it observes it.
    pub fn stop(&self) {
        self.stop.set();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_set()
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    fn post(&self, scheduled: Scheduled<T>) {
        if self.sender.send(scheduled).is_err() {
            debug!("Reactor is gone, dropping task");
        }
    }
}

/// Single-threaded cooperative task queue.
///
/// Zero-delay tasks run in FIFO order. Delayed tasks wait in a deadline heap
/// (ties broken by arrival) and join the back of the ready queue once due.
pub struct Reactor<T> {
    inbox: mpsc::UnboundedReceiver<Scheduled<T>>,
    handle: ReactorHandle<T>,
    ready: VecDeque<T>,
    timers: BinaryHeap<Reverse<Timer<T>>>,
    next_seq: u64,
}

impl<T> Default for Reactor<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Reactor<T> {
    pub fn new() -> Self {
        let (sender, inbox) = mpsc::unbounded_channel();
        Self {
            inbox,
            handle: ReactorHandle {
                sender,
                stop: StopSignal::new(),
            },
            ready: VecDeque::new(),
            timers: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn handle(&self) -> ReactorHandle<T> {
        self.handle.clone()
    }

    /// Run tasks until the stop latch is set.
    ///
    /// Once the latch is observed, tasks already queued and due are still
    /// executed; anything scheduled after that point and every pending
    /// delayed task is dropped.
    pub async fn run<H: TaskHandler<T>>(mut self, handler: &mut H) -> RunStats {
        let stop = self.handle.stop_signal();
        let mut stats = RunStats::default();

        loop {
            if stop.is_set() {
                self.drain_inbox();
                self.promote_due(Instant::now());
                let remaining: Vec<T> = self.ready.drain(..).collect();
                for task in remaining {
                    self.execute(handler, task, &mut stats);
                }
                break;
            }

            self.drain_inbox();
            self.promote_due(Instant::now());

            if let Some(task) = self.ready.pop_front() {
                self.execute(handler, task, &mut stats);
                // Other tasks on this runtime get a turn between handlers
                tokio::task::yield_now().await;
                continue;
            }

            let next_due = self.timers.peek().map(|Reverse(timer)| timer.due);
            tokio::select! {
                biased;
                _ = stop.wait() => {}
                scheduled = self.inbox.recv() => {
                    if let Some(scheduled) = scheduled {
                        self.accept(scheduled);
                    }
                }
                _ = sleep_until(next_due) => {}
            }
        }

        self.drain_inbox();
        stats.dropped = self.ready.len() + self.timers.len();
        debug!(
            "Reactor stopped: executed={} failed={} dropped={}",
            stats.executed, stats.failed, stats.dropped
        );
        stats
    }

    fn execute<H: TaskHandler<T>>(&self, handler: &mut H, task: T, stats: &mut RunStats) {
        stats.executed += 1;
        match catch_unwind(AssertUnwindSafe(|| handler.handle(task, &self.handle))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                stats.failed += 1;
                error!("Task failed: {}", e);
            }
            Err(_) => {
                stats.failed += 1;
                error!("Task panicked; continuing with the next task");
            }
        }
    }

    fn drain_inbox(&mut self) {
        while let Ok(scheduled) = self.inbox.try_recv() {
            self.accept(scheduled);
        }
    }

    fn accept(&mut self, scheduled: Scheduled<T>) {
        match scheduled.due {
            None => self.ready.push_back(scheduled.task),
            Some(due) => {
                let seq = self.next_seq;
                self.next_seq += 1;
                self.timers.push(Reverse(Timer {
                    due,
                    seq,
                    task: scheduled.task,
                }));
            }
        }
    }

    fn promote_due(&mut self, now: Instant) {
        while self
            .timers
            .peek()
            .is_some_and(|Reverse(timer)| timer.due <= now)
        {
            if let Some(Reverse(timer)) = self.timers.pop() {
                self.ready.push_back(timer.task);
            }
        }
    }
}

async fn sleep_until(due: Option<Instant>) {
    match due {
        Some(due) => tokio::time::sleep_until(due).await,
        None => std::future::pending::<()>().await,
    }
}
