//! Tick-driven worker threads.
//!
//! Every long-running activity in the engine (the download loop, the
//! playlist refresh loop, the fragment feeder, the watchdog) is a
//! [`TaskLoop`]: a dedicated thread that repeatedly calls a tick closure
//! and parks between ticks when paused. A tick is expected to be bounded
//! in time (blocking waits inside a tick use timeouts) so pause and stop
//! requests take effect promptly at the next tick boundary.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// What the loop should do after the current tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Run the next tick immediately.
    Continue,
    /// Park until resumed.
    Pause,
    /// Exit the loop thread.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Directive {
    Run,
    Pause,
    Stop,
}

struct Ctl {
    directive: Directive,
    parked: bool,
    /// Bumped by every resume, so the loop can tell a resume issued
    /// while a tick was still running from one it has already honored.
    epoch: u64,
}

struct Shared {
    ctl: Mutex<Ctl>,
    cond: Condvar,
}

/// A pausable worker thread driving a tick closure.
///
/// Spawned paused; call [`resume`] to start ticking. Dropping the handle
/// stops the loop and joins the thread.
///
/// [`resume`]: TaskLoop::resume
pub struct TaskLoop {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
    name: String,
}

impl TaskLoop {
    pub fn spawn<F>(name: &str, mut tick: F) -> io::Result<TaskLoop>
    where
        F: FnMut() -> Tick + Send + 'static,
    {
        let shared = Arc::new(Shared {
            ctl: Mutex::new(Ctl {
                directive: Directive::Pause,
                parked: false,
                epoch: 0,
            }),
            cond: Condvar::new(),
        });

        let worker = Arc::clone(&shared);
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                loop {
                    let epoch = {
                        let mut ctl = worker.ctl.lock();
                        while ctl.directive == Directive::Pause {
                            if !ctl.parked {
                                ctl.parked = true;
                                worker.cond.notify_all();
                            }
                            worker.cond.wait(&mut ctl);
                        }
                        if ctl.directive == Directive::Stop {
                            ctl.parked = true;
                            worker.cond.notify_all();
                            break;
                        }
                        ctl.parked = false;
                        ctl.epoch
                    };

                    match tick() {
                        Tick::Continue => {}
                        Tick::Pause => {
                            let mut ctl = worker.ctl.lock();
                            // a resume that arrived while this tick ran
                            // outranks the tick's own pause verdict
                            if ctl.directive == Directive::Run && ctl.epoch == epoch {
                                ctl.directive = Directive::Pause;
                            }
                        }
                        Tick::Stop => {
                            worker.ctl.lock().directive = Directive::Stop;
                        }
                    }
                }
                trace!(task = %thread_name, "task loop exited");
            })?;

        Ok(TaskLoop {
            shared,
            handle: Some(handle),
            name: name.to_string(),
        })
    }

    /// Requests the loop to tick. No-op after stop.
    pub fn resume(&self) {
        let mut ctl = self.shared.ctl.lock();
        ctl.epoch = ctl.epoch.wrapping_add(1);
        if ctl.directive != Directive::Stop {
            ctl.directive = Directive::Run;
        }
        self.shared.cond.notify_all();
    }

    /// Requests a pause. The loop parks at the next tick boundary; this
    /// call does not wait for that to happen.
    pub fn pause(&self) {
        let mut ctl = self.shared.ctl.lock();
        if ctl.directive == Directive::Run {
            ctl.directive = Directive::Pause;
        }
        self.shared.cond.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.ctl.lock().directive == Directive::Pause
    }

    /// Blocks until the worker has actually parked (or stopped). Used by
    /// callers that need the tick closure quiescent before mutating
    /// shared state.
    pub fn wait_parked(&self) {
        let mut ctl = self.shared.ctl.lock();
        while !ctl.parked && ctl.directive != Directive::Run {
            self.shared.cond.wait(&mut ctl);
        }
    }

    /// Stops the loop and joins the thread.
    pub fn stop(&mut self) {
        {
            let mut ctl = self.shared.ctl.lock();
            ctl.directive = Directive::Stop;
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                trace!(task = %self.name, "task loop thread panicked");
            }
        }
    }
}

impl Drop for TaskLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Cancellable sleep for loops that tick on a period (playlist refresh,
/// watchdog). Unlike `thread::sleep`, teardown can cut the wait short.
pub struct SleepGate {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

impl SleepGate {
    pub fn new() -> Self {
        Self {
            cancelled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Sleeps for up to `duration`. Returns `false` if the gate was
    /// cancelled before the time elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut cancelled = self.cancelled.lock();
        while !*cancelled {
            if self.cond.wait_until(&mut cancelled, deadline).timed_out() {
                break;
            }
        }
        !*cancelled
    }

    /// Cancels the current and all future sleeps.
    pub fn cancel(&self) {
        *self.cancelled.lock() = true;
        self.cond.notify_all();
    }
}

impl Default for SleepGate {
    fn default() -> Self {
        Self::new()
    }
}
