//! Idle-context scheduling.
//!
//! Fill bursts run on a cooperative context rather than on the server
//! thread that asked for them. [`IdleLoop`] is a single thread that runs
//! tasks in submission order; [`ManualScheduler`] holds tasks until the
//! caller runs them, which keeps tests deterministic.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// A unit of work for the idle context.
pub type IdleTask = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks on the idle context.
pub trait IdleScheduler: Send + Sync {
    /// Queue `task` to run once the idle context is free. Returns `false`
    /// if the context has stopped and the task was dropped.
    fn schedule_idle(&self, task: IdleTask) -> bool;
}

enum LoopMessage {
    Run(IdleTask),
    Quit,
}

/// Handle used to post work onto an [`IdleLoop`]
#[derive(Clone)]
pub struct IdleHandle {
    sender: Sender<LoopMessage>,
}

impl IdleScheduler for IdleHandle {
    fn schedule_idle(&self, task: IdleTask) -> bool {
        if self.sender.send(LoopMessage::Run(task)).is_err() {
            debug!("idle loop stopped, dropping task");
            return false;
        }
        true
    }
}

/// A dedicated cooperative thread.
pub struct IdleLoop {
    handle: IdleHandle,
    thread: Option<JoinHandle<()>>,
}

impl IdleLoop {
    /// Start the idle thread.
    pub fn spawn() -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<LoopMessage>();
        let thread = thread::Builder::new()
            .name("replay-idle".to_string())
            .spawn(move || {
                while let Ok(message) = receiver.recv() {
                    match message {
                        LoopMessage::Run(task) => task(),
                        LoopMessage::Quit => break,
                    }
                }
                debug!("idle loop exited");
            })?;

        Ok(Self {
            handle: IdleHandle { sender },
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> IdleHandle {
        self.handle.clone()
    }

    /// Share the loop as a scheduler.
    pub fn scheduler(&self) -> Arc<dyn IdleScheduler> {
        Arc::new(self.handle())
    }

    /// Finish queued tasks and stop the thread.
    pub fn shutdown(&mut self) {
        let _ = self.handle.sender.send(LoopMessage::Quit);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("idle loop panicked");
            }
        }
    }
}

impl Drop for IdleLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Scheduler whose tasks run only when [`run_pending`](Self::run_pending)
/// is called.
#[derive(Default)]
pub struct ManualScheduler {
    tasks: Mutex<VecDeque<IdleTask>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Run queued tasks, including any they schedule, until none remain.
    /// Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while self.run_one() {
            ran += 1;
        }
        ran
    }

    /// Run only the oldest task.
    pub fn run_one(&self) -> bool {
        // Released before running so the task can reschedule.
        let task = self.tasks.lock().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }
}

impl IdleScheduler for ManualScheduler {
    fn schedule_idle(&self, task: IdleTask) -> bool {
        self.tasks.lock().push_back(task);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_idle_loop_runs_in_order() {
        let mut idle = IdleLoop::spawn().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..5 {
            let seen = seen.clone();
            assert!(idle.handle().schedule_idle(Box::new(move || seen.lock().push(i))));
        }
        idle.shutdown();

        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_schedule_after_shutdown_is_dropped() {
        let mut idle = IdleLoop::spawn().unwrap();
        let handle = idle.handle();
        idle.shutdown();

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let accepted = handle.schedule_idle(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(!accepted);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_manual_scheduler_runs_nested_tasks() {
        let scheduler = Arc::new(ManualScheduler::new());
        let ran = Arc::new(AtomicUsize::new(0));

        let inner_scheduler = scheduler.clone();
        let counter = ran.clone();
        scheduler.schedule_idle(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let counter = counter.clone();
            inner_scheduler.schedule_idle(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }));

        assert_eq!(scheduler.pending(), 1);
        assert_eq!(scheduler.run_pending(), 2);
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert!(!scheduler.run_one());
    }
}
