//! Queue filler.
//!
//! Keeps the replay queue stocked so the device rarely finds it empty.
//! A fill is requested from the control actions and from the device when it
//! runs dry; at most one burst is scheduled at any time, guarded by a
//! [`FillToken`].
//!
//! While paused, a burst delivers exactly the pending step count. Otherwise
//! it tops the queue up to [`FILL_TARGET`].

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use crate::command::{QueueItem, ReplayCommand};
use crate::queue::ReplayQueue;
use crate::session::Shared;

/// Queue length an unpaused burst fills up to.
pub const FILL_TARGET: usize = 50;

/// Single-shot scheduling token.
///
/// Held from the moment a burst is scheduled until it finishes.
#[derive(Debug, Default)]
pub struct FillToken {
    held: AtomicBool,
}

impl FillToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the token. Returns `false` if a burst is already scheduled.
    pub fn try_acquire(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::Release);
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Pause/step state and the artificial per-command delay.
#[derive(Debug, Default)]
pub struct Pacing {
    paused: AtomicBool,
    /// Commands to deliver on the next paused burst.
    pending_steps: AtomicU32,
    delay_us: AtomicU64,
}

impl Pacing {
    pub fn new(delay_us: u64) -> Self {
        Self {
            delay_us: AtomicU64::new(delay_us),
            ..Self::default()
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn pending_steps(&self) -> u32 {
        self.pending_steps.load(Ordering::Acquire)
    }

    pub fn set_pending_steps(&self, steps: u32) {
        self.pending_steps.store(steps, Ordering::Release);
    }

    /// Claim the pending step count, leaving 0 behind.
    pub fn take_pending_steps(&self) -> u32 {
        self.pending_steps.swap(0, Ordering::AcqRel)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_micros(self.delay_us.load(Ordering::Relaxed))
    }

    pub fn set_delay(&self, delay_us: u64) {
        self.delay_us.store(delay_us, Ordering::Relaxed);
    }

    fn throttle(&self) {
        let delay = self.delay();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
}

/// How a burst decided how much to deliver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FillMode {
    /// Paused: delivered the claimed step count.
    Stepped { requested: u32 },
    /// Running: filled towards [`FILL_TARGET`].
    TopUp,
}

/// Result of one burst.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FillOutcome {
    pub mode: FillMode,
    /// Commands pushed, sentinel excluded.
    pub pushed: usize,
    /// The source ran dry and the sentinel was pushed.
    pub exhausted: bool,
}

/// Run one burst, pulling commands with `next`.
///
/// `next` returning `None` ends the stream: the sentinel is pushed and the
/// burst stops.
pub fn fill_burst<F>(mut next: F, queue: &ReplayQueue, pacing: &Pacing) -> FillOutcome
where
    F: FnMut() -> Option<ReplayCommand>,
{
    let mut push_next = |pushed: &mut usize| -> bool {
        match next() {
            Some(command) => {
                pacing.throttle();
                trace!(id = %command.id, kind = %command.kind, "queued command");
                queue.push(QueueItem::Command(command));
                *pushed += 1;
                true
            }
            None => {
                queue.push(QueueItem::EndOfStream);
                false
            }
        }
    };

    let mut pushed = 0;
    if pacing.is_paused() {
        let requested = pacing.take_pending_steps();
        for _ in 0..requested {
            if !push_next(&mut pushed) {
                return FillOutcome {
                    mode: FillMode::Stepped { requested },
                    pushed,
                    exhausted: true,
                };
            }
        }
        FillOutcome {
            mode: FillMode::Stepped { requested },
            pushed,
            exhausted: false,
        }
    } else {
        while queue.len() < FILL_TARGET {
            if !push_next(&mut pushed) {
                return FillOutcome {
                    mode: FillMode::TopUp,
                    pushed,
                    exhausted: true,
                };
            }
        }
        FillOutcome {
            mode: FillMode::TopUp,
            pushed,
            exhausted: false,
        }
    }
}

/// Schedule a burst on the idle context.
///
/// No-op (returns `false`) before the session starts, after it ends, or
/// while another burst is scheduled. Also `false` if the idle context has
/// stopped, in which case the token is released again.
pub(crate) fn request_fill(shared: &Arc<Shared>) -> bool {
    if !shared.is_started() || shared.is_ended() {
        trace!("fill request ignored, session not running");
        return false;
    }
    if !shared.fill_token.try_acquire() {
        trace!("fill already scheduled");
        return false;
    }

    let task_shared = Arc::clone(shared);
    let accepted = shared
        .scheduler
        .schedule_idle(Box::new(move || run_scheduled_fill(&task_shared)));
    if !accepted {
        shared.fill_token.release();
        debug!("idle context gone, fill not scheduled");
    }
    accepted
}

fn run_scheduled_fill(shared: &Arc<Shared>) {
    let outcome = fill_burst(|| shared.next_command(), &shared.queue, &shared.pacing);
    shared.fill_token.release();
    shared.stats.record_queued(outcome.pushed);

    debug!(
        mode = ?outcome.mode,
        pushed = outcome.pushed,
        exhausted = outcome.exhausted,
        queued = shared.queue.len(),
        "fill burst finished"
    );

    // An empty queue would only make the server poll and request another
    // empty burst.
    if !shared.queue.is_empty() {
        shared.wake_worker();
    }

    // A Continue or Next-N that arrived mid-burst found the token held.
    let stepped = matches!(outcome.mode, FillMode::Stepped { .. });
    if stepped
        && !outcome.exhausted
        && (!shared.pacing.is_paused() || shared.pacing.pending_steps() > 0)
    {
        request_fill(shared);
    }
}
