//! Replay session.
//!
//! A [`Session`] owns one replay: the command source, the protocol server,
//! the display device and the queue between them. State shared with the
//! server thread and the idle context lives in [`Shared`] and is reached
//! through `Arc` handles; nothing here is global.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::client::ClientProcess;
use crate::command::{CommandId, ReplayCommand};
use crate::device::ReplayDevice;
use crate::error::Result;
use crate::filler::{self, FillToken, Pacing};
use crate::input::RunRequest;
use crate::queue::ReplayQueue;
use crate::scheduler::IdleScheduler;
use crate::server::{
    AuthMode, ChannelEvent, ChannelEventHandler, ChannelType, DeviceWorker, ImageCompression,
    ProtocolServer,
};
use crate::source::CommandSource;

/// Where a replay is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No session.
    Idle,
    /// Constructed, waiting for the display channel.
    Armed,
    /// Commands flow and the queue is kept full.
    Started,
    /// Commands are delivered only by stepping.
    Paused,
    /// The recording is exhausted.
    Ended,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Armed => "armed",
            Self::Started => "started",
            Self::Paused => "paused",
            Self::Ended => "ended",
        })
    }
}

/// Running counters for a session.
#[derive(Debug, Default)]
pub struct ReplayStats {
    queued: AtomicU64,
    delivered: AtomicU64,
    released: AtomicU64,
}

impl ReplayStats {
    pub(crate) fn record_queued(&self, count: usize) {
        self.queued.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_released(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`ReplayStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Commands pushed onto the queue by the filler.
    pub queued: u64,
    /// Commands handed to the server.
    pub delivered: u64,
    /// Commands returned to the source.
    pub released: u64,
}

/// State reachable from the server thread and the idle context.
pub(crate) struct Shared {
    pub(crate) queue: ReplayQueue,
    source: Mutex<Option<Box<dyn CommandSource>>>,
    pub(crate) pacing: Pacing,
    started: AtomicBool,
    ended: AtomicBool,
    pub(crate) fill_token: FillToken,
    pub(crate) scheduler: Arc<dyn IdleScheduler>,
    pub(crate) worker: OnceLock<Arc<dyn DeviceWorker>>,
    client: Mutex<Option<Box<dyn ClientProcess>>>,
    pub(crate) max_surfaces: u32,
    pub(crate) stats: ReplayStats,
}

impl Shared {
    pub(crate) fn new(
        source: Box<dyn CommandSource>,
        pacing: Pacing,
        scheduler: Arc<dyn IdleScheduler>,
    ) -> Self {
        let max_surfaces = source.max_surfaces();
        Self {
            queue: ReplayQueue::new(),
            source: Mutex::new(Some(source)),
            pacing,
            started: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            fill_token: FillToken::new(),
            scheduler,
            worker: OnceLock::new(),
            client: Mutex::new(None),
            max_surfaces,
            stats: ReplayStats::default(),
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Flip to started. Returns `false` if already started.
    pub(crate) fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    /// Pull the next command. A closed source or a decode failure ends the
    /// stream.
    pub(crate) fn next_command(&self) -> Option<ReplayCommand> {
        let mut source = self.source.lock();
        match source.as_mut()?.next_command() {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "recording could not be decoded, ending replay");
                None
            }
        }
    }

    pub(crate) fn release_command(&self, id: CommandId) {
        match self.source.lock().as_mut() {
            Some(source) => {
                if source.release_command(id) {
                    self.stats.record_released();
                }
            }
            None => trace!(%id, "release after the source was closed"),
        }
    }

    pub(crate) fn wake_worker(&self) {
        if let Some(worker) = self.worker.get() {
            worker.wakeup();
        }
    }

    /// Close the source and reap the client helper. Runs once.
    pub(crate) fn end_replay(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }

        let source = self.source.lock().take();
        if let Some(mut source) = source {
            source.close();
        }

        let client = self.client.lock().take();
        if let Some(mut client) = client {
            info!(pid = client.id(), "stopping client");
            client.interrupt_and_wait();
        }

        let dropped = self.queue.clear();
        if dropped > 0 {
            debug!(dropped, "discarded queued commands");
        }
        info!(stats = ?self.stats.snapshot(), "replay ended");
    }
}

/// Starts the replay when the display channel comes up.
struct SessionEvents {
    shared: Arc<Shared>,
}

impl ChannelEventHandler for SessionEvents {
    fn on_channel_event(&self, event: ChannelEvent, channel: ChannelType) {
        trace!(?event, ?channel, "channel event");
        if event == ChannelEvent::Initialized
            && channel == ChannelType::Display
            && self.shared.mark_started()
        {
            info!("display channel initialized, starting replay");
            filler::request_fill(&self.shared);
        }
    }
}

/// One replay of one recording.
pub struct Session {
    shared: Arc<Shared>,
    device: Arc<ReplayDevice>,
    server: Box<dyn ProtocolServer>,
    record_file: PathBuf,
    port: u16,
    closed: bool,
}

impl Session {
    /// Configure `server` for the replay and register the display device.
    ///
    /// The session is left Armed: commands flow after [`begin`](Self::begin)
    /// or once the display channel initializes.
    pub fn start(
        request: &RunRequest,
        source: Box<dyn CommandSource>,
        mut server: Box<dyn ProtocolServer>,
        scheduler: Arc<dyn IdleScheduler>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared::new(
            source,
            Pacing::new(request.delay_us),
            scheduler,
        ));
        let device = Arc::new(ReplayDevice::new(shared.clone()));

        server.set_compression_policy(ImageCompression::AutoGlz);
        server.set_listen_port(request.port);
        server.set_auth_mode(AuthMode::NoAuth);

        let events = Arc::new(SessionEvents {
            shared: shared.clone(),
        });
        let registered = server
            .init(events)
            .and_then(|()| server.add_device(device.clone()));
        if let Err(e) = registered {
            server.shutdown();
            shared.end_replay();
            return Err(e);
        }

        info!(
            file = %request.record_file.display(),
            port = request.port,
            delay_us = request.delay_us,
            "replay armed"
        );

        Ok(Self {
            shared,
            device,
            server,
            record_file: request.record_file.clone(),
            port: request.port,
            closed: false,
        })
    }

    /// Start delivering without waiting for a channel event.
    pub fn begin(&self) {
        if self.shared.mark_started() {
            info!("replay started");
        }
        filler::request_fill(&self.shared);
    }

    /// Keep the helper so it is stopped with the replay.
    pub fn set_client(&self, client: Box<dyn ClientProcess>) {
        *self.shared.client.lock() = Some(client);
    }

    pub fn pause(&self) {
        self.shared.pacing.set_paused(true);
        info!("replay paused");
    }

    pub fn resume(&self) {
        self.shared.pacing.set_paused(false);
        info!("replay resumed");
        filler::request_fill(&self.shared);
    }

    /// Deliver `count` more commands while paused.
    pub fn step(&self, count: u32) {
        self.shared.pacing.set_pending_steps(count);
        debug!(count, "step requested");
        filler::request_fill(&self.shared);
    }

    /// Ask for a fill burst. Returns `true` if one was scheduled.
    pub fn request_fill(&self) -> bool {
        filler::request_fill(&self.shared)
    }

    pub fn state(&self) -> SessionState {
        if self.shared.is_ended() {
            SessionState::Ended
        } else if !self.shared.is_started() {
            SessionState::Armed
        } else if self.shared.pacing.is_paused() {
            SessionState::Paused
        } else {
            SessionState::Started
        }
    }

    pub fn is_ended(&self) -> bool {
        self.shared.is_ended()
    }

    pub fn device(&self) -> Arc<ReplayDevice> {
        self.device.clone()
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn pending_steps(&self) -> u32 {
        self.shared.pacing.pending_steps()
    }

    pub fn delay_us(&self) -> u64 {
        self.shared.pacing.delay().as_micros() as u64
    }

    /// A burst is scheduled or running.
    pub fn is_filling(&self) -> bool {
        self.shared.fill_token.is_held()
    }

    pub fn client_pid(&self) -> Option<u32> {
        self.shared.client.lock().as_ref().map(|client| client.id())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn record_file(&self) -> &Path {
        &self.record_file
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Stop the server, then close the source and the helper.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.server.shutdown();
        self.shared.end_replay();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
