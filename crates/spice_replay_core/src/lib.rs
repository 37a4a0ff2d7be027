//! SPICE Replay Core
//!
//! Replays a recorded SPICE display-command stream through a protocol
//! server, one command at a time or at full speed:
//!
//! - **Replay Queue**: FIFO between the idle context and the server thread
//! - **Queue Filler**: single-flight bursts honouring pause/step pacing
//! - **Display Device**: the callback surface the server drives
//! - **Session Controller**: Run, Pause, Continue, Next and Next-N
//!
//! The recording decoder and the protocol server are collaborators behind
//! [`CommandSource`] and [`ProtocolServer`]. [`RecordFileSource`] reads
//! text-mode recordings and [`LoopbackServer`] drives the device without a
//! real SPICE stack.
//!
//! # Example
//!
//! ```no_run
//! use spice_replay_core::{
//!     IdleLoop, LoopbackServer, ProtocolServer, RecordingBackend, ReplayController, ReplayForm,
//! };
//!
//! let idle = IdleLoop::spawn()?;
//! let backend = RecordingBackend::new(|| Box::new(LoopbackServer::new()) as Box<dyn ProtocolServer>);
//! let mut controller = ReplayController::new(backend, idle.scheduler());
//!
//! let form = ReplayForm {
//!     record_file: "session.spice".to_string(),
//!     ..ReplayForm::default()
//! };
//! controller.run(&form)?;
//! controller.pause()?;
//! controller.next_n("10")?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod client;
pub mod command;
pub mod controller;
pub mod device;
pub mod error;
pub mod filler;
pub mod input;
pub mod loopback;
pub mod queue;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod source;

pub use client::{ClientCommand, ClientProcess, ClientSpawner, SystemSpawner};
pub use command::{CommandId, CommandKind, QueueItem, ReplayCommand};
pub use controller::{RecordingBackend, ReplayBackend, ReplayController};
pub use device::{DeviceInitInfo, DisplayDevice, MemSlot, ReleaseInfo, ReplayDevice};
pub use error::{InputError, ReplayError, Result};
pub use filler::{fill_burst, FillMode, FillOutcome, FillToken, Pacing, FILL_TARGET};
pub use input::{ReplayForm, RunRequest, MAX_STEP_COUNT};
pub use loopback::{LoopbackMonitor, LoopbackServer};
pub use queue::ReplayQueue;
pub use scheduler::{IdleHandle, IdleLoop, IdleScheduler, IdleTask, ManualScheduler};
pub use server::{
    AuthMode, ChannelEvent, ChannelEventHandler, ChannelType, DeviceWorker, ImageCompression,
    ProtocolServer,
};
pub use session::{ReplayStats, Session, SessionState, StatsSnapshot};
pub use source::{CommandSource, RecordFileSource, MAX_SURFACES};
