//! Session controller.
//!
//! Maps the five control actions (Run, Pause, Continue, Next, Next-N) onto
//! the current [`Session`]. Input is validated before anything changes, so a
//! rejected action leaves the replay exactly as it was.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::client::{ClientCommand, ClientProcess, ClientSpawner, SystemSpawner};
use crate::error::{InputError, ReplayError, Result};
use crate::input::{parse_step_count, ReplayForm};
use crate::scheduler::IdleScheduler;
use crate::server::ProtocolServer;
use crate::session::{Session, SessionState};
use crate::source::{CommandSource, RecordFileSource, MAX_SURFACES};

/// Builds the collaborators for a new replay.
pub trait ReplayBackend {
    fn open_source(&self, path: &Path, max_surfaces: u32) -> Result<Box<dyn CommandSource>>;

    fn new_server(&self) -> Box<dyn ProtocolServer>;

    fn spawn_client(&self, command: &ClientCommand) -> Result<Box<dyn ClientProcess>>;
}

/// Backend reading text recordings and spawning real client processes.
pub struct RecordingBackend<F> {
    server_factory: F,
}

impl<F> RecordingBackend<F>
where
    F: Fn() -> Box<dyn ProtocolServer>,
{
    pub fn new(server_factory: F) -> Self {
        Self { server_factory }
    }
}

impl<F> ReplayBackend for RecordingBackend<F>
where
    F: Fn() -> Box<dyn ProtocolServer>,
{
    fn open_source(&self, path: &Path, max_surfaces: u32) -> Result<Box<dyn CommandSource>> {
        Ok(Box::new(RecordFileSource::open(path, max_surfaces)?))
    }

    fn new_server(&self) -> Box<dyn ProtocolServer> {
        (self.server_factory)()
    }

    fn spawn_client(&self, command: &ClientCommand) -> Result<Box<dyn ClientProcess>> {
        SystemSpawner.spawn(command)
    }
}

/// Owns at most one live session and applies control actions to it.
pub struct ReplayController<B> {
    backend: B,
    scheduler: Arc<dyn IdleScheduler>,
    session: Option<Session>,
}

impl<B: ReplayBackend> ReplayController<B> {
    pub fn new(backend: B, scheduler: Arc<dyn IdleScheduler>) -> Self {
        Self {
            backend,
            scheduler,
            session: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map_or(SessionState::Idle, Session::state)
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Start a replay from the form.
    ///
    /// If the client helper fails to spawn, the error is returned but the
    /// session stays Armed. An Armed or Ended session is replaced by the
    /// next Run; only a Started or Paused one is refused.
    pub fn run(&mut self, form: &ReplayForm) -> Result<()> {
        if matches!(self.state(), SessionState::Started | SessionState::Paused) {
            return Err(ReplayError::SessionActive);
        }

        let request = form.run_request()?;
        let source = self
            .backend
            .open_source(&request.record_file, MAX_SURFACES)
            .map_err(|e| match e {
                ReplayError::Io { path, source } => ReplayError::Input(InputError::RecordFile(
                    format!("{}: {source}", path.display()),
                )),
                other => other,
            })?;

        if let Some(mut previous) = self.session.take() {
            info!(state = %previous.state(), "replacing replay");
            previous.close();
        }

        let server = self.backend.new_server();
        let session = Session::start(&request, source, server, self.scheduler.clone())?;

        let spawned = match &request.client {
            Some(command) => self.backend.spawn_client(command).map(|client| {
                session.set_client(client);
            }),
            None => {
                session.begin();
                Ok(())
            }
        };
        self.session = Some(session);

        if let Err(e) = &spawned {
            warn!(error = %e, "client helper failed, replay stays armed");
        }
        spawned
    }

    pub fn pause(&self) -> Result<()> {
        self.live()?.pause();
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.live()?.resume();
        Ok(())
    }

    pub fn next(&self) -> Result<()> {
        self.live()?.step(1);
        Ok(())
    }

    /// Step by the count typed into the form.
    pub fn next_n(&self, count: &str) -> Result<u32> {
        let count = parse_step_count(count)?;
        self.live()?.step(count);
        Ok(count)
    }

    /// Tear down the current session, if any.
    pub fn shutdown(&mut self) {
        if let Some(mut session) = self.session.take() {
            info!(state = %session.state(), "closing replay");
            session.close();
        }
    }

    fn live(&self) -> Result<&Session> {
        match &self.session {
            Some(session) if !session.is_ended() => Ok(session),
            _ => {
                warn!("no live replay session");
                Err(ReplayError::NoSession)
            }
        }
    }
}
