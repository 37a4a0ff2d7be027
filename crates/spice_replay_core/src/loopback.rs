//! Loopback protocol server.
//!
//! A small [`ProtocolServer`] that drives a display device from its own
//! worker thread, the way a SPICE server's display worker does, without
//! speaking the SPICE wire protocol. Useful for:
//! - Running a replay headless
//! - Watching the command stream over TCP (`nc localhost 5900`)
//! - Integration tests
//!
//! Every TCP peer counts as a display channel. Peers receive a greeting line
//! and then one line per rendered command:
//!
//! ```text
//! SPICE-REPLAY LOOPBACK
//! cmd 0 draw 312
//! cmd 1 update 48
//! ```

use std::io::{ErrorKind, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::command::ReplayCommand;
use crate::device::{DisplayDevice, MemSlot, ReleaseInfo};
use crate::error::{ReplayError, Result};
use crate::server::{
    AuthMode, ChannelEvent, ChannelEventHandler, ChannelType, DeviceWorker, ImageCompression,
    ProtocolServer,
};

/// First line sent to every peer.
pub const GREETING: &str = "SPICE-REPLAY LOOPBACK";

/// Longest the worker sleeps without a wakeup before polling again.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

const ACCEPT_INTERVAL: Duration = Duration::from_millis(25);

/// A peer that stops reading for this long is dropped.
const PEER_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct WorkerFlags {
    vm_running: bool,
    wake: bool,
    stop: bool,
}

/// State shared by the server handle and its threads.
#[derive(Default)]
struct LoopbackCore {
    flags: Mutex<WorkerFlags>,
    signal: Condvar,
    peers: Mutex<Vec<TcpStream>>,
    memslots: Mutex<Vec<MemSlot>>,
    /// Cleared on shutdown; the handler holds the session.
    events: Mutex<Option<Arc<dyn ChannelEventHandler>>>,
    rendered: AtomicU64,
    wakeups: AtomicU64,
}

impl LoopbackCore {
    fn stopping(&self) -> bool {
        self.flags.lock().stop
    }

    fn set_vm_running(&self) {
        let mut flags = self.flags.lock();
        if !flags.vm_running {
            flags.vm_running = true;
            debug!("vm started");
        }
        self.signal.notify_all();
    }

    fn stop(&self) {
        self.flags.lock().stop = true;
        self.signal.notify_all();
    }

    /// Block until the VM runs. Returns `false` if stopping instead.
    fn wait_until_running(&self) -> bool {
        let mut flags = self.flags.lock();
        while !flags.vm_running && !flags.stop {
            self.signal.wait(&mut flags);
        }
        !flags.stop
    }

    fn wait_for_wakeup(&self, timeout: Duration) {
        let mut flags = self.flags.lock();
        if !flags.wake && !flags.stop {
            let _ = self.signal.wait_for(&mut flags, timeout);
        }
        flags.wake = false;
    }

    fn emit(&self, event: ChannelEvent, channel: ChannelType) {
        let events = self.events.lock().clone();
        if let Some(events) = events {
            events.on_channel_event(event, channel);
        }
    }

    fn render(&self, command: &ReplayCommand) {
        self.rendered.fetch_add(1, Ordering::Relaxed);
        trace!(id = %command.id, kind = %command.kind, "rendering command");

        let line = format!("cmd {} {} {}\n", command.id.get(), command.kind, command.payload_len());
        self.peers.lock().retain_mut(|peer| match peer.write_all(line.as_bytes()) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "dropping peer");
                false
            }
        });
    }

    fn add_peer(&self, mut stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = writeln!(stream, "{GREETING}") {
            warn!(%addr, error = %e, "failed to greet peer");
            return;
        }
        info!(%addr, "display peer connected");
        self.peers.lock().push(stream);
        self.emit(ChannelEvent::Connected, ChannelType::Display);
        self.emit(ChannelEvent::Initialized, ChannelType::Display);
    }
}

impl DeviceWorker for LoopbackCore {
    fn add_memslot(&self, slot: MemSlot) {
        debug!(?slot, "memslot added");
        self.memslots.lock().push(slot);
    }

    fn start_vm(&self) {
        self.set_vm_running();
    }

    fn wakeup(&self) {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
        self.flags.lock().wake = true;
        self.signal.notify_all();
    }
}

/// Read-only view of a [`LoopbackServer`], usable after the server has been
/// handed off as a `Box<dyn ProtocolServer>`.
#[derive(Clone)]
pub struct LoopbackMonitor {
    core: Arc<LoopbackCore>,
}

impl LoopbackMonitor {
    /// Commands rendered so far.
    pub fn rendered(&self) -> u64 {
        self.core.rendered.load(Ordering::Relaxed)
    }

    pub fn wakeups(&self) -> u64 {
        self.core.wakeups.load(Ordering::Relaxed)
    }

    pub fn peer_count(&self) -> usize {
        self.core.peers.lock().len()
    }

    pub fn memslots(&self) -> Vec<MemSlot> {
        self.core.memslots.lock().clone()
    }

    pub fn vm_running(&self) -> bool {
        self.core.flags.lock().vm_running
    }

    /// Report a channel event as if a peer had caused it.
    pub fn emit_channel_event(&self, event: ChannelEvent, channel: ChannelType) {
        self.core.emit(event, channel);
    }
}

/// Protocol server stand-in that renders commands to TCP peers.
pub struct LoopbackServer {
    core: Arc<LoopbackCore>,
    listen: bool,
    port: u16,
    compression: ImageCompression,
    auth: AuthMode,
    local_addr: Option<SocketAddr>,
    listener_thread: Option<JoinHandle<()>>,
    worker_thread: Option<JoinHandle<()>>,
}

impl LoopbackServer {
    /// A server that accepts TCP peers on the listen port.
    pub fn new() -> Self {
        Self::with_listener(true)
    }

    /// A server without a listener; channel events come only from
    /// [`LoopbackMonitor::emit_channel_event`].
    pub fn headless() -> Self {
        Self::with_listener(false)
    }

    fn with_listener(listen: bool) -> Self {
        Self {
            core: Arc::new(LoopbackCore::default()),
            listen,
            port: 0,
            compression: ImageCompression::default(),
            auth: AuthMode::default(),
            local_addr: None,
            listener_thread: None,
            worker_thread: None,
        }
    }

    pub fn monitor(&self) -> LoopbackMonitor {
        LoopbackMonitor {
            core: self.core.clone(),
        }
    }

    /// Address actually bound, once initialized.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn compression(&self) -> ImageCompression {
        self.compression
    }

    pub fn auth_mode(&self) -> AuthMode {
        self.auth
    }

    fn spawn_listener(&mut self) -> Result<()> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.port))
            .map_err(|e| ReplayError::Server(format!("bind port {}: {e}", self.port)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| ReplayError::Server(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| ReplayError::Server(e.to_string()))?;
        info!(%local_addr, "loopback server listening");

        let core = self.core.clone();
        let thread = thread::Builder::new()
            .name("replay-listener".to_string())
            .spawn(move || accept_loop(listener, &core))
            .map_err(|e| ReplayError::Server(e.to_string()))?;

        self.local_addr = Some(local_addr);
        self.listener_thread = Some(thread);
        Ok(())
    }
}

impl Default for LoopbackServer {
    fn default() -> Self {
        Self::new()
    }
}

fn accept_loop(listener: TcpListener, core: &LoopbackCore) {
    while !core.stopping() {
        match listener.accept() {
            Ok((stream, addr)) => {
                let configured = stream
                    .set_nonblocking(false)
                    .and_then(|()| stream.set_write_timeout(Some(PEER_WRITE_TIMEOUT)));
                if let Err(e) = configured {
                    warn!(%addr, error = %e, "rejecting peer");
                    continue;
                }
                core.add_peer(stream, addr);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_INTERVAL),
            Err(e) => {
                warn!(error = %e, "accept failed");
                thread::sleep(ACCEPT_INTERVAL);
            }
        }
    }
    debug!("listener exited");
}

fn worker_loop(device: Arc<dyn DisplayDevice>, core: Arc<LoopbackCore>) {
    let info = device.init_info();
    debug!(?info, "device init info");
    device.attach(core.clone());

    if !core.wait_until_running() {
        return;
    }

    while !core.stopping() {
        match device.get_command() {
            Some(command) => {
                core.render(&command);
                device.release_resource(ReleaseInfo::for_command(&command));
            }
            None => {
                if device.req_cmd_notification() {
                    core.wait_for_wakeup(POLL_INTERVAL);
                }
            }
        }
    }
    debug!("display worker exited");
}

impl ProtocolServer for LoopbackServer {
    fn set_compression_policy(&mut self, policy: ImageCompression) {
        self.compression = policy;
    }

    fn set_listen_port(&mut self, port: u16) {
        self.port = port;
    }

    fn set_auth_mode(&mut self, mode: AuthMode) {
        if mode != AuthMode::NoAuth {
            warn!(?mode, "loopback server has no authentication, ignoring");
        }
        self.auth = AuthMode::NoAuth;
    }

    fn init(&mut self, events: Arc<dyn ChannelEventHandler>) -> Result<()> {
        {
            let mut slot = self.core.events.lock();
            if slot.is_some() {
                return Err(ReplayError::Server("server already initialized".to_string()));
            }
            *slot = Some(events);
        }
        if self.listen {
            self.spawn_listener()?;
        }
        Ok(())
    }

    fn add_device(&mut self, device: Arc<dyn DisplayDevice>) -> Result<()> {
        if self.worker_thread.is_some() {
            return Err(ReplayError::Server("a display device is already registered".to_string()));
        }
        let core = self.core.clone();
        let thread = thread::Builder::new()
            .name("replay-display".to_string())
            .spawn(move || worker_loop(device, core))
            .map_err(|e| ReplayError::Server(e.to_string()))?;
        self.worker_thread = Some(thread);
        Ok(())
    }

    fn start_vm(&mut self) {
        self.core.set_vm_running();
    }

    fn shutdown(&mut self) {
        self.core.stop();
        for thread in [self.worker_thread.take(), self.listener_thread.take()]
            .into_iter()
            .flatten()
        {
            if thread.join().is_err() {
                warn!("loopback thread panicked");
            }
        }
        self.core.peers.lock().clear();
        self.core.events.lock().take();
    }
}

impl Drop for LoopbackServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[derive(Default)]
    struct CountingEvents {
        initialized: AtomicUsize,
    }

    impl ChannelEventHandler for CountingEvents {
        fn on_channel_event(&self, event: ChannelEvent, channel: ChannelType) {
            if event == ChannelEvent::Initialized && channel == ChannelType::Display {
                self.initialized.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_peer_connect_emits_display_initialized() {
        let events = Arc::new(CountingEvents::default());
        let mut server = LoopbackServer::new();
        server.set_listen_port(0);
        server.init(events.clone()).unwrap();

        let addr = server.local_addr().unwrap();
        let stream = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();
        let mut greeting = String::new();
        BufReader::new(stream).read_line(&mut greeting).unwrap();

        assert_eq!(greeting.trim_end(), GREETING);
        assert!(wait_until(|| events.initialized.load(Ordering::SeqCst) == 1));
        assert_eq!(server.monitor().peer_count(), 1);
        server.shutdown();
    }

    #[test]
    fn test_peers_get_write_timeout() {
        let mut server = LoopbackServer::new();
        server.set_listen_port(0);
        server.init(Arc::new(CountingEvents::default())).unwrap();

        let addr = server.local_addr().unwrap();
        let _stream = TcpStream::connect(("127.0.0.1", addr.port())).unwrap();
        assert!(wait_until(|| server.monitor().peer_count() == 1));

        let timeout = server.core.peers.lock()[0].write_timeout().unwrap();
        assert_eq!(timeout, Some(PEER_WRITE_TIMEOUT));
        server.shutdown();
    }

    #[test]
    fn test_init_twice_fails() {
        let mut server = LoopbackServer::headless();
        server.init(Arc::new(CountingEvents::default())).unwrap();
        assert!(server.init(Arc::new(CountingEvents::default())).is_err());
    }

    #[test]
    fn test_auth_is_always_none() {
        let mut server = LoopbackServer::headless();
        server.set_auth_mode(AuthMode::Ticket);
        assert_eq!(server.auth_mode(), AuthMode::NoAuth);
    }

    #[test]
    fn test_wakeup_ends_wait_early() {
        let core = Arc::new(LoopbackCore::default());
        let waiter = {
            let core = core.clone();
            thread::spawn(move || {
                let started = Instant::now();
                core.wait_for_wakeup(Duration::from_secs(10));
                started.elapsed()
            })
        };
        thread::sleep(Duration::from_millis(20));
        core.wakeup();

        assert!(waiter.join().unwrap() < Duration::from_secs(5));
        assert_eq!(core.wakeups.load(Ordering::Relaxed), 1);
    }
}
