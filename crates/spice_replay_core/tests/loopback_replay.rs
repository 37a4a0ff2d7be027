//! End-to-end replays through the loopback server
//!
//! A text recording is written to a temp file, opened by the real
//! `RecordFileSource`, and drained by the loopback server's display thread
//! while fill bursts run on an `IdleLoop`.

use std::fs;
use std::io::{BufRead, BufReader};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use spice_replay_core::loopback::GREETING;
use spice_replay_core::{
    ChannelEvent, ChannelType, IdleLoop, LoopbackMonitor, LoopbackServer, MemSlot, ProtocolServer,
    RecordingBackend, ReplayController, ReplayForm, SessionState,
};

struct Recording {
    path: PathBuf,
}

impl Recording {
    fn write(name: &str, commands: usize) -> Self {
        let path = std::env::temp_dir().join(format!(
            "spice-replay-{}-{name}.spice",
            std::process::id()
        ));
        let mut text = String::from("SPICE_REPLAY 1\nbinary 0\n");
        for i in 0..commands {
            text.push_str(&format!("event {i} 0 1 {}\n", 1_000 + i * 10));
            text.push_str(&format!("draw payload {i}\n"));
        }
        fs::write(&path, text).unwrap();
        Self { path }
    }

    fn form(&self, port: u16, client: &str) -> ReplayForm {
        ReplayForm {
            record_file: self.path.display().to_string(),
            port: port.to_string(),
            client: client.to_string(),
            delay_enabled: false,
            ..ReplayForm::default()
        }
    }
}

impl Drop for Recording {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

type MonitorSlot = Arc<Mutex<Option<LoopbackMonitor>>>;

fn backend(
    listen: bool,
) -> (
    RecordingBackend<impl Fn() -> Box<dyn ProtocolServer>>,
    MonitorSlot,
) {
    let slot: MonitorSlot = Arc::default();
    let factory_slot = slot.clone();
    let backend = RecordingBackend::new(move || {
        let server = if listen {
            LoopbackServer::new()
        } else {
            LoopbackServer::headless()
        };
        *factory_slot.lock().unwrap() = Some(server.monitor());
        Box::new(server) as Box<dyn ProtocolServer>
    });
    (backend, slot)
}

fn monitor(slot: &MonitorSlot) -> LoopbackMonitor {
    slot.lock().unwrap().clone().expect("server created")
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .unwrap()
}

#[test]
fn test_headless_replay_runs_to_the_end() {
    let recording = Recording::write("headless", 120);
    let idle = IdleLoop::spawn().unwrap();
    let (backend, slot) = backend(false);
    let mut controller = ReplayController::new(backend, idle.scheduler());

    controller.run(&recording.form(5900, "")).unwrap();
    let monitor = monitor(&slot);

    assert!(wait_until(|| controller.state() == SessionState::Ended));
    assert_eq!(monitor.rendered(), 120);
    assert!(monitor.vm_running());
    assert_eq!(monitor.memslots(), vec![MemSlot::whole_address_space()]);

    // The last burst records its count after the sentinel is already queued.
    let session = controller.session().unwrap();
    assert!(wait_until(|| session.stats().queued == 120));
    let stats = session.stats();
    assert_eq!(stats.delivered, 120);
    assert_eq!(stats.released, 120);
}

#[cfg(unix)]
#[test]
fn test_stepping_through_a_recording() {
    let recording = Recording::write("stepping", 30);
    let idle = IdleLoop::spawn().unwrap();
    let (backend, slot) = backend(false);
    let mut controller = ReplayController::new(backend, idle.scheduler());

    // The client keeps the replay armed until the display channel is up.
    controller.run(&recording.form(5900, "sleep 30")).unwrap();
    assert_eq!(controller.state(), SessionState::Armed);
    let monitor = monitor(&slot);

    controller.pause().unwrap();
    monitor.emit_channel_event(ChannelEvent::Initialized, ChannelType::Display);
    assert_eq!(controller.state(), SessionState::Paused);

    controller.next_n("5").unwrap();
    assert!(wait_until(|| monitor.rendered() == 5));
    thread::sleep(Duration::from_millis(200));
    assert_eq!(monitor.rendered(), 5);

    controller.next().unwrap();
    assert!(wait_until(|| monitor.rendered() == 6));

    controller.resume().unwrap();
    assert!(wait_until(|| controller.state() == SessionState::Ended));
    assert_eq!(monitor.rendered(), 30);
}

#[cfg(unix)]
#[test]
fn test_tcp_peer_sees_every_command() {
    let recording = Recording::write("tcp", 10);
    let idle = IdleLoop::spawn().unwrap();
    let (backend, _slot) = backend(true);
    let mut controller = ReplayController::new(backend, idle.scheduler());

    let port = free_port();
    controller.run(&recording.form(port, "sleep 30")).unwrap();
    assert_eq!(controller.state(), SessionState::Armed);

    let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let lines: Vec<String> = BufReader::new(stream)
        .lines()
        .take(11)
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(lines[0], GREETING);
    for (i, line) in lines[1..].iter().enumerate() {
        let payload_len = format!("draw payload {i}\n").len();
        assert_eq!(line, &format!("cmd {i} draw {payload_len}"));
    }
    assert!(wait_until(|| controller.state() == SessionState::Ended));
}
