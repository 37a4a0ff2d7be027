//! Line console for driving a replay.
//!
//! Holds the replay form and forwards the five actions to the
//! [`ReplayController`]. Rejected actions print a notice and change nothing.

use std::io::{BufRead, Write};

use anyhow::{bail, Context, Result};
use spice_replay_core::{ReplayBackend, ReplayController, ReplayForm};
use tracing::debug;

const HELP: &str = "\
commands:
  run                   start replaying the record file
  pause                 stop feeding the server
  cont | continue       resume feeding at full speed
  next                  deliver one command while paused
  next-n [N]            deliver N commands while paused (1-500)
  status                show the form and the replay state
  set <field> <value>   edit a form field: file, port, client, delay, delay-enabled, steps
  help                  show this text
  quit | exit           stop the replay and leave";

/// Editable form fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormField {
    RecordFile,
    Port,
    Client,
    Delay,
    DelayEnabled,
    StepCount,
}

impl FormField {
    fn parse(name: &str) -> Result<Self> {
        Ok(match name {
            "file" | "record-file" => Self::RecordFile,
            "port" => Self::Port,
            "client" => Self::Client,
            "delay" => Self::Delay,
            "delay-enabled" => Self::DelayEnabled,
            "steps" | "step-count" => Self::StepCount,
            other => bail!("unknown field `{other}`"),
        })
    }
}

/// One parsed console line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Run,
    Pause,
    Continue,
    Next,
    /// Next-N, optionally replacing the form's step count first.
    NextN(Option<String>),
    Status,
    Set(FormField, String),
    Help,
    Quit,
}

impl ConsoleCommand {
    /// Parse a line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let command = match word {
            "" => return Ok(None),
            "run" => Self::Run,
            "pause" => Self::Pause,
            "cont" | "continue" => Self::Continue,
            "next" => Self::Next,
            "next-n" => Self::NextN((!rest.is_empty()).then(|| rest.to_string())),
            "status" => Self::Status,
            "set" => {
                let (name, value) = match rest.split_once(char::is_whitespace) {
                    Some((name, value)) => (name, value.trim()),
                    None => (rest, ""),
                };
                if name.is_empty() {
                    bail!("usage: set <field> <value>");
                }
                Self::Set(FormField::parse(name)?, value.to_string())
            }
            "help" | "?" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => bail!("unknown command `{other}`, try `help`"),
        };
        Ok(Some(command))
    }
}

/// Whether the console keeps reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub struct Console<B> {
    controller: ReplayController<B>,
    form: ReplayForm,
}

impl<B: ReplayBackend> Console<B> {
    pub fn new(controller: ReplayController<B>, form: ReplayForm) -> Self {
        Self { controller, form }
    }

    /// Read commands until `quit` or end of input, then stop the replay.
    pub fn run(&mut self, input: impl BufRead, mut out: impl Write) -> Result<()> {
        write!(out, "> ")?;
        out.flush()?;
        for line in input.lines() {
            let line = line.context("Failed to read console input")?;
            if self.handle_line(&line, &mut out)? == Flow::Quit {
                break;
            }
            write!(out, "> ")?;
            out.flush()?;
        }
        self.controller.shutdown();
        Ok(())
    }

    /// Handle one line. Action failures are printed, not returned; the
    /// error path is reserved for a broken output stream.
    pub fn handle_line(&mut self, line: &str, out: &mut impl Write) -> Result<Flow> {
        let command = match ConsoleCommand::parse(line) {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(Flow::Continue),
            Err(e) => {
                writeln!(out, "error: {e}")?;
                return Ok(Flow::Continue);
            }
        };
        debug!(?command, "console command");

        let result = match command {
            ConsoleCommand::Run => self.controller.run(&self.form).map(|()| "run".to_string()),
            ConsoleCommand::Pause => self.controller.pause().map(|()| "paused".to_string()),
            ConsoleCommand::Continue => self.controller.resume().map(|()| "continuing".to_string()),
            ConsoleCommand::Next => self.controller.next().map(|()| "stepped 1".to_string()),
            ConsoleCommand::NextN(count) => {
                if let Some(count) = count {
                    self.form.step_count = count;
                }
                self.controller
                    .next_n(&self.form.step_count)
                    .map(|n| format!("stepped {n}"))
            }
            ConsoleCommand::Status => {
                self.write_status(out)?;
                return Ok(Flow::Continue);
            }
            ConsoleCommand::Set(field, value) => {
                match self.set_field(field, value) {
                    Ok(()) => {}
                    Err(e) => writeln!(out, "error: {e}")?,
                }
                return Ok(Flow::Continue);
            }
            ConsoleCommand::Help => {
                writeln!(out, "{HELP}")?;
                return Ok(Flow::Continue);
            }
            ConsoleCommand::Quit => return Ok(Flow::Quit),
        };

        match result {
            Ok(message) => writeln!(out, "{message} ({})", self.controller.state())?,
            Err(e) => writeln!(out, "error: {e}")?,
        }
        Ok(Flow::Continue)
    }

    fn set_field(&mut self, field: FormField, value: String) -> Result<()> {
        match field {
            FormField::RecordFile => self.form.record_file = value,
            FormField::Port => self.form.port = value,
            FormField::Client => self.form.client = value,
            FormField::Delay => self.form.delay = value,
            FormField::StepCount => self.form.step_count = value,
            FormField::DelayEnabled => {
                self.form.delay_enabled = match value.as_str() {
                    "on" | "true" | "yes" | "1" => true,
                    "off" | "false" | "no" | "0" => false,
                    other => bail!("delay-enabled takes on or off, not `{other}`"),
                }
            }
        }
        Ok(())
    }

    fn write_status(&self, out: &mut impl Write) -> Result<()> {
        let form = &self.form;
        writeln!(out, "state:  {}", self.controller.state())?;
        writeln!(out, "file:   {}", or_dash(&form.record_file))?;
        writeln!(out, "port:   {}", form.port)?;
        writeln!(out, "client: {}", or_dash(&form.client))?;
        writeln!(
            out,
            "delay:  {} us ({})",
            form.delay,
            if form.delay_enabled { "on" } else { "off" }
        )?;
        writeln!(out, "steps:  {}", form.step_count)?;

        if let Some(session) = self.controller.session() {
            let stats = session.stats();
            writeln!(
                out,
                "queue:  {} queued, {} pending steps{}",
                session.queue_len(),
                session.pending_steps(),
                if session.is_filling() { ", filling" } else { "" }
            )?;
            writeln!(
                out,
                "totals: {} queued, {} delivered, {} released",
                stats.queued, stats.delivered, stats.released
            )?;
            if let Some(pid) = session.client_pid() {
                writeln!(out, "helper: pid {pid}")?;
            }
        }
        Ok(())
    }
}

fn or_dash(value: &str) -> &str {
    if value.trim().is_empty() {
        "-"
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spice_replay_core::{
        LoopbackServer, ManualScheduler, ProtocolServer, RecordingBackend, SessionState,
    };
    use std::sync::Arc;

    fn console() -> Console<impl ReplayBackend> {
        let backend =
            RecordingBackend::new(|| Box::new(LoopbackServer::headless()) as Box<dyn ProtocolServer>);
        let controller = ReplayController::new(backend, Arc::new(ManualScheduler::new()));
        Console::new(controller, ReplayForm::default())
    }

    fn feed<B: ReplayBackend>(console: &mut Console<B>, line: &str) -> String {
        let mut out = Vec::new();
        console.handle_line(line, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_parse_actions() {
        assert_eq!(ConsoleCommand::parse("run").unwrap(), Some(ConsoleCommand::Run));
        assert_eq!(ConsoleCommand::parse(" cont ").unwrap(), Some(ConsoleCommand::Continue));
        assert_eq!(ConsoleCommand::parse("continue").unwrap(), Some(ConsoleCommand::Continue));
        assert_eq!(ConsoleCommand::parse("next-n").unwrap(), Some(ConsoleCommand::NextN(None)));
        assert_eq!(
            ConsoleCommand::parse("next-n 25").unwrap(),
            Some(ConsoleCommand::NextN(Some("25".to_string())))
        );
        assert_eq!(ConsoleCommand::parse("   ").unwrap(), None);
        assert!(ConsoleCommand::parse("rewind").is_err());
    }

    #[test]
    fn test_parse_set_keeps_rest_of_line() {
        assert_eq!(
            ConsoleCommand::parse("set client remote-viewer spice://localhost:5900").unwrap(),
            Some(ConsoleCommand::Set(
                FormField::Client,
                "remote-viewer spice://localhost:5900".to_string()
            ))
        );
        assert_eq!(
            ConsoleCommand::parse("set client").unwrap(),
            Some(ConsoleCommand::Set(FormField::Client, String::new()))
        );
        assert!(ConsoleCommand::parse("set").is_err());
        assert!(ConsoleCommand::parse("set colour red").is_err());
    }

    #[test]
    fn test_set_updates_form() {
        let mut console = console();
        feed(&mut console, "set file /tmp/boot.spice");
        feed(&mut console, "set port 5901");
        feed(&mut console, "set delay-enabled off");

        assert_eq!(console.form.record_file, "/tmp/boot.spice");
        assert_eq!(console.form.port, "5901");
        assert!(!console.form.delay_enabled);

        let out = feed(&mut console, "set delay-enabled maybe");
        assert!(out.starts_with("error:"));
        assert!(!console.form.delay_enabled);
    }

    #[test]
    fn test_rejected_run_prints_notice() {
        let mut console = console();
        let out = feed(&mut console, "run");
        assert!(out.starts_with("error:"), "{out}");
        assert_eq!(console.controller.state(), SessionState::Idle);

        feed(&mut console, "set file /nonexistent/spice-replay/boot.spice");
        let out = feed(&mut console, "run");
        assert!(out.starts_with("error:"), "{out}");
        assert_eq!(console.controller.state(), SessionState::Idle);
    }

    #[test]
    fn test_actions_without_session_print_notice() {
        let mut console = console();
        for line in ["pause", "cont", "next", "next-n 5"] {
            let out = feed(&mut console, line);
            assert!(out.starts_with("error:"), "{line}: {out}");
        }
    }

    #[test]
    fn test_next_n_argument_replaces_step_count() {
        let mut console = console();
        feed(&mut console, "next-n 42");
        assert_eq!(console.form.step_count, "42");
    }

    #[test]
    fn test_status_shows_form() {
        let mut console = console();
        let out = feed(&mut console, "status");
        assert!(out.contains("state:  idle"), "{out}");
        assert!(out.contains("port:   5900"), "{out}");
        assert!(out.contains("client: -"), "{out}");
    }

    #[test]
    fn test_quit_stops_reading() {
        let mut console = console();
        let input = b"status\nquit\nrun\n".as_slice();
        let mut out = Vec::new();
        console.run(input, &mut out).unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("state:  idle"));
        assert!(!out.contains("error:"));
    }
}
