//! Client helper process.
//!
//! A replay can launch a protocol client (e.g. `remote-viewer`) next to the
//! server. The helper is interrupted and reaped when the replay ends.

use std::process::{Child, Command, Stdio};

use tracing::{debug, info, warn};

use crate::error::{InputError, ReplayError, Result};

/// A parsed client command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ClientCommand {
    /// Split a command line shell-style. Returns `Ok(None)` for a blank line.
    pub fn parse(line: &str) -> std::result::Result<Option<Self>, InputError> {
        let mut words = split_command_line(line)?.into_iter();
        Ok(words.next().map(|program| Self {
            program,
            args: words.collect(),
        }))
    }
}

/// Split `line` into words, honouring single quotes, double quotes and
/// backslash escapes.
pub fn split_command_line(line: &str) -> std::result::Result<Vec<String>, InputError> {
    #[derive(PartialEq)]
    enum Quote {
        None,
        Single,
        Double,
    }

    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut quote = Quote::None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match quote {
            Quote::Single => match c {
                '\'' => quote = Quote::None,
                c => word.push(c),
            },
            Quote::Double => match c {
                '"' => quote = Quote::None,
                '\\' => match chars.next() {
                    Some(escaped @ ('"' | '\\' | '$' | '`')) => word.push(escaped),
                    Some(other) => {
                        word.push('\\');
                        word.push(other);
                    }
                    None => return Err(InputError::ClientCommand("trailing backslash".into())),
                },
                c => word.push(c),
            },
            Quote::None => match c {
                '\'' => {
                    quote = Quote::Single;
                    in_word = true;
                }
                '"' => {
                    quote = Quote::Double;
                    in_word = true;
                }
                '\\' => match chars.next() {
                    Some(escaped) => {
                        word.push(escaped);
                        in_word = true;
                    }
                    None => return Err(InputError::ClientCommand("trailing backslash".into())),
                },
                c if c.is_whitespace() => {
                    if in_word {
                        words.push(std::mem::take(&mut word));
                        in_word = false;
                    }
                }
                c => {
                    word.push(c);
                    in_word = true;
                }
            },
        }
    }

    if quote != Quote::None {
        return Err(InputError::ClientCommand("unterminated quote".into()));
    }
    if in_word {
        words.push(word);
    }
    Ok(words)
}

/// A running client helper.
pub trait ClientProcess: Send {
    fn id(&self) -> u32;

    /// Send an interrupt and wait for the process to exit.
    fn interrupt_and_wait(&mut self);
}

/// Launches client helpers.
pub trait ClientSpawner: Send + Sync {
    fn spawn(&self, command: &ClientCommand) -> Result<Box<dyn ClientProcess>>;
}

/// Spawns helpers as child processes, searching `PATH`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSpawner;

impl ClientSpawner for SystemSpawner {
    fn spawn(&self, command: &ClientCommand) -> Result<Box<dyn ClientProcess>> {
        let child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| ReplayError::ClientSpawn {
                program: command.program.clone(),
                source,
            })?;
        info!(pid = child.id(), program = %command.program, "client started");
        Ok(Box::new(ChildClient { child }))
    }
}

/// A helper spawned by [`SystemSpawner`].
pub struct ChildClient {
    child: Child,
}

impl ChildClient {
    #[cfg(unix)]
    fn interrupt(&mut self) {
        let Ok(pid) = libc::pid_t::try_from(self.child.id()) else {
            return;
        };
        // SAFETY: plain kill(2) on our own child's pid; it is not reaped yet.
        let rc = unsafe { libc::kill(pid, libc::SIGINT) };
        if rc != 0 {
            warn!(pid, error = %std::io::Error::last_os_error(), "failed to interrupt client");
        }
    }

    #[cfg(not(unix))]
    fn interrupt(&mut self) {
        if let Err(e) = self.child.kill() {
            warn!(error = %e, "failed to stop client");
        }
    }
}

impl ClientProcess for ChildClient {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn interrupt_and_wait(&mut self) {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(%status, "client already exited");
            return;
        }
        self.interrupt();
        match self.child.wait() {
            Ok(status) => info!(pid = self.child.id(), %status, "client exited"),
            Err(e) => warn!(error = %e, "failed to wait for client"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_plain_words() {
        assert_eq!(
            split_command_line("spicec -h localhost -p 5900").unwrap(),
            vec!["spicec", "-h", "localhost", "-p", "5900"]
        );
        assert!(split_command_line("   ").unwrap().is_empty());
    }

    #[test]
    fn test_split_quotes_and_escapes() {
        assert_eq!(
            split_command_line(r#"viewer 'a b' "c \"d\"" e\ f """#).unwrap(),
            vec!["viewer", "a b", "c \"d\"", "e f", ""]
        );
        assert_eq!(split_command_line("x'y'z").unwrap(), vec!["xyz"]);
    }

    #[test]
    fn test_split_errors() {
        assert!(split_command_line("viewer 'open").is_err());
        assert!(split_command_line("viewer \\").is_err());
    }

    #[test]
    fn test_parse_command() {
        let cmd = ClientCommand::parse("remote-viewer spice://localhost:5900")
            .unwrap()
            .unwrap();
        assert_eq!(cmd.program, "remote-viewer");
        assert_eq!(cmd.args, vec!["spice://localhost:5900"]);
        assert_eq!(ClientCommand::parse("").unwrap(), None);
    }

    #[test]
    fn test_spawn_missing_program() {
        let cmd = ClientCommand::parse("definitely-not-a-real-replay-client").unwrap().unwrap();
        let err = SystemSpawner.spawn(&cmd).err().unwrap();
        assert!(matches!(err, ReplayError::ClientSpawn { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_interrupt_reaps_child() {
        let cmd = ClientCommand::parse("sleep 30").unwrap().unwrap();
        let mut client = SystemSpawner.spawn(&cmd).unwrap();
        let started = std::time::Instant::now();
        client.interrupt_and_wait();
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }
}
