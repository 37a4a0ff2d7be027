//! Form validation.
//!
//! The control surface hands over raw text, exactly as typed. Everything is
//! checked here before a session is touched.

use std::path::PathBuf;

use crate::client::ClientCommand;
use crate::error::InputError;

/// Inclusive bounds for Next-N.
pub const MAX_STEP_COUNT: u32 = 500;

/// Raw contents of the replay form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplayForm {
    pub record_file: String,
    pub port: String,
    /// Client command line; blank means no client helper.
    pub client: String,
    pub delay_enabled: bool,
    /// Delay in microseconds, used only when `delay_enabled`.
    pub delay: String,
    /// Count for Next-N.
    pub step_count: String,
}

impl Default for ReplayForm {
    fn default() -> Self {
        Self {
            record_file: String::new(),
            port: "5900".to_string(),
            client: String::new(),
            delay_enabled: true,
            delay: "100".to_string(),
            step_count: "10".to_string(),
        }
    }
}

/// Validated parameters for Run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunRequest {
    pub record_file: PathBuf,
    pub port: u16,
    pub client: Option<ClientCommand>,
    pub delay_us: u64,
}

impl ReplayForm {
    /// Validate everything Run needs except opening the file, which the
    /// source does.
    pub fn run_request(&self) -> Result<RunRequest, InputError> {
        let record_file = self.record_file.trim();
        if record_file.is_empty() {
            return Err(InputError::RecordFile("no record file given".to_string()));
        }
        let port = parse_port(&self.port)?;
        let delay_us = if self.delay_enabled {
            parse_delay(&self.delay)?
        } else {
            0
        };
        let client = ClientCommand::parse(&self.client)?;

        Ok(RunRequest {
            record_file: PathBuf::from(record_file),
            port,
            client,
            delay_us,
        })
    }

    /// Validate the Next-N count.
    pub fn steps(&self) -> Result<u32, InputError> {
        parse_step_count(&self.step_count)
    }
}

/// A listen port in 1..=65535.
pub fn parse_port(text: &str) -> Result<u16, InputError> {
    match text.trim().parse::<u16>() {
        Ok(port) if port >= 1 => Ok(port),
        _ => Err(InputError::Port(text.to_string())),
    }
}

/// A delay in microseconds.
pub fn parse_delay(text: &str) -> Result<u64, InputError> {
    text.trim()
        .parse::<u64>()
        .map_err(|_| InputError::Delay(text.to_string()))
}

/// A step count in [1, MAX_STEP_COUNT].
pub fn parse_step_count(text: &str) -> Result<u32, InputError> {
    match text.trim().parse::<u32>() {
        Ok(count) if (1..=MAX_STEP_COUNT).contains(&count) => Ok(count),
        _ => Err(InputError::StepCount(text.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_bounds() {
        assert_eq!(parse_port("5900"), Ok(5900));
        assert_eq!(parse_port(" 1 "), Ok(1));
        assert_eq!(parse_port("65535"), Ok(65535));
        assert!(parse_port("0").is_err());
        assert!(parse_port("65536").is_err());
        assert!(parse_port("-1").is_err());
        assert!(parse_port("spice").is_err());
    }

    #[test]
    fn test_step_count_bounds() {
        assert_eq!(parse_step_count("1"), Ok(1));
        assert_eq!(parse_step_count("500"), Ok(500));
        assert_eq!(
            parse_step_count("600"),
            Err(InputError::StepCount("600".to_string()))
        );
        assert!(parse_step_count("0").is_err());
        assert!(parse_step_count("ten").is_err());
    }

    #[test]
    fn test_run_request() {
        let form = ReplayForm {
            record_file: "/tmp/test.spice".to_string(),
            client: "spicec -h localhost -p 5900".to_string(),
            ..ReplayForm::default()
        };
        let request = form.run_request().unwrap();

        assert_eq!(request.port, 5900);
        assert_eq!(request.delay_us, 100);
        assert_eq!(request.client.unwrap().program, "spicec");
    }

    #[test]
    fn test_disabled_delay_is_not_parsed() {
        let form = ReplayForm {
            record_file: "a.spice".to_string(),
            delay_enabled: false,
            delay: "slow".to_string(),
            ..ReplayForm::default()
        };
        assert_eq!(form.run_request().unwrap().delay_us, 0);

        let form = ReplayForm {
            delay_enabled: true,
            ..form
        };
        assert!(matches!(form.run_request(), Err(InputError::Delay(_))));
    }

    #[test]
    fn test_missing_file_and_bad_port() {
        assert!(matches!(
            ReplayForm::default().run_request(),
            Err(InputError::RecordFile(_))
        ));

        let form = ReplayForm {
            record_file: "a.spice".to_string(),
            port: "http".to_string(),
            ..ReplayForm::default()
        };
        assert!(matches!(form.run_request(), Err(InputError::Port(_))));
    }
}
