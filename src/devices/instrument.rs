use crate::error::{TensiometerError, TensiometerResult};

const ENABLE_LOGS: bool = true;

use crate::log_warn;

/// Text-command link to a bench instrument (GPIB, USB-TMC, ...).
pub trait Instrument: Send {
    fn write_command(&mut self, command: &str) -> TensiometerResult<()>;
    /// Writes `command` and returns the instrument's reply.
    fn send_command(&mut self, command: &str) -> TensiometerResult<String>;
}

pub fn parse_numeric_response(command: &str, response: &str) -> TensiometerResult<f64> {
    response
        .trim()
        .parse::<f64>()
        .map_err(|_| TensiometerError::MalformedResponse {
            command: command.to_string(),
            response: response.to_string(),
        })
}

/// Command set of the function generator driving the levitator.
pub struct FunctionGenerator {
    link: Box<dyn Instrument>,
}

impl FunctionGenerator {
    pub fn new(link: Box<dyn Instrument>) -> Self {
        Self { link }
    }

    pub fn set_frequency(&mut self, hz: f64) -> TensiometerResult<()> {
        self.link.write_command(&format!("frequency {hz}"))
    }

    pub fn frequency(&mut self) -> TensiometerResult<f64> {
        self.query_number("frequency?")
    }

    pub fn set_amplitude(&mut self, vpp: f64) -> TensiometerResult<()> {
        self.link.write_command(&format!("voltage {vpp} VPP"))
    }

    pub fn amplitude(&mut self) -> TensiometerResult<f64> {
        self.query_number("voltage?")
    }

    pub fn beep(&mut self) -> TensiometerResult<()> {
        self.link.write_command("system:beep")
    }

    /// Unparseable replies read as 0.0; a dead link is still an error.
    fn query_number(&mut self, command: &str) -> TensiometerResult<f64> {
        let response = self.link.send_command(command)?;
        match parse_numeric_response(command, &response) {
            Ok(value) => Ok(value),
            Err(err) => {
                log_warn!("{err}; reading as 0");
                Ok(0.0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct ScriptedLink {
        written: Arc<Mutex<Vec<String>>>,
        reply: Option<String>,
    }

    impl Instrument for ScriptedLink {
        fn write_command(&mut self, command: &str) -> TensiometerResult<()> {
            self.written.lock().unwrap().push(command.to_string());
            Ok(())
        }

        fn send_command(&mut self, command: &str) -> TensiometerResult<String> {
            self.write_command(command)?;
            self.reply
                .clone()
                .ok_or_else(|| TensiometerError::DeviceUnavailable("no reply".into()))
        }
    }

    fn generator(reply: Option<&str>) -> (FunctionGenerator, Arc<Mutex<Vec<String>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let link = ScriptedLink {
            written: Arc::clone(&written),
            reply: reply.map(str::to_string),
        };
        (FunctionGenerator::new(Box::new(link)), written)
    }

    #[test]
    fn commands_use_the_generator_syntax() {
        let (mut fg, written) = generator(Some("+4.0E4"));
        fg.set_amplitude(0.41).unwrap();
        fg.set_frequency(40000.5).unwrap();
        fg.beep().unwrap();

        assert_eq!(
            *written.lock().unwrap(),
            vec!["voltage 0.41 VPP", "frequency 40000.5", "system:beep"]
        );
    }

    #[test]
    fn numeric_replies_are_parsed() {
        let (mut fg, _) = generator(Some("+4.00000000E+04\n"));
        assert_eq!(fg.frequency().unwrap(), 40000.0);
    }

    #[test]
    fn malformed_reply_reads_as_zero() {
        let (mut fg, _) = generator(Some("ERR"));
        assert_eq!(fg.amplitude().unwrap(), 0.0);
        assert!(matches!(
            parse_numeric_response("voltage?", "ERR"),
            Err(TensiometerError::MalformedResponse { .. })
        ));
    }

    #[test]
    fn dead_link_is_reported() {
        let (mut fg, _) = generator(None);
        assert!(matches!(
            fg.frequency(),
            Err(TensiometerError::DeviceUnavailable(_))
        ));
    }
}
