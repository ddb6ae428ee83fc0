// SPDX-FileCopyrightText: 2024 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! UART test log polling.
//!
//! Test firmware prints its progress over a UART and finishes with a single status line. The
//! poller echoes everything it receives and decides the outcome from that status line, or from
//! the board going quiet for longer than the read timeout.

use log::{debug, info};
use serialport::{ClearBuffer, SerialPort};

use std::fmt;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Write;
use std::result;
use std::time::Duration;

/// Serial device the CI runner's UART is wired to.
pub const DEFAULT_PORT: &str = "/dev/serial0";
pub const DEFAULT_BAUD: u32 = 115_200;
/// Maximum silence tolerated between two lines, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(DEFAULT_TIMEOUT_MS);
/// Line printed by test firmware when every test passed.
pub const PASS_TOKEN: &str = "PASSED";

pub type Result<T> = result::Result<T, Error>;

/// Errors that can be emitted while reading logs.
#[derive(Debug)]
pub enum Error {
    Serial(serialport::Error),
    Io(io::Error),
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::Serial(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "{err}"),
        }
    }
}

/// How the board's serial connection is configured.
#[derive(Debug, Clone)]
pub struct PortSettings {
    pub port: String,
    pub baud: u32,
    /// Per-read timeout. A read that yields nothing for this long ends the poll.
    pub timeout: Duration,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT.to_string(),
            baud: DEFAULT_BAUD,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Status lines that end a poll.
#[derive(Debug, Clone)]
pub struct Tokens {
    pub pass: String,
    /// An optional line that ends the poll early with a failure.
    pub fail: Option<String>,
}

impl Default for Tokens {
    fn default() -> Self {
        Self {
            pass: PASS_TOKEN.to_string(),
            fail: None,
        }
    }
}

/// How a poll ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The pass token was received.
    Passed,
    /// The fail token was received.
    Failed(String),
    /// Nothing was received within the read timeout.
    Timeout,
}

impl Outcome {
    /// Process exit status for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Passed => 0,
            Self::Failed(_) | Self::Timeout => 1,
        }
    }
}

/// Opens the serial port and discards anything already buffered in either direction.
///
/// # Errors
///
/// [Error::Serial] if the port can't be opened or its buffers can't be cleared.
pub fn open(settings: &PortSettings) -> Result<Box<dyn SerialPort>> {
    let mut serial = serialport::new(&settings.port, settings.baud)
        .timeout(settings.timeout)
        .open()?;
    serial.clear(ClearBuffer::All)?;
    debug!("Cleared buffers on {}", settings.port);
    Ok(serial)
}

/// Reads one line, without its trailing whitespace.
///
/// Returns `None` if the read timed out (or the stream ended) before any byte arrived. Bytes
/// received before a timeout are returned as a line even without a newline. Invalid UTF-8 is
/// replaced rather than rejected.
///
/// # Errors
///
/// [Error::Io] for any read error other than a timeout.
pub fn read_log_line<R: BufRead + ?Sized>(reader: &mut R) -> Result<Option<String>> {
    let mut buffer = Vec::new();
    match reader.read_until(b'\n', &mut buffer) {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::TimedOut => {
            debug!("Read timed out with {} bytes pending", buffer.len());
        }
        Err(err) => return Err(err.into()),
    }

    if buffer.is_empty() {
        return Ok(None);
    }
    Ok(Some(String::from_utf8_lossy(&buffer).trim_end().to_string()))
}

/// Echoes lines from `reader` to `out` until a status token is seen or the stream goes quiet.
///
/// Lines that are neither token are echoed and reading continues. Blank lines are skipped. On
/// silence a `Timeout` diagnostic is written to `out`.
///
/// # Errors
///
/// [Error::Io] if reading fails for a reason other than a timeout, or if `out` can't be written.
pub fn poll<R, W>(reader: &mut R, out: &mut W, tokens: &Tokens) -> Result<Outcome>
where
    R: BufRead + ?Sized,
    W: Write + ?Sized,
{
    loop {
        let Some(line) = read_log_line(reader)? else {
            writeln!(out, "Timeout")?;
            return Ok(Outcome::Timeout);
        };
        if line.is_empty() {
            continue;
        }

        writeln!(out, "{line}")?;
        if line == tokens.pass {
            return Ok(Outcome::Passed);
        }
        if tokens.fail.as_deref() == Some(line.as_str()) {
            return Ok(Outcome::Failed(line));
        }
    }
}

/// Opens the configured port and polls it, echoing to `out`.
///
/// # Errors
///
/// See [open] and [poll].
pub fn run<W: Write + ?Sized>(
    settings: &PortSettings,
    tokens: &Tokens,
    out: &mut W,
) -> Result<Outcome> {
    let serial = open(settings)?;
    info!(
        "Running UART logs reader on {} with speed {}",
        settings.port, settings.baud
    );

    let mut reader = BufReader::new(serial);
    let outcome = poll(&mut reader, out, tokens)?;
    debug!("Poll finished: {:?}", outcome);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::{Cursor, Read};

    /// Hands out one scripted chunk per read, then times out forever.
    struct Scripted {
        reads: VecDeque<io::Result<Vec<u8>>>,
    }

    impl Scripted {
        fn new(chunks: &[&str]) -> BufReader<Self> {
            BufReader::new(Self {
                reads: chunks
                    .iter()
                    .map(|chunk| Ok(chunk.as_bytes().to_vec()))
                    .collect(),
            })
        }
    }

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(chunk)) => {
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
                Some(Err(err)) => Err(err),
                None => Err(io::Error::new(io::ErrorKind::TimedOut, "silence")),
            }
        }
    }

    fn poll_str(input: &str, tokens: &Tokens) -> (Outcome, String) {
        let mut out = Vec::new();
        let outcome = poll(&mut Cursor::new(input), &mut out, tokens).unwrap();
        (outcome, String::from_utf8(out).unwrap())
    }

    #[test]
    fn test_passed_after_progress_lines() {
        let (outcome, out) = poll_str(
            "boot\r\ntest_uart: ok\r\nPASSED\r\nignored\r\n",
            &Tokens::default(),
        );
        assert_eq!(outcome, Outcome::Passed);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(out, "boot\ntest_uart: ok\nPASSED\n");
    }

    #[test]
    fn test_silence_is_timeout() {
        let mut out = Vec::new();
        let outcome = poll(&mut Scripted::new(&[]), &mut out, &Tokens::default()).unwrap();
        assert_eq!(outcome, Outcome::Timeout);
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(out, b"Timeout\n");
    }

    #[test]
    fn test_other_lines_keep_reading_until_timeout() {
        let mut out = Vec::new();
        let mut reader = Scripted::new(&["FAILED\n", "\n", "still here\n"]);
        let outcome = poll(&mut reader, &mut out, &Tokens::default()).unwrap();
        assert_eq!(outcome, Outcome::Timeout);
        assert_eq!(out, b"FAILED\nstill here\nTimeout\n");
    }

    #[test]
    fn test_fail_token_stops_early() {
        let tokens = Tokens {
            fail: Some("FAILED".to_string()),
            ..Tokens::default()
        };
        let (outcome, out) = poll_str("test_spi: FAILED\nFAILED\nPASSED\n", &tokens);
        assert_eq!(outcome, Outcome::Failed("FAILED".to_string()));
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(out, "test_spi: FAILED\nFAILED\n");
    }

    #[test]
    fn test_pass_token_must_match_exactly() {
        let (outcome, _) = poll_str("NOT PASSED\nPASSED!\n", &Tokens::default());
        assert_eq!(outcome, Outcome::Timeout);

        let (outcome, _) = poll_str("PASSED \t\r\n", &Tokens::default());
        assert_eq!(outcome, Outcome::Passed);
    }

    #[test]
    fn test_line_split_across_reads() {
        let mut reader = Scripted::new(&["PAS", "SED\r", "\n"]);
        assert_eq!(
            read_log_line(&mut reader).unwrap(),
            Some("PASSED".to_string())
        );
        assert_eq!(read_log_line(&mut reader).unwrap(), None);
    }

    #[test]
    fn test_partial_line_before_timeout() {
        let mut reader = Scripted::new(&["PASSED"]);
        let mut out = Vec::new();
        let outcome = poll(&mut reader, &mut out, &Tokens::default()).unwrap();
        assert_eq!(outcome, Outcome::Passed);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut reader = Cursor::new(b"temp \xff ok\n".to_vec());
        assert_eq!(
            read_log_line(&mut reader).unwrap(),
            Some("temp \u{FFFD} ok".to_string())
        );
    }

    #[test]
    fn test_read_error_is_propagated() {
        let mut reader = BufReader::new(Scripted {
            reads: VecDeque::from([
                Ok(b"boot\n".to_vec()),
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")),
            ]),
        });
        let mut out = Vec::new();
        let result = poll(&mut reader, &mut out, &Tokens::default());
        assert!(matches!(result, Err(Error::Io(err)) if err.kind() == io::ErrorKind::BrokenPipe));
        assert_eq!(out, b"boot\n");
    }

    #[test]
    fn test_open_failure_is_fatal() {
        let settings = PortSettings {
            port: "/dev/does-not-exist".into(),
            ..PortSettings::default()
        };
        assert_eq!(settings.baud, DEFAULT_BAUD);
        assert_eq!(settings.timeout, DEFAULT_TIMEOUT);

        let mut out = Vec::new();
        let result = run(&settings, &Tokens::default(), &mut out);
        assert!(matches!(result, Err(Error::Serial(_))));
        assert!(out.is_empty());
    }
}
