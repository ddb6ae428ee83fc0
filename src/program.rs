// SPDX-FileCopyrightText: 2024 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! Board programming through OpenOCD.
//!
//! OpenOCD ships one configuration script per supported development board. Programming a board is
//! a matter of pointing OpenOCD at that script and running its `program` command, which flashes,
//! verifies, resets the target and exits. The tool is launched and left running; whether the
//! firmware actually came up is observed separately over the board's UART.

use log::{debug, info};

use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::result;

pub const DEFAULT_TOOL: &str = "openocd";
/// Where distribution packages install OpenOCD's board scripts.
pub const DEFAULT_CONFIG_DIR: &str = "/usr/share/openocd/scripts/board";

pub type Result<T> = result::Result<T, Error>;

/// Errors that can be emitted before the flashing tool takes over.
#[derive(Debug)]
pub enum Error {
    /// No configuration script exists for the requested board.
    MissingConfig(PathBuf),
    MissingArtifact(PathBuf),
    /// The tool itself could not be started.
    Launch(String, io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingConfig(path) => {
                write!(f, "board configuration {} does not exist", path.display())
            }
            Self::MissingArtifact(path) => {
                write!(f, "firmware image {} does not exist", path.display())
            }
            Self::Launch(tool, err) => write!(f, "unable to launch {tool}: {err}"),
        }
    }
}

/// An OpenOCD invocation that programs, verifies and resets one board.
#[derive(Debug, Clone)]
pub struct FlashCommand {
    tool: String,
    config_dir: PathBuf,
    board: String,
    artifact: PathBuf,
}

impl FlashCommand {
    /// Programs `artifact` onto the board whose configuration script is named `<board>.cfg`.
    pub fn new(board: impl Into<String>, artifact: impl Into<PathBuf>) -> Self {
        Self {
            tool: DEFAULT_TOOL.to_string(),
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
            board: board.into(),
            artifact: artifact.into(),
        }
    }

    /// Overrides the program to run instead of `openocd`.
    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.tool = tool.into();
        self
    }

    /// Overrides the directory holding board configuration scripts.
    pub fn config_dir(mut self, config_dir: impl Into<PathBuf>) -> Self {
        self.config_dir = config_dir.into();
        self
    }

    pub fn board(&self) -> &str {
        &self.board
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    /// Path of the board configuration script handed to `-f`.
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(format!("{}.cfg", self.board))
    }

    /// The Tcl command handed to `-c`.
    pub fn script(&self) -> String {
        let artifact = self.artifact.to_string_lossy();
        // Tcl splits words on whitespace unless braced
        if artifact.contains(char::is_whitespace) {
            format!("program {{{artifact}}} verify reset exit")
        } else {
            format!("program {artifact} verify reset exit")
        }
    }

    /// Arguments passed to the tool, in order.
    pub fn args(&self) -> Vec<OsString> {
        vec![
            OsString::from("-f"),
            self.config_path().into_os_string(),
            OsString::from("-c"),
            OsString::from(self.script()),
        ]
    }

    /// Makes sure the board configuration and the firmware image exist.
    ///
    /// The tool would report both problems too, but only after it has been detached, where nobody
    /// reads its output.
    ///
    /// # Errors
    ///
    /// [Error::MissingConfig] or [Error::MissingArtifact] naming the missing path.
    pub fn check(&self) -> Result<()> {
        let config = self.config_path();
        if !config.is_file() {
            return Err(Error::MissingConfig(config));
        }
        if !self.artifact.is_file() {
            return Err(Error::MissingArtifact(self.artifact.clone()));
        }
        Ok(())
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.tool);
        command.args(self.args());
        command
    }

    /// Starts the tool and returns without waiting for it.
    ///
    /// With `detach`, the tool gets no standard streams and, on Unix, its own process group, so it
    /// keeps running after the invoking shell exits or is interrupted. Otherwise it shares this
    /// process' standard streams.
    ///
    /// Dropping the returned handle neither waits for nor kills the tool.
    ///
    /// # Errors
    ///
    /// [Error::Launch] if the tool can't be started.
    pub fn launch(&self, detach: bool) -> Result<Child> {
        let mut command = self.command();
        if detach {
            command
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null());
            #[cfg(unix)]
            {
                use std::os::unix::process::CommandExt;
                command.process_group(0);
            }
        }

        info!("Launching {}", self);
        let child = command
            .spawn()
            .map_err(|err| Error::Launch(self.tool.clone(), err))?;
        debug!("{} running as pid {}", self.tool, child.id());
        Ok(child)
    }
}

impl fmt::Display for FlashCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -f {} -c \"{}\"",
            self.tool,
            self.config_path().display(),
            self.script()
        )
    }
}
