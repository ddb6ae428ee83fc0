// SPDX-FileCopyrightText: 2024 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! # board-ci
//!
//! This CLI bundles the small steps a hardware-in-the-loop CI job needs around a firmware build:
//! cleaning up the compilation database, flashing the board, and collecting the test verdict from
//! its UART.
//!
//! Commands supported: adjust-compdb, program, logs

use board_ci::compdb;
use board_ci::logs;
use board_ci::logs::{Outcome, PortSettings, Tokens};
use board_ci::program;
use board_ci::program::FlashCommand;

use clap::{Parser, Subcommand};
use log::{error, info};

use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

#[derive(Subcommand)]
enum Commands {
    /// Remove dependency sources from a compilation database, in place.
    AdjustCompdb {
        #[arg(short, long, default_value = compdb::DEFAULT_DATABASE)]
        /// The compilation database to rewrite.
        database: PathBuf,
        #[arg(short, long = "pattern", default_values = compdb::DEFAULT_PATTERNS)]
        /// Drop entries whose file contains this text. May be repeated.
        patterns: Vec<String>,
    },
    /// Flash, verify and reset a board with OpenOCD, without waiting for it to finish.
    Program {
        /// Board name, selects <CONFIG_DIR>/<BOARD>.cfg.
        board: String,
        /// The firmware image to program.
        artifact: PathBuf,
        #[arg(short, long, env = "OPENOCD_BOARD_DIR", default_value = program::DEFAULT_CONFIG_DIR)]
        /// Directory holding OpenOCD board configuration scripts.
        config_dir: PathBuf,
        #[arg(long, default_value = program::DEFAULT_TOOL)]
        /// The OpenOCD executable.
        tool: String,
        #[arg(short, long)]
        /// Detach OpenOCD from this terminal so it outlives the calling shell.
        detach: bool,
        #[arg(long)]
        /// Skip checking that the board configuration and image exist.
        no_check: bool,
    },
    /// Echo the board's UART until the test firmware reports its result.
    Logs {
        #[arg(short, long, env = "BOARD_CI_SERIAL_PORT", default_value = logs::DEFAULT_PORT)]
        /// Path to the serial device connected to the board.
        port: String,
        #[arg(short, long, default_value_t = logs::DEFAULT_BAUD)]
        /// The baud rate the test firmware prints at.
        baud: u32,
        #[arg(short, long, default_value_t = logs::DEFAULT_TIMEOUT_MS)]
        /// Give up after this many milliseconds without receiving anything.
        timeout: u64,
        #[arg(long, default_value = logs::PASS_TOKEN)]
        /// The line reporting success.
        pass_token: String,
        #[arg(long)]
        /// A line reporting failure. Without it, failures surface as a timeout.
        fail_token: Option<String>,
    },
}

#[derive(Parser)]
#[command(author, version, about, long_about=None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    /// The task to perform.
    command: Commands,
    #[command(flatten)]
    /// The level of output verbosity.
    verbose: clap_verbosity_flag::Verbosity,
}

fn adjust_compdb(database: &Path, patterns: &[String]) -> i32 {
    info!("Removing entries matching {:?}", patterns);
    match compdb::adjust_file(database, patterns) {
        Ok(summary) => {
            for file in &summary.removed {
                println!("Removing {} from {}", file, database.display());
            }
            info!("{} entries left in {}", summary.kept, database.display());
            0
        }
        Err(error) => {
            error!("{error}");
            error!("Failed to adjust {}", database.display());
            1
        }
    }
}

fn program_board(command: &FlashCommand, detach: bool, check: bool) -> i32 {
    if check {
        if let Err(error) = command.check() {
            error!("{error}");
            return 1;
        }
    }

    match command.launch(detach) {
        // Not waited on, the flashing result is checked through the board's logs
        Ok(child) => {
            println!(
                "Programming {} on {} (pid {})",
                command.artifact().display(),
                command.board(),
                child.id()
            );
            0
        }
        Err(error) => {
            error!("{error}");
            1
        }
    }
}

fn read_logs(settings: &PortSettings, tokens: &Tokens) -> i32 {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match logs::run(settings, tokens, &mut out) {
        Ok(outcome) => {
            match &outcome {
                Outcome::Passed => info!("Tests passed"),
                Outcome::Failed(line) => error!("Tests failed: {line}"),
                Outcome::Timeout => error!(
                    "No output from {} for {} ms",
                    settings.port,
                    settings.timeout.as_millis()
                ),
            }
            outcome.exit_code()
        }
        Err(error) => {
            error!("{error}");
            error!("Unable to read logs from {}.", settings.port);
            1
        }
    }
}

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.verbose.log_level_filter())
        .init();

    info!(
        "board-ci version: {}.{}",
        env!("CARGO_PKG_VERSION_MAJOR"),
        env!("CARGO_PKG_VERSION_MINOR")
    );

    let code = match cli.command {
        Commands::AdjustCompdb { database, patterns } => adjust_compdb(&database, &patterns),
        Commands::Program {
            board,
            artifact,
            config_dir,
            tool,
            detach,
            no_check,
        } => {
            let command = FlashCommand::new(board, artifact)
                .tool(tool)
                .config_dir(config_dir);
            program_board(&command, detach, !no_check)
        }
        Commands::Logs {
            port,
            baud,
            timeout,
            pass_token,
            fail_token,
        } => {
            let settings = PortSettings {
                port,
                baud,
                timeout: Duration::from_millis(timeout),
            };
            let tokens = Tokens {
                pass: pass_token,
                fail: fail_token,
            };
            read_logs(&settings, &tokens)
        }
    };

    process::exit(code);
}
