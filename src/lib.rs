// SPDX-FileCopyrightText: 2024 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! This crate contains the helpers used by continuous integration jobs that build, flash and test
//! firmware on real development boards. Each helper is independent of the others:
//!
//!  - [compdb] removes third party entries from a `compile_commands.json` so that tooling only
//!    looks at the project's own sources.
//!  - [program] flashes a board through OpenOCD and lets it run.
//!  - [logs] watches the board's UART until the test firmware reports `PASSED`, or goes quiet.
//!
//! A binary companion crate exposes each helper as a `board-ci` subcommand.

pub mod compdb;
pub mod logs;
pub mod program;
