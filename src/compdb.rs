// SPDX-FileCopyrightText: 2024 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! Compilation database (`compile_commands.json`) cleanup.
//!
//! CMake's `FetchContent` drops every fetched dependency into `_deps/`, and all of those
//! translation units end up in the compilation database next to the project's own sources.
//! Language servers and static analyzers then index and lint third party code. The routines here
//! remove those entries by matching substrings against each entry's `file` field.

use log::debug;
use serde_json::Value;
use tempfile::NamedTempFile;

use std::fmt;
use std::fs;
use std::fs::File;
use std::io;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::result;

/// Database file name CMake writes into the build directory.
pub const DEFAULT_DATABASE: &str = "compile_commands.json";

/// Substrings identifying entries that should be dropped by default.
pub const DEFAULT_PATTERNS: [&str; 1] = ["_deps"];

pub type Result<T> = result::Result<T, Error>;

/// Errors that can be emitted while adjusting a compilation database.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Json(serde_json::Error),
    /// The entry at this index is not an object with a string `file` field.
    InvalidEntry(usize),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "{err}"),
            Self::Json(err) => write!(f, "malformed compilation database: {err}"),
            Self::InvalidEntry(index) => {
                write!(f, "entry {index} has no string \"file\" field")
            }
        }
    }
}

/// Result of splitting a compilation database with a denylist.
#[derive(Debug, Default)]
pub struct Filtered {
    /// Entries to keep, in their original order and untouched.
    pub kept: Vec<Value>,
    /// `file` values of the entries that matched a pattern, in their original order.
    pub removed: Vec<String>,
}

/// What [`adjust_file`] did to the database.
#[derive(Debug)]
pub struct Summary {
    pub kept: usize,
    pub removed: Vec<String>,
}

fn entry_file(entry: &Value, index: usize) -> Result<&str> {
    entry
        .get("file")
        .and_then(Value::as_str)
        .ok_or(Error::InvalidEntry(index))
}

/// Drops every entry whose `file` contains any of `patterns`.
///
/// Every other field of the kept entries, including key order, is preserved. Applying the filter
/// to its own output removes nothing.
///
/// # Errors
///
/// [Error::InvalidEntry] if an entry is not an object or its `file` field is missing or is not a
/// string.
pub fn filter_entries<S: AsRef<str>>(entries: Vec<Value>, patterns: &[S]) -> Result<Filtered> {
    let mut filtered = Filtered::default();
    for (index, entry) in entries.into_iter().enumerate() {
        let file = entry_file(&entry, index)?;
        if patterns.iter().any(|pattern| file.contains(pattern.as_ref())) {
            debug!("Entry {} matches the denylist: {}", index, file);
            filtered.removed.push(file.to_string());
        } else {
            filtered.kept.push(entry);
        }
    }
    Ok(filtered)
}

// Writes next to the destination and renames over it, so an interrupted run leaves either the old
// or the new database, never a truncated one.
fn write_atomically(path: &Path, entries: &[Value]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let permissions = fs::metadata(path)?.permissions();
    let mut temporary = NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(temporary.as_file_mut());
        serde_json::to_writer_pretty(&mut writer, entries)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }
    temporary.as_file().set_permissions(permissions)?;
    temporary.as_file().sync_all()?;
    debug!("Replacing {} with {}", path.display(), temporary.path().display());
    temporary.persist(path).map_err(|err| err.error)?;

    Ok(())
}

/// Filters the compilation database at `path` in place.
///
/// If `path` is a symbolic link, the file it points to is rewritten and the link is kept.
///
/// The file is rewritten pretty printed with two space indentation even when nothing matched.
///
/// # Errors
///
/// [Error::Io] if the file can't be read or replaced, [Error::Json] if it isn't a JSON array, and
/// [Error::InvalidEntry] as in [filter_entries]. The database is left untouched on error.
pub fn adjust_file<S: AsRef<str>>(path: &Path, patterns: &[S]) -> Result<Summary> {
    // CMake's database is usually symlinked out of the build directory, rewrite the real file
    let resolved = fs::canonicalize(path)?;
    let path = resolved.as_path();
    let file = File::open(path)?;
    let entries: Vec<Value> = serde_json::from_reader(BufReader::new(file))?;
    debug!("Read {} entries from {}", entries.len(), path.display());

    let filtered = filter_entries(entries, patterns)?;
    write_atomically(path, &filtered.kept)?;

    Ok(Summary {
        kept: filtered.kept.len(),
        removed: filtered.removed,
    })
}
