// Copyright 2026 Oxide Computer Company
use std::io::{ErrorKind, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use slog::{o, Drain, Logger};
use tempfile::NamedTempFile;
use thiserror::Error;

pub mod array_def;
pub mod geometry;
pub mod units;

pub use array_def::{ArrayDefinition, RaidLevel};
pub use geometry::{Algorithm, StripeAddress, StripeLayout};
pub use units::*;

/**
 * Errors the RAID engine can return to a caller.  Device-level failures
 * are absorbed into slot/disk state before they ever reach this type;
 * only requests that become truly unsatisfiable surface as errors.
 */
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RaidError {
    #[error("Offset past end of array")]
    OffsetInvalid,

    #[error("Data length is not a whole number of sectors")]
    LengthUnaligned,

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Device {0} has failed")]
    DeviceFailed(usize),

    #[error("Too many failed devices to satisfy this request")]
    Unrecoverable,

    #[error("Conflicting operation: {0}")]
    ConflictingOperation(String),

    #[error("Stripe cache busy")]
    CacheBusy,

    #[error("Recovery checkpoint could not be persisted: {0}")]
    CheckpointFailed(String),

    #[error("Not enough healthy devices: {0}")]
    NotEnoughDevices(String),

    #[error("Invalid array definition: {0}")]
    InvalidDefinition(String),

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Receive disconnected")]
    RecvDisconnected,

    #[error("Generic error: {0}")]
    GenericError(String),
}

impl From<std::io::Error> for RaidError {
    fn from(e: std::io::Error) -> Self {
        RaidError::IoError(e.to_string())
    }
}

#[macro_export]
macro_rules! raid_bail {
    ($e:ident) => {
        return Err($crate::RaidError::$e)
    };
    ($e:ident, $str:expr) => {
        return Err($crate::RaidError::$e($str.to_string()))
    };
    ($e:ident, $fmt:expr, $($arg:tt)*) => {
        return Err($crate::RaidError::$e(format!($fmt, $($arg)*)))
    };
}

/**
 * Build the default logger: full-format terminal output behind an async
 * drain.  Components derive children with o!() context from this root.
 */
pub fn build_logger() -> Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .chan_size(0x8000)
        .build()
        .fuse();
    Logger::root(drain, o!())
}

fn record_error(
    op: &str,
    file: &Path,
    e: impl std::fmt::Display,
) -> RaidError {
    RaidError::CheckpointFailed(format!("{} {:?}: {}", op, file, e))
}

/// Read a JSON record, treating a missing file as "no record yet".
pub fn read_json_maybe<P, T>(file: P) -> Result<Option<T>, RaidError>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let file = file.as_ref();
    let buf = match std::fs::read(file) {
        Ok(buf) => buf,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(record_error("read", file, e)),
    };
    serde_json::from_slice(&buf)
        .map(Some)
        .map_err(|e| record_error("parse", file, e))
}

pub fn read_json<P, T>(file: P) -> Result<T, RaidError>
where
    P: AsRef<Path>,
    for<'de> T: Deserialize<'de>,
{
    let file = file.as_ref();
    read_json_maybe(file)?
        .ok_or_else(|| record_error("read", file, "file not found"))
}

/**
 * Durably write `data` as JSON: the bytes land in a temporary file that
 * is then renamed over the target, so a crash mid-write never leaves a
 * torn record behind.  Recovery checkpoints depend on this.
 */
pub fn write_json<P, T>(
    file: P,
    data: &T,
    clobber: bool,
) -> Result<(), RaidError>
where
    P: AsRef<Path>,
    T: Serialize,
{
    let file = file.as_ref();
    let dir = file
        .parent()
        .ok_or_else(|| record_error("write", file, "no parent directory"))?;
    let mut buf = serde_json::to_vec_pretty(data)
        .map_err(|e| record_error("serialize", file, e))?;
    buf.push(b'\n');

    let mut tmpf =
        NamedTempFile::new_in(dir).map_err(|e| record_error("write", file, e))?;
    tmpf.write_all(&buf)
        .map_err(|e| record_error("write", file, e))?;
    tmpf.flush().map_err(|e| record_error("write", file, e))?;

    let persisted = if clobber {
        tmpf.persist(file).map(|_| ())
    } else {
        tmpf.persist_noclobber(file).map(|_| ())
    };
    persisted.map_err(|e| record_error("persist", file, e))
}
