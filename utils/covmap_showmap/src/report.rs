//! Turning an [`ExecutionResult`] into the map file and the exit status.

use std::io::{self, Write};

use covmap::executors::ExecutionResult;

/// How the map file is written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// One `offset:value` line per covered byte
    Tuples {
        /// Write `1` for every covered byte instead of its hit count
        edges_only: bool,
    },
    /// The whole [`ExecutionResult`] as JSON
    Json,
}

/// Write the report for `res` into `out`, returns the number of covered tuples.
pub fn write_report<W>(out: &mut W, res: &ExecutionResult, format: Format) -> io::Result<usize>
where
    W: Write,
{
    match format {
        Format::Tuples { edges_only } => {
            for (offset, count) in res.coverage.iter_nonzero() {
                let count = if edges_only { 1 } else { count };
                writeln!(out, "{offset:06}:{count}")?;
            }
        }
        Format::Json => {
            serde_json::to_writer_pretty(&mut *out, res)?;
            writeln!(out)?;
        }
    }
    out.flush()?;
    Ok(res.coverage.count_nonzero())
}

/// 0 for a clean run, 1 for a timeout, 2 for a crash
#[must_use]
pub fn exit_status(res: &ExecutionResult) -> i32 {
    i32::from(res.crashed.is_some()) * 2 + i32::from(res.timed_out)
}
