//! Iteration snapshots and their text dump format.
//!
//! ```text
//! # Array shape: (2, 3, 2)
//! 1.000000000000000000e0 0.000000000000000000e0
//! ...
//! # Iteration 0
//! ...
//! # Iteration 1
//! ```
//!
//! The header declares `(ticks_saved, n_nodes, n_states)`, where `n_nodes`
//! is the row count of the first block. Each block holds one row per node
//! and is terminated by its tick marker. When a block's row count differs
//! from the header (nodes were added or removed), its marker carries the
//! count: `# Iteration 7 (12 nodes)`.
//!
//! Blocks are streamed to a side file while the run progresses and the
//! final file is assembled by `SnapshotWriter::finish` once the tick count
//! is known.

use crate::error::{NsimError, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const SHAPE_PREFIX: &str = "# Array shape: (";
const ITERATION_PREFIX: &str = "# Iteration ";

/// Deep copy of the state matrix after a tick committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Tick that produced this state
    pub iteration: u64,

    /// Node states (nodes x states)
    pub states: DMatrix<f64>,
}

impl Snapshot {
    pub fn new(iteration: u64, states: DMatrix<f64>) -> Self {
        Self { iteration, states }
    }

    /// Mean of one column over all nodes (0 for an empty population).
    pub fn column_mean(&self, col: usize) -> f64 {
        if self.states.nrows() == 0 || col >= self.states.ncols() {
            return 0.0;
        }
        self.states.column(col).mean()
    }
}

/// Streams snapshots to disk.
pub struct SnapshotWriter {
    path: PathBuf,
    partial_path: PathBuf,
    body: BufWriter<File>,
    written: usize,
    n_nodes: usize,
    n_states: usize,
}

impl std::fmt::Debug for SnapshotWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotWriter")
            .field("path", &self.path)
            .field("written", &self.written)
            .finish()
    }
}

impl SnapshotWriter {
    /// Starts a new dump at `path` (overwritten on `finish`).
    pub fn create(path: impl AsRef<Path>, n_nodes: usize, n_states: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut partial = path.clone().into_os_string();
        partial.push(".partial");
        let partial_path = PathBuf::from(partial);
        let body = BufWriter::new(File::create(&partial_path)?);
        Ok(Self {
            path,
            partial_path,
            body,
            written: 0,
            n_nodes,
            n_states,
        })
    }

    /// Appends one block followed by its tick marker.
    ///
    /// The first block fixes the header's node count; later blocks with a
    /// different row count record theirs in the marker. The state count
    /// cannot change.
    pub fn write(&mut self, iteration: u64, states: &DMatrix<f64>) -> Result<()> {
        if self.written == 0 {
            self.n_nodes = states.nrows();
            self.n_states = states.ncols();
        } else if states.ncols() != self.n_states {
            return Err(NsimError::format(format!(
                "Block for tick {} has {} states, expected {}",
                iteration,
                states.ncols(),
                self.n_states
            )));
        }
        for row in states.row_iter() {
            let line: Vec<String> = row.iter().map(|v| format!("{:.18e}", v)).collect();
            writeln!(self.body, "{}", line.join(" "))?;
        }
        if states.nrows() == self.n_nodes {
            writeln!(self.body, "{}{}", ITERATION_PREFIX, iteration)?;
        } else {
            writeln!(
                self.body,
                "{}{} ({} nodes)",
                ITERATION_PREFIX,
                iteration,
                states.nrows()
            )?;
        }
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }

    /// Writes the header and the streamed blocks to the final path.
    pub fn finish(mut self) -> Result<PathBuf> {
        self.body.flush()?;
        drop(self.body);

        let mut out = BufWriter::new(File::create(&self.path)?);
        writeln!(
            out,
            "{}{}, {}, {})",
            SHAPE_PREFIX, self.written, self.n_nodes, self.n_states
        )?;
        let mut body = File::open(&self.partial_path)?;
        std::io::copy(&mut body, &mut out)?;
        out.flush()?;
        fs::remove_file(&self.partial_path)?;
        Ok(self.path)
    }

    /// Drops the side file without writing the final dump.
    pub fn abort(self) -> Result<()> {
        drop(self.body);
        fs::remove_file(&self.partial_path)?;
        Ok(())
    }
}

/// Parsed snapshot dump.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotFile {
    /// Declared `(ticks_saved, n_nodes, n_states)`
    pub shape: (usize, usize, usize),
    pub snapshots: Vec<Snapshot>,
}

/// Reads a snapshot dump from disk.
pub fn read_snapshot_file(path: impl AsRef<Path>) -> Result<SnapshotFile> {
    parse_snapshots(BufReader::new(File::open(path)?))
}

/// Parses a snapshot dump.
pub fn parse_snapshots<R: BufRead>(reader: R) -> Result<SnapshotFile> {
    let mut lines = reader.lines();
    let header = lines
        .next()
        .ok_or_else(|| NsimError::format("Empty snapshot file"))??;
    let shape = parse_shape(&header)?;

    let mut snapshots = Vec::new();
    let mut rows: Vec<Vec<f64>> = Vec::new();
    for (lineno, line) in lines.enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(marker) = line.strip_prefix(ITERATION_PREFIX) {
            let (iteration, declared) = parse_marker(marker)
                .ok_or_else(|| {
                    NsimError::format(format!("Bad iteration marker on line {}", lineno + 2))
                })?;
            let expected = declared.unwrap_or(shape.1);
            let block = rows_to_matrix(&rows)?;
            if block.nrows() != expected || (expected > 0 && block.ncols() != shape.2) {
                return Err(NsimError::format(format!(
                    "Block for tick {} is {}x{}, expected {}x{}",
                    iteration,
                    block.nrows(),
                    block.ncols(),
                    expected,
                    shape.2
                )));
            }
            snapshots.push(Snapshot::new(iteration, block));
            rows.clear();
            continue;
        }
        let row = line
            .split_whitespace()
            .map(str::parse::<f64>)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| NsimError::format(format!("Bad number on line {}", lineno + 2)))?;
        rows.push(row);
    }
    if !rows.is_empty() {
        return Err(NsimError::format("Trailing block without iteration marker"));
    }
    Ok(SnapshotFile { shape, snapshots })
}

/// Parses `7` or `7 (12 nodes)`.
fn parse_marker(marker: &str) -> Option<(u64, Option<usize>)> {
    let marker = marker.trim();
    match marker.split_once(' ') {
        None => Some((marker.parse().ok()?, None)),
        Some((tick, rest)) => {
            let count = rest
                .trim()
                .strip_prefix('(')?
                .strip_suffix(" nodes)")?
                .trim()
                .parse()
                .ok()?;
            Some((tick.parse().ok()?, Some(count)))
        }
    }
}

fn parse_shape(header: &str) -> Result<(usize, usize, usize)> {
    let inner = header
        .trim()
        .strip_prefix(SHAPE_PREFIX)
        .and_then(|rest| rest.strip_suffix(')'))
        .ok_or_else(|| NsimError::format(format!("Bad shape header: {}", header)))?;
    let dims = inner
        .split(',')
        .map(|d| d.trim().parse::<usize>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| NsimError::format(format!("Bad shape header: {}", header)))?;
    match dims.as_slice() {
        [t, n, s] => Ok((*t, *n, *s)),
        _ => Err(NsimError::format(format!("Bad shape header: {}", header))),
    }
}

fn rows_to_matrix(rows: &[Vec<f64>]) -> Result<DMatrix<f64>> {
    let ncols = rows.first().map_or(0, Vec::len);
    if rows.iter().any(|r| r.len() != ncols) {
        return Err(NsimError::format("Ragged snapshot block"));
    }
    Ok(DMatrix::from_fn(rows.len(), ncols, |r, c| rows[r][c]))
}
