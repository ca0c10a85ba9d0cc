//! Context signal computation for labeled feature x sample matrices.
//!
//! Each row is fit with a skew-t distribution, compared against a reshaped
//! reference PDF on an evaluation grid, and collapsed into per-sample
//! context indices. Row-wise and column-wise context matrices can then be
//! combined into a single signal matrix.

use std::io::{BufWriter, Write};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod context;
pub mod error;
pub mod fit;
pub mod matrix;
pub mod progress;
pub mod signal;
pub mod skew_t;

/// Logger manager supporting timestamped run logs
pub struct Logger {
    writer: BufWriter<std::fs::File>,
}

impl Logger {
    pub fn new(file: std::fs::File) -> Self {
        Self {
            writer: BufWriter::new(file),
        }
    }

    /// Record detailed log information
    pub fn log(&mut self, message: &str) -> std::io::Result<()> {
        let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S");
        writeln!(self.writer, "[{}] {}", timestamp, message)?;
        self.writer.flush()?;
        Ok(())
    }
}
